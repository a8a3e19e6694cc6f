use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    sdk::metrics::{Aggregation, Instrument, MeterProvider, Stream},
    KeyValue,
};
use prometheus::{default_registry, Encoder, TextEncoder};

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> opentelemetry::metrics::Result<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("minips")
        .build()?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(opentelemetry_sdk::metrics::new_view(
            Instrument::new().name("*duration*"), // Must match histogram name
            Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                boundaries: vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0,
                ],
                record_min_max: true,
            }),
        )?)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Everything in the default registry, in the Prometheus text format.
pub fn render() -> String {
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&default_registry().gather(), &mut buf) {
        tracing::warn!("Unable to encode metrics: {err}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Instruments for one shard.
///
/// Until [`initialize_metrics`] runs, the global meter is a no-op and
/// so are these.
pub(crate) struct ShardMetrics {
    pub(crate) clock_count: Counter<u64>,
    pub(crate) min_clock_change_count: Counter<u64>,
    pub(crate) add_count: Counter<u64>,
    pub(crate) get_count: Counter<u64>,
    pub(crate) rejected_count: Counter<u64>,
    pub(crate) checkpoint_histogram: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl ShardMetrics {
    pub(crate) fn new(model_id: u32) -> Self {
        let meter = global::meter("minips");
        Self {
            clock_count: meter
                .u64_counter("clock_count")
                .with_description("number of clock messages this shard has applied")
                .init(),
            min_clock_change_count: meter
                .u64_counter("min_clock_change_count")
                .with_description("number of times this shard's min clock moved")
                .init(),
            add_count: meter
                .u64_counter("add_count")
                .with_description("number of adds this shard has admitted")
                .init(),
            get_count: meter
                .u64_counter("get_count")
                .with_description("number of gets this shard has admitted")
                .init(),
            rejected_count: meter
                .u64_counter("rejected_count")
                .with_description("number of messages from non-member workers this shard has rejected")
                .init(),
            checkpoint_histogram: meter
                .f64_histogram("checkpoint_duration_seconds")
                .with_description("progress dump or restore duration in seconds")
                .init(),
            labels: vec![KeyValue::new("model_id", model_id.to_string())],
        }
    }
}
