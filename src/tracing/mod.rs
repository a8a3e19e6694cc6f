//! Internal code for logging.
//!
//! Logs go to stdout through a `tracing-subscriber` fmt layer. Only
//! events from this crate are shown, at `ERROR` unless a level is
//! configured through `log_level` in the config, which `MINIPS_LOG`
//! overrides (see [`crate::config`]).
//!
//! A level can also be a full filter directive, e.g.
//! `minips=debug,tokio=warn`; see tracing-subscriber's
//! [`EnvFilter`](tracing_subscriber::EnvFilter).
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{
    filter::Targets, layer::SubscriberExt, registry::LookupSpan, EnvFilter, Layer, Registry,
};

#[derive(Debug, thiserror::Error)]
#[error("wrong log level: {0}")]
pub struct LogLevelError(String);

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, LogLevelError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(LogLevelError(level.to_string())),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// The stdout layer, without a filter.
pub(crate) fn log_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
}

/// Install the global subscriber.
///
/// `level` is either a plain level name, which applies to this crate
/// only, or a filter directive.
pub fn setup(level: Option<&str>) -> Result<(), LogLevelError> {
    match get_log_level(level) {
        Ok(level) => {
            let logs = log_layer().with_filter(Targets::new().with_target("minips", level));
            set_global_subscriber(Registry::default().with(logs));
        }
        Err(err) => {
            // Not a level name; maybe a directive.
            let directive = level.unwrap_or_default();
            let filter = EnvFilter::try_new(directive).map_err(|_| err)?;
            let logs = log_layer().with_filter(filter);
            set_global_subscriber(Registry::default().with(logs));
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which
    // happens in tests, and also if a server is started more than
    // once in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn level_names_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert_eq!(get_log_level(Some("warn")).unwrap(), LevelFilter::WARN);
    assert!(get_log_level(Some("loud")).is_err());
}

#[test]
fn setup_accepts_directives() {
    setup(Some("minips=debug,warn")).unwrap();
    // A second install only warns.
    setup(Some("info")).unwrap();
    assert!(setup(Some("minips=loud")).is_err());
}
