//! Data model of a progress checkpoint.
//!
//! A checkpoint is the shard's minimum clock plus every tracked
//! worker's clock, all coarsened to the nearest multiple of
//! [`CHECKPOINT_GRANULARITY`]. The coarsening lets replicas whose
//! clocks drifted by a few iterations restore to the same values, and
//! gives a newly added node a sensible starting clock to inherit.
//!
//! On disk it is plain text, space-separated `key:value` tokens on one
//! or more lines:
//!
//! ```text
//! min_clock:100 1000:100 1001:200
//! ```

use std::fmt::Write;

use crate::node::ThreadId;
use crate::progress::Clock;

/// Clocks are rounded to a multiple of this before they are persisted.
pub const CHECKPOINT_GRANULARITY: u64 = 100;

const MIN_CLOCK_KEY: &str = "min_clock";

/// Round to the nearest multiple of [`CHECKPOINT_GRANULARITY`], halves
/// away from zero.
pub fn round_hundred(clock: Clock) -> Clock {
    let g = CHECKPOINT_GRANULARITY;
    Clock((clock.0 + g / 2) / g * g)
}

/// Persisted progress of one shard.
///
/// Entries keep the order they were written or parsed in; restore
/// applies them in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressCheckpoint {
    pub min_clock: Option<Clock>,
    pub clocks: Vec<(ThreadId, Clock)>,
}

impl ProgressCheckpoint {
    /// Build a checkpoint from exact clocks, coarsening every value.
    pub fn coarsened(
        min_clock: Option<Clock>,
        clocks: impl IntoIterator<Item = (ThreadId, Clock)>,
    ) -> Self {
        Self {
            min_clock: min_clock.map(round_hundred),
            clocks: clocks
                .into_iter()
                .map(|(tid, clock)| (tid, round_hundred(clock)))
                .collect(),
        }
    }

    /// Text form, see the module docs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a `String` can't fail.
        if let Some(min_clock) = self.min_clock {
            let _ = write!(out, "{MIN_CLOCK_KEY}:{} ", min_clock.0);
        }
        for (tid, clock) in &self.clocks {
            let _ = write!(out, "{}:{} ", tid.0, clock.0);
        }
        out
    }

    /// Parse the text form.
    ///
    /// Tokens that do not have at least two `:` separated fields, or
    /// whose fields are not numbers, are skipped.
    pub fn parse(text: &str) -> Self {
        let mut checkpoint = Self::default();
        for token in text.split_whitespace() {
            let mut fields = token.split(':');
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                tracing::trace!("Skipping checkpoint token {token:?}");
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                tracing::trace!("Skipping checkpoint token {token:?}");
                continue;
            };
            if key == MIN_CLOCK_KEY {
                checkpoint.min_clock = Some(Clock(value));
            } else if let Ok(tid) = key.parse::<u32>() {
                checkpoint.clocks.push((ThreadId(tid), Clock(value)));
            } else {
                tracing::trace!("Skipping checkpoint token {token:?}");
            }
        }
        checkpoint
    }
}

#[test]
fn round_hundred_rounds_to_nearest() {
    assert_eq!(round_hundred(Clock(0)), Clock(0));
    assert_eq!(round_hundred(Clock(49)), Clock(0));
    assert_eq!(round_hundred(Clock(50)), Clock(100));
    assert_eq!(round_hundred(Clock(149)), Clock(100));
    assert_eq!(round_hundred(Clock(150)), Clock(200));
    assert_eq!(round_hundred(Clock(300)), Clock(300));
}

#[test]
fn render_format() {
    let checkpoint = ProgressCheckpoint::coarsened(
        Some(Clock(120)),
        [(ThreadId(1000), Clock(120)), (ThreadId(1001), Clock(260))],
    );
    assert_eq!(checkpoint.render(), "min_clock:100 1000:100 1001:300 ");
}

#[test]
fn empty_checkpoint_renders_nothing() {
    assert_eq!(ProgressCheckpoint::default().render(), "");
}

#[test]
fn parse_skips_malformed_tokens() {
    let text = "min_clock:100 garbage 1000:100\n\n1001:abc :5 1002:200:extra x:7 1003:";
    let checkpoint = ProgressCheckpoint::parse(text);
    assert_eq!(checkpoint.min_clock, Some(Clock(100)));
    assert_eq!(
        checkpoint.clocks,
        vec![(ThreadId(1000), Clock(100)), (ThreadId(1002), Clock(200))]
    );
}

#[test]
fn parse_reads_multiple_lines() {
    let checkpoint = ProgressCheckpoint::parse("1:100 \n2:200 \n");
    assert_eq!(checkpoint.min_clock, None);
    assert_eq!(
        checkpoint.clocks,
        vec![(ThreadId(1), Clock(100)), (ThreadId(2), Clock(200))]
    );
}
