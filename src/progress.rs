//! Per-shard tracking of worker progress.
//!
//! Every worker thread a shard serves reports a [`Flag::Clock`] after
//! each local iteration. The [`ProgressTracker`] counts those reports
//! and keeps the slowest worker's count, the **min clock**.
//!
//! The table of tracked workers is also the shard's membership: a
//! worker may only touch the shard's storage while it has an entry.
//! Entries are created in bulk by [`ProgressTracker::init`], removed
//! when nodes fail or leave, and reloaded from a checkpoint on
//! restart.
//!
//! [`Flag::Clock`]: crate::message::Flag::Clock

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::CheckpointError;
use crate::errors::ProgressError;
use crate::node::Node;
use crate::node::NodeId;
use crate::node::ThreadId;
use crate::recovery::model::ProgressCheckpoint;
use crate::recovery::store::ProgressReader;
use crate::recovery::store::ProgressWriter;

/// Number of iterations a worker has reported.
#[derive(
    Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Clock(pub u64);

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Point-in-time copy of a tracker, for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub min_clock: Option<Clock>,
    pub clocks: BTreeMap<ThreadId, Clock>,
}

/// Logical clocks of the workers of one shard.
///
/// Not synchronized: a tracker is owned by exactly one shard task.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    progresses: BTreeMap<ThreadId, Clock>,
    /// Cached minimum of `progresses`; `None` iff it is empty.
    min_clock: Option<Clock>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tracked worker with `tids`, all at clock 0.
    pub fn init(&mut self, tids: impl IntoIterator<Item = ThreadId>) {
        self.progresses = tids.into_iter().map(|tid| (tid, Clock(0))).collect();
        self.recompute_min();
        tracing::debug!("Tracking {} workers", self.progresses.len());
    }

    /// Count one more iteration for `tid`.
    ///
    /// Returns the new min clock if this advance moved it, `None` if
    /// it stayed put. Callers can hang once-per-change work off the
    /// `Some`.
    pub fn advance(&mut self, tid: ThreadId) -> Result<Option<Clock>, ProgressError> {
        let clock = self
            .progresses
            .get_mut(&tid)
            .ok_or(ProgressError::UnknownWorker(tid))?;
        clock.0 += 1;

        let before = self.min_clock;
        self.recompute_min();
        if self.min_clock != before {
            tracing::trace!("Min clock advanced to {:?}", self.min_clock);
            Ok(self.min_clock)
        } else {
            Ok(None)
        }
    }

    /// Current clock of `tid`.
    ///
    /// An untracked worker is an error rather than clock 0, which
    /// would hide membership bugs.
    pub fn progress(&self, tid: ThreadId) -> Result<Clock, ProgressError> {
        self.progresses
            .get(&tid)
            .copied()
            .ok_or(ProgressError::UnknownWorker(tid))
    }

    /// Clock of the slowest tracked worker; `None` if nobody is
    /// tracked.
    pub fn min_clock(&self) -> Option<Clock> {
        self.min_clock
    }

    pub fn num_threads(&self) -> usize {
        self.progresses.len()
    }

    /// Is `tid` the one and only worker at the min clock?
    ///
    /// Lets a caller pick a single laggard to act on.
    pub fn is_unique_min(&self, tid: ThreadId) -> bool {
        let (Some(min_clock), Some(clock)) = (self.min_clock, self.progresses.get(&tid)) else {
            return false;
        };
        *clock == min_clock
            && self
                .progresses
                .iter()
                .all(|(other, c)| *other == tid || *c != min_clock)
    }

    /// Whether `tid` may interact with this shard.
    pub fn check_thread_valid(&self, tid: ThreadId) -> bool {
        self.progresses.contains_key(&tid)
    }

    /// Stop tracking every thread of `node`.
    ///
    /// There is no barrier on the min clock, so a dead worker left in
    /// the table would only freeze the reported minimum. Returns how
    /// many threads were removed.
    pub fn delete_node(&mut self, node: NodeId) -> usize {
        let before = self.progresses.len();
        self.progresses.retain(|tid, _| tid.node() != node);
        let removed = before - self.progresses.len();
        self.recompute_min();
        tracing::info!("Removed {removed} workers of failed node {node}");
        removed
    }

    /// Reconcile against the authoritative node list after a topology
    /// change.
    ///
    /// Drops the threads of `failed_node` and of any node missing from
    /// `nodes`. New nodes are not added here; their workers arrive
    /// through [`Self::init`] or a checkpoint restore. Returns how many
    /// threads were removed.
    pub fn update(&mut self, failed_node: Option<NodeId>, nodes: &[Node]) -> usize {
        let mut removed = failed_node.map_or(0, |node| self.delete_node(node));

        let before = self.progresses.len();
        self.progresses
            .retain(|tid, _| nodes.iter().any(|node| node.id == tid.node()));
        let departed = before - self.progresses.len();
        if departed > 0 {
            tracing::info!("Removed {departed} workers of departed nodes");
        }
        removed += departed;

        self.recompute_min();
        removed
    }

    /// The coarsened checkpoint of the current table.
    pub fn checkpoint(&self) -> ProgressCheckpoint {
        ProgressCheckpoint::coarsened(
            self.min_clock,
            self.progresses.iter().map(|(tid, clock)| (*tid, *clock)),
        )
    }

    /// Write a checkpoint.
    ///
    /// Whether anything durable happens is up to the store; with
    /// checkpointing disabled it is a [`NoOpStore`].
    ///
    /// [`NoOpStore`]: crate::recovery::store::NoOpStore
    pub fn dump<W>(&self, writer: &mut W) -> Result<(), CheckpointError>
    where
        W: ProgressWriter + ?Sized,
    {
        writer.write(&self.checkpoint())
    }

    /// Replace the table with the last checkpoint.
    ///
    /// With no checkpoint the table ends up empty. If `scale_node` is
    /// set, every restored clock is also given to the thread with the
    /// same local index on that node, unless that thread id would not
    /// fit in a `u32`. Returns the number of tracked
    /// workers afterwards.
    pub fn restore<R>(&mut self, reader: &mut R, scale_node: Option<NodeId>) -> usize
    where
        R: ProgressReader + ?Sized,
    {
        self.progresses.clear();
        self.min_clock = None;

        let Some(checkpoint) = reader.read() else {
            return 0;
        };

        for (tid, clock) in checkpoint.clocks {
            self.progresses.insert(tid, clock);
            if let Some(scale_node) = scale_node {
                match tid.on_node(scale_node) {
                    Some(inheritor) => {
                        self.progresses.insert(inheritor, clock);
                        tracing::info!("Add scale node tracker={inheritor}, progress={clock}");
                    }
                    None => tracing::warn!(
                        "Scale node {scale_node} has no thread for local index {}; not remapping {tid}",
                        tid.local_index()
                    ),
                }
            }
        }
        self.recompute_min();

        if checkpoint.min_clock != self.min_clock {
            tracing::warn!(
                "Checkpointed min clock {:?} disagrees with restored clocks; using {:?}",
                checkpoint.min_clock,
                self.min_clock
            );
        }
        self.progresses.len()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            min_clock: self.min_clock,
            clocks: self.progresses.clone(),
        }
    }

    /// Human readable dump of the table. Also logged.
    pub fn debug_string(&self) -> String {
        let mut out = String::new();
        for (tid, clock) in &self.progresses {
            tracing::info!("tid:{tid}, progress:{clock}");
            out.push_str(&format!("tid:{tid}, progress:{clock}\n"));
        }
        out
    }

    fn recompute_min(&mut self) {
        self.min_clock = self.progresses.values().min().copied();
    }
}
