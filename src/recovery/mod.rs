//! Internal code for checkpointing shard progress.
//!
//! Each shard's [`crate::progress::ProgressTracker`] can be dumped to
//! and restored from a progress store. Model state is not part of it:
//! storage persists itself.
//!
//! Checkpointing is coarse on purpose. Every clock is rounded to the
//! nearest multiple of 100 before it is written (see
//! [`model::round_hundred`]), so a restore is lossy unless clocks were
//! already on that grid.
//!
//! Scale-out
//! ---------
//!
//! When a node joins a cluster that is restarting from a checkpoint,
//! its worker threads have no history. If the config names a scale
//! node, restore copies every restored clock onto the thread with the
//! same local index on that node, so the newcomers start near the
//! rest of the cluster instead of at zero.
//!
//! Stores
//! ------
//!
//! A store implements [`store::ProgressWriter`] and
//! [`store::ProgressReader`]. [`store::from_config`] picks the per-node
//! file or, with checkpointing disabled, [`store::NoOpStore`].

pub mod model;
pub mod store;

pub use model::*;
pub use store::*;
