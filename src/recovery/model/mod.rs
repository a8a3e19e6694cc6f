//! The data model for recovery.
//!
//! Only shard progress is checkpointed by the core; model state lives
//! in storage, which persists itself.

pub mod progress;

pub use progress::*;
