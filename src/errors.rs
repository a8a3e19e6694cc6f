//! Error types for the server core.
//!
//! There are three families, one per layer:
//!
//! - [`ProgressError`] comes out of the progress tracker when asked
//!   about a worker it does not track.
//! - [`ModelError`] comes out of a consistency model. A
//!   [`ModelError::ProtocolViolation`] is never recoverable: the
//!   shard that raised it stops, see [`crate::server`].
//! - [`CheckpointError`] comes out of the checkpoint stores.
//! - [`ServerError`] comes out of [`crate::server::Server`] when
//!   routing to, starting or stopping shards.

use std::panic::Location;
use std::path::PathBuf;

use crate::node::ThreadId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgressError {
    #[error("worker {0} is not tracked by this shard")]
    UnknownWorker(ThreadId),
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A worker that is not a member of this shard tried to touch its
    /// storage. Membership is closed and trusted, so this means the
    /// cluster view has desynchronized.
    #[error("{location} protocol violation on model {model_id}: sender {sender} is not a valid worker")]
    ProtocolViolation {
        model_id: u32,
        sender: i32,
        location: String,
    },
    #[error("malformed {what} payload on model {model_id}")]
    MalformedPayload { model_id: u32, what: &'static str },
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl ModelError {
    /// Build a protocol violation remembering where it was detected.
    #[track_caller]
    pub fn protocol_violation(model_id: u32, sender: i32) -> Self {
        Self::ProtocolViolation {
            model_id,
            sender,
            location: prepend_caller(Location::caller(), ""),
        }
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("unable to write progress checkpoint to {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no shard serves model {0}")]
    UnknownModel(u32),
    #[error("model {0} is already served by a shard")]
    DuplicateModel(u32),
    #[error("shard for model {0} has stopped")]
    ShardStopped(u32),
    #[error("shard for model {model_id} failed")]
    Shard {
        model_id: u32,
        #[source]
        source: ModelError,
    },
    #[error("shard for model {0} panicked; look for errors above")]
    ShardPanicked(u32),
    #[error("unable to start {what}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

/// Prepend '({caller})' to the message.
fn prepend_caller(caller: &Location, msg: &str) -> String {
    if msg.is_empty() {
        format!("({caller})")
    } else {
        format!("({caller}) {msg}")
    }
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn protocol_violation_records_location() {
    let err = ModelError::protocol_violation(3, 42);
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.contains("sender 42"), "{msg}");
    assert!(err.is_protocol_violation());
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let out = std::thread::Builder::new()
        .name("shard-1".into())
        .spawn(|| prepend_tname("a\nb".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(out, "<shard-1> a\n<shard-1> b\n");
}
