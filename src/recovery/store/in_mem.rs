//! Implementation of an in-memory progress store.
//!
//! The checkpoint is held in its text form, so restores through this
//! store see exactly what a file would give them. Clones share the
//! same slot, which lets a test keep a handle on a store a shard owns.

use std::sync::Arc;
use std::sync::Mutex;

use crate::errors::CheckpointError;
use crate::recovery::model::ProgressCheckpoint;

use super::{ProgressReader, ProgressWriter};

#[derive(Debug, Clone, Default)]
pub struct InMemStore(Arc<Mutex<Option<String>>>);

impl InMemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `text` as the stored checkpoint.
    pub fn with_contents(text: impl Into<String>) -> Self {
        Self(Arc::new(Mutex::new(Some(text.into()))))
    }

    /// The stored checkpoint text, if anything was written.
    pub fn contents(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }
}

impl ProgressWriter for InMemStore {
    fn write(&mut self, checkpoint: &ProgressCheckpoint) -> Result<(), CheckpointError> {
        let text = checkpoint.render();
        tracing::trace!("Writing progress checkpoint {text:?}");
        *self.0.lock().unwrap_or_else(|err| err.into_inner()) = Some(text);
        Ok(())
    }
}

impl ProgressReader for InMemStore {
    fn read(&mut self) -> Option<ProgressCheckpoint> {
        self.contents().map(|text| ProgressCheckpoint::parse(&text))
    }
}

#[test]
fn empty_store_reads_none() {
    assert_eq!(InMemStore::new().read(), None);
}

#[test]
fn clones_share_contents() {
    use crate::node::ThreadId;
    use crate::progress::Clock;

    let handle = InMemStore::new();
    let mut store = handle.clone();
    let checkpoint = ProgressCheckpoint::coarsened(Some(Clock(0)), [(ThreadId(1), Clock(0))]);
    store.write(&checkpoint).unwrap();
    assert_eq!(handle.contents().as_deref(), Some("min_clock:0 1:0 "));
}
