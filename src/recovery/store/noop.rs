//! Progress store which does nothing.

use crate::errors::CheckpointError;
use crate::recovery::model::ProgressCheckpoint;

use super::{ProgressReader, ProgressWriter};

/// Writes are dropped and reads are the same as an empty store.
#[derive(Debug, Default)]
pub struct NoOpStore;

impl NoOpStore {
    pub fn new() -> Self {
        NoOpStore {}
    }
}

impl ProgressWriter for NoOpStore {
    fn write(&mut self, _checkpoint: &ProgressCheckpoint) -> Result<(), CheckpointError> {
        Ok(())
    }
}

impl ProgressReader for NoOpStore {
    fn read(&mut self) -> Option<ProgressCheckpoint> {
        None
    }
}
