//! Implementations of progress checkpoint stores.
//!
//! There are 2 traits you'll have to implement to make a new store:
//! [`ProgressWriter`] and [`ProgressReader`]. A shard owns its store
//! as a `Box<dyn ProgressStore>`.

pub mod file;
pub mod in_mem;
pub mod noop;

pub use file::FileStore;
pub use in_mem::InMemStore;
pub use noop::NoOpStore;

use crate::config::ServerConfig;
use crate::errors::CheckpointError;
use crate::recovery::model::ProgressCheckpoint;

/// Durably records a checkpoint, replacing any previous one.
pub trait ProgressWriter {
    fn write(&mut self, checkpoint: &ProgressCheckpoint) -> Result<(), CheckpointError>;
}

/// Loads the last written checkpoint.
///
/// A missing or unreadable checkpoint reads as `None`; the caller
/// starts from scratch.
pub trait ProgressReader {
    fn read(&mut self) -> Option<ProgressCheckpoint>;
}

/// Both halves, owned by a shard.
pub trait ProgressStore: ProgressWriter + ProgressReader + Send {}

impl<P> ProgressStore for P where P: ProgressWriter + ProgressReader + Send {}

impl<P> ProgressWriter for Box<P>
where
    P: ProgressWriter + ?Sized,
{
    fn write(&mut self, checkpoint: &ProgressCheckpoint) -> Result<(), CheckpointError> {
        (**self).write(checkpoint)
    }
}

impl<P> ProgressReader for Box<P>
where
    P: ProgressReader + ?Sized,
{
    fn read(&mut self) -> Option<ProgressCheckpoint> {
        (**self).read()
    }
}

/// The store this node's config asks for the shard of `model_id`:
/// its checkpoint file if checkpointing is on, otherwise nothing.
pub fn from_config(config: &ServerConfig, model_id: u32) -> Box<dyn ProgressStore> {
    if config.checkpoint_toggle {
        Box::new(FileStore::new(config.checkpoint_path_for(model_id)))
    } else {
        Box::new(NoOpStore::new())
    }
}

#[test]
fn disabled_checkpointing_uses_noop() {
    let mut store = from_config(&ServerConfig::default(), 0);
    store.write(&ProgressCheckpoint::default()).unwrap();
    assert_eq!(store.read(), None);
}
