//! Local file implementation of the progress store.

use std::fs::File;
use std::io::ErrorKind;
use std::io::Write;
use std::path::PathBuf;

use crate::errors::CheckpointError;
use crate::recovery::model::ProgressCheckpoint;

use super::{ProgressReader, ProgressWriter};

/// One checkpoint file per shard.
///
/// Every dump writes a sibling `.tmp` file and renames it over the
/// checkpoint, so a crash mid-dump leaves the previous checkpoint.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl ProgressWriter for FileStore {
    fn write(&mut self, checkpoint: &ProgressCheckpoint) -> Result<(), CheckpointError> {
        tracing::info!("Dump progress to {:?}", self.path);
        let err = |source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        };
        let tmp_path = self.tmp_path();
        let mut file = File::create(&tmp_path).map_err(err)?;
        file.write_all(checkpoint.render().as_bytes())
            .map_err(err)?;
        // A checkpoint that only made it to the page cache is not a
        // checkpoint.
        file.sync_all().map_err(err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(err)
    }
}

impl ProgressReader for FileStore {
    fn read(&mut self) -> Option<ProgressCheckpoint> {
        tracing::info!("Restore progress from {:?}", self.path);
        match std::fs::read(&self.path) {
            // Undecodable bytes only spoil the tokens they are in.
            Ok(bytes) => Some(ProgressCheckpoint::parse(&String::from_utf8_lossy(&bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!("No progress checkpoint at {:?}; starting from scratch", self.path);
                None
            }
            Err(err) => {
                tracing::warn!(
                    "Unable to read progress checkpoint at {:?}: {err}; starting from scratch",
                    self.path
                );
                None
            }
        }
    }
}
