//! Seed persistence: one blob holding the most recently saved snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Interface between the server and wherever the seed blob lives.
pub trait SeedStore: Send + Sync {
    /// The stored seed, or `None` when nothing has been saved yet.
    fn load_seed(&self) -> Result<Option<Vec<u8>>, StorageError>;

    fn store_seed(&self, seed: &[u8]) -> Result<(), StorageError>;
}

/// Keeps the seed in a single file. Writes go to a sibling temp file first
/// and are renamed into place, so a crash mid-write cannot corrupt the seed.
pub struct FileSeedStore {
    path: PathBuf,
}

impl FileSeedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SeedStore for FileSeedStore {
    fn load_seed(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.path) {
            Ok(seed) => Ok(Some(seed)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_seed(&self, seed: &[u8]) -> Result<(), StorageError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, seed)?;
        fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), bytes = seed.len(), "seed saved");
        Ok(())
    }
}
