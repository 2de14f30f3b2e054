use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::key::SyncableKey;
use super::paths::{partial_path, payload_path_for};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("no local payload for {0}")]
    NotFound(SyncableKey),
    #[error("payload root is inaccessible: {path}: {source}")]
    RootUnavailable { path: PathBuf, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Directory holding the backing file of every key.
#[derive(Debug, Clone)]
pub struct PayloadDir {
    root: PathBuf,
}

impl PayloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &SyncableKey) -> PathBuf {
        payload_path_for(&self.root, key)
    }

    pub async fn ensure_accessible(&self) -> Result<(), PayloadError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(PayloadError::RootUnavailable {
                path: self.root.clone(),
                source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            }),
            Err(source) => Err(PayloadError::RootUnavailable {
                path: self.root.clone(),
                source,
            }),
        }
    }

    pub async fn read(&self, key: &SyncableKey) -> Result<Vec<u8>, PayloadError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(key.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, key: &SyncableKey) -> bool {
        tokio::fs::metadata(self.path_for(key))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Writes through a `.partial` sibling and renames, so readers never
    /// observe a half-written payload.
    pub async fn write(&self, key: &SyncableKey, bytes: &[u8]) -> Result<(), PayloadError> {
        let target = self.path_for(key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, &target).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &SyncableKey) -> Result<(), PayloadError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
