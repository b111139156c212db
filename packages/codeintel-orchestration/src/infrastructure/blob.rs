//! Blob stores for raw artifacts

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collaborators::BlobStore;
use crate::error::{OrchestratorError, Result};

/// One file per key under a root directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let plain = relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(OrchestratorError::collaborator(
                "blob_store.path",
                format!("invalid blob key {:?}", key),
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Store a blob (used by producers and tests)
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_for(key)?;
        let file = tokio::task::spawn_blocking(move || std::fs::File::open(path))
            .await?
            .map_err(|e| OrchestratorError::collaborator("blob_store.get", e))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| OrchestratorError::collaborator("blob_store.delete", e))
    }
}

/// In-memory blob store (for testing)
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: Vec<u8>) {
        self.blobs.write().insert(key.into(), data);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.read().contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        match self.blobs.read().get(key) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(OrchestratorError::collaborator(
                "blob_store.get",
                format!("no blob named {}", key),
            )),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.blobs.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::collaborator(
                "blob_store.delete",
                format!("no blob named {}", key),
            )),
        }
    }
}
