//! Byte-range sources

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::DecodeError;

/// Fetch-by-byte-range capability
#[async_trait]
pub trait ByteSource: Send + Sync + 'static {
    /// Read exactly `len` bytes of `name` starting at `offset`
    async fn fetch(&self, name: &str, offset: u64, len: u64) -> Result<Bytes, DecodeError>;
}

/// In-memory blobs keyed by name
#[derive(Debug, Default)]
pub struct MemorySource {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a blob
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.blobs.write().insert(name.into(), data.into());
    }

    /// Builder-style insert
    pub fn with_blob(self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.insert(name, data);
        self
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn fetch(&self, name: &str, offset: u64, len: u64) -> Result<Bytes, DecodeError> {
        let blob = self
            .blobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DecodeError::unavailable(format!("no blob named {:?}", name)))?;
        let start = offset as usize;
        let end = start.saturating_add(len as usize);
        if end > blob.len() {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: blob.len().saturating_sub(start) as u64,
            });
        }
        Ok(blob.slice(start..end))
    }
}

/// Files under a root directory
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    /// Resolve names relative to `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn fetch(&self, name: &str, offset: u64, len: u64) -> Result<Bytes, DecodeError> {
        let path = self.root.join(name);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| DecodeError::unavailable(format!("{}: {}", path.display(), e)))?;
        let available = file.metadata().await?.len().saturating_sub(offset);
        if available < len {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: available,
            });
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        if (buf.len() as u64) < len {
            return Err(DecodeError::Truncated {
                expected: len,
                actual: buf.len() as u64,
            });
        }
        Ok(Bytes::from(buf))
    }
}
