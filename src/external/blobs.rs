//! Attachment blob-store boundary.
//!
//! Attachment bytes live in external object storage; the engine only
//! uploads eagerly-fetched documents and records the opaque key.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// External object store for attachment bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads bytes under the suggested key; returns the final blob key.
    async fn put(&self, key: &str, bytes: Bytes) -> anyhow::Result<String>;
}

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored bytes for a key, if present.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.blobs.lock().await.get(key).cloned()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes) -> anyhow::Result<String> {
        self.blobs.lock().await.insert(key.to_string(), bytes);
        Ok(key.to_string())
    }
}
