//! Embedding pipeline boundary.
//!
//! The vector-embedding pipeline is a downstream consumer with its own
//! store. The engine enqueues at most one job per message (deduped on the
//! consumer's record of the message, not on job uniqueness) and asks the
//! consumer to drop its vectors when a message is purged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::Mutex;

use crate::domain::{ConnectionId, MessageId, TenantId};

/// Payload handed to the embedding queue, fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Local message row id.
    pub message_id: MessageId,
    /// Subject line.
    pub subject: Option<String>,
    /// Short content preview.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    /// Plain text body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
    /// HTML body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    /// Sender address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Receipt instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

/// Downstream embedding consumer.
#[async_trait]
pub trait EmbeddingSink: Send + Sync {
    /// Enqueues an embedding job.
    async fn enqueue(&self, job: EmbeddingJob) -> anyhow::Result<()>;

    /// Whether the consumer already holds vectors for this message.
    async fn is_indexed(&self, message_id: &MessageId) -> anyhow::Result<bool>;

    /// Drops the consumer's vectors for this message.
    async fn remove(&self, message_id: &MessageId) -> anyhow::Result<()>;
}

/// In-memory embedding sink for tests.
#[derive(Debug, Default)]
pub struct MemoryEmbeddingSink {
    enqueued: Mutex<Vec<EmbeddingJob>>,
    indexed: Mutex<HashSet<MessageId>>,
}

impl MemoryEmbeddingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a message as already indexed, so enqueue-dedup skips it.
    pub async fn mark_indexed(&self, message_id: MessageId) {
        self.indexed.lock().await.insert(message_id);
    }

    /// Jobs enqueued so far.
    pub async fn enqueued(&self) -> Vec<EmbeddingJob> {
        self.enqueued.lock().await.clone()
    }
}

#[async_trait]
impl EmbeddingSink for MemoryEmbeddingSink {
    async fn enqueue(&self, job: EmbeddingJob) -> anyhow::Result<()> {
        self.indexed.lock().await.insert(job.message_id.clone());
        self.enqueued.lock().await.push(job);
        Ok(())
    }

    async fn is_indexed(&self, message_id: &MessageId) -> anyhow::Result<bool> {
        Ok(self.indexed.lock().await.contains(message_id))
    }

    async fn remove(&self, message_id: &MessageId) -> anyhow::Result<()> {
        self.indexed.lock().await.remove(message_id);
        Ok(())
    }
}
