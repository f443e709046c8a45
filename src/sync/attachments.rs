//! Attachment decision policy and processing pipeline.
//!
//! The engine decides per attachment whether to fetch bytes eagerly
//! during sync or to keep a pending reference for on-demand fetch later.
//! Eager fetch is reserved for small, text-extractable documents that are
//! not inline; everything else stays pending. The pending → stored
//! transition is one-way and idempotent.

use std::sync::Arc;

use crate::config::AttachmentConfig;
use crate::domain::{AttachmentRef, Message, StorageState};
use crate::external::BlobStore;
use crate::providers::MailAdapter;
use crate::storage::{queries::attachments, Database};

/// Downloads eager-eligible pending attachments and uploads them to the
/// blob store.
pub struct AttachmentPipeline {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    config: AttachmentConfig,
}

impl AttachmentPipeline {
    /// Creates a pipeline.
    pub fn new(db: Database, blobs: Arc<dyn BlobStore>, config: AttachmentConfig) -> Self {
        Self { db, blobs, config }
    }

    /// Whether a reference qualifies for eager fetch: a small,
    /// text-extractable document that is not inline.
    pub fn is_eager(&self, attachment: &AttachmentRef) -> bool {
        !attachment.is_inline
            && attachment.size > 0
            && attachment.size <= self.config.max_eager_bytes
            && self.config.is_eager_mime(&attachment.mime_type)
    }

    /// Processes every reference owned by `message`.
    ///
    /// Stored references are no-ops; pending references that fail the
    /// eager policy are left pending for on-demand fetch. A reference the
    /// remote no longer has is left pending as well; the owning message
    /// will converge through the deletion path if it is truly gone.
    ///
    /// Returns the number of references stored by this call.
    pub async fn process_message(
        &self,
        adapter: &dyn MailAdapter,
        message: &Message,
    ) -> anyhow::Result<usize> {
        let refs = attachments::get_by_message(&self.db, &message.id).await?;
        let mut stored = 0usize;

        for reference in refs {
            let StorageState::Pending {
                external_message_id,
                external_attachment_id,
            } = &reference.storage
            else {
                continue;
            };
            if !self.is_eager(&reference) {
                continue;
            }

            let Some(bytes) = adapter
                .download_attachment(external_message_id, external_attachment_id)
                .await?
            else {
                tracing::debug!(
                    attachment_id = %reference.id,
                    "attachment gone remotely, leaving reference pending"
                );
                continue;
            };

            let key = format!(
                "{}/{}/{}",
                message.tenant_id, message.connection_id, reference.id
            );
            let blob_key = self.blobs.put(&key, bytes).await?;
            if attachments::mark_stored(&self.db, &reference.id, &blob_key).await? {
                stored += 1;
            }
        }

        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttachmentId, ExternalId, MessageId};
    use crate::external::MemoryBlobStore;

    async fn pipeline_for_policy() -> AttachmentPipeline {
        // Policy checks don't touch the database; the handle is unused.
        let db = Database::open_in_memory().await.unwrap();
        AttachmentPipeline::new(db, Arc::new(MemoryBlobStore::new()), AttachmentConfig::default())
    }

    fn reference(mime: &str, size: u64, is_inline: bool) -> AttachmentRef {
        AttachmentRef {
            id: AttachmentId::generate(),
            message_id: MessageId::from("msg-1"),
            filename: "file".to_string(),
            mime_type: mime.to_string(),
            size,
            is_inline,
            content_id: None,
            storage: StorageState::Pending {
                external_message_id: ExternalId::from("ext-1"),
                external_attachment_id: "att-1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn small_pdf_is_eager() {
        let pipeline = pipeline_for_policy().await;
        assert!(pipeline.is_eager(&reference("application/pdf", 50_000, false)));
    }

    #[tokio::test]
    async fn inline_image_is_not_eager() {
        let pipeline = pipeline_for_policy().await;
        assert!(!pipeline.is_eager(&reference("application/pdf", 50_000, true)));
        assert!(!pipeline.is_eager(&reference("image/png", 50_000, false)));
    }

    #[tokio::test]
    async fn oversized_document_is_not_eager() {
        let pipeline = pipeline_for_policy().await;
        let too_big = AttachmentConfig::default().max_eager_bytes + 1;
        assert!(!pipeline.is_eager(&reference("application/pdf", too_big, false)));
    }

    #[tokio::test]
    async fn zero_size_is_not_eager() {
        let pipeline = pipeline_for_policy().await;
        assert!(!pipeline.is_eager(&reference("text/plain", 0, false)));
    }
}
