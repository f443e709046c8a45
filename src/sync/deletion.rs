//! Trash/deletion convergence state machine.
//!
//! Per message the states are ACTIVE, SOFT_DELETED (trashed, row
//! retained), and PURGED (row and owned references removed, downstream
//! embeddings dropped). A remote "not found" on a live row soft-deletes:
//! unreachable is treated as trashed, not purged, because the message may
//! reappear. A "not found" on an already-trashed row, or a removal event
//! that unambiguously means permanent deletion, purges.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::{ConnectionId, ExternalId, Message, MessageStatus};
use crate::external::{EmbeddingSink, EventKind, Notifier, SyncEvent};
use crate::storage::{queries::messages, Database};

/// What the state machine did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Moved to trash, row retained.
    SoftDeleted,
    /// Row and references removed, embeddings dropped.
    Purged,
}

/// Applies deletion transitions and their downstream effects.
pub struct DeletionHandler {
    db: Database,
    embeddings: Arc<dyn EmbeddingSink>,
    notifier: Arc<dyn Notifier>,
}

impl DeletionHandler {
    /// Creates a handler.
    pub fn new(
        db: Database,
        embeddings: Arc<dyn EmbeddingSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            db,
            embeddings,
            notifier,
        }
    }

    /// Handles a remote removal signal for one message.
    ///
    /// `permanent` marks removal events that unambiguously mean permanent
    /// deletion (the caller's explicit hard-delete request); otherwise the
    /// local row's state decides between soft delete and purge. Returns
    /// `None` when no local row exists for the id.
    pub async fn handle_remote_missing(
        &self,
        connection_id: &ConnectionId,
        external_id: &ExternalId,
        permanent: bool,
    ) -> anyhow::Result<Option<Disposition>> {
        let Some(row) = messages::get_by_external_id(&self.db, connection_id, external_id).await?
        else {
            tracing::debug!(
                %connection_id,
                %external_id,
                "removal signal for unknown message, ignoring"
            );
            return Ok(None);
        };

        let disposition = if permanent || row.is_deleted || row.folder.is_trash() {
            self.purge(&row).await?;
            Disposition::Purged
        } else {
            self.soft_delete(&row).await?;
            Disposition::SoftDeleted
        };
        Ok(Some(disposition))
    }

    /// ACTIVE → SOFT_DELETED: folder becomes TRASH, row retained,
    /// `deleted_at` stamped once.
    async fn soft_delete(&self, row: &Message) -> anyhow::Result<()> {
        let merged = row.status.merge(MessageStatus::Deleted, Utc::now());
        messages::apply_status(&self.db, &row.id, merged).await?;

        tracing::info!(message_id = %row.id, external_id = %row.external_id, "message soft-deleted");
        self.notifier
            .publish(SyncEvent {
                tenant_id: row.tenant_id.clone(),
                connection_id: row.connection_id.clone(),
                reason: EventKind::MessageDeleted,
                message_id: Some(row.id.clone()),
                external_id: Some(row.external_id.clone()),
                folder: Some(crate::domain::Folder::Trash),
            })
            .await;
        Ok(())
    }

    /// `* → PURGED`: embeddings first (best-effort), then the row, which
    /// cascades to attachment references.
    async fn purge(&self, row: &Message) -> anyhow::Result<()> {
        if let Err(error) = self.embeddings.remove(&row.id).await {
            tracing::warn!(
                message_id = %row.id,
                %error,
                "embedding removal failed, continuing with purge"
            );
        }

        messages::delete(&self.db, &row.id).await?;

        tracing::info!(message_id = %row.id, external_id = %row.external_id, "message purged");
        self.notifier
            .publish(SyncEvent {
                tenant_id: row.tenant_id.clone(),
                connection_id: row.connection_id.clone(),
                reason: EventKind::MessageDeleted,
                message_id: Some(row.id.clone()),
                external_id: Some(row.external_id.clone()),
                folder: None,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Address, AttachmentId, AttachmentRef, Connection, Folder, Message, MessageId,
        ProviderKind, StatusMetadata, StorageState, TenantId,
    };
    use crate::external::{MemoryEmbeddingSink, MemoryNotifier};
    use crate::storage::queries::{attachments, connections};
    use pretty_assertions::assert_eq;

    struct Fixture {
        db: Database,
        embeddings: Arc<MemoryEmbeddingSink>,
        notifier: Arc<MemoryNotifier>,
        handler: DeletionHandler,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        connections::upsert(
            &db,
            &Connection::new(
                ConnectionId::from("conn-1"),
                TenantId::from("tenant-1"),
                "user@example.com",
                ProviderKind::Gmail,
            ),
        )
        .await
        .unwrap();

        let embeddings = Arc::new(MemoryEmbeddingSink::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let handler = DeletionHandler::new(
            db.clone(),
            embeddings.clone() as Arc<dyn EmbeddingSink>,
            notifier.clone() as Arc<dyn Notifier>,
        );
        Fixture {
            db,
            embeddings,
            notifier,
            handler,
        }
    }

    async fn insert_message(db: &Database, external_id: &str, folder: Folder) -> Message {
        let is_trashed = folder.is_trash();
        let message = Message {
            id: MessageId::generate(),
            tenant_id: TenantId::from("tenant-1"),
            connection_id: ConnectionId::from("conn-1"),
            external_id: ExternalId::from(external_id),
            from: Address::new("alice@example.com"),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: Some("Subject".to_string()),
            snippet: String::new(),
            body_text: None,
            body_html: None,
            folder,
            labels: vec![],
            is_read: false,
            is_starred: false,
            is_deleted: is_trashed,
            sent_at: Utc::now(),
            received_at: Utc::now(),
            size: None,
            status: if is_trashed {
                StatusMetadata::deleted_at(Utc::now())
            } else {
                StatusMetadata::active()
            },
            attachments: vec![],
        };
        messages::insert_batch(db, vec![message.clone()]).await.unwrap();
        message
    }

    #[tokio::test]
    async fn not_found_on_live_row_soft_deletes() {
        let f = fixture().await;
        // Literal fixture: folder=INBOX, isDeleted=false, then a 404.
        let msg = insert_message(&f.db, "ext-1", Folder::Inbox).await;

        let disposition = f
            .handler
            .handle_remote_missing(&msg.connection_id, &msg.external_id, false)
            .await
            .unwrap();
        assert_eq!(disposition, Some(Disposition::SoftDeleted));

        let after = messages::get_by_id(&f.db, &msg.id).await.unwrap().unwrap();
        assert_eq!(after.folder, Folder::Trash);
        assert!(after.is_deleted);
        assert!(after.status.deleted_at.is_some());
    }

    #[tokio::test]
    async fn not_found_on_trashed_row_purges() {
        let f = fixture().await;
        // Same message already in TRASH, then a 404: row removed.
        let msg = insert_message(&f.db, "ext-1", Folder::Trash).await;
        f.embeddings.mark_indexed(msg.id.clone()).await;

        let disposition = f
            .handler
            .handle_remote_missing(&msg.connection_id, &msg.external_id, false)
            .await
            .unwrap();
        assert_eq!(disposition, Some(Disposition::Purged));

        assert!(messages::get_by_id(&f.db, &msg.id).await.unwrap().is_none());
        assert!(!f.embeddings.is_indexed(&msg.id).await.unwrap());
    }

    #[tokio::test]
    async fn explicit_permanent_removal_purges_live_row() {
        let f = fixture().await;
        let msg = insert_message(&f.db, "ext-1", Folder::Inbox).await;

        let disposition = f
            .handler
            .handle_remote_missing(&msg.connection_id, &msg.external_id, true)
            .await
            .unwrap();
        assert_eq!(disposition, Some(Disposition::Purged));
        assert!(messages::get_by_id(&f.db, &msg.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_cascades_to_attachment_references() {
        let f = fixture().await;
        let msg = insert_message(&f.db, "ext-1", Folder::Trash).await;
        attachments::insert_all(
            &f.db,
            vec![AttachmentRef {
                id: AttachmentId::generate(),
                message_id: msg.id.clone(),
                filename: "report.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
                size: 1024,
                is_inline: false,
                content_id: None,
                storage: StorageState::Pending {
                    external_message_id: msg.external_id.clone(),
                    external_attachment_id: "att-1".to_string(),
                },
            }],
        )
        .await
        .unwrap();

        f.handler
            .handle_remote_missing(&msg.connection_id, &msg.external_id, false)
            .await
            .unwrap();

        assert_eq!(
            attachments::count_for_message(&f.db, &msg.id).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn unknown_external_id_is_ignored() {
        let f = fixture().await;
        let disposition = f
            .handler
            .handle_remote_missing(
                &ConnectionId::from("conn-1"),
                &ExternalId::from("never-seen"),
                false,
            )
            .await
            .unwrap();
        assert_eq!(disposition, None);
        assert!(f.notifier.events().await.is_empty());
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent_under_repeat_signals() {
        let f = fixture().await;
        let msg = insert_message(&f.db, "ext-1", Folder::Inbox).await;

        f.handler
            .handle_remote_missing(&msg.connection_id, &msg.external_id, false)
            .await
            .unwrap();
        let first = messages::get_by_id(&f.db, &msg.id).await.unwrap().unwrap();

        // A second identical signal now purges (already trashed), which is
        // the documented convergence path, so check deleted_at stability
        // through the merge rule instead.
        let merged_again = first
            .status
            .merge(MessageStatus::Deleted, Utc::now() + chrono::Duration::hours(1));
        assert_eq!(merged_again.deleted_at, first.status.deleted_at);
    }
}
