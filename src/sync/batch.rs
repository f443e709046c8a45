//! Batch upsert processor.
//!
//! Reconciles a page of parsed messages against the store: creates on
//! first sight, last-write-wins updates on every subsequent sight, the
//! deletion-status merge for trash transitions, then the downstream
//! fan-outs (embedding enqueue, attachment processing) with per-item
//! isolation, so one failing message never blocks the rest of the batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use crate::domain::{
    AttachmentId, AttachmentRef, ConnectionId, Folder, Message, MessageId, MessageStatus,
    StatusMetadata, StorageState, TenantId,
};
use crate::external::{EmbeddingJob, EmbeddingSink, EventKind, Notifier, SyncEvent};
use crate::providers::{MailAdapter, ParsedMessage};
use crate::storage::{
    queries::{attachments, messages},
    Database,
};
use crate::sync::AttachmentPipeline;

/// Counters returned from one batch pass.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Messages reconciled (post-dedup).
    pub processed: usize,
    /// Rows created on first sight.
    pub created: usize,
    /// Per-item fan-out errors, captured without aborting the batch.
    pub errors: Vec<String>,
}

/// Reconciles parsed messages into the store and fans out downstream work.
pub struct BatchUpsertProcessor {
    db: Database,
    embeddings: Arc<dyn EmbeddingSink>,
    notifier: Arc<dyn Notifier>,
    attachments: AttachmentPipeline,
}

impl BatchUpsertProcessor {
    /// Creates a processor.
    pub fn new(
        db: Database,
        embeddings: Arc<dyn EmbeddingSink>,
        notifier: Arc<dyn Notifier>,
        attachments: AttachmentPipeline,
    ) -> Self {
        Self {
            db,
            embeddings,
            notifier,
            attachments,
        }
    }

    /// Processes one batch of parsed messages for a connection.
    ///
    /// Provider pages can overlap, so the batch is deduped by external id
    /// first (last entry wins). Inserts are duplicate-safe against
    /// concurrent runs; updates merge `statusMetadata` through the
    /// deletion-status merge rule and overwrite labels/folder/flags from
    /// the fresh fetch.
    pub async fn process(
        &self,
        adapter: &dyn MailAdapter,
        parsed: Vec<ParsedMessage>,
        connection_id: &ConnectionId,
        tenant_id: &TenantId,
    ) -> anyhow::Result<BatchOutcome> {
        let parsed = dedup_last_wins(parsed);
        if parsed.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let processed = parsed.len();

        let keys: Vec<_> = parsed.iter().map(|m| m.external_id.clone()).collect();
        let existing: HashMap<_, _> =
            messages::get_by_external_ids(&self.db, connection_id, keys.clone())
                .await?
                .into_iter()
                .map(|m| (m.external_id.clone(), m))
                .collect();

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        for message in &parsed {
            let row = to_row(message, existing.get(&message.external_id), connection_id, tenant_id);
            if existing.contains_key(&message.external_id) {
                updates.push(row);
            } else {
                creates.push(row);
            }
        }

        let created = messages::insert_batch(&self.db, creates).await?;
        for row in updates {
            messages::update_from_fetch(&self.db, row).await?;
        }

        // Re-read to obtain stable local ids (another run may have won the
        // insert race for some rows).
        let persisted: HashMap<_, _> =
            messages::get_by_external_ids(&self.db, connection_id, keys)
                .await?
                .into_iter()
                .map(|m| (m.external_id.clone(), m))
                .collect();

        // Record attachment references before fan-out so the pipeline sees
        // them. Insertion dedups on (message, provider attachment id).
        let mut refs = Vec::new();
        for message in &parsed {
            let Some(row) = persisted.get(&message.external_id) else {
                continue;
            };
            for attachment in &message.attachments {
                refs.push(AttachmentRef {
                    id: AttachmentId::generate(),
                    message_id: row.id.clone(),
                    filename: attachment.filename.clone(),
                    mime_type: attachment.mime_type.clone(),
                    size: attachment.size,
                    is_inline: attachment.is_inline,
                    content_id: attachment.content_id.clone(),
                    storage: StorageState::Pending {
                        external_message_id: message.external_id.clone(),
                        external_attachment_id: attachment.external_attachment_id.clone(),
                    },
                });
            }
        }
        attachments::insert_all(&self.db, refs).await?;

        // Fan-outs run settled-in-parallel; each message's failures are
        // captured and logged without blocking the others.
        let fanouts = parsed.iter().filter_map(|message| {
            let row = persisted.get(&message.external_id)?;
            Some(self.fan_out(adapter, row, !existing.contains_key(&message.external_id)))
        });
        let errors: Vec<String> = join_all(fanouts)
            .await
            .into_iter()
            .flatten()
            .collect();

        Ok(BatchOutcome {
            processed,
            created,
            errors,
        })
    }

    /// Downstream work for one persisted message: embedding enqueue
    /// (deduped on the consumer's own record of the message) and eager
    /// attachment processing. Returns captured error strings.
    async fn fan_out(
        &self,
        adapter: &dyn MailAdapter,
        row: &Message,
        is_new: bool,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        let embed = async {
            if row.is_deleted {
                return Ok(());
            }
            if self.embeddings.is_indexed(&row.id).await? {
                return Ok(());
            }
            self.embeddings
                .enqueue(EmbeddingJob {
                    tenant_id: row.tenant_id.clone(),
                    connection_id: row.connection_id.clone(),
                    message_id: row.id.clone(),
                    subject: row.subject.clone(),
                    snippet: Some(row.snippet.clone()).filter(|s| !s.is_empty()),
                    body_text: row.body_text.clone(),
                    body_html: row.body_html.clone(),
                    from: Some(row.from.email.clone()),
                    received_at: Some(row.received_at),
                })
                .await
        };
        let attach = self.attachments.process_message(adapter, row);

        let (embed_result, attach_result) = tokio::join!(embed, attach);
        if let Err(error) = embed_result {
            tracing::warn!(message_id = %row.id, %error, "embedding enqueue failed");
            errors.push(format!("embed {}: {}", row.external_id, error));
        }
        if let Err(error) = attach_result {
            tracing::warn!(message_id = %row.id, %error, "attachment processing failed");
            errors.push(format!("attachments {}: {}", row.external_id, error));
        }

        self.notifier
            .publish(SyncEvent {
                tenant_id: row.tenant_id.clone(),
                connection_id: row.connection_id.clone(),
                reason: if is_new {
                    EventKind::MessageProcessed
                } else {
                    EventKind::LabelsUpdated
                },
                message_id: Some(row.id.clone()),
                external_id: Some(row.external_id.clone()),
                folder: Some(row.folder.clone()),
            })
            .await;

        errors
    }
}

/// Dedups a batch by external id, keeping the last occurrence.
fn dedup_last_wins(parsed: Vec<ParsedMessage>) -> Vec<ParsedMessage> {
    let mut by_key: HashMap<crate::domain::ExternalId, usize> = HashMap::new();
    let mut out: Vec<Option<ParsedMessage>> = Vec::with_capacity(parsed.len());
    for message in parsed {
        match by_key.get(&message.external_id) {
            Some(&index) => out[index] = Some(message),
            None => {
                by_key.insert(message.external_id.clone(), out.len());
                out.push(Some(message));
            }
        }
    }
    out.into_iter().flatten().collect()
}

/// Builds the row to persist for one parsed message.
///
/// A fresh trash-folder sighting counts as a deletion transition; the
/// status merge keeps `deleted_at` stable across repeated sightings and
/// clears it on reactivation.
fn to_row(
    parsed: &ParsedMessage,
    existing: Option<&Message>,
    connection_id: &ConnectionId,
    tenant_id: &TenantId,
) -> Message {
    let now = Utc::now();
    let incoming = if parsed.folder.is_trash() {
        MessageStatus::Deleted
    } else {
        MessageStatus::Active
    };
    let status = match existing {
        Some(row) => row.status.merge(incoming, now),
        None => StatusMetadata::active().merge(incoming, now),
    };
    let is_deleted = status.is_deleted();
    let folder = if is_deleted {
        Folder::Trash
    } else {
        parsed.folder.clone()
    };

    Message {
        id: existing
            .map(|row| row.id.clone())
            .unwrap_or_else(MessageId::generate),
        tenant_id: tenant_id.clone(),
        connection_id: connection_id.clone(),
        external_id: parsed.external_id.clone(),
        from: parsed.from.clone(),
        to: parsed.to.clone(),
        cc: parsed.cc.clone(),
        bcc: parsed.bcc.clone(),
        subject: parsed.subject.clone(),
        snippet: parsed.snippet.clone(),
        body_text: parsed.body_text.clone(),
        body_html: parsed.body_html.clone(),
        folder,
        labels: parsed.labels.clone(),
        is_read: parsed.is_read,
        is_starred: parsed.is_starred,
        is_deleted,
        sent_at: parsed.sent_at,
        received_at: parsed.received_at,
        size: parsed.size,
        status,
        attachments: vec![],
    }
}
