//! Sync orchestrator.
//!
//! Drives one sync job for one connection: selects the full-window or
//! incremental strategy, runs the provider adapter through the batch and
//! deletion paths, commits the successor cursor only at the end of a
//! successful pass, and reports a result summary for the external job
//! runner. Runs for different connections are independent; nothing here
//! locks across connections.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use crate::config::SyncConfig;
use crate::domain::{
    Connection, Cursor, DeltaMode, ProviderKind, SyncJob, SyncJobResult, SyncType,
};
use crate::external::{EventKind, Notifier, SyncEvent};
use crate::providers::{ChangeSet, MailAdapter, ProviderError};
use crate::storage::{queries::connections, Database};
use crate::sync::{BatchUpsertProcessor, DeletionHandler};

/// Composes the adapter, batch processor, and deletion handler per job.
pub struct SyncOrchestrator {
    db: Database,
    batch: BatchUpsertProcessor,
    deletion: DeletionHandler,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        db: Database,
        batch: BatchUpsertProcessor,
        deletion: DeletionHandler,
        notifier: Arc<dyn Notifier>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            batch,
            deletion,
            notifier,
            config,
        }
    }

    /// Runs one sync job against the given adapter.
    ///
    /// Fatal errors (auth, unexpected provider failures) propagate to the
    /// external runner with the cursor left at its last committed value,
    /// so the next attempt resumes safely; redelivery is deduplicated by
    /// the `(connection_id, external_id)` upsert key.
    pub async fn run(
        &self,
        job: &SyncJob,
        adapter: &dyn MailAdapter,
    ) -> anyhow::Result<SyncJobResult> {
        let started = std::time::Instant::now();

        let connection = connections::get(&self.db, &job.connection_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown connection {}", job.connection_id))?;

        tracing::info!(
            connection_id = %job.connection_id,
            provider = %job.provider_kind,
            sync_type = ?job.sync_type,
            has_cursor = connection.has_cursor(),
            "sync run starting"
        );

        let mut result = match (&job.sync_type, &connection.cursor) {
            (SyncType::Incremental, Some(cursor)) => {
                let cursor = cursor.clone();
                match self.run_incremental(&connection, adapter, &cursor).await {
                    Ok(result) => result,
                    Err(RunError::CursorExpired(reason)) => {
                        tracing::warn!(
                            connection_id = %connection.id,
                            %reason,
                            "cursor expired, falling back to full window sync"
                        );
                        connections::reset_cursor(&self.db, &connection.id).await?;
                        self.run_full(&connection, adapter).await?
                    }
                    Err(RunError::Fatal(error)) => return Err(error),
                }
            }
            // No cursor yet, or an explicit full sync: (re-)establish.
            _ => self.run_full(&connection, adapter).await?,
        };

        result.sync_duration_ms = started.elapsed().as_millis() as u64;
        result.success = true;

        self.notifier
            .publish(SyncEvent {
                tenant_id: connection.tenant_id.clone(),
                connection_id: connection.id.clone(),
                reason: EventKind::SyncComplete,
                message_id: None,
                external_id: None,
                folder: None,
            })
            .await;

        tracing::info!(
            connection_id = %connection.id,
            processed = result.messages_processed,
            new = result.new_messages,
            errors = result.errors.len(),
            duration_ms = result.sync_duration_ms,
            "sync run finished"
        );
        Ok(result)
    }

    /// Full-window sync: capped newest-first fetch, then cursor
    /// establishment. An explicit full sync is the sanctioned cursor
    /// reset, so the stored cursor is cleared before the new one commits.
    async fn run_full(
        &self,
        connection: &Connection,
        adapter: &dyn MailAdapter,
    ) -> anyhow::Result<SyncJobResult> {
        let (messages, cursor) = adapter
            .fetch_full_window(self.config.full_window_cap)
            .await
            .map_err(anyhow::Error::from)?;

        // Fall back to a timestamp cursor when the adapter could not
        // establish one. Incremental capability degrades instead of the
        // job failing outright.
        let cursor = cursor.unwrap_or_else(|| {
            let newest = messages.iter().map(|m| m.received_at).max();
            Cursor::Timestamp {
                at: newest.unwrap_or_else(Utc::now),
            }
        });

        let outcome = self
            .batch
            .process(adapter, messages, &connection.id, &connection.tenant_id)
            .await?;

        connections::reset_cursor(&self.db, &connection.id).await?;
        connections::update_cursor(&self.db, &connection.id, &cursor, Utc::now()).await?;

        let mut result = SyncJobResult {
            messages_processed: outcome.processed,
            new_messages: outcome.created,
            errors: outcome.errors,
            last_sync_token: Some(cursor.token()),
            ..Default::default()
        };
        annotate_cursor_metadata(&mut result, connection.provider_kind, &cursor);
        Ok(result)
    }

    /// Incremental sync: replay changes since the cursor, route additions
    /// through the batch path and removals/label-drift through their
    /// settled-in-parallel group, then commit the successor cursor.
    async fn run_incremental(
        &self,
        connection: &Connection,
        adapter: &dyn MailAdapter,
        cursor: &Cursor,
    ) -> Result<SyncJobResult, RunError> {
        let (changes, new_cursor) = match adapter.fetch_changes(cursor).await {
            Ok(ok) => ok,
            Err(ProviderError::CursorExpired(reason)) => {
                return Err(RunError::CursorExpired(reason))
            }
            Err(error) => return Err(RunError::Fatal(error.into())),
        };

        let ChangeSet {
            added,
            updated,
            removed,
            truncated,
        } = changes;
        if truncated {
            tracing::info!(
                connection_id = %connection.id,
                "change replay truncated by page cap, remainder deferred to next run"
            );
        }
        let removed_count = removed.len();

        let added_outcome = self
            .batch
            .process(adapter, added, &connection.id, &connection.tenant_id)
            .await
            .map_err(RunError::Fatal)?;

        // Label refresh and deletion handling run as one settled group;
        // failures are isolated per item, captured, and logged.
        let update_task = self
            .batch
            .process(adapter, updated, &connection.id, &connection.tenant_id);
        let deletion_tasks = join_all(removed.into_iter().map(|removal| {
            let connection_id = connection.id.clone();
            async move {
                self.deletion
                    .handle_remote_missing(&connection_id, &removal.external_id, removal.permanent)
                    .await
                    .map_err(|e| format!("delete {}: {}", removal.external_id, e))
            }
        }));
        let (update_result, deletion_results) = tokio::join!(update_task, deletion_tasks);

        let mut errors = added_outcome.errors;
        let mut updated_processed = 0usize;
        match update_result {
            Ok(outcome) => {
                updated_processed = outcome.processed;
                errors.extend(outcome.errors);
            }
            Err(error) => {
                tracing::warn!(connection_id = %connection.id, %error, "label refresh failed");
                errors.push(format!("label refresh: {}", error));
            }
        }
        for deletion in deletion_results {
            if let Err(error) = deletion {
                tracing::warn!(connection_id = %connection.id, %error, "deletion handling failed");
                errors.push(error);
            }
        }

        connections::update_cursor(&self.db, &connection.id, &new_cursor, Utc::now())
            .await
            .map_err(|e| RunError::Fatal(e.into()))?;

        let mut result = SyncJobResult {
            messages_processed: added_outcome.processed + updated_processed + removed_count,
            new_messages: added_outcome.created,
            errors,
            last_sync_token: Some(new_cursor.token()),
            ..Default::default()
        };
        annotate_cursor_metadata(&mut result, connection.provider_kind, &new_cursor);
        Ok(result)
    }
}

/// Internal error split: an expired cursor triggers the full-resync
/// fallback; everything else fails the run.
enum RunError {
    CursorExpired(String),
    Fatal(anyhow::Error),
}

/// Records provider-specific cursor-mode updates the caller must persist
/// onto the connection before the next run.
fn annotate_cursor_metadata(result: &mut SyncJobResult, kind: ProviderKind, cursor: &Cursor) {
    match cursor {
        Cursor::Timestamp { at } => {
            if kind == ProviderKind::Outlook {
                result
                    .metadata
                    .insert("deltaMode".to_string(), "timestamp".to_string());
            }
            result
                .metadata
                .insert("lastSyncTimestamp".to_string(), at.to_rfc3339());
        }
        Cursor::DeltaLink { mode, .. } => {
            let mode = match mode {
                DeltaMode::Delta => "delta",
                DeltaMode::Timestamp => "timestamp",
            };
            result
                .metadata
                .insert("deltaMode".to_string(), mode.to_string());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttachmentConfig;
    use crate::domain::{
        Address, ConnectionId, ExternalId, Folder, SyncPriority, TenantId,
    };
    use crate::external::{
        BlobStore, EmbeddingSink, MemoryBlobStore, MemoryEmbeddingSink, MemoryNotifier,
    };
    use crate::providers::{ParsedMessage, RemovedMessage, Result as ProviderResult};
    use crate::storage::queries::messages;
    use crate::sync::AttachmentPipeline;
    use bytes::Bytes;
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Scripted adapter: fixed responses per call, records invocations.
    struct ScriptedAdapter {
        kind: ProviderKind,
        window: Vec<ParsedMessage>,
        window_cursor: Option<Cursor>,
        changes: Mutex<Option<ProviderResult<(ChangeSet, Cursor)>>>,
    }

    impl ScriptedAdapter {
        fn full_window(messages: Vec<ParsedMessage>, cursor: Option<Cursor>) -> Self {
            Self {
                kind: ProviderKind::Gmail,
                window: messages,
                window_cursor: cursor,
                changes: Mutex::new(None),
            }
        }

        fn incremental(result: ProviderResult<(ChangeSet, Cursor)>) -> Self {
            Self {
                kind: ProviderKind::Gmail,
                window: vec![],
                window_cursor: Some(Cursor::HistoryId {
                    value: "900".to_string(),
                }),
                changes: Mutex::new(Some(result)),
            }
        }
    }

    #[async_trait::async_trait]
    impl MailAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn fetch_changes(&self, _cursor: &Cursor) -> ProviderResult<(ChangeSet, Cursor)> {
            self.changes
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(ProviderError::Internal("unscripted".to_string())))
        }

        async fn fetch_full_window(
            &self,
            limit: usize,
        ) -> ProviderResult<(Vec<ParsedMessage>, Option<Cursor>)> {
            Ok((
                self.window.iter().take(limit).cloned().collect(),
                self.window_cursor.clone(),
            ))
        }

        async fn fetch_message(
            &self,
            _external_id: &ExternalId,
        ) -> ProviderResult<Option<ParsedMessage>> {
            Ok(None)
        }

        async fn download_attachment(
            &self,
            _external_message_id: &ExternalId,
            _external_attachment_id: &str,
        ) -> ProviderResult<Option<Bytes>> {
            Ok(None)
        }
    }

    struct Fixture {
        db: Database,
        notifier: Arc<MemoryNotifier>,
        orchestrator: SyncOrchestrator,
    }

    async fn fixture() -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
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
        let pipeline = AttachmentPipeline::new(
            db.clone(),
            Arc::new(MemoryBlobStore::new()) as Arc<dyn BlobStore>,
            AttachmentConfig::default(),
        );
        let batch = BatchUpsertProcessor::new(
            db.clone(),
            embeddings.clone() as Arc<dyn EmbeddingSink>,
            notifier.clone() as Arc<dyn Notifier>,
            pipeline,
        );
        let deletion = DeletionHandler::new(
            db.clone(),
            embeddings as Arc<dyn EmbeddingSink>,
            notifier.clone() as Arc<dyn Notifier>,
        );
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            batch,
            deletion,
            notifier.clone() as Arc<dyn Notifier>,
            SyncConfig::default(),
        );
        Fixture {
            db,
            notifier,
            orchestrator,
        }
    }

    fn parsed(external_id: &str, received_at: DateTime<Utc>) -> ParsedMessage {
        ParsedMessage {
            external_id: ExternalId::from(external_id),
            from: Address::new("alice@example.com"),
            to: vec![Address::new("bob@example.com")],
            cc: vec![],
            bcc: vec![],
            subject: Some("Subject".to_string()),
            snippet: "Preview".to_string(),
            body_text: Some("Body".to_string()),
            body_html: None,
            labels: vec!["INBOX".to_string()],
            folder: Folder::Inbox,
            is_read: false,
            is_starred: false,
            sent_at: received_at,
            received_at,
            size: None,
            attachments: vec![],
        }
    }

    fn job(sync_type: SyncType) -> SyncJob {
        SyncJob {
            tenant_id: TenantId::from("tenant-1"),
            connection_id: ConnectionId::from("conn-1"),
            provider_kind: ProviderKind::Gmail,
            email: "user@example.com".to_string(),
            priority: SyncPriority::Normal,
            sync_type,
            last_synced_at: None,
        }
    }

    #[tokio::test]
    async fn full_sync_establishes_cursor_and_counts() {
        let f = fixture().await;
        let adapter = ScriptedAdapter::full_window(
            vec![parsed("ext-1", Utc::now()), parsed("ext-2", Utc::now())],
            Some(Cursor::HistoryId {
                value: "500".to_string(),
            }),
        );

        let result = f.orchestrator.run(&job(SyncType::Full), &adapter).await.unwrap();
        assert!(result.success);
        assert_eq!(result.messages_processed, 2);
        assert_eq!(result.new_messages, 2);
        assert_eq!(result.last_sync_token.as_deref(), Some("500"));

        let connection = connections::get(&f.db, &ConnectionId::from("conn-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            connection.cursor,
            Some(Cursor::HistoryId {
                value: "500".to_string()
            })
        );
    }

    #[tokio::test]
    async fn repeated_full_sync_is_idempotent() {
        let f = fixture().await;
        let at = Utc::now();
        let make_adapter = || {
            ScriptedAdapter::full_window(
                vec![parsed("ext-1", at), parsed("ext-2", at)],
                Some(Cursor::HistoryId {
                    value: "500".to_string(),
                }),
            )
        };

        let first = f
            .orchestrator
            .run(&job(SyncType::Full), &make_adapter())
            .await
            .unwrap();
        assert_eq!(first.new_messages, 2);

        let second = f
            .orchestrator
            .run(&job(SyncType::Full), &make_adapter())
            .await
            .unwrap();
        assert_eq!(second.new_messages, 0);
        assert_eq!(
            messages::count_for_connection(&f.db, &ConnectionId::from("conn-1"))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn full_sync_without_cursor_degrades_to_timestamp() {
        let f = fixture().await;
        let newest = Utc::now();
        let adapter = ScriptedAdapter::full_window(
            vec![parsed("ext-1", newest - Duration::hours(1)), parsed("ext-2", newest)],
            None,
        );

        let result = f.orchestrator.run(&job(SyncType::Full), &adapter).await.unwrap();
        assert!(result.success);
        assert!(result.metadata.contains_key("lastSyncTimestamp"));

        let connection = connections::get(&f.db, &ConnectionId::from("conn-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.cursor, Some(Cursor::Timestamp { at: newest }));
    }

    #[tokio::test]
    async fn incremental_advances_cursor_monotonically() {
        let f = fixture().await;
        connections::update_cursor(
            &f.db,
            &ConnectionId::from("conn-1"),
            &Cursor::HistoryId {
                value: "500".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let adapter = ScriptedAdapter::incremental(Ok((
            ChangeSet {
                added: vec![parsed("ext-9", Utc::now())],
                updated: vec![],
                removed: vec![],
                truncated: false,
            },
            Cursor::HistoryId {
                value: "800".to_string(),
            },
        )));

        let result = f
            .orchestrator
            .run(&job(SyncType::Incremental), &adapter)
            .await
            .unwrap();
        assert_eq!(result.new_messages, 1);

        let connection = connections::get(&f.db, &ConnectionId::from("conn-1"))
            .await
            .unwrap()
            .unwrap();
        // Cursor after the run is >= its value before the run.
        assert_eq!(
            connection.cursor,
            Some(Cursor::HistoryId {
                value: "800".to_string()
            })
        );
    }

    #[tokio::test]
    async fn incremental_routes_removals_through_deletion_machine() {
        let f = fixture().await;

        // Seed a live message, then replay a non-permanent removal for it.
        let seed = ScriptedAdapter::full_window(
            vec![parsed("ext-1", Utc::now())],
            Some(Cursor::HistoryId {
                value: "500".to_string(),
            }),
        );
        f.orchestrator.run(&job(SyncType::Full), &seed).await.unwrap();

        let adapter = ScriptedAdapter::incremental(Ok((
            ChangeSet {
                added: vec![],
                updated: vec![],
                removed: vec![RemovedMessage {
                    external_id: ExternalId::from("ext-1"),
                    permanent: false,
                }],
                truncated: false,
            },
            Cursor::HistoryId {
                value: "600".to_string(),
            },
        )));
        let result = f
            .orchestrator
            .run(&job(SyncType::Incremental), &adapter)
            .await
            .unwrap();
        assert_eq!(result.messages_processed, 1);

        let row = messages::get_by_external_id(
            &f.db,
            &ConnectionId::from("conn-1"),
            &ExternalId::from("ext-1"),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.folder, Folder::Trash);
    }

    #[tokio::test]
    async fn expired_cursor_falls_back_to_full_window() {
        let f = fixture().await;
        connections::update_cursor(
            &f.db,
            &ConnectionId::from("conn-1"),
            &Cursor::HistoryId {
                value: "500".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let adapter = ScriptedAdapter {
            kind: ProviderKind::Gmail,
            window: vec![parsed("ext-1", Utc::now())],
            window_cursor: Some(Cursor::HistoryId {
                // Post-reset the lower history id is legal again.
                value: "100".to_string(),
            }),
            changes: Mutex::new(Some(Err(ProviderError::CursorExpired(
                "history too old".to_string(),
            )))),
        };

        let result = f
            .orchestrator
            .run(&job(SyncType::Incremental), &adapter)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.new_messages, 1);

        let connection = connections::get(&f.db, &ConnectionId::from("conn-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            connection.cursor,
            Some(Cursor::HistoryId {
                value: "100".to_string()
            })
        );
    }

    #[tokio::test]
    async fn auth_failure_is_fatal_and_leaves_cursor_untouched() {
        let f = fixture().await;
        let before = Cursor::HistoryId {
            value: "500".to_string(),
        };
        connections::update_cursor(&f.db, &ConnectionId::from("conn-1"), &before, Utc::now())
            .await
            .unwrap();

        let adapter = ScriptedAdapter::incremental(Err(ProviderError::Authentication(
            "token revoked".to_string(),
        )));
        let result = f.orchestrator.run(&job(SyncType::Incremental), &adapter).await;
        assert!(result.is_err());

        let connection = connections::get(&f.db, &ConnectionId::from("conn-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.cursor, Some(before));
    }

    #[tokio::test]
    async fn sync_complete_notification_is_published() {
        let f = fixture().await;
        let adapter = ScriptedAdapter::full_window(vec![], None);
        f.orchestrator.run(&job(SyncType::Full), &adapter).await.unwrap();

        let events = f.notifier.events().await;
        assert!(events
            .iter()
            .any(|e| e.reason == EventKind::SyncComplete));
    }

    #[test]
    fn metadata_records_delta_downgrade() {
        let mut result = SyncJobResult::default();
        let at = Utc::now();
        annotate_cursor_metadata(&mut result, ProviderKind::Outlook, &Cursor::Timestamp { at });
        assert_eq!(result.metadata.get("deltaMode").map(String::as_str), Some("timestamp"));
        assert_eq!(
            result.metadata.get("lastSyncTimestamp"),
            Some(&at.to_rfc3339())
        );
    }
}
