//! Attachment reference operations.
//!
//! Each reference belongs to exactly one message and carries its storage
//! state as a tagged JSON column. The unique index on
//! `(message_id, external_attachment_id)` makes re-synced references
//! idempotent.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{AttachmentId, AttachmentRef, MessageId, StorageState};
use crate::storage::database::{Database, Result, StorageError};

/// Inserts references, skipping ones already recorded for the message.
///
/// Returns the number of rows actually inserted.
pub async fn insert_all(db: &Database, refs: Vec<AttachmentRef>) -> Result<usize> {
    if refs.is_empty() {
        return Ok(0);
    }

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0usize;

        for attachment in &refs {
            let external_attachment_id = external_attachment_id(&attachment.storage);
            let storage_json =
                serde_json::to_string(&attachment.storage).unwrap_or_default();

            inserted += tx.execute(
                r#"
                INSERT INTO attachments (
                    id, message_id, external_attachment_id, filename, mime_type,
                    size, is_inline, content_id, storage, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(message_id, external_attachment_id) DO NOTHING
                "#,
                params![
                    attachment.id.0,
                    attachment.message_id.0,
                    external_attachment_id,
                    attachment.filename,
                    attachment.mime_type,
                    attachment.size,
                    attachment.is_inline as i32,
                    attachment.content_id,
                    storage_json,
                    now,
                    now,
                ],
            )?;
        }

        Ok(inserted)
    })
    .await
}

/// Retrieves all references owned by a message.
pub async fn get_by_message(db: &Database, message_id: &MessageId) -> Result<Vec<AttachmentRef>> {
    let message_id = message_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, message_id, filename, mime_type, size, is_inline, content_id, storage
             FROM attachments WHERE message_id = ?1",
        )?;
        let rows = stmt.query_map([&message_id.0], row_to_attachment)?;
        let refs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(refs?)
    })
    .await
}

/// Retrieves one reference by id.
pub async fn get_by_id(db: &Database, attachment_id: &AttachmentId) -> Result<Option<AttachmentRef>> {
    let attachment_id = attachment_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, message_id, filename, mime_type, size, is_inline, content_id, storage
             FROM attachments WHERE id = ?1",
        )?;
        let result = stmt
            .query_row([&attachment_id.0], row_to_attachment)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Transitions a reference from pending to stored.
///
/// Idempotent: a reference that is already stored is left untouched (the
/// transition is one-way), and the call reports whether it changed state.
pub async fn mark_stored(
    db: &Database,
    attachment_id: &AttachmentId,
    blob_key: &str,
) -> Result<bool> {
    let attachment_id = attachment_id.clone();
    let blob_key = blob_key.to_string();

    db.with_conn(move |conn| {
        let current: Option<String> = conn
            .query_row(
                "SELECT storage FROM attachments WHERE id = ?1",
                [&attachment_id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StorageError::NotFound(format!(
                "attachment {}",
                attachment_id
            )));
        };
        let state: StorageState = serde_json::from_str(&current)
            .map_err(|e| StorageError::NotFound(format!("bad storage state: {}", e)))?;
        if state.is_stored() {
            return Ok(false);
        }

        let stored = StorageState::Stored {
            blob_key: blob_key.clone(),
        };
        let storage_json = serde_json::to_string(&stored).unwrap_or_default();
        conn.execute(
            "UPDATE attachments SET storage = ?1, updated_at = ?2 WHERE id = ?3",
            params![storage_json, Utc::now().to_rfc3339(), attachment_id.0],
        )?;
        Ok(true)
    })
    .await
}

/// Counts references owned by a message.
pub async fn count_for_message(db: &Database, message_id: &MessageId) -> Result<u64> {
    let message_id = message_id.clone();

    db.with_conn(move |conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM attachments WHERE message_id = ?1",
            [&message_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    })
    .await
}

/// The provider attachment id, used as the per-message dedup key. Stored
/// references keep the key they were created with.
fn external_attachment_id(storage: &StorageState) -> String {
    match storage {
        StorageState::Pending {
            external_attachment_id,
            ..
        } => external_attachment_id.clone(),
        StorageState::Stored { blob_key } => blob_key.clone(),
    }
}

fn row_to_attachment(row: &Row<'_>) -> std::result::Result<AttachmentRef, rusqlite::Error> {
    let storage_json: String = row.get(7)?;
    let storage: StorageState = serde_json::from_str(&storage_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(AttachmentRef {
        id: AttachmentId(row.get(0)?),
        message_id: MessageId(row.get(1)?),
        filename: row.get(2)?,
        mime_type: row.get(3)?,
        size: row.get(4)?,
        is_inline: row.get::<_, i32>(5)? != 0,
        content_id: row.get(6)?,
        storage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Address, Connection, ConnectionId, ExternalId, Folder, Message, ProviderKind,
        StatusMetadata, TenantId,
    };
    use crate::storage::queries::{connections, messages};
    use pretty_assertions::assert_eq;

    async fn db_with_message() -> (Database, MessageId) {
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

        let message = Message {
            id: MessageId::generate(),
            tenant_id: TenantId::from("tenant-1"),
            connection_id: ConnectionId::from("conn-1"),
            external_id: ExternalId::from("ext-1"),
            from: Address::new("alice@example.com"),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: None,
            snippet: String::new(),
            body_text: None,
            body_html: None,
            folder: Folder::Inbox,
            labels: vec![],
            is_read: false,
            is_starred: false,
            is_deleted: false,
            sent_at: Utc::now(),
            received_at: Utc::now(),
            size: None,
            status: StatusMetadata::active(),
            attachments: vec![],
        };
        let id = message.id.clone();
        messages::insert_batch(&db, vec![message]).await.unwrap();
        (db, id)
    }

    fn pending_ref(message_id: &MessageId, att_id: &str) -> AttachmentRef {
        AttachmentRef {
            id: AttachmentId::generate(),
            message_id: message_id.clone(),
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: 1024,
            is_inline: false,
            content_id: None,
            storage: StorageState::Pending {
                external_message_id: ExternalId::from("ext-1"),
                external_attachment_id: att_id.to_string(),
            },
        }
    }

    #[tokio::test]
    async fn insert_all_dedups_on_external_attachment_id() {
        let (db, message_id) = db_with_message().await;

        let first = insert_all(&db, vec![pending_ref(&message_id, "att-1")])
            .await
            .unwrap();
        assert_eq!(first, 1);

        // Re-sync of the same message: same provider attachment id, new row id.
        let second = insert_all(&db, vec![pending_ref(&message_id, "att-1")])
            .await
            .unwrap();
        assert_eq!(second, 0);

        assert_eq!(count_for_message(&db, &message_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_stored_is_one_way_idempotent() {
        let (db, message_id) = db_with_message().await;
        let reference = pending_ref(&message_id, "att-1");
        let attachment_id = reference.id.clone();
        insert_all(&db, vec![reference]).await.unwrap();

        let changed = mark_stored(&db, &attachment_id, "blob-1").await.unwrap();
        assert!(changed);

        // Second processing of a stored reference is a no-op.
        let changed_again = mark_stored(&db, &attachment_id, "blob-other").await.unwrap();
        assert!(!changed_again);

        let after = get_by_id(&db, &attachment_id).await.unwrap().unwrap();
        assert_eq!(
            after.storage,
            StorageState::Stored {
                blob_key: "blob-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn deleting_message_cascades_to_references() {
        let (db, message_id) = db_with_message().await;
        insert_all(&db, vec![pending_ref(&message_id, "att-1")])
            .await
            .unwrap();

        messages::delete(&db, &message_id).await.unwrap();
        assert_eq!(count_for_message(&db, &message_id).await.unwrap(), 0);
    }
}
