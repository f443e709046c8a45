//! Message row operations.
//!
//! Messages are keyed by `(connection_id, external_id)`; every write path
//! goes through that unique index so concurrent runs for the same
//! connection cannot duplicate rows. Reads return messages with an empty
//! `attachments` list; attachment references live in their own table and
//! are loaded via [`super::attachments`].

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{
    Address, ConnectionId, ExternalId, Folder, Message, MessageId, MessageStatus, StatusMetadata,
    TenantId,
};
use crate::storage::database::{Database, Result};

/// Inserts a batch of new messages, duplicate-safe.
///
/// A row that already exists (a race against another run, or a provider
/// page overlap) is skipped silently. Returns the number of rows actually
/// inserted.
pub async fn insert_batch(db: &Database, messages: Vec<Message>) -> Result<usize> {
    if messages.is_empty() {
        return Ok(0);
    }

    db.transaction(move |tx| {
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0usize;

        for message in &messages {
            let to_json = serde_json::to_string(&message.to).unwrap_or_default();
            let cc_json = serde_json::to_string(&message.cc).unwrap_or_default();
            let bcc_json = serde_json::to_string(&message.bcc).unwrap_or_default();
            let labels_json = serde_json::to_string(&message.labels).unwrap_or_default();

            let changed = tx.execute(
                r#"
                INSERT INTO messages (
                    id, tenant_id, connection_id, external_id,
                    from_address, from_name, to_addresses, cc_addresses, bcc_addresses,
                    subject, snippet, body_text, body_html,
                    folder, labels, is_read, is_starred, is_deleted,
                    sent_at, received_at, size, status, deleted_at,
                    created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4,
                    ?5, ?6, ?7, ?8, ?9,
                    ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18,
                    ?19, ?20, ?21, ?22, ?23,
                    ?24, ?25
                )
                ON CONFLICT(connection_id, external_id) DO NOTHING
                "#,
                params![
                    message.id.0,
                    message.tenant_id.0,
                    message.connection_id.0,
                    message.external_id.0,
                    message.from.email,
                    message.from.name,
                    to_json,
                    cc_json,
                    bcc_json,
                    message.subject,
                    message.snippet,
                    message.body_text,
                    message.body_html,
                    message.folder.as_str(),
                    labels_json,
                    message.is_read as i32,
                    message.is_starred as i32,
                    message.is_deleted as i32,
                    message.sent_at.to_rfc3339(),
                    message.received_at.to_rfc3339(),
                    message.size,
                    status_str(message.status.status),
                    message.status.deleted_at.map(|d| d.to_rfc3339()),
                    now,
                    now,
                ],
            )?;
            inserted += changed;
        }

        Ok(inserted)
    })
    .await
}

/// Overwrites the mutable fields of an existing row from a fresh fetch.
///
/// Last-write-wins on labels, folder, flags, bodies, and status; the local
/// id and creation timestamp are untouched.
pub async fn update_from_fetch(db: &Database, message: Message) -> Result<()> {
    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        let to_json = serde_json::to_string(&message.to).unwrap_or_default();
        let cc_json = serde_json::to_string(&message.cc).unwrap_or_default();
        let bcc_json = serde_json::to_string(&message.bcc).unwrap_or_default();
        let labels_json = serde_json::to_string(&message.labels).unwrap_or_default();

        conn.execute(
            r#"
            UPDATE messages SET
                from_address = ?1, from_name = ?2,
                to_addresses = ?3, cc_addresses = ?4, bcc_addresses = ?5,
                subject = ?6, snippet = ?7, body_text = ?8, body_html = ?9,
                folder = ?10, labels = ?11,
                is_read = ?12, is_starred = ?13, is_deleted = ?14,
                sent_at = ?15, received_at = ?16, size = ?17,
                status = ?18, deleted_at = ?19, updated_at = ?20
            WHERE connection_id = ?21 AND external_id = ?22
            "#,
            params![
                message.from.email,
                message.from.name,
                to_json,
                cc_json,
                bcc_json,
                message.subject,
                message.snippet,
                message.body_text,
                message.body_html,
                message.folder.as_str(),
                labels_json,
                message.is_read as i32,
                message.is_starred as i32,
                message.is_deleted as i32,
                message.sent_at.to_rfc3339(),
                message.received_at.to_rfc3339(),
                message.size,
                status_str(message.status.status),
                message.status.deleted_at.map(|d| d.to_rfc3339()),
                now,
                message.connection_id.0,
                message.external_id.0,
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves the rows matching a set of external ids for one connection.
pub async fn get_by_external_ids(
    db: &Database,
    connection_id: &ConnectionId,
    external_ids: Vec<ExternalId>,
) -> Result<Vec<Message>> {
    if external_ids.is_empty() {
        return Ok(Vec::new());
    }
    let connection_id = connection_id.clone();

    db.with_conn(move |conn| {
        let placeholders = vec!["?"; external_ids.len()].join(",");
        let sql = format!(
            "{} WHERE connection_id = ? AND external_id IN ({})",
            SELECT_MESSAGE, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;

        let mut args: Vec<String> = Vec::with_capacity(external_ids.len() + 1);
        args.push(connection_id.0);
        args.extend(external_ids.into_iter().map(|id| id.0));

        let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// Retrieves one row by its connection-scoped external id.
pub async fn get_by_external_id(
    db: &Database,
    connection_id: &ConnectionId,
    external_id: &ExternalId,
) -> Result<Option<Message>> {
    let connection_id = connection_id.clone();
    let external_id = external_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "{} WHERE connection_id = ?1 AND external_id = ?2",
            SELECT_MESSAGE
        );
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt
            .query_row(params![connection_id.0, external_id.0], row_to_message)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves one row by local id.
pub async fn get_by_id(db: &Database, message_id: &MessageId) -> Result<Option<Message>> {
    let message_id = message_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{} WHERE id = ?1", SELECT_MESSAGE);
        let mut stmt = conn.prepare(&sql)?;
        let result = stmt
            .query_row([&message_id.0], row_to_message)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Applies a deletion-status record to a row, keeping the folder and the
/// `is_deleted` flag in lockstep with the status.
pub async fn apply_status(
    db: &Database,
    message_id: &MessageId,
    status: StatusMetadata,
) -> Result<()> {
    let message_id = message_id.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        if status.is_deleted() {
            conn.execute(
                "UPDATE messages SET is_deleted = 1, folder = 'TRASH', status = 'deleted',
                 deleted_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    status.deleted_at.map(|d| d.to_rfc3339()),
                    now,
                    message_id.0
                ],
            )?;
        } else {
            conn.execute(
                "UPDATE messages SET is_deleted = 0, status = 'active', deleted_at = NULL,
                 updated_at = ?1 WHERE id = ?2",
                params![now, message_id.0],
            )?;
        }
        Ok(())
    })
    .await
}

/// Hard-deletes a row. Attachment references cascade.
pub async fn delete(db: &Database, message_id: &MessageId) -> Result<()> {
    let message_id = message_id.clone();

    db.with_conn(move |conn| {
        conn.execute("DELETE FROM messages WHERE id = ?1", [&message_id.0])?;
        Ok(())
    })
    .await
}

/// Counts rows for a connection.
pub async fn count_for_connection(db: &Database, connection_id: &ConnectionId) -> Result<u64> {
    let connection_id = connection_id.clone();

    db.with_conn(move |conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE connection_id = ?1",
            [&connection_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    })
    .await
}

const SELECT_MESSAGE: &str = r#"
SELECT
    id, tenant_id, connection_id, external_id,
    from_address, from_name, to_addresses, cc_addresses, bcc_addresses,
    subject, snippet, body_text, body_html,
    folder, labels, is_read, is_starred, is_deleted,
    sent_at, received_at, size, status, deleted_at
FROM messages
"#;

fn status_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Active => "active",
        MessageStatus::Deleted => "deleted",
    }
}

fn parse_instant(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_message(row: &Row<'_>) -> std::result::Result<Message, rusqlite::Error> {
    let to_json: String = row.get(6)?;
    let cc_json: Option<String> = row.get(7)?;
    let bcc_json: Option<String> = row.get(8)?;
    let labels_json: Option<String> = row.get(14)?;

    let to: Vec<Address> = serde_json::from_str(&to_json).unwrap_or_default();
    let cc: Vec<Address> = cc_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let bcc: Vec<Address> = bcc_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let labels: Vec<String> = labels_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    let from_name: Option<String> = row.get(5)?;
    let folder_str: String = row.get(13)?;
    let status_raw: String = row.get(21)?;
    let deleted_at_raw: Option<String> = row.get(22)?;

    let status = StatusMetadata {
        status: if status_raw == "deleted" {
            MessageStatus::Deleted
        } else {
            MessageStatus::Active
        },
        deleted_at: deleted_at_raw.map(parse_instant),
    };

    Ok(Message {
        id: MessageId(row.get(0)?),
        tenant_id: TenantId(row.get(1)?),
        connection_id: ConnectionId(row.get(2)?),
        external_id: ExternalId(row.get(3)?),
        from: Address {
            email: row.get(4)?,
            name: from_name,
        },
        to,
        cc,
        bcc,
        subject: row.get(9)?,
        snippet: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        body_text: row.get(11)?,
        body_html: row.get(12)?,
        folder: Folder::from_canonical(&folder_str),
        labels,
        is_read: row.get::<_, i32>(15)? != 0,
        is_starred: row.get::<_, i32>(16)? != 0,
        is_deleted: row.get::<_, i32>(17)? != 0,
        sent_at: parse_instant(row.get(18)?),
        received_at: parse_instant(row.get(19)?),
        size: row.get(20)?,
        status,
        attachments: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::connections;
    use crate::domain::{Connection, ProviderKind};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
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
        db
    }

    fn message(external_id: &str) -> Message {
        Message {
            id: MessageId::generate(),
            tenant_id: TenantId::from("tenant-1"),
            connection_id: ConnectionId::from("conn-1"),
            external_id: ExternalId::from(external_id),
            from: Address::with_name("alice@example.com", "Alice"),
            to: vec![Address::new("bob@example.com")],
            cc: vec![],
            bcc: vec![],
            subject: Some("Subject".to_string()),
            snippet: "Preview".to_string(),
            body_text: Some("Body".to_string()),
            body_html: None,
            folder: Folder::Inbox,
            labels: vec!["INBOX".to_string()],
            is_read: false,
            is_starred: false,
            is_deleted: false,
            sent_at: Utc::now(),
            received_at: Utc::now(),
            size: Some(1024),
            status: StatusMetadata::active(),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn insert_batch_skips_duplicates() {
        let db = test_db().await;

        let first = insert_batch(&db, vec![message("ext-1"), message("ext-2")])
            .await
            .unwrap();
        assert_eq!(first, 2);

        // Same external ids again: nothing inserted, no error raised.
        let second = insert_batch(&db, vec![message("ext-1"), message("ext-3")])
            .await
            .unwrap();
        assert_eq!(second, 1);

        let count = count_for_connection(&db, &ConnectionId::from("conn-1"))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn get_by_external_ids_returns_matches_only() {
        let db = test_db().await;
        insert_batch(&db, vec![message("ext-1"), message("ext-2")])
            .await
            .unwrap();

        let found = get_by_external_ids(
            &db,
            &ConnectionId::from("conn-1"),
            vec![
                ExternalId::from("ext-1"),
                ExternalId::from("ext-2"),
                ExternalId::from("ext-unknown"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn update_from_fetch_overwrites_mutable_fields() {
        let db = test_db().await;
        insert_batch(&db, vec![message("ext-1")]).await.unwrap();

        let mut updated = message("ext-1");
        updated.folder = Folder::Promotions;
        updated.labels = vec!["INBOX".to_string(), "CATEGORY_PROMOTIONS".to_string()];
        updated.is_read = true;
        update_from_fetch(&db, updated).await.unwrap();

        let row = get_by_external_id(
            &db,
            &ConnectionId::from("conn-1"),
            &ExternalId::from("ext-1"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(row.folder, Folder::Promotions);
        assert!(row.is_read);
        assert_eq!(row.labels.len(), 2);
    }

    #[tokio::test]
    async fn apply_status_deleted_moves_to_trash() {
        let db = test_db().await;
        insert_batch(&db, vec![message("ext-1")]).await.unwrap();
        let row = get_by_external_id(
            &db,
            &ConnectionId::from("conn-1"),
            &ExternalId::from("ext-1"),
        )
        .await
        .unwrap()
        .unwrap();

        let deleted = StatusMetadata::deleted_at(Utc::now());
        apply_status(&db, &row.id, deleted.clone()).await.unwrap();

        let after = get_by_id(&db, &row.id).await.unwrap().unwrap();
        assert!(after.is_deleted);
        assert_eq!(after.folder, Folder::Trash);
        assert_eq!(after.status.status, MessageStatus::Deleted);
        assert!(after.status.deleted_at.is_some());
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let db = test_db().await;
        insert_batch(&db, vec![message("ext-1")]).await.unwrap();
        let row = get_by_external_id(
            &db,
            &ConnectionId::from("conn-1"),
            &ExternalId::from("ext-1"),
        )
        .await
        .unwrap()
        .unwrap();

        delete(&db, &row.id).await.unwrap();
        assert!(get_by_id(&db, &row.id).await.unwrap().is_none());
    }
}
