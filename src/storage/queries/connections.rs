//! Connection row operations.
//!
//! The cursor column is the engine's only incremental-sync resume state.
//! It is written exclusively by [`update_cursor`] at the end of a
//! successful pass, which enforces the no-regression invariant, and by
//! [`reset_cursor`] for the explicit-reset path.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::domain::{Connection, ConnectionId, Cursor, ProviderKind, TenantId};
use crate::storage::database::{Database, Result, StorageError};

/// Inserts or updates a connection row (cursor untouched on update).
pub async fn upsert(db: &Database, connection: &Connection) -> Result<()> {
    let connection = connection.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO connections (id, tenant_id, email, provider_kind, cursor, last_synced_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id,
                email = excluded.email,
                provider_kind = excluded.provider_kind,
                updated_at = excluded.updated_at
            "#,
            params![
                connection.id.0,
                connection.tenant_id.0,
                connection.email,
                provider_kind_str(connection.provider_kind),
                connection.cursor.as_ref().map(|c| c.encode()),
                connection.last_synced_at.map(|d| d.to_rfc3339()),
                now,
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a connection by id.
pub async fn get(db: &Database, connection_id: &ConnectionId) -> Result<Option<Connection>> {
    let connection_id = connection_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, email, provider_kind, cursor, last_synced_at
             FROM connections WHERE id = ?1",
        )?;
        let result = stmt
            .query_row([&connection_id.0], row_to_connection)
            .optional()?;
        Ok(result)
    })
    .await
}

/// Commits a new cursor at the end of a successful sync pass.
///
/// Rejects regressions: the new cursor must be a legal successor of the
/// stored one (use [`reset_cursor`] for the explicit-reset path).
pub async fn update_cursor(
    db: &Database,
    connection_id: &ConnectionId,
    cursor: &Cursor,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    let connection_id = connection_id.clone();
    let cursor = cursor.clone();

    db.with_conn(move |conn| {
        let stored: Option<String> = conn
            .query_row(
                "SELECT cursor FROM connections WHERE id = ?1",
                [&connection_id.0],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("connection {}", connection_id)))?;

        if let Some(previous) = stored.as_deref().and_then(Cursor::decode) {
            if !previous.accepts_successor(&cursor) {
                return Err(StorageError::CursorRegression(format!(
                    "connection {}: {} -> {}",
                    connection_id,
                    previous.token(),
                    cursor.token()
                )));
            }
        }

        conn.execute(
            "UPDATE connections SET cursor = ?1, last_synced_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                cursor.encode(),
                synced_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                connection_id.0
            ],
        )?;
        Ok(())
    })
    .await
}

/// Clears the cursor (explicit reset, e.g. an expired history id).
pub async fn reset_cursor(db: &Database, connection_id: &ConnectionId) -> Result<()> {
    let connection_id = connection_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE connections SET cursor = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), connection_id.0],
        )?;
        Ok(())
    })
    .await
}

fn provider_kind_str(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Gmail => "gmail",
        ProviderKind::Outlook => "outlook",
        ProviderKind::Imap => "imap",
    }
}

fn row_to_connection(row: &Row<'_>) -> std::result::Result<Connection, rusqlite::Error> {
    let kind_raw: String = row.get(3)?;
    let provider_kind = match kind_raw.as_str() {
        "gmail" => ProviderKind::Gmail,
        "outlook" => ProviderKind::Outlook,
        _ => ProviderKind::Imap,
    };
    let cursor_raw: Option<String> = row.get(4)?;
    let last_synced_raw: Option<String> = row.get(5)?;

    Ok(Connection {
        id: ConnectionId(row.get(0)?),
        tenant_id: TenantId(row.get(1)?),
        email: row.get(2)?,
        provider_kind,
        cursor: cursor_raw.as_deref().and_then(Cursor::decode),
        last_synced_at: last_synced_raw
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gmail_connection() -> Connection {
        Connection::new(
            ConnectionId::from("conn-1"),
            TenantId::from("tenant-1"),
            "user@example.com",
            ProviderKind::Gmail,
        )
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        upsert(&db, &gmail_connection()).await.unwrap();

        let loaded = get(&db, &ConnectionId::from("conn-1")).await.unwrap().unwrap();
        assert_eq!(loaded.email, "user@example.com");
        assert_eq!(loaded.provider_kind, ProviderKind::Gmail);
        assert!(loaded.cursor.is_none());
    }

    #[tokio::test]
    async fn update_cursor_commits_successor() {
        let db = Database::open_in_memory().await.unwrap();
        upsert(&db, &gmail_connection()).await.unwrap();

        let first = Cursor::HistoryId {
            value: "100".to_string(),
        };
        update_cursor(&db, &ConnectionId::from("conn-1"), &first, Utc::now())
            .await
            .unwrap();

        let second = Cursor::HistoryId {
            value: "250".to_string(),
        };
        update_cursor(&db, &ConnectionId::from("conn-1"), &second, Utc::now())
            .await
            .unwrap();

        let loaded = get(&db, &ConnectionId::from("conn-1")).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, Some(second));
        assert!(loaded.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn update_cursor_rejects_regression() {
        let db = Database::open_in_memory().await.unwrap();
        upsert(&db, &gmail_connection()).await.unwrap();

        let ahead = Cursor::HistoryId {
            value: "500".to_string(),
        };
        update_cursor(&db, &ConnectionId::from("conn-1"), &ahead, Utc::now())
            .await
            .unwrap();

        let behind = Cursor::HistoryId {
            value: "100".to_string(),
        };
        let result = update_cursor(&db, &ConnectionId::from("conn-1"), &behind, Utc::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reset_cursor_allows_fresh_start() {
        let db = Database::open_in_memory().await.unwrap();
        upsert(&db, &gmail_connection()).await.unwrap();

        let ahead = Cursor::HistoryId {
            value: "500".to_string(),
        };
        update_cursor(&db, &ConnectionId::from("conn-1"), &ahead, Utc::now())
            .await
            .unwrap();

        reset_cursor(&db, &ConnectionId::from("conn-1")).await.unwrap();
        let loaded = get(&db, &ConnectionId::from("conn-1")).await.unwrap().unwrap();
        assert!(loaded.cursor.is_none());

        // After the reset, an "earlier" cursor is legal again.
        let behind = Cursor::HistoryId {
            value: "100".to_string(),
        };
        update_cursor(&db, &ConnectionId::from("conn-1"), &behind, Utc::now())
            .await
            .unwrap();
    }
}
