//! SQL schema definitions as const strings.
//!
//! The unique index on `messages (connection_id, external_id)` is the
//! engine's dedup key: concurrent runs for the same connection converge
//! through it instead of through locks.

/// SQL to create the connections table.
pub const CREATE_CONNECTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    email TEXT NOT NULL,
    provider_kind TEXT NOT NULL,
    cursor TEXT,
    last_synced_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the messages table.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    connection_id TEXT NOT NULL REFERENCES connections(id),
    external_id TEXT NOT NULL,
    from_address TEXT NOT NULL,
    from_name TEXT,
    to_addresses TEXT NOT NULL,
    cc_addresses TEXT,
    bcc_addresses TEXT,
    subject TEXT,
    snippet TEXT,
    body_text TEXT,
    body_html TEXT,
    folder TEXT NOT NULL,
    labels TEXT,
    is_read INTEGER DEFAULT 0,
    is_starred INTEGER DEFAULT 0,
    is_deleted INTEGER DEFAULT 0,
    sent_at TEXT NOT NULL,
    received_at TEXT NOT NULL,
    size INTEGER,
    status TEXT NOT NULL DEFAULT 'active',
    deleted_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_connection_external
    ON messages(connection_id, external_id);
CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(connection_id, folder)
"#;

/// SQL to create the attachments table.
pub const CREATE_ATTACHMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    external_attachment_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    is_inline INTEGER DEFAULT 0,
    content_id TEXT,
    storage TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create attachment indexes.
pub const CREATE_ATTACHMENT_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_message_external
    ON attachments(message_id, external_attachment_id);
CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)
"#;

/// Returns all migrations in execution order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_CONNECTIONS,
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_ATTACHMENTS,
        CREATE_ATTACHMENT_INDEXES,
    ]
}
