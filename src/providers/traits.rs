//! Mail adapter trait and shared provider types.
//!
//! Each remote protocol family implements [`MailAdapter`]; the sync
//! orchestrator composes an adapter with the batch processor and deletion
//! handler by dependency injection. Adapters share no state; common
//! behavior lives in free functions and the retry executor.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Address, Cursor, ExternalId, Folder, ProviderKind};

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur against a remote mailbox provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Authentication failed or credentials expired. Fatal for the run.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rate limit exceeded (HTTP 429).
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if the provider said.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found (HTTP 404/410).
    #[error("not found: {0}")]
    NotFound(String),

    /// The stored cursor is no longer usable; a full resync is required.
    #[error("cursor expired: {0}")]
    CursorExpired(String),

    /// The account does not support this change-tracking capability.
    /// Causes a permanent mode downgrade, never a job failure.
    #[error("capability unsupported: {0}")]
    Unsupported(String),

    /// Any other HTTP-level error, with its status code.
    #[error("provider returned {status}: {message}")]
    Http { status: u16, message: String },

    /// A single message could not be parsed. Isolated per item.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Internal error (serialization, unexpected shape).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// The HTTP status this error corresponds to, when there is one.
    ///
    /// The retry executor classifies on this: 429 and 5xx retry, anything
    /// else rethrows.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::RateLimited { .. } => Some(429),
            ProviderError::NotFound(_) => Some(404),
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Maps an HTTP status + body to the matching error variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ProviderError::Authentication(message),
            404 | 410 => ProviderError::NotFound(message),
            429 => ProviderError::RateLimited {
                retry_after_secs: None,
            },
            _ => ProviderError::Http { status, message },
        }
    }
}

/// An attachment as reported by the provider, bytes not fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAttachment {
    /// Provider attachment id within the owning message.
    pub external_attachment_id: String,
    /// Original filename.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Whether this is an inline attachment.
    pub is_inline: bool,
    /// Content-ID header, for inline references.
    pub content_id: Option<String>,
}

/// A message as parsed from one provider fetch, pre-normalization of ids.
///
/// This is the unit the batch upsert processor consumes; the canonical
/// folder is already resolved from the provider's labels/folder signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMessage {
    /// Provider-assigned message id.
    pub external_id: ExternalId,
    /// Sender.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// CC recipients.
    pub cc: Vec<Address>,
    /// BCC recipients.
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// Short content preview.
    pub snippet: String,
    /// Plain text body.
    pub body_text: Option<String>,
    /// HTML body.
    pub body_html: Option<String>,
    /// Raw provider labels.
    pub labels: Vec<String>,
    /// Canonical folder.
    pub folder: Folder,
    /// Read flag.
    pub is_read: bool,
    /// Starred/flagged flag.
    pub is_starred: bool,
    /// Send instant.
    pub sent_at: DateTime<Utc>,
    /// Receipt instant.
    pub received_at: DateTime<Utc>,
    /// Size in bytes, if reported.
    pub size: Option<u64>,
    /// Attachments reported on the message.
    pub attachments: Vec<ParsedAttachment>,
}

/// A removal signal from the provider's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedMessage {
    /// Provider message id.
    pub external_id: ExternalId,
    /// Whether the removal event unambiguously means permanent deletion
    /// (drives hard delete instead of trash convergence).
    pub permanent: bool,
}

/// Changes collected from one incremental fetch.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Newly seen messages, fully fetched.
    pub added: Vec<ParsedMessage>,
    /// Existing messages with label/flag/folder drift, refetched.
    pub updated: Vec<ParsedMessage>,
    /// Removal signals.
    pub removed: Vec<RemovedMessage>,
    /// True when a page cap stopped the walk early; the remainder is left
    /// for the next scheduled run.
    pub truncated: bool,
}

impl ChangeSet {
    /// Total number of change entries.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Whether the fetch found nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One remote protocol family.
///
/// `fetch_changes` and `fetch_full_window` both return the successor
/// cursor; `fetch_full_window` may return `None` when cursor establishment
/// failed, in which case the orchestrator degrades to a timestamp cursor
/// rather than failing the job.
#[async_trait]
pub trait MailAdapter: Send + Sync {
    /// Which protocol family this adapter speaks.
    fn kind(&self) -> ProviderKind;

    /// Replays remote changes since the cursor.
    async fn fetch_changes(&self, cursor: &Cursor) -> Result<(ChangeSet, Cursor)>;

    /// Fetches the most recent `limit` messages, newest first, across
    /// pages. Explicitly not exhaustive history.
    async fn fetch_full_window(&self, limit: usize)
        -> Result<(Vec<ParsedMessage>, Option<Cursor>)>;

    /// Fetches a single message; `None` when the remote reports it gone.
    async fn fetch_message(&self, external_id: &ExternalId) -> Result<Option<ParsedMessage>>;

    /// Downloads attachment bytes; `None` when the remote reports it gone.
    async fn download_attachment(
        &self,
        external_message_id: &ExternalId,
        external_attachment_id: &str,
    ) -> Result<Option<Bytes>>;
}
