//! Message and attachment domain types.
//!
//! A [`Message`] is the normalized local representation of one remote mail
//! message, keyed by `(connection_id, external_id)`. Deletion state is
//! carried twice on purpose: the `is_deleted` flag for cheap filtering and
//! the [`StatusMetadata`] record as the authoritative value; the two are
//! kept equal by construction (`is_deleted == (status == Deleted)`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, ConnectionId, ExternalId, Folder, MessageId, TenantId};

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Lifecycle status of a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Message is live in the mailbox.
    Active,
    /// Message is soft-deleted (trashed), row retained.
    Deleted,
}

/// Deletion-status record attached to every message.
///
/// `deleted_at` is set exactly once per deletion transition and cleared on
/// reactivation; [`StatusMetadata::merge`] is idempotent under repeated
/// application with the same target status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMetadata {
    /// Current status.
    pub status: MessageStatus,
    /// Instant of the deletion transition, if deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StatusMetadata {
    /// Metadata for a live message.
    pub fn active() -> Self {
        Self {
            status: MessageStatus::Active,
            deleted_at: None,
        }
    }

    /// Metadata for a message deleted at the given instant.
    pub fn deleted_at(when: DateTime<Utc>) -> Self {
        Self {
            status: MessageStatus::Deleted,
            deleted_at: Some(when),
        }
    }

    /// Merges an incoming status into this record.
    ///
    /// Merging `Deleted` sets `deleted_at` to `now` only if not already
    /// set; merging `Active` clears it. Pure and total: repeated merges
    /// with the same target status leave the record unchanged.
    pub fn merge(&self, incoming: MessageStatus, now: DateTime<Utc>) -> StatusMetadata {
        match incoming {
            MessageStatus::Deleted => StatusMetadata {
                status: MessageStatus::Deleted,
                deleted_at: Some(self.deleted_at.unwrap_or(now)),
            },
            MessageStatus::Active => StatusMetadata::active(),
        }
    }

    /// Whether this record marks the message deleted.
    pub fn is_deleted(&self) -> bool {
        self.status == MessageStatus::Deleted
    }
}

impl Default for StatusMetadata {
    fn default() -> Self {
        Self::active()
    }
}

/// Storage state of an attachment reference.
///
/// `Pending` carries enough identity to fetch the bytes on demand later;
/// `Stored` is an opaque key into the external blob store. The transition
/// `Pending → Stored` is one-way: re-processing a stored reference is a
/// no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum StorageState {
    /// Bytes not fetched yet; fetchable via the owning connection.
    Pending {
        /// Provider message id the attachment belongs to.
        external_message_id: ExternalId,
        /// Provider attachment id within that message.
        external_attachment_id: String,
    },
    /// Bytes uploaded to the blob store.
    Stored {
        /// Opaque blob store key.
        blob_key: String,
    },
}

impl StorageState {
    /// Whether the attachment bytes are already persisted.
    pub fn is_stored(&self) -> bool {
        matches!(self, StorageState::Stored { .. })
    }
}

/// A file attachment reference owned by exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Unique identifier for this reference.
    pub id: AttachmentId,
    /// Owning message row.
    pub message_id: MessageId,
    /// Original filename.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Size in bytes as reported by the provider.
    pub size: u64,
    /// Whether this is an inline attachment (e.g., embedded image).
    pub is_inline: bool,
    /// Content-ID header for inline references.
    pub content_id: Option<String>,
    /// Where the bytes live.
    pub storage: StorageState,
}

/// A normalized, locally stored mail message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Local row id.
    pub id: MessageId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Provider-assigned id, unique per connection.
    pub external_id: ExternalId,
    /// Sender address.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Blind carbon copy recipients.
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// Short preview of the content.
    pub snippet: String,
    /// Plain text body.
    pub body_text: Option<String>,
    /// HTML body.
    pub body_html: Option<String>,
    /// Canonical folder after normalization.
    pub folder: Folder,
    /// Raw provider labels, kept verbatim for round-tripping.
    pub labels: Vec<String>,
    /// Whether the message has been read.
    pub is_read: bool,
    /// Whether the message is starred/flagged.
    pub is_starred: bool,
    /// Whether the message is soft-deleted. Mirror of `status`.
    pub is_deleted: bool,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Message size in bytes, if the provider reports it.
    pub size: Option<u64>,
    /// Authoritative deletion-status record.
    pub status: StatusMetadata,
    /// Attachment references owned by this message.
    pub attachments: Vec<AttachmentRef>,
}

impl Message {
    /// Applies a status merge, keeping `is_deleted` in lockstep.
    pub fn apply_status(&mut self, incoming: MessageStatus, now: DateTime<Utc>) {
        self.status = self.status.merge(incoming, now);
        self.is_deleted = self.status.is_deleted();
        if self.is_deleted {
            self.folder = Folder::Trash;
        }
    }
}
