//! Domain types shared across the sync engine.
//!
//! Identifier newtypes, the normalized [`Message`] model, connection and
//! cursor state, the canonical [`Folder`] vocabulary, and the job payloads
//! exchanged with the external queue.

mod connection;
mod folder;
mod job;
mod message;
mod types;

pub use connection::{Connection, Cursor, DeltaMode, ProviderKind};
pub use folder::Folder;
pub use job::{SyncJob, SyncJobResult, SyncPriority, SyncType};
pub use message::{Address, AttachmentRef, Message, MessageStatus, StatusMetadata, StorageState};
pub use types::{AttachmentId, ConnectionId, ExternalId, MessageId, TenantId};
