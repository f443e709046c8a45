//! Interfaces to external collaborators.
//!
//! The engine's boundary: credential acquisition, the downstream embedding
//! pipeline, the realtime notification channel, and attachment object
//! storage. Each collaborator is a trait plus an in-memory implementation
//! usable in tests here and downstream.

mod blobs;
mod credentials;
mod embedding;
mod notify;

pub use blobs::{BlobStore, MemoryBlobStore};
pub use credentials::{Credential, CredentialSource, StaticCredentials};
pub use embedding::{EmbeddingJob, EmbeddingSink, MemoryEmbeddingSink};
pub use notify::{CoalescingNotifier, EventKind, MemoryNotifier, Notifier, SyncEvent};
