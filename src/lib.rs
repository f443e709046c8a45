//! mailflux - multi-provider mailbox synchronization engine
//!
//! Ingests mail from Gmail (history-cursor), Microsoft Graph (delta-link),
//! and IMAP (UID-sequence) providers into a normalized local store, and
//! keeps the two convergent under partial failure, rate limiting, and
//! provider-specific change-tracking semantics.
//!
//! # Architecture
//!
//! ```text
//! External job runner
//!          |
//!          v
//!   SyncOrchestrator ---- per job: full-window or incremental strategy
//!          |
//!          v
//!     MailAdapter  <-- Gmail / Graph / IMAP, behind the retry executor
//!          |
//!          v
//!  BatchUpsertProcessor + DeletionHandler --> SQLite store
//!          |
//!          v
//!  embedding queue / attachment blobs / realtime events (external)
//! ```

pub mod config;
pub mod domain;
pub mod external;
pub mod providers;
pub mod storage;
pub mod sync;
