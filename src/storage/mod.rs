//! Local persistence layer.
//!
//! SQLite via rusqlite, wrapped for async use. The store is the only
//! shared mutable resource across concurrent sync runs; its unique keys
//! make upserts safe under concurrent writers for the same
//! `(connection_id, external_id)`.

pub mod database;
pub mod queries;
pub mod schema;

pub use database::{Database, Result, StorageError};
