//! Database query modules, one per entity.

pub mod attachments;
pub mod connections;
pub mod messages;
