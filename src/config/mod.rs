//! Engine configuration.

mod settings;

pub use settings::{AttachmentConfig, RetryConfig, SyncConfig};
