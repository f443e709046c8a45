//! Sync engine configuration types.
//!
//! All knobs are plain immutable values constructed once and passed to the
//! components that need them; nothing here is mutated after startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry behavior for transient provider errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay for HTTP 429 responses; scaled linearly by attempt index.
    pub base_429_ms: u64,
    /// Base delay for HTTP 5xx responses; scaled linearly by attempt index.
    pub base_5xx_ms: u64,
}

impl RetryConfig {
    /// Base delay for a 429 as a [`Duration`].
    pub fn base_429(&self) -> Duration {
        Duration::from_millis(self.base_429_ms)
    }

    /// Base delay for a 5xx as a [`Duration`].
    pub fn base_5xx(&self) -> Duration {
        Duration::from_millis(self.base_5xx_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_429_ms: 2_000,
            base_5xx_ms: 1_000,
        }
    }
}

/// Attachment-handling decision policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Largest attachment fetched eagerly during sync.
    pub max_eager_bytes: u64,
    /// MIME types considered text-extractable documents, fetched eagerly.
    pub eager_mime_types: Vec<String>,
}

impl AttachmentConfig {
    /// Whether this MIME type qualifies for eager fetch.
    pub fn is_eager_mime(&self, mime_type: &str) -> bool {
        let mime = mime_type.to_lowercase();
        self.eager_mime_types.iter().any(|m| m == &mime)
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_eager_bytes: 2 * 1024 * 1024,
            eager_mime_types: vec![
                "application/pdf".to_string(),
                "application/msword".to_string(),
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
                "text/plain".to_string(),
                "text/csv".to_string(),
                "text/markdown".to_string(),
            ],
        }
    }
}

/// Top-level sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Cap on messages fetched by a full-window sync, newest first.
    pub full_window_cap: usize,
    /// Cap on change pages walked in one incremental run (history-cursor
    /// and delta-link providers). Over-cap runs stop early and leave the
    /// remainder for the next scheduled run.
    pub max_change_pages: usize,
    /// External ids fetched per batch request.
    pub fetch_batch_size: usize,
    /// Bound on concurrent single-message fetches within one run.
    pub fetch_concurrency: usize,
    /// Retry behavior for transient provider errors.
    pub retry: RetryConfig,
    /// Attachment-handling policy.
    pub attachments: AttachmentConfig,
    /// Window over which the notifier coalesces duplicate events.
    pub notify_coalesce_ms: u64,
}

impl SyncConfig {
    /// Coalescing window as a [`Duration`].
    pub fn notify_coalesce_window(&self) -> Duration {
        Duration::from_millis(self.notify_coalesce_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_window_cap: 200,
            max_change_pages: 25,
            fetch_batch_size: 50,
            fetch_concurrency: 8,
            retry: RetryConfig::default(),
            attachments: AttachmentConfig::default(),
            notify_coalesce_ms: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_caps() {
        let config = SyncConfig::default();
        assert_eq!(config.full_window_cap, 200);
        assert_eq!(config.max_change_pages, 25);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn eager_mime_check_is_case_insensitive() {
        let config = AttachmentConfig::default();
        assert!(config.is_eager_mime("Application/PDF"));
        assert!(config.is_eager_mime("text/plain"));
        assert!(!config.is_eager_mime("image/png"));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SyncConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.fetch_batch_size, config.fetch_batch_size);
        assert_eq!(back.retry.base_429_ms, config.retry.base_429_ms);
    }
}
