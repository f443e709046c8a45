//! Sync job intake and result types.
//!
//! These are the payloads exchanged with the external job runner. They are
//! ephemeral: the core never persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ConnectionId, ProviderKind, TenantId};

/// Requested sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Capped newest-first window fetch; establishes a cursor.
    Full,
    /// Cursor-driven change replay.
    Incremental,
}

/// Job priority as assigned by the external queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// A sync job consumed from the external queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Connection to sync.
    pub connection_id: ConnectionId,
    /// Remote protocol family.
    pub provider_kind: ProviderKind,
    /// Mailbox address, for logging.
    pub email: String,
    /// Queue priority.
    #[serde(default)]
    pub priority: SyncPriority,
    /// Requested strategy.
    pub sync_type: SyncType,
    /// End instant of the previous successful run, if any.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Result summary produced for the external job runner.
///
/// `metadata` carries provider-specific cursor-mode updates (delta mode
/// downgrade, timestamp watermark) that the caller must persist onto the
/// connection before the next run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncJobResult {
    /// Whether the run completed without a fatal error.
    pub success: bool,
    /// Total messages seen this run (created + updated + deletion-handled).
    pub messages_processed: usize,
    /// Messages created on first sight.
    pub new_messages: usize,
    /// Non-fatal per-item errors captured during the run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Wall-clock duration of the run.
    pub sync_duration_ms: u64,
    /// Cursor token committed at the end of the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_token: Option<String>,
    /// Provider-specific updates for the caller to persist.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SyncJobResult {
    /// Marks the result successful and attaches the committed cursor token.
    pub fn succeeded(mut self, token: Option<String>) -> Self {
        self.success = true;
        self.last_sync_token = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sync_job_deserializes_with_default_priority() {
        let json = r#"{
            "tenant_id": "tenant-1",
            "connection_id": "conn-1",
            "provider_kind": "gmail",
            "email": "user@example.com",
            "sync_type": "full",
            "last_synced_at": null
        }"#;
        let job: SyncJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.priority, SyncPriority::Normal);
        assert_eq!(job.sync_type, SyncType::Full);
        assert_eq!(job.provider_kind, ProviderKind::Gmail);
    }

    #[test]
    fn result_serialization_skips_empty_fields() {
        let result = SyncJobResult {
            success: true,
            messages_processed: 5,
            new_messages: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("errors"));
        assert!(!json.contains("metadata"));
        assert!(!json.contains("last_sync_token"));
    }

    #[test]
    fn succeeded_attaches_token() {
        let result = SyncJobResult::default().succeeded(Some("1834002".to_string()));
        assert!(result.success);
        assert_eq!(result.last_sync_token.as_deref(), Some("1834002"));
    }
}
