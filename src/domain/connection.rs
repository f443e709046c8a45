//! Connection and sync-cursor types.
//!
//! A [`Connection`] is one remote mailbox credential set scoped to a tenant.
//! Its [`Cursor`] is the sole source of incremental-sync resume state and is
//! mutated only by the sync orchestrator at the end of a successful pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{ConnectionId, TenantId};

/// Which remote protocol family a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gmail REST API; change tracking via monotonically increasing history ids.
    Gmail,
    /// Microsoft Graph; change tracking via delta links, with a timestamp
    /// fallback for accounts that do not support it.
    Outlook,
    /// IMAP; change detection via UID watermarks against a single mailbox.
    Imap,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Outlook => "outlook",
            ProviderKind::Imap => "imap",
        };
        write!(f, "{}", s)
    }
}

/// Sub-mode of the delta-link cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    /// Native change tracking via a delta token.
    Delta,
    /// Fallback: query filtered by "received since X". Entered permanently
    /// when the account signals change tracking is unsupported.
    Timestamp,
}

/// Opaque resume token marking "everything up to here has been synced".
///
/// Never regresses except on explicit reset (provider signals the stored
/// cursor is no longer usable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Gmail history id. Numerically increasing, stored as the opaque
    /// string the API returns.
    HistoryId { value: String },
    /// Graph delta link (or, in timestamp mode, unused link with the
    /// timestamp carried separately via `Cursor::Timestamp`).
    DeltaLink { link: String, mode: DeltaMode },
    /// IMAP UID watermark; all UIDs <= watermark have been synced.
    UidWatermark { uid: u32 },
    /// "Received since" watermark for timestamp-mode incremental sync.
    Timestamp { at: DateTime<Utc> },
}

impl Cursor {
    /// Serializes the cursor to its stored JSON form.
    pub fn encode(&self) -> String {
        // Cursor variants are plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a cursor from its stored JSON form.
    pub fn decode(raw: &str) -> Option<Cursor> {
        serde_json::from_str(raw).ok()
    }

    /// A short loggable token for job results.
    pub fn token(&self) -> String {
        match self {
            Cursor::HistoryId { value } => value.clone(),
            Cursor::DeltaLink { link, .. } => link.clone(),
            Cursor::UidWatermark { uid } => uid.to_string(),
            Cursor::Timestamp { at } => at.to_rfc3339(),
        }
    }

    /// Whether `next` is a legal successor of `self` without an explicit
    /// reset. History ids and UID watermarks must not move backwards;
    /// timestamps must not regress; delta links are opaque and always
    /// accepted.
    pub fn accepts_successor(&self, next: &Cursor) -> bool {
        match (self, next) {
            (Cursor::HistoryId { value: a }, Cursor::HistoryId { value: b }) => {
                match (a.parse::<u64>(), b.parse::<u64>()) {
                    (Ok(a), Ok(b)) => b >= a,
                    // Opaque non-numeric ids: nothing to compare.
                    _ => true,
                }
            }
            (Cursor::UidWatermark { uid: a }, Cursor::UidWatermark { uid: b }) => b >= a,
            (Cursor::Timestamp { at: a }, Cursor::Timestamp { at: b }) => b >= a,
            // Mode changes and delta-link rotation are always legal.
            _ => true,
        }
    }
}

/// One remote mailbox credential set, scoped to a tenant.
///
/// The credential itself lives behind the external
/// [`CredentialSource`](crate::external::CredentialSource); the connection
/// row carries only the sync bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Unique identifier.
    pub id: ConnectionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Mailbox address, for logging and job payloads.
    pub email: String,
    /// Remote protocol family.
    pub provider_kind: ProviderKind,
    /// Incremental-sync resume state. `None` until the first successful
    /// full sync establishes one.
    pub cursor: Option<Cursor>,
    /// End instant of the last successful sync pass.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Connection {
    /// Creates a connection that has never been synced.
    pub fn new(
        id: ConnectionId,
        tenant_id: TenantId,
        email: impl Into<String>,
        provider_kind: ProviderKind,
    ) -> Self {
        Self {
            id,
            tenant_id,
            email: email.into(),
            provider_kind,
            cursor: None,
            last_synced_at: None,
        }
    }

    /// Whether the connection has an established cursor and can sync
    /// incrementally.
    pub fn has_cursor(&self) -> bool {
        self.cursor.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_encode_decode_round_trip() {
        let cursors = vec![
            Cursor::HistoryId {
                value: "1834002".to_string(),
            },
            Cursor::DeltaLink {
                link: "https://graph.microsoft.com/v1.0/me/messages/delta?$deltatoken=abc"
                    .to_string(),
                mode: DeltaMode::Delta,
            },
            Cursor::UidWatermark { uid: 4217 },
            Cursor::Timestamp { at: Utc::now() },
        ];

        for cursor in cursors {
            let encoded = cursor.encode();
            assert_eq!(Cursor::decode(&encoded), Some(cursor));
        }
    }

    #[test]
    fn cursor_decode_rejects_garbage() {
        assert_eq!(Cursor::decode("not json"), None);
        assert_eq!(Cursor::decode("{\"kind\":\"bogus\"}"), None);
    }

    #[test]
    fn history_cursor_accepts_forward_motion_only() {
        let before = Cursor::HistoryId {
            value: "100".to_string(),
        };
        let same = Cursor::HistoryId {
            value: "100".to_string(),
        };
        let after = Cursor::HistoryId {
            value: "250".to_string(),
        };
        assert!(before.accepts_successor(&same));
        assert!(before.accepts_successor(&after));
        assert!(!after.accepts_successor(&before));
    }

    #[test]
    fn uid_watermark_is_monotonic() {
        let before = Cursor::UidWatermark { uid: 10 };
        let after = Cursor::UidWatermark { uid: 11 };
        assert!(before.accepts_successor(&after));
        assert!(!after.accepts_successor(&before));
    }

    #[test]
    fn mode_switch_is_always_accepted() {
        let delta = Cursor::DeltaLink {
            link: "https://example.com/delta?token=x".to_string(),
            mode: DeltaMode::Delta,
        };
        let fallback = Cursor::Timestamp { at: Utc::now() };
        assert!(delta.accepts_successor(&fallback));
    }

    #[test]
    fn new_connection_has_no_cursor() {
        let conn = Connection::new(
            ConnectionId::from("conn-1"),
            TenantId::from("tenant-1"),
            "user@example.com",
            ProviderKind::Gmail,
        );
        assert!(!conn.has_cursor());
        assert!(conn.last_synced_at.is_none());
    }
}
