//! Credential boundary.
//!
//! Token acquisition and refresh live outside the engine; adapters ask this
//! interface for a valid credential right before talking to the remote.
//! An auth failure surfaced here is fatal for the run and never retried.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::ConnectionId;

/// A ready-to-use credential for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// OAuth bearer token (Gmail, Microsoft Graph).
    Bearer {
        /// Access token, already refreshed by the external token service.
        token: String,
    },
    /// IMAP login.
    Login {
        /// Username, usually the mailbox address.
        username: String,
        /// Password or app-specific password.
        password: String,
        /// IMAP server hostname.
        host: String,
        /// IMAP server port.
        port: u16,
    },
}

/// Source of valid credentials, assumed to auto-refresh.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Returns a currently valid credential for the connection.
    async fn credential(&self, connection_id: &ConnectionId) -> anyhow::Result<Credential>;
}

/// Fixed credential map, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    entries: RwLock<HashMap<ConnectionId, Credential>>,
}

impl StaticCredentials {
    /// Creates an empty credential map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a credential for a connection.
    pub async fn insert(&self, connection_id: ConnectionId, credential: Credential) {
        self.entries.write().await.insert(connection_id, credential);
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn credential(&self, connection_id: &ConnectionId) -> anyhow::Result<Credential> {
        self.entries
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no credential for connection {}", connection_id))
    }
}
