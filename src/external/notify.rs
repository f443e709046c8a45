//! Realtime notification boundary.
//!
//! Notifications are best-effort and fire-and-forget. Bulk syncs emit
//! bursts of near-identical events, so the [`CoalescingNotifier`] wrapper
//! buffers over a short window keyed by `(tenant, kind, external_id)` and
//! forwards only the last event per key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::{ConnectionId, ExternalId, Folder, MessageId, TenantId};

/// Why a notification was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    MessageProcessed,
    MessageDeleted,
    LabelsUpdated,
    SyncComplete,
}

/// A realtime sync event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Connection the event belongs to.
    pub connection_id: ConnectionId,
    /// Event kind.
    pub reason: EventKind,
    /// Local message row id, when the event concerns one message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Provider message id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    /// Canonical folder, for message events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<Folder>,
}

impl SyncEvent {
    /// Coalescing key: duplicate bursts share this triple.
    fn coalesce_key(&self) -> (TenantId, EventKind, Option<ExternalId>) {
        (
            self.tenant_id.clone(),
            self.reason,
            self.external_id.clone(),
        )
    }
}

/// Fire-and-forget event sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publishes an event. Failures are the implementation's problem;
    /// callers never treat publish errors as sync failures.
    async fn publish(&self, event: SyncEvent);
}

/// In-memory notifier for tests.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryNotifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub async fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn publish(&self, event: SyncEvent) {
        self.events.lock().await.push(event);
    }
}

/// Wrapper that buffers events over a short window and forwards only the
/// last event per `(tenant, kind, external_id)` key.
///
/// The first publish after an idle period arms a flush task; everything
/// arriving inside the window folds into the buffer. `SyncComplete` events
/// are never delayed.
pub struct CoalescingNotifier {
    inner: Arc<dyn Notifier>,
    window: Duration,
    buffer: Arc<Mutex<HashMap<(TenantId, EventKind, Option<ExternalId>), SyncEvent>>>,
}

impl CoalescingNotifier {
    /// Wraps a notifier with the given coalescing window.
    pub fn new(inner: Arc<dyn Notifier>, window: Duration) -> Self {
        Self {
            inner,
            window,
            buffer: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Flushes the buffer immediately, forwarding every held event.
    pub async fn flush(&self) {
        let drained: Vec<SyncEvent> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain().map(|(_, event)| event).collect()
        };
        for event in drained {
            self.inner.publish(event).await;
        }
    }
}

#[async_trait]
impl Notifier for CoalescingNotifier {
    async fn publish(&self, event: SyncEvent) {
        if event.reason == EventKind::SyncComplete {
            // Completion marks the end of a run; deliver it after whatever
            // is still buffered.
            self.flush().await;
            self.inner.publish(event).await;
            return;
        }

        let arm_flush = {
            let mut buffer = self.buffer.lock().await;
            let was_empty = buffer.is_empty();
            buffer.insert(event.coalesce_key(), event);
            was_empty
        };

        if arm_flush {
            let inner = Arc::clone(&self.inner);
            let buffer = Arc::clone(&self.buffer);
            let window = self.window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let drained: Vec<SyncEvent> = {
                    let mut buffer = buffer.lock().await;
                    buffer.drain().map(|(_, event)| event).collect()
                };
                for event in drained {
                    inner.publish(event).await;
                }
            });
        }
    }
}
