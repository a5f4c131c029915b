//! Push-only notification sink for UI and observability consumers
//!
//! The core emits, never reads back. Emitting with no subscribers is a no-op.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::custody::KeyStats;
use crate::relay::RelayStatus;
use crate::store::{AdminLogRecord, ApprovalEntry};

const SINK_CAPACITY: usize = 256;

/// Relay connectivity snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub connected: usize,
    pub total: usize,
    pub relays: Vec<RelayStatus>,
}

/// A request waiting on a human decision
#[derive(Debug, Clone, Serialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub key_name: String,
    pub method: String,
    pub remote_pubkey: String,
    pub params: Option<String>,
    pub auth_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SignetEvent {
    RelaysUpdated(RelaySnapshot),
    RequestPending(PendingRequest),
    RequestAutoApproved(ApprovalEntry),
    AdminEvent(AdminLogRecord),
    StatsUpdated(KeyStats),
}

/// Broadcast sink shared by every component
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SignetEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SINK_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: SignetEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignetEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
