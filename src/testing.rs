//! In-memory relay used by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nostr::prelude::*;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::relay::{Connector, RelayLink};

struct Conn {
    url: String,
    tx: mpsc::UnboundedSender<String>,
    subs: HashMap<String, Value>,
}

#[derive(Default)]
struct Hub {
    conns: Mutex<HashMap<u64, Conn>>,
    stored: Mutex<Vec<Event>>,
    next_conn: AtomicU64,
    connections: AtomicU64,
    refuse: AtomicBool,
}

/// A single logical relay reachable under any URL
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Hub>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.hub.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Total connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.hub.connections.load(Ordering::SeqCst) as usize
    }

    /// Live subscriptions across open connections
    pub fn subscription_count(&self) -> usize {
        lock(&self.hub.conns).values().map(|c| c.subs.len()).sum()
    }

    pub fn connected_urls(&self) -> Vec<String> {
        lock(&self.hub.conns).values().map(|c| c.url.clone()).collect()
    }

    pub fn stored(&self) -> Vec<Event> {
        lock(&self.hub.stored).clone()
    }

    pub fn stored_of_kind(&self, kind: Kind) -> Vec<Event> {
        self.stored().into_iter().filter(|e| e.kind == kind).collect()
    }

    /// Close every open connection from the relay side
    pub fn drop_links(&self) {
        lock(&self.hub.conns).clear();
    }

    /// Store an event and fan it out as if a client had published it
    pub fn inject(&self, event: Event) {
        self.hub.accept(event);
    }

    /// Fan an event out to live subscriptions without storing it
    pub fn broadcast(&self, event: Event) {
        self.hub.fan_out(&event);
    }
}

impl Hub {
    fn accept(&self, event: Event) {
        lock(&self.stored).push(event.clone());
        self.fan_out(&event);
    }

    fn fan_out(&self, event: &Event) {
        let value = json!(event);
        let conns = lock(&self.conns);
        for conn in conns.values() {
            for (sub_id, filter) in &conn.subs {
                if matches(filter, &value) {
                    let _ = conn.tx.send(json!(["EVENT", sub_id, value]).to_string());
                }
            }
        }
    }

    fn handle(&self, conn_id: u64, text: &str) {
        let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(text) else {
            return;
        };
        match parts.first().and_then(Value::as_str) {
            Some("EVENT") if parts.len() >= 2 => {
                if let Ok(event) = serde_json::from_value::<Event>(parts[1].clone()) {
                    let id = event.id.to_hex();
                    self.accept(event);
                    if let Some(conn) = lock(&self.conns).get(&conn_id) {
                        let _ = conn.tx.send(json!(["OK", id, true, ""]).to_string());
                    }
                }
            }
            Some("REQ") if parts.len() >= 3 => {
                let sub_id = parts[1].as_str().unwrap_or_default().to_string();
                let filter = parts[2].clone();
                let backlog: Vec<Value> = lock(&self.stored)
                    .iter()
                    .map(|e| json!(e))
                    .filter(|e| matches(&filter, e))
                    .collect();
                let mut conns = lock(&self.conns);
                if let Some(conn) = conns.get_mut(&conn_id) {
                    for event in backlog {
                        let _ = conn.tx.send(json!(["EVENT", sub_id, event]).to_string());
                    }
                    let _ = conn.tx.send(json!(["EOSE", sub_id]).to_string());
                    conn.subs.insert(sub_id, filter);
                }
            }
            Some("CLOSE") if parts.len() >= 2 => {
                let sub_id = parts[1].as_str().unwrap_or_default();
                if let Some(conn) = lock(&self.conns).get_mut(&conn_id) {
                    conn.subs.remove(sub_id);
                }
            }
            _ => {}
        }
    }
}

/// Subset of NIP-01 filter matching: ids, kinds, authors, `#p`, since
fn matches(filter: &Value, event: &Value) -> bool {
    let contains = |field: &str, value: &Value| -> bool {
        match filter.get(field).and_then(Value::as_array) {
            Some(allowed) => allowed.contains(value),
            None => true,
        }
    };
    if !contains("ids", &event["id"]) || !contains("kinds", &event["kind"]) {
        return false;
    }
    if !contains("authors", &event["pubkey"]) {
        return false;
    }
    if let Some(since) = filter.get("since").and_then(Value::as_u64) {
        if event["created_at"].as_u64().unwrap_or(0) < since {
            return false;
        }
    }
    if let Some(wanted) = filter.get("#p").and_then(Value::as_array) {
        let tagged = event["tags"]
            .as_array()
            .map(|tags| {
                tags.iter().any(|tag| {
                    tag.get(0).and_then(Value::as_str) == Some("p")
                        && tag.get(1).map(|v| wanted.contains(v)).unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if !tagged {
            return false;
        }
    }
    true
}

#[async_trait]
impl Connector for MemoryRelay {
    async fn connect(&self, url: &str) -> Result<RelayLink, TransportError> {
        if self.hub.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable {
                url: url.to_string(),
                reason: "refused".into(),
            });
        }
        let conn_id = self.hub.next_conn.fetch_add(1, Ordering::SeqCst);
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<String>();
        lock(&self.hub.conns).insert(
            conn_id,
            Conn {
                url: url.to_string(),
                tx: to_client,
                subs: HashMap::new(),
            },
        );
        self.hub.connections.fetch_add(1, Ordering::SeqCst);

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                hub.handle(conn_id, &text);
            }
            lock(&hub.conns).remove(&conn_id);
        });

        Ok(RelayLink { outbound, inbound })
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
