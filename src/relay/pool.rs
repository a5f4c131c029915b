//! Relay pool
//!
//! Owns one connection task per relay URL. Each task reconnects on an
//! exponential, jittered backoff capped at a ceiling, so an individual relay
//! dropping is invisible to callers. A liveness monitor watches the wall
//! clock: when its own ticks stop for several intervals the host was
//! suspended, every connection is treated as stale and the pool is reset.
//!
//! Publishing is fire-and-forget: [`RelayPool::publish`] returns once the
//! frames are queued on the connected relays, relay `OK` acknowledgements are
//! only logged.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use nostr::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::connector::{Connector, RelayLink};
use crate::error::TransportError;

const EVENT_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    /// Fraction of the delay added or removed at random
    pub jitter: f64,
    pub monitor_interval: Duration,
    /// Missed monitor intervals before a gap counts as a host sleep
    pub sleep_threshold: u32,
    /// Inbound events buffered for the subscription router
    pub inbound_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            jitter: 0.25,
            monitor_interval: Duration::from_secs(10),
            sleep_threshold: 3,
            inbound_capacity: INBOUND_CAPACITY,
        }
    }
}

/// Reconnect delay for the given attempt. `unit` is a random sample in
/// `[0, 1]` that spreads the delay by `±jitter`.
pub fn backoff_delay(opts: &PoolOptions, attempt: u32, unit: f64) -> Duration {
    let exp = opts
        .backoff_base
        .saturating_mul(1u32 << attempt.min(16))
        .min(opts.backoff_ceiling);
    let spread = exp.as_secs_f64() * opts.jitter;
    let offset = (unit.clamp(0.0, 1.0) * 2.0 - 1.0) * spread;
    let secs = (exp.as_secs_f64() + offset).clamp(0.0, opts.backoff_ceiling.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// Normalize a relay URL so the same relay always maps to the same slot
pub fn normalize_url(raw: &str) -> Result<String, TransportError> {
    let parsed =
        url::Url::parse(raw.trim()).map_err(|_| TransportError::InvalidUrl(raw.to_string()))?;
    if parsed.scheme() != "wss" && parsed.scheme() != "ws" {
        return Err(TransportError::InvalidUrl(raw.to_string()));
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Which relays a subscription or publish targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelayScope {
    /// The pool's configured relay set
    Default,
    /// An explicit relay set, normalized and sorted
    Only(Vec<String>),
}

impl RelayScope {
    pub fn only<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = urls
            .into_iter()
            .filter_map(|u| normalize_url(u.as_ref()).ok())
            .collect();
        normalized.sort();
        normalized.dedup();
        RelayScope::Only(normalized)
    }

    pub fn key(&self) -> String {
        match self {
            RelayScope::Default => "default".to_string(),
            RelayScope::Only(urls) => urls.join(","),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub url: String,
    pub connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    RelayConnected(String),
    RelayDisconnected(String),
    SleepDetected { gap: Duration },
    PoolReset,
    StatusChanged { connected: usize, total: usize },
}

/// An event delivered by a relay for one of our subscriptions
#[derive(Debug, Clone)]
pub struct Inbound {
    pub relay: String,
    pub subscription_id: String,
    pub event: Event,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RelaySlot {
    url: String,
    status: Mutex<RelayStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reset: Notify,
    retired: watch::Sender<bool>,
}

impl RelaySlot {
    fn new(url: String) -> Self {
        Self {
            status: Mutex::new(RelayStatus {
                url: url.clone(),
                connected: false,
                last_connected: None,
                last_disconnected: None,
            }),
            url,
            outbound: Mutex::new(None),
            reset: Notify::new(),
            retired: watch::channel(false).0,
        }
    }

    fn send(&self, frame: String) -> bool {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.status).connected
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    opts: PoolOptions,
    defaults: RwLock<Vec<String>>,
    relays: RwLock<BTreeMap<String, Arc<RelaySlot>>>,
    events: broadcast::Sender<PoolEvent>,
    inbound: broadcast::Sender<Inbound>,
    last_tick: Mutex<Option<SystemTime>>,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    fn slots(&self) -> Vec<Arc<RelaySlot>> {
        self.relays
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn slot(&self, url: &str) -> Option<Arc<RelaySlot>> {
        self.relays
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .cloned()
    }

    fn emit_status(&self) {
        let slots = self.slots();
        let connected = slots.iter().filter(|s| s.is_connected()).count();
        self.emit(PoolEvent::StatusChanged {
            connected,
            total: slots.len(),
        });
    }
}

#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<Inner>,
}

impl RelayPool {
    pub fn new(connector: Arc<dyn Connector>, opts: PoolOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound, _) = broadcast::channel(opts.inbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                opts,
                defaults: RwLock::new(Vec::new()),
                relays: RwLock::new(BTreeMap::new()),
                events,
                inbound,
                last_tick: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Best-effort connect to the default relay set
    pub fn connect(&self, urls: &[String]) -> usize {
        let added = self.add_relays(urls);
        let mut defaults = self.inner.defaults.write().unwrap_or_else(|p| p.into_inner());
        for url in &added {
            if !defaults.contains(url) {
                defaults.push(url.clone());
            }
        }
        defaults.len()
    }

    /// Make sure a connection task exists for every URL. Returns the
    /// normalized URLs; invalid ones are skipped.
    pub fn add_relays(&self, urls: &[String]) -> Vec<String> {
        let mut normalized = Vec::new();
        for raw in urls {
            let url = match normalize_url(raw) {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "Skipping relay");
                    continue;
                }
            };
            let spawned = {
                let mut relays = self.inner.relays.write().unwrap_or_else(|p| p.into_inner());
                if relays.contains_key(&url) {
                    None
                } else {
                    let slot = Arc::new(RelaySlot::new(url.clone()));
                    relays.insert(url.clone(), Arc::clone(&slot));
                    Some(slot)
                }
            };
            if let Some(slot) = spawned {
                debug!(relay = %url, "Adding relay");
                tokio::spawn(run_relay(Arc::clone(&self.inner), slot));
            }
            normalized.push(url);
        }
        normalized
    }

    /// Stop and forget relays that are not in the default set. Returns the
    /// URLs actually removed.
    pub fn remove_relays(&self, urls: &[String]) -> Vec<String> {
        let defaults = self.default_relays();
        let mut removed = Vec::new();
        {
            let mut relays = self.inner.relays.write().unwrap_or_else(|p| p.into_inner());
            for url in urls {
                if defaults.contains(url) {
                    continue;
                }
                if let Some(slot) = relays.remove(url) {
                    slot.retired.send_replace(true);
                    removed.push(url.clone());
                }
            }
        }
        if !removed.is_empty() {
            debug!(relays = ?removed, "Removed relays");
            self.inner.emit_status();
        }
        removed
    }

    pub fn relays(&self) -> Vec<String> {
        self.inner.slots().iter().map(|s| s.url.clone()).collect()
    }

    pub fn default_relays(&self) -> Vec<String> {
        self.inner
            .defaults
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn resolve(&self, scope: &RelayScope) -> Vec<String> {
        match scope {
            RelayScope::Default => self.default_relays(),
            RelayScope::Only(urls) => urls.clone(),
        }
    }

    pub fn is_connected(&self, url: &str) -> bool {
        self.inner.slot(url).map(|s| s.is_connected()).unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.inner.slots().iter().filter(|s| s.is_connected()).count()
    }

    pub fn statuses(&self) -> Vec<RelayStatus> {
        self.inner
            .slots()
            .iter()
            .map(|s| lock(&s.status).clone())
            .collect()
    }

    /// Queue an event on every connected relay in scope
    pub fn publish(&self, event: &Event, scope: &RelayScope) -> Result<usize, TransportError> {
        let frame = json!(["EVENT", event]).to_string();
        let mut accepted = 0;
        for url in self.resolve(scope) {
            if let Some(slot) = self.inner.slot(&url) {
                if slot.send(frame.clone()) {
                    accepted += 1;
                }
            }
        }
        if accepted == 0 {
            return Err(TransportError::NoConnectedRelays);
        }
        debug!(event_id = %event.id.to_hex(), relays = accepted, "Published event");
        Ok(accepted)
    }

    pub(crate) fn send_req(&self, url: &str, subscription_id: &str, filter: &Filter) -> bool {
        let frame = json!(["REQ", subscription_id, filter]).to_string();
        self.inner
            .slot(url)
            .map(|slot| slot.send(frame))
            .unwrap_or(false)
    }

    pub(crate) fn send_close(&self, url: &str, subscription_id: &str) {
        if let Some(slot) = self.inner.slot(url) {
            slot.send(json!(["CLOSE", subscription_id]).to_string());
        }
    }

    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn inbound(&self) -> broadcast::Receiver<Inbound> {
        self.inner.inbound.subscribe()
    }

    /// Wait until at least one of `urls` is connected
    pub async fn wait_connected(&self, urls: &[String], timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if urls.iter().any(|u| self.is_connected(u)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Run the sleep/wake detector
    pub fn start_monitoring(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.opts.monitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.check_liveness(SystemTime::now());
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Record a monitor tick at `now`. Returns true when the gap since the
    /// previous tick means the host slept, in which case the pool is reset.
    pub fn check_liveness(&self, now: SystemTime) -> bool {
        let previous = lock(&self.inner.last_tick).replace(now);
        let Some(previous) = previous else {
            return false;
        };
        let gap = now.duration_since(previous).unwrap_or_default();
        let threshold = self.inner.opts.monitor_interval * self.inner.opts.sleep_threshold;
        if gap <= threshold {
            return false;
        }
        warn!(gap_secs = gap.as_secs(), "Host sleep detected, resetting relay pool");
        self.inner.emit(PoolEvent::SleepDetected { gap });
        self.reset();
        true
    }

    /// Drop every connection and reconnect immediately
    pub fn reset(&self) {
        let slots = self.inner.slots();
        info!(relays = slots.len(), "Resetting relay pool");
        for slot in slots {
            slot.reset.notify_one();
        }
        self.inner.emit(PoolEvent::PoolReset);
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

async fn run_relay(inner: Arc<Inner>, slot: Arc<RelaySlot>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut retired = slot.retired.subscribe();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() || *retired.borrow() {
            break;
        }

        match inner.connector.connect(&slot.url).await {
            Ok(RelayLink {
                outbound,
                mut inbound,
            }) => {
                attempt = 0;
                *lock(&slot.outbound) = Some(outbound);
                {
                    let mut status = lock(&slot.status);
                    status.connected = true;
                    status.last_connected = Some(Utc::now());
                }
                info!(relay = %slot.url, "Connected to relay");
                inner.emit(PoolEvent::RelayConnected(slot.url.clone()));
                inner.emit_status();

                let mut reset = false;
                let mut stopping = false;
                loop {
                    tokio::select! {
                        frame = inbound.recv() => match frame {
                            Some(text) => handle_frame(&inner, &slot.url, &text),
                            None => break,
                        },
                        _ = slot.reset.notified() => {
                            reset = true;
                            break;
                        }
                        _ = shutdown.changed() => {
                            stopping = true;
                            break;
                        }
                        _ = retired.changed() => {
                            stopping = true;
                            break;
                        }
                    }
                }

                *lock(&slot.outbound) = None;
                {
                    let mut status = lock(&slot.status);
                    status.connected = false;
                    status.last_disconnected = Some(Utc::now());
                }
                warn!(relay = %slot.url, reset, "Disconnected from relay");
                inner.emit(PoolEvent::RelayDisconnected(slot.url.clone()));
                inner.emit_status();

                if stopping {
                    break;
                }
                if reset {
                    continue;
                }
            }
            Err(e) => {
                debug!(relay = %slot.url, error = %e, attempt, "Relay connection failed");
            }
        }

        let delay = backoff_delay(&inner.opts, attempt, rand::random::<f64>());
        attempt = attempt.saturating_add(1);
        debug!(relay = %slot.url, delay_ms = delay.as_millis() as u64, "Reconnecting to relay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = slot.reset.notified() => attempt = 0,
            _ = shutdown.changed() => break,
            _ = retired.changed() => break,
        }
    }
    debug!(relay = %slot.url, "Relay task finished");
}

fn handle_frame(inner: &Inner, url: &str, text: &str) {
    let parts = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(parts)) => parts,
        _ => {
            debug!(relay = %url, "Ignoring malformed relay frame");
            return;
        }
    };

    match parts.first().and_then(Value::as_str) {
        Some("EVENT") if parts.len() >= 3 => {
            let subscription_id = parts[1].as_str().unwrap_or_default().to_string();
            let event = match serde_json::from_value::<Event>(parts[2].clone()) {
                Ok(event) => event,
                Err(e) => {
                    debug!(relay = %url, error = %e, "Ignoring unparseable event");
                    return;
                }
            };
            if event.verify().is_err() {
                warn!(relay = %url, event_id = %event.id.to_hex(), "Dropping event with invalid signature");
                return;
            }
            let _ = inner.inbound.send(Inbound {
                relay: url.to_string(),
                subscription_id,
                event,
            });
        }
        Some("OK") => {
            let event_id = parts.get(1).and_then(Value::as_str).unwrap_or_default();
            let accepted = parts.get(2).and_then(Value::as_bool).unwrap_or(false);
            if accepted {
                debug!(relay = %url, event_id, "Relay accepted event");
            } else {
                let reason = parts.get(3).and_then(Value::as_str).unwrap_or_default();
                warn!(relay = %url, event_id, reason, "Relay rejected event");
            }
        }
        Some("EOSE") => {
            debug!(relay = %url, subscription = ?parts.get(1), "End of stored events");
        }
        Some("CLOSED") => {
            let reason = parts.get(2).and_then(Value::as_str).unwrap_or_default();
            warn!(relay = %url, subscription = ?parts.get(1), reason, "Relay closed subscription");
        }
        Some("NOTICE") => {
            debug!(relay = %url, notice = ?parts.get(1), "Relay notice");
        }
        _ => debug!(relay = %url, "Ignoring relay frame"),
    }
}
