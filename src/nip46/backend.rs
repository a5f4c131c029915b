//! Protocol backend, one per active key
//!
//! Lifecycle is `Stopped -> Starting -> Running -> Stopped`. While running the
//! backend holds one subscription for requests addressed to its key on the
//! default relays, plus one per bound app that asked to be reached on its own
//! relays. Inbound events are deduplicated by id, then queued per app so
//! calls from one app are handled in arrival order while different apps
//! proceed independently.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use nostr::prelude::*;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::acl::{Acl, ApprovalType, Decision, LogThrottle, TrustLevel};
use super::connection::ConnectionManager;
use super::message::{open_envelope, seal_envelope, EventTemplate, Method, RpcRequest, RpcResponse, Scheme};
use super::registry::{AppBinding, AppRegistry};
use crate::custody::{KeyCustody, KeySecret};
use crate::deadman::ActivityTracker;
use crate::error::{Result, SignetError};
use crate::events::{EventSink, SignetEvent};
use crate::relay::{Delivery, RelayPool, RelayScope, SubscriptionManager};
use crate::store::{ApprovalEntry, LogRecord, LogStore, Outcome, RequestRecord, RequestStore};

pub const NOT_AUTHORIZED: &str = "Not authorized";
pub const UNSUPPORTED_METHOD: &str = "unsupported method";
pub const WRONG_SIGNER: &str = "remote signer pubkey mismatch";

/// A per-app worker with nothing queued for this long exits
pub const WORKER_IDLE: Duration = Duration::from_secs(120);

const SEEN_CAPACITY: usize = 4096;
const REPLAY_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Stopped,
    Starting,
    Running,
}

/// Shared collaborators every backend uses
#[derive(Clone)]
pub struct BackendServices {
    pub pool: RelayPool,
    pub subscriptions: SubscriptionManager,
    pub acl: Acl,
    pub connections: Arc<ConnectionManager>,
    pub registry: Arc<AppRegistry>,
    pub requests: Arc<dyn RequestStore>,
    pub logs: Arc<dyn LogStore>,
    pub custody: Arc<dyn KeyCustody>,
    pub sink: EventSink,
    pub activity: ActivityTracker,
    pub throttle: Arc<LogThrottle>,
}

/// Bounded set of recently seen event ids
struct SeenEvents {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl SeenEvents {
    fn new() -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns false when the id was already seen
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Final responses by (app, correlation id), so a repeated id gets the
/// answer it got the first time
#[derive(Default)]
struct ReplayCache {
    responses: HashMap<(String, String), RpcResponse>,
    order: VecDeque<(String, String)>,
}

impl ReplayCache {
    fn get(&self, app: &str, id: &str) -> Option<RpcResponse> {
        self.responses
            .get(&(app.to_string(), id.to_string()))
            .cloned()
    }

    fn put(&mut self, app: &str, id: &str, response: RpcResponse) {
        let slot = (app.to_string(), id.to_string());
        if self.responses.insert(slot.clone(), response).is_none() {
            self.order.push_back(slot);
        }
        if self.order.len() > REPLAY_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.responses.remove(&oldest);
            }
        }
    }
}

/// One decrypted call
struct Call {
    caller: PublicKey,
    app: String,
    scheme: Scheme,
    request: RpcRequest,
}

struct Handler {
    label: String,
    keys: Keys,
    services: BackendServices,
    state: watch::Receiver<BackendState>,
    replay: Mutex<ReplayCache>,
    workers: AtomicUsize,
}

pub struct Backend {
    handler: Arc<Handler>,
    state: watch::Sender<BackendState>,
    deliveries: Option<mpsc::UnboundedSender<Delivery>>,
    app_owners: BTreeSet<String>,
    task: Option<JoinHandle<()>>,
    worker_idle: Duration,
}

impl Backend {
    /// Fails with `InvalidKeyMaterial` when the secret does not parse
    pub fn new(label: &str, secret: &KeySecret, services: BackendServices) -> Result<Self> {
        let keys = secret.to_keys(label)?;
        let (state, state_rx) = watch::channel(BackendState::Stopped);
        Ok(Self {
            handler: Arc::new(Handler {
                label: label.to_string(),
                keys,
                services,
                state: state_rx,
                replay: Mutex::new(ReplayCache::default()),
                workers: AtomicUsize::new(0),
            }),
            state,
            deliveries: None,
            app_owners: BTreeSet::new(),
            task: None,
            worker_idle: WORKER_IDLE,
        })
    }

    pub fn label(&self) -> &str {
        &self.handler.label
    }

    pub fn public_key(&self) -> PublicKey {
        self.handler.keys.public_key()
    }

    pub fn keys(&self) -> &Keys {
        &self.handler.keys
    }

    pub fn state(&self) -> BackendState {
        *self.state.borrow()
    }

    /// Per-app workers currently alive
    pub fn worker_count(&self) -> usize {
        self.handler.workers.load(Ordering::SeqCst)
    }

    /// Takes effect on the next [`start`](Self::start)
    pub fn set_worker_idle(&mut self, idle: Duration) {
        self.worker_idle = idle;
    }

    fn key_owner(&self) -> String {
        format!("{}:requests", self.handler.label)
    }

    fn app_owner(&self, app: &str) -> String {
        format!("{}:app:{}", self.handler.label, app)
    }

    pub fn start(&mut self) {
        if self.state() != BackendState::Stopped {
            return;
        }
        self.state.send_replace(BackendState::Starting);

        let (tx, rx) = mpsc::unbounded_channel();
        self.task = Some(tokio::spawn(run(
            Arc::clone(&self.handler),
            rx,
            self.worker_idle,
        )));
        self.deliveries = Some(tx.clone());

        let filter = Filter::new()
            .kind(Kind::NostrConnect)
            .pubkey(self.public_key())
            .since(Timestamp::now());
        self.handler.services.subscriptions.ensure(
            &self.key_owner(),
            filter,
            RelayScope::Default,
            tx,
        );

        for binding in self.handler.services.registry.apps_for(&self.handler.label) {
            self.add_app_subscription(&binding.pubkey, &binding.relays);
        }

        self.state.send_replace(BackendState::Running);
        info!(
            key = %self.handler.label,
            pubkey = %self.public_key().to_hex(),
            apps = self.app_owners.len(),
            "Backend running"
        );
    }

    /// Listen for `app` on its own relays. Apps without relays are already
    /// covered by the key subscription on the default relays.
    pub fn add_app_subscription(&mut self, app: &str, relays: &[String]) {
        let Some(tx) = self.deliveries.clone() else {
            return;
        };
        if relays.is_empty() {
            return;
        }
        let Ok(author) = PublicKey::from_hex(app) else {
            warn!(key = %self.handler.label, app, "Ignoring app with malformed pubkey");
            return;
        };
        let filter = Filter::new()
            .kind(Kind::NostrConnect)
            .pubkey(self.public_key())
            .author(author)
            .since(Timestamp::now());
        let owner = self.app_owner(app);
        self.handler.services.subscriptions.ensure(
            &owner,
            filter,
            RelayScope::only(relays),
            tx,
        );
        debug!(key = %self.handler.label, app, relays = relays.len(), "Added app subscription");
        self.app_owners.insert(owner);
    }

    pub fn remove_app_subscription(&mut self, app: &str) {
        let owner = self.app_owner(app);
        if self.app_owners.remove(&owner) {
            self.handler.services.subscriptions.release(&owner);
            debug!(key = %self.handler.label, app, "Removed app subscription");
        }
    }

    pub fn has_app_subscription(&self, app: &str) -> bool {
        self.app_owners.contains(&self.app_owner(app))
    }

    pub fn stop(&mut self) {
        if self.state() == BackendState::Stopped {
            return;
        }
        self.state.send_replace(BackendState::Stopped);
        let subscriptions = &self.handler.services.subscriptions;
        subscriptions.release(&self.key_owner());
        for owner in std::mem::take(&mut self.app_owners) {
            subscriptions.release(&owner);
        }
        self.deliveries = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!(key = %self.handler.label, "Backend stopped");
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    handler: Arc<Handler>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    idle: Duration,
) {
    let mut seen = SeenEvents::new();
    let mut workers: HashMap<PublicKey, mpsc::UnboundedSender<Call>> = HashMap::new();

    while let Some(delivery) = deliveries.recv().await {
        let event = delivery.event;
        if !seen.insert(event.id) {
            debug!(key = %handler.label, event_id = %event.id.to_hex(), relay = %delivery.relay, "Duplicate request");
            continue;
        }
        // Only requests that decrypt and parse get a worker
        let Some(call) = handler.open(&event) else {
            continue;
        };
        let app = call.caller;
        if workers.get(&app).map_or(true, |w| w.is_closed()) {
            workers.retain(|_, w| !w.is_closed());
            workers.insert(app, spawn_worker(Arc::clone(&handler), idle));
        }
        let Some(worker) = workers.get(&app) else {
            continue;
        };
        if let Err(mpsc::error::SendError(call)) = worker.send(call) {
            let replacement = spawn_worker(Arc::clone(&handler), idle);
            let _ = replacement.send(call);
            workers.insert(app, replacement);
        }
    }
}

/// Handle one app's calls in order. After `idle` with an empty queue the
/// worker closes its queue, finishes what slipped in, and exits.
fn spawn_worker(handler: Arc<Handler>, idle: Duration) -> mpsc::UnboundedSender<Call> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Call>();
    handler.workers.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(call)) => handler.handle(call).await,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    while let Ok(call) = rx.try_recv() {
                        handler.handle(call).await;
                    }
                    break;
                }
            }
        }
        handler.workers.fetch_sub(1, Ordering::SeqCst);
    });
    tx
}

fn missing(name: &str) -> SignetError {
    SignetError::InvalidRequest(format!("missing {name}"))
}

impl Handler {
    /// Decrypt and parse a request event
    fn open(&self, event: &Event) -> Option<Call> {
        let (scheme, plaintext) = match open_envelope(&self.keys, event) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(key = %self.label, error = %e, "Dropping undecryptable request");
                return None;
            }
        };
        let request = match RpcRequest::parse(&plaintext) {
            Ok(request) => request,
            Err(e) => {
                debug!(key = %self.label, sender = %event.pubkey.to_hex(), error = %e, "Dropping malformed request");
                return None;
            }
        };
        Some(Call {
            caller: event.pubkey,
            app: event.pubkey.to_hex(),
            scheme,
            request,
        })
    }

    async fn handle(&self, call: Call) {
        let cached = self
            .replay
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&call.app, &call.request.id);
        if let Some(response) = cached {
            debug!(key = %self.label, id = %call.request.id, "Replaying earlier response");
            self.respond(&call, &response);
            return;
        }

        let Some(response) = self.dispatch(&call).await else {
            return;
        };
        self.replay
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(&call.app, &call.request.id, response.clone());
        self.respond(&call, &response);
    }

    async fn running(&self) -> bool {
        let mut state = self.state.clone();
        let running = match state.wait_for(|s| *s != BackendState::Starting).await {
            Ok(s) => *s == BackendState::Running,
            Err(_) => false,
        };
        running
    }

    /// `None` means the backend stopped and nothing should be sent
    async fn dispatch(&self, call: &Call) -> Option<RpcResponse> {
        let id = call.request.raw_id.clone();
        let Some(method) = call.request.method() else {
            debug!(key = %self.label, method = %call.request.method, "Unsupported method");
            return Some(RpcResponse::error(id, UNSUPPORTED_METHOD));
        };

        if method == Method::Connect {
            let ours = call
                .request
                .param(0)
                .and_then(|raw| PublicKey::parse(raw).ok())
                .is_some_and(|pk| pk == self.keys.public_key());
            if !ours {
                info!(key = %self.label, app = %call.app, "Connect names a different remote signer");
                return Some(RpcResponse::error(id, WRONG_SIGNER));
            }
            if let Some(response) = self.redeem_connect(call).await {
                return Some(response);
            }
        }

        let decision =
            self.services
                .acl
                .check(&self.label, &call.app, method, call.request.param(0));
        let approval = match decision {
            Decision::Allow(approval) => approval,
            Decision::Deny => {
                info!(key = %self.label, app = %call.app, method = %method, "Request denied by policy");
                self.record_denial(call, method);
                return Some(RpcResponse::error(id, NOT_AUTHORIZED));
            }
            Decision::Ask => match self.ask(call).await {
                Ok(approval) => approval,
                Err(e) => {
                    info!(key = %self.label, app = %call.app, method = %method, error = %e, "Request not authorized");
                    if !self.running().await {
                        return None;
                    }
                    return Some(RpcResponse::error(id, NOT_AUTHORIZED));
                }
            },
        };

        if !self.running().await {
            warn!(key = %self.label, method = %method, "Backend stopped, dropping approved request");
            return None;
        }

        let response = match self.execute(method, &call.request) {
            Ok(result) => RpcResponse::ok(id, result),
            Err(e) => {
                debug!(key = %self.label, method = %method, error = %e, "Request failed");
                return Some(RpcResponse::error(id, e.to_string()));
            }
        };

        if method == Method::Connect && !self.services.registry.is_bound(&self.label, &call.app) {
            if let Err(e) = self
                .services
                .connections
                .bind(&self.label, AppBinding::new(call.app.clone(), TrustLevel::Reasonable))
            {
                warn!(key = %self.label, app = %call.app, error = %e, "Failed to bind approved app");
            }
        }

        self.services.activity.touch();
        self.services.registry.touch(&self.label, &call.app);
        self.record_permit(call, method, approval);
        Some(response)
    }

    /// Bound apps are acknowledged, a valid bunker secret binds the caller.
    /// Anything else falls through to the policy path.
    async fn redeem_connect(&self, call: &Call) -> Option<RpcResponse> {
        let id = call.request.raw_id.clone();
        if self.services.registry.is_bound(&self.label, &call.app) {
            return Some(RpcResponse::ok(id, "ack"));
        }
        let secret = call.request.param(1).filter(|s| !s.is_empty())?;
        match self
            .services
            .connections
            .redeem_connect(&self.label, &call.app, secret)
            .await
        {
            Ok(true) => {
                self.services.activity.touch();
                self.record_permit(call, Method::Connect, ApprovalType::AutoPermission);
                Some(RpcResponse::ok(id, "ack"))
            }
            Ok(false) => None,
            Err(e) => {
                warn!(key = %self.label, error = %e, "Connect secret check failed");
                None
            }
        }
    }

    async fn ask(&self, call: &Call) -> Result<ApprovalType> {
        let connections = &self.services.connections;
        let ticket = connections
            .open_authorization(&self.label, &call.app, &call.request)
            .await?;
        self.respond(
            call,
            &RpcResponse::auth_url(call.request.raw_id.clone(), ticket.auth_url.clone()),
        );
        connections.await_decision(ticket).await
    }

    fn execute(&self, method: Method, request: &RpcRequest) -> Result<String> {
        match method {
            Method::Connect => Ok("ack".to_string()),
            Method::Ping => Ok("pong".to_string()),
            Method::GetPublicKey => Ok(self.keys.public_key().to_hex()),
            Method::GetRelays => {
                let relays: serde_json::Map<String, serde_json::Value> = self
                    .services
                    .pool
                    .default_relays()
                    .into_iter()
                    .map(|url| (url, json!({"read": true, "write": true})))
                    .collect();
                Ok(serde_json::Value::Object(relays).to_string())
            }
            Method::SignEvent => {
                let template = EventTemplate::parse(request.param(0).ok_or_else(|| missing("event"))?)?;
                let event = template.sign(&self.keys)?;
                Ok(serde_json::to_string(&event)?)
            }
            Method::Nip04Encrypt | Method::Nip44Encrypt => {
                let peer = self.peer(request)?;
                let plaintext = request.param(1).ok_or_else(|| missing("plaintext"))?;
                self.scheme_for(method).encrypt(&self.keys, &peer, plaintext)
            }
            Method::Nip04Decrypt | Method::Nip44Decrypt => {
                let peer = self.peer(request)?;
                let ciphertext = request.param(1).ok_or_else(|| missing("ciphertext"))?;
                self.scheme_for(method).decrypt(&self.keys, &peer, ciphertext)
            }
        }
    }

    fn scheme_for(&self, method: Method) -> Scheme {
        match method {
            Method::Nip04Encrypt | Method::Nip04Decrypt => Scheme::Nip04,
            _ => Scheme::Nip44,
        }
    }

    fn peer(&self, request: &RpcRequest) -> Result<PublicKey> {
        let raw = request.param(0).ok_or_else(|| missing("pubkey"))?;
        PublicKey::parse(raw).map_err(|e| SignetError::InvalidRequest(format!("invalid pubkey: {e}")))
    }

    /// Encrypt and publish, to the app's own relays when it has any
    fn respond(&self, call: &Call, response: &RpcResponse) {
        let published = response.to_json().and_then(|payload| {
            let event = seal_envelope(&self.keys, &call.caller, call.scheme, &payload)?;
            let scope = match self.services.registry.get(&self.label, &call.app) {
                Some(binding) if !binding.relays.is_empty() => RelayScope::only(&binding.relays),
                _ => RelayScope::Default,
            };
            Ok(self.services.pool.publish(&event, &scope)?)
        });
        match published {
            Ok(relays) => debug!(key = %self.label, id = %response.id, relays, "Sent response"),
            Err(e) => warn!(key = %self.label, id = %response.id, error = %e, "Failed to send response"),
        }
    }

    fn event_kind(method: Method, request: &RpcRequest) -> Option<u16> {
        match method {
            Method::SignEvent => request.param(0).and_then(EventTemplate::peek_kind),
            _ => None,
        }
    }

    /// Throttled approval logging, off the request path
    fn record_permit(&self, call: &Call, method: Method, approval: ApprovalType) {
        if !self.services.throttle.should_log(&self.label, method.as_str()) {
            return;
        }
        let services = self.services.clone();
        let label = self.label.clone();
        let app = call.app.clone();
        let request = call.request.clone();
        let event_kind = Self::event_kind(method, &request);
        let auto_approved = approval != ApprovalType::Manual;
        let params = (!request.params.is_empty()).then(|| request.params.join(","));

        tokio::spawn(async move {
            let now = Utc::now();
            if auto_approved {
                let record = RequestRecord {
                    request_id: super::connection::random_hex(16),
                    correlation_id: request.id.clone(),
                    key_name: label.clone(),
                    method: method.as_str().to_string(),
                    remote_pubkey: app.clone(),
                    params: params.clone(),
                    outcome: Outcome::AutoApproved,
                    approval_type: Some(approval),
                    created_at: now,
                    resolved_at: Some(now),
                };
                if let Err(e) = services.requests.create(record).await {
                    warn!(key = %label, error = %e, "Failed to record auto-approved request");
                }
            }
            let log = LogRecord {
                timestamp: now,
                kind: "approval".to_string(),
                key_name: label.clone(),
                method: method.as_str().to_string(),
                params,
                remote_pubkey: app.clone(),
                auto_approved,
                approval_type: Some(approval),
                event_kind,
            };
            if let Err(e) = services.logs.create(log).await {
                warn!(key = %label, error = %e, "Failed to write approval log");
            }
            if auto_approved {
                let app_name = services
                    .registry
                    .get(&label, &app)
                    .and_then(|b| b.description);
                services.sink.emit(SignetEvent::RequestAutoApproved(ApprovalEntry {
                    timestamp: now,
                    method: method.as_str().to_string(),
                    event_kind,
                    key_name: label,
                    app_pubkey: app,
                    app_name,
                    auto_approved,
                    approval_type: Some(approval),
                }));
            }
            services
                .sink
                .emit(SignetEvent::StatsUpdated(services.custody.stats().await));
        });
    }

    fn record_denial(&self, call: &Call, method: Method) {
        let logs = Arc::clone(&self.services.logs);
        let record = LogRecord {
            timestamp: Utc::now(),
            kind: "denial".to_string(),
            key_name: self.label.clone(),
            method: method.as_str().to_string(),
            params: (!call.request.params.is_empty()).then(|| call.request.params.join(",")),
            remote_pubkey: call.app.clone(),
            auto_approved: false,
            approval_type: None,
            event_kind: Self::event_kind(method, &call.request),
        };
        let label = self.label.clone();
        tokio::spawn(async move {
            if let Err(e) = logs.create(record).await {
                warn!(key = %label, error = %e, "Failed to write denial log");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::custody::KeyRing;
    use crate::nip46::acl::PolicyRule;
    use crate::nip46::connection::ConnectionSettings;
    use crate::relay::PoolOptions;
    use crate::store::{Journal, MemoryStore};
    use crate::testing::{wait_until, MemoryRelay};

    struct Harness {
        relay: MemoryRelay,
        signer: Keys,
        backend: Backend,
        services: BackendServices,
        store: Arc<MemoryStore>,
        activity: ActivityTracker,
    }

    async fn harness(auth_timeout: Duration) -> Harness {
        let relay = MemoryRelay::new();
        let pool = RelayPool::new(relay.connector(), PoolOptions::default());
        let subscriptions = SubscriptionManager::new(pool.clone());
        subscriptions.start();
        pool.connect(&["wss://relay.example".to_string()]);
        assert!(pool.wait_connected(&pool.relays(), Duration::from_secs(2)).await);

        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(AppRegistry::in_memory());
        let (connections, _bindings) = ConnectionManager::new(
            ConnectionSettings {
                base_url: "https://signet.example".into(),
                auth_timeout,
            },
            pool.clone(),
            store.clone(),
            store.clone(),
            registry.clone(),
            EventSink::new(),
        );
        let (ring, _keys_rx) = KeyRing::new();
        let activity = ActivityTracker::new();
        let services = BackendServices {
            pool,
            subscriptions,
            acl: Acl::new(registry.clone()),
            connections: Arc::new(connections),
            registry,
            requests: store.clone(),
            logs: Arc::new(Journal::disabled()),
            custody: Arc::new(ring),
            sink: EventSink::new(),
            activity: activity.clone(),
            throttle: Arc::new(LogThrottle::default()),
        };

        let signer = Keys::generate();
        let secret = KeySecret::new(signer.secret_key().to_secret_hex());
        let mut backend = Backend::new("main", &secret, services.clone()).unwrap();
        backend.start();
        assert!(
            wait_until(Duration::from_secs(2), || relay.subscription_count() >= 1).await
        );

        Harness {
            relay,
            signer,
            backend,
            services,
            store,
            activity,
        }
    }

    impl Harness {
        fn bind(&self, app: &Keys, trust: TrustLevel, rules: Vec<PolicyRule>) {
            let mut binding = AppBinding::new(app.public_key().to_hex(), trust);
            binding.rules = rules;
            self.services.registry.bind("main", binding).unwrap();
        }

        fn request_event(&self, app: &Keys, scheme: Scheme, body: serde_json::Value) -> Event {
            seal_envelope(app, &self.signer.public_key(), scheme, &body.to_string()).unwrap()
        }

        fn send(&self, app: &Keys, body: serde_json::Value) -> Event {
            let event = self.request_event(app, Scheme::Nip44, body);
            self.relay.inject(event.clone());
            event
        }

        /// Responses addressed to `app`, decrypted, in publish order
        fn responses(&self, app: &Keys) -> Vec<RpcResponse> {
            self.relay
                .stored_of_kind(Kind::NostrConnect)
                .into_iter()
                .filter(|e| e.pubkey == self.signer.public_key())
                .filter_map(|e| open_envelope(app, &e).ok())
                .filter_map(|(_, json)| serde_json::from_str(&json).ok())
                .collect()
        }

        async fn response(&self, app: &Keys, id: &str, auth_url: bool) -> RpcResponse {
            let found = wait_until(Duration::from_secs(3), || {
                self.responses(app)
                    .iter()
                    .any(|r| r.id == id && r.is_auth_url() == auth_url)
            })
            .await;
            assert!(found, "no response for {id}");
            self.responses(app)
                .into_iter()
                .find(|r| r.id == id && r.is_auth_url() == auth_url)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_ping_echoes_correlation_id() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);
        let before = h.activity.last_activity();

        h.send(&app, json!({"id": "abc-1", "method": "ping", "params": []}));
        let response = h.response(&app, "abc-1", false).await;
        assert_eq!(response.result, "pong");
        assert!(response.error.is_none());
        assert!(h.activity.last_activity() >= before);
    }

    #[tokio::test]
    async fn test_get_public_key_and_relays() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);

        h.send(&app, json!({"id": "pk", "method": "get_public_key", "params": []}));
        h.send(&app, json!({"id": "rl", "method": "get_relays", "params": []}));
        assert_eq!(
            h.response(&app, "pk", false).await.result,
            h.signer.public_key().to_hex()
        );
        let relays: serde_json::Value =
            serde_json::from_str(&h.response(&app, "rl", false).await.result).unwrap();
        assert!(relays.get("wss://relay.example").is_some());
    }

    #[tokio::test]
    async fn test_deny_rule_overrides_full_trust() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(
            &app,
            TrustLevel::Full,
            vec![PolicyRule::deny(Method::SignEvent, None)],
        );

        h.send(
            &app,
            json!({"id": "s1", "method": "sign_event", "params": [r#"{"kind":1,"content":"x"}"#]}),
        );
        let response = h.response(&app, "s1", false).await;
        assert_eq!(response.error.as_deref(), Some(NOT_AUTHORIZED));
        assert_eq!(response.result, "");
    }

    #[tokio::test]
    async fn test_unbound_sign_event_goes_through_auth_url() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();

        h.send(
            &app,
            json!({"id": "s2", "method": "sign_event", "params": [r#"{"kind":1,"content":"hello","tags":[]}"#]}),
        );
        let auth = h.response(&app, "s2", true).await;
        let url = auth.error.unwrap();
        let request_id = url.rsplit('/').next().unwrap().to_string();
        assert!(url.starts_with("https://signet.example/requests/"));

        assert!(h.services.connections.decide(&request_id, true));
        let response = h.response(&app, "s2", false).await;
        let signed: Event = serde_json::from_str(&response.result).unwrap();
        assert_eq!(signed.pubkey, h.signer.public_key());
        assert_eq!(signed.content, "hello");
        assert!(signed.verify().is_ok());
    }

    #[tokio::test]
    async fn test_expired_authorization_is_denied() {
        let h = harness(Duration::from_millis(50)).await;
        let app = Keys::generate();

        h.send(&app, json!({"id": "late", "method": "nip44_decrypt", "params": [app.public_key().to_hex(), "x"]}));
        let response = h.response(&app, "late", false).await;
        assert_eq!(response.error.as_deref(), Some(NOT_AUTHORIZED));
        let records = h.store.requests().await;
        assert!(records.iter().any(|r| r.outcome == Outcome::Expired));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_processed_once() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);

        let event = h.send(&app, json!({"id": "dup", "method": "ping", "params": []}));
        h.relay.inject(event);
        h.response(&app, "dup", false).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.responses(&app).iter().filter(|r| r.id == "dup").count(), 1);
    }

    #[tokio::test]
    async fn test_undecryptable_request_gets_no_response() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Full, vec![]);

        let garbage = EventBuilder::new(Kind::NostrConnect, "not encrypted")
            .tag(Tag::public_key(h.signer.public_key()))
            .sign_with_keys(&app)
            .unwrap();
        h.relay.inject(garbage);
        h.send(&app, json!({"id": "after", "method": "ping", "params": []}));
        h.response(&app, "after", false).await;
        assert_eq!(h.responses(&app).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_is_reported() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.send(&app, json!({"id": "u", "method": "switch_relays", "params": []}));
        let response = h.response(&app, "u", false).await;
        assert_eq!(response.error.as_deref(), Some(UNSUPPORTED_METHOD));
    }

    #[tokio::test]
    async fn test_nip04_request_answered_with_nip04() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);

        let event = h.request_event(
            &app,
            Scheme::Nip04,
            json!({"id": "legacy", "method": "ping", "params": []}),
        );
        h.relay.inject(event);
        h.response(&app, "legacy", false).await;

        let reply = h
            .relay
            .stored_of_kind(Kind::NostrConnect)
            .into_iter()
            .find(|e| e.pubkey == h.signer.public_key())
            .unwrap();
        assert_eq!(Scheme::detect(&reply.content), Scheme::Nip04);
    }

    #[tokio::test]
    async fn test_connect_with_bunker_secret_binds_app() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        let uri = h
            .services
            .connections
            .bunker_uri("main", &h.signer.public_key())
            .await
            .unwrap();
        let secret = url::Url::parse(&uri)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "secret")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        h.send(
            &app,
            json!({"id": "c1", "method": "connect", "params": [h.signer.public_key().to_hex(), secret]}),
        );
        assert_eq!(h.response(&app, "c1", false).await.result, "ack");
        assert!(h.services.registry.is_bound("main", &app.public_key().to_hex()));

        // Bound now, so trust covers ping
        h.send(&app, json!({"id": "c2", "method": "ping", "params": []}));
        assert_eq!(h.response(&app, "c2", false).await.result, "pong");
    }

    #[tokio::test]
    async fn test_repeated_correlation_id_gets_same_answer() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);

        h.send(&app, json!({"id": "same", "method": "ping", "params": []}));
        h.response(&app, "same", false).await;
        h.services
            .registry
            .add_rule("main", &app.public_key().to_hex(), PolicyRule::deny(Method::Ping, None))
            .unwrap();
        // New event, same correlation id
        h.send(&app, json!({"id": "same", "method": "ping", "params": []}));
        assert!(
            wait_until(Duration::from_secs(2), || h
                .responses(&app)
                .iter()
                .filter(|r| r.id == "same")
                .count()
                == 2)
            .await
        );
        assert!(h
            .responses(&app)
            .iter()
            .filter(|r| r.id == "same")
            .all(|r| r.result == "pong"));
    }

    #[tokio::test]
    async fn test_stop_releases_subscriptions() {
        let mut h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.backend
            .add_app_subscription(&app.public_key().to_hex(), &["wss://app.example".to_string()]);
        assert!(h.backend.has_app_subscription(&app.public_key().to_hex()));
        assert_eq!(h.services.subscriptions.subscription_count(), 2);

        h.backend.stop();
        assert_eq!(h.backend.state(), BackendState::Stopped);
        assert_eq!(h.services.subscriptions.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_numeric_correlation_id_is_echoed_as_number() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);

        h.send(&app, json!({"id": 17, "method": "ping", "params": []}));
        assert!(
            wait_until(Duration::from_secs(3), || h
                .responses(&app)
                .iter()
                .any(|r| r.id == json!(17)))
            .await
        );
        let response = h.responses(&app).remove(0);
        assert!(response.id.is_number());
        assert_eq!(response.result, "pong");
    }

    #[tokio::test]
    async fn test_connect_for_another_signer_is_rejected() {
        let h = harness(Duration::from_secs(5)).await;
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Full, vec![]);

        let other = Keys::generate().public_key().to_hex();
        h.send(&app, json!({"id": "wrong", "method": "connect", "params": [other]}));
        let response = h.response(&app, "wrong", false).await;
        assert_eq!(response.error.as_deref(), Some(WRONG_SIGNER));

        h.send(&app, json!({"id": "bare", "method": "connect", "params": []}));
        let response = h.response(&app, "bare", false).await;
        assert_eq!(response.error.as_deref(), Some(WRONG_SIGNER));
    }

    #[tokio::test]
    async fn test_undecryptable_senders_get_no_worker() {
        let h = harness(Duration::from_secs(5)).await;
        for _ in 0..5 {
            let garbage = EventBuilder::new(Kind::NostrConnect, "not encrypted")
                .tag(Tag::public_key(h.signer.public_key()))
                .sign_with_keys(&Keys::generate())
                .unwrap();
            h.relay.inject(garbage);
        }
        let app = Keys::generate();
        h.bind(&app, TrustLevel::Reasonable, vec![]);
        h.send(&app, json!({"id": "real", "method": "ping", "params": []}));
        h.response(&app, "real", false).await;
        assert_eq!(h.backend.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_workers_exit() {
        let mut h = harness(Duration::from_secs(5)).await;
        h.backend.stop();
        h.backend.set_worker_idle(Duration::from_millis(100));
        h.backend.start();
        assert!(wait_until(Duration::from_secs(2), || h.relay.subscription_count() >= 1).await);

        let apps: Vec<Keys> = (0..3).map(|_| Keys::generate()).collect();
        for (i, app) in apps.iter().enumerate() {
            h.bind(app, TrustLevel::Reasonable, vec![]);
            h.send(app, json!({"id": format!("w{i}"), "method": "ping", "params": []}));
        }
        for (i, app) in apps.iter().enumerate() {
            h.response(app, &format!("w{i}"), false).await;
        }
        assert!(wait_until(Duration::from_secs(2), || h.backend.worker_count() == 0).await);

        // A returning app gets a fresh worker
        h.send(&apps[0], json!({"id": "again", "method": "ping", "params": []}));
        assert_eq!(h.response(&apps[0], "again", false).await.result, "pong");
    }

    #[test]
    fn test_invalid_key_material_fails_construction() {
        let (ring, _rx) = KeyRing::new();
        let relay = MemoryRelay::new();
        let pool = RelayPool::new(relay.connector(), PoolOptions::default());
        let registry = Arc::new(AppRegistry::in_memory());
        let store = Arc::new(MemoryStore::new());
        let (connections, _rx) = ConnectionManager::new(
            ConnectionSettings::default(),
            pool.clone(),
            store.clone(),
            store.clone(),
            registry.clone(),
            EventSink::new(),
        );
        let services = BackendServices {
            subscriptions: SubscriptionManager::new(pool.clone()),
            pool,
            acl: Acl::new(registry.clone()),
            connections: Arc::new(connections),
            registry,
            requests: store,
            logs: Arc::new(Journal::disabled()),
            custody: Arc::new(ring),
            sink: EventSink::new(),
            activity: ActivityTracker::new(),
            throttle: Arc::new(LogThrottle::default()),
        };
        let err = Backend::new("broken", &KeySecret::new("zz"), services).err().unwrap();
        assert!(matches!(err, SignetError::InvalidKeyMaterial { .. }));
    }
}
