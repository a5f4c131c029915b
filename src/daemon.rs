//! Daemon lifecycle
//!
//! [`Daemon`] owns the label -> backend map. Nothing else starts or stops a
//! backend: custody and the connection manager report changes on channels
//! and the lifecycle loop applies them one at a time.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::admin::{AdminCommandService, AdminContext};
use crate::config::SignetConfig;
use crate::custody::{KeyCustody, KeyEvent, KeyRing, KeySecret, KeyStats};
use crate::deadman::{ActivityTracker, DeadManSwitchService, Notifier};
use crate::events::{EventSink, RelaySnapshot, SignetEvent};
use crate::nip46::{
    Acl, AppRegistry, Backend, BackendServices, BackendState, BindingEvent, ConnectionManager,
    LogThrottle,
};
use crate::relay::{Connector, PoolEvent, PoolOptions, RelayPool, SubscriptionManager, WsConnector};
use crate::store::{
    AdminLogRecord, AdminLogStore, Journal, LogStore, MemoryStore, RequestStore, TokenStore,
};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const HEALTH_INTERVAL: Duration = Duration::from_secs(30 * 60);
const HEALTH_FIRST: Duration = Duration::from_secs(30);
const RESET_HEALTH_DELAY: Duration = Duration::from_secs(2);
const REQUEST_RETENTION_HOURS: i64 = 24;
const LOG_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_secs: i64,
    pub relays_connected: usize,
    pub relays_total: usize,
    pub keys: KeyStats,
    pub backends: usize,
    pub subscriptions: usize,
    pub last_pool_reset: Option<DateTime<Utc>>,
}

/// Rows removed by one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub requests: usize,
    pub logs: usize,
    pub admin_logs: usize,
    pub tokens: usize,
}

/// Periodic retention cleanup
#[derive(Clone)]
pub struct Housekeeping {
    requests: Arc<dyn RequestStore>,
    logs: Arc<dyn LogStore>,
    admin_logs: Arc<dyn AdminLogStore>,
    tokens: Arc<dyn TokenStore>,
    custody: Arc<dyn KeyCustody>,
    sink: EventSink,
}

impl Housekeeping {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        logs: Arc<dyn LogStore>,
        admin_logs: Arc<dyn AdminLogStore>,
        tokens: Arc<dyn TokenStore>,
        custody: Arc<dyn KeyCustody>,
        sink: EventSink,
    ) -> Self {
        Self {
            requests,
            logs,
            admin_logs,
            tokens,
            custody,
            sink,
        }
    }

    /// One pass. A failing store is logged and the others still run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupSummary {
        let mut summary = CleanupSummary::default();

        let request_cutoff = now - chrono::Duration::hours(REQUEST_RETENTION_HOURS);
        match self.requests.cleanup_expired(request_cutoff).await {
            Ok(n) => summary.requests = n,
            Err(e) => warn!(error = %e, "Request cleanup failed"),
        }

        let log_cutoff = now - chrono::Duration::days(LOG_RETENTION_DAYS);
        match self.logs.cleanup_expired(log_cutoff).await {
            Ok(n) => summary.logs = n,
            Err(e) => warn!(error = %e, "Log cleanup failed"),
        }
        match self.admin_logs.cleanup_expired(log_cutoff).await {
            Ok(n) => summary.admin_logs = n,
            Err(e) => warn!(error = %e, "Admin log cleanup failed"),
        }
        match self.tokens.cleanup_expired_tokens().await {
            Ok(n) => summary.tokens = n,
            Err(e) => warn!(error = %e, "Token cleanup failed"),
        }

        if summary.requests > 0 || summary.logs > 0 {
            self.sink
                .emit(SignetEvent::StatsUpdated(self.custody.stats().await));
        }
        if summary != CleanupSummary::default() {
            info!(
                requests = summary.requests,
                logs = summary.logs,
                admin_logs = summary.admin_logs,
                tokens = summary.tokens,
                "Cleanup removed expired records"
            );
        }
        summary
    }

    /// Hourly, starting now
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once(Utc::now()).await;
            }
        })
    }
}

pub struct Daemon {
    config: SignetConfig,
    services: BackendServices,
    ring: Arc<KeyRing>,
    admin: Option<Arc<AdminCommandService>>,
    deadman: Arc<DeadManSwitchService>,
    activity_path: PathBuf,
    admin_logs: Arc<dyn AdminLogStore>,
    housekeeping: Housekeeping,
    backends: HashMap<String, Backend>,
    key_events: Option<mpsc::UnboundedReceiver<KeyEvent>>,
    binding_events: Option<mpsc::UnboundedReceiver<BindingEvent>>,
    pool_events: Option<broadcast::Receiver<PoolEvent>>,
    health_tx: mpsc::UnboundedSender<()>,
    health_rx: Option<mpsc::UnboundedReceiver<()>>,
    started_at: DateTime<Utc>,
    last_reset: Option<DateTime<Utc>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Wire every component over websocket relays
    pub fn new(config: SignetConfig, config_path: &Path) -> Result<Self> {
        Self::with_connector(config, config_path, Arc::new(WsConnector::default()))
    }

    pub fn with_connector(
        config: SignetConfig,
        config_path: &Path,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        for journal in [config.request_journal_path(), config.admin_journal_path()] {
            if let Some(dir) = journal.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }

        let pool = RelayPool::new(connector, PoolOptions::default());
        let subscriptions = SubscriptionManager::new(pool.clone());
        let sink = EventSink::new();
        let store = Arc::new(MemoryStore::new());
        let logs: Arc<dyn LogStore> = Arc::new(Journal::new(config.request_journal_path()));
        let admin_logs: Arc<dyn AdminLogStore> =
            Arc::new(Journal::new(config.admin_journal_path()));
        let registry = Arc::new(
            AppRegistry::load(SignetConfig::apps_path(config_path))
                .context("Failed to load app registry")?,
        );

        let (ring, key_events) = KeyRing::new();
        let ring = Arc::new(ring);
        let custody: Arc<dyn KeyCustody> = ring.clone();

        let (connections, binding_events) = ConnectionManager::new(
            config.connection_settings(),
            pool.clone(),
            store.clone(),
            store.clone(),
            registry.clone(),
            sink.clone(),
        );
        let activity_path = SignetConfig::activity_path(config_path);
        let activity = ActivityTracker::load(&activity_path);

        let services = BackendServices {
            pool: pool.clone(),
            subscriptions: subscriptions.clone(),
            acl: Acl::new(registry.clone()),
            connections: Arc::new(connections),
            registry,
            requests: store.clone(),
            logs: logs.clone(),
            custody: custody.clone(),
            sink: sink.clone(),
            activity: activity.clone(),
            throttle: Arc::new(LogThrottle::default()),
        };

        let admin = match config.admin_settings()? {
            Some(settings) => {
                let ctx = AdminContext {
                    pool: pool.clone(),
                    subscriptions,
                    custody: custody.clone(),
                    activity: activity.clone(),
                    admin_logs: admin_logs.clone(),
                    sink: sink.clone(),
                };
                Some(Arc::new(AdminCommandService::new(
                    settings,
                    config.daemon_keys()?,
                    ctx,
                )))
            }
            None => None,
        };

        let notifier = admin.clone().map(|a| a as Arc<dyn Notifier>);
        let deadman = Arc::new(DeadManSwitchService::new(
            config.dead_man_settings(),
            activity,
            custody.clone(),
            notifier,
            admin_logs.clone(),
            sink.clone(),
        ));

        let housekeeping = Housekeeping::new(
            store.clone(),
            logs,
            admin_logs.clone(),
            store,
            custody,
            sink,
        );

        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let pool_events = pool.events();

        Ok(Self {
            config,
            services,
            ring,
            admin,
            deadman,
            activity_path,
            admin_logs,
            housekeeping,
            backends: HashMap::new(),
            key_events: Some(key_events),
            binding_events: Some(binding_events),
            pool_events: Some(pool_events),
            health_tx,
            health_rx: Some(health_rx),
            started_at: Utc::now(),
            last_reset: None,
            tasks: Vec::new(),
        })
    }

    pub fn custody(&self) -> Arc<dyn KeyCustody> {
        self.services.custody.clone()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.services.connections
    }

    pub fn pool(&self) -> &RelayPool {
        &self.services.pool
    }

    pub fn sink(&self) -> &EventSink {
        &self.services.sink
    }

    pub fn deadman(&self) -> &Arc<DeadManSwitchService> {
        &self.deadman
    }

    pub fn backend(&self, label: &str) -> Option<&Backend> {
        self.backends.get(label)
    }

    pub fn backend_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.backends.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Connect, activate keys and start every background service. With a
    /// non-empty `only`, keys outside it are loaded locked.
    pub async fn boot(&mut self, only: &[String]) -> Result<()> {
        self.tasks.push(self.services.subscriptions.start());

        let relays = self.config.nostr.relays.clone();
        if self.services.pool.connect(&relays) == 0 {
            anyhow::bail!("nostr.relays has no usable relay URL");
        }
        self.tasks.push(self.services.pool.start_monitoring());

        self.activate_configured(only).await;
        self.process_pending().await;

        if let Some(admin) = &self.admin {
            self.tasks.push(admin.start().await);
        }
        self.tasks
            .push(self.services.activity.persist(self.activity_path.clone()));
        if self.deadman.enabled() {
            self.tasks.push(self.deadman.start());
        }
        self.tasks.push(self.housekeeping.clone().start());

        self.admin_log(
            AdminLogRecord::new("daemon_started")
                .detail(format!("keys={} relays={}", self.backends.len(), relays.len())),
        )
        .await;
        info!(
            keys = self.backends.len(),
            relays = relays.len(),
            kill_switch = self.admin.is_some(),
            dead_man_switch = self.deadman.enabled(),
            "Signet started"
        );
        Ok(())
    }

    async fn activate_configured(&self, only: &[String]) {
        let (plain, offline) = self.config.key_material();

        for label in offline {
            info!(key = %label, "Key has no material, leaving offline");
            self.ring.register_offline(&label).await;
        }

        for (label, secret) in plain {
            if let Err(e) = secret.to_keys(&label) {
                error!(key = %label, error = %e, "Invalid key material, leaving offline");
                self.ring.register_offline(&label).await;
                continue;
            }
            if !only.is_empty() && !only.contains(&label) {
                info!(key = %label, "Key not selected, leaving locked");
                self.ring.register_locked(&label, secret).await;
                continue;
            }
            if let Err(e) = self.ring.activate(&label, secret).await {
                warn!(key = %label, error = %e, "Failed to activate key");
            }
        }

        for label in only {
            if !self.config.keys.contains_key(label) {
                warn!(key = %label, "Requested key is not configured");
            }
        }
    }

    /// Apply every queued key and binding change. Returns how many were
    /// handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut key_events = Vec::new();
        if let Some(rx) = self.key_events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                key_events.push(event);
            }
        }
        let mut binding_events = Vec::new();
        if let Some(rx) = self.binding_events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                binding_events.push(event);
            }
        }

        let handled = key_events.len() + binding_events.len();
        for event in key_events {
            self.handle_key_event(event).await;
        }
        for event in binding_events {
            self.handle_binding_event(event);
        }
        handled
    }

    async fn handle_key_event(&mut self, event: KeyEvent) {
        match event {
            KeyEvent::Activated { label, secret } => self.start_backend(&label, &secret).await,
            KeyEvent::Locked { label } => self.stop_backend(&label),
        }
        if let Some(admin) = &self.admin {
            admin.refresh().await;
        }
        let stats = self.services.custody.stats().await;
        info!(
            active = stats.active,
            locked = stats.locked,
            offline = stats.offline,
            "Key stats"
        );
        self.services.sink.emit(SignetEvent::StatsUpdated(stats));
    }

    async fn start_backend(&mut self, label: &str, secret: &KeySecret) {
        if self
            .backends
            .get(label)
            .is_some_and(|b| b.state() != BackendState::Stopped)
        {
            debug!(key = %label, "Backend already running");
            return;
        }

        let mut backend = match Backend::new(label, secret, self.services.clone()) {
            Ok(backend) => backend,
            Err(e) => {
                error!(key = %label, error = %e, "Cannot start backend");
                self.admin_log(
                    AdminLogRecord::new("key_error")
                        .key(label)
                        .detail(e.to_string()),
                )
                .await;
                return;
            }
        };
        backend.start();

        match self
            .services
            .connections
            .bunker_uri(label, &backend.public_key())
            .await
        {
            Ok(uri) => info!(key = %label, uri = %uri, "Bunker URI (single use, valid 24h)"),
            Err(e) => warn!(key = %label, error = %e, "Failed to mint bunker URI"),
        }
        self.backends.insert(label.to_string(), backend);
    }

    fn stop_backend(&mut self, label: &str) {
        match self.backends.remove(label) {
            Some(mut backend) => backend.stop(),
            None => debug!(key = %label, "No backend to stop"),
        }
    }

    fn handle_binding_event(&mut self, event: BindingEvent) {
        match event {
            BindingEvent::Bound {
                key_label,
                app,
                relays,
            } => match self.backends.get_mut(&key_label) {
                Some(backend) => backend.add_app_subscription(&app, &relays),
                None => debug!(key = %key_label, app, "App bound to a key without backend"),
            },
            BindingEvent::Revoked { key_label, app } => {
                if let Some(backend) = self.backends.get_mut(&key_label) {
                    backend.remove_app_subscription(&app);
                }
            }
        }
    }

    async fn handle_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::SleepDetected { gap } => {
                info!(gap_secs = gap.as_secs(), "Refreshing kill switch after sleep");
                if let Some(admin) = &self.admin {
                    admin.refresh().await;
                }
            }
            PoolEvent::PoolReset => {
                self.last_reset = Some(Utc::now());
                let tx = self.health_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RESET_HEALTH_DELAY).await;
                    let _ = tx.send(());
                });
            }
            PoolEvent::StatusChanged { connected, total } => {
                self.services
                    .sink
                    .emit(SignetEvent::RelaysUpdated(RelaySnapshot {
                        connected,
                        total,
                        relays: self.services.pool.statuses(),
                    }));
            }
            PoolEvent::RelayConnected(url) => debug!(relay = %url, "Relay up"),
            PoolEvent::RelayDisconnected(url) => debug!(relay = %url, "Relay down"),
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        let pool = &self.services.pool;
        let relays_connected = pool.connected_count();
        HealthReport {
            status: if relays_connected > 0 {
                HealthStatus::Ok
            } else {
                HealthStatus::Degraded
            },
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            relays_connected,
            relays_total: pool.relays().len(),
            keys: self.services.custody.stats().await,
            backends: self.backends.len(),
            subscriptions: self.services.subscriptions.subscription_count(),
            last_pool_reset: self.last_reset,
        }
    }

    async fn log_health(&self) {
        let report = self.health_report().await;
        let last_reset = report
            .last_pool_reset
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        match report.status {
            HealthStatus::Ok => info!(
                status = report.status.as_str(),
                uptime_secs = report.uptime_secs,
                relays = %format!("{}/{}", report.relays_connected, report.relays_total),
                active_keys = report.keys.active,
                locked_keys = report.keys.locked,
                subscriptions = report.subscriptions,
                last_pool_reset = %last_reset,
                "Health"
            ),
            HealthStatus::Degraded => warn!(
                status = report.status.as_str(),
                uptime_secs = report.uptime_secs,
                relays = %format!("{}/{}", report.relays_connected, report.relays_total),
                active_keys = report.keys.active,
                locked_keys = report.keys.locked,
                subscriptions = report.subscriptions,
                last_pool_reset = %last_reset,
                "Health"
            ),
        }
    }

    async fn admin_log(&self, record: AdminLogRecord) {
        self.services
            .sink
            .emit(SignetEvent::AdminEvent(record.clone()));
        if let Err(e) = self.admin_logs.create(record).await {
            warn!(error = %e, "Failed to write admin log");
        }
    }

    /// Run until Ctrl-C
    pub async fn run(self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Lifecycle loop. Returns after `shutdown` resolves and everything has
    /// been stopped.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let (Some(mut key_events), Some(mut binding_events), Some(mut pool_events), Some(mut health_rx)) = (
            self.key_events.take(),
            self.binding_events.take(),
            self.pool_events.take(),
            self.health_rx.take(),
        ) else {
            warn!("Lifecycle loop already ran");
            return;
        };

        let mut health = interval_at(Instant::now() + HEALTH_FIRST, HEALTH_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = key_events.recv() => self.handle_key_event(event).await,
                Some(event) = binding_events.recv() => self.handle_binding_event(event),
                event = pool_events.recv() => match event {
                    Ok(event) => self.handle_pool_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Lifecycle loop lagged behind pool events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = health.tick() => self.log_health().await,
                Some(()) = health_rx.recv() => self.log_health().await,
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        for (_, mut backend) in self.backends.drain() {
            backend.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.services.pool.shutdown();
        if let Err(e) = self.services.activity.save(&self.activity_path).await {
            warn!(error = %e, "Failed to save activity clock");
        }
        self.admin_log(AdminLogRecord::new("daemon_stopped")).await;
        info!("Signet stopped");
    }
}
