//! Dead-man's switch
//!
//! Every completed request touches the shared [`ActivityTracker`]. A timer
//! compares the last activity against two thresholds: past the first, one
//! warning goes out; past the second, with no activity in between, every
//! armed active key is locked. Activity resets both.
//!
//! The last activity is saved to disk, so restarting the daemon does not
//! restart the clock.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::write_private;
use crate::custody::KeyCustody;
use crate::error::{Result, SignetError};
use crate::events::{EventSink, SignetEvent};
use crate::store::{AdminLogRecord, AdminLogStore};

/// Minimum spacing between saves of the activity clock
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize)]
struct ActivityFile {
    last_activity: DateTime<Utc>,
}

/// Last successful activity across all keys
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<watch::Sender<DateTime<Utc>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(at: DateTime<Utc>) -> Self {
        let (tx, _) = watch::channel(at);
        Self { last: Arc::new(tx) }
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&self, at: DateTime<Utc>) {
        self.last.send_modify(|last| {
            if at > *last {
                *last = at;
            }
        });
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last.borrow()
    }

    /// Resume from the clock saved at `path`. A missing or unreadable file
    /// starts it now; a saved time in the future is clamped to now.
    pub fn load(path: &Path) -> Self {
        let now = Utc::now();
        let saved = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<ActivityFile>(&content) {
                Ok(file) => Some(file.last_activity.min(now)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable activity file");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read activity file");
                None
            }
        };
        match saved {
            Some(at) => {
                info!(last_activity = %at, "Resuming dead man's switch clock");
                Self::starting_at(at)
            }
            None => Self::starting_at(now),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec(&ActivityFile {
            last_activity: self.last_activity(),
        })?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_private(&path, &content))
            .await
            .map_err(|e| SignetError::Store(format!("activity save task failed: {e}")))??;
        Ok(())
    }

    /// Save now, then after every change, at most once per interval
    pub fn persist(&self, path: PathBuf) -> JoinHandle<()> {
        let tracker = self.clone();
        let mut changes = self.last.subscribe();
        tokio::spawn(async move {
            loop {
                match tracker.save(&path).await {
                    Ok(()) => debug!(path = %path.display(), "Saved activity clock"),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to save activity clock"),
                }
                if changes.changed().await.is_err() {
                    break;
                }
                tokio::time::sleep(PERSIST_INTERVAL).await;
            }
        })
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Out-of-band message to the key owner
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct DeadManSettings {
    pub enabled: bool,
    pub warning_after: Duration,
    pub lock_after: Duration,
    pub check_interval: Duration,
    /// Keys the switch never locks
    pub disarmed_keys: BTreeSet<String>,
}

impl Default for DeadManSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            warning_after: Duration::from_secs(7 * 24 * 3600),
            lock_after: Duration::from_secs(8 * 24 * 3600),
            check_interval: Duration::from_secs(60),
            disarmed_keys: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadManAction {
    Warn,
    Lock,
}

#[derive(Debug, Clone)]
pub struct DeadManState {
    baseline: DateTime<Utc>,
    warned: bool,
    locked: bool,
}

impl DeadManState {
    pub fn new(baseline: DateTime<Utc>) -> Self {
        Self {
            baseline,
            warned: false,
            locked: false,
        }
    }

    pub fn warned(&self) -> bool {
        self.warned
    }

    /// Decide what to do at `now` given the latest activity. The lock only
    /// follows a warning sent on an earlier evaluation.
    pub fn evaluate(
        &mut self,
        settings: &DeadManSettings,
        last_activity: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DeadManAction> {
        if last_activity > self.baseline {
            self.baseline = last_activity;
            self.warned = false;
            self.locked = false;
        }
        if self.locked {
            return None;
        }
        let idle = (now - self.baseline).to_std().unwrap_or_default();
        if !self.warned {
            if idle >= settings.warning_after {
                self.warned = true;
                return Some(DeadManAction::Warn);
            }
            return None;
        }
        if idle >= settings.lock_after {
            self.locked = true;
            return Some(DeadManAction::Lock);
        }
        None
    }
}

fn human(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 86_400 {
        format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3600)
    } else if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

pub struct DeadManSwitchService {
    settings: DeadManSettings,
    disarmed: Mutex<BTreeSet<String>>,
    state: Mutex<DeadManState>,
    activity: ActivityTracker,
    custody: Arc<dyn KeyCustody>,
    notifier: Option<Arc<dyn Notifier>>,
    admin_logs: Arc<dyn AdminLogStore>,
    sink: EventSink,
}

impl DeadManSwitchService {
    pub fn new(
        settings: DeadManSettings,
        activity: ActivityTracker,
        custody: Arc<dyn KeyCustody>,
        notifier: Option<Arc<dyn Notifier>>,
        admin_logs: Arc<dyn AdminLogStore>,
        sink: EventSink,
    ) -> Self {
        let state = DeadManState::new(activity.last_activity());
        Self {
            disarmed: Mutex::new(settings.disarmed_keys.clone()),
            settings,
            state: Mutex::new(state),
            activity,
            custody,
            notifier,
            admin_logs,
            sink,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn arm(&self, label: &str) {
        self.disarmed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(label);
    }

    pub fn disarm(&self, label: &str) {
        self.disarmed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(label.to_string());
    }

    pub fn is_armed(&self, label: &str) -> bool {
        !self
            .disarmed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(label)
    }

    /// Manual proof of life
    pub fn check_in(&self) {
        self.activity.touch();
        info!("Dead man's switch check-in");
    }

    /// Time left before keys lock, if nothing happens
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let idle = (now - self.activity.last_activity())
            .to_std()
            .unwrap_or_default();
        self.settings.lock_after.saturating_sub(idle)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Option<DeadManAction> {
        if !self.settings.enabled {
            return None;
        }
        let action = self
            .state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .evaluate(&self.settings, self.activity.last_activity(), now);

        match action {
            Some(DeadManAction::Warn) => self.warn(now).await,
            Some(DeadManAction::Lock) => self.lock_all().await,
            None => {}
        }
        action
    }

    async fn warn(&self, now: DateTime<Utc>) {
        let remaining = human(self.remaining(now));
        warn!(remaining = %remaining, "Dead man's switch warning");
        let message = format!(
            "Signet dead man's switch: no activity detected. Keys lock in {remaining} unless you reply \"alive\"."
        );
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&message).await {
                error!(error = %e, "Failed to send dead man's switch warning");
            }
        }
        self.record(AdminLogRecord::new("deadman_warning").detail(format!("locks in {remaining}")))
            .await;
    }

    async fn lock_all(&self) {
        let active = self.custody.active_keys().await;
        let mut locked = Vec::new();
        for label in active.keys() {
            if !self.is_armed(label) {
                continue;
            }
            match self.custody.lock(label).await {
                Ok(true) => locked.push(label.clone()),
                Ok(false) => {}
                Err(e) => error!(key = %label, error = %e, "Dead man's switch failed to lock key"),
            }
        }
        warn!(keys = ?locked, "Dead man's switch locked keys");
        if let Some(notifier) = &self.notifier {
            let message = format!(
                "Signet dead man's switch triggered: locked {} key(s).",
                locked.len()
            );
            if let Err(e) = notifier.notify(&message).await {
                error!(error = %e, "Failed to send dead man's switch notice");
            }
        }
        self.record(AdminLogRecord::new("deadman_lock").detail(locked.join(",")))
            .await;
        self.sink
            .emit(SignetEvent::StatsUpdated(self.custody.stats().await));
    }

    async fn record(&self, record: AdminLogRecord) {
        self.sink.emit(SignetEvent::AdminEvent(record.clone()));
        if let Err(e) = self.admin_logs.create(record).await {
            warn!(error = %e, "Failed to write admin log");
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                warning_after = %human(service.settings.warning_after),
                lock_after = %human(service.settings.lock_after),
                "Dead man's switch armed"
            );
            let mut ticker = tokio::time::interval(service.settings.check_interval);
            loop {
                ticker.tick().await;
                service.tick(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{KeyRing, KeySecret};
    use crate::store::Journal;
    use chrono::Duration as ChronoDuration;
    use nostr::prelude::*;
    use crate::error::Result;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, message: &str) -> Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn settings() -> DeadManSettings {
        DeadManSettings {
            enabled: true,
            warning_after: Duration::from_secs(100),
            lock_after: Duration::from_secs(200),
            check_interval: Duration::from_secs(1),
            disarmed_keys: BTreeSet::new(),
        }
    }

    fn secret() -> KeySecret {
        KeySecret::new(Keys::generate().secret_key().to_secret_hex())
    }

    #[test]
    fn test_state_warns_once_then_locks_once() {
        let t0 = Utc::now();
        let s = settings();
        let mut state = DeadManState::new(t0);

        assert_eq!(state.evaluate(&s, t0, t0 + ChronoDuration::seconds(50)), None);
        assert_eq!(
            state.evaluate(&s, t0, t0 + ChronoDuration::seconds(101)),
            Some(DeadManAction::Warn)
        );
        assert_eq!(state.evaluate(&s, t0, t0 + ChronoDuration::seconds(150)), None);
        assert_eq!(
            state.evaluate(&s, t0, t0 + ChronoDuration::seconds(201)),
            Some(DeadManAction::Lock)
        );
        assert_eq!(state.evaluate(&s, t0, t0 + ChronoDuration::seconds(500)), None);
    }

    #[test]
    fn test_activity_resets_warning() {
        let t0 = Utc::now();
        let s = settings();
        let mut state = DeadManState::new(t0);

        assert_eq!(
            state.evaluate(&s, t0, t0 + ChronoDuration::seconds(120)),
            Some(DeadManAction::Warn)
        );
        let active = t0 + ChronoDuration::seconds(130);
        assert_eq!(state.evaluate(&s, active, t0 + ChronoDuration::seconds(210)), None);
        assert!(!state.warned());
        assert_eq!(
            state.evaluate(&s, active, active + ChronoDuration::seconds(100)),
            Some(DeadManAction::Warn)
        );
    }

    #[test]
    fn test_long_gap_still_warns_before_locking() {
        let t0 = Utc::now();
        let s = settings();
        let mut state = DeadManState::new(t0);
        assert_eq!(
            state.evaluate(&s, t0, t0 + ChronoDuration::seconds(1000)),
            Some(DeadManAction::Warn)
        );
        assert_eq!(
            state.evaluate(&s, t0, t0 + ChronoDuration::seconds(1001)),
            Some(DeadManAction::Lock)
        );
    }

    #[tokio::test]
    async fn test_service_locks_armed_keys_exactly_once() {
        let (ring, _rx) = KeyRing::new();
        let ring = Arc::new(ring);
        ring.activate("main", secret()).await.unwrap();
        ring.activate("spare", secret()).await.unwrap();

        let t0 = Utc::now();
        let activity = ActivityTracker::starting_at(t0);
        let recorder = Arc::new(Recorder::default());
        let mut s = settings();
        s.disarmed_keys.insert("spare".to_string());
        let service = DeadManSwitchService::new(
            s,
            activity,
            ring.clone(),
            Some(recorder.clone() as Arc<dyn Notifier>),
            Arc::new(Journal::disabled()),
            EventSink::new(),
        );

        assert_eq!(service.tick(t0 + ChronoDuration::seconds(150)).await, Some(DeadManAction::Warn));
        assert_eq!(service.tick(t0 + ChronoDuration::seconds(160)).await, None);
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);

        assert_eq!(service.tick(t0 + ChronoDuration::seconds(250)).await, Some(DeadManAction::Lock));
        assert_eq!(service.tick(t0 + ChronoDuration::seconds(300)).await, None);

        let active = ring.active_keys().await;
        assert!(!active.contains_key("main"));
        assert!(active.contains_key("spare"));
        assert_eq!(recorder.messages.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_service_does_nothing() {
        let (ring, _rx) = KeyRing::new();
        let mut s = settings();
        s.enabled = false;
        let t0 = Utc::now();
        let service = DeadManSwitchService::new(
            s,
            ActivityTracker::starting_at(t0),
            Arc::new(ring),
            None,
            Arc::new(Journal::disabled()),
            EventSink::new(),
        );
        assert_eq!(service.tick(t0 + ChronoDuration::days(30)).await, None);
    }

    #[tokio::test]
    async fn test_activity_clock_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json");

        let fresh = ActivityTracker::load(&path);
        assert!(Utc::now() - fresh.last_activity() < ChronoDuration::seconds(5));

        let t0 = Utc::now() - ChronoDuration::days(3);
        ActivityTracker::starting_at(t0).save(&path).await.unwrap();
        assert_eq!(ActivityTracker::load(&path).last_activity(), t0);

        let future = Utc::now() + ChronoDuration::days(3);
        ActivityTracker::starting_at(future).save(&path).await.unwrap();
        assert!(ActivityTracker::load(&path).last_activity() <= Utc::now());

        std::fs::write(&path, "garbage").unwrap();
        assert!(Utc::now() - ActivityTracker::load(&path).last_activity() < ChronoDuration::seconds(5));
    }

    #[tokio::test]
    async fn test_persist_writes_current_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json");
        let t0 = Utc::now() - ChronoDuration::hours(1);
        let tracker = ActivityTracker::starting_at(t0);

        let handle = tracker.persist(path.clone());
        let mut saved = false;
        for _ in 0..100 {
            if path.exists() && ActivityTracker::load(&path).last_activity() == t0 {
                saved = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(saved);
    }

    #[test]
    fn test_touch_only_moves_forward() {
        let t0 = Utc::now();
        let tracker = ActivityTracker::starting_at(t0);
        tracker.touch_at(t0 - ChronoDuration::seconds(10));
        assert_eq!(tracker.last_activity(), t0);
        tracker.touch_at(t0 + ChronoDuration::seconds(10));
        assert_eq!(tracker.last_activity(), t0 + ChronoDuration::seconds(10));
    }
}
