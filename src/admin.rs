//! Admin command service (kill switch)
//!
//! Listens on the administrator's relays for direct messages from one fixed
//! pubkey, addressed either to an active key or to the daemon's own identity.
//! A command is checked in this order: seen before, sender is the admin,
//! timestamp inside the freshness window. Only then is it executed and
//! answered over the same DM variant it arrived with.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use nostr::nips::{nip04, nip59};
use nostr::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::custody::KeyCustody;
use crate::deadman::{ActivityTracker, Notifier};
use crate::error::{Result, SignetError};
use crate::events::{EventSink, SignetEvent};
use crate::nip46::tagged_pubkeys;
use crate::relay::{Delivery, RelayPool, RelayScope, SubscriptionManager};
use crate::store::{AdminLogRecord, AdminLogStore};

const SUBSCRIPTION_OWNER: &str = "admin:commands";
const SEEN_CAPACITY: usize = 1024;
/// Gift wrap timestamps are randomized up to two days into the past
const GIFT_WRAP_SKEW: Duration = Duration::from_secs(2 * 24 * 3600);

/// Direct message encryption variant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmType {
    #[default]
    #[serde(rename = "NIP04")]
    Nip04,
    #[serde(rename = "NIP17")]
    Nip17,
}

impl DmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmType::Nip04 => "NIP04",
            DmType::Nip17 => "NIP17",
        }
    }

    fn kind(&self) -> Kind {
        match self {
            DmType::Nip04 => Kind::EncryptedDirectMessage,
            DmType::Nip17 => Kind::GiftWrap,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Status,
    Lock(String),
    LockAll,
    Unlock(String),
    Alive,
    Help,
}

impl AdminCommand {
    pub fn parse(text: &str) -> Option<AdminCommand> {
        let mut words = text.split_whitespace();
        let verb = words.next()?.to_ascii_lowercase();
        let arg = words.next();
        match (verb.as_str(), arg) {
            ("status", _) => Some(AdminCommand::Status),
            ("lockall", _) | ("panic", _) => Some(AdminCommand::LockAll),
            ("lock", Some(a)) if a.eq_ignore_ascii_case("all") => Some(AdminCommand::LockAll),
            ("lock", Some(label)) => Some(AdminCommand::Lock(label.to_string())),
            ("unlock", Some(label)) => Some(AdminCommand::Unlock(label.to_string())),
            ("alive", _) => Some(AdminCommand::Alive),
            ("help", _) => Some(AdminCommand::Help),
            _ => None,
        }
    }

    fn event_type(&self) -> &'static str {
        match self {
            AdminCommand::Status => "command_status",
            AdminCommand::Lock(_) => "command_lock",
            AdminCommand::LockAll => "command_lock_all",
            AdminCommand::Unlock(_) => "command_unlock",
            AdminCommand::Alive => "command_alive",
            AdminCommand::Help => "command_help",
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminCommand::Status => f.write_str("status"),
            AdminCommand::Lock(label) => write!(f, "lock {label}"),
            AdminCommand::LockAll => f.write_str("lock all"),
            AdminCommand::Unlock(label) => write!(f, "unlock {label}"),
            AdminCommand::Alive => f.write_str("alive"),
            AdminCommand::Help => f.write_str("help"),
        }
    }
}

const HELP: &str = "Commands: status | lock <key> | lock all (lockall, panic) | unlock <key> | alive | help";

#[derive(Debug, Clone)]
pub struct AdminSettings {
    pub admin: PublicKey,
    pub relays: Vec<String>,
    pub dm_type: DmType,
    pub freshness: Duration,
}

impl AdminSettings {
    pub fn new(admin: PublicKey, relays: Vec<String>, dm_type: DmType) -> Self {
        Self {
            admin,
            relays,
            dm_type,
            freshness: Duration::from_secs(300),
        }
    }
}

/// Collaborators the service calls into
#[derive(Clone)]
pub struct AdminContext {
    pub pool: RelayPool,
    pub subscriptions: SubscriptionManager,
    pub custody: Arc<dyn KeyCustody>,
    pub activity: ActivityTracker,
    pub admin_logs: Arc<dyn AdminLogStore>,
    pub sink: EventSink,
}

/// A decrypted DM
struct Inbound {
    recipient: Keys,
    created_at: Timestamp,
    text: String,
}

#[derive(Default)]
struct Seen {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

pub struct AdminCommandService {
    settings: AdminSettings,
    daemon_keys: Keys,
    ctx: AdminContext,
    identities: RwLock<HashMap<PublicKey, Keys>>,
    deliveries: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    seen: Mutex<Seen>,
}

impl AdminCommandService {
    pub fn new(settings: AdminSettings, daemon_keys: Keys, ctx: AdminContext) -> Self {
        Self {
            settings,
            daemon_keys,
            ctx,
            identities: RwLock::new(HashMap::new()),
            deliveries: Mutex::new(None),
            seen: Mutex::new(Seen::default()),
        }
    }

    pub fn settings(&self) -> &AdminSettings {
        &self.settings
    }

    /// Subscribe and spawn the command loop
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        *self.deliveries.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        self.refresh().await;
        info!(
            admin = %self.settings.admin.to_hex(),
            dm_type = self.settings.dm_type.as_str(),
            relays = self.settings.relays.len(),
            "Kill switch listening"
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match service.handle_event(&delivery.event).await {
                    Ok(Some(command)) => debug!(command = %command, "Admin command handled"),
                    Ok(None) => {}
                    Err(e) => warn!(event_id = %delivery.event.id.to_hex(), error = %e, "Rejected admin command"),
                }
            }
        })
    }

    /// Re-subscribe for the current set of active keys
    pub async fn refresh(&self) {
        let mut identities = HashMap::new();
        identities.insert(self.daemon_keys.public_key(), self.daemon_keys.clone());
        for (label, secret) in self.ctx.custody.active_keys().await {
            match secret.to_keys(&label) {
                Ok(keys) => {
                    identities.insert(keys.public_key(), keys);
                }
                Err(e) => warn!(key = %label, error = %e, "Skipping key for kill switch"),
            }
        }
        let pubkeys: Vec<PublicKey> = identities.keys().copied().collect();
        *self.identities.write().unwrap_or_else(|p| p.into_inner()) = identities;

        let Some(tx) = self
            .deliveries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
        else {
            return;
        };

        let lookback = match self.settings.dm_type {
            DmType::Nip04 => self.settings.freshness,
            DmType::Nip17 => self.settings.freshness + GIFT_WRAP_SKEW,
        };
        let since = Timestamp::now().as_secs().saturating_sub(lookback.as_secs());
        let mut filter = Filter::new()
            .kind(self.settings.dm_type.kind())
            .pubkeys(pubkeys.clone())
            .since(Timestamp::from(since));
        if self.settings.dm_type == DmType::Nip04 {
            filter = filter.author(self.settings.admin);
        }
        self.ctx.subscriptions.ensure(
            SUBSCRIPTION_OWNER,
            filter,
            RelayScope::only(&self.settings.relays),
            tx,
        );
        debug!(identities = pubkeys.len(), "Kill switch subscription refreshed");
    }

    fn seen_before(&self, id: &EventId) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .contains(id)
    }

    /// Returns false when the event was already seen
    fn first_sighting(&self, id: EventId) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if !seen.ids.insert(id) {
            return false;
        }
        seen.order.push_back(id);
        if seen.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        true
    }

    fn recipient(&self, event: &Event) -> Option<Keys> {
        let identities = self.identities.read().unwrap_or_else(|p| p.into_inner());
        tagged_pubkeys(event)
            .into_iter()
            .filter_map(|hex| PublicKey::from_hex(&hex).ok())
            .find_map(|pk| identities.get(&pk).cloned())
    }

    /// Validate, execute and answer one DM. `Ok(None)` means the event was
    /// not for us; stale or replayed commands are errors with no effect.
    pub async fn handle_event(&self, event: &Event) -> Result<Option<AdminCommand>> {
        if self.seen_before(&event.id) {
            return Err(SignetError::ReplayOrStaleAdminCommand {
                event_id: event.id.to_hex(),
            });
        }
        let Some(recipient) = self.recipient(event) else {
            return Ok(None);
        };
        let Some(inbound) = self.open(event, recipient).await? else {
            return Ok(None);
        };
        // Recorded only once the sender checks out
        if !self.first_sighting(event.id) {
            return Err(SignetError::ReplayOrStaleAdminCommand {
                event_id: event.id.to_hex(),
            });
        }

        let now = Timestamp::now().as_secs();
        let sent = inbound.created_at.as_secs();
        if now.abs_diff(sent) > self.settings.freshness.as_secs() {
            return Err(SignetError::ReplayOrStaleAdminCommand {
                event_id: event.id.to_hex(),
            });
        }

        let Some(command) = AdminCommand::parse(&inbound.text) else {
            info!(text_len = inbound.text.len(), "Unrecognized admin command");
            self.reply(&inbound.recipient, &format!("Unknown command. {HELP}"))
                .await;
            return Ok(None);
        };
        info!(command = %command, "Executing admin command");
        let response = self.execute(&command).await;
        self.reply(&inbound.recipient, &response).await;
        Ok(Some(command))
    }

    /// Decrypt and authenticate. `None` when the sender is not the admin.
    async fn open(&self, event: &Event, recipient: Keys) -> Result<Option<Inbound>> {
        match event.kind {
            Kind::EncryptedDirectMessage if self.settings.dm_type == DmType::Nip04 => {
                if event.pubkey != self.settings.admin {
                    debug!(sender = %event.pubkey.to_hex(), "Ignoring DM from non-admin");
                    return Ok(None);
                }
                let text = nip04::decrypt(recipient.secret_key(), &event.pubkey, &event.content)
                    .map_err(|e| SignetError::decryption(event.pubkey.to_hex(), e))?;
                Ok(Some(Inbound {
                    recipient,
                    created_at: event.created_at,
                    text,
                }))
            }
            Kind::GiftWrap if self.settings.dm_type == DmType::Nip17 => {
                let unwrapped = nip59::extract_rumor(&recipient, event)
                    .await
                    .map_err(|e| SignetError::decryption(event.pubkey.to_hex(), e))?;
                if unwrapped.sender != self.settings.admin {
                    debug!(sender = %unwrapped.sender.to_hex(), "Ignoring gift wrap from non-admin");
                    return Ok(None);
                }
                if unwrapped.rumor.kind != Kind::PrivateDirectMessage {
                    return Ok(None);
                }
                Ok(Some(Inbound {
                    recipient,
                    created_at: unwrapped.rumor.created_at,
                    text: unwrapped.rumor.content,
                }))
            }
            _ => Ok(None),
        }
    }

    async fn execute(&self, command: &AdminCommand) -> String {
        let custody = &self.ctx.custody;
        let (reply, key) = match command {
            AdminCommand::Status => (self.status().await, None),
            AdminCommand::Help => (HELP.to_string(), None),
            AdminCommand::Alive => {
                self.ctx.activity.touch();
                ("Check-in recorded. Dead man's switch reset.".to_string(), None)
            }
            AdminCommand::Lock(label) => {
                let reply = match custody.lock(label).await {
                    Ok(true) => format!("Locked {label}"),
                    Ok(false) => format!("{label} is not active"),
                    Err(e) => e.to_string(),
                };
                (reply, Some(label.clone()))
            }
            AdminCommand::Unlock(label) => {
                let reply = match custody.unlock(label).await {
                    Ok(true) => format!("Unlocked {label}"),
                    Ok(false) => format!("{label} is not locked"),
                    Err(e) => e.to_string(),
                };
                (reply, Some(label.clone()))
            }
            AdminCommand::LockAll => {
                let mut locked = Vec::new();
                for label in custody.active_keys().await.into_keys() {
                    match custody.lock(&label).await {
                        Ok(true) => locked.push(label),
                        Ok(false) => {}
                        Err(e) => warn!(key = %label, error = %e, "Failed to lock key"),
                    }
                }
                let reply = if locked.is_empty() {
                    "No active keys to lock".to_string()
                } else {
                    format!("Locked {}", locked.join(", "))
                };
                (reply, None)
            }
        };

        let mut record = AdminLogRecord::new(command.event_type())
            .detail(reply.clone())
            .client("kill_switch", self.settings.dm_type.as_str());
        if let Some(label) = key {
            record = record.key(label);
        }
        self.ctx.sink.emit(SignetEvent::AdminEvent(record.clone()));
        if let Err(e) = self.ctx.admin_logs.create(record).await {
            warn!(error = %e, "Failed to write admin log");
        }
        if !matches!(command, AdminCommand::Status | AdminCommand::Help) {
            self.ctx
                .sink
                .emit(SignetEvent::StatsUpdated(custody.stats().await));
        }
        reply
    }

    async fn status(&self) -> String {
        let stats = self.ctx.custody.stats().await;
        let keys: Vec<String> = self
            .ctx
            .custody
            .states()
            .await
            .into_iter()
            .map(|(label, state)| format!("{label} ({})", state.as_str()))
            .collect();
        format!(
            "Signet: {} active, {} locked, {} offline. Relays {}/{} connected. Keys: {}",
            stats.active,
            stats.locked,
            stats.offline,
            self.ctx.pool.connected_count(),
            self.ctx.pool.relays().len(),
            if keys.is_empty() { "none".to_string() } else { keys.join(", ") }
        )
    }

    async fn build_dm(&self, from: &Keys, text: &str) -> Result<Event> {
        let admin = self.settings.admin;
        match self.settings.dm_type {
            DmType::Nip04 => {
                let content =
                    nip04::encrypt(from.secret_key(), &admin, text).map_err(SignetError::nostr)?;
                EventBuilder::new(Kind::EncryptedDirectMessage, content)
                    .tag(Tag::public_key(admin))
                    .sign_with_keys(from)
                    .map_err(SignetError::nostr)
            }
            DmType::Nip17 => {
                let rumor = EventBuilder::private_msg_rumor(admin, text).build(from.public_key());
                EventBuilder::gift_wrap(from, &admin, rumor, Vec::<Tag>::new())
                    .await
                    .map_err(SignetError::nostr)
            }
        }
    }

    async fn send(&self, from: &Keys, text: &str) -> Result<usize> {
        let event = self.build_dm(from, text).await?;
        let sent = self
            .ctx
            .pool
            .publish(&event, &RelayScope::only(&self.settings.relays))?;
        Ok(sent)
    }

    async fn reply(&self, from: &Keys, text: &str) {
        if let Err(e) = self.send(from, text).await {
            warn!(error = %e, "Failed to send admin reply");
        }
    }
}

#[async_trait]
impl Notifier for AdminCommandService {
    async fn notify(&self, message: &str) -> Result<()> {
        self.send(&self.daemon_keys, message).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{KeyRing, KeySecret};
    use crate::relay::PoolOptions;
    use crate::store::Journal;
    use crate::testing::{wait_until, MemoryRelay};

    const ADMIN_RELAY: &str = "wss://admin.example";

    struct Fixture {
        relay: MemoryRelay,
        admin: Keys,
        daemon: Keys,
        key: Keys,
        ring: Arc<KeyRing>,
        service: Arc<AdminCommandService>,
    }

    async fn fixture(dm_type: DmType) -> Fixture {
        let relay = MemoryRelay::new();
        let pool = RelayPool::new(relay.connector(), PoolOptions::default());
        let subscriptions = SubscriptionManager::new(pool.clone());
        subscriptions.start();
        pool.add_relays(&[ADMIN_RELAY.to_string()]);
        assert!(pool.wait_connected(&pool.relays(), Duration::from_secs(2)).await);

        let (ring, _rx) = KeyRing::new();
        let ring = Arc::new(ring);
        let key = Keys::generate();
        ring.activate("main", KeySecret::new(key.secret_key().to_secret_hex()))
            .await
            .unwrap();

        let admin = Keys::generate();
        let daemon = Keys::generate();
        let service = Arc::new(AdminCommandService::new(
            AdminSettings::new(admin.public_key(), vec![ADMIN_RELAY.to_string()], dm_type),
            daemon.clone(),
            AdminContext {
                pool,
                subscriptions,
                custody: ring.clone(),
                activity: ActivityTracker::new(),
                admin_logs: Arc::new(Journal::disabled()),
                sink: EventSink::new(),
            },
        ));
        service.refresh().await;

        Fixture {
            relay,
            admin,
            daemon,
            key,
            ring,
            service,
        }
    }

    fn nip04_dm(from: &Keys, to: &PublicKey, text: &str, created_at: Timestamp) -> Event {
        let content = nip04::encrypt(from.secret_key(), to, text).unwrap();
        EventBuilder::new(Kind::EncryptedDirectMessage, content)
            .tag(Tag::public_key(*to))
            .custom_created_at(created_at)
            .sign_with_keys(from)
            .unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(AdminCommand::parse("STATUS"), Some(AdminCommand::Status));
        assert_eq!(
            AdminCommand::parse(" lock  main "),
            Some(AdminCommand::Lock("main".into()))
        );
        assert_eq!(AdminCommand::parse("lock all"), Some(AdminCommand::LockAll));
        assert_eq!(AdminCommand::parse("panic"), Some(AdminCommand::LockAll));
        assert_eq!(
            AdminCommand::parse("unlock main"),
            Some(AdminCommand::Unlock("main".into()))
        );
        assert_eq!(AdminCommand::parse("lock"), None);
        assert_eq!(AdminCommand::parse(""), None);
    }

    #[test]
    fn test_dm_type_serde() {
        assert_eq!(serde_json::to_string(&DmType::Nip17).unwrap(), "\"NIP17\"");
        let parsed: DmType = serde_json::from_str("\"NIP04\"").unwrap();
        assert_eq!(parsed, DmType::Nip04);
    }

    #[tokio::test]
    async fn test_fresh_lock_command_locks_and_replies() {
        let f = fixture(DmType::Nip04).await;
        let dm = nip04_dm(&f.admin, &f.key.public_key(), "lock main", Timestamp::now());

        let command = f.service.handle_event(&dm).await.unwrap();
        assert_eq!(command, Some(AdminCommand::Lock("main".into())));
        assert!(f.ring.active_keys().await.is_empty());

        assert!(
            wait_until(Duration::from_secs(2), || !f
                .relay
                .stored_of_kind(Kind::EncryptedDirectMessage)
                .is_empty())
            .await
        );
        let reply = f.relay.stored_of_kind(Kind::EncryptedDirectMessage).remove(0);
        assert_eq!(reply.pubkey, f.key.public_key());
        let text = nip04::decrypt(f.admin.secret_key(), &reply.pubkey, &reply.content).unwrap();
        assert_eq!(text, "Locked main");

        // Same event again is a replay
        assert!(matches!(
            f.service.handle_event(&dm).await,
            Err(SignetError::ReplayOrStaleAdminCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_command_changes_nothing() {
        let f = fixture(DmType::Nip04).await;
        let old = Timestamp::from(Timestamp::now().as_secs() - 3600);
        let dm = nip04_dm(&f.admin, &f.daemon.public_key(), "lock all", old);

        assert!(matches!(
            f.service.handle_event(&dm).await,
            Err(SignetError::ReplayOrStaleAdminCommand { .. })
        ));
        assert_eq!(f.ring.active_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_non_admin_sender_is_ignored() {
        let f = fixture(DmType::Nip04).await;
        let intruder = Keys::generate();
        let dm = nip04_dm(&intruder, &f.daemon.public_key(), "lock all", Timestamp::now());

        assert_eq!(f.service.handle_event(&dm).await.unwrap(), None);
        assert_eq!(f.ring.active_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_command_for_unloaded_identity_can_be_retried() {
        let f = fixture(DmType::Nip04).await;
        let late = Keys::generate();
        let dm = nip04_dm(&f.admin, &late.public_key(), "status", Timestamp::now());

        assert_eq!(f.service.handle_event(&dm).await.unwrap(), None);

        f.ring
            .activate("late", KeySecret::new(late.secret_key().to_secret_hex()))
            .await
            .unwrap();
        f.service.refresh().await;
        assert_eq!(
            f.service.handle_event(&dm).await.unwrap(),
            Some(AdminCommand::Status)
        );
    }

    #[tokio::test]
    async fn test_nip17_unlock_roundtrip() {
        let f = fixture(DmType::Nip17).await;
        f.ring.lock("main").await.unwrap();

        let rumor = EventBuilder::private_msg_rumor(f.daemon.public_key(), "unlock main")
            .build(f.admin.public_key());
        let wrap = EventBuilder::gift_wrap(&f.admin, &f.daemon.public_key(), rumor, Vec::<Tag>::new())
            .await
            .unwrap();

        let command = f.service.handle_event(&wrap).await.unwrap();
        assert_eq!(command, Some(AdminCommand::Unlock("main".into())));
        assert_eq!(f.ring.active_keys().await.len(), 1);

        assert!(
            wait_until(Duration::from_secs(2), || !f
                .relay
                .stored_of_kind(Kind::GiftWrap)
                .iter()
                .all(|e| e.id == wrap.id))
            .await
        );
        let reply = f
            .relay
            .stored_of_kind(Kind::GiftWrap)
            .into_iter()
            .find(|e| e.id != wrap.id)
            .unwrap();
        let unwrapped = nip59::extract_rumor(&f.admin, &reply).await.unwrap();
        assert_eq!(unwrapped.sender, f.daemon.public_key());
        assert_eq!(unwrapped.rumor.content, "Unlocked main");
    }

    #[tokio::test]
    async fn test_subscription_delivers_commands() {
        let f = fixture(DmType::Nip04).await;
        let handle = f.service.start().await;

        let dm = nip04_dm(&f.admin, &f.daemon.public_key(), "lockall", Timestamp::now());
        f.relay.inject(dm);
        let ring = f.ring.clone();
        let mut locked = false;
        for _ in 0..100 {
            if ring.active_keys().await.is_empty() {
                locked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(locked);
        handle.abort();
    }

    #[tokio::test]
    async fn test_notifier_sends_from_daemon_identity() {
        let f = fixture(DmType::Nip04).await;
        f.service.notify("heads up").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || !f
                .relay
                .stored_of_kind(Kind::EncryptedDirectMessage)
                .is_empty())
            .await
        );
        let dm = f
            .relay
            .stored_of_kind(Kind::EncryptedDirectMessage)
            .into_iter()
            .find(|e| e.pubkey == f.daemon.public_key())
            .unwrap();
        let text = nip04::decrypt(f.admin.secret_key(), &dm.pubkey, &dm.content).unwrap();
        assert_eq!(text, "heads up");
    }
}
