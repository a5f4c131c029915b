//! Key custody
//!
//! The signing core treats secrets as opaque handles: it asks custody which
//! keys are active, and custody announces lifecycle changes on a channel that
//! the daemon's lifecycle loop consumes.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use nostr::prelude::*;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::error::{Result, SignetError};

/// Secret key material as configured (nsec or hex). Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(String);

impl KeySecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Parse into signing keys, failing with `InvalidKeyMaterial`
    pub fn to_keys(&self, label: &str) -> Result<Keys> {
        let raw = self.0.trim();
        let keys = if raw.starts_with("nsec") {
            Keys::parse(raw).map_err(|e| SignetError::invalid_key(label, e))?
        } else {
            let secret_key =
                SecretKey::from_hex(raw).map_err(|e| SignetError::invalid_key(label, e))?;
            Keys::new(secret_key)
        };
        Ok(keys)
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Locked,
    Active,
    /// Configured but no key material available
    Offline,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Locked => "locked",
            KeyState::Active => "active",
            KeyState::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub active: usize,
    pub locked: usize,
    pub offline: usize,
}

/// Lifecycle notification from custody to the daemon
#[derive(Debug, Clone)]
pub enum KeyEvent {
    Activated { label: String, secret: KeySecret },
    Locked { label: String },
}

/// Key Custody Service contract
#[async_trait]
pub trait KeyCustody: Send + Sync {
    async fn active_keys(&self) -> BTreeMap<String, KeySecret>;

    async fn activate(&self, label: &str, secret: KeySecret) -> Result<()>;

    /// Returns false when the key was not active
    async fn lock(&self, label: &str) -> Result<bool>;

    /// Returns false when the key was not locked
    async fn unlock(&self, label: &str) -> Result<bool>;

    async fn stats(&self) -> KeyStats;

    async fn states(&self) -> BTreeMap<String, KeyState>;
}

struct Slot {
    state: KeyState,
    secret: Option<KeySecret>,
}

/// In-process keyring. Locked keys keep their material sealed so an
/// administrator can unlock them remotely.
pub struct KeyRing {
    slots: RwLock<BTreeMap<String, Slot>>,
    events: mpsc::UnboundedSender<KeyEvent>,
}

impl KeyRing {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KeyEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ring = Self {
            slots: RwLock::new(BTreeMap::new()),
            events,
        };
        (ring, rx)
    }

    /// Register a label that has no usable material yet
    pub async fn register_offline(&self, label: &str) {
        let mut slots = self.slots.write().await;
        slots.entry(label.to_string()).or_insert(Slot {
            state: KeyState::Offline,
            secret: None,
        });
    }

    /// Store material without activating it
    pub async fn register_locked(&self, label: &str, secret: KeySecret) {
        let mut slots = self.slots.write().await;
        slots.insert(
            label.to_string(),
            Slot {
                state: KeyState::Locked,
                secret: Some(secret),
            },
        );
    }

    fn announce(&self, event: KeyEvent) {
        // Receiver gone means the daemon is shutting down
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl KeyCustody for KeyRing {
    async fn active_keys(&self) -> BTreeMap<String, KeySecret> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .filter(|(_, slot)| slot.state == KeyState::Active)
            .filter_map(|(label, slot)| slot.secret.clone().map(|s| (label.clone(), s)))
            .collect()
    }

    async fn activate(&self, label: &str, secret: KeySecret) -> Result<()> {
        {
            let mut slots = self.slots.write().await;
            if let Some(slot) = slots.get(label) {
                if slot.state == KeyState::Active {
                    return Ok(());
                }
            }
            slots.insert(
                label.to_string(),
                Slot {
                    state: KeyState::Active,
                    secret: Some(secret.clone()),
                },
            );
        }
        info!(key = %label, "Key activated");
        self.announce(KeyEvent::Activated {
            label: label.to_string(),
            secret,
        });
        Ok(())
    }

    async fn lock(&self, label: &str) -> Result<bool> {
        {
            let mut slots = self.slots.write().await;
            let slot = slots
                .get_mut(label)
                .ok_or_else(|| SignetError::UnknownKey(label.to_string()))?;
            if slot.state != KeyState::Active {
                return Ok(false);
            }
            slot.state = KeyState::Locked;
        }
        info!(key = %label, "Key locked");
        self.announce(KeyEvent::Locked {
            label: label.to_string(),
        });
        Ok(true)
    }

    async fn unlock(&self, label: &str) -> Result<bool> {
        let secret = {
            let mut slots = self.slots.write().await;
            let slot = slots
                .get_mut(label)
                .ok_or_else(|| SignetError::UnknownKey(label.to_string()))?;
            match (&slot.state, &slot.secret) {
                (KeyState::Locked, Some(secret)) => {
                    slot.state = KeyState::Active;
                    secret.clone()
                }
                _ => return Ok(false),
            }
        };
        info!(key = %label, "Key unlocked");
        self.announce(KeyEvent::Activated {
            label: label.to_string(),
            secret,
        });
        Ok(true)
    }

    async fn stats(&self) -> KeyStats {
        let slots = self.slots.read().await;
        let mut stats = KeyStats::default();
        for slot in slots.values() {
            match slot.state {
                KeyState::Active => stats.active += 1,
                KeyState::Locked => stats.locked += 1,
                KeyState::Offline => stats.offline += 1,
            }
        }
        stats
    }

    async fn states(&self) -> BTreeMap<String, KeyState> {
        let slots = self.slots.read().await;
        slots.iter().map(|(k, v)| (k.clone(), v.state)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> KeySecret {
        KeySecret::new(Keys::generate().secret_key().to_secret_hex())
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let s = secret();
        assert!(!format!("{:?}", s).contains(s.expose()));
    }

    #[test]
    fn test_secret_parses_hex_and_nsec() {
        let keys = Keys::generate();
        let hex = KeySecret::new(keys.secret_key().to_secret_hex());
        let nsec = KeySecret::new(keys.secret_key().to_bech32().unwrap());
        assert_eq!(hex.to_keys("a").unwrap().public_key(), keys.public_key());
        assert_eq!(nsec.to_keys("a").unwrap().public_key(), keys.public_key());
    }

    #[test]
    fn test_malformed_secret_is_invalid_key_material() {
        let err = KeySecret::new("not-a-key").to_keys("broken").unwrap_err();
        assert!(matches!(err, SignetError::InvalidKeyMaterial { ref label, .. } if label == "broken"));
    }

    #[tokio::test]
    async fn test_lock_unlock_cycle_announces_events() {
        let (ring, mut rx) = KeyRing::new();
        ring.activate("main", secret()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(KeyEvent::Activated { .. })));

        assert!(ring.lock("main").await.unwrap());
        assert!(matches!(rx.recv().await, Some(KeyEvent::Locked { .. })));
        assert!(!ring.lock("main").await.unwrap());
        assert!(ring.active_keys().await.is_empty());

        assert!(ring.unlock("main").await.unwrap());
        assert!(matches!(rx.recv().await, Some(KeyEvent::Activated { .. })));
        assert_eq!(ring.active_keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_count_states() {
        let (ring, _rx) = KeyRing::new();
        ring.activate("a", secret()).await.unwrap();
        ring.register_locked("b", secret()).await;
        ring.register_offline("c").await;

        assert_eq!(
            ring.stats().await,
            KeyStats {
                active: 1,
                locked: 1,
                offline: 1
            }
        );
        assert!(ring.lock("missing").await.is_err());
    }
}
