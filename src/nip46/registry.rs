//! App bindings
//!
//! A binding ties a remote app's pubkey to one key, with a trust level,
//! standing rules and the relays the app asked to be reached on. Bindings are
//! persisted in a JSON sidecar next to the main config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::acl::{PolicyRule, TrustLevel};
use crate::config::write_private;
use crate::error::{Result, SignetError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppBinding {
    /// App pubkey (hex)
    pub pubkey: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trust: TrustLevel,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Relays the app listens on for responses
    #[serde(default)]
    pub relays: Vec<String>,
    /// Secret the app connected with, if any
    #[serde(default)]
    pub secret: Option<String>,
    pub connected_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

impl AppBinding {
    pub fn new(pubkey: impl Into<String>, trust: TrustLevel) -> Self {
        Self {
            pubkey: pubkey.into(),
            description: None,
            trust,
            rules: Vec::new(),
            relays: Vec::new(),
            secret: None,
            connected_at: Utc::now(),
            last_used: None,
            revoked: false,
        }
    }

    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

type Bindings = BTreeMap<String, BTreeMap<String, AppBinding>>;

#[derive(Serialize, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    keys: Bindings,
}

pub struct AppRegistry {
    path: Option<PathBuf>,
    bindings: RwLock<Bindings>,
}

impl AppRegistry {
    /// Registry that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            bindings: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load from `path`, starting empty when the file does not exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bindings = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&content)
                .map_err(|e| SignetError::Store(format!("invalid app registry: {e}")))?;
            file.keys
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            bindings: RwLock::new(bindings),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Bindings> {
        self.bindings.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Bindings> {
        self.bindings.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key_label: &str, app: &str) -> Option<AppBinding> {
        self.read().get(key_label)?.get(app).cloned()
    }

    /// Whether the app has a live (not revoked) binding
    pub fn is_bound(&self, key_label: &str, app: &str) -> bool {
        self.get(key_label, app).map(|b| !b.revoked).unwrap_or(false)
    }

    /// Insert or replace a binding
    pub fn bind(&self, key_label: &str, binding: AppBinding) -> Result<()> {
        debug!(key = %key_label, app = %binding.pubkey, trust = ?binding.trust, "Binding app");
        self.write()
            .entry(key_label.to_string())
            .or_default()
            .insert(binding.pubkey.clone(), binding);
        self.save()
    }

    /// Mark a binding revoked. Returns false when there was none.
    pub fn revoke(&self, key_label: &str, app: &str) -> Result<bool> {
        let found = {
            let mut bindings = self.write();
            match bindings.get_mut(key_label).and_then(|apps| apps.get_mut(app)) {
                Some(binding) => {
                    binding.revoked = true;
                    true
                }
                None => false,
            }
        };
        if found {
            self.save()?;
        }
        Ok(found)
    }

    /// Add a standing rule to an existing binding
    pub fn add_rule(&self, key_label: &str, app: &str, rule: PolicyRule) -> Result<bool> {
        let found = {
            let mut bindings = self.write();
            match bindings.get_mut(key_label).and_then(|apps| apps.get_mut(app)) {
                Some(binding) => {
                    binding.rules.retain(|r| r.method != rule.method || r.kind != rule.kind);
                    binding.rules.push(rule);
                    true
                }
                None => false,
            }
        };
        if found {
            self.save()?;
        }
        Ok(found)
    }

    /// Live bindings for a key
    pub fn apps_for(&self, key_label: &str) -> Vec<AppBinding> {
        self.read()
            .get(key_label)
            .map(|apps| apps.values().filter(|b| !b.revoked).cloned().collect())
            .unwrap_or_default()
    }

    /// Record use. Kept in memory until the next save.
    pub fn touch(&self, key_label: &str, app: &str) {
        if let Some(binding) = self
            .write()
            .get_mut(key_label)
            .and_then(|apps| apps.get_mut(app))
        {
            binding.last_used = Some(Utc::now());
        }
    }

    /// Persist atomically with owner-only permissions
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RegistryFile {
            keys: self.read().clone(),
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| SignetError::Store(format!("cannot serialize app registry: {e}")))?;

        write_private(path, content.as_bytes())?;
        Ok(())
    }
}
