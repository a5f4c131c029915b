//! Daemon configuration
//!
//! A single JSON file, created with generated secrets on first boot. App
//! bindings live in an `apps.json` sidecar next to it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nostr::prelude::*;
use serde::{Deserialize, Serialize};

use crate::admin::{AdminSettings, DmType};
use crate::custody::KeySecret;
use crate::deadman::DeadManSettings;
use crate::nip46::connection::random_hex;
use crate::nip46::ConnectionSettings;

pub const DEFAULT_CONFIG_PATH: &str = "~/.signet-config/signet.json";

const DEFAULT_RELAYS: &[&str] = &["wss://relay.nsec.app", "wss://relay.damus.io"];
const SECRET_BYTES: usize = 32;

/// Write `content` to `path` through a temp file and a rename. The file is
/// owner-only from the moment it exists.
pub(crate) fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp_path)?;
    // `mode` only applies when the file is created
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)
}

/// Expand a leading `~` to `$HOME`
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(format!("{}{}", home, rest))
        }
        None => PathBuf::from(path),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NostrSection {
    pub relays: Vec<String>,
}

impl Default for NostrSection {
    fn default() -> Self {
        Self {
            relays: DEFAULT_RELAYS.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// The daemon's own identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdminSection {
    /// Hex secret key
    pub key: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    /// nsec or hex; absent for keys provisioned elsewhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    pub admin_npub: String,
    #[serde(default)]
    pub admin_relays: Vec<String>,
    #[serde(default)]
    pub dm_type: DmType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadManConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_warning_after")]
    pub warning_after_secs: u64,
    #[serde(default = "default_lock_after")]
    pub lock_after_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub disarmed_keys: BTreeSet<String>,
}

fn default_warning_after() -> u64 {
    7 * 24 * 3600
}

fn default_lock_after() -> u64 {
    8 * 24 * 3600
}

fn default_check_interval() -> u64 {
    60
}

fn default_base_url() -> String {
    ConnectionSettings::default().base_url
}

fn default_database() -> String {
    "~/.signet-config/data".to_string()
}

fn default_auth_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignetConfig {
    #[serde(default)]
    pub nostr: NostrSection,
    #[serde(default)]
    pub admin: AdminSection,
    /// Callback base for `auth_url` responses
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Directory for the request and admin journals
    #[serde(default = "default_database")]
    pub database: String,
    /// Overrides where the request journal is written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyEntry>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_switch: Option<KillSwitchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_man_switch: Option<DeadManConfig>,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

impl Default for SignetConfig {
    fn default() -> Self {
        Self {
            nostr: NostrSection::default(),
            admin: AdminSection::default(),
            base_url: default_base_url(),
            database: default_database(),
            logs: None,
            keys: BTreeMap::new(),
            verbose: false,
            jwt_secret: None,
            api_token: None,
            allowed_origins: Vec::new(),
            require_auth: false,
            kill_switch: None,
            dead_man_switch: None,
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

impl SignetConfig {
    /// Load the config, creating it on first boot. Missing secrets are
    /// generated and written back before returning.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let (mut config, existed) = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: SignetConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            (config, true)
        } else {
            (SignetConfig::default(), false)
        };

        let generated = config.fill_secrets();
        if generated || !existed {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).context("Failed to create config directory")?;
            }
            config.save(path)?;
            tracing::info!(path = %path.display(), generated, "Wrote configuration");
        }
        Ok(config)
    }

    /// Generate any missing secret. Returns true if something changed.
    fn fill_secrets(&mut self) -> bool {
        let mut changed = false;
        for slot in [
            &mut self.admin.key,
            &mut self.admin.secret,
            &mut self.jwt_secret,
            &mut self.api_token,
        ] {
            if slot.as_deref().map_or(true, str::is_empty) {
                *slot = Some(random_hex(SECRET_BYTES));
                changed = true;
            }
        }
        changed
    }

    /// Save config to disk atomically. Config holds key material, so the
    /// file is owner-only.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        write_private(path, content.as_bytes()).context("Failed to atomically save config")?;

        Ok(())
    }

    /// App bindings sidecar beside the config file
    pub fn apps_path(config_path: &Path) -> PathBuf {
        config_path.with_file_name("apps.json")
    }

    /// Dead man's switch clock, beside the app bindings
    pub fn activity_path(config_path: &Path) -> PathBuf {
        config_path.with_file_name("activity.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.database)
    }

    pub fn request_journal_path(&self) -> PathBuf {
        match &self.logs {
            Some(dir) => expand_home(dir).join("requests.jsonl"),
            None => self.data_dir().join("requests.jsonl"),
        }
    }

    pub fn admin_journal_path(&self) -> PathBuf {
        self.data_dir().join("admin.jsonl")
    }

    pub fn daemon_keys(&self) -> Result<Keys> {
        let raw = self
            .admin
            .key
            .as_deref()
            .context("admin.key is not set")?;
        let keys = KeySecret::new(raw).to_keys("admin")?;
        Ok(keys)
    }

    /// Store a key under `label`, validating the material first
    pub fn add_key(&mut self, label: &str, secret: &str) -> Result<PublicKey> {
        let label = label.trim();
        if label.is_empty() {
            anyhow::bail!("Key name must not be empty");
        }
        let keys = KeySecret::new(secret).to_keys(label)?;
        self.keys.insert(
            label.to_string(),
            KeyEntry {
                key: Some(secret.trim().to_string()),
            },
        );
        Ok(keys.public_key())
    }

    /// Plain keys with material, and labels without any
    pub fn key_material(&self) -> (BTreeMap<String, KeySecret>, Vec<String>) {
        let mut plain = BTreeMap::new();
        let mut offline = Vec::new();
        for (label, entry) in &self.keys {
            match entry.key.as_deref().filter(|k| !k.trim().is_empty()) {
                Some(key) => {
                    plain.insert(label.clone(), KeySecret::new(key));
                }
                None => offline.push(label.clone()),
            }
        }
        (plain, offline)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            base_url: self.base_url.clone(),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
        }
    }

    pub fn dead_man_settings(&self) -> DeadManSettings {
        match &self.dead_man_switch {
            Some(cfg) => DeadManSettings {
                enabled: cfg.enabled,
                warning_after: Duration::from_secs(cfg.warning_after_secs),
                lock_after: Duration::from_secs(cfg.lock_after_secs),
                check_interval: Duration::from_secs(cfg.check_interval_secs.max(1)),
                disarmed_keys: cfg.disarmed_keys.clone(),
            },
            None => DeadManSettings::default(),
        }
    }

    /// `None` when no kill switch is configured. Falls back to the default
    /// relays when no admin relays are listed.
    pub fn admin_settings(&self) -> Result<Option<AdminSettings>> {
        let Some(cfg) = &self.kill_switch else {
            return Ok(None);
        };
        let admin = PublicKey::parse(cfg.admin_npub.trim())
            .context("Invalid kill_switch.admin_npub")?;
        let relays = if cfg.admin_relays.is_empty() {
            self.nostr.relays.clone()
        } else {
            cfg.admin_relays.clone()
        };
        Ok(Some(AdminSettings::new(admin, relays, cfg.dm_type)))
    }
}
