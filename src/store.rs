//! Persisted record collaborators
//!
//! The core only needs `create` and cutoff-based cleanup from its stores.
//! [`MemoryStore`] backs requests and connection tokens; [`Journal`] is an
//! append-only JSONL file for approval and admin logs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::nip46::ApprovalType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    AutoApproved,
    Granted,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Internal id, distinct from the caller's correlation id
    pub request_id: String,
    pub correlation_id: String,
    pub key_name: String,
    pub method: String,
    pub remote_pubkey: String,
    pub params: Option<String>,
    pub outcome: Outcome,
    pub approval_type: Option<ApprovalType>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// `approval` or `denial`
    #[serde(rename = "type")]
    pub kind: String,
    pub key_name: String,
    pub method: String,
    pub params: Option<String>,
    pub remote_pubkey: String,
    pub auto_approved: bool,
    pub approval_type: Option<ApprovalType>,
    pub event_kind: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminLogRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub key_name: Option<String>,
    pub detail: Option<String>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
}

impl AdminLogRecord {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            key_name: None,
            detail: None,
            client_name: None,
            client_version: None,
        }
    }

    pub fn key(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = Some(key_name.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn client(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self.client_version = Some(version.into());
        self
    }
}

/// Activity entry for a permitted request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub event_kind: Option<u16>,
    pub key_name: String,
    pub app_pubkey: String,
    pub app_name: Option<String>,
    pub auto_approved: bool,
    pub approval_type: Option<ApprovalType>,
}

/// One-time secret embedded in a bunker URI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionToken {
    pub token: String,
    pub key_name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn create(&self, record: RequestRecord) -> Result<()>;
    async fn resolve(&self, request_id: &str, outcome: Outcome) -> Result<()>;
    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn create(&self, record: LogRecord) -> Result<()>;
    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait AdminLogStore: Send + Sync {
    async fn create(&self, record: AdminLogRecord) -> Result<()>;
    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn issue(&self, token: ConnectionToken) -> Result<()>;
    /// Consume a live token for `key_name`. `None` if unknown, expired,
    /// already redeemed, or issued for another key.
    async fn redeem(&self, token: &str, key_name: &str) -> Result<Option<ConnectionToken>>;
    async fn revoke(&self, token: &str) -> Result<bool>;
    async fn cleanup_expired_tokens(&self) -> Result<usize>;
}

/// In-memory request and token store
#[derive(Default)]
pub struct MemoryStore {
    requests: Mutex<Vec<RequestRecord>>,
    tokens: Mutex<HashMap<String, ConnectionToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requests(&self) -> Vec<RequestRecord> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, record: RequestRecord) -> Result<()> {
        self.requests.lock().await.push(record);
        Ok(())
    }

    async fn resolve(&self, request_id: &str, outcome: Outcome) -> Result<()> {
        let mut requests = self.requests.lock().await;
        if let Some(record) = requests.iter_mut().find(|r| r.request_id == request_id) {
            record.outcome = outcome;
            record.resolved_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut requests = self.requests.lock().await;
        let before = requests.len();
        requests.retain(|r| r.created_at >= cutoff);
        Ok(before - requests.len())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn issue(&self, token: ConnectionToken) -> Result<()> {
        self.tokens.lock().await.insert(token.token.clone(), token);
        Ok(())
    }

    async fn redeem(&self, token: &str, key_name: &str) -> Result<Option<ConnectionToken>> {
        let mut tokens = self.tokens.lock().await;
        let now = Utc::now();
        match tokens.get_mut(token) {
            Some(t) if t.key_name == key_name && t.redeemed_at.is_none() && t.expires_at > now => {
                t.redeemed_at = Some(now);
                Ok(Some(t.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke(&self, token: &str) -> Result<bool> {
        Ok(self.tokens.lock().await.remove(token).is_some())
    }

    async fn cleanup_expired_tokens(&self) -> Result<usize> {
        let mut tokens = self.tokens.lock().await;
        let now = Utc::now();
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > now && t.redeemed_at.is_none());
        Ok(before - tokens.len())
    }
}

/// Append-only JSONL journal
pub struct Journal {
    path: PathBuf,
    enabled: bool,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
            lock: Mutex::new(()),
        }
    }

    /// A journal that drops every record
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::from("/dev/null"),
            enabled: false,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the journal keeping entries at or after `cutoff`
    async fn retain_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        if !self.enabled || !tokio::fs::try_exists(&self.path).await? {
            return Ok(0);
        }
        let _guard = self.lock.lock().await;
        let content = tokio::fs::read_to_string(&self.path).await?;
        let mut kept = Vec::new();
        let mut removed = 0;
        for line in content.lines() {
            let timestamp = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v["timestamp"].as_str().map(str::to_string))
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok());
            match timestamp {
                Some(ts) if ts.with_timezone(&Utc) < cutoff => removed += 1,
                _ => kept.push(line),
            }
        }
        if removed > 0 {
            let tmp_path = self.path.with_extension("jsonl.tmp");
            let mut content = kept.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            tokio::fs::write(&tmp_path, content).await?;
            tokio::fs::rename(&tmp_path, &self.path).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl LogStore for Journal {
    async fn create(&self, record: LogRecord) -> Result<()> {
        self.append(&record).await
    }

    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.retain_since(cutoff).await
    }
}

#[async_trait]
impl AdminLogStore for Journal {
    async fn create(&self, record: AdminLogRecord) -> Result<()> {
        self.append(&record).await
    }

    async fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.retain_since(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(value: &str, key: &str, ttl: Duration) -> ConnectionToken {
        let now = Utc::now();
        ConnectionToken {
            token: value.to_string(),
            key_name: key.to_string(),
            created_at: now,
            expires_at: now + ttl,
            redeemed_at: None,
        }
    }

    #[tokio::test]
    async fn test_token_redeems_once() {
        let store = MemoryStore::new();
        store.issue(token("abc", "main", Duration::hours(1))).await.unwrap();

        assert!(store.redeem("abc", "other").await.unwrap().is_none());
        assert!(store.redeem("abc", "main").await.unwrap().is_some());
        assert!(store.redeem("abc", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_tokens_cleaned() {
        let store = MemoryStore::new();
        store.issue(token("old", "main", Duration::seconds(-1))).await.unwrap();
        store.issue(token("new", "main", Duration::hours(1))).await.unwrap();

        assert!(store.redeem("old", "main").await.unwrap().is_none());
        assert_eq!(store.cleanup_expired_tokens().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_journal_writes_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path().join("admin.jsonl"));

        let mut old = AdminLogRecord::new("command_lock").key("main");
        old.timestamp = Utc::now() - Duration::days(40);
        AdminLogStore::create(&journal, old).await.unwrap();
        AdminLogStore::create(&journal, AdminLogRecord::new("daemon_started"))
            .await
            .unwrap();

        let removed = AdminLogStore::cleanup_expired(&journal, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let content = std::fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry["event_type"], "daemon_started");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_journal_concurrent_appends_stay_whole() {
        let dir = tempfile::tempdir().unwrap();
        let journal = std::sync::Arc::new(Journal::new(dir.path().join("admin.jsonl")));

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let journal = journal.clone();
                tokio::spawn(async move {
                    let record = AdminLogRecord::new("command_status").key(format!("k{i}"));
                    AdminLogStore::create(journal.as_ref(), record).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let content = tokio::fs::read_to_string(journal.path()).await.unwrap();
        assert_eq!(content.lines().count(), 20);
        assert!(content
            .lines()
            .all(|line| serde_json::from_str::<serde_json::Value>(line).is_ok()));
    }

    #[tokio::test]
    async fn test_journal_disabled() {
        let journal = Journal::disabled();
        // Should not touch the filesystem
        AdminLogStore::create(&journal, AdminLogRecord::new("test")).await.unwrap();
        assert_eq!(
            AdminLogStore::cleanup_expired(&journal, Utc::now()).await.unwrap(),
            0
        );
    }
}
