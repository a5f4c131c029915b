//! Access control for remote signing requests
//!
//! [`evaluate`] is a pure function of the app binding, the method and (for
//! `sign_event`) the event kind. Explicit denials beat explicit grants,
//! explicit grants beat the binding's trust level, and anything left over is
//! escalated to a human.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::message::{EventTemplate, Method};
use super::registry::{AppBinding, AppRegistry};

/// How much an app is trusted without asking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Every request needs a human
    Paranoid,
    /// Read-only and encryption requests pass; signing and decryption ask
    #[default]
    Reasonable,
    /// Everything passes
    Full,
}

impl TrustLevel {
    pub fn auto_approves(&self, method: Method) -> bool {
        match self {
            TrustLevel::Paranoid => false,
            TrustLevel::Full => true,
            TrustLevel::Reasonable => matches!(
                method,
                Method::Connect
                    | Method::Ping
                    | Method::GetPublicKey
                    | Method::GetRelays
                    | Method::Nip04Encrypt
                    | Method::Nip44Encrypt
            ),
        }
    }

    pub fn parse(s: &str) -> Option<TrustLevel> {
        match s.to_ascii_lowercase().as_str() {
            "paranoid" => Some(TrustLevel::Paranoid),
            "reasonable" => Some(TrustLevel::Reasonable),
            "full" => Some(TrustLevel::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

/// A standing per-app decision, optionally narrowed to one event kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<u16>,
    pub verdict: Verdict,
}

impl PolicyRule {
    pub fn allow(method: Method, kind: Option<u16>) -> Self {
        Self {
            method: method.as_str().to_string(),
            kind,
            verdict: Verdict::Allow,
        }
    }

    pub fn deny(method: Method, kind: Option<u16>) -> Self {
        Self {
            method: method.as_str().to_string(),
            kind,
            verdict: Verdict::Deny,
        }
    }

    /// A kindless rule covers every kind of its method
    pub fn matches(&self, method: Method, kind: Option<u16>) -> bool {
        if self.method != method.as_str() {
            return false;
        }
        match (self.kind, kind) {
            (None, _) => true,
            (Some(rule_kind), Some(kind)) => rule_kind == kind,
            (Some(_), None) => false,
        }
    }
}

/// How a permitted request got its permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// A human approved it
    Manual,
    /// Covered by the app's trust level
    AutoTrust,
    /// Covered by an explicit grant
    AutoPermission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow(ApprovalType),
    Deny,
    /// Escalate to interactive authorization
    Ask,
}

pub fn evaluate(binding: Option<&AppBinding>, method: Method, kind: Option<u16>) -> Decision {
    let Some(binding) = binding else {
        return Decision::Ask;
    };
    if binding.revoked {
        return Decision::Deny;
    }
    let matching: Vec<&PolicyRule> = binding
        .rules
        .iter()
        .filter(|rule| rule.matches(method, kind))
        .collect();
    if matching.iter().any(|rule| rule.verdict == Verdict::Deny) {
        return Decision::Deny;
    }
    if matching.iter().any(|rule| rule.verdict == Verdict::Allow) {
        return Decision::Allow(ApprovalType::AutoPermission);
    }
    if binding.trust.auto_approves(method) {
        return Decision::Allow(ApprovalType::AutoTrust);
    }
    Decision::Ask
}

/// Policy lookups against the app registry
#[derive(Clone)]
pub struct Acl {
    registry: Arc<AppRegistry>,
}

impl Acl {
    pub fn new(registry: Arc<AppRegistry>) -> Self {
        Self { registry }
    }

    /// Decide a request. `first_param` is the first RPC parameter, used to
    /// read the event kind for `sign_event`.
    pub fn check(
        &self,
        key_label: &str,
        caller: &str,
        method: Method,
        first_param: Option<&str>,
    ) -> Decision {
        let kind = match method {
            Method::SignEvent => first_param.and_then(EventTemplate::peek_kind),
            _ => None,
        };
        let binding = self.registry.get(key_label, caller);
        evaluate(binding.as_ref(), method, kind)
    }
}

/// Rate limit for auto-approval log writes, per key and method
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<HashMap<(String, String), Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_log(&self, key_label: &str, method: &str) -> bool {
        self.should_log_at(key_label, method, Instant::now())
    }

    pub fn should_log_at(&self, key_label: &str, method: &str, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let slot = (key_label.to_string(), method.to_string());
        match last.get(&slot) {
            Some(previous) if now.saturating_duration_since(*previous) < self.interval => false,
            _ => {
                last.insert(slot, now);
                true
            }
        }
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
