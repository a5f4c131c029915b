//! Error types for signet
//!
//! Relay-level failures are kept in their own [`TransportError`] so the pool
//! can retry them without inspecting the wider taxonomy. Everything else the
//! core can fail with is a [`SignetError`].

use thiserror::Error;

/// Result type alias for signet operations
pub type Result<T> = std::result::Result<T, SignetError>;

/// Relay transport errors. Always retried, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The relay could not be reached
    #[error("relay {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    /// An established connection dropped
    #[error("relay {0} disconnected")]
    Disconnected(String),

    /// The URL is not a usable relay address
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// No relay currently accepts writes
    #[error("no connected relays")]
    NoConnectedRelays,
}

/// Top-level error type for the signing core
#[derive(Error, Debug)]
pub enum SignetError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Undecryptable or malformed inbound request. The event is dropped
    /// without a response.
    #[error("cannot decrypt request from {sender}: {reason}")]
    Decryption { sender: String, reason: String },

    /// Policy or human denial, surfaced as a protocol error response
    #[error("authorization rejected: {0}")]
    AuthorizationRejected(String),

    /// Malformed secret at key start. Only that key fails to start.
    #[error("invalid key material for {label}: {reason}")]
    InvalidKeyMaterial { label: String, reason: String },

    /// Admin command outside the freshness window or already seen
    #[error("stale or replayed admin command {event_id}")]
    ReplayOrStaleAdminCommand { event_id: String },

    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// Well-formed call with unusable parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("nostr error: {0}")]
    Nostr(String),
}

impl SignetError {
    pub fn decryption(sender: impl ToString, reason: impl ToString) -> Self {
        SignetError::Decryption {
            sender: sender.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn nostr(e: impl ToString) -> Self {
        SignetError::Nostr(e.to_string())
    }

    pub fn invalid_key(label: impl Into<String>, reason: impl ToString) -> Self {
        SignetError::InvalidKeyMaterial {
            label: label.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for SignetError {
    fn from(e: serde_json::Error) -> Self {
        SignetError::InvalidRequest(e.to_string())
    }
}

impl From<std::io::Error> for SignetError {
    fn from(e: std::io::Error) -> Self {
        SignetError::Store(e.to_string())
    }
}
