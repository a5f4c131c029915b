//! NIP-46 wire messages
//!
//! Requests and responses travel as kind 24133 events, addressed with a `p`
//! tag and encrypted to the peer. NIP-44 v2 is the default; a payload that
//! carries the NIP-04 `?iv=` marker is answered with NIP-04.

use std::fmt;
use std::str::FromStr;

use nostr::nips::{nip04, nip44};
use nostr::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SignetError};

/// Remote signing methods this signer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Connect,
    GetPublicKey,
    SignEvent,
    Ping,
    GetRelays,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::Connect,
        Method::GetPublicKey,
        Method::SignEvent,
        Method::Ping,
        Method::GetRelays,
        Method::Nip04Encrypt,
        Method::Nip04Decrypt,
        Method::Nip44Encrypt,
        Method::Nip44Decrypt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "connect",
            Method::GetPublicKey => "get_public_key",
            Method::SignEvent => "sign_event",
            Method::Ping => "ping",
            Method::GetRelays => "get_relays",
            Method::Nip04Encrypt => "nip04_encrypt",
            Method::Nip04Decrypt => "nip04_decrypt",
            Method::Nip44Encrypt => "nip44_encrypt",
            Method::Nip44Decrypt => "nip44_decrypt",
        }
    }

    pub fn parse(name: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = SignetError;

    fn from_str(s: &str) -> Result<Self> {
        Method::parse(s).ok_or_else(|| SignetError::InvalidRequest(format!("unsupported method {s}")))
    }
}

/// Decrypted request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcRequest {
    /// Correlation id as text, for lookups and records
    pub id: String,
    /// Correlation id exactly as sent, echoed in the response
    #[serde(skip)]
    pub raw_id: Value,
    pub method: String,
    pub params: Vec<String>,
}

impl RpcRequest {
    /// Parse a request. Non-string params are kept as their JSON text.
    pub fn parse(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let (id, raw_id) = match value.get("id") {
            Some(Value::String(id)) => (id.clone(), Value::String(id.clone())),
            Some(Value::Number(n)) => (n.to_string(), Value::Number(n.clone())),
            _ => return Err(SignetError::InvalidRequest("missing request id".into())),
        };
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| SignetError::InvalidRequest("missing method".into()))?
            .to_string();
        let params = match value.get("params") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            id,
            raw_id,
            method,
            params,
        })
    }

    pub fn method(&self) -> Option<Method> {
        Method::parse(&self.method)
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: Value,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<Value>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: result.into(),
            error: None,
        }
    }

    pub fn error(id: impl Into<Value>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: String::new(),
            error: Some(error.into()),
        }
    }

    /// Ask the caller to open `url` to approve the pending request
    pub fn auth_url(id: impl Into<Value>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: "auth_url".to_string(),
            error: Some(url.into()),
        }
    }

    pub fn is_auth_url(&self) -> bool {
        self.result == "auth_url"
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload encryption scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Nip04,
    Nip44,
}

impl Scheme {
    pub fn detect(content: &str) -> Scheme {
        if content.contains("?iv=") {
            Scheme::Nip04
        } else {
            Scheme::Nip44
        }
    }

    pub fn encrypt(&self, keys: &Keys, peer: &PublicKey, plaintext: &str) -> Result<String> {
        let ciphertext = match self {
            Scheme::Nip04 => nip04::encrypt(keys.secret_key(), peer, plaintext)
                .map_err(SignetError::nostr)?,
            Scheme::Nip44 => {
                nip44::encrypt(keys.secret_key(), peer, plaintext, nip44::Version::V2)
                    .map_err(SignetError::nostr)?
            }
        };
        Ok(ciphertext)
    }

    pub fn decrypt(&self, keys: &Keys, peer: &PublicKey, ciphertext: &str) -> Result<String> {
        match self {
            Scheme::Nip04 => nip04::decrypt(keys.secret_key(), peer, ciphertext)
                .map_err(|e| SignetError::decryption(peer.to_hex(), e)),
            Scheme::Nip44 => nip44::decrypt(keys.secret_key(), peer, ciphertext)
                .map_err(|e| SignetError::decryption(peer.to_hex(), e)),
        }
    }
}

/// Unsigned event handed to `sign_event`
#[derive(Debug, Clone, Deserialize)]
pub struct EventTemplate {
    pub kind: u16,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub created_at: Option<u64>,
    pub pubkey: Option<String>,
}

impl EventTemplate {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SignetError::InvalidRequest(format!("invalid event template: {e}")))
    }

    /// Cheap look at the kind without a full parse, for policy checks
    pub fn peek_kind(json: &str) -> Option<u16> {
        serde_json::from_str::<Value>(json)
            .ok()?
            .get("kind")?
            .as_u64()
            .and_then(|k| u16::try_from(k).ok())
    }

    pub fn sign(&self, keys: &Keys) -> Result<Event> {
        if let Some(pubkey) = &self.pubkey {
            if !pubkey.is_empty() && *pubkey != keys.public_key().to_hex() {
                return Err(SignetError::InvalidRequest(
                    "event pubkey does not match signer".into(),
                ));
            }
        }
        let mut tags = Vec::with_capacity(self.tags.len());
        for raw in &self.tags {
            let tag = Tag::parse(raw.clone())
                .map_err(|e| SignetError::InvalidRequest(format!("invalid tag: {e}")))?;
            tags.push(tag);
        }
        let created_at = self
            .created_at
            .map(Timestamp::from)
            .unwrap_or_else(Timestamp::now);
        EventBuilder::new(Kind::from(self.kind), self.content.clone())
            .tags(tags)
            .custom_created_at(created_at)
            .sign_with_keys(keys)
            .map_err(SignetError::nostr)
    }
}

/// Encrypt `payload` to `recipient` and wrap it in a kind 24133 event
pub fn seal_envelope(
    keys: &Keys,
    recipient: &PublicKey,
    scheme: Scheme,
    payload: &str,
) -> Result<Event> {
    let content = scheme.encrypt(keys, recipient, payload)?;
    EventBuilder::new(Kind::NostrConnect, content)
        .tag(Tag::public_key(*recipient))
        .sign_with_keys(keys)
        .map_err(SignetError::nostr)
}

/// Decrypt an inbound kind 24133 event. Returns the scheme it used so the
/// reply can match.
pub fn open_envelope(keys: &Keys, event: &Event) -> Result<(Scheme, String)> {
    if event.kind != Kind::NostrConnect {
        return Err(SignetError::decryption(
            event.pubkey.to_hex(),
            format!("unexpected kind {}", event.kind.as_u16()),
        ));
    }
    let scheme = Scheme::detect(&event.content);
    let plaintext = scheme.decrypt(keys, &event.pubkey, &event.content)?;
    Ok((scheme, plaintext))
}

/// Hex pubkeys named in an event's `p` tags
pub fn tagged_pubkeys(event: &Event) -> Vec<String> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let parts = tag.as_slice();
            match (parts.first(), parts.get(1)) {
                (Some(name), Some(value)) if name == "p" => Some(value.clone()),
                _ => None,
            }
        })
        .collect()
}
