//! Connection Manager
//!
//! Interactive authorization: a request the ACL cannot decide is parked under
//! a fresh internal id, announced on the event sink, and awaited for a bounded
//! time. The HTTP layer (or a test) resolves it through [`ConnectionManager::decide`].
//!
//! Bootstrap: bunker URIs carry a one-time token that binds the redeeming app
//! on its first `connect`; `nostrconnect://` URIs are accepted by answering
//! the client on its own relays. Both flows end in the same binding and the
//! same [`BindingEvent::Bound`] notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use nostr::prelude::*;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::acl::{ApprovalType, TrustLevel};
use super::message::{seal_envelope, RpcRequest, RpcResponse, Scheme};
use super::registry::{AppBinding, AppRegistry};
use crate::error::{Result, SignetError};
use crate::events::{EventSink, PendingRequest, SignetEvent};
use crate::relay::{RelayPool, RelayScope};
use crate::store::{ConnectionToken, Outcome, RequestRecord, RequestStore, TokenStore};

/// Bunker URI token lifetime
pub const TOKEN_TTL_HOURS: i64 = 24;

const NOSTRCONNECT_RELAY_WAIT: Duration = Duration::from_secs(10);

/// Binding changes the daemon forwards to the owning backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEvent {
    Bound {
        key_label: String,
        app: String,
        relays: Vec<String>,
    },
    Revoked {
        key_label: String,
        app: String,
    },
}

/// Random hex string of `bytes` bytes
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A parked request waiting on a human
#[derive(Debug)]
pub struct AuthTicket {
    pub request_id: String,
    pub auth_url: String,
    rx: oneshot::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub base_url: String,
    pub auth_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            auth_timeout: Duration::from_secs(60),
        }
    }
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    pool: RelayPool,
    tokens: Arc<dyn TokenStore>,
    requests: Arc<dyn RequestStore>,
    registry: Arc<AppRegistry>,
    sink: EventSink,
    bindings: mpsc::UnboundedSender<BindingEvent>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        pool: RelayPool,
        tokens: Arc<dyn TokenStore>,
        requests: Arc<dyn RequestStore>,
        registry: Arc<AppRegistry>,
        sink: EventSink,
    ) -> (Self, mpsc::UnboundedReceiver<BindingEvent>) {
        let (bindings, rx) = mpsc::unbounded_channel();
        let manager = Self {
            settings,
            pool,
            tokens,
            requests,
            registry,
            sink,
            bindings,
            pending: Mutex::new(HashMap::new()),
        };
        (manager, rx)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    fn auth_url(&self, request_id: &str) -> String {
        format!(
            "{}/requests/{}",
            self.settings.base_url.trim_end_matches('/'),
            request_id
        )
    }

    /// Park a request for a human decision
    pub async fn open_authorization(
        &self,
        key_label: &str,
        caller: &str,
        request: &RpcRequest,
    ) -> Result<AuthTicket> {
        let request_id = random_hex(16);
        let auth_url = self.auth_url(&request_id);
        let params = (!request.params.is_empty()).then(|| request.params.join(","));

        self.requests
            .create(RequestRecord {
                request_id: request_id.clone(),
                correlation_id: request.id.clone(),
                key_name: key_label.to_string(),
                method: request.method.clone(),
                remote_pubkey: caller.to_string(),
                params: params.clone(),
                outcome: Outcome::Pending,
                approval_type: None,
                created_at: Utc::now(),
                resolved_at: None,
            })
            .await?;

        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id.clone(), tx);

        info!(key = %key_label, method = %request.method, request_id = %request_id, "Awaiting authorization");
        self.sink.emit(SignetEvent::RequestPending(PendingRequest {
            request_id: request_id.clone(),
            key_name: key_label.to_string(),
            method: request.method.clone(),
            remote_pubkey: caller.to_string(),
            params,
            auth_url: auth_url.clone(),
        }));

        Ok(AuthTicket {
            request_id,
            auth_url,
            rx,
        })
    }

    /// Deliver a human decision. Returns false when the request is no longer
    /// pending (already decided or expired).
    pub fn decide(&self, request_id: &str, approved: bool) -> bool {
        match self.pending().remove(request_id) {
            Some(tx) => tx.send(approved).is_ok(),
            None => {
                debug!(request_id, "Decision for a request that is no longer pending");
                false
            }
        }
    }

    /// Wait for the decision. Expiry and rejection both resolve as
    /// `AuthorizationRejected`; the stored outcome is written exactly once.
    pub async fn await_decision(&self, ticket: AuthTicket) -> Result<ApprovalType> {
        let AuthTicket {
            request_id, mut rx, ..
        } = ticket;

        let outcome = match tokio::time::timeout(self.settings.auth_timeout, &mut rx).await {
            Ok(Ok(true)) => Outcome::Granted,
            Ok(Ok(false)) | Ok(Err(_)) => Outcome::Denied,
            Err(_) => {
                if self.pending().remove(&request_id).is_some() {
                    Outcome::Expired
                } else {
                    // A decision raced the timeout and won
                    match rx.try_recv() {
                        Ok(true) => Outcome::Granted,
                        _ => Outcome::Denied,
                    }
                }
            }
        };

        if let Err(e) = self.requests.resolve(&request_id, outcome).await {
            warn!(request_id = %request_id, error = %e, "Failed to record authorization outcome");
        }

        match outcome {
            Outcome::Granted => Ok(ApprovalType::Manual),
            Outcome::Expired => {
                info!(request_id = %request_id, "Authorization timed out");
                Err(SignetError::AuthorizationRejected("timed out".into()))
            }
            _ => Err(SignetError::AuthorizationRejected("denied".into())),
        }
    }

    /// Mint a one-time bunker URI for a key
    pub async fn bunker_uri(&self, key_label: &str, key_pubkey: &PublicKey) -> Result<String> {
        let token = random_hex(16);
        let now = Utc::now();
        self.tokens
            .issue(ConnectionToken {
                token: token.clone(),
                key_name: key_label.to_string(),
                created_at: now,
                expires_at: now + chrono::Duration::hours(TOKEN_TTL_HOURS),
                redeemed_at: None,
            })
            .await?;

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for relay in self.pool.default_relays() {
            query.append_pair("relay", &relay);
        }
        query.append_pair("secret", &token);
        Ok(format!("bunker://{}?{}", key_pubkey.to_hex(), query.finish()))
    }

    /// Redeem a bunker URI secret offered in `connect`. Binds the app at
    /// trust `reasonable` on success.
    pub async fn redeem_connect(&self, key_label: &str, app: &str, secret: &str) -> Result<bool> {
        let Some(token) = self.tokens.redeem(secret, key_label).await? else {
            debug!(key = %key_label, app, "Connect secret rejected");
            return Ok(false);
        };
        let mut binding = AppBinding::new(app, TrustLevel::Reasonable);
        binding.secret = Some(token.token);
        self.bind(key_label, binding)?;
        info!(key = %key_label, app, "App connected with bunker secret");
        Ok(true)
    }

    pub fn bind(&self, key_label: &str, binding: AppBinding) -> Result<()> {
        let event = BindingEvent::Bound {
            key_label: key_label.to_string(),
            app: binding.pubkey.clone(),
            relays: binding.relays.clone(),
        };
        self.registry.bind(key_label, binding)?;
        let _ = self.bindings.send(event);
        Ok(())
    }

    /// Revoke a binding and invalidate the secret it connected with
    pub async fn revoke(&self, key_label: &str, app: &str) -> Result<bool> {
        let secret = self.registry.get(key_label, app).and_then(|b| b.secret);
        if !self.registry.revoke(key_label, app)? {
            return Ok(false);
        }
        if let Some(secret) = secret {
            self.tokens.revoke(&secret).await?;
        }
        info!(key = %key_label, app, "App revoked");
        let _ = self.bindings.send(BindingEvent::Revoked {
            key_label: key_label.to_string(),
            app: app.to_string(),
        });
        Ok(true)
    }

    /// Accept a client-initiated `nostrconnect://` URI for a key
    pub async fn accept_nostrconnect(
        &self,
        keys: &Keys,
        key_label: &str,
        uri: &str,
        trust: TrustLevel,
    ) -> Result<AppBinding> {
        let offer = NostrConnectOffer::parse(uri)?;

        let relays = self.pool.add_relays(&offer.relays);
        if relays.is_empty() {
            return Err(SignetError::InvalidRequest(
                "nostrconnect uri has no usable relays".into(),
            ));
        }
        if !self.pool.wait_connected(&relays, NOSTRCONNECT_RELAY_WAIT).await {
            warn!(key = %key_label, "No client relay connected yet, publishing anyway");
        }

        let response = RpcResponse::ok(random_hex(8), offer.secret.clone()).to_json()?;
        let envelope = seal_envelope(keys, &offer.client, Scheme::Nip44, &response)?;
        self.pool
            .publish(&envelope, &RelayScope::Only(relays.clone()))?;

        let mut binding = AppBinding::new(offer.client.to_hex(), trust).with_relays(relays);
        binding.description = offer.name;
        binding.secret = Some(offer.secret);
        self.bind(key_label, binding.clone())?;
        info!(key = %key_label, app = %binding.pubkey, "Accepted nostrconnect client");
        Ok(binding)
    }
}

/// Parsed `nostrconnect://` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NostrConnectOffer {
    pub client: PublicKey,
    pub relays: Vec<String>,
    pub secret: String,
    pub name: Option<String>,
}

impl NostrConnectOffer {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| SignetError::InvalidRequest(format!("nostrconnect uri: {reason}"));
        let parsed = url::Url::parse(uri.trim()).map_err(|_| invalid("not a uri"))?;
        if parsed.scheme() != "nostrconnect" {
            return Err(invalid("wrong scheme"));
        }
        let client = parsed
            .host_str()
            .and_then(|host| PublicKey::from_hex(host).ok())
            .ok_or_else(|| invalid("bad client pubkey"))?;

        let mut relays = Vec::new();
        let mut secret = None;
        let mut name = None;
        for (k, v) in parsed.query_pairs() {
            match k.as_ref() {
                "relay" => relays.push(v.into_owned()),
                "secret" => secret = Some(v.into_owned()),
                "name" => name = Some(v.into_owned()),
                _ => {}
            }
        }
        let secret = secret.ok_or_else(|| invalid("missing secret"))?;
        Ok(Self {
            client,
            relays,
            secret,
            name,
        })
    }
}
