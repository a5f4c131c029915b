//! Subscription manager
//!
//! Owners (a key's backend, an app binding, the admin listener) register the
//! filters they need. Identical filter+scope pairs share one relay
//! subscription. Every shared subscription is re-issued whenever a relay
//! (re)connects, so owners never have to notice reconnects. When the router
//! falls behind and events are skipped, everything is re-issued so relays
//! send the stored backlog again; owners dedupe by event id.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nostr::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pool::{Inbound, PoolEvent, RelayPool, RelayScope};

/// An event routed to one owner
#[derive(Debug, Clone)]
pub struct Delivery {
    pub relay: String,
    pub subscription_id: String,
    pub event: Event,
}

struct Shared {
    id: String,
    filter: Filter,
    scope: RelayScope,
    owners: BTreeSet<String>,
}

struct Owner {
    key: String,
    sink: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct State {
    /// Dedupe key to shared subscription
    shared: HashMap<String, Shared>,
    /// Relay subscription id to dedupe key
    by_id: HashMap<String, String>,
    owners: HashMap<String, Owner>,
}

struct Inner {
    pool: RelayPool,
    state: Mutex<State>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

fn dedupe_key(filter: &Filter, scope: &RelayScope) -> String {
    let filter_json = serde_json::to_string(filter).unwrap_or_default();
    format!("{}|{}", scope.key(), filter_json)
}

impl SubscriptionManager {
    pub fn new(pool: RelayPool) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                state: Mutex::new(State::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register (or replace) the filter an owner listens on. Events matching
    /// it are sent to `sink` until [`release`](Self::release) is called.
    pub fn ensure(
        &self,
        owner: &str,
        filter: Filter,
        scope: RelayScope,
        sink: mpsc::UnboundedSender<Delivery>,
    ) {
        let scope = match scope {
            RelayScope::Only(urls) => RelayScope::Only(self.inner.pool.add_relays(&urls)),
            scope => scope,
        };
        let key = dedupe_key(&filter, &scope);

        let mut guard = self.state();
        let state = &mut *guard;

        if let Some(existing) = state.owners.get_mut(owner) {
            if existing.key == key {
                existing.sink = sink;
                return;
            }
        }
        self.detach(state, owner, Some(&scope));

        let created = if let Some(shared) = state.shared.get_mut(&key) {
            shared.owners.insert(owner.to_string());
            None
        } else {
            let id = format!(
                "signet-{}",
                self.inner.next_id.fetch_add(1, Ordering::Relaxed)
            );
            let mut owners = BTreeSet::new();
            owners.insert(owner.to_string());
            state.shared.insert(
                key.clone(),
                Shared {
                    id: id.clone(),
                    filter: filter.clone(),
                    scope: scope.clone(),
                    owners,
                },
            );
            state.by_id.insert(id.clone(), key.clone());
            Some(id)
        };
        state.owners.insert(owner.to_string(), Owner { key, sink });
        drop(guard);

        if let Some(id) = created {
            let mut sent = 0;
            for url in self.inner.pool.resolve(&scope) {
                if self.inner.pool.send_req(&url, &id, &filter) {
                    sent += 1;
                }
            }
            debug!(owner, subscription = %id, relays = sent, "Opened subscription");
        }
    }

    /// Stop delivering to `owner`, closing the relay subscription when it
    /// was the last one using it
    pub fn release(&self, owner: &str) {
        let mut guard = self.state();
        self.detach(&mut guard, owner, None);
    }

    /// Remove `owner`. Relays in `keep` stay even if nothing uses them yet.
    fn detach(&self, state: &mut State, owner: &str, keep: Option<&RelayScope>) {
        let Some(previous) = state.owners.remove(owner) else {
            return;
        };
        let now_unused = match state.shared.get_mut(&previous.key) {
            Some(shared) => {
                shared.owners.remove(owner);
                shared.owners.is_empty()
            }
            None => false,
        };
        if now_unused {
            if let Some(shared) = state.shared.remove(&previous.key) {
                state.by_id.remove(&shared.id);
                for url in self.inner.pool.resolve(&shared.scope) {
                    self.inner.pool.send_close(&url, &shared.id);
                }
                debug!(owner, subscription = %shared.id, "Closed subscription");
                if let RelayScope::Only(urls) = &shared.scope {
                    let keep: &[String] = match keep {
                        Some(RelayScope::Only(kept)) => kept.as_slice(),
                        _ => &[],
                    };
                    self.retire_unused(state, urls, keep);
                }
            }
        }
    }

    /// Drop explicit relays no remaining subscription needs
    fn retire_unused(&self, state: &State, urls: &[String], keep: &[String]) {
        let unused: Vec<String> = urls
            .iter()
            .filter(|url| !keep.contains(url))
            .filter(|url| {
                !state.shared.values().any(|s| match &s.scope {
                    RelayScope::Only(other) => other.contains(url),
                    RelayScope::Default => false,
                })
            })
            .cloned()
            .collect();
        if !unused.is_empty() {
            self.inner.pool.remove_relays(&unused);
        }
    }

    /// Number of distinct relay subscriptions
    pub fn subscription_count(&self) -> usize {
        self.state().shared.len()
    }

    pub fn owner_count(&self) -> usize {
        self.state().owners.len()
    }

    pub fn has_owner(&self, owner: &str) -> bool {
        self.state().owners.contains_key(owner)
    }

    /// Re-issue subscriptions, to one relay or to all. Returns REQs sent.
    pub fn resubscribe(&self, relay: Option<&str>) -> usize {
        let targets: Vec<(String, Filter, Vec<String>)> = self
            .state()
            .shared
            .values()
            .map(|s| (s.id.clone(), s.filter.clone(), self.inner.pool.resolve(&s.scope)))
            .collect();

        let mut sent = 0;
        for (id, filter, urls) in targets {
            for url in urls {
                if relay.map(|r| r == url).unwrap_or(true)
                    && self.inner.pool.send_req(&url, &id, &filter)
                {
                    sent += 1;
                }
            }
        }
        sent
    }

    fn route(&self, inbound: Inbound) {
        let state = self.state();
        let Some(key) = state.by_id.get(&inbound.subscription_id) else {
            return;
        };
        let Some(shared) = state.shared.get(key) else {
            return;
        };
        for owner in &shared.owners {
            if let Some(entry) = state.owners.get(owner) {
                let _ = entry.sink.send(Delivery {
                    relay: inbound.relay.clone(),
                    subscription_id: inbound.subscription_id.clone(),
                    event: inbound.event.clone(),
                });
            }
        }
    }

    /// Spawn the router. Call before connecting the pool so no connect
    /// notification is missed.
    pub fn start(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut events = self.inner.pool.events();
        let mut inbound = self.inner.pool.inbound();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(PoolEvent::RelayConnected(url)) => {
                            let sent = manager.resubscribe(Some(&url));
                            debug!(relay = %url, subscriptions = sent, "Re-issued subscriptions");
                        }
                        Ok(PoolEvent::PoolReset) => {
                            info!("Pool reset, subscriptions follow on reconnect");
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscription manager lagged on pool events");
                            manager.resubscribe(None);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    message = inbound.recv() => match message {
                        Ok(message) => manager.route(message),
                        Err(RecvError::Lagged(skipped)) => {
                            let sent = manager.resubscribe(None);
                            warn!(skipped, resent = sent, "Subscription router lagged, re-requesting backlog");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
