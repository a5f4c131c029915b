//! Client-side bunker probe
//!
//! Connects to a bunker the way any NIP-46 client would, with a throwaway
//! client key, and asks it for the user public key and one signature. The
//! signed event is never published.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nostr::prelude::*;
use nostr_connect::prelude::*;

/// NIP-46 round trip timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters from a `bunker://` URI
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub remote_signer: PublicKey,
    pub relays: Vec<RelayUrl>,
    pub secret: Option<String>,
}

impl ProbeTarget {
    /// Format: bunker://<remote-signer-pubkey>?relay=wss://...&secret=TOKEN
    pub fn parse(uri: &str) -> Result<Self> {
        let parsed = NostrConnectURI::parse(uri).context("Invalid bunker:// URI format")?;

        match parsed {
            NostrConnectURI::Bunker {
                remote_signer_public_key,
                relays,
                secret,
            } => {
                if relays.is_empty() {
                    anyhow::bail!(
                        "Bunker URI must include at least one relay.\n\
                         Example: bunker://<pubkey>?relay=wss://relay.example&secret=TOKEN"
                    );
                }
                Ok(Self {
                    remote_signer: remote_signer_public_key,
                    relays,
                    secret,
                })
            }
            NostrConnectURI::Client { .. } => {
                anyhow::bail!(
                    "Expected bunker:// URI, got nostrconnect:// URI.\n\
                     Use format: bunker://<pubkey>?relay=wss://...&secret=TOKEN"
                );
            }
        }
    }

    fn to_uri(&self) -> NostrConnectURI {
        NostrConnectURI::Bunker {
            remote_signer_public_key: self.remote_signer,
            relays: self.relays.clone(),
            secret: self.secret.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ProbeReport {
    pub user_pubkey: PublicKey,
    pub signed: Event,
    pub elapsed: Duration,
}

/// Run the probe against a bunker URI
pub async fn probe(uri: &str, timeout: Duration) -> Result<ProbeReport> {
    let target = ProbeTarget::parse(uri)?;
    let started = Instant::now();

    let client_keys = Keys::generate();
    let connect = NostrConnect::new(target.to_uri(), client_keys, timeout, None)
        .map_err(|e| anyhow::anyhow!("Failed to create NIP-46 client: {}", e))?;

    let user_pubkey = connect.get_public_key().await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to get public key from bunker: {}\n\
             \n\
             Is the bunker online? Check:\n\
             - Signet is running with this key unlocked\n\
             - Relay {} is accessible\n\
             - The connection secret has not been used or expired",
            e,
            target
                .relays
                .first()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "(none)".to_string())
        )
    })?;

    let unsigned = EventBuilder::text_note("signet probe").build(user_pubkey);
    let signed = connect
        .sign_event(unsigned)
        .await
        .map_err(|e| anyhow::anyhow!("Bunker signing failed: {}", e))?;
    signed
        .verify()
        .context("Bunker returned an event with an invalid signature")?;

    Ok(ProbeReport {
        user_pubkey,
        signed,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_bunker_uri() {
        let uri = "bunker://79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3?relay=wss://relay.nsec.app&secret=test123";
        let target = ProbeTarget::parse(uri).unwrap();

        assert_eq!(
            target.remote_signer.to_hex(),
            "79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3"
        );
        assert_eq!(target.relays.len(), 1);
        assert_eq!(target.secret, Some("test123".to_string()));
    }

    #[test]
    fn test_parse_bunker_uri_no_secret() {
        let uri = "bunker://79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3?relay=wss://relay.nsec.app";
        let target = ProbeTarget::parse(uri).unwrap();
        assert!(target.secret.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ProbeTarget::parse("https://example.com").is_err());
        assert!(ProbeTarget::parse("bunker://not-a-key?relay=wss://a.example").is_err());
    }
}
