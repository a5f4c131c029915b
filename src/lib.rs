//! Signet: a NIP-46 remote signing daemon
//!
//! Holds private keys and answers signing and encryption requests from apps
//! over Nostr relays, gated by per-app policy, with a remote kill switch and
//! an inactivity dead man's switch.

pub mod admin;
pub mod config;
pub mod custody;
pub mod daemon;
pub mod deadman;
pub mod error;
pub mod events;
pub mod nip46;
pub mod relay;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::SignetConfig;
pub use daemon::Daemon;
pub use error::{Result, SignetError, TransportError};
