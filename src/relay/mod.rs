//! Relay plumbing: transport seam, self-healing pool, shared subscriptions

pub mod connector;
pub mod pool;
pub mod subscriptions;

pub use connector::{Connector, RelayLink, WsConnector};
pub use pool::{
    backoff_delay, normalize_url, Inbound, PoolEvent, PoolOptions, RelayPool, RelayScope,
    RelayStatus,
};
pub use subscriptions::{Delivery, SubscriptionManager};
