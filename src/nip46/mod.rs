//! NIP-46 remote signing
//!
//! Wire messages, the access-control engine, app bindings, the connection
//! manager that drives interactive authorization and bootstrap, and the
//! per-key protocol backend. `probe` is the client side, used to check a
//! running bunker.

pub mod acl;
pub mod backend;
pub mod connection;
pub mod message;
pub mod probe;
pub mod registry;

pub use acl::{evaluate, Acl, ApprovalType, Decision, LogThrottle, PolicyRule, TrustLevel, Verdict};
pub use backend::{Backend, BackendServices, BackendState};
pub use connection::{BindingEvent, ConnectionManager, ConnectionSettings, NostrConnectOffer};
pub use message::{tagged_pubkeys, EventTemplate, Method, RpcRequest, RpcResponse, Scheme};
pub use registry::{AppBinding, AppRegistry};
