//! Chain replication.
//!
//! # Architecture
//!
//! ```text
//!            client
//!              │ request (mutator)          ▲ reply (client map)
//!              ▼                            │
//!   ┌──────────────────┐  chain_request  ┌──────────┐  chain_request  ┌──────────────────┐
//!   │ head ChainLink   │ ──────────────► │   mid    │ ──────────────► │ tail ChainLink   │
//!   │ seq + pending    │ ◄────────────── │ pending  │ ◄────────────── │ notify + events  │
//!   └──────────────────┘       ack       └──────────┘       ack       └──────────────────┘
//! ```
//!
//! Links never point at each other. They hold connection ids into a
//! [`ChainTransport`], which owns the edges.

pub mod clients;
pub mod link;
pub mod subscription;
pub mod transport;

pub use clients::{ClientMap, Reply};
pub use link::{ChainLink, PendingRequest};
pub use subscription::{Notification, SubscriptionMap};
pub use transport::{
    ChainMessage, ChainTransport, Connection, ConnectionId, LocalTransport, UpstreamHandle,
};
