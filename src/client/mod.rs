//! Clients.
//!
//! ```text
//!   HashTableClient ── hash_slot(key) ──► ReplicaChainClient ──► head / tail
//!         │                                     │
//!         └── dstatus / refresh ──► Directory ◄─┘ resolve_failures
//! ```

mod hash_table;
mod replica_chain;

pub use hash_table::HashTableClient;
pub use replica_chain::ReplicaChainClient;
