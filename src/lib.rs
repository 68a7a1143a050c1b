//! Chain-replicated key-value store sharded by hash slot.
//!
//! A file is a set of replica chains. Each chain is an ordered list of
//! storage blocks hosting the same partition: writes enter at the head and
//! flow to the tail, reads are answered by the tail. Hash table files shard
//! their keys over 65536 hash slots (CRC16 of the key) and split or merge
//! shards online as they fill up or drain.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainstore::chain::LocalTransport;
//! use chainstore::client::HashTableClient;
//! use chainstore::config::{ClientConfig, StoreConfig};
//! use chainstore::directory::InMemoryDirectory;
//! use chainstore::storage::{PartitionKind, StorageManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = LocalTransport::new();
//!     let storage = StorageManager::new(16, StoreConfig::default(), transport.clone())?;
//!     let directory = InMemoryDirectory::new(storage);
//!
//!     // Two chains of three replicas each
//!     directory.create("/users", PartitionKind::HashTable, 2, 3, None)?;
//!
//!     let mut table =
//!         HashTableClient::new("/users", transport, directory, ClientConfig::default()).await?;
//!     table.put("user:123", "Alice").await?;
//!     assert_eq!(table.get("user:123").await?.as_deref(), Some("Alice"));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │   HashTableClient  /  ReplicaChainClient    │
//! └─────────────────────────────────────────────┘
//!          │ dstatus, repair          │ request
//!          ▼                          ▼
//! ┌─────────────────┐   ┌─────────────────────────────────┐
//! │    Directory    │   │ ChainLink ─► ChainLink ─► ...   │
//! │ (chains, names) │   │   head         mid        tail  │
//! └─────────────────┘   └─────────────────────────────────┘
//!          │                          │
//!          ▼                          ▼
//! ┌─────────────────────────────────────────────┐
//! │ StorageManager: blocks, arenas, partitions  │
//! │ HashStore: slots, locking, split / merge    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Writes**: applied by every replica in head-assigned sequence order,
//!   acknowledged once the tail has applied them
//! - **Reads**: served by the tail, so they only see fully replicated writes
//! - **Failures**: the directory drops dead replicas and the survivors
//!   retransmit whatever was not yet acknowledged

pub mod chain;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod snapshot;
pub mod storage;
pub mod testing;
pub mod types;

pub use chain::{ChainLink, ChainTransport, LocalTransport};
pub use client::{HashTableClient, ReplicaChainClient};
pub use config::{ClientConfig, HashStoreConfig, StoreConfig};
pub use directory::{DataStatus, Directory, InMemoryDirectory};
pub use error::{Error, Result};
pub use metrics::{Counter, Gauge, LinkMetrics, ShardMetrics};
pub use storage::{HashStore, Partition, PartitionKind, StorageManager};
pub use types::{BlockId, ChainRole, ReplicaChain, Response, SequenceId, SlotRange, Status};
