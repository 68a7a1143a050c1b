//! Testing utilities for the store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │  LocalTransport ◄──── kill_block() for failure injection        │
//! │        │                                                        │
//! │  StorageManager ──── blocks, arenas, chain links                │
//! │        │                                                        │
//! │  InMemoryDirectory ── files, chains, repair                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use chainstore::testing::TestCluster;
//!
//! let cluster = TestCluster::new(8, StoreConfig::default())?;
//! cluster.create_table("/t", 1, 3)?;
//! let mut table = cluster.table_client("/t").await?;
//! table.put("k", "v").await?;
//! cluster.kill_block(0);
//! ```

mod utils;

mod auto_scaling_tests;
mod chain_replication_tests;

pub use utils::{wait_for, wait_until};
#[cfg(test)]
pub(crate) use utils::init_tracing;

use crate::chain::{ChainLink, LocalTransport};
use crate::client::{HashTableClient, ReplicaChainClient};
use crate::config::StoreConfig;
use crate::directory::{DataStatus, Directory, InMemoryDirectory};
use crate::error::Result;
use crate::storage::hashtable::HashStore;
use crate::storage::manager::StorageManager;
use crate::storage::partition::PartitionKind;
use crate::types::{BlockId, ReplicaChain};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Storage, directory and transport wired together in one process.
pub struct TestCluster {
    pub transport: Arc<LocalTransport>,
    pub storage: Arc<StorageManager>,
    pub directory: Arc<InMemoryDirectory>,
    pub config: StoreConfig,
    /// When the test started.
    pub started_at: Instant,
}

impl TestCluster {
    /// Create a cluster with `num_blocks` free blocks.
    pub fn new(num_blocks: usize, config: StoreConfig) -> Result<Self> {
        let transport = LocalTransport::new();
        let storage = StorageManager::new(num_blocks, config.clone(), transport.clone())?;
        let directory = InMemoryDirectory::new(Arc::clone(&storage));
        Ok(Self {
            transport,
            storage,
            directory,
            config,
            started_at: Instant::now(),
        })
    }

    /// Create a hash table file with `num_chains` chains of `chain_length`.
    pub fn create_table(&self, path: &str, num_chains: usize, chain_length: usize) -> Result<DataStatus> {
        self.directory
            .create(path, PartitionKind::HashTable, num_chains, chain_length, None)
    }

    pub async fn table_client(&self, path: &str) -> Result<HashTableClient> {
        HashTableClient::new(
            path,
            self.transport.clone(),
            self.directory.clone(),
            self.config.client.clone(),
        )
        .await
    }

    pub fn chain_client(&self, path: &str, chain: ReplicaChain) -> Result<ReplicaChainClient> {
        ReplicaChainClient::new(
            path,
            chain,
            self.transport.clone(),
            self.directory.clone(),
            self.config.client.clone(),
        )
    }

    /// Current chains of `path`.
    pub async fn chains(&self, path: &str) -> Result<Vec<ReplicaChain>> {
        Ok(self.directory.dstatus(path).await?.chains)
    }

    /// Crash a block.
    pub fn kill_block(&self, block: BlockId) {
        self.transport.kill(block);
    }

    pub fn link(&self, block: BlockId) -> Result<Arc<ChainLink>> {
        self.storage.link(block)
    }

    /// The hash table shard hosted on `block`, if any.
    pub fn store(&self, block: BlockId) -> Option<Arc<HashStore>> {
        self.storage
            .link(block)
            .ok()
            .and_then(|link| link.partition().as_hash_table().cloned())
    }

    /// Get elapsed time since test started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
