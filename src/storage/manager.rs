//! Pool of storage blocks.
//!
//! The manager owns every [`ChainLink`]; the transport and the directory
//! only hold weak references. Blocks are numbered `0..num_blocks` and are
//! handed out lowest id first.

use crate::chain::{ChainLink, ChainTransport};
use crate::config::StoreConfig;
use crate::directory::Directory;
use crate::error::{DirectoryError, Error, Result, StorageError};
use crate::storage::arena::Arena;
use crate::storage::hashtable::HashStore;
use crate::storage::partition::{AnyPartition, DefaultPartition, PartitionKind};
use crate::types::{BlockId, ReplicaChain};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct BlockSlot {
    link: Option<Arc<ChainLink>>,
}

/// Hands out blocks and manages the partitions they host.
pub struct StorageManager {
    config: StoreConfig,
    transport: Arc<dyn ChainTransport>,
    directory: RwLock<Option<Weak<dyn Directory>>>,
    blocks: DashMap<BlockId, BlockSlot>,
    free: Mutex<BTreeSet<BlockId>>,
}

impl StorageManager {
    /// Create a pool of `num_blocks` empty blocks.
    pub fn new(
        num_blocks: usize,
        config: StoreConfig,
        transport: Arc<dyn ChainTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let blocks = DashMap::new();
        let mut free = BTreeSet::new();
        for id in 0..num_blocks as BlockId {
            blocks.insert(id, BlockSlot::default());
            free.insert(id);
        }
        info!(
            num_blocks,
            block_capacity = config.block_capacity,
            "Storage manager started"
        );
        Ok(Arc::new(Self {
            config,
            transport,
            directory: RwLock::new(None),
            blocks,
            free: Mutex::new(free),
        }))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn ChainTransport> {
        &self.transport
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.free.lock().len()
    }

    /// Register the directory that partition events report to.
    pub fn attach_directory(&self, directory: Weak<dyn Directory>) {
        *self.directory.write() = Some(directory);
    }

    pub fn directory(&self) -> Result<Arc<dyn Directory>> {
        self.directory
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| DirectoryError::Unavailable.into())
    }

    /// Take `n` free blocks, lowest ids first.
    pub fn allocate_blocks(&self, n: usize) -> Result<Vec<BlockId>> {
        let mut free = self.free.lock();
        if free.len() < n {
            return Err(StorageError::OutOfBlocks {
                wanted: n,
                available: free.len(),
            }
            .into());
        }
        let ids: Vec<BlockId> = free.iter().take(n).copied().collect();
        for id in &ids {
            free.remove(id);
        }
        debug!(blocks = ?ids, "Allocated blocks");
        Ok(ids)
    }

    /// Host a fresh partition on an allocated block and make it reachable.
    pub fn create_partition(
        self: &Arc<Self>,
        block: BlockId,
        kind: PartitionKind,
        name: &str,
        metadata: &str,
    ) -> Result<Arc<ChainLink>> {
        let mut slot = self
            .blocks
            .get_mut(&block)
            .ok_or(StorageError::BlockNotFound(block))?;
        if slot.link.is_some() {
            return Err(Error::Internal(format!("block {} already hosts a partition", block)));
        }

        let arena = Arena::new(self.config.block_capacity);
        let partition = match kind {
            PartitionKind::HashTable => AnyPartition::HashTable(Arc::new(HashStore::new(
                arena,
                name,
                metadata,
                self.config.hash_table.clone(),
            )?)),
            PartitionKind::Default => AnyPartition::Default(DefaultPartition::new(arena, name, metadata)),
        };
        let link = ChainLink::new(
            block,
            partition,
            Arc::clone(&self.transport),
            Arc::downgrade(self),
        );
        slot.link = Some(Arc::clone(&link));
        drop(slot);

        self.transport.register(block, &link);
        debug!(block_id = block, kind = %kind, name = name, metadata = metadata, "Created partition");
        Ok(link)
    }

    /// Place every member of `chain` in its position, tail first so each
    /// link's successor is reachable when it connects.
    pub fn setup_chain(&self, path: &str, chain: &ReplicaChain) -> Result<()> {
        for &block in chain.block_ids.iter().rev() {
            let link = self.link(block)?;
            let (role, next) = chain
                .position_of(block)
                .ok_or_else(|| Error::Internal(format!("block {} missing from {}", block, chain)))?;
            link.setup(path, chain.clone(), role, next)?;
        }
        Ok(())
    }

    /// Stop the partition on `block` and return the block to the pool.
    pub fn destroy_partition(&self, block: BlockId) -> Result<()> {
        let link = {
            let mut slot = self
                .blocks
                .get_mut(&block)
                .ok_or(StorageError::BlockNotFound(block))?;
            slot.link.take()
        };
        self.transport.unregister(block);
        if let Some(link) = link {
            link.shutdown();
        }
        self.free.lock().insert(block);
        debug!(block_id = block, "Destroyed partition");
        Ok(())
    }

    /// The link hosted on `block`.
    pub fn link(&self, block: BlockId) -> Result<Arc<ChainLink>> {
        let slot = self
            .blocks
            .get(&block)
            .ok_or(StorageError::BlockNotFound(block))?;
        slot.link
            .clone()
            .ok_or_else(|| StorageError::NoPartition(block).into())
    }

    /// Whether `block` is reachable through the transport.
    pub fn is_alive(&self, block: BlockId) -> bool {
        self.transport.endpoint(block).is_ok()
    }
}
