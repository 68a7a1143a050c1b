//! Directory kept in process memory.

use super::{DataStatus, Directory};
use crate::error::{DirectoryError, Error, Result};
use crate::storage::manager::StorageManager;
use crate::storage::partition::{Partition, PartitionKind};
use crate::types::{BlockId, ReplicaChain, SlotRange, SLOT_MAX};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory backed by a [`StorageManager`] in the same process.
pub struct InMemoryDirectory {
    storage: Arc<StorageManager>,
    files: RwLock<HashMap<String, DataStatus>>,
    repair: tokio::sync::Mutex<()>,
}

impl InMemoryDirectory {
    /// Create a directory and register it with `storage` so shards can
    /// report splits and merges.
    pub fn new(storage: Arc<StorageManager>) -> Arc<Self> {
        let directory = Arc::new(Self {
            storage: Arc::clone(&storage),
            files: RwLock::new(HashMap::new()),
            repair: tokio::sync::Mutex::new(()),
        });
        let as_dyn: Arc<dyn Directory> = directory.clone();
        storage.attach_directory(Arc::downgrade(&as_dyn));
        directory
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    /// Create file `path` with `num_chains` chains of `chain_length` blocks.
    ///
    /// Hash table chains split the slot space evenly and are named after
    /// their ranges; other kinds are named by index.
    pub fn create(
        &self,
        path: &str,
        kind: PartitionKind,
        num_chains: usize,
        chain_length: usize,
        backing_path: Option<&str>,
    ) -> Result<DataStatus> {
        if num_chains == 0 || chain_length == 0 {
            return Err(Error::Config(
                "a file needs at least one chain of at least one block".into(),
            ));
        }
        if self.files.read().contains_key(path) {
            return Err(DirectoryError::FileExists(path.to_string()).into());
        }

        let mut chains = Vec::with_capacity(num_chains);
        for i in 0..num_chains {
            let name = match kind {
                PartitionKind::HashTable => initial_range(i, num_chains).name(),
                PartitionKind::Default => i.to_string(),
            };
            match self.build_chain(path, kind, chain_length, &name, "regular") {
                Ok(chain) => chains.push(chain),
                Err(e) => {
                    for chain in &chains {
                        self.release_blocks(&chain.block_ids);
                    }
                    return Err(e);
                }
            }
        }

        let status = DataStatus {
            path: path.to_string(),
            kind,
            chain_length,
            backing_path: backing_path.map(str::to_string),
            chains,
        };
        self.files.write().insert(path.to_string(), status.clone());
        info!(
            path = path,
            kind = %kind,
            num_chains,
            chain_length,
            "Created file"
        );
        Ok(status)
    }

    /// Destroy every chain of `path` and forget the file.
    pub fn remove(&self, path: &str) -> Result<()> {
        let status = self
            .files
            .write()
            .remove(path)
            .ok_or_else(|| DirectoryError::FileNotFound(path.to_string()))?;
        for chain in &status.chains {
            self.release_blocks(&chain.block_ids);
        }
        info!(path = path, "Removed file");
        Ok(())
    }

    /// Write every dirty chain of `path` to its backing path. Returns the
    /// number of snapshots written.
    pub async fn flush(&self, path: &str) -> Result<usize> {
        let status = self.status(path)?;
        let Some(backing) = status.backing_path.as_deref() else {
            return Ok(0);
        };
        let mut written = 0;
        for chain in &status.chains {
            let Some(tail) = chain.tail() else { continue };
            let link = self.storage.link(tail)?;
            if link.partition().sync(&snapshot_location(backing, &chain.name)).await? {
                written += 1;
            }
        }
        debug!(path = path, written, "Flushed file");
        Ok(written)
    }

    /// Fill every member of every chain of `path` from its backing path.
    pub async fn load(&self, path: &str) -> Result<()> {
        let status = self.status(path)?;
        let backing = status
            .backing_path
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{} has no backing path", path)))?;
        for chain in &status.chains {
            let location = snapshot_location(backing, &chain.name);
            for &block in &chain.block_ids {
                self.storage.link(block)?.partition().load(&location).await?;
            }
        }
        info!(path = path, backing = backing, "Loaded file");
        Ok(())
    }

    fn status(&self, path: &str) -> Result<DataStatus> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| DirectoryError::FileNotFound(path.to_string()).into())
    }

    fn build_chain(
        &self,
        path: &str,
        kind: PartitionKind,
        chain_length: usize,
        name: &str,
        metadata: &str,
    ) -> Result<ReplicaChain> {
        let blocks = self.storage.allocate_blocks(chain_length)?;
        let chain = ReplicaChain::new(name, metadata, blocks);
        let built = chain
            .block_ids
            .iter()
            .try_for_each(|&b| {
                self.storage
                    .create_partition(b, kind, name, metadata)
                    .map(|_| ())
            })
            .and_then(|_| self.storage.setup_chain(path, &chain));
        if let Err(e) = built {
            self.release_blocks(&chain.block_ids);
            return Err(e);
        }
        Ok(chain)
    }

    fn release_blocks(&self, blocks: &[BlockId]) {
        for &block in blocks {
            if let Err(e) = self.storage.destroy_partition(block) {
                warn!(block_id = block, error = %e, "Failed to release block");
            }
        }
    }
}

/// Range of initial chain `i` out of `n`: boundaries at `i * 65536 / n`,
/// with the last chain running up to 65536 inclusive.
fn initial_range(i: usize, n: usize) -> SlotRange {
    let boundary = |i: usize| (i as u64 * SLOT_MAX as u64 / n as u64) as u32;
    let end = if i + 1 == n { SLOT_MAX } else { boundary(i + 1) - 1 };
    SlotRange::new(boundary(i), end)
}

fn snapshot_location(backing: &str, name: &str) -> String {
    format!("{}/{}.snap", backing.trim_end_matches('/'), name)
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn allocate_chain(&self, path: &str, name: &str, metadata: &str) -> Result<ReplicaChain> {
        let (kind, chain_length) = {
            let files = self.files.read();
            let status = files
                .get(path)
                .ok_or_else(|| DirectoryError::FileNotFound(path.to_string()))?;
            (status.kind, status.chain_length)
        };
        let chain = self.build_chain(path, kind, chain_length, name, metadata)?;

        let recorded = match self.files.write().get_mut(path) {
            Some(status) => {
                status.chains.push(chain.clone());
                true
            }
            None => false,
        };
        if !recorded {
            self.release_blocks(&chain.block_ids);
            return Err(DirectoryError::FileNotFound(path.to_string()).into());
        }
        debug!(path = path, chain = %chain, metadata = metadata, "Allocated chain");
        Ok(chain)
    }

    async fn update_partition(
        &self,
        path: &str,
        old_name: &str,
        new_name: &str,
        metadata: &str,
    ) -> Result<()> {
        let mut files = self.files.write();
        let status = files
            .get_mut(path)
            .ok_or_else(|| DirectoryError::FileNotFound(path.to_string()))?;
        let chain = status
            .chains
            .iter_mut()
            .find(|c| c.name == old_name)
            .ok_or_else(|| DirectoryError::PartitionNotFound {
                path: path.to_string(),
                name: old_name.to_string(),
            })?;
        chain.name = new_name.to_string();
        chain.metadata = metadata.to_string();
        debug!(path = path, old_name, new_name, metadata, "Updated partition");
        Ok(())
    }

    async fn remove_block(&self, path: &str, name: &str) -> Result<()> {
        let chain = {
            let mut files = self.files.write();
            let status = files
                .get_mut(path)
                .ok_or_else(|| DirectoryError::FileNotFound(path.to_string()))?;
            let index = status
                .chains
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| DirectoryError::PartitionNotFound {
                    path: path.to_string(),
                    name: name.to_string(),
                })?;
            status.chains.remove(index)
        };
        self.release_blocks(&chain.block_ids);
        debug!(path = path, chain = %chain, "Removed chain");
        Ok(())
    }

    async fn dstatus(&self, path: &str) -> Result<DataStatus> {
        self.status(path)
    }

    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> Result<ReplicaChain> {
        let _repair = self.repair.lock().await;

        let (current, repaired) = {
            let mut files = self.files.write();
            let status = files
                .get_mut(path)
                .ok_or_else(|| DirectoryError::FileNotFound(path.to_string()))?;
            let stored = status
                .chains
                .iter_mut()
                .find(|c| c.block_ids.iter().any(|b| chain.block_ids.contains(b)))
                .ok_or_else(|| DirectoryError::PartitionNotFound {
                    path: path.to_string(),
                    name: chain.name.clone(),
                })?;

            let alive: Vec<BlockId> = stored
                .block_ids
                .iter()
                .copied()
                .filter(|&b| self.storage.is_alive(b))
                .collect();
            if alive.len() == stored.block_ids.len() {
                return Ok(stored.clone());
            }
            if alive.is_empty() {
                return Err(DirectoryError::ChainLost(stored.name.clone()).into());
            }
            let current = stored.clone();
            stored.block_ids = alive;
            (current, stored.clone())
        };

        let dead: Vec<BlockId> = current
            .block_ids
            .iter()
            .copied()
            .filter(|b| !repaired.block_ids.contains(b))
            .collect();
        warn!(
            path = path,
            chain = %current,
            dead = ?dead,
            "Repairing chain"
        );

        for &block in repaired.block_ids.iter().rev() {
            self.storage.link(block)?.update_chain(repaired.clone()).await?;
        }
        self.release_blocks(&dead);

        info!(path = path, chain = %repaired, "Chain repaired");
        Ok(repaired)
    }
}
