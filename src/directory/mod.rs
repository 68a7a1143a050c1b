//! Directory service: which chains make up a file.
//!
//! A file is a set of replica chains, each holding one partition. For hash
//! tables the partition name is the chain's slot range, so the chain list is
//! also the routing table clients read through [`Directory::dstatus`].

mod memory;

pub use memory::InMemoryDirectory;

use crate::error::Result;
use crate::storage::partition::PartitionKind;
use crate::storage::hash_slot::hash_slot;
use crate::types::{ReplicaChain, SlotRange};
use async_trait::async_trait;

/// Everything the directory knows about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStatus {
    pub path: String,
    pub kind: PartitionKind,
    pub chain_length: usize,
    /// Persistent location the file is flushed to, if any.
    pub backing_path: Option<String>,
    pub chains: Vec<ReplicaChain>,
}

impl DataStatus {
    pub fn chain_named(&self, name: &str) -> Option<&ReplicaChain> {
        self.chains.iter().find(|c| c.name == name)
    }

    /// Chain whose range holds `key`'s slot. A chain still importing its
    /// range loses to one that serves it.
    pub fn chain_for_key(&self, key: &str) -> Option<&ReplicaChain> {
        self.chain_for_slot(hash_slot(key))
    }

    pub fn chain_for_slot(&self, slot: u32) -> Option<&ReplicaChain> {
        let mut candidates = self.chains.iter().filter(|c| {
            SlotRange::parse(&c.name)
                .map(|r| r.contains(slot))
                .unwrap_or(false)
        });
        let first = candidates.next()?;
        if !first.metadata.starts_with("importing") {
            return Some(first);
        }
        candidates
            .find(|c| !c.metadata.starts_with("importing"))
            .or(Some(first))
    }
}

/// Metadata operations the chains and clients depend on.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Allocate, create and set up a new chain named `name` in file `path`.
    async fn allocate_chain(&self, path: &str, name: &str, metadata: &str) -> Result<ReplicaChain>;

    /// Rename chain `old_name` to `new_name` and set its metadata.
    async fn update_partition(
        &self,
        path: &str,
        old_name: &str,
        new_name: &str,
        metadata: &str,
    ) -> Result<()>;

    /// Drop chain `name` and free its blocks.
    async fn remove_block(&self, path: &str, name: &str) -> Result<()>;

    async fn dstatus(&self, path: &str) -> Result<DataStatus>;

    /// Drop dead members from the file chain that shares blocks with
    /// `chain`, reconfigure the survivors and return the repaired chain.
    async fn resolve_failures(&self, path: &str, chain: &ReplicaChain) -> Result<ReplicaChain>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(chains: Vec<ReplicaChain>) -> DataStatus {
        DataStatus {
            path: "/t".into(),
            kind: PartitionKind::HashTable,
            chain_length: 1,
            backing_path: None,
            chains,
        }
    }

    #[test]
    fn test_chain_for_slot() {
        let s = status(vec![
            ReplicaChain::new("0_32767", "regular", vec![0]),
            ReplicaChain::new("32768_65536", "regular", vec![1]),
        ]);
        assert_eq!(s.chain_for_slot(5).unwrap().block_ids, vec![0]);
        assert_eq!(s.chain_for_slot(65536).unwrap().block_ids, vec![1]);
        assert!(s.chain_named("0_32767").is_some());
        assert!(s.chain_named("0_65536").is_none());
    }

    #[test]
    fn test_prefers_serving_chain() {
        let s = status(vec![
            ReplicaChain::new("32768_65536", "importing", vec![2]),
            ReplicaChain::new("0_65536", "exporting$32768_65536$2", vec![0]),
        ]);
        assert_eq!(s.chain_for_slot(40000).unwrap().block_ids, vec![0]);

        let only = status(vec![ReplicaChain::new("0_65536", "importing", vec![3])]);
        assert_eq!(only.chain_for_slot(1).unwrap().block_ids, vec![3]);
    }
}
