//! Block storage.
//!
//! Every block owns a fixed-capacity [`Arena`](arena::Arena) and may host one
//! partition wrapped in a [`ChainLink`](crate::chain::ChainLink). The
//! [`StorageManager`] hands out free blocks, creates and destroys
//! partitions, and places links in their chains.

pub mod arena;
pub mod hash_slot;
pub mod hashtable;
pub mod manager;
pub mod partition;

pub use arena::{AllocError, Arena, ArenaString};
pub use hash_slot::hash_slot;
pub use hashtable::{HashStore, MigrationToken, PartitionMetadata, ShardState, SlotMigrator};
pub use manager::StorageManager;
pub use partition::{
    Admission, AnyPartition, Command, CommandKind, CommandOutput, CommandTable, DefaultPartition,
    Partition, PartitionEvent, PartitionKind,
};
