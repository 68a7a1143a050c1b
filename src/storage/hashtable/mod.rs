//! Hash-slot sharded hash table.
//!
//! A [`HashStore`] owns a contiguous, inclusive range of the 65536 hash
//! slots. Keys hashing outside that range are refused with `!block_moved`.
//! While a shard takes part in a split or merge it also tracks an export
//! range (keys that have moved out and are redirected with
//! `!exporting!<chain>`) or an import range (keys it accepts only from
//! migration traffic carrying the `!redirected` marker).
//!
//! # State machine
//!
//! ```text
//!             update_partition("exporting$r$t")
//!   regular ───────────────────────────────────► exporting
//!      │  ▲                                          │
//!      │  └──────── update_partition("regular") ─────┘
//!      │
//!      │    update_partition("importing$r")
//!      └───────────────────────────────────────► importing
//!                 (back to regular the same way)
//! ```
//!
//! # Table gate
//!
//! Plain single-key commands hold the gate shared; `lock` takes it
//! exclusively and keeps the guard until `unlock`. The `locked_*` commands
//! skip the gate and require the table to be locked.

mod migration;
mod ops;

pub use migration::{MigrationToken, SlotMigrator};
pub use ops::{cmd, HASH_TABLE_COMMANDS};

use crate::config::HashStoreConfig;
use crate::error::{Error, Result};
use crate::metrics::ShardMetrics;
use crate::snapshot::{self, SnapshotEntry};
use crate::storage::arena::{Arena, ArenaString};
use crate::storage::partition::{Admission, CommandOutput, CommandTable, Partition};
use crate::types::{ReplicaChain, SlotRange};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};

/// Migration role of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Regular,
    Importing,
    Exporting,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Regular => f.write_str("regular"),
            ShardState::Importing => f.write_str("importing"),
            ShardState::Exporting => f.write_str("exporting"),
        }
    }
}

impl FromStr for ShardState {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "regular" => Ok(ShardState::Regular),
            "importing" => Ok(ShardState::Importing),
            "exporting" => Ok(ShardState::Exporting),
            _ => Err(()),
        }
    }
}

/// Parsed `status$range$target` metadata string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub state: ShardState,
    /// Second field: the migrating range, or the merged-away source's name
    /// when returning to regular.
    pub range: Option<String>,
    /// Third field: the export target chain.
    pub target: Option<ReplicaChain>,
}

impl PartitionMetadata {
    pub fn parse(metadata: &str) -> Option<Self> {
        let mut fields = metadata.split('$');
        let state = fields.next()?.parse().ok()?;
        let range = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
        let target = match fields.next() {
            Some(t) => Some(ReplicaChain::parse_target(t)?),
            None => None,
        };
        Some(Self {
            state,
            range,
            target,
        })
    }

    /// `exporting$<range>$<target>`
    pub fn exporting(range: &SlotRange, target: &ReplicaChain) -> String {
        format!("exporting${}${}", range.name(), target.target_string())
    }

    /// `importing$<range>`
    pub fn importing(range: &SlotRange) -> String {
        format!("importing${}", range.name())
    }
}

/// Ownership information of a shard, guarded as one unit.
#[derive(Debug, Clone)]
pub(crate) struct ShardInfo {
    pub name: String,
    pub metadata: String,
    pub state: ShardState,
    pub slot_range: SlotRange,
    pub export_slot_range: Option<SlotRange>,
    pub export_target: Option<ReplicaChain>,
    pub import_slot_range: Option<SlotRange>,
}

/// One shard of a hash table file.
pub struct HashStore {
    map: DashMap<ArenaString, ArenaString>,
    arena: Arc<Arena>,
    bytes: AtomicUsize,
    shard: RwLock<ShardInfo>,
    gate: Arc<tokio::sync::RwLock<()>>,
    table_lock: Mutex<Option<OwnedRwLockWriteGuard<()>>>,
    migration: MigrationToken,
    dirty: AtomicBool,
    config: HashStoreConfig,
    metrics: ShardMetrics,
}

impl HashStore {
    /// Create an empty shard named after its slot range, e.g. `0_65536`.
    pub fn new(
        arena: Arc<Arena>,
        name: &str,
        metadata: &str,
        config: HashStoreConfig,
    ) -> Result<Self> {
        let slot_range = SlotRange::parse(name)
            .ok_or_else(|| Error::Config(format!("invalid slot range name: {}", name)))?;
        let parsed = PartitionMetadata::parse(metadata)
            .ok_or_else(|| Error::Config(format!("invalid partition metadata: {}", metadata)))?;

        let mut shard = ShardInfo {
            name: name.to_string(),
            metadata: metadata.to_string(),
            state: parsed.state,
            slot_range,
            export_slot_range: None,
            export_target: None,
            import_slot_range: None,
        };
        match parsed.state {
            ShardState::Importing => {
                shard.import_slot_range = parsed.range.as_deref().and_then(SlotRange::parse);
            }
            ShardState::Exporting => {
                shard.export_slot_range = parsed.range.as_deref().and_then(SlotRange::parse);
                shard.export_target = parsed.target;
            }
            ShardState::Regular => {}
        }

        Ok(Self {
            map: DashMap::new(),
            arena,
            bytes: AtomicUsize::new(0),
            shard: RwLock::new(shard),
            gate: Arc::new(tokio::sync::RwLock::new(())),
            table_lock: Mutex::new(None),
            migration: MigrationToken::new(),
            dirty: AtomicBool::new(false),
            config,
            metrics: ShardMetrics::new(),
        })
    }

    /// Bytes of keys and values held.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn state(&self) -> ShardState {
        self.shard.read().state
    }

    pub fn slot_range(&self) -> SlotRange {
        self.shard.read().slot_range
    }

    pub fn export_slot_range(&self) -> Option<SlotRange> {
        self.shard.read().export_slot_range
    }

    pub fn export_target(&self) -> Option<ReplicaChain> {
        self.shard.read().export_target.clone()
    }

    pub fn import_slot_range(&self) -> Option<SlotRange> {
        self.shard.read().import_slot_range
    }

    pub fn is_locked(&self) -> bool {
        self.table_lock.lock().is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &HashStoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ShardMetrics {
        &self.metrics
    }

    pub fn migration_token(&self) -> &MigrationToken {
        &self.migration
    }

    /// Every entry, for inspection and snapshots.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.map
            .iter()
            .map(|e| (e.key().to_string(), e.value().to_string()))
            .collect()
    }

    fn overloaded(&self) -> bool {
        self.bytes() as f64 > self.arena.capacity() as f64 * self.config.threshold_hi
    }

    fn underloaded(&self) -> bool {
        (self.bytes() as f64) < self.arena.capacity() as f64 * self.config.threshold_lo
    }

    fn adjust_bytes(&self, old_len: usize, new_len: usize) {
        if new_len >= old_len {
            self.bytes.fetch_add(new_len - old_len, Ordering::AcqRel);
        } else {
            self.bytes.fetch_sub(old_len - new_len, Ordering::AcqRel);
        }
    }

    /// Drop every entry and forget migration state.
    fn clear(&self) {
        self.map.clear();
        self.bytes.store(0, Ordering::Release);
        let mut shard = self.shard.write();
        shard.state = ShardState::Regular;
        shard.metadata = ShardState::Regular.to_string();
        shard.export_slot_range = None;
        shard.export_target = None;
        shard.import_slot_range = None;
    }

    /// Snapshot the table while holding the gate, unless a migration already
    /// holds the table lock.
    async fn write_snapshot(&self, path: &str) -> Result<()> {
        let _guard = if self.is_locked() {
            None
        } else {
            Some(self.gate.clone().write_owned().await)
        };
        let range = self.slot_range();
        let entries = self.entries();
        let meta = snapshot::write_snapshot(
            path,
            range,
            self.config.compress_snapshots,
            entries.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        debug!(
            path = path,
            entries = meta.entry_count,
            file_size = meta.file_size,
            "Wrote shard snapshot"
        );
        Ok(())
    }
}

impl fmt::Debug for HashStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shard = self.shard.read();
        f.debug_struct("HashStore")
            .field("name", &shard.name)
            .field("state", &shard.state)
            .field("keys", &self.map.len())
            .field("bytes", &self.bytes())
            .finish()
    }
}

#[async_trait]
impl Partition for HashStore {
    fn name(&self) -> String {
        self.shard.read().name.clone()
    }

    fn metadata(&self) -> String {
        self.shard.read().metadata.clone()
    }

    fn commands(&self) -> &'static CommandTable {
        &HASH_TABLE_COMMANDS
    }

    async fn admit(&self, command: &str) -> Admission {
        self.admission_for(command).await
    }

    async fn run_command(&self, args: &[String], admission: Admission) -> CommandOutput {
        self.dispatch(args, admission)
    }

    fn storage_size(&self) -> usize {
        self.bytes()
    }

    fn storage_capacity(&self) -> usize {
        self.arena.capacity()
    }

    async fn load(&self, path: &str) -> Result<()> {
        let (header, entries) = snapshot::read_snapshot(path)?;
        let _guard = if self.is_locked() {
            None
        } else {
            Some(self.gate.clone().write_owned().await)
        };
        let mut loaded = 0usize;
        for SnapshotEntry { key, value } in entries {
            if self.insert_new(&key, &value).first().map(String::as_str) == Some("!ok") {
                loaded += 1;
            }
        }
        info!(
            path = path,
            loaded = loaded,
            range = %header.slot_range(),
            "Loaded shard snapshot"
        );
        Ok(())
    }

    async fn sync(&self, path: &str) -> Result<bool> {
        if self
            .dirty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        if let Err(e) = self.write_snapshot(path).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    async fn dump(&self, path: &str) -> Result<bool> {
        let flushed = self.sync(path).await?;
        self.clear();
        self.dirty.store(false, Ordering::Release);
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hash_slot::hash_slot;
    use crate::types::Status;
    use tempfile::tempdir;

    pub(crate) fn store_with(capacity: usize, name: &str, metadata: &str) -> HashStore {
        HashStore::new(
            Arena::new(capacity),
            name,
            metadata,
            HashStoreConfig::default().with_auto_scale(false),
        )
        .unwrap()
    }

    #[test]
    fn test_metadata_parse() {
        let m = PartitionMetadata::parse("exporting$32768_65536$4!5").unwrap();
        assert_eq!(m.state, ShardState::Exporting);
        assert_eq!(m.range.as_deref(), Some("32768_65536"));
        assert_eq!(m.target.unwrap().block_ids, vec![4, 5]);

        let m = PartitionMetadata::parse("regular").unwrap();
        assert_eq!(m.state, ShardState::Regular);
        assert!(m.range.is_none() && m.target.is_none());

        assert!(PartitionMetadata::parse("bogus$1_2").is_none());
        assert!(PartitionMetadata::parse("exporting$1_2$x").is_none());
    }

    #[test]
    fn test_new_rejects_bad_names() {
        let arena = Arena::new(16);
        assert!(HashStore::new(arena.clone(), "nope", "regular", HashStoreConfig::default()).is_err());
        assert!(HashStore::new(arena, "0_10", "weird", HashStoreConfig::default()).is_err());
    }

    #[test]
    fn test_bytes_match_arena() {
        let store = store_with(1 << 20, "0_65536", "regular");
        store.put("alpha", "1", false);
        store.put("beta", "22", false);
        store.upsert("alpha", "333", false);
        store.remove("beta", false);
        assert_eq!(store.bytes(), "alpha".len() + "333".len());
        assert_eq!(store.bytes(), store.arena.used());
    }

    #[tokio::test]
    async fn test_sync_writes_only_when_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.snap");
        let path = path.to_str().unwrap();

        let store = store_with(1 << 20, "0_65536", "regular");
        assert!(!store.sync(path).await.unwrap());

        for i in 0..50 {
            let args = vec!["put".to_string(), format!("k{}", i), format!("v{}", i)];
            store.run_command(&args, Admission::Free).await;
        }
        assert!(store.sync(path).await.unwrap());
        assert!(!store.sync(path).await.unwrap());

        let restored = store_with(1 << 20, "0_65536", "regular");
        restored.load(&format!("local://{}", path)).await.unwrap();
        assert_eq!(restored.len(), 50);
        assert_eq!(restored.get("k7", false), Status::Ok.reply_with("v7"));
        assert_eq!(restored.bytes(), store.bytes());
    }

    #[tokio::test]
    async fn test_dump_clears_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.snap");
        let path = path.to_str().unwrap();

        let store = store_with(1 << 20, "0_65536", "regular");
        let args = vec!["put".to_string(), "k".to_string(), "v".to_string()];
        store.run_command(&args, Admission::Free).await;

        assert!(store.dump(path).await.unwrap());
        assert!(store.is_empty());
        assert_eq!(store.bytes(), 0);
        assert_eq!(store.arena.used(), 0);
        assert!(!store.is_dirty());
        assert!(std::path::Path::new(path).exists());
    }

    #[tokio::test]
    async fn test_dump_keeps_running_migration_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dump.snap");

        let store = store_with(1 << 20, "0_65536", "regular");
        let args = vec!["put".to_string(), "k".to_string(), "v".to_string()];
        store.run_command(&args, Admission::Free).await;
        assert!(store.migration_token().try_acquire());
        assert!(store.dump(path.to_str().unwrap()).await.unwrap());

        assert!(store.migration_token().is_active());
        assert!(!store.migration_token().try_acquire());
    }

    #[test]
    fn test_slot_helpers_agree() {
        let store = store_with(1 << 20, "0_32767", "regular");
        let low = (0..100).map(|i| i.to_string()).find(|k| hash_slot(k) < 32768).unwrap();
        let high = (0..100).map(|i| i.to_string()).find(|k| hash_slot(k) >= 32768).unwrap();
        assert_eq!(store.put(&low, "v", false), Status::Ok.reply());
        assert_eq!(store.put(&high, "v", false), Status::BlockMoved.reply());
    }
}
