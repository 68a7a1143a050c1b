//! Online split and merge of hash slot ranges.
//!
//! A [`SlotMigrator`] runs at the tail of the source chain once its shard
//! crosses a capacity threshold. It moves keys in locked batches:
//!
//! ```text
//!   source chain                          destination chain
//!   lock ───────────────────────────────► lock
//!   locked_get_data_in_slot_range (local)
//!   ─────────── locked_put k v .. !redirected ──►
//!   locked_remove k ..
//!   unlock ─────────────────────────────► unlock
//! ```
//!
//! While a batch is outside its critical section every key lives in exactly
//! one shard: the source serves what it still holds and redirects the rest.

use super::ops::cmd;
use super::{HashStore, PartitionMetadata};
use crate::chain::ChainLink;
use crate::client::ReplicaChainClient;
use crate::config::ClientConfig;
use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::storage::partition::Partition;
use crate::types::{ReplicaChain, Response, SlotRange, Status, REDIRECTED_MARKER};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const IDLE: u8 = 0;
const MIGRATING: u8 = 1;

/// One-migration-per-shard guard shared by split and merge.
#[derive(Debug)]
pub struct MigrationToken(AtomicU8);

impl MigrationToken {
    pub fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    /// Move from idle to migrating. Returns false if a migration is running.
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(IDLE, MIGRATING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(IDLE, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire) == MIGRATING
    }
}

impl Default for MigrationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one split or merge of the shard hosted by `link`.
pub struct SlotMigrator {
    id: Uuid,
    link: Arc<ChainLink>,
    store: Arc<HashStore>,
    directory: Arc<dyn Directory>,
    client_config: ClientConfig,
}

impl SlotMigrator {
    /// The caller must already hold the shard's [`MigrationToken`].
    pub fn new(
        link: Arc<ChainLink>,
        store: Arc<HashStore>,
        directory: Arc<dyn Directory>,
        client_config: ClientConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            link,
            store,
            directory,
            client_config,
        }
    }

    /// Move the upper half of the slot range to a new chain.
    pub async fn split(self) {
        let result = self.run_split().await;
        self.finish("split", result.map(|_| ())).await;
    }

    /// Fold the whole slot range into an adjacent chain.
    pub async fn merge(self) {
        let result = self.run_merge().await;
        self.finish("merge", result.map(|_| ())).await;
    }

    fn client(&self, chain: ReplicaChain) -> Result<ReplicaChainClient> {
        ReplicaChainClient::new(
            &self.link.path(),
            chain,
            Arc::clone(self.link.transport()),
            Arc::clone(&self.directory),
            self.client_config.clone(),
        )
    }

    /// Returns the range handed over, or `None` if the shard is too small.
    pub(crate) async fn run_split(&self) -> Result<Option<SlotRange>> {
        let path = self.link.path();
        let range = self.store.slot_range();
        let mid = range.midpoint();
        if mid <= range.begin {
            tracing::debug!(migration_id = %self.id, range = %range, "Range too small to split");
            return Ok(None);
        }
        let target = SlotRange::new(mid, range.end);
        let kept = SlotRange::new(range.begin, mid - 1);

        tracing::info!(
            migration_id = %self.id,
            block_id = self.link.block_id(),
            path = %path,
            range = %range,
            bytes = self.store.bytes(),
            "Split started"
        );

        let dst_chain = self
            .directory
            .allocate_chain(&path, &target.name(), "importing")
            .await?;
        let mut src = self.client(self.link.chain())?;
        let mut dst = self.client(dst_chain.clone())?;

        expect_ok(
            src.run_command(vec![
                cmd::UPDATE_PARTITION.to_string(),
                range.name(),
                PartitionMetadata::exporting(&target, &dst_chain),
            ])
            .await?,
        )?;
        expect_ok(
            dst.run_command(vec![
                cmd::UPDATE_PARTITION.to_string(),
                target.name(),
                PartitionMetadata::importing(&target),
            ])
            .await?,
        )?;

        let moved = self.migrate(target, &mut src, &mut dst).await?;

        self.directory
            .update_partition(&path, &range.name(), &kept.name(), "regular")
            .await?;
        self.directory
            .update_partition(&path, &target.name(), &target.name(), "regular")
            .await?;
        expect_ok(
            src.run_command(vec![cmd::UPDATE_PARTITION.to_string(), kept.name(), "regular".into()])
                .await?,
        )?;
        expect_ok(
            dst.run_command(vec![cmd::UPDATE_PARTITION.to_string(), target.name(), "regular".into()])
                .await?,
        )?;

        self.store.metrics().splits.inc();
        tracing::info!(
            migration_id = %self.id,
            path = %path,
            kept = %kept,
            moved_range = %target,
            moved_keys = moved,
            target = %dst_chain,
            "Split finished"
        );
        Ok(Some(target))
    }

    /// Returns the chain the shard merged into, or `None` if no neighbor
    /// could take it.
    pub(crate) async fn run_merge(&self) -> Result<Option<ReplicaChain>> {
        let path = self.link.path();
        let range = self.store.slot_range();
        let capacity = self.store.storage_capacity() as f64;
        let limit = capacity * self.store.config().threshold_hi;
        let own_blocks = self.link.chain().block_ids;

        let status = self.directory.dstatus(&path).await?;
        for neighbor in status.chains {
            let Some(neighbor_range) = SlotRange::parse(&neighbor.name) else {
                continue;
            };
            if neighbor.block_ids == own_blocks
                || !neighbor_range.is_adjacent(&range)
                || !neighbor.metadata.starts_with("regular")
            {
                continue;
            }

            let mut dst = self.client(neighbor.clone())?;
            let size = dst
                .run_command(vec![cmd::GET_STORAGE_SIZE.to_string()])
                .await?;
            let size: usize = match (Status::of(&size), size.get(1)) {
                (Some(Status::Ok), Some(n)) => n.parse().unwrap_or(usize::MAX),
                _ => continue,
            };
            if self.store.bytes().saturating_add(size) as f64 >= limit {
                tracing::debug!(
                    migration_id = %self.id,
                    neighbor = %neighbor,
                    size,
                    "Neighbor too full to merge into"
                );
                continue;
            }

            let claim = dst
                .run_command(vec![
                    cmd::UPDATE_PARTITION.to_string(),
                    neighbor.name.clone(),
                    PartitionMetadata::importing(&range),
                ])
                .await?;
            if Status::of(&claim) != Some(Status::Ok) {
                tracing::debug!(migration_id = %self.id, neighbor = %neighbor, "Neighbor busy");
                continue;
            }

            tracing::info!(
                migration_id = %self.id,
                block_id = self.link.block_id(),
                path = %path,
                range = %range,
                into = %neighbor,
                "Merge started"
            );
            let mut src = self.client(self.link.chain())?;
            let export = src
                .run_command(vec![
                    cmd::UPDATE_PARTITION.to_string(),
                    range.name(),
                    PartitionMetadata::exporting(&range, &neighbor),
                ])
                .await?;
            if Status::of(&export) != Some(Status::Ok) {
                // Claimed by another merge in the meantime.
                tracing::info!(
                    migration_id = %self.id,
                    range = %range,
                    neighbor = %neighbor,
                    "Shard no longer regular, releasing neighbor"
                );
                expect_ok(
                    dst.run_command(vec![
                        cmd::UPDATE_PARTITION.to_string(),
                        neighbor.name.clone(),
                        "regular".to_string(),
                    ])
                    .await?,
                )?;
                return Ok(None);
            }

            let moved = self.migrate(range, &mut src, &mut dst).await?;

            let union = range.union(&neighbor_range);
            self.directory
                .update_partition(&path, &neighbor.name, &union.name(), "regular")
                .await?;
            expect_ok(
                dst.run_command(vec![
                    cmd::UPDATE_PARTITION.to_string(),
                    union.name(),
                    format!("regular${}", range.name()),
                ])
                .await?,
            )?;

            self.store.metrics().merges.inc();
            tracing::info!(
                migration_id = %self.id,
                path = %path,
                merged = %union,
                moved_keys = moved,
                "Merge finished"
            );
            return Ok(Some(neighbor));
        }

        tracing::debug!(migration_id = %self.id, range = %range, "No neighbor to merge into");
        Ok(None)
    }

    /// Move every key of `range` from `src` to `dst` in locked batches.
    async fn migrate(
        &self,
        range: SlotRange,
        src: &mut ReplicaChainClient,
        dst: &mut ReplicaChainClient,
    ) -> Result<usize> {
        let batch_size = self.store.config().export_batch_size;
        let mut total = 0;
        loop {
            expect_ok(src.run_command(vec![cmd::LOCK.to_string()]).await?)?;
            expect_ok(dst.run_command(vec![cmd::LOCK.to_string()]).await?)?;

            let data = expect_ok(self.store.locked_get_data_in_slot_range(
                range.begin,
                range.end,
                batch_size,
            ))?;
            let pairs = &data[1..];
            let count = pairs.len() / 2;

            if count > 0 {
                let mut put = Vec::with_capacity(pairs.len() + 2);
                put.push(cmd::LOCKED_PUT.to_string());
                put.extend(pairs.iter().cloned());
                put.push(REDIRECTED_MARKER.to_string());
                let statuses = dst.run_command(put).await?;
                if let Some(bad) = statuses
                    .iter()
                    .find(|s| !matches!(s.parse(), Ok(Status::Ok) | Ok(Status::DuplicateKey)))
                {
                    return Err(Error::Rejected(format!("locked_put answered {}", bad)));
                }

                let mut remove = Vec::with_capacity(count + 1);
                remove.push(cmd::LOCKED_REMOVE.to_string());
                remove.extend(pairs.chunks_exact(2).map(|kv| kv[0].clone()));
                src.run_command(remove).await?;
            }

            expect_ok(src.run_command(vec![cmd::UNLOCK.to_string()]).await?)?;
            expect_ok(dst.run_command(vec![cmd::UNLOCK.to_string()]).await?)?;

            total += count;
            self.store.metrics().keys_exported.inc_by(count as u64);
            tracing::debug!(migration_id = %self.id, batch = count, total, "Migrated batch");
            if count < batch_size {
                return Ok(total);
            }
        }
    }

    async fn finish(&self, kind: &str, result: Result<()>) {
        if let Err(e) = result {
            self.store.metrics().migration_failures.inc();
            tracing::error!(
                migration_id = %self.id,
                block_id = self.link.block_id(),
                kind,
                error = %e,
                "Slot migration failed"
            );
            if self.store.is_locked() {
                match self.client(self.link.chain()) {
                    Ok(mut src) => {
                        if let Err(e) = src.run_command(vec![cmd::UNLOCK.to_string()]).await {
                            tracing::warn!(migration_id = %self.id, error = %e, "Failed to unlock source");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(migration_id = %self.id, error = %e, "Failed to unlock source")
                    }
                }
            }
        }
        self.store.migration_token().release();
    }
}

fn expect_ok(response: Response) -> Result<Response> {
    match Status::of(&response) {
        Some(Status::Ok) => Ok(response),
        _ => Err(Error::Rejected(response.join(" "))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_exclusive() {
        let token = MigrationToken::new();
        assert!(!token.is_active());
        assert!(token.try_acquire());
        assert!(!token.try_acquire());
        assert!(token.is_active());
        token.release();
        assert!(token.try_acquire());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merge_backs_off_when_claimed_by_neighbor() {
        use crate::config::{HashStoreConfig, StoreConfig};
        use crate::storage::hashtable::ShardState;
        use crate::testing::TestCluster;

        let config = StoreConfig::default()
            .with_block_capacity(1 << 20)
            .with_hash_table_config(HashStoreConfig::default().with_auto_scale(false));
        let cluster = TestCluster::new(2, config.clone()).unwrap();
        cluster.create_table("/t", 2, 1).unwrap();
        let (lower, upper) = (cluster.store(0).unwrap(), cluster.store(1).unwrap());
        assert_eq!(upper.slot_range(), SlotRange::new(32768, 65536));

        // the upper shard's own merge got here first
        let claim = lower.update_partition("0_32767", "importing$32768_65536");
        assert_eq!(claim.response, vec!["!ok".to_string()]);

        let migrator = SlotMigrator::new(
            cluster.link(0).unwrap(),
            Arc::clone(&lower),
            cluster.directory.clone(),
            config.client.clone(),
        );
        assert!(migrator.run_merge().await.unwrap().is_none());

        assert_eq!(upper.state(), ShardState::Regular);
        assert!(upper.import_slot_range().is_none());
        assert_eq!(upper.slot_range(), SlotRange::new(32768, 65536));
        assert_eq!(lower.state(), ShardState::Importing);
        assert_eq!(lower.import_slot_range(), Some(SlotRange::new(32768, 65536)));
        assert_eq!(lower.metrics().merges.get(), 0);
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok(vec!["!ok".into(), "x".into()]).is_ok());
        let err = expect_ok(vec!["!block_not_locked".into()]).unwrap_err();
        assert!(matches!(err, Error::Rejected(s) if s == "!block_not_locked"));
    }
}
