//! Online split and merge of hash table shards under client load.

#[cfg(test)]
mod tests {
    use crate::config::{ClientConfig, HashStoreConfig, StoreConfig};
    use crate::directory::Directory;
    use crate::storage::hash_slot;
    use crate::storage::hashtable::{HashStore, ShardState};
    use crate::testing::{init_tracing, wait_for, wait_until, TestCluster};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    const NUM_KEYS: usize = 320;

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_block_capacity(64 * 1024)
            .with_hash_table_config(
                HashStoreConfig::default()
                    .with_auto_scale(true)
                    .with_threshold_hi(0.5)
                    .with_threshold_lo(0.1)
                    .with_export_batch_size(64),
            )
            .with_client_config(
                ClientConfig::default()
                    .with_request_timeout(Duration::from_secs(2))
                    .with_retry_backoff(Duration::from_millis(1)),
            )
    }

    fn key(i: usize) -> String {
        format!("key{:04}", i)
    }

    fn value(i: usize) -> String {
        format!("{:0>100}", i)
    }

    async fn chain_names(cluster: &TestCluster) -> Vec<String> {
        match cluster.chains("/t").await {
            Ok(chains) => chains.into_iter().map(|c| c.name).collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn wait_for_chains(cluster: &TestCluster, expected: &[&str]) -> bool {
        wait_for(
            || async move {
                let mut names = chain_names(cluster).await;
                names.sort();
                names == expected
            },
            Duration::from_secs(10),
        )
        .await
    }

    /// Fill one shard past its high threshold and wait for the split.
    async fn split_table(cluster: &TestCluster) -> Arc<HashStore> {
        let mut table = cluster.table_client("/t").await.unwrap();
        for i in 0..NUM_KEYS {
            table.put(&key(i), &value(i)).await.unwrap();
        }

        let lower = cluster.store(1).unwrap();
        assert!(
            wait_until(
                || lower.metrics().splits.get() == 1 && !lower.migration_token().is_active(),
                Duration::from_secs(10),
            )
            .await
        );
        assert!(wait_for_chains(cluster, &["0_32767", "32768_65536"]).await);
        lower
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_split_under_load() {
        init_tracing();
        let cluster = TestCluster::new(8, config()).unwrap();
        cluster.create_table("/t", 1, 2).unwrap();
        let lower = split_table(&cluster).await;

        let status = cluster.directory.dstatus("/t").await.unwrap();
        assert_eq!(status.chains.len(), 2);
        assert!(status.chains.iter().all(|c| c.metadata == "regular"));
        assert_eq!(lower.state(), ShardState::Regular);
        assert!(lower.metrics().keys_exported.get() > 0);
        assert_eq!(lower.metrics().migration_failures.get(), 0);

        let mut table = cluster.table_client("/t").await.unwrap();
        for i in 0..NUM_KEYS {
            assert_eq!(table.get(&key(i)).await.unwrap(), Some(value(i)), "key {}", i);
        }
        assert_eq!(table.num_keys().await.unwrap(), NUM_KEYS);

        // Every key lives on exactly one tail, inside that tail's range.
        let mut seen = BTreeSet::new();
        for chain in &status.chains {
            let tail = chain.tail().unwrap();
            let store = cluster.store(tail).unwrap();
            let range = store.slot_range();
            assert_eq!(range.name(), chain.name);
            for (k, _) in store.entries() {
                assert!(range.contains(hash_slot(&k)), "{} outside {}", k, range);
                assert!(seen.insert(k.clone()), "{} stored twice", k);
            }
        }
        let expected: BTreeSet<String> = (0..NUM_KEYS).map(key).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merge_after_drain() {
        init_tracing();
        let cluster = TestCluster::new(8, config()).unwrap();
        cluster.create_table("/t", 1, 2).unwrap();
        let lower = split_table(&cluster).await;

        let mut table = cluster.table_client("/t").await.unwrap();
        let mut remaining: BTreeSet<usize> = (0..NUM_KEYS).collect();
        let lower_keys: Vec<usize> = (0..NUM_KEYS)
            .filter(|&i| hash_slot(&key(i)) < 32768)
            .collect();
        for i in lower_keys {
            assert_eq!(table.remove(&key(i)).await.unwrap(), Some(value(i)));
            remaining.remove(&i);
            if lower.migration_token().is_active() || lower.metrics().merges.get() > 0 {
                break;
            }
        }

        assert!(wait_for_chains(&cluster, &["0_65536"]).await);
        assert!(
            wait_until(
                || lower.metrics().merges.get() == 1 && !lower.migration_token().is_active(),
                Duration::from_secs(10),
            )
            .await
        );
        assert_eq!(lower.metrics().migration_failures.get(), 0);

        let status = cluster.directory.dstatus("/t").await.unwrap();
        assert_eq!(status.chains[0].metadata, "regular");
        let merged = cluster.store(status.chains[0].tail().unwrap()).unwrap();
        assert_eq!(merged.state(), ShardState::Regular);
        assert_eq!(merged.len(), remaining.len());

        for &i in &remaining {
            assert_eq!(table.get(&key(i)).await.unwrap(), Some(value(i)), "key {}", i);
        }
        assert_eq!(table.num_keys().await.unwrap(), remaining.len());
    }
}
