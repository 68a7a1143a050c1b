//! Chain replication scenarios: ordering, acknowledgments, misrouted
//! requests and recovery from a failed head, mid or tail.

#[cfg(test)]
mod tests {
    use crate::config::{ClientConfig, HashStoreConfig, StoreConfig};
    use crate::directory::Directory;
    use crate::error::{Error, ProtocolError};
    use crate::storage::partition::Partition;
    use crate::testing::{init_tracing, wait_until, TestCluster};
    use crate::types::{ChainRole, SequenceId, Status};
    use std::time::Duration;

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_block_capacity(1 << 20)
            .with_hash_table_config(HashStoreConfig::default().with_auto_scale(false))
            .with_client_config(
                ClientConfig::default()
                    .with_request_timeout(Duration::from_secs(2))
                    .with_retry_backoff(Duration::from_millis(1)),
            )
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_acks_empty_head_pending() {
        init_tracing();
        let cluster = TestCluster::new(3, config()).unwrap();
        let status = cluster.create_table("/t", 1, 3).unwrap();
        let mut client = cluster.chain_client("/t", status.chains[0].clone()).unwrap();

        for i in 0..100 {
            let key = format!("k{}", i);
            let response = client.run_command(args(&["put", &key, "v"])).await.unwrap();
            assert_eq!(response, Status::Ok.reply());
        }

        let head = cluster.link(0).unwrap();
        assert!(wait_until(|| head.pending_count() == 0, Duration::from_secs(5)).await);
        assert_eq!(head.metrics().forwarded.get(), 100);
        assert_eq!(head.metrics().acks.get(), 100);
        assert_eq!(head.metrics().pending.get(), 0);

        for block in 0..3 {
            assert_eq!(cluster.store(block).unwrap().len(), 100, "block {}", block);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejects_misrouted_requests() {
        let cluster = TestCluster::new(3, config()).unwrap();
        cluster.create_table("/t", 1, 3).unwrap();
        let (head, mid, tail) = (
            cluster.link(0).unwrap(),
            cluster.link(1).unwrap(),
            cluster.link(2).unwrap(),
        );
        let seq = SequenceId::new(42, 1);

        assert!(matches!(
            mid.request(seq, args(&["get", "k"])).await,
            Err(Error::Protocol(ProtocolError::RequestAtMid(1)))
        ));
        assert!(matches!(
            tail.request(seq, args(&["put", "k", "v"])).await,
            Err(Error::Protocol(ProtocolError::MutatorAtTail { block: 2, .. }))
        ));
        assert!(matches!(
            head.request(seq, args(&["get", "k"])).await,
            Err(Error::Protocol(ProtocolError::AccessorAtHead { block: 0, .. }))
        ));
        assert!(matches!(
            head.chain_request(seq, args(&["put", "k", "v"])).await,
            Err(Error::Protocol(ProtocolError::ChainRequestAtHead(0)))
        ));
        assert!(matches!(
            mid.chain_request(seq, args(&["get", "k"])).await,
            Err(Error::Protocol(ProtocolError::AccessorInChain { block: 1, .. }))
        ));
        assert_eq!(
            head.request(seq, args(&["frobnicate"])).await.unwrap(),
            Some(Status::UnknownCommand.reply())
        );

        assert_eq!(head.metrics().protocol_errors.get(), 2);
        assert_eq!(mid.metrics().protocol_errors.get(), 2);
        assert_eq!(tail.metrics().protocol_errors.get(), 1);
        for block in 0..3 {
            assert!(cluster.store(block).unwrap().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replayed_requests_leave_state_unchanged() {
        let cluster = TestCluster::new(3, config()).unwrap();
        let status = cluster.create_table("/t", 1, 3).unwrap();
        let mut client = cluster.chain_client("/t", status.chains[0].clone()).unwrap();
        for i in 0..10 {
            let key = format!("k{}", i);
            client.run_command(args(&["put", &key, "value"])).await.unwrap();
        }

        let (mid, tail) = (cluster.link(1).unwrap(), cluster.link(2).unwrap());
        let tail_store = cluster.store(2).unwrap();
        let bytes = tail_store.bytes();

        // server_seq_no 3 was the put of k2
        let replay = SequenceId {
            client_id: 999,
            client_seq_no: 1,
            server_seq_no: 3,
        };
        mid.chain_request(replay, args(&["upsert", "k2", "changed"]))
            .await
            .unwrap();

        assert!(wait_until(|| tail.metrics().replays_skipped.get() == 1, Duration::from_secs(5)).await);
        assert!(wait_until(|| mid.pending_count() == 0, Duration::from_secs(5)).await);
        assert_eq!(mid.metrics().replays_skipped.get(), 1);
        assert_eq!(tail_store.get("k2", false), Status::Ok.reply_with("value"));
        assert_eq!(tail_store.bytes(), bytes);
        assert_eq!(cluster.store(1).unwrap().bytes(), bytes);
    }

    /// Put 1..=1000 into a 3-block chain, kill the head, repair, resend,
    /// and read everything back.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_head_failure_end_to_end() {
        init_tracing();
        let cluster = TestCluster::new(3, config()).unwrap();
        cluster.create_table("/t", 1, 3).unwrap();
        let mut table = cluster.table_client("/t").await.unwrap();

        for i in 1..=1000 {
            let status = table.put(&i.to_string(), &format!("v{}", i)).await.unwrap();
            assert_eq!(status, Status::Ok);
        }

        cluster.kill_block(0);
        let chain = cluster.chains("/t").await.unwrap()[0].clone();
        let repaired = cluster.directory.resolve_failures("/t", &chain).await.unwrap();
        assert_eq!(repaired.block_ids, vec![1, 2]);

        let new_head = cluster.link(1).unwrap();
        assert_eq!(new_head.role(), ChainRole::Head);
        assert_eq!(new_head.prev_block(), None);
        new_head.resend_pending().await.unwrap();
        assert!(wait_until(|| new_head.pending_count() == 0, Duration::from_secs(5)).await);

        for i in 1..=1000 {
            assert_eq!(
                table.get(&i.to_string()).await.unwrap(),
                Some(format!("v{}", i)),
                "key {}",
                i
            );
        }

        // The client notices the dead head and follows the repaired chain.
        assert_eq!(table.put("after", "x").await.unwrap(), Status::Ok);
        assert_eq!(table.get("after").await.unwrap().as_deref(), Some("x"));
        assert_eq!(cluster.store(2).unwrap().len(), 1001);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mid_failure_reconnects_head_to_tail() {
        init_tracing();
        let cluster = TestCluster::new(3, config()).unwrap();
        cluster.create_table("/t", 1, 3).unwrap();
        let mut table = cluster.table_client("/t").await.unwrap();
        for i in 0..50 {
            table.put(&format!("k{}", i), "v").await.unwrap();
        }

        cluster.kill_block(1);
        for i in 50..100 {
            assert_eq!(table.put(&format!("k{}", i), "v").await.unwrap(), Status::Ok);
        }

        let (head, tail) = (cluster.link(0).unwrap(), cluster.link(2).unwrap());
        assert_eq!(head.next_block(), Some(2));
        assert_eq!(tail.prev_block(), Some(0));
        assert!(wait_until(|| head.pending_count() == 0, Duration::from_secs(5)).await);

        for i in 0..100 {
            assert_eq!(table.get(&format!("k{}", i)).await.unwrap().as_deref(), Some("v"));
        }
        assert_eq!(cluster.store(0).unwrap().len(), 100);
        assert_eq!(cluster.store(2).unwrap().len(), 100);
    }

    /// Mutators stuck behind a locked tail when the mid dies reach the tail
    /// three times: buffered on the dead mid's connection, resent by the
    /// repair, and resent once more. Each is applied exactly once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resend_after_mid_failure_applies_once() {
        init_tracing();
        let cluster = TestCluster::new(3, config()).unwrap();
        cluster.create_table("/t", 1, 3).unwrap();
        let mut table = cluster.table_client("/t").await.unwrap();
        for i in 0..10 {
            table.put(&format!("k{}", i), "v").await.unwrap();
        }
        let (head, mid) = (cluster.link(0).unwrap(), cluster.link(1).unwrap());
        assert!(wait_until(|| head.pending_count() == 0, Duration::from_secs(5)).await);

        let tail_store = cluster.store(2).unwrap();
        tail_store.lock().await;

        let mutators = [
            args(&["upsert", "k0", "a much longer value"]),
            args(&["update", "k1", "xyz"]),
            args(&["remove", "k2"]),
            args(&["put", "k10", "new"]),
            args(&["upsert", "k0", "s"]),
        ];
        let n = mutators.len();
        for (i, mutator) in mutators.iter().enumerate() {
            let seq = SequenceId::new(77, i as i64 + 1);
            assert_eq!(head.request(seq, mutator.clone()).await.unwrap(), None);
        }
        assert!(wait_until(|| mid.metrics().forwarded.get() == 10 + n as u64, Duration::from_secs(5)).await);
        assert_eq!(head.pending_count(), n);

        cluster.kill_block(1);
        let chain = cluster.chains("/t").await.unwrap()[0].clone();
        let repaired = cluster.directory.resolve_failures("/t", &chain).await.unwrap();
        assert_eq!(repaired.block_ids, vec![0, 2]);
        assert_eq!(head.metrics().resent.get(), n as u64);

        assert_eq!(head.resend_pending().await.unwrap(), n);
        assert_eq!(head.metrics().resent.get(), 2 * n as u64);

        tail_store.unlock();
        let tail = cluster.link(2).unwrap();
        assert!(wait_until(|| head.pending_count() == 0, Duration::from_secs(5)).await);
        assert!(
            wait_until(
                || tail.metrics().replays_skipped.get() == 2 * n as u64,
                Duration::from_secs(5)
            )
            .await
        );

        let head_store = cluster.store(0).unwrap();
        let mut head_entries = head_store.entries();
        let mut tail_entries = tail_store.entries();
        head_entries.sort();
        tail_entries.sort();
        assert_eq!(head_entries, tail_entries);
        assert_eq!(head_store.bytes(), tail_store.bytes());
        assert_eq!(tail.applied_seq(), head.applied_seq());

        assert_eq!(tail_store.get("k0", false), Status::Ok.reply_with("s"));
        assert_eq!(tail_store.get("k1", false), Status::Ok.reply_with("xyz"));
        assert_eq!(tail_store.get("k2", false), Status::KeyNotFound.reply());
        assert_eq!(tail_store.get("k10", false), Status::Ok.reply_with("new"));
        let expected_bytes: usize = tail_entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        assert_eq!(tail_store.bytes(), expected_bytes);
    }

    /// One frame waits on the tail's table gate while a second connection
    /// delivers the same frame and a later remove.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_replay_streams_apply_once() {
        let cluster = TestCluster::new(2, config()).unwrap();
        cluster.create_table("/t", 1, 2).unwrap();
        let tail = cluster.link(1).unwrap();
        let store = cluster.store(1).unwrap();
        let put = SequenceId {
            client_id: 7,
            client_seq_no: 1,
            server_seq_no: 1,
        };
        let remove = SequenceId {
            client_id: 7,
            client_seq_no: 2,
            server_seq_no: 2,
        };

        store.lock().await;
        let stale = {
            let tail = tail.clone();
            tokio::spawn(async move { tail.chain_request(put, args(&["put", "k", "v"])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stale.is_finished());
        store.unlock();

        tail.chain_request(put, args(&["put", "k", "v"])).await.unwrap();
        tail.chain_request(remove, args(&["remove", "k"])).await.unwrap();
        stale.await.unwrap().unwrap();

        assert_eq!(tail.applied_seq(), 2);
        assert_eq!(tail.metrics().replays_skipped.get(), 1);
        assert_eq!(store.get("k", false), Status::KeyNotFound.reply());
        assert!(store.is_empty());
        assert_eq!(store.bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tail_failure_promotes_mid() {
        let cluster = TestCluster::new(3, config()).unwrap();
        cluster.create_table("/t", 1, 3).unwrap();
        let mut table = cluster.table_client("/t").await.unwrap();
        for i in 0..20 {
            table.put(&format!("k{}", i), "v").await.unwrap();
        }

        cluster.kill_block(2);
        assert_eq!(table.get("k3").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cluster.link(1).unwrap().role(), ChainRole::Tail);

        table.upsert("k3", "w").await.unwrap();
        assert_eq!(table.get("k3").await.unwrap().as_deref(), Some("w"));
        assert_eq!(cluster.chains("/t").await.unwrap()[0].block_ids, vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribers_see_tail_mutations() {
        let cluster = TestCluster::new(2, config()).unwrap();
        let status = cluster.create_table("/t", 1, 2).unwrap();
        let tail = cluster.link(1).unwrap();
        let mut notifications = tail.subscribe(&["put", "remove"]);

        let mut client = cluster.chain_client("/t", status.chains[0].clone()).unwrap();
        client.run_command(args(&["put", "a", "1"])).await.unwrap();
        client.run_command(args(&["upsert", "a", "2"])).await.unwrap();
        client.run_command(args(&["remove", "a"])).await.unwrap();

        let first = notifications.recv().await.unwrap();
        assert_eq!((first.op.as_str(), first.key.as_str()), ("put", "a"));
        let second = notifications.recv().await.unwrap();
        assert_eq!((second.op.as_str(), second.key.as_str()), ("remove", "a"));
        assert_eq!(tail.partition().storage_size(), 0);
    }
}
