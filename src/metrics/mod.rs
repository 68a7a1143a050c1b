//! Metrics for chain links and hash table shards.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       ChainLink                             │
//! │  ┌─────────────────────────┐  ┌──────────────────────────┐ │
//! │  │      LinkMetrics        │  │      ShardMetrics        │ │
//! │  │ - requests / chain reqs │  │ - splits / merges        │ │
//! │  │ - forwards / acks       │  │ - keys exported          │ │
//! │  │ - resends / replays     │  │ - migration failures     │ │
//! │  │ - pending (gauge)       │  │                          │ │
//! │  └─────────────────────────┘  └──────────────────────────┘ │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::Counter;
pub use gauges::Gauge;

/// Replication counters for one chain link.
#[derive(Debug)]
pub struct LinkMetrics {
    pub requests: Counter,
    pub chain_requests: Counter,
    pub forwarded: Counter,
    pub acks: Counter,
    pub resent: Counter,
    pub replays_skipped: Counter,
    pub protocol_errors: Counter,
    pub pending: Gauge,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            requests: Counter::new("chain_requests_total", "Client requests received"),
            chain_requests: Counter::new(
                "chain_forwarded_requests_received_total",
                "Requests received from the previous link",
            ),
            forwarded: Counter::new("chain_forwarded_total", "Requests forwarded downstream"),
            acks: Counter::new("chain_acks_total", "Acknowledgments processed"),
            resent: Counter::new("chain_resent_total", "Pending requests retransmitted"),
            replays_skipped: Counter::new(
                "chain_replays_skipped_total",
                "Retransmitted requests already applied locally",
            ),
            protocol_errors: Counter::new(
                "chain_protocol_errors_total",
                "Requests rejected for protocol misuse",
            ),
            pending: Gauge::new("chain_pending_requests", "Forwarded requests awaiting ack"),
        }
    }

    pub fn snapshot(&self) -> LinkMetricsSnapshot {
        LinkMetricsSnapshot {
            requests: self.requests.get(),
            chain_requests: self.chain_requests.get(),
            forwarded: self.forwarded.get(),
            acks: self.acks.get(),
            resent: self.resent.get(),
            replays_skipped: self.replays_skipped.get(),
            protocol_errors: self.protocol_errors.get(),
            pending: self.pending.get(),
        }
    }

    /// Format in Prometheus exposition format, labelled with the block id.
    pub fn to_prometheus(&self, block_id: u64) -> String {
        let mut output = String::new();
        for counter in [
            &self.requests,
            &self.chain_requests,
            &self.forwarded,
            &self.acks,
            &self.resent,
            &self.replays_skipped,
            &self.protocol_errors,
        ] {
            output.push_str(&format!(
                "# HELP {} {}\n# TYPE {} counter\n{}{{block=\"{}\"}} {}\n",
                counter.name(),
                counter.help(),
                counter.name(),
                counter.name(),
                block_id,
                counter.get()
            ));
        }
        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} gauge\n{}{{block=\"{}\"}} {}\n",
            self.pending.name(),
            self.pending.help(),
            self.pending.name(),
            self.pending.name(),
            block_id,
            self.pending.get()
        ));
        output
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`LinkMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMetricsSnapshot {
    pub requests: u64,
    pub chain_requests: u64,
    pub forwarded: u64,
    pub acks: u64,
    pub resent: u64,
    pub replays_skipped: u64,
    pub protocol_errors: u64,
    pub pending: i64,
}

/// Auto-scaling counters for one hash table shard.
#[derive(Debug)]
pub struct ShardMetrics {
    pub splits: Counter,
    pub merges: Counter,
    pub keys_exported: Counter,
    pub migration_failures: Counter,
}

impl ShardMetrics {
    pub fn new() -> Self {
        Self {
            splits: Counter::new("shard_splits_total", "Completed splits"),
            merges: Counter::new("shard_merges_total", "Completed merges"),
            keys_exported: Counter::new("shard_keys_exported_total", "Keys moved to other shards"),
            migration_failures: Counter::new(
                "shard_migration_failures_total",
                "Split or merge attempts that failed",
            ),
        }
    }

    pub fn snapshot(&self) -> ShardMetricsSnapshot {
        ShardMetricsSnapshot {
            splits: self.splits.get(),
            merges: self.merges.get(),
            keys_exported: self.keys_exported.get(),
            migration_failures: self.migration_failures.get(),
        }
    }
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ShardMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardMetricsSnapshot {
    pub splits: u64,
    pub merges: u64,
    pub keys_exported: u64,
    pub migration_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_snapshot() {
        let metrics = LinkMetrics::new();
        metrics.requests.inc();
        metrics.forwarded.inc_by(2);
        metrics.pending.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.forwarded, 2);
        assert_eq!(snap.pending, 1);
        assert_eq!(snap.acks, 0);
    }

    #[test]
    fn test_prometheus_labels() {
        let metrics = LinkMetrics::new();
        metrics.acks.inc();
        let text = metrics.to_prometheus(9);
        assert!(text.contains("chain_acks_total{block=\"9\"} 1"));
        assert!(text.contains("# TYPE chain_pending_requests gauge"));
    }
}
