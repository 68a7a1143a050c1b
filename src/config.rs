//! Configuration types for the store.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Default batch size for slot migration.
pub const DEFAULT_EXPORT_BATCH_SIZE: usize = 1024;

/// Top-level configuration for a store deployment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bytes of memory each block may account for.
    pub block_capacity: usize,

    /// Number of replicas per chain.
    pub chain_length: usize,

    /// Hash table behavior.
    pub hash_table: HashStoreConfig,

    /// Client behavior.
    pub client: ClientConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_capacity: 128 * 1024 * 1024,
            chain_length: 1,
            hash_table: HashStoreConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set per-block capacity in bytes.
    pub fn with_block_capacity(mut self, capacity: usize) -> Self {
        self.block_capacity = capacity;
        self
    }

    /// Set the number of replicas per chain.
    pub fn with_chain_length(mut self, length: usize) -> Self {
        self.chain_length = length;
        self
    }

    /// Set hash table configuration.
    pub fn with_hash_table_config(mut self, config: HashStoreConfig) -> Self {
        self.hash_table = config;
        self
    }

    /// Set client configuration.
    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.client = config;
        self
    }

    /// Check the configuration for values the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_capacity == 0 {
            return Err(Error::Config("block_capacity must be positive".into()));
        }
        if self.chain_length == 0 {
            return Err(Error::Config("chain_length must be at least 1".into()));
        }
        self.hash_table.validate()?;
        self.client.validate()
    }
}

/// Hash table shard configuration.
#[derive(Debug, Clone)]
pub struct HashStoreConfig {
    /// Fraction of block capacity above which the shard splits.
    pub threshold_hi: f64,

    /// Fraction of block capacity below which the shard merges away.
    pub threshold_lo: f64,

    /// Whether the tail triggers split/merge on its own.
    pub auto_scale: bool,

    /// Keys moved per locked migration batch.
    pub export_batch_size: usize,

    /// Compress snapshots written by `sync`/`dump`.
    pub compress_snapshots: bool,
}

impl Default for HashStoreConfig {
    fn default() -> Self {
        Self {
            threshold_hi: 0.95,
            threshold_lo: 0.0,
            auto_scale: true,
            export_batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            compress_snapshots: true,
        }
    }
}

impl HashStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the split threshold.
    pub fn with_threshold_hi(mut self, threshold: f64) -> Self {
        self.threshold_hi = threshold;
        self
    }

    /// Set the merge threshold.
    pub fn with_threshold_lo(mut self, threshold: f64) -> Self {
        self.threshold_lo = threshold;
        self
    }

    /// Enable or disable automatic split/merge.
    pub fn with_auto_scale(mut self, enabled: bool) -> Self {
        self.auto_scale = enabled;
        self
    }

    /// Set the migration batch size.
    pub fn with_export_batch_size(mut self, size: usize) -> Self {
        self.export_batch_size = size;
        self
    }

    /// Enable or disable snapshot compression.
    pub fn with_compress_snapshots(mut self, enabled: bool) -> Self {
        self.compress_snapshots = enabled;
        self
    }

    /// Build a configuration from string properties, as handed over by the
    /// directory when a partition is created. Unknown keys are ignored.
    ///
    /// Recognized keys: `hashtable.capacity_threshold_hi`,
    /// `hashtable.capacity_threshold_lo`, `hashtable.auto_scale`,
    /// `hashtable.export_batch_size`, `hashtable.compress_snapshots`.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = props.get("hashtable.capacity_threshold_hi") {
            config.threshold_hi = parse_property("hashtable.capacity_threshold_hi", v)?;
        }
        if let Some(v) = props.get("hashtable.capacity_threshold_lo") {
            config.threshold_lo = parse_property("hashtable.capacity_threshold_lo", v)?;
        }
        if let Some(v) = props.get("hashtable.auto_scale") {
            config.auto_scale = parse_property("hashtable.auto_scale", v)?;
        }
        if let Some(v) = props.get("hashtable.export_batch_size") {
            config.export_batch_size = parse_property("hashtable.export_batch_size", v)?;
        }
        if let Some(v) = props.get("hashtable.compress_snapshots") {
            config.compress_snapshots = parse_property("hashtable.compress_snapshots", v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold_hi) || !(0.0..=1.0).contains(&self.threshold_lo) {
            return Err(Error::Config("capacity thresholds must lie in [0, 1]".into()));
        }
        if self.threshold_lo >= self.threshold_hi {
            return Err(Error::Config(format!(
                "threshold_lo ({}) must be below threshold_hi ({})",
                self.threshold_lo, self.threshold_hi
            )));
        }
        if self.export_batch_size == 0 {
            return Err(Error::Config("export_batch_size must be positive".into()));
        }
        Ok(())
    }
}

fn parse_property<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
}

/// Replica chain client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the tail's reply to a mutator.
    pub request_timeout: Duration,

    /// Repair-and-retry attempts after a transport failure.
    pub max_retries: usize,

    /// Redirects followed before a hash table call gives up.
    pub max_redirects: usize,

    /// Pause between retries.
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            max_redirects: 64,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the number of retries after a transport failure.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the redirect limit.
    pub fn with_max_redirects(mut self, redirects: usize) -> Self {
        self.max_redirects = redirects;
        self
    }

    /// Set the pause between retries.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be positive".into()));
        }
        if self.max_redirects == 0 {
            return Err(Error::Config("max_redirects must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hash_table.export_batch_size, 1024);
        assert_eq!(config.hash_table.threshold_hi, 0.95);
        assert_eq!(config.hash_table.threshold_lo, 0.0);
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::new()
            .with_block_capacity(4096)
            .with_chain_length(3)
            .with_hash_table_config(HashStoreConfig::new().with_threshold_lo(0.1));
        assert_eq!(config.block_capacity, 4096);
        assert_eq!(config.chain_length, 3);
        assert_eq!(config.hash_table.threshold_lo, 0.1);
    }

    #[test]
    fn test_from_properties() {
        let mut props = HashMap::new();
        props.insert("hashtable.capacity_threshold_hi".to_string(), "0.8".to_string());
        props.insert("hashtable.capacity_threshold_lo".to_string(), "0.05".to_string());
        props.insert("hashtable.export_batch_size".to_string(), "16".to_string());
        props.insert("unrelated.key".to_string(), "x".to_string());

        let config = HashStoreConfig::from_properties(&props).unwrap();
        assert_eq!(config.threshold_hi, 0.8);
        assert_eq!(config.threshold_lo, 0.05);
        assert_eq!(config.export_batch_size, 16);
        assert!(config.auto_scale);
    }

    #[test]
    fn test_from_properties_rejects_garbage() {
        let mut props = HashMap::new();
        props.insert("hashtable.capacity_threshold_hi".to_string(), "lots".to_string());
        assert!(matches!(
            HashStoreConfig::from_properties(&props),
            Err(Error::Config(_))
        ));

        let mut props = HashMap::new();
        props.insert("hashtable.capacity_threshold_lo".to_string(), "0.99".to_string());
        assert!(HashStoreConfig::from_properties(&props).is_err());
    }
}
