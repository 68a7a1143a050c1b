//! Client for a hash table file.

use super::ReplicaChainClient;
use crate::chain::ChainTransport;
use crate::config::ClientConfig;
use crate::directory::{DataStatus, Directory};
use crate::error::{DirectoryError, Error, Result};
use crate::storage::hashtable::cmd;
use crate::types::{ReplicaChain, Response, Status, REDIRECTED_MARKER};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Routes single-key commands to the chain owning the key's hash slot.
///
/// The routing table is the directory's chain list. `!block_moved` means the
/// table is stale and is refreshed; `!exporting!<ids>` means the key already
/// moved mid-migration and the command is resent to the named chain with
/// the `!redirected` marker.
pub struct HashTableClient {
    path: String,
    transport: Arc<dyn ChainTransport>,
    directory: Arc<dyn Directory>,
    config: ClientConfig,
    status: DataStatus,
    clients: HashMap<String, ReplicaChainClient>,
}

impl HashTableClient {
    pub async fn new(
        path: &str,
        transport: Arc<dyn ChainTransport>,
        directory: Arc<dyn Directory>,
        config: ClientConfig,
    ) -> Result<Self> {
        let status = directory.dstatus(path).await?;
        Ok(Self {
            path: path.to_string(),
            transport,
            directory,
            config,
            status,
            clients: HashMap::new(),
        })
    }

    /// Current routing table.
    pub fn status(&self) -> &DataStatus {
        &self.status
    }

    /// Reload the routing table and drop clients of chains that are gone.
    pub async fn refresh(&mut self) -> Result<()> {
        self.status = self.directory.dstatus(&self.path).await?;
        let live: Vec<String> = self.status.chains.iter().map(|c| c.target_string()).collect();
        self.clients.retain(|target, _| live.contains(target));
        debug!(path = %self.path, chains = self.status.chains.len(), "Refreshed routing table");
        Ok(())
    }

    /// Run a command whose first argument is a key.
    pub async fn run_command(&mut self, args: Vec<String>) -> Result<Response> {
        let Some(key) = args.get(1).cloned() else {
            return Ok(Status::ArgsError.reply());
        };

        for attempt in 0..self.config.max_redirects {
            let Some(chain) = self.status.chain_for_key(&key).cloned() else {
                self.refresh().await?;
                continue;
            };
            let response = match self.send(&chain, args.clone()).await {
                Ok(response) => response,
                Err(e) if is_stale_route(&e) => {
                    debug!(key = %key, chain = %chain, error = %e, "Chain is gone, refreshing");
                    self.refresh().await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match Status::of(&response) {
                Some(Status::BlockMoved) => {
                    trace!(key = %key, attempt, "Block moved, refreshing");
                    tokio::time::sleep(self.config.retry_backoff).await;
                    self.refresh().await?;
                }
                Some(Status::Exporting(target)) => {
                    let response = match self.redirect(target, &args).await {
                        Ok(response) => response,
                        Err(e) if is_stale_route(&e) => {
                            self.refresh().await?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if Status::of(&response).is_some_and(|s| s.is_redirect()) {
                        trace!(key = %key, attempt, "Redirect target moved, refreshing");
                        tokio::time::sleep(self.config.retry_backoff).await;
                        self.refresh().await?;
                    } else {
                        return Ok(response);
                    }
                }
                _ => return Ok(response),
            }
        }
        Err(Error::RedirectLimit {
            attempts: self.config.max_redirects,
        })
    }

    async fn redirect(&mut self, target: ReplicaChain, args: &[String]) -> Result<Response> {
        let chain = self
            .status
            .chains
            .iter()
            .find(|c| c.block_ids == target.block_ids)
            .cloned()
            .unwrap_or(target);
        let mut redirected = args.to_vec();
        redirected.push(REDIRECTED_MARKER.to_string());
        trace!(target = %chain, "Following export redirect");
        self.send(&chain, redirected).await
    }

    async fn send(&mut self, chain: &ReplicaChain, args: Vec<String>) -> Result<Response> {
        self.client_for(chain)?.run_command(args).await
    }

    fn client_for(&mut self, chain: &ReplicaChain) -> Result<&mut ReplicaChainClient> {
        match self.clients.entry(chain.target_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(ReplicaChainClient::new(
                &self.path,
                chain.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.directory),
                self.config.clone(),
            )?)),
        }
    }

    async fn keyed(&mut self, command: &str, key: &str, value: Option<&str>) -> Result<Response> {
        let mut args = vec![command.to_string(), key.to_string()];
        args.extend(value.map(str::to_string));
        self.run_command(args).await
    }

    /// Insert a new key. Returns `Status::DuplicateKey` if it exists.
    pub async fn put(&mut self, key: &str, value: &str) -> Result<Status> {
        let response = self.keyed(cmd::PUT, key, Some(value)).await?;
        match Status::of(&response) {
            Some(status @ (Status::Ok | Status::DuplicateKey)) => Ok(status),
            _ => Err(rejected(response)),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let response = self.keyed(cmd::GET, key, None).await?;
        value_or_missing(response)
    }

    /// Overwrite an existing key; returns the previous value.
    pub async fn update(&mut self, key: &str, value: &str) -> Result<Option<String>> {
        let response = self.keyed(cmd::UPDATE, key, Some(value)).await?;
        value_or_missing(response)
    }

    /// Insert or overwrite.
    pub async fn upsert(&mut self, key: &str, value: &str) -> Result<()> {
        let response = self.keyed(cmd::UPSERT, key, Some(value)).await?;
        match Status::of(&response) {
            Some(Status::Ok) => Ok(()),
            _ => Err(rejected(response)),
        }
    }

    /// Delete a key; returns the removed value.
    pub async fn remove(&mut self, key: &str) -> Result<Option<String>> {
        let response = self.keyed(cmd::REMOVE, key, None).await?;
        value_or_missing(response)
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        let response = self.keyed(cmd::EXISTS, key, None).await?;
        match Status::of(&response) {
            Some(Status::Ok) => Ok(true),
            Some(Status::KeyNotFound) => Ok(false),
            _ => Err(rejected(response)),
        }
    }

    /// Keys across every chain of the file.
    pub async fn num_keys(&mut self) -> Result<usize> {
        self.refresh().await?;
        let chains = self.status.chains.clone();
        let mut total = 0;
        for chain in &chains {
            let response = self
                .client_for(chain)?
                .run_command(vec![cmd::NUM_KEYS.to_string()])
                .await?;
            let count = match Status::of(&response) {
                Some(Status::Ok) => response.get(1).and_then(|n| n.parse::<usize>().ok()),
                _ => None,
            };
            total += count.ok_or_else(|| rejected(response))?;
        }
        Ok(total)
    }
}

fn value_or_missing(response: Response) -> Result<Option<String>> {
    match Status::of(&response) {
        Some(Status::Ok) if response.len() > 1 => Ok(response.into_iter().nth(1)),
        Some(Status::KeyNotFound) => Ok(None),
        _ => Err(rejected(response)),
    }
}

/// The chain was removed by a merge or lost all its replicas after the
/// routing table was read.
fn is_stale_route(err: &Error) -> bool {
    matches!(
        err,
        Error::Directory(DirectoryError::PartitionNotFound { .. }) | Error::Network(_)
    )
}

fn rejected(response: Response) -> Error {
    Error::Rejected(response.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalTransport;
    use crate::config::{HashStoreConfig, StoreConfig};
    use crate::directory::InMemoryDirectory;
    use crate::storage::manager::StorageManager;
    use crate::storage::partition::PartitionKind;

    async fn table(num_chains: usize) -> (Arc<InMemoryDirectory>, HashTableClient) {
        let transport = LocalTransport::new();
        let config = StoreConfig::default()
            .with_block_capacity(1 << 20)
            .with_hash_table_config(HashStoreConfig::default().with_auto_scale(false));
        let storage = StorageManager::new(8, config, transport.clone()).unwrap();
        let directory = InMemoryDirectory::new(storage);
        directory
            .create("/t", PartitionKind::HashTable, num_chains, 2, None)
            .unwrap();
        let client = HashTableClient::new("/t", transport, directory.clone(), ClientConfig::default())
            .await
            .unwrap();
        (directory, client)
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let (_directory, mut client) = table(2).await;
        assert_eq!(client.put("a", "1").await.unwrap(), Status::Ok);
        assert_eq!(client.put("a", "2").await.unwrap(), Status::DuplicateKey);
        assert_eq!(client.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(client.exists("a").await.unwrap());
        assert_eq!(client.update("a", "3").await.unwrap().as_deref(), Some("1"));
        assert_eq!(client.get("a").await.unwrap().as_deref(), Some("3"));
        client.upsert("b", "4").await.unwrap();
        assert_eq!(client.remove("a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(client.get("a").await.unwrap(), None);
        assert!(!client.exists("a").await.unwrap());
        assert_eq!(client.update("a", "5").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_spread_over_chains() {
        let (directory, mut client) = table(2).await;
        for i in 0..200 {
            client.put(&format!("key{}", i), "v").await.unwrap();
        }
        assert_eq!(client.num_keys().await.unwrap(), 200);

        let status = directory.dstatus("/t").await.unwrap();
        for chain in &status.chains {
            let tail = directory.storage().link(chain.tail().unwrap()).unwrap();
            let store = tail.partition().as_hash_table().unwrap().clone();
            assert!(store.len() > 0 && store.len() < 200);
        }
    }

    #[tokio::test]
    async fn test_missing_key_argument() {
        let (_directory, mut client) = table(1).await;
        assert_eq!(
            client.run_command(vec!["get".into()]).await.unwrap(),
            Status::ArgsError.reply()
        );
    }
}
