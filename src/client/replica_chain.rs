//! Client for one replica chain.

use crate::chain::{ChainTransport, Reply};
use crate::config::ClientConfig;
use crate::directory::Directory;
use crate::error::{Error, NetworkError, Result};
use crate::storage::partition::{CommandKind, Partition};
use crate::types::{BlockId, ReplicaChain, Response, SequenceId, Status};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Sends commands to one chain: mutators to the head, accessors to the tail.
///
/// The client registers a reply channel at the tail. A mutator entering a
/// longer chain is answered there, tagged with the client sequence number,
/// and replies to earlier attempts are discarded. A transport failure or a
/// timeout asks the directory to repair the chain and retries the command
/// against the repaired chain.
pub struct ReplicaChainClient {
    path: String,
    chain: ReplicaChain,
    transport: Arc<dyn ChainTransport>,
    directory: Arc<dyn Directory>,
    config: ClientConfig,
    client_id: i64,
    client_seq: i64,
    tx: mpsc::UnboundedSender<Reply>,
    rx: mpsc::UnboundedReceiver<Reply>,
    registered_at: Option<BlockId>,
}

impl ReplicaChainClient {
    pub fn new(
        path: &str,
        chain: ReplicaChain,
        transport: Arc<dyn ChainTransport>,
        directory: Arc<dyn Directory>,
        config: ClientConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = transport.next_client_id();
        let mut client = Self {
            path: path.to_string(),
            chain,
            transport,
            directory,
            config,
            client_id,
            client_seq: 0,
            tx,
            rx,
            registered_at: None,
        };
        client.register()?;
        Ok(client)
    }

    pub fn chain(&self) -> &ReplicaChain {
        &self.chain
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    /// Run one command, repairing the chain and retrying on transport
    /// failures.
    pub async fn run_command(&mut self, args: Vec<String>) -> Result<Response> {
        let mut attempt = 0;
        loop {
            match self.send_once(&args).await {
                Ok(mut response) => {
                    if attempt > 0 && Status::of(&response) == Some(Status::DuplicateKey) {
                        // The earlier attempt reached the tail before the failure.
                        response[0] = Status::Ok.to_string();
                    }
                    return Ok(response);
                }
                Err(e) if e.is_transport() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        client_id = self.client_id,
                        chain = %self.chain,
                        attempt,
                        error = %e,
                        "Chain request failed, repairing"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                    self.repair().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&mut self, args: &[String]) -> Result<Response> {
        let command = args
            .first()
            .ok_or_else(|| Error::Internal("empty command".into()))?;
        let head = self.chain.head().ok_or(NetworkError::ConnectionClosed)?;
        let tail = self.chain.tail().ok_or(NetworkError::ConnectionClosed)?;

        let head_link = self.transport.endpoint(head)?;
        let target = match head_link.partition().command_kind(command) {
            Some(CommandKind::Mutator) => head_link,
            _ => self.transport.endpoint(tail)?,
        };

        self.client_seq += 1;
        let seq = SequenceId::new(self.client_id, self.client_seq);
        if let Some(response) = target.request(seq, args.to_vec()).await? {
            return Ok(response);
        }
        self.await_reply(self.client_seq).await
    }

    async fn await_reply(&mut self, client_seq: i64) -> Result<Response> {
        let deadline = tokio::time::Instant::now() + self.config.request_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Err(Error::Timeout),
                Ok(None) => return Err(NetworkError::ConnectionClosed.into()),
                Ok(Some((seq, response))) if seq == client_seq => return Ok(response),
                Ok(Some((seq, _))) => {
                    debug!(client_id = self.client_id, seq, "Discarding stale reply");
                }
            }
        }
    }

    /// Ask the directory for the repaired chain and follow its tail.
    async fn repair(&mut self) -> Result<()> {
        self.chain = self
            .directory
            .resolve_failures(&self.path, &self.chain)
            .await?;
        if self.registered_at != self.chain.tail() {
            self.unregister();
            self.register()?;
        }
        debug!(client_id = self.client_id, chain = %self.chain, "Client follows repaired chain");
        Ok(())
    }

    fn register(&mut self) -> Result<()> {
        let tail = self.chain.tail().ok_or(NetworkError::ConnectionClosed)?;
        self.transport
            .endpoint(tail)?
            .register_client(self.client_id, self.tx.clone());
        self.registered_at = Some(tail);
        Ok(())
    }

    fn unregister(&mut self) {
        if let Some(block) = self.registered_at.take() {
            if let Ok(link) = self.transport.endpoint(block) {
                link.unregister_client(self.client_id);
            }
        }
    }
}

impl Drop for ReplicaChainClient {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LocalTransport;
    use crate::config::StoreConfig;
    use crate::directory::InMemoryDirectory;
    use crate::storage::manager::StorageManager;
    use crate::storage::partition::PartitionKind;
    use std::time::Duration;

    async fn client(chain_length: usize) -> (Arc<LocalTransport>, Arc<InMemoryDirectory>, ReplicaChainClient) {
        let transport = LocalTransport::new();
        let storage = StorageManager::new(
            4,
            StoreConfig::default().with_block_capacity(1 << 20),
            transport.clone(),
        )
        .unwrap();
        let directory = InMemoryDirectory::new(storage);
        let status = directory
            .create("/t", PartitionKind::HashTable, 1, chain_length, None)
            .unwrap();
        let config = ClientConfig::default()
            .with_request_timeout(Duration::from_millis(500))
            .with_retry_backoff(Duration::from_millis(1));
        let client = ReplicaChainClient::new(
            "/t",
            status.chains[0].clone(),
            transport.clone(),
            directory.clone(),
            config,
        )
        .unwrap();
        (transport, directory, client)
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_then_get_through_chain() {
        let (_transport, _directory, mut client) = client(3).await;
        assert_eq!(
            client.run_command(args(&["put", "k", "v"])).await.unwrap(),
            Status::Ok.reply()
        );
        assert_eq!(
            client.run_command(args(&["get", "k"])).await.unwrap(),
            Status::Ok.reply_with("v")
        );
        assert_eq!(
            client.run_command(args(&["put", "k", "w"])).await.unwrap(),
            Status::DuplicateKey.reply()
        );
        assert_eq!(
            client.run_command(args(&["bogus"])).await.unwrap(),
            Status::UnknownCommand.reply()
        );
    }

    #[tokio::test]
    async fn test_retries_after_tail_failure() {
        let (transport, _directory, mut client) = client(3).await;
        client.run_command(args(&["put", "a", "1"])).await.unwrap();

        transport.kill(2);
        assert_eq!(
            client.run_command(args(&["get", "a"])).await.unwrap(),
            Status::Ok.reply_with("1")
        );
        assert_eq!(client.chain().block_ids, vec![0, 1]);
        assert_eq!(
            client.run_command(args(&["put", "b", "2"])).await.unwrap(),
            Status::Ok.reply()
        );
    }

    #[tokio::test]
    async fn test_lost_chain_is_an_error() {
        let (transport, _directory, mut client) = client(1).await;
        transport.kill(0);
        assert!(client.run_command(args(&["get", "a"])).await.is_err());
    }
}
