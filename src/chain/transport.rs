//! Connections between chain links.
//!
//! Every chain edge is one ordered connection. Requests travel downstream as
//! bincode frames and are applied by a single server task per connection,
//! so the downstream link sees them in send order. Acknowledgments travel
//! back on a separate upstream channel owned by the connection.
//!
//! ```text
//!   upstream link                         downstream link
//!   ┌──────────┐   Request{seq,args}     ┌──────────┐
//!   │  send()  │ ──────────────────────► │ server   │──► chain_request()
//!   │          │                         │ task     │
//!   │ ack loop │ ◄────────────────────── │ prev     │◄── ack()
//!   └──────────┘        Ack{seq}         └──────────┘
//! ```

use crate::chain::link::ChainLink;
use crate::error::{NetworkError, Result};
use crate::types::{BlockId, SequenceId};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Identifier of one chain edge.
pub type ConnectionId = u64;

/// A frame on a chain edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainMessage {
    /// A mutator travelling towards the tail.
    Request { seq: SequenceId, args: Vec<String> },
    /// Acknowledgment travelling towards the head.
    Ack { seq: SequenceId },
}

impl ChainMessage {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| NetworkError::Codec(e.to_string()).into())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| NetworkError::Codec(e.to_string()).into())
    }
}

/// The upstream side of a fresh connection: its id and the stream of acks
/// coming back from the downstream link.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub to: BlockId,
    pub acks: mpsc::UnboundedReceiver<Bytes>,
}

/// Held by a downstream link to acknowledge requests to its predecessor.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    conn: ConnectionId,
    from: BlockId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl UpstreamHandle {
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// Block on the other end of the connection.
    pub fn block(&self) -> BlockId {
        self.from
    }

    pub fn ack(&self, seq: SequenceId) -> Result<()> {
        let frame = ChainMessage::Ack { seq }.encode()?;
        self.tx
            .send(frame)
            .map_err(|_| NetworkError::Unreachable(self.from).into())
    }
}

/// Moves chain frames between links.
pub trait ChainTransport: Send + Sync {
    /// Make `link` reachable as `block`.
    fn register(&self, block: BlockId, link: &Arc<ChainLink>);

    /// Forget `block` and close its connections.
    fn unregister(&self, block: BlockId);

    /// Open an ordered connection from `from` to `to`.
    fn connect(&self, from: BlockId, to: BlockId) -> Result<Connection>;

    /// Send a frame downstream.
    fn send(&self, conn: ConnectionId, message: &ChainMessage) -> Result<()>;

    /// Close a connection. Closing an unknown connection is a no-op.
    fn disconnect(&self, conn: ConnectionId);

    /// The live link serving `block`.
    fn endpoint(&self, block: BlockId) -> Result<Arc<ChainLink>>;

    /// A process-unique client id.
    fn next_client_id(&self) -> i64;
}

struct ConnectionEntry {
    from: BlockId,
    to: BlockId,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// In-process transport over tokio channels.
///
/// Links are held weakly; the storage manager owns them. [`LocalTransport::kill`]
/// simulates a crashed block: its endpoint disappears and its connections
/// close, so later sends and lookups fail with [`NetworkError`].
pub struct LocalTransport {
    endpoints: DashMap<BlockId, Weak<ChainLink>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_conn: AtomicU64,
    next_client: AtomicI64,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            connections: DashMap::new(),
            next_conn: AtomicU64::new(1),
            next_client: AtomicI64::new(1),
        })
    }

    /// Crash `block`: stop its link and drop every connection touching it.
    pub fn kill(&self, block: BlockId) {
        if let Some((_, link)) = self.endpoints.remove(&block) {
            if let Some(link) = link.upgrade() {
                link.shutdown();
            }
        }
        self.drop_connections(block);
        info!(block_id = block, "Block killed");
    }

    pub fn is_alive(&self, block: BlockId) -> bool {
        self.endpoint(block).is_ok()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn drop_connections(&self, block: BlockId) {
        self.connections
            .retain(|_, entry| entry.from != block && entry.to != block);
    }

    /// Apply frames from one connection in order.
    async fn serve(conn: ConnectionId, link: Weak<ChainLink>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(frame) = rx.recv().await {
            let Some(link) = link.upgrade() else {
                break;
            };
            match ChainMessage::decode(&frame) {
                Ok(ChainMessage::Request { seq, args }) => {
                    if let Err(e) = link.chain_request(seq, args).await {
                        warn!(
                            conn,
                            block_id = link.block_id(),
                            seq = %seq,
                            error = %e,
                            "Chain request failed"
                        );
                    }
                }
                Ok(ChainMessage::Ack { seq }) => {
                    warn!(conn, seq = %seq, "Ack received on request stream");
                }
                Err(e) => {
                    error!(conn, error = %e, "Dropping undecodable frame");
                }
            }
        }
        debug!(conn, "Connection closed");
    }
}

impl ChainTransport for LocalTransport {
    fn register(&self, block: BlockId, link: &Arc<ChainLink>) {
        self.endpoints.insert(block, Arc::downgrade(link));
        debug!(block_id = block, "Endpoint registered");
    }

    fn unregister(&self, block: BlockId) {
        self.endpoints.remove(&block);
        self.drop_connections(block);
        debug!(block_id = block, "Endpoint unregistered");
    }

    fn connect(&self, from: BlockId, to: BlockId) -> Result<Connection> {
        let link = self.endpoint(to)?;
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        self.connections.insert(
            id,
            ConnectionEntry {
                from,
                to,
                tx: req_tx,
            },
        );
        link.set_prev(Some(UpstreamHandle {
            conn: id,
            from,
            tx: ack_tx,
        }));
        tokio::spawn(Self::serve(id, Arc::downgrade(&link), req_rx));

        debug!(conn = id, from, to, "Connected");
        Ok(Connection {
            id,
            to,
            acks: ack_rx,
        })
    }

    fn send(&self, conn: ConnectionId, message: &ChainMessage) -> Result<()> {
        let entry = self
            .connections
            .get(&conn)
            .ok_or(NetworkError::ConnectionClosed)?;
        let frame = message.encode()?;
        entry
            .tx
            .send(frame)
            .map_err(|_| NetworkError::Unreachable(entry.to).into())
    }

    fn disconnect(&self, conn: ConnectionId) {
        if self.connections.remove(&conn).is_some() {
            debug!(conn, "Disconnected");
        }
    }

    fn endpoint(&self, block: BlockId) -> Result<Arc<ChainLink>> {
        self.endpoints
            .get(&block)
            .and_then(|link| link.upgrade())
            .ok_or_else(|| NetworkError::Unreachable(block).into())
    }

    fn next_client_id(&self) -> i64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_frame_codec() {
        let msg = ChainMessage::Request {
            seq: SequenceId::new(3, 9),
            args: vec!["put".into(), "k".into(), "v".into()],
        };
        let frame = msg.encode().unwrap();
        assert_eq!(ChainMessage::decode(&frame).unwrap(), msg);
        assert!(matches!(
            ChainMessage::decode(&[0xff, 0xff]),
            Err(Error::Network(NetworkError::Codec(_)))
        ));
    }

    #[test]
    fn test_unknown_endpoint() {
        let transport = LocalTransport::new();
        assert!(matches!(
            transport.endpoint(42),
            Err(Error::Network(NetworkError::Unreachable(42)))
        ));
        assert!(matches!(
            transport.send(7, &ChainMessage::Ack { seq: SequenceId::new(1, 1) }),
            Err(Error::Network(NetworkError::ConnectionClosed))
        ));
        transport.disconnect(7);
    }

    #[test]
    fn test_client_ids_are_unique() {
        let transport = LocalTransport::new();
        let a = transport.next_client_id();
        let b = transport.next_client_id();
        assert_ne!(a, b);
    }
}
