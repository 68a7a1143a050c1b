//! Reply routing from a tail back to waiting clients.

use crate::types::{Response, SequenceId};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// A reply tagged with the client sequence number it answers.
pub type Reply = (i64, Response);

/// Clients registered at a link, keyed by client id.
#[derive(Debug, Default)]
pub struct ClientMap {
    clients: DashMap<i64, mpsc::UnboundedSender<Reply>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: i64, tx: mpsc::UnboundedSender<Reply>) {
        self.clients.insert(client_id, tx);
    }

    pub fn unregister(&self, client_id: i64) {
        self.clients.remove(&client_id);
    }

    /// Deliver `response` to the client that issued `seq`. Returns whether a
    /// live client received it.
    pub fn respond(&self, seq: SequenceId, response: Response) -> bool {
        let delivered = match self.clients.get(&seq.client_id) {
            Some(tx) => tx.send((seq.client_seq_no, response)).is_ok(),
            None => return false,
        };
        if !delivered {
            self.clients.remove(&seq.client_id);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_respond_routes_by_client_id() {
        let map = ClientMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        map.register(5, tx);

        assert!(map.respond(SequenceId::new(5, 2), vec!["!ok".into()]));
        assert!(!map.respond(SequenceId::new(6, 1), vec!["!ok".into()]));
        assert_eq!(rx.recv().await.unwrap(), (2, vec!["!ok".to_string()]));
    }

    #[test]
    fn test_closed_clients_are_pruned() {
        let map = ClientMap::new();
        let (tx, rx) = mpsc::unbounded_channel();
        map.register(1, tx);
        drop(rx);

        assert!(!map.respond(SequenceId::new(1, 1), vec![]));
        assert!(map.is_empty());
    }
}
