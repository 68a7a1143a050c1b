//! Notifications published by a tail after it applies a mutator.

use dashmap::DashMap;
use tokio::sync::mpsc;

/// One applied mutator: the command and its first argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub op: String,
    pub key: String,
}

/// Subscribers per command name.
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<Notification>>>,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a notification whenever one of `ops` is applied.
    pub fn subscribe(&self, ops: &[&str]) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        for op in ops {
            self.subscribers
                .entry(op.to_string())
                .or_default()
                .push(tx.clone());
        }
        rx
    }

    /// Publish `(op, key)`. Returns the number of subscribers reached.
    pub fn notify(&self, op: &str, key: &str) -> usize {
        let Some(mut subs) = self.subscribers.get_mut(op) else {
            return 0;
        };
        let notification = Notification {
            op: op.to_string(),
            key: key.to_string(),
        };
        subs.retain(|tx| tx.send(notification.clone()).is_ok());
        subs.len()
    }

    pub fn subscriber_count(&self, op: &str) -> usize {
        self.subscribers.get(op).map_or(0, |subs| subs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_subscribers() {
        let map = SubscriptionMap::new();
        let mut puts = map.subscribe(&["put", "upsert"]);
        let mut removes = map.subscribe(&["remove"]);

        assert_eq!(map.notify("put", "a"), 1);
        assert_eq!(map.notify("remove", "b"), 1);
        assert_eq!(map.notify("get", "c"), 0);

        assert_eq!(puts.recv().await.unwrap().key, "a");
        let n = removes.recv().await.unwrap();
        assert_eq!((n.op.as_str(), n.key.as_str()), ("remove", "b"));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let map = SubscriptionMap::new();
        drop(map.subscribe(&["put"]));
        assert_eq!(map.subscriber_count("put"), 1);
        assert_eq!(map.notify("put", "k"), 0);
        assert_eq!(map.subscriber_count("put"), 0);
    }
}
