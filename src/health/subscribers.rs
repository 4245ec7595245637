//! Registry of streaming clients and the fan-out policy
//!
//! Each client owns a bounded mailbox. Fan-out never waits: a client whose
//! mailbox is full has its mailbox closed and is dropped from the
//! registry. It still drains what was buffered, then sees the channel
//! closed and must reconnect.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::metrics::metrics;

use super::snapshot::HealthSnapshot;

/// Identifies one registered client
pub type SubscriberId = u64;

/// Why a broadcast is happening, for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastReason {
    StateChange,
    SchemaChange,
    ThresholdChange,
}

impl BroadcastReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastReason::StateChange => "state_change",
            BroadcastReason::SchemaChange => "schema_change",
            BroadcastReason::ThresholdChange => "threshold_change",
        }
    }
}

#[derive(Debug)]
pub struct SubscriberRegistry {
    clients: HashMap<SubscriberId, mpsc::Sender<HealthSnapshot>>,
    next_id: SubscriberId,
    buffer_size: usize,
}

impl SubscriberRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_id: 1,
            // Room for at least the snapshot sent on registration
            buffer_size: buffer_size.max(1),
        }
    }

    /// Add a client whose mailbox starts with `current`
    pub fn add(&mut self, current: HealthSnapshot) -> (SubscriberId, mpsc::Receiver<HealthSnapshot>) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        // A fresh channel with capacity >= 1 always accepts the first item
        let _ = tx.try_send(current);

        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(id, tx);
        metrics().set_subscribers(self.clients.len());
        debug!(subscriber = id, subscribers = self.clients.len(), "Health stream client registered");
        (id, rx)
    }

    /// Remove a client. Returns false if it was already gone.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let removed = self.clients.remove(&id).is_some();
        if removed {
            metrics().set_subscribers(self.clients.len());
            debug!(subscriber = id, subscribers = self.clients.len(), "Health stream client unregistered");
        }
        removed
    }

    /// Offer `snapshot` to every client without waiting.
    ///
    /// Returns the number of clients evicted because their mailbox was full.
    pub fn broadcast(&mut self, snapshot: &HealthSnapshot, reason: BroadcastReason) -> usize {
        let mut evicted = 0;
        self.clients.retain(|id, tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                match reason {
                    BroadcastReason::ThresholdChange => {
                        debug!(subscriber = id, "Resetting health streamer client due to unhealthy threshold change")
                    }
                    _ => warn!(subscriber = id, "A streaming health buffer is full. Closing the channel"),
                }
                evicted += 1;
                // Dropping the only sender closes the mailbox
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "Health stream client went away, removing");
                false
            }
        });

        let m = metrics();
        m.record_broadcast(reason.as_str());
        if evicted > 0 {
            m.record_evictions(reason.as_str(), evicted);
        }
        m.set_subscribers(self.clients.len());
        evicted
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.clients.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::snapshot::TabletAlias;

    fn snapshot(lag: u32) -> HealthSnapshot {
        let mut s = HealthSnapshot::uninitialized(TabletAlias::new("zone1", 1));
        s.realtime_stats.replication_lag_seconds = lag;
        s
    }

    #[test]
    fn test_add_delivers_current_snapshot() {
        let mut registry = SubscriberRegistry::new(4);
        let (_, mut rx) = registry.add(snapshot(7));
        assert_eq!(rx.try_recv().unwrap().realtime_stats.replication_lag_seconds, 7);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_in_order() {
        let mut registry = SubscriberRegistry::new(4);
        let (_, mut rx) = registry.add(snapshot(0));
        registry.broadcast(&snapshot(1), BroadcastReason::StateChange);
        registry.broadcast(&snapshot(2), BroadcastReason::StateChange);

        let lags: Vec<u32> = (0..3)
            .map(|_| rx.try_recv().unwrap().realtime_stats.replication_lag_seconds)
            .collect();
        assert_eq!(lags, vec![0, 1, 2]);
    }

    #[test]
    fn test_full_mailbox_is_closed_and_removed() {
        let mut registry = SubscriberRegistry::new(2);
        let (id, mut rx) = registry.add(snapshot(0));

        assert_eq!(registry.broadcast(&snapshot(1), BroadcastReason::StateChange), 0);
        assert_eq!(registry.broadcast(&snapshot(2), BroadcastReason::StateChange), 1);
        assert!(!registry.contains(id));

        // Buffered items drain, then the channel reports closed
        assert_eq!(rx.try_recv().unwrap().realtime_stats.replication_lag_seconds, 0);
        assert_eq!(rx.try_recv().unwrap().realtime_stats.replication_lag_seconds, 1);
        assert_eq!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected));
    }

    #[test]
    fn test_slow_client_does_not_affect_others() {
        let mut registry = SubscriberRegistry::new(2);
        let (slow, _slow_rx) = registry.add(snapshot(0));
        let (fast, mut fast_rx) = registry.add(snapshot(0));

        for lag in 1..=3 {
            fast_rx.try_recv().unwrap();
            registry.broadcast(&snapshot(lag), BroadcastReason::StateChange);
        }

        assert!(!registry.contains(slow));
        assert!(registry.contains(fast));
        assert_eq!(fast_rx.try_recv().unwrap().realtime_stats.replication_lag_seconds, 3);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = SubscriberRegistry::new(2);
        let (id, _rx) = registry.add(snapshot(0));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dropped_receiver_pruned_on_broadcast() {
        let mut registry = SubscriberRegistry::new(2);
        let (id, rx) = registry.add(snapshot(0));
        drop(rx);
        assert_eq!(registry.broadcast(&snapshot(1), BroadcastReason::StateChange), 0);
        assert!(!registry.contains(id));
    }
}
