use std::collections::HashMap;

use media_proto::protocol::Outgoing;
use media_proto::record::AggregateView;
use tokio::sync::mpsc;
use tracing::debug;

/// Handle returned to a consumer when it subscribes to `MEDIA_UPDATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// UI consumers interested in state pushes, looked up by handle.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: u64,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Outgoing>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tx: mpsc::Sender<Outgoing>) -> SubscriberId {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        self.subscribers.insert(id, tx);
        id
    }

    pub fn remove(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Push `view` to every subscriber without waiting.  A full queue loses
    /// this one update; a closed queue unregisters its subscriber.  Returns
    /// how many subscribers accepted the update.
    pub fn broadcast(&mut self, view: &AggregateView) -> usize {
        let mut delivered = 0;
        self.subscribers.retain(|id, tx| {
            match tx.try_send(Outgoing::MediaUpdate { data: view.clone() }) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("subscriber {:?} lagging, update dropped", id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("subscriber {:?} gone", id);
                    false
                }
            }
        });
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_isolates_failures() {
        let mut registry = SubscriberRegistry::new();

        let (live_tx, mut live_rx) = mpsc::channel(4);
        let (full_tx, mut full_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        let live = registry.register(live_tx);
        let full = registry.register(full_tx.clone());
        registry.register(closed_tx);
        drop(closed_rx);

        full_tx.try_send(Outgoing::GetCurrentState).unwrap();

        let view = AggregateView::empty(70);
        assert_eq!(registry.broadcast(&view), 1);
        assert_eq!(registry.len(), 2);

        assert_eq!(
            live_rx.try_recv().unwrap(),
            Outgoing::MediaUpdate { data: view.clone() }
        );
        // the lagging subscriber keeps its place and sees the next update
        assert_eq!(full_rx.try_recv().unwrap(), Outgoing::GetCurrentState);
        assert_eq!(registry.broadcast(&view), 2);
        assert!(full_rx.try_recv().is_ok());

        assert!(registry.remove(live));
        assert!(!registry.remove(live));
        assert!(registry.remove(full));
        assert!(registry.is_empty());
    }
}
