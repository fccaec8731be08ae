//! Notification Bus
//!
//! Fire-and-forget notifications published by the epoch manager, the
//! quorum tracker and the replication services. Subscribers consume them
//! from an unbounded channel in publication order.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::epoch::EpochRecord;

/// Something other components may want to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A new epoch was written, flushed and cached
    EpochWritten(EpochRecord),
    /// The quorum-confirmed position advanced
    ReplicatedTo(i64),
    /// A replica subscription was accepted by the leader
    ReplicaSubscribed {
        replica_id: Uuid,
        subscription_id: Uuid,
        position: i64,
    },
    /// The leader has had too few followers for too long
    NoQuorum,
}

/// Cloneable publishing handle
#[derive(Clone, Default)]
pub struct Publisher {
    sender: Option<mpsc::UnboundedSender<Notification>>,
}

impl Publisher {
    /// Create a publisher and the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Publisher that drops everything
    pub fn noop() -> Self {
        Self { sender: None }
    }

    pub fn publish(&self, notification: Notification) {
        if let Some(sender) = &self.sender {
            if sender.send(notification).is_err() {
                tracing::trace!("Notification dropped, no subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let (publisher, mut rx) = Publisher::channel();
        publisher.publish(Notification::ReplicatedTo(10));
        publisher.publish(Notification::ReplicatedTo(20));

        assert_eq!(rx.recv().await, Some(Notification::ReplicatedTo(10)));
        assert_eq!(rx.recv().await, Some(Notification::ReplicatedTo(20)));
    }

    #[test]
    fn test_noop_publisher_never_fails() {
        Publisher::noop().publish(Notification::NoQuorum);
    }
}
