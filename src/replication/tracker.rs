//! Quorum Replication Tracker
//!
//! Computes the highest log position durably written by a quorum of the
//! cluster and advances the replication checkpoint to it. All inputs are
//! processed sequentially by one task; `TrackerHandle` is the way in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{Notification, Publisher};
use crate::checkpoint::{Checkpoint, SharedCheckpoint};
use crate::error::Result;

/// Inputs of the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMessage {
    /// Node role changed
    StateChange { is_leader: bool },
    /// The writer checkpoint was flushed
    WriterCheckpointFlushed,
    /// A follower durably wrote up to `position`
    ReplicaWriteAck { replica_id: Uuid, position: i64 },
    /// A follower is gone; forget its vote
    ReplicaConnectionLost { replica_id: Uuid },
}

/// Tracker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Unknown,
    Leader,
}

pub struct QuorumTracker {
    cluster_size: usize,
    quorum_size: usize,
    state: TrackerState,
    /// Latest acknowledged position per follower
    votes: HashMap<Uuid, i64>,
    writer_checkpoint: SharedCheckpoint,
    replication_checkpoint: SharedCheckpoint,
    publisher: Publisher,
}

impl QuorumTracker {
    pub fn new(
        cluster_size: usize,
        writer_checkpoint: SharedCheckpoint,
        replication_checkpoint: SharedCheckpoint,
        publisher: Publisher,
    ) -> Self {
        let cluster_size = cluster_size.max(1);
        Self {
            cluster_size,
            quorum_size: cluster_size / 2 + 1,
            state: TrackerState::Unknown,
            votes: HashMap::new(),
            writer_checkpoint,
            replication_checkpoint,
            publisher,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn vote(&self, replica_id: &Uuid) -> Option<i64> {
        self.votes.get(replica_id).copied()
    }

    /// Process one input
    pub fn handle(&mut self, message: TrackerMessage) -> Result<()> {
        match message {
            TrackerMessage::StateChange { is_leader: true } => {
                if self.state != TrackerState::Leader {
                    tracing::info!(
                        "Quorum tracker active (cluster {}, quorum {})",
                        self.cluster_size,
                        self.quorum_size
                    );
                }
                self.state = TrackerState::Leader;
                self.votes.clear();
                self.recompute()?;
            }
            TrackerMessage::StateChange { is_leader: false } => {
                self.state = TrackerState::Unknown;
                self.votes.clear();
            }
            TrackerMessage::WriterCheckpointFlushed => {
                self.recompute()?;
            }
            TrackerMessage::ReplicaWriteAck {
                replica_id,
                position,
            } => {
                if self.state == TrackerState::Leader {
                    self.votes.insert(replica_id, position);
                    self.recompute()?;
                }
            }
            TrackerMessage::ReplicaConnectionLost { replica_id } => {
                if self.votes.remove(&replica_id).is_some() {
                    tracing::debug!("Dropped vote of replica {}", replica_id);
                }
                self.recompute()?;
            }
        }

        Ok(())
    }

    /// Recompute the quorum position; returns it when it advanced
    fn recompute(&mut self) -> Result<Option<i64>> {
        if self.state != TrackerState::Leader {
            return Ok(None);
        }

        let writer = self.writer_checkpoint.read();
        let mut votes: Vec<i64> = std::iter::once(writer)
            .chain(self.votes.values().map(|v| (*v).min(writer)))
            .collect();

        if votes.len() < self.quorum_size {
            return Ok(None);
        }

        votes.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = votes[self.quorum_size - 1];

        if candidate <= self.replication_checkpoint.read() {
            return Ok(None);
        }

        self.replication_checkpoint.write(candidate);
        self.replication_checkpoint.flush()?;
        self.publisher.publish(Notification::ReplicatedTo(candidate));

        tracing::trace!("Replicated to {}", candidate);

        Ok(Some(candidate))
    }

    /// Run the tracker on its own task
    pub fn spawn(self) -> (TrackerHandle, JoinHandle<Result<()>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (processed_tx, processed_rx) = watch::channel(0u64);

        let handle = TrackerHandle {
            sender,
            enqueued: Arc::new(AtomicU64::new(0)),
            processed: processed_rx,
        };

        let task = tokio::spawn(self.run(receiver, processed_tx));
        (handle, task)
    }

    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<TrackerMessage>,
        processed: watch::Sender<u64>,
    ) -> Result<()> {
        while let Some(message) = receiver.recv().await {
            let result = self.handle(message);
            processed.send_modify(|count| *count += 1);

            if let Err(e) = result {
                tracing::error!("Quorum tracker failed: {}", e);
                return Err(e);
            }
        }

        tracing::debug!("Quorum tracker stopped");
        Ok(())
    }
}

/// Cloneable handle feeding the tracker task
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::UnboundedSender<TrackerMessage>,
    enqueued: Arc<AtomicU64>,
    processed: watch::Receiver<u64>,
}

impl TrackerHandle {
    /// Queue an input for the tracker
    pub fn publish(&self, message: TrackerMessage) {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(message).is_err() {
            self.enqueued.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Quorum tracker is not running, input dropped");
        }
    }

    /// Whether every queued input has been processed
    pub fn is_current(&self) -> bool {
        *self.processed.borrow() >= self.enqueued.load(Ordering::SeqCst)
    }

    /// Wait until everything queued so far has been processed
    pub async fn wait_until_current(&self) {
        let target = self.enqueued.load(Ordering::SeqCst);
        let mut processed = self.processed.clone();
        let _ = processed.wait_for(|count| *count >= target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpoint;

    struct Fixture {
        writer: SharedCheckpoint,
        replication: SharedCheckpoint,
        notifications: mpsc::UnboundedReceiver<Notification>,
        tracker: QuorumTracker,
    }

    fn fixture(cluster_size: usize) -> Fixture {
        let writer = InMemoryCheckpoint::shared("writer", 0);
        let replication = InMemoryCheckpoint::shared("replication", -1);
        let (publisher, notifications) = Publisher::channel();
        let tracker = QuorumTracker::new(
            cluster_size,
            Arc::clone(&writer),
            Arc::clone(&replication),
            publisher,
        );
        Fixture {
            writer,
            replication,
            notifications,
            tracker,
        }
    }

    fn flush_writer(checkpoint: &SharedCheckpoint, position: i64) {
        checkpoint.write(position);
        checkpoint.flush().unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<i64> {
        let mut positions = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            if let Notification::ReplicatedTo(position) = notification {
                positions.push(position);
            }
        }
        positions
    }

    fn ack(replica_id: Uuid, position: i64) -> TrackerMessage {
        TrackerMessage::ReplicaWriteAck {
            replica_id,
            position,
        }
    }

    #[test]
    fn test_single_node_replicates_on_flush() {
        let mut f = fixture(1);
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();

        flush_writer(&f.writer, 500);
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();

        assert_eq!(f.replication.read(), 500);
        assert_eq!(drain(&mut f.notifications), vec![500]);
    }

    #[test]
    fn test_five_node_majority() {
        let mut f = fixture(5);
        let replicas: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();

        flush_writer(&f.writer, 2000);
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();
        // Leader alone is not a quorum of five
        assert_eq!(f.replication.read(), -1);

        for replica in &replicas {
            f.tracker.handle(ack(*replica, 2000)).unwrap();
        }
        assert_eq!(f.replication.read(), 2000);
        assert_eq!(drain(&mut f.notifications), vec![2000]);

        flush_writer(&f.writer, 4000);
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();
        f.tracker.handle(ack(replicas[0], 4000)).unwrap();
        assert_eq!(f.replication.read(), 2000);

        f.tracker.handle(ack(replicas[1], 4000)).unwrap();
        assert_eq!(f.replication.read(), 4000);
        assert_eq!(drain(&mut f.notifications), vec![4000]);
    }

    #[test]
    fn test_votes_are_capped_by_leader_position() {
        let mut f = fixture(3);
        let replica = Uuid::new_v4();
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();

        flush_writer(&f.writer, 4000);
        f.tracker.handle(ack(replica, 5000)).unwrap();
        assert_eq!(f.replication.read(), 4000);
        assert_eq!(f.replication.read_non_flushed(), 4000);
        assert_eq!(drain(&mut f.notifications), vec![4000]);

        let lagging = Uuid::new_v4();
        let mut f = fixture(3);
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();
        flush_writer(&f.writer, 4000);
        f.tracker.handle(ack(lagging, 3000)).unwrap();
        assert_eq!(f.replication.read(), 3000);
        assert_eq!(drain(&mut f.notifications), vec![3000]);
    }

    #[test]
    fn test_ignores_input_unless_leader() {
        let mut f = fixture(3);
        flush_writer(&f.writer, 1000);

        f.tracker.handle(ack(Uuid::new_v4(), 1000)).unwrap();
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();

        assert_eq!(f.tracker.state(), TrackerState::Unknown);
        assert_eq!(f.replication.read(), -1);
        assert!(drain(&mut f.notifications).is_empty());
    }

    #[test]
    fn test_becoming_leader_clears_votes() {
        let mut f = fixture(3);
        let replica = Uuid::new_v4();
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();
        flush_writer(&f.writer, 100);
        f.tracker.handle(ack(replica, 100)).unwrap();
        assert_eq!(f.tracker.vote(&replica), Some(100));

        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: false })
            .unwrap();
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();
        assert_eq!(f.tracker.vote(&replica), None);
    }

    #[test]
    fn test_connection_loss_removes_vote() {
        let mut f = fixture(3);
        let replica = Uuid::new_v4();
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();
        flush_writer(&f.writer, 100);
        f.tracker.handle(ack(replica, 100)).unwrap();
        assert_eq!(f.replication.read(), 100);

        f.tracker
            .handle(TrackerMessage::ReplicaConnectionLost { replica_id: replica })
            .unwrap();
        flush_writer(&f.writer, 200);
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();

        // No quorum without the replica
        assert_eq!(f.replication.read(), 100);
        assert_eq!(drain(&mut f.notifications), vec![100]);
    }

    #[test]
    fn test_checkpoint_never_moves_backwards() {
        let mut f = fixture(3);
        let replica = Uuid::new_v4();
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();
        flush_writer(&f.writer, 800);
        f.tracker.handle(ack(replica, 800)).unwrap();
        f.tracker.handle(ack(replica, 300)).unwrap();
        f.tracker.handle(ack(replica, 800)).unwrap();

        assert_eq!(f.replication.read(), 800);
        assert_eq!(drain(&mut f.notifications), vec![800]);
    }

    #[test]
    fn test_repeated_flush_at_same_position_is_idempotent() {
        let mut f = fixture(1);
        f.tracker
            .handle(TrackerMessage::StateChange { is_leader: true })
            .unwrap();

        flush_writer(&f.writer, 500);
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();
        f.tracker.handle(TrackerMessage::WriterCheckpointFlushed).unwrap();

        assert_eq!(f.replication.read(), 500);
        assert_eq!(drain(&mut f.notifications), vec![500]);
    }

    #[test]
    fn test_interleaved_inputs_keep_checkpoint_monotonic() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        for seed in 0..20u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut f = fixture(5);
            let replicas: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
            f.tracker
                .handle(TrackerMessage::StateChange { is_leader: true })
                .unwrap();

            let mut writer_position = 0;
            let mut last_published = -1;
            for _ in 0..200 {
                let replica = replicas[rng.gen_range(0..replicas.len())];
                let message = match rng.gen_range(0..3) {
                    0 => {
                        writer_position += rng.gen_range(0..500);
                        flush_writer(&f.writer, writer_position);
                        TrackerMessage::WriterCheckpointFlushed
                    }
                    1 => ack(replica, rng.gen_range(0..writer_position + 500)),
                    _ => TrackerMessage::ReplicaConnectionLost { replica_id: replica },
                };
                f.tracker.handle(message).unwrap();

                let replicated = f.replication.read();
                assert!(replicated <= f.writer.read(), "seed {}", seed);
                assert_eq!(replicated, f.replication.read_non_flushed());
                for published in drain(&mut f.notifications) {
                    assert!(published > last_published, "seed {}", seed);
                    assert_eq!(published, replicated);
                    last_published = published;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_spawned_tracker_reports_when_current() {
        let f = fixture(1);
        let writer = Arc::clone(&f.writer);
        let replication = Arc::clone(&f.replication);
        let (handle, task) = f.tracker.spawn();

        handle.publish(TrackerMessage::StateChange { is_leader: true });
        flush_writer(&writer, 42);
        handle.publish(TrackerMessage::WriterCheckpointFlushed);

        handle.wait_until_current().await;
        assert!(handle.is_current());
        assert_eq!(replication.read(), 42);

        drop(handle);
        task.await.unwrap().unwrap();
    }
}
