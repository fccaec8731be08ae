//! Replica Replication Session
//!
//! Subscribes to the leader, applies the log bulks it streams, caches the
//! epochs they carry and acknowledges what was made durable. When the
//! leader starts the replica below its own flushed position the local log
//! has diverged: the session fences the epoch manager, records the
//! truncation and asks for a restart.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::leader::ReplicaRole;
use super::protocol::Message;
use crate::checkpoint::Checkpoint;
use crate::epoch::{EpochManager, SharedEpochManager};
use crate::error::{Error, Result};
use crate::log::{
    ChunkDb, ChunkHeader, LogReader, LogRecord, LogWriter, SharedWriter, CHUNK_HEADER_SIZE,
};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Subscribing { subscription_id: Uuid },
    Streaming { subscription_id: Uuid, role: ReplicaRole },
}

/// What the caller should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaAction {
    Continue,
    /// Send a fresh subscription on the same connection
    Resubscribe,
    /// The log is marked for truncation; restart the process
    RestartRequired { truncate_position: i64 },
}

/// A chunk file being received raw
struct RawTransfer {
    path: PathBuf,
    file: File,
    header: ChunkHeader,
    file_size: i64,
    written: i64,
}

/// Replica side of a replication session
pub struct ReplicaSession {
    db: Arc<ChunkDb>,
    writer: SharedWriter,
    epochs: SharedEpochManager,
    replica_id: Uuid,
    /// Best guess of the leader instance id, nil when unknown
    leader_id: Uuid,
    is_promotable: bool,
    epoch_count: usize,
    state: SessionState,
    link: Option<mpsc::UnboundedSender<Message>>,
    raw: Option<RawTransfer>,
    /// Scans newly written data for epoch records
    scanner: LogReader,
}

impl ReplicaSession {
    pub fn new(
        db: Arc<ChunkDb>,
        writer: SharedWriter,
        epochs: SharedEpochManager,
        replica_id: Uuid,
        leader_id: Option<Uuid>,
        is_promotable: bool,
        epoch_count: usize,
    ) -> Self {
        let scanner = LogReader::new(Arc::clone(&db));
        Self {
            db,
            writer,
            epochs,
            replica_id,
            leader_id: leader_id.unwrap_or_else(Uuid::nil),
            is_promotable,
            epoch_count,
            state: SessionState::Idle,
            link: None,
            raw: None,
            scanner,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn leader_id(&self) -> Uuid {
        self.leader_id
    }

    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    fn writer(&self) -> Result<MutexGuard<'_, LogWriter>> {
        self.writer
            .lock()
            .map_err(|_| Error::Internal("log writer lock poisoned".into()))
    }

    fn epochs(&self) -> Result<MutexGuard<'_, EpochManager>> {
        self.epochs
            .lock()
            .map_err(|_| Error::Internal("epoch manager lock poisoned".into()))
    }

    fn send(&self, message: Message) {
        if let Some(link) = &self.link {
            if link.send(message).is_err() {
                tracing::debug!("Leader link closed, message dropped");
            }
        }
    }

    /// Start a new subscription over `link`
    pub fn subscribe(&mut self, link: mpsc::UnboundedSender<Message>) -> Result<Uuid> {
        self.discard_raw_transfer();

        let (log_position, chunk_id) = {
            let mut writer = self.writer()?;
            writer.rollback_to_flushed()?;
            (writer.position(), writer.head_chunk_id())
        };
        let last_epochs = self
            .epochs()?
            .get_last_epochs(self.epoch_count)
            .iter()
            .map(|epoch| epoch.as_epoch())
            .collect::<Vec<_>>();

        self.scanner.reposition(log_position);

        let subscription_id = Uuid::new_v4();
        self.state = SessionState::Subscribing { subscription_id };
        self.link = Some(link);

        tracing::info!(
            "Subscribing to leader {} at {} with {} epochs (S:{})",
            self.leader_id,
            log_position,
            last_epochs.len(),
            subscription_id
        );

        self.send(Message::SubscribeReplica {
            log_position,
            chunk_id,
            last_epochs,
            leader_id: self.leader_id,
            replica_id: self.replica_id,
            subscription_id,
            is_promotable: self.is_promotable,
        });

        Ok(subscription_id)
    }

    /// Handle one message from the leader
    pub fn handle(&mut self, message: Message) -> Result<ReplicaAction> {
        let active = match self.state {
            SessionState::Subscribing { subscription_id }
            | SessionState::Streaming {
                subscription_id, ..
            } => subscription_id,
            SessionState::Idle => {
                tracing::debug!("Ignoring {} while idle", message.type_name());
                return Ok(ReplicaAction::Continue);
            }
        };

        if message.subscription_id() != active {
            tracing::debug!(
                "Discarding {} of stale subscription {}",
                message.type_name(),
                message.subscription_id()
            );
            return Ok(ReplicaAction::Continue);
        }

        match message {
            Message::ReplicaSubscriptionRetry { leader_id, .. } => {
                tracing::info!("Leader asked to retry against {}", leader_id);
                self.leader_id = leader_id;
                self.state = SessionState::Idle;
                Ok(ReplicaAction::Resubscribe)
            }
            Message::ReplicaSubscribed {
                leader_id,
                subscription_position,
                ..
            } => self.handle_subscribed(active, leader_id, subscription_position),
            Message::CloneAssignment { .. } => {
                self.assign(active, ReplicaRole::Clone);
                Ok(ReplicaAction::Continue)
            }
            Message::FollowerAssignment { .. } => {
                self.assign(active, ReplicaRole::Follower);
                Ok(ReplicaAction::Continue)
            }
            Message::DropSubscription { .. } => {
                tracing::info!("Leader dropped subscription {}", active);
                self.state = SessionState::Idle;
                self.discard_raw_transfer();
                Ok(ReplicaAction::Resubscribe)
            }
            Message::CreateChunk {
                chunk_header,
                file_size,
                is_completed_chunk,
                ..
            } => {
                self.ensure_streaming("CreateChunk")?;
                self.create_chunk(&chunk_header, file_size, is_completed_chunk)?;
                Ok(ReplicaAction::Continue)
            }
            Message::RawChunkBulk {
                raw_position,
                raw_bytes,
                complete_chunk,
                ..
            } => {
                self.ensure_streaming("RawChunkBulk")?;
                self.apply_raw(raw_position, &raw_bytes, complete_chunk)?;
                Ok(ReplicaAction::Continue)
            }
            Message::DataChunkBulk {
                chunk_start_number,
                chunk_end_number,
                subscription_position,
                data_bytes,
                complete_chunk,
                ..
            } => {
                self.ensure_streaming("DataChunkBulk")?;
                let chunk_number = self.db.chunk_number(subscription_position);
                if chunk_number < chunk_start_number || chunk_number > chunk_end_number {
                    return Err(Error::Replication(format!(
                        "Data for {} sent as chunk #{}-{}",
                        subscription_position, chunk_start_number, chunk_end_number
                    )));
                }
                self.apply_data(subscription_position, &data_bytes, complete_chunk)?;
                Ok(ReplicaAction::Continue)
            }
            Message::ReplicatedTo { log_position, .. } => {
                self.replicated_to(log_position)?;
                Ok(ReplicaAction::Continue)
            }
            Message::BadRequest { reason, .. } => {
                self.state = SessionState::Idle;
                Err(Error::Replication(format!(
                    "Leader rejected subscription: {}",
                    reason
                )))
            }
            other => {
                tracing::debug!("Ignoring {} from leader", other.type_name());
                Ok(ReplicaAction::Continue)
            }
        }
    }

    fn handle_subscribed(
        &mut self,
        subscription_id: Uuid,
        leader_id: Uuid,
        position: i64,
    ) -> Result<ReplicaAction> {
        self.leader_id = leader_id;
        let flushed = self.writer()?.flushed_position();

        if position > flushed {
            return Err(Error::Replication(format!(
                "Leader subscribed us at {} beyond our log end {}",
                position, flushed
            )));
        }

        if position < flushed {
            let kept = self.epochs()?.try_truncate_before(position)?;
            let truncate = &self.db.checkpoints().truncate;
            truncate.write(position);
            truncate.flush()?;

            tracing::warn!(
                "Log diverged from leader {}: truncating {} -> {} (keeping {}), restart required",
                leader_id,
                flushed,
                position,
                kept.map(|e| e.to_string()).unwrap_or_else(|| "no epoch".into())
            );

            self.state = SessionState::Idle;
            return Ok(ReplicaAction::RestartRequired {
                truncate_position: position,
            });
        }

        tracing::info!("Subscribed to leader {} at {}", leader_id, position);
        self.state = SessionState::Streaming {
            subscription_id,
            role: ReplicaRole::Clone,
        };
        Ok(ReplicaAction::Continue)
    }

    fn assign(&mut self, subscription_id: Uuid, role: ReplicaRole) {
        tracing::info!("Assigned {:?} role (S:{})", role, subscription_id);
        self.state = SessionState::Streaming {
            subscription_id,
            role,
        };
    }

    fn ensure_streaming(&self, what: &str) -> Result<()> {
        match self.state {
            SessionState::Streaming { .. } => Ok(()),
            _ => Err(Error::Replication(format!(
                "{} received before subscription was confirmed",
                what
            ))),
        }
    }

    fn apply_data(&mut self, position: i64, bytes: &[u8], complete_chunk: bool) -> Result<()> {
        {
            let mut writer = self.writer()?;
            writer.append_data_bytes(position, bytes)?;
            if complete_chunk {
                writer.complete_chunk()?;
            }
            writer.flush()?;
        }

        self.cache_new_epochs()?;
        self.ack()
    }

    fn create_chunk(&mut self, header_bytes: &[u8], file_size: i64, is_completed: bool) -> Result<()> {
        if !is_completed {
            return Err(Error::Replication("Raw transfer of an open chunk".into()));
        }

        let header = ChunkHeader::from_bytes(header_bytes)?;
        let position = self.writer()?.position();
        if header.chunk_start_position() != position {
            return Err(Error::Replication(format!(
                "Raw chunk starts at {} but log ends at {}",
                header.chunk_start_position(),
                position
            )));
        }

        self.discard_raw_transfer();

        let path = self.db.paths().temp_chunk_path(header.chunk_start_number);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&header.to_bytes())?;

        tracing::info!(
            "Receiving raw chunk #{}-{} ({} bytes)",
            header.chunk_start_number,
            header.chunk_end_number,
            file_size
        );

        self.raw = Some(RawTransfer {
            path,
            file,
            header,
            file_size,
            written: CHUNK_HEADER_SIZE as i64,
        });
        Ok(())
    }

    fn apply_raw(&mut self, raw_position: i64, bytes: &[u8], complete_chunk: bool) -> Result<()> {
        let transfer = self
            .raw
            .as_mut()
            .ok_or_else(|| Error::Replication("Raw bulk without CreateChunk".into()))?;

        if raw_position != transfer.written {
            return Err(Error::Replication(format!(
                "Raw bulk at {} but {} bytes received",
                raw_position, transfer.written
            )));
        }

        transfer.file.write_all(bytes)?;
        transfer.written += bytes.len() as i64;

        if !complete_chunk {
            return Ok(());
        }

        let transfer = self
            .raw
            .take()
            .ok_or_else(|| Error::Internal("raw transfer vanished".into()))?;
        if transfer.written != transfer.file_size {
            let _ = std::fs::remove_file(&transfer.path);
            return Err(Error::Replication(format!(
                "Raw chunk #{} is {} bytes, expected {}",
                transfer.header.chunk_start_number, transfer.written, transfer.file_size
            )));
        }
        if self.db.fsync() {
            transfer.file.sync_all()?;
        }
        drop(transfer.file);

        {
            let mut writer = self.writer()?;
            writer.install_completed_chunk(&transfer.path)?;
            writer.flush()?;
        }

        self.cache_new_epochs()?;
        self.ack()
    }

    /// Cache epoch records that arrived since the last scan
    fn cache_new_epochs(&mut self) -> Result<()> {
        let mut found = Vec::new();
        while let Some((_, record)) = self.scanner.read_next()? {
            if let LogRecord::Epoch(epoch) = record {
                found.push(epoch);
            }
        }

        if found.is_empty() {
            return Ok(());
        }

        let mut epochs = self.epochs()?;
        for epoch in found {
            tracing::info!("Replicated epoch {}", epoch);
            epochs.cache_epoch(epoch)?;
        }
        Ok(())
    }

    fn ack(&self) -> Result<()> {
        let subscription_id = match self.state {
            SessionState::Streaming {
                subscription_id, ..
            } => subscription_id,
            _ => return Ok(()),
        };

        let (flushed, position) = {
            let writer = self.writer()?;
            (writer.flushed_position(), writer.position())
        };

        self.send(Message::AckLogPosition {
            subscription_id,
            replication_log_position: flushed,
            writer_log_position: position,
        });
        Ok(())
    }

    fn replicated_to(&self, position: i64) -> Result<()> {
        let flushed = self.writer()?.flushed_position();
        let checkpoint = &self.db.checkpoints().replication;
        let target = position.min(flushed);

        if target > checkpoint.read() {
            checkpoint.write(target);
            checkpoint.flush()?;
            tracing::trace!("Replication checkpoint at {}", target);
        }
        Ok(())
    }

    fn discard_raw_transfer(&mut self) {
        if let Some(transfer) = self.raw.take() {
            drop(transfer.file);
            if let Err(e) = std::fs::remove_file(&transfer.path) {
                tracing::debug!("Could not remove {}: {}", transfer.path.display(), e);
            }
        }
    }

    /// The connection to the leader is gone
    pub fn connection_lost(&mut self) -> Result<()> {
        tracing::info!("Lost connection to leader {}", self.leader_id);
        self.state = SessionState::Idle;
        self.link = None;
        self.discard_raw_transfer();

        let flushed = {
            let mut writer = self.writer()?;
            writer.rollback_to_flushed()?;
            writer.position()
        };
        self.scanner.reposition(flushed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Publisher;
    use crate::config::ReplicationSettings;
    use crate::epoch::Epoch;
    use crate::log::test_support::*;
    use crate::log::ChunkBulkReader;
    use crate::replication::leader::{LeaderInput, LeaderService, ReplicaLink};
    use crate::replication::tracker::{QuorumTracker, TrackerHandle, TrackerMessage};
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Node {
        _dir: TempDir,
        db: Arc<ChunkDb>,
        writer: SharedWriter,
        epochs: SharedEpochManager,
        instance_id: Uuid,
    }

    fn node() -> Node {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let writer = LogWriter::open_shared(Arc::clone(&db)).unwrap();
        let instance_id = Uuid::new_v4();
        let mut manager = EpochManager::new(
            Arc::clone(&db),
            Arc::clone(&writer),
            10,
            instance_id,
            Publisher::noop(),
        );
        manager.init().unwrap();
        Node {
            _dir: dir,
            db,
            writer,
            epochs: Arc::new(Mutex::new(manager)),
            instance_id,
        }
    }

    impl Node {
        fn events(&self, count: usize) -> i64 {
            let mut writer = self.writer.lock().unwrap();
            let mut end = 0;
            for _ in 0..count {
                end = append_event(&mut writer, "data").1;
            }
            end
        }

        fn new_epoch(&self) -> crate::epoch::EpochRecord {
            let mut epochs = self.epochs.lock().unwrap();
            let next = epochs.last_epoch_number() + 1;
            epochs.write_new_epoch(next).unwrap()
        }

        fn flushed(&self) -> i64 {
            self.db.checkpoints().writer.read()
        }

        fn session(&self, leader_id: Option<Uuid>) -> ReplicaSession {
            ReplicaSession::new(
                Arc::clone(&self.db),
                Arc::clone(&self.writer),
                Arc::clone(&self.epochs),
                self.instance_id,
                leader_id,
                true,
                10,
            )
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Subscribe and have `leader_id` confirm at the replica's position
    fn streaming(
        session: &mut ReplicaSession,
        leader_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription_id = session.subscribe(tx).unwrap();
        let position = match drain(&mut rx).pop() {
            Some(Message::SubscribeReplica { log_position, .. }) => log_position,
            other => panic!("unexpected {:?}", other),
        };
        let action = session
            .handle(Message::ReplicaSubscribed {
                leader_id,
                subscription_id,
                subscription_position: position,
            })
            .unwrap();
        assert_eq!(action, ReplicaAction::Continue);
        (subscription_id, rx)
    }

    #[test]
    fn test_subscribe_reports_flushed_position_and_epochs() {
        let replica = node();
        let epoch = replica.new_epoch();
        let end = replica.events(2);
        let mut session = replica.session(None);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscription_id = session.subscribe(tx).unwrap();

        match drain(&mut rx).as_slice() {
            [Message::SubscribeReplica {
                log_position,
                chunk_id,
                last_epochs,
                leader_id,
                replica_id,
                subscription_id: sent,
                is_promotable,
            }] => {
                assert_eq!(*log_position, end);
                assert!(chunk_id.is_some());
                assert_eq!(last_epochs, &vec![Epoch::from(&epoch)]);
                assert_eq!(*leader_id, Uuid::nil());
                assert_eq!(*replica_id, replica.instance_id);
                assert_eq!(*sent, subscription_id);
                assert!(*is_promotable);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            session.state(),
            SessionState::Subscribing { subscription_id }
        );
    }

    #[test]
    fn test_retry_learns_leader_id() {
        let replica = node();
        let mut session = replica.session(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription_id = session.subscribe(tx.clone()).unwrap();
        drain(&mut rx);

        let leader_id = Uuid::new_v4();
        let action = session
            .handle(Message::ReplicaSubscriptionRetry {
                leader_id,
                subscription_id,
            })
            .unwrap();
        assert_eq!(action, ReplicaAction::Resubscribe);
        assert_eq!(session.leader_id(), leader_id);

        session.subscribe(tx).unwrap();
        match drain(&mut rx).as_slice() {
            [Message::SubscribeReplica { leader_id: sent, .. }] => assert_eq!(*sent, leader_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stale_messages_are_discarded() {
        let replica = node();
        let mut session = replica.session(None);
        let leader_id = Uuid::new_v4();
        let (subscription_id, _rx) = streaming(&mut session, leader_id);

        let action = session
            .handle(Message::DropSubscription {
                leader_id,
                subscription_id: Uuid::new_v4(),
            })
            .unwrap();
        assert_eq!(action, ReplicaAction::Continue);
        assert!(matches!(
            session.state(),
            SessionState::Streaming { subscription_id: id, .. } if id == subscription_id
        ));
    }

    #[test]
    fn test_data_bulks_are_applied_and_acked() {
        let leader = node();
        leader.new_epoch();
        let end = leader.events(3);

        let replica = node();
        let mut session = replica.session(Some(leader.instance_id));
        let (subscription_id, mut rx) = streaming(&mut session, leader.instance_id);
        session
            .handle(Message::FollowerAssignment {
                leader_id: leader.instance_id,
                subscription_id,
            })
            .unwrap();

        let mut reader = ChunkBulkReader::open_data(&leader.db, 0).unwrap();
        let bulk = reader.read_next_data_bytes(8192, end).unwrap();
        session
            .handle(Message::DataChunkBulk {
                leader_id: leader.instance_id,
                subscription_id,
                chunk_start_number: 0,
                chunk_end_number: 0,
                subscription_position: 0,
                data_bytes: bulk.bytes,
                complete_chunk: false,
            })
            .unwrap();

        assert_eq!(replica.flushed(), end);
        assert_eq!(replica.epochs.lock().unwrap().last_epoch_number(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![Message::AckLogPosition {
                subscription_id,
                replication_log_position: end,
                writer_log_position: end,
            }]
        );
    }

    #[test]
    fn test_data_at_wrong_position_is_rejected() {
        let replica = node();
        let mut session = replica.session(None);
        let (subscription_id, _rx) = streaming(&mut session, Uuid::new_v4());

        let result = session.handle(Message::DataChunkBulk {
            leader_id: session.leader_id(),
            subscription_id,
            chunk_start_number: 0,
            chunk_end_number: 0,
            subscription_position: 100,
            data_bytes: vec![0; 10],
            complete_chunk: false,
        });
        assert!(matches!(result, Err(Error::Replication(_))));
    }

    #[test]
    fn test_replicated_to_is_capped_by_local_log() {
        let replica = node();
        replica.new_epoch();
        let end = replica.events(1);
        let mut session = replica.session(None);
        let (subscription_id, _rx) = streaming(&mut session, Uuid::new_v4());

        session
            .handle(Message::ReplicatedTo {
                subscription_id,
                log_position: end + 500,
            })
            .unwrap();
        assert_eq!(replica.db.checkpoints().replication.read(), end);

        // Never backwards
        session
            .handle(Message::ReplicatedTo {
                subscription_id,
                log_position: 10,
            })
            .unwrap();
        assert_eq!(replica.db.checkpoints().replication.read(), end);
    }

    #[test]
    fn test_divergence_requests_truncation_and_restart() {
        let dir = tempdir().unwrap();
        let (truncate_at, e0) = {
            let db = open_db(dir.path());
            let writer = LogWriter::open_shared(Arc::clone(&db)).unwrap();
            let mut manager =
                EpochManager::new(Arc::clone(&db), Arc::clone(&writer), 10, Uuid::new_v4(), Publisher::noop());
            manager.init().unwrap();
            let e0 = manager.write_new_epoch(0).unwrap();
            let truncate_at = append_event(&mut writer.lock().unwrap(), "kept").1;
            manager.write_new_epoch(1).unwrap();
            append_event(&mut writer.lock().unwrap(), "lost");
            let epochs = Arc::new(Mutex::new(manager));

            let mut session = ReplicaSession::new(
                Arc::clone(&db),
                Arc::clone(&writer),
                Arc::clone(&epochs),
                Uuid::new_v4(),
                None,
                true,
                10,
            );
            let (tx, _rx) = mpsc::unbounded_channel();
            let subscription_id = session.subscribe(tx).unwrap();

            let action = session
                .handle(Message::ReplicaSubscribed {
                    leader_id: Uuid::new_v4(),
                    subscription_id,
                    subscription_position: truncate_at,
                })
                .unwrap();
            assert_eq!(
                action,
                ReplicaAction::RestartRequired {
                    truncate_position: truncate_at
                }
            );
            assert!(epochs.lock().unwrap().is_fenced());
            assert_eq!(db.checkpoints().truncate.read(), truncate_at);
            assert_eq!(session.state(), SessionState::Idle);
            (truncate_at, e0)
        };

        // Restart applies the truncation and finds the kept epoch
        let db = open_db(dir.path());
        assert_eq!(db.checkpoints().writer.read(), truncate_at);
        assert_eq!(db.checkpoints().truncate.read(), -1);

        let writer = LogWriter::open_shared(Arc::clone(&db)).unwrap();
        let mut manager = EpochManager::new(Arc::clone(&db), writer, 10, Uuid::new_v4(), Publisher::noop());
        manager.init().unwrap();
        assert_eq!(manager.last_epoch().unwrap().epoch_id, e0.epoch_id);
    }

    #[test]
    fn test_connection_lost_returns_to_idle() {
        let replica = node();
        let mut session = replica.session(None);
        let (_subscription_id, _rx) = streaming(&mut session, Uuid::new_v4());

        session.connection_lost().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    /// Shuttle messages between a leader service and a replica session
    /// until neither side has anything left to say
    fn exchange(
        leader: &mut LeaderService,
        link: &ReplicaLink,
        from_leader: &mut mpsc::UnboundedReceiver<Message>,
        session: &mut ReplicaSession,
        from_replica: &mut mpsc::UnboundedReceiver<Message>,
    ) {
        loop {
            let mut progressed = leader.pump();
            for message in drain(from_replica) {
                progressed = true;
                leader
                    .handle(LeaderInput::Message {
                        link: link.clone(),
                        message,
                    })
                    .unwrap();
            }
            for message in drain(from_leader) {
                progressed = true;
                let action = session.handle(message).unwrap();
                assert_eq!(action, ReplicaAction::Continue);
            }
            if !progressed {
                break;
            }
        }
    }

    fn spawn_tracker(node: &Node, cluster_size: usize) -> TrackerHandle {
        let checkpoints = node.db.checkpoints().clone();
        let (tracker, _task) = QuorumTracker::new(
            cluster_size,
            checkpoints.writer,
            checkpoints.replication,
            Publisher::noop(),
        )
        .spawn();
        tracker.publish(TrackerMessage::StateChange { is_leader: true });
        tracker
    }

    #[tokio::test]
    async fn test_replica_catches_up_across_chunks() {
        let leader = node();
        leader.new_epoch();
        leader.events(2);
        {
            let mut writer = leader.writer.lock().unwrap();
            writer.complete_chunk().unwrap();
            writer.flush().unwrap();
        }
        leader.events(2);
        let e1 = leader.new_epoch();
        leader.events(1);

        let tracker = spawn_tracker(&leader, 3);
        let mut service = LeaderService::new(
            Arc::clone(&leader.db),
            Arc::clone(&leader.epochs),
            tracker.clone(),
            Publisher::noop(),
            ReplicationSettings {
                bulk_size: 256,
                ..ReplicationSettings::default()
            },
            3,
            leader.instance_id,
        );

        let replica = node();
        let mut session = replica.session(None);

        let (leader_tx, mut from_leader) = mpsc::unbounded_channel();
        let link = ReplicaLink::new(1, leader_tx);
        let (replica_tx, mut from_replica) = mpsc::unbounded_channel();

        // Unknown leader id: retry, then subscribe for real
        session.subscribe(replica_tx.clone()).unwrap();
        for message in drain(&mut from_replica) {
            service
                .handle(LeaderInput::Message {
                    link: link.clone(),
                    message,
                })
                .unwrap();
        }
        for message in drain(&mut from_leader) {
            assert_eq!(session.handle(message).unwrap(), ReplicaAction::Resubscribe);
        }
        session.subscribe(replica_tx).unwrap();

        exchange(
            &mut service,
            &link,
            &mut from_leader,
            &mut session,
            &mut from_replica,
        );

        assert_eq!(replica.flushed(), leader.flushed());
        assert!(matches!(
            session.state(),
            SessionState::Streaming {
                role: ReplicaRole::Follower,
                ..
            }
        ));
        {
            let epochs = replica.epochs.lock().unwrap();
            assert_eq!(epochs.last_epoch().unwrap().epoch_id, e1.epoch_id);
        }

        // The completed chunk arrived as an identical file
        let leader_chunk = leader.db.find_chunk(0).unwrap().unwrap();
        let replica_chunk = replica.db.find_chunk(0).unwrap().unwrap();
        assert_eq!(
            std::fs::read(leader_chunk).unwrap(),
            std::fs::read(replica_chunk).unwrap()
        );

        tracker.wait_until_current().await;
        assert_eq!(leader.db.checkpoints().replication.read(), leader.flushed());
    }
}
