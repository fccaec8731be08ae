//! Node Wiring
//!
//! Puts the pieces of one process together. A leader node opens its log,
//! takes office by writing a new epoch, then serves replica subscriptions
//! while the quorum tracker turns follower acknowledgements into the
//! replication checkpoint. A replica node connects to the leader and keeps
//! a replication session alive, reconnecting with jittered backoff.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{Notification, Publisher};
use crate::checkpoint::Checkpoint;
use crate::config::WolfLogConfig;
use crate::epoch::{EpochManager, SharedEpochManager};
use crate::error::{Error, Result};
use crate::log::{ChunkDb, LogRecord, LogWriter, PrepareRecord, SharedWriter};
use crate::network::{connect_to_leader, LeaderServer};
use crate::replication::{
    LeaderInput, LeaderService, Message, QuorumTracker, ReplicaAction, ReplicaSession,
    ReplicationNode, TrackerHandle, TrackerMessage,
};

/// Storage shared by both node kinds
struct NodeStorage {
    db: Arc<ChunkDb>,
    writer: SharedWriter,
    epochs: SharedEpochManager,
}

impl NodeStorage {
    fn open(config: &WolfLogConfig, instance_id: Uuid, publisher: Publisher) -> Result<Self> {
        let db = Arc::new(ChunkDb::from_config(config)?);
        let writer = LogWriter::open_shared(Arc::clone(&db))?;

        let mut epochs = EpochManager::new(
            Arc::clone(&db),
            Arc::clone(&writer),
            config.epoch.cache_size,
            instance_id,
            publisher,
        );
        epochs.init()?;

        Ok(Self {
            db,
            writer,
            epochs: Arc::new(Mutex::new(epochs)),
        })
    }
}

/// Log notifications nobody else consumes; forward `ReplicatedTo` to the
/// leader service when there is one
fn spawn_notification_logger(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    leader_inputs: Option<mpsc::UnboundedSender<LeaderInput>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::EpochWritten(epoch) => {
                    tracing::info!("Epoch written: {}", epoch);
                }
                Notification::ReplicatedTo(position) => {
                    tracing::debug!("Replicated to {}", position);
                    if let Some(inputs) = &leader_inputs {
                        if inputs.send(LeaderInput::ReplicatedTo(position)).is_err() {
                            break;
                        }
                    }
                }
                Notification::ReplicaSubscribed {
                    replica_id,
                    subscription_id,
                    position,
                } => {
                    tracing::info!(
                        "Replica {} subscribed (S:{}) from {}",
                        replica_id,
                        subscription_id,
                        position
                    );
                }
                Notification::NoQuorum => {
                    tracing::warn!("Leader has no quorum");
                }
            }
        }
    })
}

/// Feed every writer checkpoint flush into the tracker
fn spawn_flush_bridge(db: &ChunkDb, tracker: TrackerHandle) -> JoinHandle<()> {
    let mut flushed = db.checkpoints().writer.subscribe();
    tokio::spawn(async move {
        while flushed.changed().await.is_ok() {
            tracker.publish(TrackerMessage::WriterCheckpointFlushed);
        }
    })
}

/// A node that owns the head of the log
pub struct LeaderNode {
    config: WolfLogConfig,
    instance_id: Uuid,
    storage: NodeStorage,
    publisher: Publisher,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    server: Option<LeaderServer>,
}

impl LeaderNode {
    /// Open the log and take office by writing the next epoch
    pub fn open(config: WolfLogConfig) -> Result<Self> {
        let instance_id = config.instance_id();
        let (publisher, notifications) = Publisher::channel();
        let storage = NodeStorage::open(&config, instance_id, publisher.clone())?;

        {
            let mut epochs = storage
                .epochs
                .lock()
                .map_err(|_| Error::Internal("epoch manager lock poisoned".into()))?;
            let next = epochs.last_epoch_number() + 1;
            epochs.write_new_epoch(next)?;
        }

        tracing::info!(
            "Node {} is leader (instance {}, log at {})",
            config.node.id,
            instance_id,
            storage.db.checkpoints().writer.read()
        );

        Ok(Self {
            config,
            instance_id,
            storage,
            publisher,
            notifications: Some(notifications),
            server: None,
        })
    }

    pub fn db(&self) -> Arc<ChunkDb> {
        Arc::clone(&self.storage.db)
    }

    pub fn writer(&self) -> SharedWriter {
        Arc::clone(&self.storage.writer)
    }

    pub fn epochs(&self) -> SharedEpochManager {
        Arc::clone(&self.storage.epochs)
    }

    /// Bind the replication listener ahead of `run`
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.server.is_none() {
            self.server = Some(LeaderServer::bind(&self.config.node.bind_address).await?);
        }
        match &self.server {
            Some(server) => server.local_addr(),
            None => Err(Error::Internal("replication listener missing".into())),
        }
    }

    /// Append one JSON event and flush it; returns its position
    pub fn append_event(&self, stream: &str, event_type: &str, data: Vec<u8>) -> Result<i64> {
        let mut writer = self
            .storage
            .writer
            .lock()
            .map_err(|_| Error::Internal("log writer lock poisoned".into()))?;

        let (position, _) = writer.append(|position| {
            LogRecord::Prepare(PrepareRecord::json(
                position,
                stream,
                -2,
                event_type,
                data.clone(),
            ))
        })?;
        writer.flush()?;
        Ok(position)
    }
}

#[async_trait::async_trait]
impl ReplicationNode for LeaderNode {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn is_leader(&self) -> bool {
        true
    }

    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let db = Arc::clone(&self.storage.db);
        let checkpoints = db.checkpoints().clone();

        let (tracker, tracker_task) = QuorumTracker::new(
            self.config.cluster.cluster_size,
            checkpoints.writer,
            checkpoints.replication,
            self.publisher.clone(),
        )
        .spawn();
        let bridge = spawn_flush_bridge(&db, tracker.clone());
        tracker.publish(TrackerMessage::StateChange { is_leader: true });

        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let logger = self
            .notifications
            .take()
            .map(|notifications| spawn_notification_logger(notifications, Some(inputs_tx.clone())));

        self.bind().await?;
        let server = self
            .server
            .take()
            .ok_or_else(|| Error::Internal("replication listener missing".into()))?;
        let server_task = tokio::spawn(server.run(inputs_tx, shutdown.clone()));

        let service = LeaderService::new(
            db,
            Arc::clone(&self.storage.epochs),
            tracker.clone(),
            self.publisher.clone(),
            self.config.replication.clone(),
            self.config.cluster.cluster_size,
            self.instance_id,
        );
        let result = service.run(inputs_rx, shutdown).await;

        tracker.publish(TrackerMessage::StateChange { is_leader: false });
        bridge.abort();
        server_task.abort();
        tracker_task.abort();
        if let Some(logger) = logger {
            logger.abort();
        }

        tracing::info!("Leader node {} stopped", self.config.node.id);
        result
    }
}

/// How a replication session ended
enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// A node that copies the log of the leader
pub struct ReplicaNode {
    config: WolfLogConfig,
    instance_id: Uuid,
    storage: NodeStorage,
    session: ReplicaSession,
    leader_address: String,
    logger: Option<JoinHandle<()>>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl ReplicaNode {
    pub fn open(config: WolfLogConfig) -> Result<Self> {
        let leader_address = config
            .cluster
            .leader_address
            .clone()
            .ok_or_else(|| Error::Config("cluster.leader_address is required for a replica".into()))?;

        let instance_id = config.instance_id();
        let (publisher, notifications) = Publisher::channel();
        let storage = NodeStorage::open(&config, instance_id, publisher)?;

        let session = ReplicaSession::new(
            Arc::clone(&storage.db),
            Arc::clone(&storage.writer),
            Arc::clone(&storage.epochs),
            instance_id,
            config.cluster.leader_id,
            config.cluster.promotable,
            config.epoch.cache_size,
        );

        tracing::info!(
            "Node {} is a replica of {} (instance {}, log at {})",
            config.node.id,
            leader_address,
            instance_id,
            storage.db.checkpoints().writer.read()
        );

        Ok(Self {
            config,
            instance_id,
            storage,
            session,
            leader_address,
            logger: None,
            notifications: Some(notifications),
        })
    }

    pub fn db(&self) -> Arc<ChunkDb> {
        Arc::clone(&self.storage.db)
    }

    pub fn epochs(&self) -> SharedEpochManager {
        Arc::clone(&self.storage.epochs)
    }

    /// Reconnect delay with up to 50% jitter
    fn backoff(&self) -> Duration {
        let base = self.config.reconnect_delay();
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter)
    }

    /// Drive one connection until it drops or shutdown is signalled
    async fn stream(
        &mut self,
        outbound: mpsc::UnboundedSender<Message>,
        inbound: &mut mpsc::UnboundedReceiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        self.session.subscribe(outbound.clone())?;

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        return Ok(SessionEnd::Disconnected);
                    };

                    match self.session.handle(message) {
                        Ok(ReplicaAction::Continue) => {}
                        Ok(ReplicaAction::Resubscribe) => {
                            self.session.subscribe(outbound.clone())?;
                        }
                        Ok(ReplicaAction::RestartRequired { truncate_position }) => {
                            return Err(Error::RestartRequired {
                                position: truncate_position,
                            });
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            tracing::warn!("Replication session failed: {}", e);
                            return Ok(SessionEnd::Disconnected);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ReplicationNode for ReplicaNode {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn is_leader(&self) -> bool {
        false
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Some(notifications) = self.notifications.take() {
            self.logger = Some(spawn_notification_logger(notifications, None));
        }

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let timeout = self.config.connect_timeout();
            match connect_to_leader(&self.leader_address, timeout).await {
                Ok((outbound, mut inbound)) => {
                    let end = self.stream(outbound, &mut inbound, &mut shutdown).await;
                    self.session.connection_lost()?;
                    match end {
                        Ok(SessionEnd::Shutdown) => break Ok(()),
                        Ok(SessionEnd::Disconnected) => {}
                        Err(e) => break Err(e),
                    }
                }
                Err(e) => {
                    tracing::warn!("Cannot reach leader {}: {}", self.leader_address, e);
                }
            }

            let delay = self.backoff();
            tracing::debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        if let Some(logger) = self.logger.take() {
            logger.abort();
        }

        tracing::info!("Replica node {} stopped", self.config.node.id);
        result
    }
}
