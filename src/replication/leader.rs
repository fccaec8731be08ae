//! Leader Replication Service
//!
//! Accepts replica subscriptions, works out where each replica has to
//! start from the epochs it reports, and streams the log to it. Data is
//! sent in bulks bounded by the flushed writer position; completed chunks
//! a replica does not have are shipped as raw files.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::protocol::Message;
use super::tracker::{TrackerHandle, TrackerMessage};
use crate::bus::{Notification, Publisher};
use crate::checkpoint::Checkpoint;
use crate::config::ReplicationSettings;
use crate::epoch::{Epoch, SharedEpochManager};
use crate::error::{Error, Result};
use crate::log::{ChunkBulkReader, ChunkDb};
use crate::network::ConnectionId;

/// Outbound half of a replica connection
#[derive(Debug, Clone)]
pub struct ReplicaLink {
    connection_id: ConnectionId,
    sender: mpsc::UnboundedSender<Message>,
}

impl ReplicaLink {
    pub fn new(connection_id: ConnectionId, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            connection_id,
            sender,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a message; `false` once the connection is gone
    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Inputs of the leader service
#[derive(Debug)]
pub enum LeaderInput {
    /// A message arrived on a replica connection
    Message { link: ReplicaLink, message: Message },
    /// A replica connection closed
    ConnectionClosed { connection_id: ConnectionId },
    /// The quorum-confirmed position advanced
    ReplicatedTo(i64),
}

/// Role assigned to a subscribed replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    /// Receives the log but does not count toward quorum
    Clone,
    /// Counts toward quorum
    Follower,
}

/// Snapshot of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub subscription_id: Uuid,
    pub replica_id: Uuid,
    pub connection_id: ConnectionId,
    pub role: ReplicaRole,
    pub position: i64,
    pub acked_position: i64,
}

struct SubscribeRequest {
    log_position: i64,
    chunk_id: Option<Uuid>,
    last_epochs: Vec<Epoch>,
    leader_id: Uuid,
    replica_id: Uuid,
    subscription_id: Uuid,
    is_promotable: bool,
}

struct Subscription {
    subscription_id: Uuid,
    replica_id: Uuid,
    link: ReplicaLink,
    role: ReplicaRole,
    /// Next logical position to send; chunk start during a raw transfer
    position: i64,
    acked_position: i64,
    /// Opened once there is flushed data at `position`
    reader: Option<ChunkBulkReader>,
    eof_sent: bool,
}

impl Subscription {
    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            subscription_id: self.subscription_id,
            replica_id: self.replica_id,
            connection_id: self.link.connection_id,
            role: self.role,
            position: self.position,
            acked_position: self.acked_position,
        }
    }
}

/// Leader side of the replication sessions
pub struct LeaderService {
    db: Arc<ChunkDb>,
    epochs: SharedEpochManager,
    tracker: TrackerHandle,
    publisher: Publisher,
    settings: ReplicationSettings,
    cluster_size: usize,
    leader_id: Uuid,
    is_leader: bool,
    subscriptions: HashMap<Uuid, Subscription>,
    no_quorum_since: Option<Instant>,
    no_quorum_notified: bool,
}

impl LeaderService {
    pub fn new(
        db: Arc<ChunkDb>,
        epochs: SharedEpochManager,
        tracker: TrackerHandle,
        publisher: Publisher,
        settings: ReplicationSettings,
        cluster_size: usize,
        leader_id: Uuid,
    ) -> Self {
        Self {
            db,
            epochs,
            tracker,
            publisher,
            settings,
            cluster_size,
            leader_id,
            is_leader: true,
            subscriptions: HashMap::new(),
            no_quorum_since: None,
            no_quorum_notified: false,
        }
    }

    pub fn leader_id(&self) -> Uuid {
        self.leader_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Step up or down; stepping down drops every subscription
    pub fn set_leader(&mut self, is_leader: bool) {
        if self.is_leader && !is_leader {
            tracing::warn!("Leaving leader role, dropping {} subscriptions", self.subscriptions.len());
            let ids: Vec<Uuid> = self.subscriptions.keys().copied().collect();
            for id in ids {
                self.drop_subscription(id);
            }
        }
        self.is_leader = is_leader;
        self.no_quorum_since = None;
    }

    /// Current subscriptions
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions.values().map(Subscription::info).collect()
    }

    /// Process one input
    pub fn handle(&mut self, input: LeaderInput) -> Result<()> {
        match input {
            LeaderInput::Message { link, message } => self.handle_message(link, message),
            LeaderInput::ConnectionClosed { connection_id } => {
                self.connection_closed(connection_id);
                Ok(())
            }
            LeaderInput::ReplicatedTo(position) => {
                self.broadcast_replicated_to(position);
                Ok(())
            }
        }
    }

    fn handle_message(&mut self, link: ReplicaLink, message: Message) -> Result<()> {
        match message {
            Message::SubscribeReplica {
                log_position,
                chunk_id,
                last_epochs,
                leader_id,
                replica_id,
                subscription_id,
                is_promotable,
            } => self.handle_subscribe(
                link,
                SubscribeRequest {
                    log_position,
                    chunk_id,
                    last_epochs,
                    leader_id,
                    replica_id,
                    subscription_id,
                    is_promotable,
                },
            ),
            Message::AckLogPosition {
                subscription_id,
                replication_log_position,
                ..
            } => {
                self.handle_ack(subscription_id, replication_log_position);
                Ok(())
            }
            other => {
                tracing::debug!(
                    "Ignoring {} from C:{}",
                    other.type_name(),
                    link.connection_id
                );
                Ok(())
            }
        }
    }

    fn handle_subscribe(&mut self, link: ReplicaLink, request: SubscribeRequest) -> Result<()> {
        let subscription_id = request.subscription_id;

        tracing::info!(
            "Subscribe request from replica {} (C:{}, S:{}, position {}, epochs [{}])",
            request.replica_id,
            link.connection_id,
            subscription_id,
            request.log_position,
            request
                .last_epochs
                .iter()
                .map(|e| format!("E{}@{}", e.epoch_number, e.epoch_position))
                .collect::<Vec<_>>()
                .join(", ")
        );

        if !self.is_leader || request.leader_id != self.leader_id {
            tracing::info!(
                "Replica {} expected leader {}, asking it to retry against {}",
                request.replica_id,
                request.leader_id,
                self.leader_id
            );
            link.send(Message::ReplicaSubscriptionRetry {
                leader_id: self.leader_id,
                subscription_id,
            });
            return Ok(());
        }

        if self.subscriptions.contains_key(&subscription_id) {
            reject(&link, subscription_id, "subscription id already in use".into());
            return Ok(());
        }

        let start = match self.start_position(request.log_position, &request.last_epochs) {
            Ok(position) => position,
            Err(e) => {
                tracing::warn!("Rejecting replica {}: {}", request.replica_id, e);
                reject(&link, subscription_id, e.to_string());
                return Ok(());
            }
        };

        let flushed = self.db.checkpoints().writer.read();
        let (position, reader) = match open_reader(&self.db, start, request.chunk_id, flushed) {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!("Cannot read log at {} for replica {}: {}", start, request.replica_id, e);
                reject(&link, subscription_id, e.to_string());
                return Ok(());
            }
        };

        // A replica keeps one subscription, on one connection
        let stale: Vec<Uuid> = self
            .subscriptions
            .values()
            .filter(|s| s.replica_id == request.replica_id || s.link.connection_id == link.connection_id)
            .map(|s| s.subscription_id)
            .collect();
        let role = if request.is_promotable && position == request.log_position {
            ReplicaRole::Follower
        } else {
            ReplicaRole::Clone
        };

        for id in stale {
            let old = match self.drop_subscription(id) {
                Some(old) => old,
                None => continue,
            };
            // A follower's vote only carries over to a new follower subscription
            let keeps_vote = old.replica_id == request.replica_id && role == ReplicaRole::Follower;
            if old.role == ReplicaRole::Follower && !keeps_vote {
                self.tracker.publish(TrackerMessage::ReplicaConnectionLost {
                    replica_id: old.replica_id,
                });
            }
        }

        link.send(Message::ReplicaSubscribed {
            leader_id: self.leader_id,
            subscription_id,
            subscription_position: position,
        });
        link.send(match role {
            ReplicaRole::Follower => Message::FollowerAssignment {
                leader_id: self.leader_id,
                subscription_id,
            },
            ReplicaRole::Clone => Message::CloneAssignment {
                leader_id: self.leader_id,
                subscription_id,
            },
        });
        if let Some(reader) = reader.as_ref().filter(|r| r.is_raw()) {
            link.send(create_chunk(self.leader_id, subscription_id, reader));
        }

        let replicated = self.db.checkpoints().replication.read();
        if replicated >= 0 {
            link.send(Message::ReplicatedTo {
                subscription_id,
                log_position: replicated,
            });
        }

        tracing::info!(
            "Replica {} subscribed as {:?} at {} (S:{}, {} send)",
            request.replica_id,
            role,
            position,
            subscription_id,
            if reader.as_ref().map(|r| r.is_raw()).unwrap_or(false) { "raw" } else { "data" }
        );

        self.publisher.publish(Notification::ReplicaSubscribed {
            replica_id: request.replica_id,
            subscription_id,
            position,
        });

        self.subscriptions.insert(
            subscription_id,
            Subscription {
                subscription_id,
                replica_id: request.replica_id,
                link,
                role,
                position,
                acked_position: position,
                reader,
                eof_sent: false,
            },
        );

        Ok(())
    }

    /// Position the replica can safely continue from.
    ///
    /// `epochs` are the replica's newest epochs, newest first. The start is
    /// the replica's position capped by the first epoch where the two logs
    /// may diverge.
    fn start_position(&self, log_position: i64, epochs: &[Epoch]) -> Result<i64> {
        if epochs.is_empty() {
            if log_position > 0 {
                return Err(Error::Replication(format!(
                    "replica has data up to {} but no epochs",
                    log_position
                )));
            }
            return Ok(0);
        }

        let writer_position = self.db.checkpoints().writer.read();
        let mut manager = self
            .epochs
            .lock()
            .map_err(|_| Error::Internal("epoch manager lock poisoned".into()))?;

        let mut common = None;
        for (index, epoch) in epochs.iter().enumerate() {
            if manager.is_correct_epoch_at(epoch.epoch_position, epoch.epoch_number, epoch.epoch_id)? {
                common = Some((index, epoch));
                break;
            }
        }

        let (index, common) = match common {
            Some(found) => found,
            None => {
                tracing::warn!(
                    "No common epoch with replica at {}, subscribing at 0 (leader at {})",
                    log_position,
                    writer_position
                );
                return Ok(0);
            }
        };

        // The replica's epoch after the common one starts where the logs split
        let replica_position = match index.checked_sub(1) {
            Some(after) => epochs[after].epoch_position,
            None => log_position,
        };

        if common.epoch_number == manager.last_epoch_number() {
            return Ok(replica_position.min(writer_position));
        }

        match manager.get_epoch_after(common.epoch_number, false)? {
            Some(next) => Ok(replica_position.min(next.epoch_position)),
            None => Err(Error::Replication(format!(
                "replica epochs are unknown to the leader (common epoch E{}@{})",
                common.epoch_number, common.epoch_position
            ))),
        }
    }

    fn handle_ack(&mut self, subscription_id: Uuid, position: i64) {
        let subscription = match self.subscriptions.get_mut(&subscription_id) {
            Some(subscription) => subscription,
            None => {
                tracing::debug!("Ack for unknown subscription {}", subscription_id);
                return;
            }
        };

        subscription.acked_position = position;
        if subscription.role == ReplicaRole::Follower {
            self.tracker.publish(TrackerMessage::ReplicaWriteAck {
                replica_id: subscription.replica_id,
                position,
            });
        }
    }

    fn connection_closed(&mut self, connection_id: ConnectionId) {
        let closed: Vec<Uuid> = self
            .subscriptions
            .values()
            .filter(|s| s.link.connection_id == connection_id)
            .map(|s| s.subscription_id)
            .collect();

        for id in closed {
            if let Some(subscription) = self.subscriptions.remove(&id) {
                tracing::info!(
                    "Replica {} disconnected (S:{})",
                    subscription.replica_id,
                    subscription.subscription_id
                );

                let resubscribed = self
                    .subscriptions
                    .values()
                    .any(|s| s.replica_id == subscription.replica_id);
                if !resubscribed {
                    self.tracker.publish(TrackerMessage::ReplicaConnectionLost {
                        replica_id: subscription.replica_id,
                    });
                }
            }
        }
    }

    fn drop_subscription(&mut self, subscription_id: Uuid) -> Option<Subscription> {
        let subscription = self.subscriptions.remove(&subscription_id)?;
        tracing::info!(
            "Dropping subscription {} of replica {}",
            subscription_id,
            subscription.replica_id
        );
        subscription.link.send(Message::DropSubscription {
            leader_id: self.leader_id,
            subscription_id,
        });
        Some(subscription)
    }

    fn broadcast_replicated_to(&mut self, position: i64) {
        for subscription in self.subscriptions.values() {
            subscription.link.send(Message::ReplicatedTo {
                subscription_id: subscription.subscription_id,
                log_position: position,
            });
        }
    }

    /// Send at most one bulk to every subscription; returns whether
    /// anything was sent
    pub fn pump(&mut self) -> bool {
        let flushed = self.db.checkpoints().writer.read();
        let mut data_found = false;
        let mut failed = Vec::new();

        for subscription in self.subscriptions.values_mut() {
            match send_bulk(&self.db, &self.settings, self.leader_id, subscription, flushed) {
                Ok(sent) => data_found |= sent,
                Err(e) => {
                    tracing::warn!(
                        "Replication to replica {} failed: {}",
                        subscription.replica_id,
                        e
                    );
                    failed.push(subscription.subscription_id);
                }
            }
        }

        for id in failed {
            self.drop_subscription(id);
        }

        data_found
    }

    /// Report `NoQuorum` once when followers have been missing too long
    pub fn check_quorum(&mut self, now: Instant) {
        if !self.is_leader {
            return;
        }

        let followers = self
            .subscriptions
            .values()
            .filter(|s| s.role == ReplicaRole::Follower)
            .count();
        if followers >= self.cluster_size / 2 {
            self.no_quorum_since = None;
            return;
        }

        let since = match self.no_quorum_since {
            Some(since) => since,
            None => {
                self.no_quorum_since = Some(now);
                self.no_quorum_notified = false;
                now
            }
        };

        if !self.no_quorum_notified
            && now.saturating_duration_since(since) > self.settings.no_quorum_timeout()
        {
            tracing::warn!(
                "Only {} followers for a cluster of {}, no quorum",
                followers,
                self.cluster_size
            );
            self.publisher.publish(Notification::NoQuorum);
            self.no_quorum_notified = true;
        }
    }

    /// Run until the input channel closes or shutdown is signalled
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<LeaderInput>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut flushed = self.db.checkpoints().writer.subscribe();
        let mut ticker = tokio::time::interval(self.settings.pump_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Leader replication service started (leader {})", self.leader_id);

        'service: loop {
            let data_found = self.pump();
            self.check_quorum(Instant::now());

            if data_found {
                loop {
                    match inputs.try_recv() {
                        Ok(input) => self.handle(input)?,
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'service,
                    }
                }
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => self.handle(input)?,
                    None => break,
                },
                changed = flushed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let ids: Vec<Uuid> = self.subscriptions.keys().copied().collect();
        for id in ids {
            self.drop_subscription(id);
        }

        tracing::info!("Leader replication service stopped");
        Ok(())
    }
}

fn reject(link: &ReplicaLink, subscription_id: Uuid, reason: String) {
    link.send(Message::BadRequest {
        subscription_id,
        reason,
    });
}

fn create_chunk(leader_id: Uuid, subscription_id: Uuid, reader: &ChunkBulkReader) -> Message {
    Message::CreateChunk {
        leader_id,
        subscription_id,
        chunk_header: reader.header().to_bytes().to_vec(),
        file_size: reader.chunk().file_size(),
        is_completed_chunk: true,
    }
}

/// Open a reader for `position` if flushed data exists there.
///
/// A completed chunk the replica does not hold is sent raw from its start
/// when the replica is at the chunk start, or whenever the chunk was
/// scavenged. Returns the position streaming actually starts from.
fn open_reader(
    db: &ChunkDb,
    position: i64,
    replica_chunk_id: Option<Uuid>,
    flushed: i64,
) -> Result<(i64, Option<ChunkBulkReader>)> {
    if position >= flushed {
        return Ok((position, None));
    }

    let chunk = db.open_chunk(position)?;
    let header = chunk.header();
    let chunk_start = header.chunk_start_position();
    let raw = chunk.is_completed()
        && replica_chunk_id != Some(header.chunk_id)
        && (header.is_scavenged || position == chunk_start);
    drop(chunk);

    if raw {
        Ok((chunk_start, Some(ChunkBulkReader::open_raw(db, chunk_start)?)))
    } else {
        Ok((position, Some(ChunkBulkReader::open_data(db, position)?)))
    }
}

fn send_bulk(
    db: &ChunkDb,
    settings: &ReplicationSettings,
    leader_id: Uuid,
    subscription: &mut Subscription,
    flushed: i64,
) -> Result<bool> {
    let raw_in_progress = subscription.reader.as_ref().map(|r| r.is_raw()).unwrap_or(false);
    if !raw_in_progress && subscription.position - subscription.acked_position >= settings.send_window {
        return Ok(false);
    }

    if subscription.reader.is_none() {
        let (position, reader) = open_reader(db, subscription.position, None, flushed)?;
        if let Some(reader) = reader.as_ref().filter(|r| r.is_raw()) {
            subscription
                .link
                .send(create_chunk(leader_id, subscription.subscription_id, reader));
        }
        subscription.position = position;
        subscription.reader = reader;
        subscription.eof_sent = false;
    }

    let reader = match subscription.reader.as_mut() {
        Some(reader) => reader,
        None => return Ok(false),
    };
    let header = reader.header().clone();

    let mut data_found = false;
    let is_eof = if reader.is_raw() {
        let bulk = reader.read_next_raw_bytes(settings.bulk_size)?;
        if !bulk.bytes.is_empty() {
            data_found = true;
            subscription.link.send(Message::RawChunkBulk {
                leader_id,
                subscription_id: subscription.subscription_id,
                chunk_start_number: header.chunk_start_number,
                chunk_end_number: header.chunk_end_number,
                raw_position: bulk.raw_position,
                raw_bytes: bulk.bytes,
                complete_chunk: bulk.is_eof,
            });
        }
        bulk.is_eof
    } else {
        let bulk = reader.read_next_data_bytes(settings.bulk_size, flushed)?;
        if bulk.position != subscription.position {
            return Err(Error::InvariantViolation(format!(
                "bulk read at {} for subscription at {}",
                bulk.position, subscription.position
            )));
        }

        // Empty reads at the end repeat; EOF goes out exactly once
        if !bulk.bytes.is_empty() || (bulk.is_eof && !subscription.eof_sent) {
            data_found = true;
            subscription.eof_sent = bulk.is_eof;
            subscription.position += bulk.bytes.len() as i64;
            subscription.link.send(Message::DataChunkBulk {
                leader_id,
                subscription_id: subscription.subscription_id,
                chunk_start_number: header.chunk_start_number,
                chunk_end_number: header.chunk_end_number,
                subscription_position: bulk.position,
                data_bytes: bulk.bytes,
                complete_chunk: bulk.is_eof,
            });
        }
        bulk.is_eof
    };

    if is_eof {
        let next = header.chunk_end_position();
        tracing::debug!(
            "Finished chunk #{}-{} for S:{}, moving to {}",
            header.chunk_start_number,
            header.chunk_end_number,
            subscription.subscription_id,
            next
        );
        subscription.position = next;
        subscription.reader = None;
        subscription.eof_sent = false;
        data_found |= next < flushed;
    }

    Ok(data_found)
}
