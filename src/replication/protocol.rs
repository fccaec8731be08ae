//! Replication Protocol
//!
//! Defines the wire protocol of a leader–replica replication session.
//! Every message sent after `SubscribeReplica` carries the subscription id
//! it belongs to, so either side can discard messages of a stale session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::epoch::Epoch;

/// Protocol messages exchanged between leader and replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ========== Subscription ==========
    /// Replica asks to stream the log from its flushed position
    SubscribeReplica {
        log_position: i64,
        /// Id of the chunk holding `log_position`, if any
        chunk_id: Option<Uuid>,
        /// Newest epochs of the replica, newest first
        last_epochs: Vec<Epoch>,
        leader_id: Uuid,
        replica_id: Uuid,
        subscription_id: Uuid,
        is_promotable: bool,
    },

    /// Not the expected leader; retry against `leader_id`
    ReplicaSubscriptionRetry {
        leader_id: Uuid,
        subscription_id: Uuid,
    },

    /// Subscription accepted, streaming starts at `subscription_position`
    ReplicaSubscribed {
        leader_id: Uuid,
        subscription_id: Uuid,
        subscription_position: i64,
    },

    /// Replica receives data but does not count toward quorum
    CloneAssignment {
        leader_id: Uuid,
        subscription_id: Uuid,
    },

    /// Replica counts toward quorum
    FollowerAssignment {
        leader_id: Uuid,
        subscription_id: Uuid,
    },

    /// Leader ended the subscription
    DropSubscription {
        leader_id: Uuid,
        subscription_id: Uuid,
    },

    // ========== Log Transfer ==========
    /// A raw chunk transfer is about to start
    CreateChunk {
        leader_id: Uuid,
        subscription_id: Uuid,
        chunk_header: Vec<u8>,
        file_size: i64,
        is_completed_chunk: bool,
    },

    /// Slice of a complete chunk file, header and footer included
    RawChunkBulk {
        leader_id: Uuid,
        subscription_id: Uuid,
        chunk_start_number: i32,
        chunk_end_number: i32,
        raw_position: i64,
        raw_bytes: Vec<u8>,
        complete_chunk: bool,
    },

    /// Slice of logical log data starting at `subscription_position`
    DataChunkBulk {
        leader_id: Uuid,
        subscription_id: Uuid,
        chunk_start_number: i32,
        chunk_end_number: i32,
        subscription_position: i64,
        data_bytes: Vec<u8>,
        complete_chunk: bool,
    },

    // ========== Acknowledgement ==========
    /// Replica has durably written up to the given positions
    AckLogPosition {
        subscription_id: Uuid,
        replication_log_position: i64,
        writer_log_position: i64,
    },

    /// Highest quorum-confirmed position
    ReplicatedTo {
        subscription_id: Uuid,
        log_position: i64,
    },

    // ========== Errors ==========
    /// Subscription request rejected
    BadRequest {
        subscription_id: Uuid,
        reason: String,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Subscription the message belongs to
    pub fn subscription_id(&self) -> Uuid {
        match self {
            Message::SubscribeReplica { subscription_id, .. }
            | Message::ReplicaSubscriptionRetry { subscription_id, .. }
            | Message::ReplicaSubscribed { subscription_id, .. }
            | Message::CloneAssignment { subscription_id, .. }
            | Message::FollowerAssignment { subscription_id, .. }
            | Message::DropSubscription { subscription_id, .. }
            | Message::CreateChunk { subscription_id, .. }
            | Message::RawChunkBulk { subscription_id, .. }
            | Message::DataChunkBulk { subscription_id, .. }
            | Message::AckLogPosition { subscription_id, .. }
            | Message::ReplicatedTo { subscription_id, .. }
            | Message::BadRequest { subscription_id, .. } => *subscription_id,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::SubscribeReplica { .. } => "SubscribeReplica",
            Message::ReplicaSubscriptionRetry { .. } => "ReplicaSubscriptionRetry",
            Message::ReplicaSubscribed { .. } => "ReplicaSubscribed",
            Message::CloneAssignment { .. } => "CloneAssignment",
            Message::FollowerAssignment { .. } => "FollowerAssignment",
            Message::DropSubscription { .. } => "DropSubscription",
            Message::CreateChunk { .. } => "CreateChunk",
            Message::RawChunkBulk { .. } => "RawChunkBulk",
            Message::DataChunkBulk { .. } => "DataChunkBulk",
            Message::AckLogPosition { .. } => "AckLogPosition",
            Message::ReplicatedTo { .. } => "ReplicatedTo",
            Message::BadRequest { .. } => "BadRequest",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from the wire
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);

        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}
