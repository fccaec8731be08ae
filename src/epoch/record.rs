//! Epoch Record Types
//!
//! An epoch marks the start of one leadership era in the log. Records form
//! a backward-linked chain through `prev_epoch_position`.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Epoch record as persisted in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Log position the record was written at
    pub epoch_position: i64,
    /// Leadership era number, strictly increasing along the chain
    pub epoch_number: i64,
    /// Globally unique id of this epoch
    pub epoch_id: Uuid,
    /// Position of the previous epoch record, -1 for the first epoch
    pub prev_epoch_position: i64,
    /// Instance id of the leader that opened the epoch
    pub leader_instance_id: Uuid,
    /// Creation time, millisecond precision
    pub timestamp: DateTime<Utc>,
}

impl EpochRecord {
    /// Create a new epoch record stamped with the current time
    pub fn new(
        epoch_position: i64,
        epoch_number: i64,
        epoch_id: Uuid,
        prev_epoch_position: i64,
        leader_instance_id: Uuid,
    ) -> Self {
        Self {
            epoch_position,
            epoch_number,
            epoch_id,
            prev_epoch_position,
            leader_instance_id,
            // The on-disk encoding keeps milliseconds only
            timestamp: Utc::now().trunc_subsecs(3),
        }
    }

    /// Summary used on the wire
    pub fn as_epoch(&self) -> Epoch {
        Epoch {
            epoch_position: self.epoch_position,
            epoch_number: self.epoch_number,
            epoch_id: self.epoch_id,
        }
    }
}

impl std::fmt::Display for EpochRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "E{}@{}:{:?} (prev {}, leader {})",
            self.epoch_number,
            self.epoch_position,
            self.epoch_id,
            self.prev_epoch_position,
            self.leader_instance_id
        )
    }
}

/// Epoch summary exchanged between leader and replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub epoch_position: i64,
    pub epoch_number: i64,
    pub epoch_id: Uuid,
}

impl From<&EpochRecord> for Epoch {
    fn from(record: &EpochRecord) -> Self {
        record.as_epoch()
    }
}

/// JSON payload of the epoch information event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EpochInformation {
    pub leader_instance_id: Uuid,
}

impl EpochInformation {
    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
