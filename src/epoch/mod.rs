//! Epoch Chain Module
//!
//! Epochs fence leadership eras onto log positions. The manager keeps a
//! bounded window of the newest epochs in memory and falls back to the
//! log (or a supplied history) for anything older.

mod cache;
mod manager;
mod record;

pub use cache::{CacheInsert, EpochCache};
pub use manager::{EpochManager, FenceState};
pub use record::{Epoch, EpochInformation, EpochRecord};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Epoch manager shared by the services of one node
pub type SharedEpochManager = Arc<Mutex<EpochManager>>;

/// Epoch checkpoint value meaning "fenced by a pending truncation"
pub const FENCED_EPOCH_POSITION: i64 = i64::MIN;

/// Read-through source for epochs that are not cached
pub trait EpochSource: Send {
    /// Read the epoch record stored at `position`
    fn read_epoch_at(&mut self, position: i64) -> Result<EpochRecord>;

    /// Newest epoch record available
    fn find_last_epoch(&mut self) -> Result<Option<EpochRecord>>;
}

/// In-memory epoch history, indexed by position
#[derive(Debug, Clone, Default)]
pub struct EpochHistory {
    epochs: BTreeMap<i64, EpochRecord>,
}

impl EpochHistory {
    pub fn new(epochs: impl IntoIterator<Item = EpochRecord>) -> Self {
        Self {
            epochs: epochs
                .into_iter()
                .map(|epoch| (epoch.epoch_position, epoch))
                .collect(),
        }
    }
}

impl EpochSource for EpochHistory {
    fn read_epoch_at(&mut self, position: i64) -> Result<EpochRecord> {
        self.epochs
            .get(&position)
            .cloned()
            .ok_or_else(|| Error::Epoch(format!("No epoch in history at {}", position)))
    }

    fn find_last_epoch(&mut self) -> Result<Option<EpochRecord>> {
        Ok(self.epochs.values().next_back().cloned())
    }
}
