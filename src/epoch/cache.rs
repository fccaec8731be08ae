//! Bounded window of the most recent epochs, oldest first.

use std::collections::VecDeque;

use super::EpochRecord;
use crate::error::{Error, Result};

/// What happened to an inserted epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsert {
    /// Extended the window at the newest end
    Appended,
    /// Did not chain onto the newest epoch; the window restarted at it
    Reset,
    /// Already cached
    Duplicate,
    /// Older than the oldest cached epoch
    Stale,
}

#[derive(Debug, Clone)]
pub struct EpochCache {
    epochs: VecDeque<EpochRecord>,
    capacity: usize,
}

impl EpochCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            epochs: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn first(&self) -> Option<&EpochRecord> {
        self.epochs.front()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &EpochRecord> {
        self.epochs.iter()
    }

    pub fn get(&self, epoch_number: i64) -> Option<&EpochRecord> {
        self.epochs.iter().find(|e| e.epoch_number == epoch_number)
    }

    /// Cached epoch directly following `epoch_number`
    pub fn successor(&self, epoch_number: i64) -> Option<&EpochRecord> {
        let index = self
            .epochs
            .iter()
            .position(|e| e.epoch_number == epoch_number)?;
        self.epochs.get(index + 1)
    }

    /// Newest cached epoch strictly before `position`
    pub fn newest_before(&self, position: i64) -> Option<&EpochRecord> {
        self.epochs.iter().rev().find(|e| e.epoch_position < position)
    }

    /// Up to `max` epochs, newest first
    pub fn newest(&self, max: usize) -> Vec<EpochRecord> {
        self.epochs.iter().rev().take(max).cloned().collect()
    }

    /// Replace the whole window with an ascending chain
    pub fn replace(&mut self, epochs: impl IntoIterator<Item = EpochRecord>) {
        self.epochs = epochs.into_iter().collect();
        while self.epochs.len() > self.capacity {
            self.epochs.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.epochs.clear();
    }

    /// Insert an epoch, keeping the window contiguous
    pub fn insert(&mut self, epoch: EpochRecord) -> Result<CacheInsert> {
        if let Some(existing) = self.get(epoch.epoch_number) {
            if existing.epoch_id == epoch.epoch_id && existing.epoch_position == epoch.epoch_position
            {
                return Ok(CacheInsert::Duplicate);
            }
            return Err(Error::InvariantViolation(format!(
                "epoch {} conflicts with cached {}",
                epoch, existing
            )));
        }

        let (first_number, last) = match (self.epochs.front(), self.epochs.back()) {
            (Some(first), Some(last)) => (first.epoch_number, last.clone()),
            _ => {
                self.epochs.push_back(epoch);
                return Ok(CacheInsert::Appended);
            }
        };

        if epoch.epoch_number > last.epoch_number {
            if epoch.prev_epoch_position == last.epoch_position
                && epoch.epoch_position > last.epoch_position
            {
                self.epochs.push_back(epoch);
                while self.epochs.len() > self.capacity {
                    self.epochs.pop_front();
                }
                return Ok(CacheInsert::Appended);
            }

            tracing::debug!(
                "Epoch {} does not chain onto {}, restarting cache window",
                epoch,
                last
            );
            self.epochs.clear();
            self.epochs.push_back(epoch);
            return Ok(CacheInsert::Reset);
        }

        if epoch.epoch_number < first_number {
            return Ok(CacheInsert::Stale);
        }

        Err(Error::InvariantViolation(format!(
            "epoch {} falls inside the cached window but is not part of it",
            epoch
        )))
    }
}
