//! Epoch Manager
//!
//! Owns the epoch chain of one node: writes new epochs at the head of the
//! log, answers chain queries from a bounded cache with read-through to
//! the log, and fences itself when asked to truncate.

use std::sync::Arc;

use uuid::Uuid;

use super::cache::{CacheInsert, EpochCache};
use super::record::{EpochInformation, EpochRecord};
use super::{EpochSource, FENCED_EPOCH_POSITION};
use crate::bus::{Notification, Publisher};
use crate::checkpoint::{Checkpoint, SharedCheckpoint};
use crate::error::{Error, Result};
use crate::log::record::{EPOCH_INFORMATION_EVENT_TYPE, EPOCH_INFORMATION_STREAM};
use crate::log::{ChunkDb, LogReader, LogRecord, PrepareRecord, SharedWriter};

/// Whether the manager still accepts mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Active,
    /// A truncation was requested; the process must restart
    Fenced,
}

/// Epoch chain manager
pub struct EpochManager {
    /// Newest epochs, oldest first
    cache: EpochCache,
    /// Position of the newest epoch
    checkpoint: SharedCheckpoint,
    /// Flushed head of the log, bounds read-through
    writer_checkpoint: SharedCheckpoint,
    /// Log writer epochs are appended with
    writer: SharedWriter,
    /// Read-through source for uncached epochs
    source: Box<dyn EpochSource>,
    /// Notification sink
    publisher: Publisher,
    /// Instance id recorded as leader of written epochs
    instance_id: Uuid,
    state: FenceState,
}

impl EpochManager {
    /// Create a manager reading through to the log of `db`
    pub fn new(
        db: Arc<ChunkDb>,
        writer: SharedWriter,
        cache_size: usize,
        instance_id: Uuid,
        publisher: Publisher,
    ) -> Self {
        let checkpoints = db.checkpoints().clone();
        Self {
            cache: EpochCache::new(cache_size),
            checkpoint: checkpoints.epoch,
            writer_checkpoint: checkpoints.writer,
            writer,
            source: Box::new(LogReader::new(db)),
            publisher,
            instance_id,
            state: FenceState::Active,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    pub fn is_fenced(&self) -> bool {
        self.state == FenceState::Fenced
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        match self.state {
            FenceState::Active => Ok(()),
            FenceState::Fenced => Err(Error::Fenced(format!(
                "{} refused after truncation was requested",
                operation
            ))),
        }
    }

    /// Load the newest epochs from the log
    pub fn init(&mut self) -> Result<()> {
        self.ensure_active("init")?;

        let mut position = self.checkpoint.read();
        if position == FENCED_EPOCH_POSITION {
            return Err(Error::Fenced(
                "epoch checkpoint marks an unfinished truncation".into(),
            ));
        }

        if position < 0 {
            match self.source.find_last_epoch()? {
                Some(epoch) => {
                    tracing::info!("Found last epoch {} by scanning the log", epoch);
                    position = epoch.epoch_position;
                    self.checkpoint.write(position);
                    self.checkpoint.flush()?;
                }
                None => {
                    tracing::info!("No epochs in the log");
                    self.cache.clear();
                    return Ok(());
                }
            }
        }

        let flushed = self.writer_checkpoint.read();
        if position >= flushed {
            return Err(Error::LogCorrupted {
                position,
                reason: format!("epoch checkpoint beyond writer checkpoint {}", flushed),
            });
        }

        let mut epochs = Vec::with_capacity(self.cache.capacity());
        while position >= 0 && epochs.len() < self.cache.capacity() {
            let epoch = self.source.read_epoch_at(position)?;
            position = epoch.prev_epoch_position;
            epochs.push(epoch);
        }
        epochs.reverse();
        self.cache.replace(epochs);

        if let Some(last) = self.cache.last() {
            tracing::info!(
                "Loaded {} epochs, last is {}",
                self.cache.len(),
                last
            );
        }

        Ok(())
    }

    /// Newest known epoch
    pub fn last_epoch(&self) -> Option<&EpochRecord> {
        self.cache.last()
    }

    /// Number of the newest epoch, -1 when there is none
    pub fn last_epoch_number(&self) -> i64 {
        self.cache.last().map(|e| e.epoch_number).unwrap_or(-1)
    }

    /// Up to `max` newest epochs, newest first
    pub fn get_last_epochs(&self, max: usize) -> Vec<EpochRecord> {
        self.cache.newest(max)
    }

    /// Write a new epoch at the head of the log.
    ///
    /// Appends the epoch record followed by the epoch information event,
    /// flushes, then caches the epoch and publishes `EpochWritten`.
    pub fn write_new_epoch(&mut self, epoch_number: i64) -> Result<EpochRecord> {
        self.ensure_active("write_new_epoch")?;

        if epoch_number < 0 {
            return Err(Error::Epoch(format!(
                "Epoch number must be non-negative, got {}",
                epoch_number
            )));
        }

        if epoch_number <= self.last_epoch_number() {
            return Err(Error::Epoch(format!(
                "Epoch {} is not after last epoch {}",
                epoch_number,
                self.last_epoch_number()
            )));
        }

        let prev_epoch_position = self.cache.last().map(|e| e.epoch_position).unwrap_or(-1);
        let epoch_id = Uuid::new_v4();
        let instance_id = self.instance_id;
        let information = EpochInformation {
            leader_instance_id: instance_id,
        }
        .to_json()?;

        let epoch = {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| Error::Internal("log writer lock poisoned".into()))?;

            let mut written = None;
            writer.append(|position| {
                let epoch = EpochRecord::new(
                    position,
                    epoch_number,
                    epoch_id,
                    prev_epoch_position,
                    instance_id,
                );
                written = Some(epoch.clone());
                LogRecord::Epoch(epoch)
            })?;

            writer.append(|position| {
                LogRecord::Prepare(PrepareRecord::json(
                    position,
                    EPOCH_INFORMATION_STREAM,
                    epoch_number - 1,
                    EPOCH_INFORMATION_EVENT_TYPE,
                    information.clone(),
                ))
            })?;

            writer.flush()?;

            written.ok_or_else(|| Error::Internal("epoch record was not built".into()))?
        };

        self.add_epoch_to_cache(epoch.clone())?;
        self.publisher
            .publish(Notification::EpochWritten(epoch.clone()));

        tracing::info!("Wrote new epoch {}", epoch);

        Ok(epoch)
    }

    /// Cache an epoch that is already durable in the log.
    ///
    /// Returns `false` when the epoch was already cached or is older than
    /// the window.
    pub fn add_epoch_to_cache(&mut self, epoch: EpochRecord) -> Result<bool> {
        self.ensure_active("add_epoch_to_cache")?;

        match self.cache.insert(epoch)? {
            CacheInsert::Appended | CacheInsert::Reset => {
                if let Some(last) = self.cache.last() {
                    self.checkpoint.write(last.epoch_position);
                    self.checkpoint.flush()?;
                }
                Ok(true)
            }
            CacheInsert::Duplicate | CacheInsert::Stale => Ok(false),
        }
    }

    /// Cache an epoch replicated from the leader, checking it against the
    /// local log first
    pub fn cache_epoch(&mut self, epoch: EpochRecord) -> Result<bool> {
        self.ensure_active("cache_epoch")?;

        let on_disk = self.source.read_epoch_at(epoch.epoch_position)?;
        if on_disk != epoch {
            return Err(Error::InvariantViolation(format!(
                "replicated epoch {} differs from log copy {}",
                epoch, on_disk
            )));
        }

        self.add_epoch_to_cache(epoch)
    }

    /// Epoch that follows `epoch_number` in the chain
    pub fn get_epoch_after(
        &mut self,
        epoch_number: i64,
        throw_if_missing: bool,
    ) -> Result<Option<EpochRecord>> {
        self.ensure_active("get_epoch_after")?;

        let found = match self.lookup_cached_after(epoch_number) {
            CachedLookup::Found(epoch) => Some(epoch),
            CachedLookup::Missing => None,
            CachedLookup::BeforeWindow(first) => {
                walk_chain_after(self.source.as_mut(), first, epoch_number)?
            }
        };

        missing_unless(found, epoch_number, throw_if_missing)
    }

    /// Same as `get_epoch_after`, walking a supplied history instead of
    /// the log once past the cached window
    pub fn get_epoch_after_in(
        &self,
        epoch_number: i64,
        history: &mut dyn EpochSource,
        throw_if_missing: bool,
    ) -> Result<Option<EpochRecord>> {
        self.ensure_active("get_epoch_after_in")?;

        let found = match self.lookup_cached_after(epoch_number) {
            CachedLookup::Found(epoch) => Some(epoch),
            CachedLookup::Missing => None,
            CachedLookup::BeforeWindow(first) => walk_chain_after(history, first, epoch_number)?,
        };

        missing_unless(found, epoch_number, throw_if_missing)
    }

    fn lookup_cached_after(&self, epoch_number: i64) -> CachedLookup {
        let (first, last) = match (self.cache.first(), self.cache.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return CachedLookup::Missing,
        };

        if epoch_number >= last.epoch_number {
            return CachedLookup::Missing;
        }

        if epoch_number >= first.epoch_number {
            return match self.cache.successor(epoch_number) {
                Some(epoch) => CachedLookup::Found(epoch.clone()),
                None => CachedLookup::Missing,
            };
        }

        CachedLookup::BeforeWindow(first.clone())
    }

    /// Whether an epoch with this number and id starts at `position`
    pub fn is_correct_epoch_at(
        &mut self,
        position: i64,
        epoch_number: i64,
        epoch_id: Uuid,
    ) -> Result<bool> {
        self.ensure_active("is_correct_epoch_at")?;

        if let Some(epoch) = self.cache.get(epoch_number) {
            return Ok(epoch.epoch_position == position && epoch.epoch_id == epoch_id);
        }

        if position < 0 || epoch_number > self.last_epoch_number() {
            return Ok(false);
        }

        if let Some(first) = self.cache.first() {
            if epoch_number >= first.epoch_number {
                return Ok(false);
            }
        }

        if position >= self.writer_checkpoint.read() {
            return Ok(false);
        }

        match self.source.read_epoch_at(position) {
            Ok(epoch) => Ok(epoch.epoch_number == epoch_number && epoch.epoch_id == epoch_id),
            Err(Error::Io(e)) => Err(Error::Io(e)),
            Err(e) => {
                tracing::debug!("No epoch {} at {}: {}", epoch_number, position, e);
                Ok(false)
            }
        }
    }

    /// Find the epoch to keep when truncating the log at `position`.
    ///
    /// On success the epoch checkpoint is marked fenced and every further
    /// mutating call fails; the caller is expected to restart the process.
    pub fn try_truncate_before(&mut self, position: i64) -> Result<Option<EpochRecord>> {
        self.ensure_active("try_truncate_before")?;

        let epoch = match self.cache.newest_before(position) {
            Some(epoch) => epoch.clone(),
            None => {
                tracing::warn!("No cached epoch before {}, nothing to truncate to", position);
                return Ok(None);
            }
        };

        self.checkpoint.write(FENCED_EPOCH_POSITION);
        self.checkpoint.flush()?;
        self.state = FenceState::Fenced;

        tracing::warn!(
            "Truncation before {} requested, keeping epoch {}; epoch manager fenced",
            position,
            epoch
        );

        Ok(Some(epoch))
    }
}

enum CachedLookup {
    Found(EpochRecord),
    Missing,
    BeforeWindow(EpochRecord),
}

/// Walk `prev_epoch_position` links back from `start` until the epoch
/// numbered `epoch_number`; returns its successor on the chain
fn walk_chain_after(
    source: &mut dyn EpochSource,
    start: EpochRecord,
    epoch_number: i64,
) -> Result<Option<EpochRecord>> {
    let mut current = start;
    while current.prev_epoch_position >= 0 && current.epoch_number > epoch_number {
        let prev = source.read_epoch_at(current.prev_epoch_position)?;
        if prev.epoch_number == epoch_number {
            return Ok(Some(current));
        }
        current = prev;
    }
    Ok(None)
}

fn missing_unless(
    found: Option<EpochRecord>,
    epoch_number: i64,
    throw_if_missing: bool,
) -> Result<Option<EpochRecord>> {
    match found {
        None if throw_if_missing => Err(Error::EpochNotFound(epoch_number)),
        found => Ok(found),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochHistory;
    use crate::log::test_support::*;
    use crate::log::LogWriter;
    use tempfile::tempdir;

    struct Fixture {
        db: Arc<ChunkDb>,
        writer: SharedWriter,
        leader: Uuid,
    }

    impl Fixture {
        fn new(dir: &std::path::Path) -> Self {
            let db = open_db(dir);
            let writer = LogWriter::open_shared(Arc::clone(&db)).unwrap();
            Self {
                db,
                writer,
                leader: Uuid::new_v4(),
            }
        }

        fn manager(&self, cache_size: usize) -> EpochManager {
            let mut manager = EpochManager::new(
                Arc::clone(&self.db),
                Arc::clone(&self.writer),
                cache_size,
                self.leader,
                Publisher::noop(),
            );
            manager.init().unwrap();
            manager
        }

        fn event(&self) {
            append_event(&mut self.writer.lock().unwrap(), "data");
        }
    }

    #[test]
    fn test_write_new_epoch_links_chain() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let (publisher, mut rx) = Publisher::channel();
        let mut manager = EpochManager::new(
            Arc::clone(&fixture.db),
            Arc::clone(&fixture.writer),
            10,
            fixture.leader,
            publisher,
        );
        manager.init().unwrap();
        assert_eq!(manager.last_epoch_number(), -1);

        let e0 = manager.write_new_epoch(0).unwrap();
        fixture.event();
        let e1 = manager.write_new_epoch(1).unwrap();

        assert_eq!(e0.prev_epoch_position, -1);
        assert_eq!(e1.prev_epoch_position, e0.epoch_position);
        assert_eq!(e1.leader_instance_id, fixture.leader);
        assert_eq!(fixture.db.checkpoints().epoch.read(), e1.epoch_position);
        assert!(fixture.db.checkpoints().writer.read() > e1.epoch_position);

        assert_eq!(rx.try_recv().unwrap(), Notification::EpochWritten(e0));
        assert_eq!(rx.try_recv().unwrap(), Notification::EpochWritten(e1));
    }

    #[test]
    fn test_epoch_information_follows_epoch() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut manager = fixture.manager(10);

        let epoch = manager.write_new_epoch(5).unwrap();

        let mut reader = LogReader::new(Arc::clone(&fixture.db));
        reader.reposition(epoch.epoch_position);
        let (_, record) = reader.read_next().unwrap().unwrap();
        assert_eq!(record, LogRecord::Epoch(epoch.clone()));

        match reader.read_next().unwrap().unwrap().1 {
            LogRecord::Prepare(prepare) => {
                assert_eq!(prepare.stream, EPOCH_INFORMATION_STREAM);
                assert_eq!(prepare.expected_version, 4);
                let info = EpochInformation::from_json(&prepare.data).unwrap();
                assert_eq!(info.leader_instance_id, fixture.leader);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_write_new_epoch_rejects_bad_numbers() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut manager = fixture.manager(10);

        assert!(manager.write_new_epoch(-1).is_err());
        manager.write_new_epoch(3).unwrap();
        assert!(manager.write_new_epoch(3).is_err());
        assert!(manager.write_new_epoch(2).is_err());
        assert!(manager.write_new_epoch(4).is_ok());
    }

    #[test]
    fn test_epoch_moves_to_next_chunk_when_full() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut manager = fixture.manager(10);

        {
            let mut writer = fixture.writer.lock().unwrap();
            writer
                .append(|pos| {
                    LogRecord::Prepare(PrepareRecord::json(pos, "s", -2, "t", vec![0u8; 3990]))
                })
                .unwrap();
            writer.flush().unwrap();
        }

        let epoch = manager.write_new_epoch(0).unwrap();
        assert_eq!(epoch.epoch_position, TEST_CHUNK_SIZE as i64);
    }

    #[test]
    fn test_init_restores_bounded_window() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let written: Vec<EpochRecord> = {
            let mut manager = fixture.manager(10);
            (0..5)
                .map(|n| {
                    fixture.event();
                    manager.write_new_epoch(n).unwrap()
                })
                .collect()
        };

        let manager = fixture.manager(3);
        let cached: Vec<i64> = manager
            .get_last_epochs(10)
            .iter()
            .map(|e| e.epoch_number)
            .collect();
        assert_eq!(cached, vec![4, 3, 2]);
        assert_eq!(manager.last_epoch(), written.last());
    }

    #[test]
    fn test_init_scans_when_checkpoint_unknown() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let last = {
            let mut manager = fixture.manager(10);
            manager.write_new_epoch(0).unwrap();
            manager.write_new_epoch(1).unwrap()
        };

        fixture.db.checkpoints().epoch.write(-1);
        fixture.db.checkpoints().epoch.flush().unwrap();

        let manager = fixture.manager(10);
        assert_eq!(manager.last_epoch(), Some(&last));
        assert_eq!(manager.get_last_epochs(10).len(), 2);
        assert_eq!(fixture.db.checkpoints().epoch.read(), last.epoch_position);
    }

    #[test]
    fn test_get_epoch_after_reads_through_to_log() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let written: Vec<EpochRecord> = {
            let mut manager = fixture.manager(10);
            (0..5).map(|n| manager.write_new_epoch(n).unwrap()).collect()
        };

        let mut manager = fixture.manager(2);
        // Cached window is epochs 3 and 4
        assert_eq!(manager.get_epoch_after(3, true).unwrap(), Some(written[4].clone()));
        assert_eq!(manager.get_epoch_after(0, true).unwrap(), Some(written[1].clone()));
        assert_eq!(manager.get_epoch_after(2, true).unwrap(), Some(written[3].clone()));
        assert_eq!(manager.get_epoch_after(4, false).unwrap(), None);
        assert!(matches!(
            manager.get_epoch_after(4, true),
            Err(Error::EpochNotFound(4))
        ));
        assert_eq!(manager.get_epoch_after(-7, false).unwrap(), None);
    }

    #[test]
    fn test_get_epoch_after_in_history() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let written: Vec<EpochRecord> = {
            let mut manager = fixture.manager(10);
            (0..4).map(|n| manager.write_new_epoch(n).unwrap()).collect()
        };

        let manager = fixture.manager(1);
        let mut history = EpochHistory::new(written.clone());
        assert_eq!(
            manager.get_epoch_after_in(1, &mut history, true).unwrap(),
            Some(written[2].clone())
        );

        let mut empty = EpochHistory::default();
        assert!(manager.get_epoch_after_in(1, &mut empty, true).is_err());
    }

    #[test]
    fn test_is_correct_epoch_at() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let written: Vec<EpochRecord> = {
            let mut manager = fixture.manager(10);
            (0..3).map(|n| manager.write_new_epoch(n).unwrap()).collect()
        };

        let mut manager = fixture.manager(1);
        let e0 = &written[0];
        let e2 = &written[2];

        assert!(manager
            .is_correct_epoch_at(e2.epoch_position, 2, e2.epoch_id)
            .unwrap());
        // Outside the cache, answered from the log
        assert!(manager
            .is_correct_epoch_at(e0.epoch_position, 0, e0.epoch_id)
            .unwrap());
        assert!(!manager
            .is_correct_epoch_at(e0.epoch_position, 0, Uuid::new_v4())
            .unwrap());
        assert!(!manager
            .is_correct_epoch_at(e0.epoch_position + 1, 0, e0.epoch_id)
            .unwrap());
        assert!(!manager.is_correct_epoch_at(0, 9, e0.epoch_id).unwrap());
    }

    #[test]
    fn test_add_epoch_to_cache_is_idempotent() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let e0 = {
            let mut writer = fixture.writer.lock().unwrap();
            append_epoch(&mut writer, 0, -1)
        };

        let mut manager = fixture.manager(10);
        // init found it by scanning
        assert!(!manager.add_epoch_to_cache(e0.clone()).unwrap());

        let e1 = {
            let mut writer = fixture.writer.lock().unwrap();
            append_epoch(&mut writer, 1, e0.epoch_position)
        };
        assert!(manager.cache_epoch(e1.clone()).unwrap());
        assert!(!manager.cache_epoch(e1.clone()).unwrap());
        assert_eq!(manager.get_last_epochs(5).len(), 2);
        assert_eq!(fixture.db.checkpoints().epoch.read(), e1.epoch_position);
    }

    #[test]
    fn test_cache_epoch_rejects_forged_record() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let e0 = {
            let mut writer = fixture.writer.lock().unwrap();
            append_epoch(&mut writer, 0, -1)
        };

        let mut manager = fixture.manager(10);
        let mut forged = e0;
        forged.epoch_id = Uuid::new_v4();
        assert!(matches!(
            manager.cache_epoch(forged),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_truncation_boundary_does_not_fence() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut manager = fixture.manager(10);
        let e0 = manager.write_new_epoch(0).unwrap();

        assert_eq!(manager.try_truncate_before(e0.epoch_position).unwrap(), None);
        assert!(!manager.is_fenced());
        assert!(manager.write_new_epoch(1).is_ok());
    }

    #[test]
    fn test_truncation_fences_manager() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut manager = fixture.manager(10);
        let e0 = manager.write_new_epoch(0).unwrap();
        fixture.event();
        let e1 = manager.write_new_epoch(1).unwrap();

        // The kept epoch is the newest one strictly before the position
        let kept = manager.try_truncate_before(e1.epoch_position).unwrap();
        assert_eq!(kept, Some(e0));
        assert!(manager.is_fenced());
        assert_eq!(fixture.db.checkpoints().epoch.read(), FENCED_EPOCH_POSITION);

        assert!(matches!(manager.write_new_epoch(2), Err(Error::Fenced(_))));
        assert!(matches!(manager.init(), Err(Error::Fenced(_))));
        assert!(matches!(
            manager.try_truncate_before(e1.epoch_position + 1),
            Err(Error::Fenced(_))
        ));

        // A fresh manager over the same checkpoint refuses to start
        let mut fresh = EpochManager::new(
            Arc::clone(&fixture.db),
            Arc::clone(&fixture.writer),
            10,
            Uuid::new_v4(),
            Publisher::noop(),
        );
        assert!(matches!(fresh.init(), Err(Error::Fenced(_))));
    }

    #[test]
    fn test_fenced_manager_keeps_fence_sentinel() {
        let dir = tempdir().unwrap();
        let fixture = Fixture::new(dir.path());
        let mut manager = fixture.manager(10);
        let e0 = manager.write_new_epoch(0).unwrap();
        fixture.event();
        let e1 = {
            let mut writer = fixture.writer.lock().unwrap();
            append_epoch(&mut writer, 1, e0.epoch_position)
        };

        let kept = manager.try_truncate_before(e0.epoch_position + 1).unwrap();
        assert_eq!(kept, Some(e0.clone()));

        assert!(matches!(
            manager.add_epoch_to_cache(e1.clone()),
            Err(Error::Fenced(_))
        ));
        assert!(matches!(manager.cache_epoch(e1.clone()), Err(Error::Fenced(_))));
        assert!(matches!(manager.get_epoch_after(0, false), Err(Error::Fenced(_))));
        assert!(matches!(
            manager.is_correct_epoch_at(e0.epoch_position, 0, e0.epoch_id),
            Err(Error::Fenced(_))
        ));
        let mut history = EpochHistory::new(vec![e0.clone(), e1.clone()]);
        assert!(matches!(
            manager.get_epoch_after_in(0, &mut history, false),
            Err(Error::Fenced(_))
        ));
        assert_eq!(fixture.db.checkpoints().epoch.read(), FENCED_EPOCH_POSITION);

        let mut fresh = EpochManager::new(
            Arc::clone(&fixture.db),
            Arc::clone(&fixture.writer),
            10,
            Uuid::new_v4(),
            Publisher::noop(),
        );
        assert!(matches!(fresh.init(), Err(Error::Fenced(_))));
    }

    #[test]
    fn test_restart_after_truncation_recovers_kept_epoch() {
        let dir = tempdir().unwrap();
        let (kept, cut) = {
            let fixture = Fixture::new(dir.path());
            let mut manager = fixture.manager(10);
            manager.write_new_epoch(0).unwrap();
            fixture.event();
            let e1 = manager.write_new_epoch(1).unwrap();
            fixture.event();
            let e2 = manager.write_new_epoch(2).unwrap();

            let kept = manager.try_truncate_before(e2.epoch_position).unwrap().unwrap();
            assert_eq!(kept, e1);
            fixture.db.checkpoints().truncate.write(e2.epoch_position);
            fixture.db.checkpoints().truncate.flush().unwrap();
            (kept, e2.epoch_position)
        };

        let fixture = Fixture::new(dir.path());
        assert_eq!(fixture.db.checkpoints().writer.read(), cut);
        let mut manager = fixture.manager(10);
        assert_eq!(manager.last_epoch(), Some(&kept));
        assert!(manager.write_new_epoch(3).is_ok());
    }
}
