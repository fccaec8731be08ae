//! Transaction Log Module
//!
//! Chunked, append-only log addressed by byte position, plus the
//! checkpoints that describe how much of it is durable, fenced and
//! quorum-confirmed.

mod bulk;
mod chunk;
mod reader;
pub mod record;
mod writer;

pub use bulk::{ChunkBulkReader, DataBulk, RawBulk};
pub use chunk::{Chunk, ChunkFooter, ChunkHeader, CHUNK_FOOTER_SIZE, CHUNK_HEADER_SIZE};
pub use reader::LogReader;
pub use record::{LogRecord, PrepareRecord};
pub use writer::{LogWriter, SharedWriter, WriteOutcome};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, FileCheckpoint, SharedCheckpoint};
use crate::config::WolfLogConfig;
use crate::epoch::FENCED_EPOCH_POSITION;
use crate::error::{Error, Result};

/// Data directory structure
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub base_dir: PathBuf,
}

impl LogPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Directory holding chunk files
    pub fn chunk_dir(&self) -> PathBuf {
        self.base_dir.join("chunks")
    }

    /// Get path for a chunk file
    pub fn chunk_path(&self, start_number: i32, end_number: i32) -> PathBuf {
        self.chunk_dir()
            .join(format!("chunk-{:06}.{:06}", start_number, end_number))
    }

    /// Scratch file used while a raw chunk is being received
    pub fn temp_chunk_path(&self, start_number: i32) -> PathBuf {
        self.chunk_dir().join(format!("chunk-{:06}.tmp", start_number))
    }

    /// Get path for a checkpoint file
    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.chk", name))
    }

    /// Ensure data directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.chunk_dir())
    }
}

/// The checkpoints of one database
#[derive(Clone)]
pub struct Checkpoints {
    /// Highest flushed log position
    pub writer: SharedCheckpoint,
    /// Position of the newest epoch record
    pub epoch: SharedCheckpoint,
    /// Highest quorum-confirmed position
    pub replication: SharedCheckpoint,
    /// Pending truncation position, -1 when none
    pub truncate: SharedCheckpoint,
}

impl Checkpoints {
    fn open(paths: &LogPaths, fsync: bool) -> Result<Self> {
        let open = |name: &str, initial: i64| -> Result<SharedCheckpoint> {
            let checkpoint = FileCheckpoint::open(paths.checkpoint_path(name), name, initial, fsync)?;
            Ok(Arc::new(checkpoint))
        };

        Ok(Self {
            writer: open("writer", 0)?,
            epoch: open("epoch", -1)?,
            replication: open("replication", -1)?,
            truncate: open("truncate", -1)?,
        })
    }
}

/// An opened database: chunk files plus checkpoints
pub struct ChunkDb {
    paths: LogPaths,
    chunk_size: i64,
    fsync: bool,
    checkpoints: Checkpoints,
}

impl ChunkDb {
    /// Open (or create) a database, applying any pending truncation
    pub fn open(data_dir: impl AsRef<Path>, chunk_size: u64, fsync: bool) -> Result<Self> {
        let paths = LogPaths::new(data_dir.as_ref().to_path_buf());
        paths.ensure_dirs()?;

        // Leftovers from interrupted raw chunk transfers
        for entry in std::fs::read_dir(paths.chunk_dir())? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
                tracing::warn!("Removing incomplete chunk transfer {}", path.display());
                std::fs::remove_file(&path)?;
            }
        }

        let checkpoints = Checkpoints::open(&paths, fsync)?;
        let db = Self {
            paths,
            chunk_size: chunk_size as i64,
            fsync,
            checkpoints,
        };

        db.apply_pending_truncation()?;

        tracing::info!(
            "Opened log at {} (writer {}, epoch {}, replication {})",
            db.paths.base_dir.display(),
            db.checkpoints.writer.read(),
            db.checkpoints.epoch.read(),
            db.checkpoints.replication.read()
        );

        Ok(db)
    }

    /// Open the database described by a node configuration
    pub fn from_config(config: &WolfLogConfig) -> Result<Self> {
        Self::open(config.data_dir(), config.log.chunk_size, config.log.fsync)
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    pub fn checkpoints(&self) -> &Checkpoints {
        &self.checkpoints
    }

    pub fn chunk_size(&self) -> i64 {
        self.chunk_size
    }

    pub fn fsync(&self) -> bool {
        self.fsync
    }

    /// Chunk number holding a logical position
    pub fn chunk_number(&self, position: i64) -> i32 {
        (position / self.chunk_size) as i32
    }

    /// Find the chunk file covering a logical position
    pub fn find_chunk(&self, position: i64) -> Result<Option<PathBuf>> {
        let number = self.chunk_number(position);
        let found = chunk::list_chunks(&self.paths.chunk_dir())?
            .into_iter()
            .find(|(start, end, _)| *start <= number && number <= *end)
            .map(|(_, _, path)| path);
        Ok(found)
    }

    /// Open the chunk covering a logical position
    pub fn open_chunk(&self, position: i64) -> Result<Chunk> {
        match self.find_chunk(position)? {
            Some(path) => Chunk::open(path),
            None => Err(Error::ChunkNotFound(position)),
        }
    }

    /// Remove every byte at or after `position`.
    ///
    /// Chunks starting at or after the position are deleted and the chunk
    /// containing it is cut back (and reopened if it was completed).
    pub fn cut_at(&self, position: i64) -> Result<()> {
        for (start, _, path) in chunk::list_chunks(&self.paths.chunk_dir())? {
            if start as i64 * self.chunk_size >= position {
                tracing::warn!("Removing chunk {} beyond position {}", path.display(), position);
                std::fs::remove_file(&path)?;
            }
        }

        if let Some(path) = self.find_chunk(position)? {
            let mut chunk = Chunk::open(path)?;
            let local = position - chunk.header().chunk_start_position();
            if chunk.data_size() < local {
                return Err(Error::LogCorrupted {
                    position,
                    reason: format!("chunk holds only {} bytes", chunk.data_size()),
                });
            }
            if chunk.data_size() > local || chunk.is_completed() {
                tracing::warn!(
                    "Cutting chunk {} back to {} bytes",
                    chunk.path().display(),
                    local
                );
                chunk.truncate_data(local)?;
            }
        }

        Ok(())
    }

    /// Perform a truncation recorded by a previous process
    fn apply_pending_truncation(&self) -> Result<()> {
        let position = self.checkpoints.truncate.read();
        if position < 0 {
            return Ok(());
        }

        tracing::warn!(
            "Truncating log from {} to {}",
            self.checkpoints.writer.read(),
            position
        );

        self.cut_at(position)?;

        self.checkpoints.writer.write(position);
        self.checkpoints.writer.flush()?;

        let epoch = self.checkpoints.epoch.read();
        if epoch == FENCED_EPOCH_POSITION || epoch >= position {
            // Forces the epoch manager to rediscover the newest surviving epoch
            self.checkpoints.epoch.write(-1);
            self.checkpoints.epoch.flush()?;
        }

        if self.checkpoints.replication.read() > position {
            self.checkpoints.replication.write(position);
            self.checkpoints.replication.flush()?;
        }

        self.checkpoints.truncate.write(-1);
        self.checkpoints.truncate.flush()?;

        Ok(())
    }
}
