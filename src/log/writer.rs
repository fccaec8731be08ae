//! Log Writer
//!
//! Single writer for the transaction log. Appends records at the head,
//! moves to a new chunk when a record does not fit, and publishes the
//! durable position through the writer checkpoint on flush.

use std::path::Path;
use std::sync::{Arc, Mutex};

use super::chunk::{Chunk, ChunkHeader};
use super::record::LogRecord;
use super::ChunkDb;
use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};

/// Writer shared between the components that append to the log
pub type SharedWriter = Arc<Mutex<LogWriter>>;

/// Result of a single append attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Record written at `position`; the head is now `next`
    Written { position: i64, next: i64 },
    /// The current chunk was completed; retry at `retry_at`
    ChunkFull { retry_at: i64 },
}

/// Transaction log writer
pub struct LogWriter {
    /// Database the writer appends to
    db: Arc<ChunkDb>,
    /// Active chunk, created lazily at the head
    chunk: Option<Chunk>,
    /// Current head position (may be ahead of the flushed checkpoint)
    position: i64,
}

impl LogWriter {
    /// Open the writer at the flushed writer checkpoint
    pub fn open(db: Arc<ChunkDb>) -> Result<Self> {
        let position = db.checkpoints().writer.read();
        let chunk = Self::open_active(&db, position)?;

        tracing::debug!("Log writer opened at position {}", position);

        Ok(Self {
            db,
            chunk,
            position,
        })
    }

    /// Convenience constructor for a shared writer
    pub fn open_shared(db: Arc<ChunkDb>) -> Result<SharedWriter> {
        Ok(Arc::new(Mutex::new(Self::open(db)?)))
    }

    /// Discard anything past `position` and open the chunk holding it
    fn open_active(db: &ChunkDb, position: i64) -> Result<Option<Chunk>> {
        db.cut_at(position)?;

        match db.find_chunk(position)? {
            Some(path) => Ok(Some(Chunk::open(path)?)),
            None => Ok(None),
        }
    }

    /// Current head position
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Highest flushed position
    pub fn flushed_position(&self) -> i64 {
        self.db.checkpoints().writer.read()
    }

    pub fn db(&self) -> &Arc<ChunkDb> {
        &self.db
    }

    /// Make sure a chunk exists at the head
    fn ensure_chunk(&mut self) -> Result<&mut Chunk> {
        if self.chunk.is_none() {
            let number = self.db.chunk_number(self.position);
            let header = ChunkHeader::new(number, self.db.chunk_size() as i32);
            if header.chunk_start_position() != self.position {
                return Err(Error::LogCorrupted {
                    position: self.position,
                    reason: "chunk holding the writer head is missing".into(),
                });
            }

            let path = self.db.paths().chunk_path(number, number);
            tracing::debug!("Creating chunk {}", path.display());
            self.chunk = Some(Chunk::create(path, header)?);
        }

        self.chunk
            .as_mut()
            .ok_or_else(|| Error::Internal("active chunk missing".into()))
    }

    /// Try to append a record at the head.
    ///
    /// The record must carry the current head position. When it does not
    /// fit in the current chunk the chunk is completed and `ChunkFull` is
    /// returned with the new head; the caller rebuilds and retries.
    pub fn try_append(&mut self, record: &LogRecord) -> Result<WriteOutcome> {
        if record.position() != self.position {
            return Err(Error::Log(format!(
                "Record for position {} appended at head {}",
                record.position(),
                self.position
            )));
        }

        let framed = record.framed()?;
        let chunk = self.ensure_chunk()?;

        if framed.len() as i64 > chunk.remaining() {
            if chunk.data_size() == 0 {
                return Err(Error::Log(format!(
                    "Record of {} bytes does not fit in an empty chunk",
                    framed.len()
                )));
            }
            self.complete_chunk()?;
            return Ok(WriteOutcome::ChunkFull {
                retry_at: self.position,
            });
        }

        chunk.append(&framed)?;
        let position = self.position;
        self.position += framed.len() as i64;
        self.db.checkpoints().writer.write(self.position);

        Ok(WriteOutcome::Written {
            position,
            next: self.position,
        })
    }

    /// Append a record built for the head position, retrying once at the
    /// next chunk. Returns the record position and the new head.
    pub fn append<F>(&mut self, mut build: F) -> Result<(i64, i64)>
    where
        F: FnMut(i64) -> LogRecord,
    {
        for _ in 0..2 {
            match self.try_append(&build(self.position))? {
                WriteOutcome::Written { position, next } => return Ok((position, next)),
                WriteOutcome::ChunkFull { retry_at } => {
                    tracing::debug!("Chunk full, retrying append at {}", retry_at);
                }
            }
        }

        Err(Error::Log("Record could not be placed in a fresh chunk".into()))
    }

    /// Append bytes received from the leader, unchanged
    pub fn append_data_bytes(&mut self, position: i64, bytes: &[u8]) -> Result<()> {
        if position != self.position {
            return Err(Error::Replication(format!(
                "Data for position {} but writer is at {}",
                position, self.position
            )));
        }

        if bytes.is_empty() {
            return Ok(());
        }

        self.ensure_chunk()?.append(bytes)?;
        self.position += bytes.len() as i64;
        self.db.checkpoints().writer.write(self.position);

        Ok(())
    }

    /// Seal the active chunk and move the head to the next chunk
    pub fn complete_chunk(&mut self) -> Result<()> {
        let chunk = self.ensure_chunk()?;
        chunk.complete()?;
        let end = chunk.header().chunk_end_position();

        self.chunk = None;
        self.position = end;
        self.db.checkpoints().writer.write(self.position);

        Ok(())
    }

    /// Install a completed chunk file received as raw bytes.
    ///
    /// The chunk must start at the head; afterwards the head sits at the
    /// end of the installed chunk.
    pub fn install_completed_chunk(&mut self, temp_path: &Path) -> Result<ChunkHeader> {
        let mut received = Chunk::open(temp_path.to_path_buf())?;
        if !received.is_completed() {
            return Err(Error::Replication(format!(
                "Raw chunk {} arrived without footer",
                temp_path.display()
            )));
        }
        received.verify()?;

        let header = received.header().clone();
        if header.chunk_start_position() != self.position {
            return Err(Error::Replication(format!(
                "Raw chunk starts at {} but writer is at {}",
                header.chunk_start_position(),
                self.position
            )));
        }
        drop(received);

        // An empty chunk may already exist at the head
        if let Some(chunk) = self.chunk.take() {
            if chunk.data_size() > 0 {
                return Err(Error::Replication(
                    "Raw chunk would overwrite written data".into(),
                ));
            }
            std::fs::remove_file(chunk.path())?;
        }

        let target = self
            .db
            .paths()
            .chunk_path(header.chunk_start_number, header.chunk_end_number);
        std::fs::rename(temp_path, &target)?;

        self.position = header.chunk_end_position();
        self.db.checkpoints().writer.write(self.position);

        tracing::info!(
            "Installed raw chunk #{}-{} at {}",
            header.chunk_start_number,
            header.chunk_end_number,
            target.display()
        );

        Ok(header)
    }

    /// Make everything up to the head durable
    pub fn flush(&mut self) -> Result<()> {
        if self.db.fsync() {
            if let Some(chunk) = self.chunk.as_ref() {
                chunk.sync()?;
            }
        }

        let checkpoint = &self.db.checkpoints().writer;
        checkpoint.write(self.position);
        checkpoint.flush()
    }

    /// Drop unflushed bytes and move the head back to the flushed position
    pub fn rollback_to_flushed(&mut self) -> Result<()> {
        let flushed = self.flushed_position();
        if flushed == self.position {
            return Ok(());
        }

        tracing::warn!(
            "Rolling writer back from {} to flushed position {}",
            self.position,
            flushed
        );

        self.chunk = None;
        self.chunk = Self::open_active(&self.db, flushed)?;
        self.position = flushed;
        self.db.checkpoints().writer.write(flushed);

        Ok(())
    }

    /// Chunk id of the chunk holding the head, if it exists
    pub fn head_chunk_id(&self) -> Option<uuid::Uuid> {
        self.chunk.as_ref().map(|chunk| chunk.header().chunk_id)
    }
}
