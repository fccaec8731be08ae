//! Log Reader
//!
//! Reads records forwards or backwards, never past the flushed writer
//! checkpoint.

use std::sync::Arc;

use super::chunk::Chunk;
use super::record::LogRecord;
use super::ChunkDb;
use crate::checkpoint::Checkpoint;
use crate::epoch::{EpochRecord, EpochSource};
use crate::error::{Error, Result};

/// Positioned reader over the transaction log
pub struct LogReader {
    db: Arc<ChunkDb>,
    position: i64,
    chunk: Option<Chunk>,
}

impl LogReader {
    /// Create a reader positioned at the start of the log
    pub fn new(db: Arc<ChunkDb>) -> Self {
        Self {
            db,
            position: 0,
            chunk: None,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reposition(&mut self, position: i64) {
        self.position = position;
    }

    /// Chunk covering `position`, reusing the cached one when possible
    fn chunk_at(&mut self, position: i64) -> Result<&mut Chunk> {
        let cached = self
            .chunk
            .as_ref()
            .map(|chunk| chunk.header().contains(position))
            .unwrap_or(false);

        if !cached {
            self.chunk = Some(self.db.open_chunk(position)?);
        }

        self.chunk
            .as_mut()
            .ok_or_else(|| Error::Internal("reader chunk missing".into()))
    }

    /// Read the record at the current position and advance past it
    pub fn read_next(&mut self) -> Result<Option<(i64, LogRecord)>> {
        loop {
            let limit = self.db.checkpoints().writer.read();
            let position = self.position;
            if position >= limit {
                return Ok(None);
            }

            let chunk = self.chunk_at(position)?;
            let start = chunk.header().chunk_start_position();
            let local = position - start;

            // Pick up bytes written since the chunk was opened
            if !chunk.is_completed() && chunk.data_size() < limit - start {
                chunk.refresh()?;
            }

            if chunk.is_completed() && local >= chunk.data_size() {
                self.position = chunk.header().chunk_end_position();
                continue;
            }

            return match chunk.read_frame(local)? {
                Some((payload, frame_len)) => {
                    let record = LogRecord::decode(&payload, position)?;
                    self.position = position + frame_len;
                    Ok(Some((position, record)))
                }
                None => Err(Error::LogCorrupted {
                    position,
                    reason: "flushed data holds no complete record".into(),
                }),
            };
        }
    }

    /// Read the record ending at the current position and move before it
    pub fn read_prev(&mut self) -> Result<Option<(i64, LogRecord)>> {
        loop {
            let position = self.position;
            if position <= 0 {
                return Ok(None);
            }

            let chunk = self.chunk_at(position - 1)?;
            let start = chunk.header().chunk_start_position();
            let local_end = (position - start).min(chunk.data_size());

            if local_end == 0 {
                self.position = start;
                continue;
            }

            return match chunk.read_frame_before(local_end)? {
                Some((payload, local_start)) => {
                    let record_pos = start + local_start;
                    let record = LogRecord::decode(&payload, record_pos)?;
                    self.position = record_pos;
                    Ok(Some((record_pos, record)))
                }
                None => Err(Error::LogCorrupted {
                    position,
                    reason: "no record ends here".into(),
                }),
            };
        }
    }

    /// Read the record starting exactly at `position`
    pub fn read_at(&mut self, position: i64) -> Result<LogRecord> {
        self.reposition(position);
        match self.read_next()? {
            Some((found, record)) if found == position => Ok(record),
            _ => Err(Error::LogCorrupted {
                position,
                reason: "no record starts here".into(),
            }),
        }
    }
}

impl EpochSource for LogReader {
    fn read_epoch_at(&mut self, position: i64) -> Result<EpochRecord> {
        match self.read_at(position)? {
            LogRecord::Epoch(epoch) => Ok(epoch),
            other => Err(Error::Epoch(format!(
                "Record at {} is not an epoch: {:?}",
                position, other
            ))),
        }
    }

    fn find_last_epoch(&mut self) -> Result<Option<EpochRecord>> {
        self.reposition(self.db.checkpoints().writer.read());
        while let Some((_, record)) = self.read_prev()? {
            if let LogRecord::Epoch(epoch) = record {
                return Ok(Some(epoch));
            }
        }
        Ok(None)
    }
}
