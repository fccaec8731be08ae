//! Chunk Bulk Reader
//!
//! Reads one chunk in slices for replication: either logical data bytes
//! (byte-for-byte what the writer appended) or the raw file past the
//! header, footer included. The header travels separately.

use byteorder::{ByteOrder, LittleEndian};

use super::chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
use super::record::FRAME_OVERHEAD;
use super::ChunkDb;
use crate::error::{Error, Result};

/// Slice of logical data
#[derive(Debug, Clone)]
pub struct DataBulk {
    /// Logical position of the first byte
    pub position: i64,
    pub bytes: Vec<u8>,
    /// Last slice of a completed chunk
    pub is_eof: bool,
}

/// Slice of the physical chunk file
#[derive(Debug, Clone)]
pub struct RawBulk {
    /// Offset of the first byte in the file
    pub raw_position: i64,
    pub bytes: Vec<u8>,
    /// Last slice of the file
    pub is_eof: bool,
}

/// Sequential reader over a single chunk
pub struct ChunkBulkReader {
    chunk: Chunk,
    raw: bool,
    /// Logical position for data reads, file offset for raw reads
    position: i64,
}

impl ChunkBulkReader {
    /// Read logical data starting at `position`
    pub fn open_data(db: &ChunkDb, position: i64) -> Result<Self> {
        let chunk = db.open_chunk(position)?;
        Ok(Self {
            chunk,
            raw: false,
            position,
        })
    }

    /// Read the file of the completed chunk covering `position`,
    /// starting right after the header
    pub fn open_raw(db: &ChunkDb, position: i64) -> Result<Self> {
        let chunk = db.open_chunk(position)?;
        if !chunk.is_completed() {
            return Err(Error::Log(format!(
                "Raw read of incomplete chunk {}",
                chunk.path().display()
            )));
        }
        Ok(Self {
            chunk,
            raw: true,
            position: CHUNK_HEADER_SIZE as i64,
        })
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn header(&self) -> &ChunkHeader {
        self.chunk.header()
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// Read whole records, up to `max` bytes, never past `limit` (the
    /// flushed head). A single record larger than `max` is returned whole.
    pub fn read_next_data_bytes(&mut self, max: usize, limit: i64) -> Result<DataBulk> {
        let start = self.chunk.header().chunk_start_position();
        if !self.chunk.is_completed() && self.chunk.data_size() < limit - start {
            self.chunk.refresh()?;
        }

        let local = self.position - start;
        let readable = (self.chunk.data_size().min(limit - start) - local).max(0) as usize;

        let mut bytes = self.chunk.read_data(local, readable.min(max.max(4)))?;
        let mut whole = whole_frames_len(&bytes);
        if whole == 0 {
            if let Some(frame_len) = frame_len_at(&bytes, 0).filter(|len| *len <= readable) {
                bytes = self.chunk.read_data(local, frame_len)?;
                whole = frame_len;
            }
        }
        bytes.truncate(whole);

        let position = self.position;
        self.position += bytes.len() as i64;
        let is_eof =
            self.chunk.is_completed() && self.position - start == self.chunk.data_size();

        Ok(DataBulk {
            position,
            bytes,
            is_eof,
        })
    }

    /// Read up to `max` raw bytes of the file
    pub fn read_next_raw_bytes(&mut self, max: usize) -> Result<RawBulk> {
        let bytes = self.chunk.read_raw(self.position, max)?;
        let raw_position = self.position;
        self.position += bytes.len() as i64;

        Ok(RawBulk {
            raw_position,
            bytes,
            is_eof: self.position == self.chunk.file_size(),
        })
    }
}

/// Length of the frame starting at `offset`, if its length prefix is there
fn frame_len_at(bytes: &[u8], offset: usize) -> Option<usize> {
    let prefix = bytes.get(offset..offset + 4)?;
    Some(LittleEndian::read_u32(prefix) as usize + FRAME_OVERHEAD)
}

/// Length of the longest prefix made of whole frames
fn whole_frames_len(bytes: &[u8]) -> usize {
    let mut offset = 0;
    while let Some(len) = frame_len_at(bytes, offset) {
        if offset + len > bytes.len() {
            break;
        }
        offset += len;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::log::test_support::*;
    use crate::log::LogWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_data_reads_stop_at_limit_on_record_boundaries() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = LogWriter::open(Arc::clone(&db)).unwrap();
        let (_, first_end) = append_event(&mut writer, "a");
        let (_, end) = append_event(&mut writer, "b");

        let mut reader = ChunkBulkReader::open_data(&db, 0).unwrap();

        // Nothing whole below the limit
        let bulk = reader.read_next_data_bytes(8192, 10).unwrap();
        assert_eq!(bulk.position, 0);
        assert!(bulk.bytes.is_empty());

        // Only the first record fits in `max`
        let bulk = reader
            .read_next_data_bytes(first_end as usize + 5, end)
            .unwrap();
        assert_eq!(bulk.bytes.len() as i64, first_end);

        let bulk = reader.read_next_data_bytes(8192, end).unwrap();
        assert_eq!(bulk.position, first_end);
        assert_eq!(bulk.bytes.len() as i64, end - first_end);

        let bulk = reader.read_next_data_bytes(8192, end).unwrap();
        assert!(bulk.bytes.is_empty());
        assert!(!bulk.is_eof);
    }

    #[test]
    fn test_record_larger_than_max_is_read_whole() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = LogWriter::open(Arc::clone(&db)).unwrap();
        let (_, end) = append_event(&mut writer, "a");

        let mut reader = ChunkBulkReader::open_data(&db, 0).unwrap();
        let bulk = reader.read_next_data_bytes(16, end).unwrap();
        assert_eq!(bulk.bytes.len() as i64, end);
    }

    #[test]
    fn test_completed_chunk_reports_eof_once_drained() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = LogWriter::open(Arc::clone(&db)).unwrap();
        let (_, end) = append_event(&mut writer, "a");
        writer.complete_chunk().unwrap();
        writer.flush().unwrap();

        let limit = db.checkpoints().writer.read();
        let mut reader = ChunkBulkReader::open_data(&db, 0).unwrap();
        let bulk = reader.read_next_data_bytes(8192, limit).unwrap();
        assert_eq!(bulk.bytes.len() as i64, end);
        assert!(bulk.is_eof);
    }

    #[test]
    fn test_raw_read_covers_file_after_header() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = LogWriter::open(Arc::clone(&db)).unwrap();
        append_event(&mut writer, "a");
        writer.complete_chunk().unwrap();
        writer.flush().unwrap();

        let mut reader = ChunkBulkReader::open_raw(&db, 0).unwrap();
        let file = std::fs::read(reader.chunk().path()).unwrap();

        let mut collected = file[..CHUNK_HEADER_SIZE].to_vec();
        loop {
            let bulk = reader.read_next_raw_bytes(50).unwrap();
            assert_eq!(bulk.raw_position as usize, collected.len());
            collected.extend_from_slice(&bulk.bytes);
            if bulk.is_eof {
                break;
            }
        }
        assert_eq!(collected, file);
    }
}
