//! Chunk Files
//!
//! A chunk holds a fixed logical range of the log. Layout on disk:
//! `[header 64][data ...][footer 32]`, where the footer is only present
//! once the chunk has been completed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::record::FRAME_OVERHEAD;
use crate::error::{Error, Result};

/// Magic bytes at the start of each chunk file
const CHUNK_MAGIC: &[u8; 8] = b"WOLFCHNK";

/// Magic bytes at the start of the footer
const FOOTER_MAGIC: &[u8; 8] = b"WOLFFOOT";

/// Chunk file version
const CHUNK_VERSION: u32 = 1;

/// Header size in bytes
pub const CHUNK_HEADER_SIZE: usize = 64;

/// Footer size in bytes
pub const CHUNK_FOOTER_SIZE: usize = 32;

/// Chunk file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Logical size of one chunk
    pub chunk_size: i32,
    /// First chunk number covered by this file
    pub chunk_start_number: i32,
    /// Last chunk number covered by this file
    pub chunk_end_number: i32,
    /// Whether the file holds rewritten (scavenged) data
    pub is_scavenged: bool,
    /// Unique id of this physical file
    pub chunk_id: Uuid,
}

impl ChunkHeader {
    /// Header for a fresh single chunk
    pub fn new(chunk_number: i32, chunk_size: i32) -> Self {
        Self {
            chunk_size,
            chunk_start_number: chunk_number,
            chunk_end_number: chunk_number,
            is_scavenged: false,
            chunk_id: Uuid::new_v4(),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE];
        bytes[0..8].copy_from_slice(CHUNK_MAGIC);
        bytes[8..12].copy_from_slice(&CHUNK_VERSION.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.chunk_start_number.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.chunk_end_number.to_le_bytes());
        bytes[24] = self.is_scavenged as u8;
        bytes[25..41].copy_from_slice(self.chunk_id.as_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(Error::Log("Chunk header too short".into()));
        }

        if &bytes[0..8] != CHUNK_MAGIC {
            return Err(Error::Log("Invalid chunk magic bytes".into()));
        }

        let version = read_u32(&bytes[8..12]);
        if version != CHUNK_VERSION {
            return Err(Error::Log(format!("Unsupported chunk version: {}", version)));
        }

        let mut chunk_id = [0u8; 16];
        chunk_id.copy_from_slice(&bytes[25..41]);

        let header = Self {
            chunk_size: read_i32(&bytes[12..16]),
            chunk_start_number: read_i32(&bytes[16..20]),
            chunk_end_number: read_i32(&bytes[20..24]),
            is_scavenged: bytes[24] != 0,
            chunk_id: Uuid::from_bytes(chunk_id),
        };

        if header.chunk_size <= 0 || header.chunk_end_number < header.chunk_start_number {
            return Err(Error::Log(format!("Inconsistent chunk header: {:?}", header)));
        }

        Ok(header)
    }

    /// First logical position covered
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// One past the last logical position covered
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    /// Logical data capacity of the file
    pub fn capacity(&self) -> i64 {
        self.chunk_end_position() - self.chunk_start_position()
    }

    pub fn contains(&self, position: i64) -> bool {
        position >= self.chunk_start_position() && position < self.chunk_end_position()
    }
}

/// Chunk file footer, written on completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFooter {
    /// Bytes of data between header and footer
    pub physical_data_size: i64,
    /// crc32 of header and data
    pub checksum: u32,
}

impl ChunkFooter {
    pub fn to_bytes(&self) -> [u8; CHUNK_FOOTER_SIZE] {
        let mut bytes = [0u8; CHUNK_FOOTER_SIZE];
        bytes[0..8].copy_from_slice(FOOTER_MAGIC);
        bytes[8..16].copy_from_slice(&self.physical_data_size.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Parse a footer; `None` when the bytes are not a footer
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CHUNK_FOOTER_SIZE || &bytes[0..8] != FOOTER_MAGIC {
            return None;
        }

        let mut size = [0u8; 8];
        size.copy_from_slice(&bytes[8..16]);

        Some(Self {
            physical_data_size: i64::from_le_bytes(size),
            checksum: read_u32(&bytes[16..20]),
        })
    }
}

/// A single chunk file
pub struct Chunk {
    /// File path
    path: PathBuf,
    /// File handle
    file: File,
    /// Chunk header
    header: ChunkHeader,
    /// Footer, present once completed
    footer: Option<ChunkFooter>,
    /// Bytes of data written after the header
    data_size: i64,
}

impl Chunk {
    /// Create a new chunk file, replacing any existing file
    pub fn create(path: PathBuf, header: ChunkHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;

        Ok(Self {
            path,
            file,
            header,
            footer: None,
            data_size: 0,
        })
    }

    /// Open an existing chunk file
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; CHUNK_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = ChunkHeader::from_bytes(&header_bytes)?;

        let mut chunk = Self {
            path,
            file,
            header,
            footer: None,
            data_size: 0,
        };
        chunk.refresh()?;

        Ok(chunk)
    }

    /// Re-read file size and footer, picking up writes from other handles
    pub fn refresh(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len() as i64;
        let header_len = CHUNK_HEADER_SIZE as i64;
        let footer_len = CHUNK_FOOTER_SIZE as i64;

        self.footer = None;
        self.data_size = file_len - header_len;

        if file_len >= header_len + footer_len {
            let mut footer_bytes = [0u8; CHUNK_FOOTER_SIZE];
            self.file.seek(SeekFrom::Start((file_len - footer_len) as u64))?;
            self.file.read_exact(&mut footer_bytes)?;

            if let Some(footer) = ChunkFooter::parse(&footer_bytes) {
                if header_len + footer.physical_data_size + footer_len == file_len {
                    self.data_size = footer.physical_data_size;
                    self.footer = Some(footer);
                }
            }
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<&ChunkFooter> {
        self.footer.as_ref()
    }

    pub fn is_completed(&self) -> bool {
        self.footer.is_some()
    }

    /// Bytes of data written
    pub fn data_size(&self) -> i64 {
        self.data_size
    }

    /// Logical bytes still free
    pub fn remaining(&self) -> i64 {
        self.header.capacity() - self.data_size
    }

    /// Total physical size of the file
    pub fn file_size(&self) -> i64 {
        let footer = if self.is_completed() {
            CHUNK_FOOTER_SIZE as i64
        } else {
            0
        };
        CHUNK_HEADER_SIZE as i64 + self.data_size + footer
    }

    /// Append raw data bytes
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.is_completed() {
            return Err(Error::Log(format!(
                "Chunk {} is completed",
                self.path.display()
            )));
        }

        if bytes.len() as i64 > self.remaining() {
            return Err(Error::Log(format!(
                "Chunk full: {} bytes requested, {} remaining",
                bytes.len(),
                self.remaining()
            )));
        }

        self.file
            .seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + self.data_size as u64))?;
        self.file.write_all(bytes)?;
        self.data_size += bytes.len() as i64;

        Ok(())
    }

    /// Read up to `max` data bytes starting at a local offset
    pub fn read_data(&mut self, local_offset: i64, max: usize) -> Result<Vec<u8>> {
        let available = (self.data_size - local_offset).max(0) as usize;
        let len = available.min(max);
        let mut bytes = vec![0u8; len];

        if len > 0 {
            self.file
                .seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + local_offset as u64))?;
            self.file.read_exact(&mut bytes)?;
        }

        Ok(bytes)
    }

    /// Read up to `max` bytes of the physical file
    pub fn read_raw(&mut self, raw_offset: i64, max: usize) -> Result<Vec<u8>> {
        let available = (self.file_size() - raw_offset).max(0) as usize;
        let len = available.min(max);
        let mut bytes = vec![0u8; len];

        if len > 0 {
            self.file.seek(SeekFrom::Start(raw_offset as u64))?;
            self.file.read_exact(&mut bytes)?;
        }

        Ok(bytes)
    }

    /// Read the frame starting at a local offset.
    ///
    /// Returns the payload and the full frame length, or `None` when no
    /// complete frame has been written there yet.
    pub fn read_frame(&mut self, local_offset: i64) -> Result<Option<(Vec<u8>, i64)>> {
        if local_offset + FRAME_OVERHEAD as i64 > self.data_size {
            return Ok(None);
        }

        let prefix = self.read_data(local_offset, 4)?;
        let len = read_u32(&prefix) as i64;
        let frame_len = len + FRAME_OVERHEAD as i64;
        if local_offset + frame_len > self.data_size {
            return Ok(None);
        }

        let frame = self.read_data(local_offset, frame_len as usize)?;
        let payload = self.check_frame(&frame, local_offset)?;

        Ok(Some((payload, frame_len)))
    }

    /// Read the frame that ends at a local offset.
    ///
    /// Returns the payload and the local offset where the frame starts.
    pub fn read_frame_before(&mut self, local_end: i64) -> Result<Option<(Vec<u8>, i64)>> {
        if local_end < FRAME_OVERHEAD as i64 || local_end > self.data_size {
            return Ok(None);
        }

        let suffix = self.read_data(local_end - 4, 4)?;
        let len = read_u32(&suffix) as i64;
        let frame_len = len + FRAME_OVERHEAD as i64;
        let start = local_end - frame_len;
        if start < 0 {
            return Err(self.corrupted(local_end, "frame suffix points before chunk start"));
        }

        let frame = self.read_data(start, frame_len as usize)?;
        let payload = self.check_frame(&frame, start)?;

        Ok(Some((payload, start)))
    }

    fn check_frame(&self, frame: &[u8], local_offset: i64) -> Result<Vec<u8>> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(self.corrupted(local_offset, "frame shorter than its overhead"));
        }

        let len = read_u32(&frame[0..4]) as usize;
        if len != frame.len() - FRAME_OVERHEAD {
            return Err(self.corrupted(local_offset, "frame length prefix and suffix differ"));
        }

        let payload = &frame[4..4 + len];
        let checksum = read_u32(&frame[4 + len..8 + len]);
        let suffix = read_u32(&frame[8 + len..12 + len]) as usize;

        if suffix != len {
            return Err(self.corrupted(local_offset, "frame length prefix and suffix differ"));
        }

        if crc32fast::hash(payload) != checksum {
            return Err(self.corrupted(local_offset, "checksum mismatch"));
        }

        Ok(payload.to_vec())
    }

    fn corrupted(&self, local_offset: i64, reason: &str) -> Error {
        Error::LogCorrupted {
            position: self.header.chunk_start_position() + local_offset,
            reason: reason.to_string(),
        }
    }

    /// Cut data back to `data_size` bytes, removing any footer
    pub fn truncate_data(&mut self, data_size: i64) -> Result<()> {
        self.file.set_len(CHUNK_HEADER_SIZE as u64 + data_size as u64)?;
        self.file.sync_all()?;
        self.footer = None;
        self.data_size = data_size;
        Ok(())
    }

    /// Compute the checksum over header and data
    fn compute_checksum(&mut self) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = CHUNK_HEADER_SIZE as u64 + self.data_size as u64;
        let mut buf = vec![0u8; 64 * 1024];

        self.file.seek(SeekFrom::Start(0))?;
        while remaining > 0 {
            let len = (buf.len() as u64).min(remaining) as usize;
            self.file.read_exact(&mut buf[..len])?;
            hasher.update(&buf[..len]);
            remaining -= len as u64;
        }

        Ok(hasher.finalize())
    }

    /// Seal the chunk by writing the footer
    pub fn complete(&mut self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }

        let footer = ChunkFooter {
            physical_data_size: self.data_size,
            checksum: self.compute_checksum()?,
        };

        self.file
            .seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + self.data_size as u64))?;
        self.file.write_all(&footer.to_bytes())?;
        self.file.sync_all()?;
        self.footer = Some(footer);

        tracing::debug!(
            "Completed chunk {} ({} bytes of data)",
            self.path.display(),
            self.data_size
        );

        Ok(())
    }

    /// Check the footer checksum of a completed chunk
    pub fn verify(&mut self) -> Result<()> {
        let expected = match &self.footer {
            Some(footer) => footer.checksum,
            None => {
                return Err(Error::Log(format!(
                    "Chunk {} has no footer",
                    self.path.display()
                )))
            }
        };

        let actual = self.compute_checksum()?;
        if actual != expected {
            return Err(Error::LogCorrupted {
                position: self.header.chunk_start_position(),
                reason: format!("chunk checksum {:08x} != {:08x}", actual, expected),
            });
        }

        Ok(())
    }

    /// Sync chunk to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[0..4]);
    u32::from_le_bytes(buf)
}

fn read_i32(bytes: &[u8]) -> i32 {
    read_u32(bytes) as i32
}

/// Parse `chunk-<start>.<end>` file names
pub fn parse_chunk_file_name(name: &str) -> Option<(i32, i32)> {
    let rest = name.strip_prefix("chunk-")?;
    let (start, end) = rest.split_once('.')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// List all chunk files in a directory, ordered by start number
pub fn list_chunks(dir: &Path) -> Result<Vec<(i32, i32, PathBuf)>> {
    let mut chunks = Vec::new();

    if !dir.exists() {
        return Ok(chunks);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };

        if let Some((start, end)) = parse_chunk_file_name(name) {
            chunks.push((start, end, path));
        }
    }

    chunks.sort_by_key(|(start, _, _)| *start);
    Ok(chunks)
}
