//! Log Record Types
//!
//! Records are hand-encoded little-endian payloads wrapped in a frame:
//! `[len u32][payload][crc32 u32][len u32]`. The trailing length lets
//! readers walk the log backwards.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use uuid::Uuid;

use crate::epoch::EpochRecord;
use crate::error::{Error, Result};

/// Bytes added around every payload
pub const FRAME_OVERHEAD: usize = 12;

/// Stream the epoch information event is written to
pub const EPOCH_INFORMATION_STREAM: &str = "$epoch-information";

/// Event type of the epoch information event
pub const EPOCH_INFORMATION_EVENT_TYPE: &str = "$epoch-information";

const TAG_EPOCH: u8 = 1;
const TAG_PREPARE: u8 = 2;

/// Prepare flag: data is JSON
pub const PREPARE_FLAG_JSON: u8 = 0x01;

/// A single event appended to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    pub log_position: i64,
    pub event_id: Uuid,
    pub stream: String,
    pub expected_version: i64,
    pub event_type: String,
    pub flags: u8,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl PrepareRecord {
    /// Build a JSON event at the given position
    pub fn json(
        log_position: i64,
        stream: &str,
        expected_version: i64,
        event_type: &str,
        data: Vec<u8>,
    ) -> Self {
        Self {
            log_position,
            event_id: Uuid::new_v4(),
            stream: stream.to_string(),
            expected_version,
            event_type: event_type.to_string(),
            flags: PREPARE_FLAG_JSON,
            timestamp: Utc::now().trunc_subsecs(3),
            data,
            metadata: Vec::new(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.flags & PREPARE_FLAG_JSON != 0
    }
}

/// Any record stored in the transaction log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Start of a leadership era
    Epoch(EpochRecord),
    /// Stream event
    Prepare(PrepareRecord),
}

impl LogRecord {
    /// Log position the record claims to live at
    pub fn position(&self) -> i64 {
        match self {
            LogRecord::Epoch(epoch) => epoch.epoch_position,
            LogRecord::Prepare(prepare) => prepare.log_position,
        }
    }

    pub fn as_epoch(&self) -> Option<&EpochRecord> {
        match self {
            LogRecord::Epoch(epoch) => Some(epoch),
            _ => None,
        }
    }

    /// Encode the record payload (without frame)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);

        match self {
            LogRecord::Epoch(epoch) => {
                buf.write_u8(TAG_EPOCH)?;
                buf.write_i64::<LittleEndian>(epoch.epoch_position)?;
                buf.write_i64::<LittleEndian>(epoch.epoch_number)?;
                buf.extend_from_slice(epoch.epoch_id.as_bytes());
                buf.write_i64::<LittleEndian>(epoch.prev_epoch_position)?;
                buf.extend_from_slice(epoch.leader_instance_id.as_bytes());
                buf.write_i64::<LittleEndian>(epoch.timestamp.timestamp_millis())?;
            }
            LogRecord::Prepare(prepare) => {
                buf.write_u8(TAG_PREPARE)?;
                buf.write_i64::<LittleEndian>(prepare.log_position)?;
                buf.extend_from_slice(prepare.event_id.as_bytes());
                write_short_string(&mut buf, &prepare.stream)?;
                buf.write_i64::<LittleEndian>(prepare.expected_version)?;
                write_short_string(&mut buf, &prepare.event_type)?;
                buf.write_u8(prepare.flags)?;
                buf.write_i64::<LittleEndian>(prepare.timestamp.timestamp_millis())?;
                write_blob(&mut buf, &prepare.data)?;
                write_blob(&mut buf, &prepare.metadata)?;
            }
        }

        Ok(buf)
    }

    /// Decode a payload read at `position`
    pub fn decode(payload: &[u8], position: i64) -> Result<Self> {
        let record = decode_payload(payload).map_err(|e| Error::LogCorrupted {
            position,
            reason: format!("undecodable record: {}", e),
        })?;

        if record.position() != position {
            return Err(Error::LogCorrupted {
                position,
                reason: format!("record claims position {}", record.position()),
            });
        }

        Ok(record)
    }

    /// Encode the record wrapped in its frame
    pub fn framed(&self) -> Result<Vec<u8>> {
        Ok(frame(&self.encode()?))
    }
}

/// Wrap a payload in a checksummed frame
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf
}

fn write_short_string(buf: &mut Vec<u8>, value: &str) -> std::io::Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "string longer than 65535 bytes",
        ));
    }
    buf.write_u16::<LittleEndian>(bytes.len() as u16)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_blob(buf: &mut Vec<u8>, value: &[u8]) -> std::io::Result<()> {
    buf.write_u32::<LittleEndian>(value.len() as u32)?;
    buf.extend_from_slice(value);
    Ok(())
}

fn decode_payload(payload: &[u8]) -> std::io::Result<LogRecord> {
    let mut cursor = Cursor::new(payload);

    let record = match cursor.read_u8()? {
        TAG_EPOCH => {
            let epoch_position = cursor.read_i64::<LittleEndian>()?;
            let epoch_number = cursor.read_i64::<LittleEndian>()?;
            let epoch_id = read_uuid(&mut cursor)?;
            let prev_epoch_position = cursor.read_i64::<LittleEndian>()?;
            let leader_instance_id = read_uuid(&mut cursor)?;
            let timestamp = read_timestamp(&mut cursor)?;
            LogRecord::Epoch(EpochRecord {
                epoch_position,
                epoch_number,
                epoch_id,
                prev_epoch_position,
                leader_instance_id,
                timestamp,
            })
        }
        TAG_PREPARE => LogRecord::Prepare(PrepareRecord {
            log_position: cursor.read_i64::<LittleEndian>()?,
            event_id: read_uuid(&mut cursor)?,
            stream: read_short_string(&mut cursor)?,
            expected_version: cursor.read_i64::<LittleEndian>()?,
            event_type: read_short_string(&mut cursor)?,
            flags: cursor.read_u8()?,
            timestamp: read_timestamp(&mut cursor)?,
            data: read_blob(&mut cursor)?,
            metadata: read_blob(&mut cursor)?,
        }),
        tag => {
            return Err(invalid(format!("unknown record tag {}", tag)));
        }
    };

    if cursor.position() as usize != payload.len() {
        return Err(invalid("trailing bytes after record".to_string()));
    }

    Ok(record)
}

fn read_uuid(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Uuid> {
    let mut bytes = [0u8; 16];
    cursor.read_exact(&mut bytes)?;
    Ok(Uuid::from_bytes(bytes))
}

fn read_timestamp(cursor: &mut Cursor<&[u8]>) -> std::io::Result<DateTime<Utc>> {
    let millis = cursor.read_i64::<LittleEndian>()?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| invalid(format!("timestamp {} out of range", millis)))
}

fn read_short_string(cursor: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| invalid(e.to_string()))
}

fn read_blob(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(invalid(format!("blob of {} bytes exceeds payload", len)));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn invalid(reason: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, reason)
}
