//! File-backed checkpoint: a single little-endian `i64`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::watch;

use super::{Checkpoint, CheckpointCell};
use crate::error::{Error, Result};

/// Size of a checkpoint file in bytes
const CHECKPOINT_SIZE: usize = 8;

/// Checkpoint persisted to its own file
pub struct FileCheckpoint {
    cell: CheckpointCell,
    path: PathBuf,
    file: Mutex<File>,
    fsync: bool,
}

impl FileCheckpoint {
    /// Open a checkpoint file, creating it with `initial` when missing
    pub fn open(path: impl AsRef<Path>, name: &str, initial: i64, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let value = if exists {
            let mut bytes = [0u8; CHECKPOINT_SIZE];
            file.read_exact(&mut bytes).map_err(|e| Error::Checkpoint {
                name: name.to_string(),
                reason: format!("unreadable checkpoint file {}: {}", path.display(), e),
            })?;
            i64::from_le_bytes(bytes)
        } else {
            file.write_all(&initial.to_le_bytes())?;
            file.sync_all()?;
            initial
        };

        tracing::debug!("Opened checkpoint {} at {}", name, value);

        Ok(Self {
            cell: CheckpointCell::new(name, value),
            path,
            file: Mutex::new(file),
            fsync,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn write(&self, position: i64) {
        self.cell.write(position);
    }

    fn flush(&self) -> Result<()> {
        let value = self.cell.staged();
        if value == self.cell.flushed() {
            return Ok(());
        }

        {
            let mut file = self.file.lock().map_err(|_| Error::Checkpoint {
                name: self.cell.name.clone(),
                reason: "file lock poisoned".into(),
            })?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&value.to_le_bytes())?;
            if self.fsync {
                file.sync_data()?;
            }
        }

        self.cell.mark_flushed(value);
        Ok(())
    }

    fn read(&self) -> i64 {
        self.cell.flushed()
    }

    fn read_non_flushed(&self) -> i64 {
        self.cell.staged()
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.cell.subscribe()
    }
}
