//! Checkpoints
//!
//! A checkpoint is a named, durable `i64` log position. Writes are staged
//! in memory and only become visible to `read()` once flushed.

mod file;

pub use file::FileCheckpoint;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;

/// Shared handle to any checkpoint implementation
pub type SharedCheckpoint = Arc<dyn Checkpoint>;

/// A persisted monotonic position marker
pub trait Checkpoint: Send + Sync {
    /// Checkpoint name (e.g. "writer")
    fn name(&self) -> &str;

    /// Stage a new value; not durable until `flush`
    fn write(&self, position: i64);

    /// Make the last written value durable and notify subscribers
    fn flush(&self) -> Result<()>;

    /// Last flushed value
    fn read(&self) -> i64;

    /// Last written value, flushed or not
    fn read_non_flushed(&self) -> i64;

    /// Observe flushed values
    fn subscribe(&self) -> watch::Receiver<i64>;
}

/// State shared by every checkpoint implementation
struct CheckpointCell {
    name: String,
    last: AtomicI64,
    last_flushed: AtomicI64,
    flushed_tx: watch::Sender<i64>,
}

impl CheckpointCell {
    fn new(name: &str, initial: i64) -> Self {
        let (flushed_tx, _) = watch::channel(initial);
        Self {
            name: name.to_string(),
            last: AtomicI64::new(initial),
            last_flushed: AtomicI64::new(initial),
            flushed_tx,
        }
    }

    fn write(&self, position: i64) {
        self.last.store(position, Ordering::SeqCst);
    }

    fn staged(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    fn flushed(&self) -> i64 {
        self.last_flushed.load(Ordering::SeqCst)
    }

    fn mark_flushed(&self, position: i64) {
        self.last_flushed.store(position, Ordering::SeqCst);
        self.flushed_tx.send_replace(position);
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.flushed_tx.subscribe()
    }
}

/// Checkpoint that lives only in memory
pub struct InMemoryCheckpoint {
    cell: CheckpointCell,
}

impl InMemoryCheckpoint {
    pub fn new(name: &str, initial: i64) -> Self {
        Self {
            cell: CheckpointCell::new(name, initial),
        }
    }

    /// Convenience constructor returning a shared handle
    pub fn shared(name: &str, initial: i64) -> SharedCheckpoint {
        Arc::new(Self::new(name, initial))
    }
}

impl Checkpoint for InMemoryCheckpoint {
    fn name(&self) -> &str {
        &self.cell.name
    }

    fn write(&self, position: i64) {
        self.cell.write(position);
    }

    fn flush(&self) -> Result<()> {
        self.cell.mark_flushed(self.cell.staged());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_is_invisible_until_flush() {
        let checkpoint = InMemoryCheckpoint::new("writer", 0);
        checkpoint.write(4096);

        assert_eq!(checkpoint.read(), 0);
        assert_eq!(checkpoint.read_non_flushed(), 4096);

        checkpoint.flush().unwrap();
        assert_eq!(checkpoint.read(), 4096);
    }

    #[tokio::test]
    async fn test_flush_notifies_subscribers() {
        let checkpoint = InMemoryCheckpoint::new("replication", -1);
        let mut rx = checkpoint.subscribe();

        checkpoint.write(100);
        checkpoint.flush().unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 100);
    }
}
