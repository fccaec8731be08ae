//! WolfLog - Quorum-Replicated Transaction Log
//!
//! An append-only transaction log stored as fixed-size chunk files, kept
//! consistent across a cluster by one leader streaming it to replicas.
//!
//! # Architecture
//!
//! The leader appends records and fences every leadership era with an
//! epoch record. Replicas subscribe with the epochs they already hold; the
//! leader works out where their logs diverge and streams from there, as
//! logical data or as whole chunk files. Follower acknowledgements feed a
//! quorum tracker that advances the replication checkpoint.
//!
//! # Features
//!
//! - Chunked log with durable writer, epoch and replication checkpoints
//! - Epoch chain with a bounded in-memory window and log fallback
//! - Majority quorum tracking of follower acknowledgements
//! - Divergence detection with fenced truncation on restart
//! - Raw transfer of completed chunks to lagging replicas

pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod epoch;
pub mod error;
pub mod log;
pub mod network;
pub mod node;
pub mod replication;

pub use config::WolfLogConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfLogConfig;
    pub use crate::epoch::{EpochManager, EpochRecord};
    pub use crate::error::{Error, Result};
    pub use crate::log::{ChunkDb, LogReader, LogRecord, LogWriter};
    pub use crate::node::{LeaderNode, ReplicaNode};
    pub use crate::replication::{Message, ReplicationNode};
}
