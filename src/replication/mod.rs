//! Replication Module
//!
//! Quorum tracking and the leader–replica replication session.

mod leader;
pub mod protocol;
mod replica;
mod tracker;

pub use leader::{LeaderInput, LeaderService, ReplicaLink, ReplicaRole, SubscriptionInfo};
pub use protocol::{FrameHeader, Message};
pub use replica::{ReplicaAction, ReplicaSession, SessionState};
pub use tracker::{QuorumTracker, TrackerHandle, TrackerMessage, TrackerState};

use tokio::sync::watch;
use uuid::Uuid;

/// Common trait for replication nodes
#[async_trait::async_trait]
pub trait ReplicationNode: Send {
    /// Instance id of this process
    fn instance_id(&self) -> Uuid;

    /// Check if this node is the leader
    fn is_leader(&self) -> bool;

    /// Run until shutdown is signalled or a fatal error occurs
    async fn run(&mut self, shutdown: watch::Receiver<bool>) -> crate::Result<()>;
}
