//! WolfLog Error Types

use thiserror::Error;

/// Result type alias for WolfLog operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfLog error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Log errors
    #[error("Log error: {0}")]
    Log(String),

    #[error("Chunk not found for log position {0}")]
    ChunkNotFound(i64),

    #[error("Log corrupted at position {position}: {reason}")]
    LogCorrupted { position: i64, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Checkpoint errors
    #[error("Checkpoint {name} error: {reason}")]
    Checkpoint { name: String, reason: String },

    // Epoch errors
    #[error("Epoch error: {0}")]
    Epoch(String),

    #[error("Epoch {0} not found")]
    EpochNotFound(i64),

    #[error("Epoch manager fenced: {0}")]
    Fenced(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    // Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Not leader")]
    NotLeader,

    #[error("Truncation to {position} pending, restart required")]
    RestartRequired { position: i64 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Replication(_)
        )
    }

    /// Check if the process must stop and be restarted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Fenced(_)
                | Error::InvariantViolation(_)
                | Error::RestartRequired { .. }
                | Error::LogCorrupted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::Network("reset".into()).is_fatal());
        assert!(Error::Fenced("truncated".into()).is_fatal());
        assert!(Error::RestartRequired { position: 10 }.is_fatal());
        assert!(!Error::EpochNotFound(3).is_retryable());
    }
}
