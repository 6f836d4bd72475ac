use std::fmt::Display;

use super::config::ChunkId;

/// A specialized error type for log operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The provided chunk size is invalid.
    #[error("invalid chunk size: expected {0}, found {1}")]
    InvalidChunkSize(u64, u64),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A record could not be parsed or is corrupted.
    #[error("corrupted record: {0}")]
    CorruptedRecord(String),
    /// Data corruption detected in a chunk or checkpoint.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Chunk is full and cannot accept the record.
    #[error("chunk full: usable capacity {0}")]
    ChunkFull(u64),
    /// A record is larger than the usable capacity of any chunk.
    #[error("record of {0} bytes exceeds chunk capacity {1}")]
    RecordTooLarge(u64, u64),
    /// A record field is longer than its frame-format length field can hold.
    #[error("record field {field} of {len} bytes exceeds encodable maximum {max}")]
    OversizedRecordField {
        field: &'static str,
        len: usize,
        max: usize,
    },
    /// Chunk roll coordination failed.
    #[error("chunk roll failed: {0}")]
    RollFailed(String),
    /// Chunk not present in the managed collection.
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkId),
    /// Checkpoint flush did not reach stable storage.
    #[error("checkpoint {name} flush failed: {source}")]
    CheckpointFlush {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// A chunk-level transform rejected the stored bytes.
    #[error("transform error: {0}")]
    Transform(String),
    /// Epoch cache or chain violated a monotonicity invariant.
    #[error("epoch invariant violated: {0}")]
    EpochInvariant(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Internal error (lock poisoning, etc.).
    #[error("internal error: {0}")]
    InternalError(String),
}

impl LogError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InternalError(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for log operations.
pub type LogResult<T> = Result<T, LogError>;
