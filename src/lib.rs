//! Durable storage core for a single-node event-sourcing log.
//!
//! The crate wires together an append-only chunked transaction log with
//! crash-safe checkpoints, a chase-the-writer confirmation pipeline, and the
//! epoch bookkeeping used to validate continuation after restart or
//! failover. Higher layers (indexing, replication, stream semantics) consume
//! the writer, reader, chaser, and epoch APIs exposed here.
//!
//! The moving parts, in write order:
//!
//! - [`LogWriter`] appends framed records into the active [`chunk`] and
//!   advances the writer [`Checkpoint`].
//! - The [`chaser`] follows that checkpoint, re-reads the newly durable
//!   bytes, and raises [`ChaseEvent`]s in exact log order.
//! - [`EpochManager`] maintains the back-linked epoch chain anchored at the
//!   epoch checkpoint.
//!
//! Each log instance owns its own [`CheckpointSet`]; nothing is
//! process-global, so multiple logs can coexist in one process.

pub mod chaser;
pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod epoch;
pub mod error;
pub mod fs;
pub mod manager;
pub mod record;
pub mod transform;
pub mod writer;

pub use chaser::{
    ChannelConsumer, ChaseConsumer, ChaseEvent, Chaser, ChaserHandle, ChaserWaker, spawn_chaser,
};
pub use checkpoint::{
    CHASER_CHECKPOINT, Checkpoint, CheckpointSet, EPOCH_CHECKPOINT, INDEX_CHECKPOINT,
    REPLICATION_CHECKPOINT, STREAM_EXISTENCE_FILTER_CHECKPOINT, TRUNCATE_CHECKPOINT,
    WRITER_CHECKPOINT,
};
pub use chunk::{Chunk, ChunkAppendResult, ChunkFooter, ChunkHeaderInfo, ChunkScan};
pub use config::{ChunkId, LogConfig, NO_POSITION, VerifyPolicy};
pub use epoch::{EpochLookup, EpochManager, EpochValidation, NO_EPOCH_NUMBER};
pub use error::{LogError, LogResult};
pub use fs::{CHECKPOINT_FILE_EXTENSION, CHUNK_FILE_EXTENSION, ChunkFileName, Layout};
pub use manager::{ChunkLocalPosition, ChunkManager, SequentialReader};
pub use record::{
    CommitRecord, EpochRecord, FIRST_EPOCH_PREVIOUS_POSITION, FrameOutcome, LogRecord,
    PrepareFlags, PrepareRecord, RecordType, SystemRecord, encode_frame, read_frame,
    single_prepare,
};
pub use transform::{ChunkTransform, TransformKind};
pub use writer::LogWriter;
