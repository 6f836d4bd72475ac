use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;

use super::error::{LogError, LogResult};
use super::transform::TransformKind;

/// Minimum allowed chunk data capacity (64 KiB).
///
/// Chunks smaller than this lead to excessive rolling and metadata overhead.
const CHUNK_SIZE_MIN_LIMIT: u64 = 64 * 1024; // 64 KiB

/// Maximum allowed chunk data capacity (~4 GiB).
///
/// Limited by u32::MAX so local offsets fit in 32 bits and the whole chunk
/// can be memory mapped.
const CHUNK_SIZE_MAX_LIMIT: u64 = u32::MAX as u64; // ~4 GiB

/// Default chunk data capacity (256 MiB).
const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Default number of epoch records retained in the in-memory cache.
const DEFAULT_EPOCH_CACHE_SIZE: usize = 1000;

/// Default chaser poll interval when no wake signal arrives (milliseconds).
const DEFAULT_CHASER_POLL_INTERVAL_MS: u64 = 10;

/// Sentinel for "no position": used for pointer-valued checkpoints that have
/// never been written and for the previous-epoch back-link of the first epoch.
///
/// The log never reaches this position (it would require a u64::MAX-byte log),
/// so the sentinel cannot collide with a real record position.
pub const NO_POSITION: u64 = u64::MAX;

/// Logical identifier for a chunk file.
///
/// Chunk numbers are dense and monotonically increasing within a log
/// instance; chunk `n` covers logical positions
/// `[n * chunk_size, (n + 1) * chunk_size)`.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// Creates a new chunk ID from a raw u32 value.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the chunk ID as a u32.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the chunk ID as a u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0 as u64
    }

    /// Returns the next chunk ID in sequence.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u32> for ChunkId {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Policy applied when a completed chunk fails footer or hash validation
/// during `ChunkManager::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPolicy {
    /// Refuse to open the log when any completed chunk is suspect.
    FailFast,
    /// Log a warning for the suspect chunk and continue opening.
    Warn,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self::FailFast
    }
}

/// Configuration for a single log instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory holding chunk files and checkpoint files.
    pub dir: PathBuf,
    /// Data capacity of each chunk in bytes (record frames only; the chunk
    /// file itself is larger by the fixed header and footer).
    pub chunk_size: u64,
    /// Validation policy for completed chunks at open time.
    pub verify: VerifyPolicy,
    /// Transform applied below the framing layer of newly created chunks.
    pub transform: TransformKind,
    /// Number of epoch records the EpochManager keeps in memory.
    pub epoch_cache_size: usize,
    /// Chaser fallback poll interval in milliseconds.
    pub chaser_poll_interval_ms: u64,
}

impl LogConfig {
    /// Creates a configuration with defaults rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            verify: VerifyPolicy::default(),
            transform: TransformKind::default(),
            epoch_cache_size: DEFAULT_EPOCH_CACHE_SIZE,
            chaser_poll_interval_ms: DEFAULT_CHASER_POLL_INTERVAL_MS,
        }
    }

    /// Overrides the chunk data capacity.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Overrides the completed-chunk validation policy.
    pub fn with_verify(mut self, policy: VerifyPolicy) -> Self {
        self.verify = policy;
        self
    }

    /// Overrides the chunk transform.
    pub fn with_transform(mut self, transform: TransformKind) -> Self {
        self.transform = transform;
        self
    }

    /// Validates bounds and returns the config, normalizing nothing.
    ///
    /// Unlike size knobs that can be silently clamped, a chunk size outside
    /// the supported range is rejected outright: it changes the position
    /// mapping of every record ever written, so guessing is not acceptable.
    pub fn validated(self) -> LogResult<Self> {
        if self.chunk_size < CHUNK_SIZE_MIN_LIMIT || self.chunk_size > CHUNK_SIZE_MAX_LIMIT {
            return Err(LogError::invalid_config(format!(
                "chunk_size {} outside supported range [{}, {}]",
                self.chunk_size, CHUNK_SIZE_MIN_LIMIT, CHUNK_SIZE_MAX_LIMIT
            )));
        }
        if self.epoch_cache_size == 0 {
            return Err(LogError::invalid_config("epoch_cache_size must be nonzero"));
        }
        if self.chaser_poll_interval_ms == 0 {
            return Err(LogError::invalid_config(
                "chaser_poll_interval_ms must be nonzero",
            ));
        }
        Ok(self)
    }

    /// Small-chunk configuration used across the test suite.
    #[cfg(test)]
    pub(crate) fn for_tests(dir: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::new(dir);
        cfg.chunk_size = CHUNK_SIZE_MIN_LIMIT;
        cfg
    }
}
