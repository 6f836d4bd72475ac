//! Epoch bookkeeping: a bounded, most-recent-first cache of the epoch record
//! chain, backed by the log itself.
//!
//! Epoch records mark the start of a leadership term and back-link to their
//! predecessor, forming a chain anchored at the epoch checkpoint. The cache
//! answers "what was epoch N" for the recent window; anything older must be
//! read from the log directly. Divergence between a peer's epoch and local
//! history is surfaced, never resolved here: truncation is a higher layer's
//! decision.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::checkpoint::Checkpoint;
use super::config::NO_POSITION;
use super::error::{LogError, LogResult};
use super::manager::ChunkManager;
use super::record::{EpochRecord, FIRST_EPOCH_PREVIOUS_POSITION, LogRecord};
use super::writer::LogWriter;

/// Fresh-log value of [`EpochManager::last_epoch_number`].
pub const NO_EPOCH_NUMBER: i64 = -1;

/// Result of checking a peer's epoch against local history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochValidation {
    /// Same number, same position, same leader: histories agree.
    Consistent,
    /// Same number but different position or leader: the local log must be
    /// truncated back to the last common epoch (caller's decision).
    Diverged {
        local: EpochRecord,
    },
    /// The number is outside the retained window (or ahead of local
    /// history); no verdict without reading the log directly.
    Unknown,
}

/// Cache lookup result; see [`EpochManager::get_epoch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpochLookup {
    Cached(EpochRecord),
    Unknown,
}

pub struct EpochManager {
    manager: Arc<ChunkManager>,
    checkpoint: Arc<Checkpoint>,
    cache_size: usize,
    /// Most recent epoch at the front.
    cache: Mutex<VecDeque<EpochRecord>>,
}

impl EpochManager {
    pub fn new(
        manager: Arc<ChunkManager>,
        checkpoint: Arc<Checkpoint>,
        cache_size: usize,
    ) -> Self {
        Self {
            manager,
            checkpoint,
            cache_size,
            cache: Mutex::new(VecDeque::with_capacity(cache_size.min(64))),
        }
    }

    /// Loads the most recent epochs by walking the back-link chain from the
    /// epoch checkpoint, newest first, until the cache is full or the chain
    /// ends.
    pub fn init(&self) -> LogResult<()> {
        let mut cache = self.cache.lock();
        cache.clear();

        let mut position = self.checkpoint.read();
        if position == NO_POSITION {
            info!("epoch manager initialized on fresh log");
            return Ok(());
        }

        while cache.len() < self.cache_size {
            let (record, _) = self
                .manager
                .read_record_at(position)?
                .ok_or_else(|| {
                    LogError::EpochInvariant(format!(
                        "epoch chain points at position {position} but no record is there"
                    ))
                })?;
            let LogRecord::Epoch(epoch) = record else {
                return Err(LogError::EpochInvariant(format!(
                    "epoch chain points at a non-epoch record at position {position}"
                )));
            };
            if epoch.epoch_position != position {
                return Err(LogError::EpochInvariant(format!(
                    "epoch {} serialized position {} disagrees with its location {position}",
                    epoch.epoch_number, epoch.epoch_position
                )));
            }
            if let Some(newer) = cache.back() {
                if epoch.epoch_number >= newer.epoch_number {
                    return Err(LogError::EpochInvariant(format!(
                        "epoch numbers must strictly decrease walking back: {} then {}",
                        newer.epoch_number, epoch.epoch_number
                    )));
                }
            }
            let previous = epoch.previous_epoch_position;
            cache.push_back(epoch);
            if previous == NO_POSITION {
                break;
            }
            position = previous;
        }

        info!(
            cached = cache.len(),
            last_epoch = cache.front().map(|e| e.epoch_number).unwrap_or(NO_EPOCH_NUMBER),
            "epoch manager initialized"
        );
        Ok(())
    }

    /// The most recent epoch, if any.
    pub fn last_epoch(&self) -> Option<EpochRecord> {
        self.cache.lock().front().cloned()
    }

    /// Number of the most recent epoch; [`NO_EPOCH_NUMBER`] on a fresh log.
    pub fn last_epoch_number(&self) -> i64 {
        self.cache
            .lock()
            .front()
            .map(|epoch| epoch.epoch_number)
            .unwrap_or(NO_EPOCH_NUMBER)
    }

    /// Looks up an epoch by number in the retained window.
    ///
    /// `Unknown` means exactly that: the window has moved past it (or it was
    /// never written), and the caller must read the log to find out which.
    pub fn get_epoch(&self, epoch_number: i64) -> EpochLookup {
        let cache = self.cache.lock();
        cache
            .iter()
            .find(|epoch| epoch.epoch_number == epoch_number)
            .cloned()
            .map(EpochLookup::Cached)
            .unwrap_or(EpochLookup::Unknown)
    }

    /// Checks a received epoch (e.g. from a replication handshake) against
    /// local history.
    pub fn validate_epoch(&self, candidate: &EpochRecord) -> EpochValidation {
        match self.get_epoch(candidate.epoch_number) {
            EpochLookup::Cached(local) => {
                if local.epoch_position == candidate.epoch_position
                    && local.leader_instance_id == candidate.leader_instance_id
                {
                    EpochValidation::Consistent
                } else {
                    EpochValidation::Diverged { local }
                }
            }
            EpochLookup::Unknown => EpochValidation::Unknown,
        }
    }

    /// Writes the next epoch record through the writer and durably anchors
    /// the epoch checkpoint at it. Called once per term, by the new leader.
    ///
    /// The record is flushed before the checkpoint moves, so the checkpoint
    /// never references bytes a crash could take away.
    pub fn write_new_epoch(
        &self,
        writer: &mut LogWriter,
        leader_instance_id: u128,
    ) -> LogResult<EpochRecord> {
        let (epoch_number, previous_epoch_position) = {
            let cache = self.cache.lock();
            match cache.front() {
                Some(last) => (last.epoch_number + 1, last.epoch_position),
                None => (0, FIRST_EPOCH_PREVIOUS_POSITION),
            }
        };
        let timestamp_ms = Utc::now().timestamp_millis() as u64;

        let position = writer.append_positioned(|pos| {
            LogRecord::Epoch(EpochRecord {
                log_position: pos,
                epoch_number,
                epoch_position: pos,
                previous_epoch_position,
                leader_instance_id,
                timestamp_ms,
            })
        })?;
        writer.flush()?;

        self.checkpoint.write(position);
        self.checkpoint.flush()?;

        let record = EpochRecord {
            log_position: position,
            epoch_number,
            epoch_position: position,
            previous_epoch_position,
            leader_instance_id,
            timestamp_ms,
        };
        let mut cache = self.cache.lock();
        cache.push_front(record.clone());
        while cache.len() > self.cache_size {
            let evicted = cache.pop_back();
            if let Some(evicted) = evicted {
                debug!(epoch = evicted.epoch_number, "evicted epoch from cache");
            }
        }
        Ok(record)
    }
}
