//! The sole appender. Serializes records into the active chunk, rolls to the
//! next chunk when a record does not fit, and advances the writer checkpoint
//! only after the bytes have physically landed.
//!
//! Single-writer discipline: callers serialize through one `LogWriter` (the
//! methods take `&mut self`). Durability is amortized: `append` leaves bytes
//! in the page cache and the checkpoint buffered; `flush` is the caller's
//! latency/throughput knob and makes everything up to the current position
//! durable.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::chaser::ChaserWaker;
use super::checkpoint::Checkpoint;
use super::error::{LogError, LogResult};
use super::manager::ChunkManager;
use super::record::{LogRecord, encode_frame};

const FLUSH_RETRY_LIMIT: u32 = 5;
const FLUSH_RETRY_BASE_DELAY: Duration = Duration::from_millis(2);
const FLUSH_RETRY_MAX_DELAY: Duration = Duration::from_millis(50);

pub struct LogWriter {
    manager: Arc<ChunkManager>,
    checkpoint: Arc<Checkpoint>,
    waker: Option<ChaserWaker>,
}

impl LogWriter {
    pub fn new(manager: Arc<ChunkManager>, checkpoint: Arc<Checkpoint>) -> Self {
        Self {
            manager,
            checkpoint,
            waker: None,
        }
    }

    /// Wires the chaser's wake signal; appended records are announced so the
    /// chaser need not wait for its poll interval.
    pub fn set_chaser_waker(&mut self, waker: ChaserWaker) {
        self.waker = Some(waker);
    }

    /// Current end-of-log position (buffered, not necessarily durable).
    pub fn position(&self) -> u64 {
        self.checkpoint.read()
    }

    /// Appends a record, returning the log position it landed at.
    ///
    /// The record's `log_position` field is assigned here; whatever the
    /// caller put there is overwritten.
    pub fn append(&mut self, record: LogRecord) -> LogResult<u64> {
        self.append_positioned(|position| record.clone().with_log_position(position))
    }

    /// Appends a record built from its own final position.
    ///
    /// Needed for records that serialize their position into the payload
    /// (epoch records): a roll moves the position, so the record is rebuilt
    /// for the retry rather than written stale.
    pub fn append_positioned(
        &mut self,
        build: impl Fn(u64) -> LogRecord,
    ) -> LogResult<u64> {
        let mut rolled = false;
        loop {
            let chunk = self.manager.active_chunk()?;
            let position = chunk.end_position();
            let frame = encode_frame(&build(position))?;
            match chunk.try_append(&frame)? {
                Some(result) => {
                    let end = chunk.start_position() + result.logical_size as u64;
                    self.checkpoint.write(end);
                    if let Some(waker) = &self.waker {
                        waker.wake();
                    }
                    trace!(position, end, bytes = frame.len(), "appended record");
                    return Ok(position);
                }
                None if !rolled => {
                    // A record never spans two chunks; seal this one and
                    // retry exactly once in the successor.
                    debug!(
                        chunk = chunk.id().as_u64(),
                        remaining = chunk.capacity() - chunk.current_size(),
                        needed = frame.len(),
                        "record does not fit, rolling chunk"
                    );
                    self.manager.roll_chunk()?;
                    rolled = true;
                }
                None => {
                    return Err(LogError::RollFailed(format!(
                        "record of {} bytes does not fit a fresh chunk",
                        frame.len()
                    )));
                }
            }
        }
    }

    /// Makes everything appended so far durable: chunk bytes first, then the
    /// writer checkpoint, so the checkpoint never points past durable data.
    pub fn flush(&mut self) -> LogResult<()> {
        let manager = self.manager.clone();
        flush_with_retry("active chunk", || manager.flush_active())?;
        self.checkpoint.flush()
    }
}

/// Runs a flush, retrying transient I/O errors with bounded backoff.
pub(crate) fn flush_with_retry(
    target: &str,
    mut op: impl FnMut() -> LogResult<()>,
) -> LogResult<()> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(err) if attempt < FLUSH_RETRY_LIMIT && is_retryable_io_error(&err) => {
                let delay = retry_backoff_delay(attempt);
                warn!(
                    target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "flush failed, retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn retry_backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1u32 << attempt.min(16);
    FLUSH_RETRY_BASE_DELAY
        .saturating_mul(multiplier)
        .min(FLUSH_RETRY_MAX_DELAY)
}

fn is_retryable_io_error(err: &LogError) -> bool {
    let LogError::Io(io_err) = err else {
        return false;
    };
    if matches!(
        io_err.kind(),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    matches!(io_err.raw_os_error(), Some(code) if code == libc::EINTR || code == libc::EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSet;
    use crate::config::{ChunkId, LogConfig};
    use crate::fs::Layout;
    use crate::record::{EpochRecord, LogRecord, single_prepare};
    use crate::config::NO_POSITION;
    use tempfile::TempDir;

    fn setup(dir: &std::path::Path) -> (Arc<ChunkManager>, CheckpointSet) {
        let config = LogConfig::for_tests(dir);
        let layout = Layout::new(dir);
        layout.ensure_dirs().expect("dirs");
        let checkpoints = CheckpointSet::open(&layout).expect("checkpoints");
        let manager = Arc::new(ChunkManager::open(&config, &checkpoints).expect("open"));
        (manager, checkpoints)
    }

    fn writer_for(manager: &Arc<ChunkManager>, checkpoints: &CheckpointSet) -> LogWriter {
        LogWriter::new(manager.clone(), checkpoints.writer.clone())
    }

    #[test]
    fn append_returns_position_and_advances_checkpoint() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = setup(tmp.path());
        let mut writer = writer_for(&manager, &checkpoints);

        let first = writer
            .append(single_prepare("s", "E", b"a".to_vec(), 0).into())
            .expect("append");
        assert_eq!(first, 0);
        let second = writer
            .append(single_prepare("s", "E", b"b".to_vec(), 0).into())
            .expect("append");
        assert!(second > first);
        assert_eq!(writer.position(), manager.end_position());

        let (record, _) = manager
            .read_record_at(second)
            .expect("read")
            .expect("present");
        assert_eq!(record.log_position(), second);
    }

    #[test]
    fn append_rolls_when_record_does_not_fit() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = setup(tmp.path());
        let mut writer = writer_for(&manager, &checkpoints);
        let chunk_size = manager.chunk_size();

        // Fill most of chunk 0, then append a record bigger than the rest.
        writer
            .append(single_prepare("s", "E", vec![0u8; chunk_size as usize - 512], 0).into())
            .expect("filler");
        let position = writer
            .append(single_prepare("s", "E", vec![1u8; 1024], 0).into())
            .expect("spill");

        assert_eq!(manager.chunk_count(), 2);
        assert!(position >= chunk_size, "record must land in chunk 1");
        assert!(
            manager
                .chunk(ChunkId::new(0))
                .expect("chunk 0")
                .is_completed()
        );
        // Record lands entirely within chunk 1.
        let (record, next) = manager
            .read_record_at(position)
            .expect("read")
            .expect("present");
        assert!(next <= 2 * chunk_size);
        assert_eq!(record.log_position(), position);
    }

    #[test]
    fn oversized_record_is_rejected_without_rolling() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = setup(tmp.path());
        let mut writer = writer_for(&manager, &checkpoints);
        let too_big = vec![0u8; manager.chunk_size() as usize + 1];
        assert!(matches!(
            writer.append(single_prepare("s", "E", too_big, 0).into()),
            Err(LogError::RecordTooLarge(_, _))
        ));
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn oversized_field_fails_append_without_moving_position() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = setup(tmp.path());
        let mut writer = writer_for(&manager, &checkpoints);
        // A stream id longer than its length field can carry must be rejected
        // up front, never written with a lying length prefix.
        let stream_id = "s".repeat(70_000);
        assert!(matches!(
            writer.append(single_prepare(stream_id, "E", b"x".to_vec(), 0).into()),
            Err(LogError::OversizedRecordField {
                field: "stream_id",
                ..
            })
        ));
        assert_eq!(writer.position(), 0);
        assert_eq!(manager.end_position(), 0);
    }

    #[test]
    fn positioned_append_rebuilds_record_after_roll() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = setup(tmp.path());
        let mut writer = writer_for(&manager, &checkpoints);
        let chunk_size = manager.chunk_size();

        writer
            .append(single_prepare("s", "E", vec![0u8; chunk_size as usize - 128], 0).into())
            .expect("filler");
        // An epoch record serializes its own position; after the roll it
        // must carry the chunk-1 position, not the stale chunk-0 one.
        let position = writer
            .append_positioned(|pos| {
                LogRecord::Epoch(EpochRecord {
                    log_position: pos,
                    epoch_number: 0,
                    epoch_position: pos,
                    previous_epoch_position: NO_POSITION,
                    leader_instance_id: 1,
                    timestamp_ms: 0,
                })
            })
            .expect("epoch");
        assert!(position >= chunk_size);
        match manager
            .read_record_at(position)
            .expect("read")
            .expect("present")
            .0
        {
            LogRecord::Epoch(epoch) => assert_eq!(epoch.epoch_position, position),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn flush_makes_checkpoint_durable() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let (manager, checkpoints) = setup(tmp.path());
            let mut writer = writer_for(&manager, &checkpoints);
            writer
                .append(single_prepare("s", "E", b"durable".to_vec(), 0).into())
                .expect("append");
            assert_eq!(checkpoints.writer.read_flushed(), 0);
            writer.flush().expect("flush");
            assert_eq!(checkpoints.writer.read_flushed(), writer.position());
        }
        let (_, checkpoints) = setup(tmp.path());
        assert!(checkpoints.writer.read_flushed() > 0);
    }

    #[test]
    fn flush_retries_transient_errors() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = setup(tmp.path());
        let mut writer = writer_for(&manager, &checkpoints);
        writer
            .append(single_prepare("s", "E", b"x".to_vec(), 0).into())
            .expect("append");

        manager
            .active_chunk()
            .expect("active")
            .inject_flush_error(2);
        writer.flush().expect("flush succeeds after retries");
        assert_eq!(checkpoints.writer.read_flushed(), writer.position());
    }

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(retry_backoff_delay(0), Duration::from_millis(2));
        assert_eq!(retry_backoff_delay(1), Duration::from_millis(4));
        assert_eq!(retry_backoff_delay(10), FLUSH_RETRY_MAX_DELAY);
    }
}
