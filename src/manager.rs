//! Owns the ordered chunk collection: recovery at open, position
//! translation, rolling, and cross-chunk sequential reads.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::checkpoint::CheckpointSet;
use super::chunk::{Chunk, ChunkScan};
use super::config::{ChunkId, LogConfig, VerifyPolicy};
use super::error::{LogError, LogResult};
use super::fs::Layout;
use super::record::LogRecord;
use super::transform::TransformKind;

/// A logical log position resolved to its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocalPosition {
    pub chunk_id: ChunkId,
    pub local_offset: u32,
}

/// The chunk collection of one log instance.
///
/// Chunk `n` owns logical positions `[n * chunk_size, (n + 1) * chunk_size)`.
/// A completed chunk may leave part of that range unused (a record that did
/// not fit); those positions are skipped, never reassigned.
pub struct ChunkManager {
    layout: Layout,
    chunk_size: u64,
    transform: TransformKind,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    active: ArcSwapOption<Chunk>,
}

impl ChunkManager {
    /// Opens the chunk collection under `config.dir`, running crash recovery
    /// and reconciling the writer checkpoint with what is actually on disk.
    ///
    /// Every chunk but the last must be completed; the last chunk may carry a
    /// torn tail from a crash mid-append, which is discarded here. A flushed
    /// writer checkpoint pointing past the recovered end of the log means
    /// durable data went missing and fails the open; a chaser checkpoint past
    /// the end merely recorded confirmations for bytes that were lost, and is
    /// clamped back so confirmation restarts from the recovered end.
    pub fn open(config: &LogConfig, checkpoints: &CheckpointSet) -> LogResult<Self> {
        let config = config.clone().validated()?;
        let layout = Layout::new(&config.dir);
        layout.ensure_dirs()?;

        let ids = layout.list_chunks()?;
        for (index, id) in ids.iter().enumerate() {
            if id.as_u32() as usize != index {
                return Err(LogError::corruption(format!(
                    "chunk sequence has a gap: expected chunk {index}, found chunk {id}"
                )));
            }
        }

        let manager = Self {
            layout,
            chunk_size: config.chunk_size,
            transform: config.transform,
            chunks: RwLock::new(Vec::with_capacity(ids.len().max(1))),
            active: ArcSwapOption::from(None),
        };

        if ids.is_empty() {
            let first = manager.create_chunk(ChunkId::new(0))?;
            manager.chunks.write().push(first.clone());
            manager.active.store(Some(first));
            info!(dir = %config.dir.display(), "initialized empty log");
        } else {
            manager.recover(&ids, config.verify)?;
        }

        let end = manager.end_position();
        let flushed = checkpoints.writer.read_flushed();
        if flushed > end {
            return Err(LogError::corruption(format!(
                "writer checkpoint {flushed} points past recovered log end {end}"
            )));
        }
        // Fully framed records past the flushed checkpoint survived the crash
        // on their own merit; adopt them.
        checkpoints.writer.write(end);
        checkpoints.writer.flush()?;
        let chased = checkpoints.chaser.read();
        if chased > end {
            // The chaser flushes its checkpoint every cycle while chunk bytes
            // and the writer checkpoint flush on the amortized cadence, so a
            // crash in that window leaves the chaser pointing at bytes that
            // did not survive. Pull it back and let it re-confirm from the
            // recovered end.
            warn!(
                chaser = chased,
                end, "chaser checkpoint ahead of recovered log end, clamping"
            );
            checkpoints.chaser.reset_to(end)?;
        }
        Ok(manager)
    }

    fn recover(&self, ids: &[ChunkId], verify: VerifyPolicy) -> LogResult<()> {
        let last_index = ids.len() - 1;
        let mut chunks = self.chunks.write();
        for (index, id) in ids.iter().enumerate() {
            let path = self.layout.chunk_path(*id);
            let mut scan = Chunk::scan(&path)?;
            self.check_geometry(*id, &scan)?;

            if index < last_index {
                let footer = scan.footer.as_ref().ok_or_else(|| {
                    LogError::corruption(format!(
                        "chunk {id} has no footer but is followed by chunk {}",
                        ids[index + 1]
                    ))
                })?;
                let suspect = footer.content_hash != scan.computed_hash
                    || footer.physical_size != scan.logical_size;
                if suspect {
                    match verify {
                        VerifyPolicy::FailFast => {
                            return Err(LogError::corruption(format!(
                                "chunk {id} failed validation: footer says {} bytes hash {:#010x}, scan found {} bytes hash {:#010x}",
                                footer.physical_size,
                                footer.content_hash,
                                scan.logical_size,
                                scan.computed_hash
                            )));
                        }
                        VerifyPolicy::Warn => {
                            warn!(
                                chunk = id.as_u64(),
                                footer_size = footer.physical_size,
                                scanned_size = scan.logical_size,
                                "completed chunk failed validation, continuing per policy"
                            );
                        }
                    }
                }
            } else if scan.truncated {
                Chunk::truncate_tail(&path, &mut scan)?;
            }

            chunks.push(Arc::new(Chunk::from_recovered(&path, &scan)?));
        }
        drop(chunks);

        let last = {
            let chunks = self.chunks.read();
            chunks[last_index].clone()
        };
        if last.is_completed() {
            // Crash landed between completing a chunk and creating its
            // successor; finish the roll now.
            let next = self.create_chunk(last.id().next())?;
            self.chunks.write().push(next.clone());
            self.active.store(Some(next));
        } else {
            self.active.store(Some(last));
        }

        let chunks = self.chunks.read();
        info!(
            chunks = chunks.len(),
            end_position = self.end_position(),
            "recovered log"
        );
        Ok(())
    }

    fn check_geometry(&self, id: ChunkId, scan: &ChunkScan) -> LogResult<()> {
        let expected_start = id.as_u64() * self.chunk_size;
        if scan.header.chunk_id != id {
            return Err(LogError::corruption(format!(
                "chunk file {id} carries header for chunk {}",
                scan.header.chunk_id
            )));
        }
        if scan.header.start_position != expected_start {
            return Err(LogError::corruption(format!(
                "chunk {id} header start {} does not match expected {expected_start}",
                scan.header.start_position
            )));
        }
        if scan.header.capacity as u64 != self.chunk_size {
            return Err(LogError::InvalidChunkSize(
                self.chunk_size,
                scan.header.capacity as u64,
            ));
        }
        Ok(())
    }

    fn create_chunk(&self, id: ChunkId) -> LogResult<Arc<Chunk>> {
        let chunk = Chunk::create_active(
            id,
            id.as_u64() * self.chunk_size,
            self.chunk_size as u32,
            Utc::now().timestamp_millis(),
            self.transform.build(),
            &self.layout.chunk_path(id),
        )?;
        Ok(Arc::new(chunk))
    }

    /// The currently appendable chunk.
    pub fn active_chunk(&self) -> LogResult<Arc<Chunk>> {
        self.active
            .load_full()
            .ok_or_else(|| LogError::invalid_state("no active chunk"))
    }

    /// Number of chunks, completed plus active.
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Logical end of the written log (start of where the next record goes).
    pub fn end_position(&self) -> u64 {
        match self.active.load_full() {
            Some(chunk) => chunk.end_position(),
            None => 0,
        }
    }

    /// Seals the active chunk and installs its successor.
    ///
    /// Positions between the sealed chunk's last record and the successor's
    /// start are dead; the writer checkpoint jumps over them.
    pub fn roll_chunk(&self) -> LogResult<Arc<Chunk>> {
        let active = self.active_chunk()?;
        active
            .complete(Utc::now().timestamp_millis())
            .map_err(|err| LogError::RollFailed(format!("completing chunk {}: {err}", active.id())))?;
        let next = self.create_chunk(active.id().next())?;
        self.chunks.write().push(next.clone());
        self.active.store(Some(next.clone()));
        info!(
            sealed = active.id().as_u64(),
            active = next.id().as_u64(),
            start_position = next.start_position(),
            "rolled chunk"
        );
        Ok(next)
    }

    /// Maps a logical position to its owning chunk and local offset.
    pub fn translate_position(&self, position: u64) -> LogResult<ChunkLocalPosition> {
        let chunk_id = position / self.chunk_size;
        if chunk_id > u32::MAX as u64 {
            return Err(LogError::invalid_state(format!(
                "position {position} outside addressable chunk range"
            )));
        }
        Ok(ChunkLocalPosition {
            chunk_id: ChunkId::new(chunk_id as u32),
            local_offset: (position % self.chunk_size) as u32,
        })
    }

    /// Fetches a chunk by id.
    pub fn chunk(&self, id: ChunkId) -> LogResult<Arc<Chunk>> {
        self.chunks
            .read()
            .get(id.as_u32() as usize)
            .cloned()
            .ok_or(LogError::ChunkNotFound(id))
    }

    /// Reads the record at a logical position, returning it together with
    /// the position just past its frame.
    ///
    /// `Ok(None)` means no record starts there: past the written end, in a
    /// completed chunk's dead tail, or at a torn live tail.
    pub fn read_record_at(&self, position: u64) -> LogResult<Option<(LogRecord, u64)>> {
        let resolved = self.translate_position(position)?;
        let chunk = match self.chunk(resolved.chunk_id) {
            Ok(chunk) => chunk,
            Err(LogError::ChunkNotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        match chunk.read_record(resolved.local_offset)? {
            Some((record, next_local)) => {
                Ok(Some((record, chunk.start_position() + next_local as u64)))
            }
            None => Ok(None),
        }
    }

    /// True when a complete record frame starts at `position`.
    pub fn exists_at(&self, position: u64) -> bool {
        matches!(self.read_record_at(position), Ok(Some(_)))
    }

    /// Flushes the active chunk's written bytes to stable storage.
    pub fn flush_active(&self) -> LogResult<()> {
        self.active_chunk()?.flush_to_disk()
    }

    /// A fresh independent sequential cursor starting at `from`. Any number
    /// of cursors may exist concurrently.
    pub fn sequential_reader(self: &Arc<Self>, from: u64) -> SequentialReader {
        SequentialReader::new(self.clone(), from)
    }

    /// Configured data capacity per chunk.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

/// Forward cursor over records, hopping chunk boundaries (including the dead
/// tail a roll leaves behind).
pub struct SequentialReader {
    manager: Arc<ChunkManager>,
    position: u64,
}

impl SequentialReader {
    pub fn new(manager: Arc<ChunkManager>, from: u64) -> Self {
        Self {
            manager,
            position: from,
        }
    }

    /// Current logical position (start of the next unread record).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Re-anchors the cursor (after a caller-driven catch-up or truncation).
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Reads the next record strictly below `limit`.
    ///
    /// Returns `Ok(None)` when the cursor has caught up; the cursor does not
    /// move in that case, so the caller can retry after the limit advances.
    pub fn try_read_next(&mut self, limit: u64) -> LogResult<Option<LogRecord>> {
        loop {
            if self.position >= limit {
                return Ok(None);
            }
            let resolved = self.manager.translate_position(self.position)?;
            let chunk = match self.manager.chunk(resolved.chunk_id) {
                Ok(chunk) => chunk,
                Err(LogError::ChunkNotFound(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            match chunk.read_record(resolved.local_offset)? {
                Some((record, next_local)) => {
                    self.position = chunk.start_position() + next_local as u64;
                    return Ok(Some(record));
                }
                None => {
                    // A completed chunk with no record here means we are in
                    // its dead tail; hop to the next chunk's start.
                    if chunk.is_completed() && resolved.local_offset >= chunk.current_size() {
                        self.position = (resolved.chunk_id.as_u64() + 1) * self.manager.chunk_size();
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSet;
    use crate::chunk::CHUNK_HEADER_SIZE;
    use crate::record::{LogRecord, encode_frame, single_prepare};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn open_all(dir: &std::path::Path) -> (ChunkManager, CheckpointSet) {
        let config = LogConfig::for_tests(dir);
        let layout = Layout::new(dir);
        layout.ensure_dirs().expect("dirs");
        let checkpoints = CheckpointSet::open(&layout).expect("checkpoints");
        let manager = ChunkManager::open(&config, &checkpoints).expect("open");
        (manager, checkpoints)
    }

    fn append_event(manager: &ChunkManager, data: &[u8]) -> u64 {
        let active = manager.active_chunk().expect("active");
        let frame = encode_frame(&single_prepare("s", "E", data.to_vec(), 0).into()).expect("encode");
        let result = active
            .try_append(&frame)
            .expect("append")
            .expect("fits");
        active.start_position() + result.local_offset as u64
    }

    #[test]
    fn fresh_open_creates_first_chunk() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, checkpoints) = open_all(tmp.path());
        assert_eq!(manager.chunk_count(), 1);
        assert_eq!(manager.end_position(), 0);
        assert_eq!(checkpoints.writer.read(), 0);
        let active = manager.active_chunk().expect("active");
        assert_eq!(active.id(), ChunkId::new(0));
        assert_eq!(active.start_position(), 0);
    }

    #[test]
    fn roll_completes_and_advances() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, _) = open_all(tmp.path());
        append_event(&manager, b"before roll");
        let end_before = manager.end_position();

        let next = manager.roll_chunk().expect("roll");
        assert_eq!(next.id(), ChunkId::new(1));
        assert_eq!(next.start_position(), manager.chunk_size());
        assert_eq!(manager.chunk_count(), 2);
        assert!(manager.chunk(ChunkId::new(0)).expect("chunk 0").is_completed());
        // Dead tail: positions between old end and new start hold nothing.
        assert!(!manager.exists_at(end_before));
        assert_eq!(manager.end_position(), next.start_position());
    }

    #[test]
    fn translate_position_maps_into_chunks() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, _) = open_all(tmp.path());
        let size = manager.chunk_size();
        let resolved = manager.translate_position(size + 10).expect("translate");
        assert_eq!(resolved.chunk_id, ChunkId::new(1));
        assert_eq!(resolved.local_offset, 10);
        let zero = manager.translate_position(0).expect("translate");
        assert_eq!(zero.chunk_id, ChunkId::new(0));
        assert_eq!(zero.local_offset, 0);
    }

    #[test]
    fn reopen_recovers_records_and_reconciles_writer() {
        let tmp = TempDir::new().expect("tempdir");
        let pos;
        let end;
        {
            let (manager, checkpoints) = open_all(tmp.path());
            pos = append_event(&manager, b"durable");
            manager.flush_active().expect("flush");
            end = manager.end_position();
            // Writer checkpoint deliberately left behind at 0.
            drop(checkpoints);
        }
        let (manager, checkpoints) = open_all(tmp.path());
        assert_eq!(manager.end_position(), end);
        assert_eq!(checkpoints.writer.read_flushed(), end);
        let (record, _) = manager
            .read_record_at(pos)
            .expect("read")
            .expect("present");
        match record {
            LogRecord::Prepare(p) => assert_eq!(p.data, b"durable"),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn reopen_after_roll_continues_in_new_chunk() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let (manager, _) = open_all(tmp.path());
            append_event(&manager, b"one");
            manager.roll_chunk().expect("roll");
            append_event(&manager, b"two");
            manager.flush_active().expect("flush");
        }
        let (manager, _) = open_all(tmp.path());
        assert_eq!(manager.chunk_count(), 2);
        let active = manager.active_chunk().expect("active");
        assert_eq!(active.id(), ChunkId::new(1));
        assert!(!active.is_completed());
    }

    #[test]
    fn reopen_with_completed_last_chunk_creates_successor() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let (manager, _) = open_all(tmp.path());
            append_event(&manager, b"sealed");
            manager
                .active_chunk()
                .expect("active")
                .complete(Utc::now().timestamp_millis())
                .expect("complete");
            // Crash before the successor chunk was created.
        }
        let (manager, _) = open_all(tmp.path());
        assert_eq!(manager.chunk_count(), 2);
        assert_eq!(manager.active_chunk().expect("active").id(), ChunkId::new(1));
    }

    #[test]
    fn writer_checkpoint_past_log_end_fails_open() {
        let tmp = TempDir::new().expect("tempdir");
        {
            let (_, checkpoints) = open_all(tmp.path());
            checkpoints.writer.write(1_000_000);
            checkpoints.writer.flush().expect("flush");
        }
        let config = LogConfig::for_tests(tmp.path());
        let layout = Layout::new(tmp.path());
        let checkpoints = CheckpointSet::open(&layout).expect("checkpoints");
        assert!(matches!(
            ChunkManager::open(&config, &checkpoints),
            Err(LogError::Corruption(_))
        ));
    }

    #[test]
    fn chaser_checkpoint_ahead_of_log_is_clamped_on_open() {
        let tmp = TempDir::new().expect("tempdir");
        let end_before;
        {
            let (manager, checkpoints) = open_all(tmp.path());
            append_event(&manager, b"confirmed but never durable");
            end_before = manager.end_position();
            // Chaser confirms eagerly and flushes its checkpoint every cycle;
            // the chunk bytes and writer checkpoint stay buffered.
            checkpoints.chaser.write(end_before);
            checkpoints.chaser.flush().expect("flush chaser");
        }
        // The crash loses the appended bytes: zero the chunk's data region.
        let path = Layout::new(tmp.path()).chunk_path(ChunkId::new(0));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("open chunk");
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64)).expect("seek");
        file.write_all(&vec![0u8; end_before as usize]).expect("zero");
        file.sync_all().expect("sync");

        let (manager, checkpoints) = open_all(tmp.path());
        assert_eq!(manager.end_position(), 0);
        assert_eq!(checkpoints.chaser.read(), 0);
        assert_eq!(checkpoints.chaser.read_flushed(), 0);
    }

    #[test]
    fn open_rejects_out_of_range_chunk_size() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        layout.ensure_dirs().expect("dirs");
        let checkpoints = CheckpointSet::open(&layout).expect("checkpoints");
        let tiny = LogConfig::new(tmp.path()).with_chunk_size(512);
        assert!(matches!(
            ChunkManager::open(&tiny, &checkpoints),
            Err(LogError::InvalidConfig(_))
        ));
        let huge = LogConfig::new(tmp.path()).with_chunk_size(u32::MAX as u64 + 1);
        assert!(matches!(
            ChunkManager::open(&huge, &checkpoints),
            Err(LogError::InvalidConfig(_))
        ));
    }

    #[test]
    fn corrupted_completed_chunk_honors_verify_policy() {
        let tmp = TempDir::new().expect("tempdir");
        let frame_len;
        {
            let (manager, _) = open_all(tmp.path());
            let frame =
                encode_frame(&single_prepare("s", "E", vec![7u8; 64], 0).into()).expect("encode");
            frame_len = frame.len();
            manager
                .active_chunk()
                .expect("active")
                .try_append(&frame)
                .expect("append")
                .expect("fits");
            manager.roll_chunk().expect("roll");
        }
        // Flip a payload byte inside the sealed chunk. The frame still
        // parses; only the content hash notices.
        let path = Layout::new(tmp.path()).chunk_path(ChunkId::new(0));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("open chunk");
        file.seek(SeekFrom::Start(CHUNK_HEADER_SIZE as u64 + frame_len as u64 - 17))
            .expect("seek");
        file.write_all(&[0xFF]).expect("flip");
        file.sync_all().expect("sync");

        let layout = Layout::new(tmp.path());
        let checkpoints = CheckpointSet::open(&layout).expect("checkpoints");
        let fail_fast = LogConfig::for_tests(tmp.path());
        assert!(matches!(
            ChunkManager::open(&fail_fast, &checkpoints),
            Err(LogError::Corruption(_))
        ));

        let permissive = LogConfig::for_tests(tmp.path()).with_verify(VerifyPolicy::Warn);
        let manager = ChunkManager::open(&permissive, &checkpoints).expect("open under warn");
        assert_eq!(manager.chunk_count(), 2);
    }

    #[test]
    fn sequential_reader_hops_chunk_boundary() {
        let tmp = TempDir::new().expect("tempdir");
        let (manager, _) = open_all(tmp.path());
        append_event(&manager, b"first");
        append_event(&manager, b"second");
        manager.roll_chunk().expect("roll");
        append_event(&manager, b"third");
        let limit = manager.end_position();

        let manager = Arc::new(manager);
        let mut reader = SequentialReader::new(manager.clone(), 0);
        let mut seen = Vec::new();
        while let Some(record) = reader.try_read_next(limit).expect("read") {
            match record {
                LogRecord::Prepare(p) => seen.push(p.data),
                other => panic!("unexpected record: {other:?}"),
            }
        }
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
        assert_eq!(reader.position(), limit);
        // Caught up: stays put until the limit advances.
        assert!(reader.try_read_next(limit).expect("read").is_none());
    }
}
