//! A single fixed-capacity chunk of the log: memory-mapped file with a fixed
//! header, a run of record frames, and a footer written once when sealed.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crc64fast_nvme::Digest;
use memmap2::{Mmap, MmapMut};
use std::convert::TryInto;
use tracing::debug;

use super::config::ChunkId;
use super::error::{LogError, LogResult};
use super::fs::{create_fixed_size_file, sync_data_unsupported};
use super::record::{FRAME_OVERHEAD, FrameOutcome, LogRecord, MIN_FRAME_SIZE, read_frame};
use super::transform::{ChunkTransform, TransformKind};

pub(crate) const CHUNK_HEADER_SIZE: u32 = 128;
pub(crate) const CHUNK_FOOTER_SIZE: u32 = 64;
const CHUNK_MAGIC: u32 = 0x4843_5645; // "EVCH"
const CHUNK_FOOTER_MAGIC: u32 = 0x4643_5645; // "EVCF"
const CHUNK_FORMAT_VERSION: u16 = 1;

/// Result of appending one frame to the active chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkAppendResult {
    /// Data-region offset the frame starts at.
    pub local_offset: u32,
    /// Data bytes used after the append.
    pub logical_size: u32,
}

/// Header metadata decoded from a chunk file.
#[derive(Debug, Clone)]
pub struct ChunkHeaderInfo {
    pub chunk_id: ChunkId,
    pub start_position: u64,
    pub capacity: u32,
    pub created_at: i64,
    pub transform_tag: u8,
    pub transform_param: u8,
}

/// Footer written when a chunk is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFooter {
    pub chunk_id: ChunkId,
    /// Valid data bytes in the chunk (frames only, excludes header/footer).
    pub physical_size: u32,
    pub record_count: u64,
    /// Folded crc64 over the decoded data region `[0, physical_size)`.
    pub content_hash: u32,
    pub sealed_at: i64,
}

/// Outcome of scanning a chunk file at open time.
#[derive(Debug)]
pub struct ChunkScan {
    pub header: ChunkHeaderInfo,
    pub footer: Option<ChunkFooter>,
    /// Data bytes covered by fully-valid frames.
    pub logical_size: u32,
    pub record_count: u64,
    /// Hash recomputed from the frames actually on disk.
    pub computed_hash: u32,
    /// True when bytes after the last valid frame look like a torn write.
    pub truncated: bool,
}

pub struct Chunk {
    id: ChunkId,
    start_position: u64,
    capacity: u32,
    created_at: i64,
    transform: Arc<dyn ChunkTransform>,

    completed: AtomicBool,
    size: AtomicU32,
    durable_size: AtomicU32,
    record_count: AtomicU64,

    data: ChunkData,
    #[cfg(test)]
    flush_fail_injections: AtomicU32,
}

impl Chunk {
    /// Creates a fresh active chunk file with its header already durable.
    pub fn create_active(
        id: ChunkId,
        start_position: u64,
        capacity: u32,
        created_at: i64,
        transform: Arc<dyn ChunkTransform>,
        path: &Path,
    ) -> LogResult<Self> {
        if capacity < MIN_FRAME_SIZE {
            return Err(LogError::invalid_config(
                "chunk capacity below minimum frame size",
            ));
        }
        let file_size = CHUNK_HEADER_SIZE as u64 + capacity as u64 + CHUNK_FOOTER_SIZE as u64;
        let data = ChunkData::create(path, file_size)?;

        let header = ChunkHeaderInfo {
            chunk_id: id,
            start_position,
            capacity,
            created_at,
            transform_tag: transform.tag(),
            transform_param: transform.param(),
        };
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        encode_header(&header, &mut buf);
        data.write_bytes(0, &buf)?;
        data.flush_and_sync()?;

        Ok(Self {
            id,
            start_position,
            capacity,
            created_at,
            transform,
            completed: AtomicBool::new(false),
            size: AtomicU32::new(0),
            durable_size: AtomicU32::new(0),
            record_count: AtomicU64::new(0),
            data,
            #[cfg(test)]
            flush_fail_injections: AtomicU32::new(0),
        })
    }

    /// Reads only the header of a chunk file.
    pub fn load_header(path: &Path) -> LogResult<ChunkHeaderInfo> {
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        let mut file = File::open(path)?;
        file.read_exact(&mut buf)?;
        decode_header(&buf)
            .ok_or_else(|| LogError::Corruption(format!("invalid chunk header: {}", path.display())))
    }

    /// Scans a chunk file: decodes the header, validates every frame in
    /// order, and reads the footer if one was sealed.
    ///
    /// Bytes after the last fully-valid frame are reported as `truncated`
    /// (torn write) rather than failing the scan; they are the expected
    /// residue of a crash mid-append.
    pub fn scan(path: &Path) -> LogResult<ChunkScan> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < CHUNK_HEADER_SIZE as usize {
            return Err(LogError::Corruption(format!(
                "chunk {} too small for header",
                path.display()
            )));
        }
        let header = decode_header(&mmap[..CHUNK_HEADER_SIZE as usize]).ok_or_else(|| {
            LogError::Corruption(format!("chunk {} has invalid header", path.display()))
        })?;
        let expected_len =
            CHUNK_HEADER_SIZE as u64 + header.capacity as u64 + CHUNK_FOOTER_SIZE as u64;
        if (mmap.len() as u64) < expected_len {
            return Err(LogError::Corruption(format!(
                "chunk {} truncated: expected {} bytes, found {}",
                path.display(),
                expected_len,
                mmap.len()
            )));
        }
        let transform = TransformKind::from_header(header.transform_tag, header.transform_param)?;

        let footer_offset = (CHUNK_HEADER_SIZE + header.capacity) as usize;
        let footer = decode_footer(&mmap[footer_offset..footer_offset + CHUNK_FOOTER_SIZE as usize]);

        // Decode the data region once and walk the frames.
        let data_start = CHUNK_HEADER_SIZE as usize;
        let scan_limit = match &footer {
            Some(f) if f.physical_size <= header.capacity => f.physical_size as usize,
            Some(f) => {
                return Err(LogError::Corruption(format!(
                    "chunk {} footer physical size {} exceeds capacity {}",
                    path.display(),
                    f.physical_size,
                    header.capacity
                )));
            }
            None => header.capacity as usize,
        };
        let mut region = mmap[data_start..data_start + scan_limit].to_vec();
        transform.decode(0, &mut region)?;

        let mut cursor = 0usize;
        let mut record_count = 0u64;
        let mut truncated = false;
        while cursor < region.len() {
            match read_frame(&region[cursor..], header.start_position + cursor as u64)? {
                FrameOutcome::Record { frame_len, .. } => {
                    record_count += 1;
                    cursor += frame_len as usize;
                }
                FrameOutcome::End => break,
                FrameOutcome::TornTail => {
                    truncated = true;
                    break;
                }
            }
        }

        let mut digest = Digest::new();
        digest.write(&region[..cursor]);
        let computed_hash = fold_crc64(digest.sum64());

        Ok(ChunkScan {
            header,
            footer,
            logical_size: cursor as u32,
            record_count,
            computed_hash,
            truncated,
        })
    }

    /// Opens a chunk from a completed recovery scan.
    pub fn from_recovered(path: &Path, scan: &ChunkScan) -> LogResult<Self> {
        let header = &scan.header;
        if scan.logical_size > header.capacity {
            return Err(LogError::Corruption(format!(
                "chunk {} logical size {} exceeds capacity {}",
                path.display(),
                scan.logical_size,
                header.capacity
            )));
        }
        let transform = TransformKind::from_header(header.transform_tag, header.transform_param)?;
        let completed = scan.footer.is_some();
        let file_size =
            CHUNK_HEADER_SIZE as u64 + header.capacity as u64 + CHUNK_FOOTER_SIZE as u64;
        let data = ChunkData::open(path, file_size, !completed)?;

        Ok(Self {
            id: header.chunk_id,
            start_position: header.start_position,
            capacity: header.capacity,
            created_at: header.created_at,
            transform,
            completed: AtomicBool::new(completed),
            size: AtomicU32::new(scan.logical_size),
            // Everything that survived the scan is on disk by definition.
            durable_size: AtomicU32::new(scan.logical_size),
            record_count: AtomicU64::new(scan.record_count),
            data,
            #[cfg(test)]
            flush_fail_injections: AtomicU32::new(0),
        })
    }

    /// Zeroes the torn region after the last valid frame so a reopened
    /// active chunk presents a clean end to appenders and readers.
    pub fn truncate_tail(path: &Path, scan: &mut ChunkScan) -> LogResult<()> {
        let logical = scan.logical_size as usize;
        let capacity = scan.header.capacity as usize;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let data_start = CHUNK_HEADER_SIZE as usize;
        if logical < capacity {
            mmap[data_start + logical..data_start + capacity].fill(0);
        }
        let footer_offset = data_start + capacity;
        mmap[footer_offset..footer_offset + CHUNK_FOOTER_SIZE as usize].fill(0);
        mmap.flush()?;

        debug!(
            chunk = scan.header.chunk_id.as_u64(),
            valid_bytes = logical,
            "discarded torn chunk tail"
        );
        scan.footer = None;
        scan.truncated = false;
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[inline]
    pub fn start_position(&self) -> u64 {
        self.start_position
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.data.path()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Data bytes written so far (live cursor for the active chunk, footer
    /// size for completed ones).
    pub fn current_size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn durable_size(&self) -> u32 {
        self.durable_size.load(Ordering::Acquire)
    }

    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    /// Global position just past the last written frame.
    pub fn end_position(&self) -> u64 {
        self.start_position + self.current_size() as u64
    }

    /// Appends one frame if it fits; all-or-nothing, no partial frames.
    ///
    /// Returns `Ok(None)` when the frame exceeds the remaining capacity (the
    /// caller rolls to the next chunk) and an error when the chunk is not
    /// active or the write itself fails.
    pub fn try_append(&self, frame: &[u8]) -> LogResult<Option<ChunkAppendResult>> {
        if self.is_completed() {
            return Err(LogError::invalid_state("cannot append to completed chunk"));
        }
        let frame_len = frame.len() as u64;
        if frame_len > self.capacity as u64 {
            return Err(LogError::RecordTooLarge(frame_len, self.capacity as u64));
        }

        let offset = self.size.load(Ordering::Acquire);
        let next = offset as u64 + frame_len;
        if next > self.capacity as u64 {
            return Ok(None);
        }
        let next = next as u32;

        let mut encoded = frame.to_vec();
        self.transform.encode(offset, &mut encoded);
        self.data
            .write_bytes((CHUNK_HEADER_SIZE + offset) as usize, &encoded)?;

        self.record_count.fetch_add(1, Ordering::AcqRel);
        self.size.store(next, Ordering::Release);

        Ok(Some(ChunkAppendResult {
            local_offset: offset,
            logical_size: next,
        }))
    }

    /// Reads the record whose frame starts at `local_offset`.
    ///
    /// Returns `Ok(None)` for offsets at or past the known-durable length and
    /// for a torn frame at the live tail; corrupt interior frames are errors.
    pub fn read_record(&self, local_offset: u32) -> LogResult<Option<(LogRecord, u32)>> {
        let limit = self.current_size();
        if local_offset >= limit || limit - local_offset < MIN_FRAME_SIZE {
            return Ok(None);
        }

        let mut prefix = self
            .data
            .copy_out((CHUNK_HEADER_SIZE + local_offset) as usize, 4)?;
        self.transform.decode(local_offset, &mut prefix)?;
        let length = u32::from_le_bytes(
            prefix
                .as_slice()
                .try_into()
                .map_err(|_| LogError::CorruptedRecord("length prefix unreadable".to_string()))?,
        );
        if length == 0 {
            return Ok(None);
        }
        let frame_len = length as u64 + FRAME_OVERHEAD as u64;
        if local_offset as u64 + frame_len > limit as u64 {
            // Tail frame still being written, or a torn write pending
            // truncation at recovery.
            return Ok(None);
        }
        let frame_len = frame_len as u32;

        let mut frame = self
            .data
            .copy_out((CHUNK_HEADER_SIZE + local_offset) as usize, frame_len as usize)?;
        self.transform.decode(local_offset, &mut frame)?;

        match read_frame(&frame, self.start_position + local_offset as u64)? {
            FrameOutcome::Record { record, frame_len } => {
                Ok(Some((record, local_offset + frame_len)))
            }
            FrameOutcome::End | FrameOutcome::TornTail => Ok(None),
        }
    }

    /// True when a fully-framed record starts at `local_offset`.
    ///
    /// Lets cursors distinguish "not yet written" from "corrupt" without an
    /// error path: corrupt interior frames still return false here.
    pub fn exists_at(&self, local_offset: u32) -> bool {
        matches!(self.read_record(local_offset), Ok(Some(_)))
    }

    /// Seals the chunk: computes the content hash, writes the footer, syncs,
    /// and makes the mapping read-only. Callable once.
    pub fn complete(&self, sealed_at: i64) -> LogResult<ChunkFooter> {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LogError::invalid_state("chunk already completed"));
        }

        let result = (|| -> LogResult<ChunkFooter> {
            let physical_size = self.size.load(Ordering::Acquire);
            let footer = ChunkFooter {
                chunk_id: self.id,
                physical_size,
                record_count: self.record_count.load(Ordering::Acquire),
                content_hash: self.compute_content_hash(physical_size)?,
                sealed_at,
            };

            let mut buf = [0u8; CHUNK_FOOTER_SIZE as usize];
            encode_footer(&footer, &mut buf);
            self.data
                .write_bytes((CHUNK_HEADER_SIZE + self.capacity) as usize, &buf)?;
            self.data.flush_and_sync()?;
            self.data.mark_read_only();
            self.durable_size.store(physical_size, Ordering::Release);
            Ok(footer)
        })();

        if result.is_err() {
            self.completed.store(false, Ordering::Release);
        }
        result
    }

    fn compute_content_hash(&self, limit: u32) -> LogResult<u32> {
        if limit == 0 {
            return Ok(0);
        }
        let mut region = self
            .data
            .copy_out(CHUNK_HEADER_SIZE as usize, limit as usize)?;
        self.transform.decode(0, &mut region)?;
        let mut digest = Digest::new();
        digest.write(&region);
        Ok(fold_crc64(digest.sum64()))
    }

    /// Flushes written bytes to stable storage and records them as durable.
    pub fn flush_to_disk(&self) -> LogResult<()> {
        #[cfg(test)]
        {
            let mut remaining = self.flush_fail_injections.load(Ordering::Acquire);
            while remaining > 0 {
                match self.flush_fail_injections.compare_exchange(
                    remaining,
                    remaining - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        return Err(LogError::Io(std::io::Error::from_raw_os_error(libc::EINTR)));
                    }
                    Err(current) => remaining = current,
                }
            }
        }
        let size = self.size.load(Ordering::Acquire);
        self.data.flush_and_sync()?;
        store_max(&self.durable_size, size);
        Ok(())
    }

    #[cfg(test)]
    pub fn inject_flush_error(&self, attempts: u32) {
        self.flush_fail_injections
            .store(attempts, Ordering::Release);
    }
}

fn encode_header(header: &ChunkHeaderInfo, buf: &mut [u8]) {
    assert!(buf.len() >= CHUNK_HEADER_SIZE as usize);
    buf.fill(0);
    buf[0..4].copy_from_slice(&CHUNK_MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&(CHUNK_HEADER_SIZE as u16).to_le_bytes());
    buf[8..12].copy_from_slice(&header.chunk_id.as_u32().to_le_bytes());
    buf[12..20].copy_from_slice(&header.start_position.to_le_bytes());
    buf[20..24].copy_from_slice(&header.capacity.to_le_bytes());
    buf[24..32].copy_from_slice(&header.created_at.to_le_bytes());
    buf[32] = header.transform_tag;
    buf[33] = header.transform_param;
}

fn decode_header(buf: &[u8]) -> Option<ChunkHeaderInfo> {
    if buf.len() < CHUNK_HEADER_SIZE as usize {
        return None;
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    if magic != CHUNK_MAGIC {
        return None;
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().ok()?);
    if version != CHUNK_FORMAT_VERSION {
        return None;
    }
    let header_len = u16::from_le_bytes(buf[6..8].try_into().ok()?);
    if header_len as u32 != CHUNK_HEADER_SIZE {
        return None;
    }
    Some(ChunkHeaderInfo {
        chunk_id: ChunkId::new(u32::from_le_bytes(buf[8..12].try_into().ok()?)),
        start_position: u64::from_le_bytes(buf[12..20].try_into().ok()?),
        capacity: u32::from_le_bytes(buf[20..24].try_into().ok()?),
        created_at: i64::from_le_bytes(buf[24..32].try_into().ok()?),
        transform_tag: buf[32],
        transform_param: buf[33],
    })
}

fn encode_footer(footer: &ChunkFooter, buf: &mut [u8]) {
    assert!(buf.len() >= CHUNK_FOOTER_SIZE as usize);
    buf.fill(0);
    buf[0..4].copy_from_slice(&CHUNK_FOOTER_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&(CHUNK_FORMAT_VERSION as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&footer.chunk_id.as_u32().to_le_bytes());
    buf[12..16].copy_from_slice(&footer.physical_size.to_le_bytes());
    buf[16..24].copy_from_slice(&footer.record_count.to_le_bytes());
    buf[24..28].copy_from_slice(&footer.content_hash.to_le_bytes());
    buf[28..36].copy_from_slice(&footer.sealed_at.to_le_bytes());
    buf[36] = 1; // completion flag
}

fn decode_footer(buf: &[u8]) -> Option<ChunkFooter> {
    if buf.len() < CHUNK_FOOTER_SIZE as usize {
        return None;
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    if magic != CHUNK_FOOTER_MAGIC {
        return None;
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    if version != CHUNK_FORMAT_VERSION as u32 {
        return None;
    }
    if buf[36] != 1 {
        return None;
    }
    Some(ChunkFooter {
        chunk_id: ChunkId::new(u32::from_le_bytes(buf[8..12].try_into().ok()?)),
        physical_size: u32::from_le_bytes(buf[12..16].try_into().ok()?),
        record_count: u64::from_le_bytes(buf[16..24].try_into().ok()?),
        content_hash: u32::from_le_bytes(buf[24..28].try_into().ok()?),
        sealed_at: i64::from_le_bytes(buf[28..36].try_into().ok()?),
    })
}

enum ChunkMap {
    Read(Mmap),
    Write(UnsafeCell<MmapMut>),
}

/// Mapping of one chunk file, shaped around the single-appender invariant.
///
/// All writes come from the one appender thread and land at or past the size
/// cursor; readers only dereference bytes below the cursor, which is
/// published with Release after the copy completes. Written regions are never
/// rewritten, so no lock is needed around the mapping itself. The `File`
/// handle from open/create is retained so syncs reuse the same descriptor.
struct ChunkData {
    path: PathBuf,
    file: File,
    map: ChunkMap,
    file_size: u64,
    writable: AtomicBool,
}

// Safe per the invariant above: reader and writer byte ranges are disjoint,
// ordered by the size cursor's Release/Acquire pair in `Chunk`.
unsafe impl Send for ChunkData {}
unsafe impl Sync for ChunkData {}

impl ChunkData {
    fn create(path: &Path, file_size: u64) -> LogResult<Self> {
        let file = create_fixed_size_file(path, file_size)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() as u64 != file_size {
            return Err(LogError::InvalidChunkSize(file_size, mmap.len() as u64));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map: ChunkMap::Write(UnsafeCell::new(mmap)),
            file_size,
            writable: AtomicBool::new(true),
        })
    }

    fn open(path: &Path, file_size: u64, writable: bool) -> LogResult<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let map = if writable {
            let map = unsafe { MmapMut::map_mut(&file)? };
            if (map.len() as u64) < file_size {
                return Err(LogError::InvalidChunkSize(file_size, map.len() as u64));
            }
            ChunkMap::Write(UnsafeCell::new(map))
        } else {
            let map = unsafe { Mmap::map(&file)? };
            if (map.len() as u64) < file_size {
                return Err(LogError::InvalidChunkSize(file_size, map.len() as u64));
            }
            ChunkMap::Read(map)
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            file_size,
            writable: AtomicBool::new(writable),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn base_ptr(&self) -> *const u8 {
        match &self.map {
            ChunkMap::Read(map) => map.as_ptr(),
            ChunkMap::Write(cell) => unsafe { (*cell.get()).as_ptr() },
        }
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) -> LogResult<()> {
        if offset + bytes.len() > self.file_size as usize {
            return Err(LogError::ChunkFull(self.file_size));
        }
        if !self.writable.load(Ordering::Acquire) {
            return Err(LogError::invalid_state(
                "attempted to write to read-only chunk",
            ));
        }
        let ChunkMap::Write(cell) = &self.map else {
            return Err(LogError::invalid_state("chunk mapped read-only"));
        };
        // Raw-pointer copy: readers may concurrently hold slices into bytes
        // below the cursor, so no &mut to the whole mapping is formed.
        unsafe {
            let base = (*cell.get()).as_mut_ptr();
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset), bytes.len());
        }
        Ok(())
    }

    fn read_slice(&self, range: Range<usize>) -> LogResult<&[u8]> {
        if range.end > self.file_size as usize || range.start > range.end {
            return Err(LogError::ChunkFull(self.file_size));
        }
        unsafe {
            Ok(slice::from_raw_parts(
                self.base_ptr().add(range.start),
                range.len(),
            ))
        }
    }

    fn copy_out(&self, offset: usize, len: usize) -> LogResult<Vec<u8>> {
        Ok(self.read_slice(offset..offset + len)?.to_vec())
    }

    fn flush(&self) -> LogResult<()> {
        match &self.map {
            ChunkMap::Write(cell) => {
                // MmapMut::flush takes &self; msync needs no exclusivity.
                unsafe { &*cell.get() }.flush()?;
                Ok(())
            }
            ChunkMap::Read(_) => Ok(()),
        }
    }

    fn flush_and_sync(&self) -> LogResult<()> {
        self.flush()?;
        match self.file.sync_data() {
            Ok(()) => Ok(()),
            Err(err) if sync_data_unsupported(&err) => Ok(self.file.sync_all()?),
            Err(err) => Err(LogError::from(err)),
        }
    }

    fn mark_read_only(&self) {
        self.writable.store(false, Ordering::Release);
    }
}

pub(crate) fn store_max(cell: &AtomicU32, value: u32) -> u32 {
    let mut current = cell.load(Ordering::Acquire);
    while current < value {
        match cell.compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(prev) => return prev,
            Err(observed) => current = observed,
        }
    }
    current
}

pub(crate) fn fold_crc64(value: u64) -> u32 {
    let upper = (value >> 32) as u32;
    let lower = value as u32;
    upper ^ lower
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_frame, single_prepare};
    use crate::transform::TransformKind;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    const TEST_CAPACITY: u32 = 64 * 1024;

    fn new_chunk(path: &Path, transform: TransformKind) -> Chunk {
        Chunk::create_active(
            ChunkId::new(0),
            0,
            TEST_CAPACITY,
            7,
            transform.build(),
            path,
        )
        .expect("create chunk")
    }

    fn frame_for(data: &[u8]) -> Vec<u8> {
        encode_frame(&single_prepare("stream-a", "Evt", data.to_vec(), 1).into()).expect("encode")
    }

    #[test]
    fn header_is_written_at_creation() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let _chunk = new_chunk(&path, TransformKind::None);
        let header = Chunk::load_header(&path).expect("header");
        assert_eq!(header.chunk_id, ChunkId::new(0));
        assert_eq!(header.capacity, TEST_CAPACITY);
        assert_eq!(header.created_at, 7);
    }

    #[test]
    fn append_then_read_round_trips() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let chunk = new_chunk(&path, TransformKind::None);

        let frame = frame_for(b"payload");
        let result = chunk
            .try_append(&frame)
            .expect("append")
            .expect("fits");
        assert_eq!(result.local_offset, 0);
        assert_eq!(result.logical_size as usize, frame.len());

        let (record, next) = chunk
            .read_record(0)
            .expect("read")
            .expect("present");
        assert_eq!(next as usize, frame.len());
        match record {
            LogRecord::Prepare(p) => assert_eq!(p.data, b"payload"),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(chunk.exists_at(0));
        assert!(!chunk.exists_at(next));
    }

    #[test]
    fn append_past_capacity_is_refused_whole() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let chunk = Chunk::create_active(
            ChunkId::new(0),
            0,
            256,
            0,
            TransformKind::None.build(),
            &path,
        )
        .expect("create");

        let frame = frame_for(&[0u8; 100]);
        assert!(chunk.try_append(&frame).expect("first").is_some());
        // Second identical frame no longer fits; nothing may be written.
        let before = chunk.current_size();
        assert!(chunk.try_append(&frame).expect("second").is_none());
        assert_eq!(chunk.current_size(), before);
    }

    #[test]
    fn complete_writes_footer_and_freezes() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let chunk = new_chunk(&path, TransformKind::None);
        let frame = frame_for(b"sealed");
        chunk.try_append(&frame).expect("append").expect("fits");

        let footer = chunk.complete(99).expect("complete");
        assert_eq!(footer.physical_size as usize, frame.len());
        assert_eq!(footer.record_count, 1);
        assert!(chunk.is_completed());
        assert!(matches!(
            chunk.complete(100),
            Err(LogError::InvalidState(_))
        ));
        assert!(matches!(
            chunk.try_append(&frame),
            Err(LogError::InvalidState(_))
        ));

        let scan = Chunk::scan(&path).expect("scan");
        let scanned_footer = scan.footer.expect("footer");
        assert_eq!(scanned_footer, footer);
        assert_eq!(scan.computed_hash, footer.content_hash);
        assert!(!scan.truncated);
    }

    #[test]
    fn scan_detects_torn_tail() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let chunk = new_chunk(&path, TransformKind::None);
        let frame = frame_for(b"whole");
        chunk.try_append(&frame).expect("append").expect("fits");
        chunk.flush_to_disk().expect("flush");
        let valid_len = chunk.current_size();
        drop(chunk);

        // Simulate a crash mid-append: a frame prefix promising more bytes
        // than were ever written.
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("reopen");
        file.seek(SeekFrom::Start(
            (CHUNK_HEADER_SIZE + valid_len) as u64,
        ))
        .expect("seek");
        file.write_all(&500u32.to_le_bytes()).expect("torn prefix");
        file.write_all(&[1, 1, 2, 3]).expect("torn body");
        file.sync_all().expect("sync");

        let mut scan = Chunk::scan(&path).expect("scan");
        assert_eq!(scan.logical_size, valid_len);
        assert_eq!(scan.record_count, 1);
        assert!(scan.truncated);

        Chunk::truncate_tail(&path, &mut scan).expect("truncate");
        let rescan = Chunk::scan(&path).expect("rescan");
        assert_eq!(rescan.logical_size, valid_len);
        assert!(!rescan.truncated);
    }

    #[test]
    fn xor_transform_round_trips_through_disk() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let transform = TransformKind::Xor { key: 0x5A };
        let chunk = new_chunk(&path, transform);
        let frame = frame_for(b"obfuscated");
        chunk.try_append(&frame).expect("append").expect("fits");
        chunk.flush_to_disk().expect("flush");
        drop(chunk);

        // Raw bytes on disk must not contain the plaintext frame.
        let raw = std::fs::read(&path).expect("read raw");
        let window = &raw[CHUNK_HEADER_SIZE as usize..CHUNK_HEADER_SIZE as usize + frame.len()];
        assert_ne!(window, frame.as_slice());

        // But a scan (which knows the transform from the header) sees it.
        let scan = Chunk::scan(&path).expect("scan");
        assert_eq!(scan.record_count, 1);
        assert_eq!(scan.logical_size as usize, frame.len());

        let reopened = Chunk::from_recovered(&path, &scan).expect("reopen");
        let (record, _) = reopened.read_record(0).expect("read").expect("present");
        match record {
            LogRecord::Prepare(p) => assert_eq!(p.data, b"obfuscated"),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn published_records_stay_readable_during_appends() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let chunk = Arc::new(new_chunk(&path, TransformKind::None));
        chunk
            .try_append(&frame_for(b"anchor"))
            .expect("append")
            .expect("fits");

        // Readers below the size cursor must be unaffected by the appender
        // filling in the region above it.
        let reader = {
            let chunk = chunk.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let (record, _) = chunk.read_record(0).expect("read").expect("present");
                    match record {
                        LogRecord::Prepare(p) => assert_eq!(p.data, b"anchor"),
                        other => panic!("unexpected record: {other:?}"),
                    }
                }
            })
        };
        for i in 0..50u8 {
            chunk
                .try_append(&frame_for(&[i]))
                .expect("append")
                .expect("fits");
        }
        reader.join().expect("reader thread");
    }

    #[test]
    fn flush_failure_injection_surfaces_io_error() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let chunk = new_chunk(&path, TransformKind::None);
        chunk
            .try_append(&frame_for(b"x"))
            .expect("append")
            .expect("fits");
        chunk.inject_flush_error(1);
        assert!(matches!(chunk.flush_to_disk(), Err(LogError::Io(_))));
        chunk.flush_to_disk().expect("second attempt succeeds");
        assert_eq!(chunk.durable_size(), chunk.current_size());
    }
}
