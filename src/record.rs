//! Log record kinds and their binary framing.
//!
//! Every record is stored as `[length u32][type tag u8][version u8][body]`
//! followed by a mirrored `[length u32]` suffix so the tail of the log can be
//! validated (and scanned backward) without trusting unflushed bytes. The
//! length counts the tag, version, and body. Readers accept a frame only when
//! prefix and suffix agree; a mismatch at the end of the durable region is a
//! torn write, not corruption.

use std::convert::TryInto;

use super::config::NO_POSITION;
use super::error::{LogError, LogResult};

/// Size of the leading length field.
pub const FRAME_PREFIX_SIZE: u32 = 4;
/// Size of the mirrored trailing length field.
pub const FRAME_SUFFIX_SIZE: u32 = 4;
/// Fixed framing overhead per record.
pub const FRAME_OVERHEAD: u32 = FRAME_PREFIX_SIZE + FRAME_SUFFIX_SIZE;
/// Smallest possible frame: empty-bodied record (tag + version only).
pub const MIN_FRAME_SIZE: u32 = FRAME_OVERHEAD + 2;

/// Current frame format version.
pub const RECORD_FORMAT_VERSION: u8 = 1;

/// One-byte type tag stored in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Prepare = 1,
    Commit = 2,
    Epoch = 3,
    System = 4,
}

impl RecordType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Prepare),
            2 => Some(Self::Commit),
            3 => Some(Self::Epoch),
            4 => Some(Self::System),
            _ => None,
        }
    }
}

/// Flags carried by a prepare record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PrepareFlags(pub u16);

impl PrepareFlags {
    /// First prepare of a transaction.
    pub const TRANSACTION_BEGIN: PrepareFlags = PrepareFlags(0x01);
    /// Last prepare of a transaction.
    pub const TRANSACTION_END: PrepareFlags = PrepareFlags(0x02);
    /// Prepare was written by an implicitly committed single-event write.
    pub const IS_COMMITTED: PrepareFlags = PrepareFlags(0x04);
    /// Event payload is JSON.
    pub const IS_JSON: PrepareFlags = PrepareFlags(0x08);

    /// A complete single-prepare transaction.
    pub fn single() -> Self {
        Self(Self::TRANSACTION_BEGIN.0 | Self::TRANSACTION_END.0)
    }

    pub fn contains(self, other: PrepareFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: PrepareFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// Event write intent. The event becomes visible once a commit record (or the
/// `IS_COMMITTED` flag) finalizes its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRecord {
    /// Position of this record in the log. Assigned at append; not serialized.
    pub log_position: u64,
    /// Position of the first prepare in the same transaction.
    pub transaction_position: u64,
    pub flags: PrepareFlags,
    /// Version the writer expected the stream to be at; -1 for "any".
    pub expected_version: i64,
    pub event_id: u128,
    pub correlation_id: u128,
    pub stream_id: String,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Finalizes a transaction: the prepares at `transaction_position` become
/// events numbered from `first_event_number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub log_position: u64,
    pub transaction_position: u64,
    pub first_event_number: i64,
    pub correlation_id: u128,
    pub timestamp_ms: u64,
}

/// Marker written at the start of a leadership term. Forms a backward-linked
/// chain through `previous_epoch_position`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRecord {
    pub log_position: u64,
    /// Monotonic term counter, starting at 0.
    pub epoch_number: i64,
    /// Log position of this record itself (serialized, unlike log_position,
    /// so the chain stays verifiable when records are copied around).
    pub epoch_position: u64,
    /// Position of the previous epoch record, or [`NO_POSITION`].
    pub previous_epoch_position: u64,
    pub leader_instance_id: u128,
    pub timestamp_ms: u64,
}

/// Internal bookkeeping record (scavenge points, version markers, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRecord {
    pub log_position: u64,
    pub kind: u8,
    pub data: Vec<u8>,
}

/// A decoded log record. Kind-specific payloads share the framing format and
/// are dispatched on the frame's type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    Epoch(EpochRecord),
    System(SystemRecord),
}

impl LogRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Prepare(_) => RecordType::Prepare,
            LogRecord::Commit(_) => RecordType::Commit,
            LogRecord::Epoch(_) => RecordType::Epoch,
            LogRecord::System(_) => RecordType::System,
        }
    }

    pub fn log_position(&self) -> u64 {
        match self {
            LogRecord::Prepare(r) => r.log_position,
            LogRecord::Commit(r) => r.log_position,
            LogRecord::Epoch(r) => r.log_position,
            LogRecord::System(r) => r.log_position,
        }
    }

    /// Returns a copy with the log position set; used when comparing an
    /// appended record against its read-back form.
    pub fn with_log_position(mut self, position: u64) -> Self {
        match &mut self {
            LogRecord::Prepare(r) => r.log_position = position,
            LogRecord::Commit(r) => r.log_position = position,
            LogRecord::Epoch(r) => r.log_position = position,
            LogRecord::System(r) => r.log_position = position,
        }
        self
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            LogRecord::Prepare(r) => {
                put_u64(buf, r.transaction_position);
                put_u16(buf, r.flags.0);
                put_i64(buf, r.expected_version);
                put_u128(buf, r.event_id);
                put_u128(buf, r.correlation_id);
                put_str(buf, &r.stream_id);
                put_str(buf, &r.event_type);
                put_bytes(buf, &r.data);
                put_bytes(buf, &r.metadata);
                put_u64(buf, r.timestamp_ms);
            }
            LogRecord::Commit(r) => {
                put_u64(buf, r.transaction_position);
                put_i64(buf, r.first_event_number);
                put_u128(buf, r.correlation_id);
                put_u64(buf, r.timestamp_ms);
            }
            LogRecord::Epoch(r) => {
                put_i64(buf, r.epoch_number);
                put_u64(buf, r.epoch_position);
                put_u64(buf, r.previous_epoch_position);
                put_u128(buf, r.leader_instance_id);
                put_u64(buf, r.timestamp_ms);
            }
            LogRecord::System(r) => {
                buf.push(r.kind);
                put_bytes(buf, &r.data);
            }
        }
    }

    fn decode_body(
        record_type: RecordType,
        version: u8,
        body: &[u8],
        log_position: u64,
    ) -> LogResult<Self> {
        if version != RECORD_FORMAT_VERSION {
            return Err(LogError::CorruptedRecord(format!(
                "unsupported record format version {version}"
            )));
        }
        let mut r = BodyReader::new(body);
        let record = match record_type {
            RecordType::Prepare => LogRecord::Prepare(PrepareRecord {
                log_position,
                transaction_position: r.u64()?,
                flags: PrepareFlags(r.u16()?),
                expected_version: r.i64()?,
                event_id: r.u128()?,
                correlation_id: r.u128()?,
                stream_id: r.string()?,
                event_type: r.string()?,
                data: r.bytes()?,
                metadata: r.bytes()?,
                timestamp_ms: r.u64()?,
            }),
            RecordType::Commit => LogRecord::Commit(CommitRecord {
                log_position,
                transaction_position: r.u64()?,
                first_event_number: r.i64()?,
                correlation_id: r.u128()?,
                timestamp_ms: r.u64()?,
            }),
            RecordType::Epoch => LogRecord::Epoch(EpochRecord {
                log_position,
                epoch_number: r.i64()?,
                epoch_position: r.u64()?,
                previous_epoch_position: r.u64()?,
                leader_instance_id: r.u128()?,
                timestamp_ms: r.u64()?,
            }),
            RecordType::System => LogRecord::System(SystemRecord {
                log_position,
                kind: r.u8()?,
                data: r.bytes()?,
            }),
        };
        r.finish()?;
        Ok(record)
    }
}

impl From<PrepareRecord> for LogRecord {
    fn from(value: PrepareRecord) -> Self {
        LogRecord::Prepare(value)
    }
}

impl From<CommitRecord> for LogRecord {
    fn from(value: CommitRecord) -> Self {
        LogRecord::Commit(value)
    }
}

impl From<EpochRecord> for LogRecord {
    fn from(value: EpochRecord) -> Self {
        LogRecord::Epoch(value)
    }
}

impl From<SystemRecord> for LogRecord {
    fn from(value: SystemRecord) -> Self {
        LogRecord::System(value)
    }
}

/// Serializes a record into a complete frame.
///
/// Fails when a field is longer than its length field can encode; a frame
/// must never be written carrying a length that lies about its contents.
pub fn encode_frame(record: &LogRecord) -> LogResult<Vec<u8>> {
    check_field_lengths(record)?;
    let mut payload = Vec::with_capacity(64);
    payload.push(record.record_type() as u8);
    payload.push(RECORD_FORMAT_VERSION);
    record.encode_body(&mut payload);

    if payload.len() > u32::MAX as usize {
        return Err(LogError::OversizedRecordField {
            field: "payload",
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }
    let length = payload.len() as u32;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&length.to_le_bytes());
    Ok(frame)
}

fn check_field_lengths(record: &LogRecord) -> LogResult<()> {
    fn check(field: &'static str, len: usize, max: usize) -> LogResult<()> {
        if len > max {
            return Err(LogError::OversizedRecordField { field, len, max });
        }
        Ok(())
    }
    match record {
        LogRecord::Prepare(r) => {
            check("stream_id", r.stream_id.len(), u16::MAX as usize)?;
            check("event_type", r.event_type.len(), u16::MAX as usize)?;
            check("data", r.data.len(), u32::MAX as usize)?;
            check("metadata", r.metadata.len(), u32::MAX as usize)
        }
        LogRecord::System(r) => check("data", r.data.len(), u32::MAX as usize),
        LogRecord::Commit(_) | LogRecord::Epoch(_) => Ok(()),
    }
}

/// Result of attempting to read one frame from a byte region.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A fully framed, length-verified record.
    Record { record: LogRecord, frame_len: u32 },
    /// Zero-length prefix or not enough room for a frame: clean end of the
    /// written region.
    End,
    /// A partially written frame: the prefix promises more bytes than the
    /// region holds, or the suffix disagrees with the prefix.
    TornTail,
}

/// Reads the frame starting at `buf[0]`. `buf` must not extend past the
/// trusted (durable or scanned-valid) region; `log_position` is the global
/// position of the frame start.
pub fn read_frame(buf: &[u8], log_position: u64) -> LogResult<FrameOutcome> {
    if buf.len() < MIN_FRAME_SIZE as usize {
        return Ok(FrameOutcome::End);
    }
    let length = u32::from_le_bytes(
        buf[0..4]
            .try_into()
            .map_err(|_| LogError::CorruptedRecord("length prefix unreadable".to_string()))?,
    );
    if length == 0 {
        return Ok(FrameOutcome::End);
    }
    if length < 2 {
        return Ok(FrameOutcome::TornTail);
    }
    let frame_len = (length as u64) + FRAME_OVERHEAD as u64;
    if frame_len > buf.len() as u64 {
        return Ok(FrameOutcome::TornTail);
    }
    let frame_len = frame_len as usize;
    let suffix = u32::from_le_bytes(
        buf[frame_len - 4..frame_len]
            .try_into()
            .map_err(|_| LogError::CorruptedRecord("length suffix unreadable".to_string()))?,
    );
    if suffix != length {
        return Ok(FrameOutcome::TornTail);
    }

    let tag = buf[4];
    let version = buf[5];
    let Some(record_type) = RecordType::from_tag(tag) else {
        // Both length fields agree, so this is not a torn tail: the bytes
        // were fully written and are wrong.
        return Err(LogError::CorruptedRecord(format!(
            "unknown record type tag {tag} at position {log_position}"
        )));
    };
    let body = &buf[6..frame_len - FRAME_SUFFIX_SIZE as usize];
    let record = LogRecord::decode_body(record_type, version, body, log_position)?;
    Ok(FrameOutcome::Record {
        record,
        frame_len: frame_len as u32,
    })
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u128(buf: &mut Vec<u8>, value: u128) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> LogResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                LogError::CorruptedRecord("record body shorter than declared fields".to_string())
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> LogResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> LogResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().map_err(
            |_| LogError::CorruptedRecord("u16 field corrupt".to_string()),
        )?))
    }

    fn u64(&mut self) -> LogResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().map_err(
            |_| LogError::CorruptedRecord("u64 field corrupt".to_string()),
        )?))
    }

    fn i64(&mut self) -> LogResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().map_err(
            |_| LogError::CorruptedRecord("i64 field corrupt".to_string()),
        )?))
    }

    fn u128(&mut self) -> LogResult<u128> {
        Ok(u128::from_le_bytes(self.take(16)?.try_into().map_err(
            |_| LogError::CorruptedRecord("u128 field corrupt".to_string()),
        )?))
    }

    fn bytes(&mut self) -> LogResult<Vec<u8>> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().map_err(|_| {
            LogError::CorruptedRecord("byte field length corrupt".to_string())
        })?) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> LogResult<String> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().map_err(|_| {
            LogError::CorruptedRecord("string length corrupt".to_string())
        })?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LogError::CorruptedRecord("string field is not UTF-8".to_string()))
    }

    fn finish(&self) -> LogResult<()> {
        if self.pos != self.buf.len() {
            return Err(LogError::CorruptedRecord(format!(
                "{} trailing bytes after record body",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Convenience constructor for a single-event prepare.
pub fn single_prepare(
    stream_id: impl Into<String>,
    event_type: impl Into<String>,
    data: Vec<u8>,
    timestamp_ms: u64,
) -> PrepareRecord {
    PrepareRecord {
        log_position: 0,
        transaction_position: 0,
        flags: PrepareFlags::single().union(PrepareFlags::IS_COMMITTED),
        expected_version: -1,
        event_id: 0,
        correlation_id: 0,
        stream_id: stream_id.into(),
        event_type: event_type.into(),
        data,
        metadata: Vec::new(),
        timestamp_ms,
    }
}

/// First epoch back-link value.
pub const FIRST_EPOCH_PREVIOUS_POSITION: u64 = NO_POSITION;
