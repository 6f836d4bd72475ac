//! Pluggable chunk-level read/write transforms applied below the framing
//! layer (content obfuscation and similar).
//!
//! Transforms are length-preserving by contract: a frame occupies the same
//! byte range whether or not a transform is active, so position bookkeeping
//! never depends on the transform. Encoding keys off the local data offset so
//! any subrange of a chunk can be decoded independently. Transform failures
//! propagate as read errors, never as silent data loss.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{LogError, LogResult};

/// A length-preserving byte transform applied to chunk data.
pub trait ChunkTransform: Send + Sync + 'static {
    /// Tag persisted in the chunk header.
    fn tag(&self) -> u8;

    /// Parameter byte persisted next to the tag (key material, level, ...).
    fn param(&self) -> u8 {
        0
    }

    /// Transforms `buf` in place before it is written at `local_offset`.
    fn encode(&self, local_offset: u32, buf: &mut [u8]);

    /// Reverses [`encode`](Self::encode) for bytes read at `local_offset`.
    fn decode(&self, local_offset: u32, buf: &mut [u8]) -> LogResult<()>;
}

/// Serializable transform selector stored in configuration and chunk headers.
///
/// Multi-stage combinations (compression plus obfuscation) are not
/// expressible in the single header tag byte; a composite must be registered
/// as its own kind so every stage's parameters round-trip through the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Bytes are stored as-is.
    None,
    /// Each byte is XORed with a key derived from the param byte and its
    /// local offset. Obfuscation only, not encryption.
    Xor { key: u8 },
}

impl Default for TransformKind {
    fn default() -> Self {
        Self::None
    }
}

impl TransformKind {
    pub const IDENTITY_TAG: u8 = 0;
    pub const XOR_TAG: u8 = 1;

    /// Instantiates the transform for this kind.
    pub fn build(self) -> Arc<dyn ChunkTransform> {
        match self {
            TransformKind::None => Arc::new(IdentityTransform),
            TransformKind::Xor { key } => Arc::new(XorTransform { key }),
        }
    }

    /// Rebuilds a transform from the tag and param bytes of a chunk header.
    pub fn from_header(tag: u8, param: u8) -> LogResult<Arc<dyn ChunkTransform>> {
        match tag {
            Self::IDENTITY_TAG => Ok(Arc::new(IdentityTransform)),
            Self::XOR_TAG => Ok(Arc::new(XorTransform { key: param })),
            other => Err(LogError::Transform(format!(
                "unknown chunk transform tag {other}"
            ))),
        }
    }
}

/// The no-op transform.
pub struct IdentityTransform;

impl ChunkTransform for IdentityTransform {
    fn tag(&self) -> u8 {
        TransformKind::IDENTITY_TAG
    }

    fn encode(&self, _local_offset: u32, _buf: &mut [u8]) {}

    fn decode(&self, _local_offset: u32, _buf: &mut [u8]) -> LogResult<()> {
        Ok(())
    }
}

/// Offset-keyed XOR obfuscation.
pub struct XorTransform {
    key: u8,
}

impl XorTransform {
    #[inline]
    fn mask(&self, local_offset: u32, index: usize) -> u8 {
        self.key ^ ((local_offset as usize + index) as u8)
    }
}

impl ChunkTransform for XorTransform {
    fn tag(&self) -> u8 {
        TransformKind::XOR_TAG
    }

    fn param(&self) -> u8 {
        self.key
    }

    fn encode(&self, local_offset: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= self.mask(local_offset, i);
        }
    }

    fn decode(&self, local_offset: u32, buf: &mut [u8]) -> LogResult<()> {
        // XOR is its own inverse.
        self.encode(local_offset, buf);
        Ok(())
    }
}
