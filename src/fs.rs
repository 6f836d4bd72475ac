//! Filesystem helpers shared by chunks and checkpoints: fixed-size file
//! preallocation, directory fsync, and guarded temp files for atomic replace.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::config::ChunkId;
use super::error::{LogError, LogResult};

/// Extension used for chunk files.
pub const CHUNK_FILE_EXTENSION: &str = "evchunk";

/// Extension used for checkpoint files.
pub const CHECKPOINT_FILE_EXTENSION: &str = "chk";

/// Creates a file of exactly `size` bytes, zero-filled, fsynced.
///
/// The parent directory is not synced here; callers that need the file name
/// itself to be durable must also call [`fsync_dir`].
pub fn create_fixed_size_file(path: &Path, size: u64) -> LogResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.set_len(size)?;
    file.sync_all()?;
    Ok(file)
}

/// Fsyncs a directory so that renames and creations within it are durable.
pub fn fsync_dir(dir: &Path) -> LogResult<()> {
    let handle = File::open(dir)?;
    match handle.sync_all() {
        Ok(()) => Ok(()),
        // Some filesystems refuse fsync on directories; the rename itself is
        // then as durable as the platform allows.
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => Ok(()),
        Err(err) => Err(LogError::from(err)),
    }
}

/// Deletes a temp file on drop unless it was disarmed after a successful
/// rename into place.
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keeps the file: call once it has been renamed to its final name.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Parsed chunk file name (`chunk-NNNNNN.evchunk`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFileName {
    pub chunk_id: ChunkId,
}

impl ChunkFileName {
    pub fn new(chunk_id: ChunkId) -> Self {
        Self { chunk_id }
    }

    pub fn file_name(&self) -> String {
        format!(
            "chunk-{:06}.{}",
            self.chunk_id.as_u32(),
            CHUNK_FILE_EXTENSION
        )
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{CHUNK_FILE_EXTENSION}"))?;
        let digits = stem.strip_prefix("chunk-")?;
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let raw: u32 = digits.parse().ok()?;
        Some(Self {
            chunk_id: ChunkId::new(raw),
        })
    }
}

/// Resolves on-disk paths for a log directory.
///
/// The set of file names produced here is part of the on-disk contract that
/// external tooling (backup, scavenge) depends on.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the log directory if missing and syncs its parent.
    pub fn ensure_dirs(&self) -> LogResult<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
            if let Some(parent) = self.root.parent() {
                fsync_dir(parent)?;
            }
        }
        Ok(())
    }

    pub fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.root.join(ChunkFileName::new(chunk_id).file_name())
    }

    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{name}.{CHECKPOINT_FILE_EXTENSION}"))
    }

    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.tmp"))
    }

    /// Lists chunk ids present in the directory, sorted ascending.
    pub fn list_chunks(&self) -> LogResult<Vec<ChunkId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(parsed) = ChunkFileName::parse(name) {
                ids.push(parsed.chunk_id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Returns true when fdatasync is unsupported and a full fsync should be
/// attempted instead.
pub(crate) fn sync_data_unsupported(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::Unsupported) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENOSYS || code == libc::EINVAL || code == libc::ENOTSUP {
            return true;
        }
        if cfg!(windows) && code == 1 {
            // ERROR_INVALID_FUNCTION: treat as fdatasync unsupported.
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn chunk_file_names_round_trip() {
        let name = ChunkFileName::new(ChunkId::new(17));
        let rendered = name.file_name();
        assert_eq!(rendered, "chunk-000017.evchunk");
        assert_eq!(ChunkFileName::parse(&rendered), Some(name));
        assert_eq!(ChunkFileName::parse("chunk-17.evchunk"), None);
        assert_eq!(ChunkFileName::parse("chunk-000017.bak"), None);
        assert_eq!(ChunkFileName::parse("writer.chk"), None);
    }

    #[test]
    fn fixed_size_file_is_preallocated() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("chunk-000000.evchunk");
        let file = create_fixed_size_file(&path, 4096).expect("create");
        assert_eq!(file.metadata().expect("metadata").len(), 4096);
        // Creating over an existing file must fail rather than clobber it.
        assert!(create_fixed_size_file(&path, 4096).is_err());
    }

    #[test]
    fn list_chunks_sorts_and_filters() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path());
        for id in [2u32, 0, 1] {
            create_fixed_size_file(&layout.chunk_path(ChunkId::new(id)), 64).expect("create");
        }
        std::fs::write(layout.checkpoint_path("writer"), [0u8; 8]).expect("checkpoint");
        let ids = layout.list_chunks().expect("list");
        assert_eq!(
            ids,
            vec![ChunkId::new(0), ChunkId::new(1), ChunkId::new(2)]
        );
    }

    #[test]
    fn temp_file_guard_cleans_up() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("writer.tmp");
        std::fs::write(&path, [1u8; 8]).expect("write");
        {
            let _guard = TempFileGuard::new(path.clone());
        }
        assert!(!path.exists());

        std::fs::write(&path, [1u8; 8]).expect("write");
        TempFileGuard::new(path.clone()).disarm();
        assert!(path.exists());
    }
}
