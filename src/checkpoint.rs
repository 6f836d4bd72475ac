//! Durable, atomically-updatable position pointers.
//!
//! A [`Checkpoint`] buffers writes in memory (`write` is hot-path cheap) and
//! persists them on [`flush`](Checkpoint::flush) via write-temp-then-rename
//! plus directory fsync, so a crash can never expose a torn value: recovery
//! reads either the previous flushed value or the new one. Each log instance
//! owns its own [`CheckpointSet`]; nothing here is process-global.

use std::fs;
use std::io::{self, Read, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;
use tracing::debug;

use super::config::NO_POSITION;
use super::error::{LogError, LogResult};
use super::fs::{Layout, TempFileGuard, fsync_dir};

/// Checkpoint file stem for the writer (end of physically written log).
pub const WRITER_CHECKPOINT: &str = "writer";
/// Checkpoint file stem for the chaser (end of locally confirmed log).
pub const CHASER_CHECKPOINT: &str = "chaser";
/// Checkpoint file stem for the last epoch record position.
pub const EPOCH_CHECKPOINT: &str = "epoch";
/// Checkpoint file stem for the pending truncation target.
pub const TRUNCATE_CHECKPOINT: &str = "truncate";
/// Checkpoint file stem for the cluster-replicated position.
pub const REPLICATION_CHECKPOINT: &str = "replication";
/// Checkpoint file stem for the index layer's progress.
pub const INDEX_CHECKPOINT: &str = "index";
/// Checkpoint file stem for the stream existence filter's progress.
pub const STREAM_EXISTENCE_FILTER_CHECKPOINT: &str = "stream_existence_filter";

const CHECKPOINT_VALUE_SIZE: usize = 8;

/// A named durable monotonic position.
///
/// `write` is visible to same-process readers immediately; only `flush`
/// establishes the value a restart will see. Values never decrease, with one
/// carve-out: [`NO_POSITION`] means "never written" and is replaced by the
/// first real value.
pub struct Checkpoint {
    name: &'static str,
    path: PathBuf,
    temp_path: PathBuf,
    dir: PathBuf,
    value: AtomicU64,
    flushed: AtomicU64,
    notify: Notify,
}

impl Checkpoint {
    /// Opens (or initializes) the checkpoint named `name` under `layout`.
    ///
    /// Returns the last flushed value if the file exists, `initial`
    /// otherwise. Bytes in the log beyond the returned value are untrusted
    /// until the owning component re-validates them.
    pub fn open(layout: &Layout, name: &'static str, initial: u64) -> LogResult<Arc<Self>> {
        let path = layout.checkpoint_path(name);
        let value = match fs::File::open(&path) {
            Ok(mut file) => {
                let mut buf = [0u8; CHECKPOINT_VALUE_SIZE];
                file.read_exact(&mut buf).map_err(|err| {
                    LogError::Corruption(format!(
                        "checkpoint {name} shorter than {CHECKPOINT_VALUE_SIZE} bytes: {err}"
                    ))
                })?;
                u64::from_le_bytes(buf)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => initial,
            Err(err) => return Err(LogError::from(err)),
        };
        debug!(checkpoint = name, value, "opened checkpoint");
        Ok(Arc::new(Self {
            name,
            path,
            temp_path: layout.temp_path(name),
            dir: layout.root().to_path_buf(),
            value: AtomicU64::new(value),
            flushed: AtomicU64::new(value),
            notify: Notify::new(),
        }))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the buffered (same-process visible) value.
    #[inline]
    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Returns the last durably flushed value.
    #[inline]
    pub fn read_flushed(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }

    /// Buffers a new value. Cheap; safe on the hot path. Regressions are
    /// ignored so the checkpoint stays monotonic from this writer's view.
    pub fn write(&self, position: u64) {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let advanced = current == NO_POSITION || position > current;
            if !advanced {
                return;
            }
            match self.value.compare_exchange(
                current,
                position,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Durably persists the last buffered value.
    ///
    /// On failure the flushed value is not advanced and the error is
    /// surfaced: a checkpoint is the sole recovery anchor, so a flush must
    /// never silently succeed.
    pub fn flush(&self) -> LogResult<()> {
        let value = self.value.load(Ordering::Acquire);
        if value == self.flushed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.persist(value)
            .map_err(|source| LogError::CheckpointFlush {
                name: self.name,
                source,
            })?;
        self.flushed.store(value, Ordering::Release);
        Ok(())
    }

    fn persist(&self, value: u64) -> io::Result<()> {
        let guard = TempFileGuard::new(self.temp_path.clone());
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(guard.path())?;
            file.write_all(&value.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(guard.path(), &self.path)?;
        guard.disarm();
        match fsync_dir(&self.dir) {
            Ok(()) => Ok(()),
            Err(LogError::Io(err)) => Err(err),
            Err(other) => Err(io::Error::other(other.to_string())),
        }
    }

    /// Recovery-only override: forces the value to `position` (downward
    /// allowed) and durably persists it in the same step.
    ///
    /// Used when open-time reconciliation finds a checkpoint referring to
    /// bytes that did not survive the crash; normal callers go through the
    /// monotonic [`write`](Self::write).
    pub(crate) fn reset_to(&self, position: u64) -> LogResult<()> {
        self.value.store(position, Ordering::Release);
        self.persist(position)
            .map_err(|source| LogError::CheckpointFlush {
                name: self.name,
                source,
            })?;
        self.flushed.store(position, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits until the buffered value reaches `position`.
    ///
    /// Intended for end-position checkpoints (writer, chaser, replication);
    /// an unwritten pointer checkpoint ([`NO_POSITION`]) never satisfies a
    /// wait. The `Notified` future is registered before the value is
    /// checked, so a write landing between the two cannot be lost.
    pub async fn wait_for(&self, position: u64) {
        loop {
            let notified = self.notify.notified();
            let current = self.value.load(Ordering::Acquire);
            if current != NO_POSITION && current >= position {
                return;
            }
            notified.await;
        }
    }
}

/// The full named checkpoint set owned by one log instance.
///
/// The file names are part of the on-disk contract (backup and scavenge
/// tooling enumerate them).
pub struct CheckpointSet {
    pub writer: Arc<Checkpoint>,
    pub chaser: Arc<Checkpoint>,
    pub epoch: Arc<Checkpoint>,
    pub truncate: Arc<Checkpoint>,
    pub replication: Arc<Checkpoint>,
    pub index: Arc<Checkpoint>,
    pub stream_existence_filter: Arc<Checkpoint>,
}

impl CheckpointSet {
    /// Opens every checkpoint under `layout`, creating initial values for a
    /// fresh log: end-position checkpoints start at 0, pointer-valued ones
    /// at [`NO_POSITION`].
    pub fn open(layout: &Layout) -> LogResult<Self> {
        Ok(Self {
            writer: Checkpoint::open(layout, WRITER_CHECKPOINT, 0)?,
            chaser: Checkpoint::open(layout, CHASER_CHECKPOINT, 0)?,
            epoch: Checkpoint::open(layout, EPOCH_CHECKPOINT, NO_POSITION)?,
            truncate: Checkpoint::open(layout, TRUNCATE_CHECKPOINT, NO_POSITION)?,
            replication: Checkpoint::open(layout, REPLICATION_CHECKPOINT, 0)?,
            index: Checkpoint::open(layout, INDEX_CHECKPOINT, 0)?,
            stream_existence_filter: Checkpoint::open(
                layout,
                STREAM_EXISTENCE_FILTER_CHECKPOINT,
                0,
            )?,
        })
    }
}
