//! The chaser: a background cursor that follows the writer checkpoint,
//! re-reads each newly durable byte range as discrete records, and raises
//! confirmation events toward the index/commit layer.
//!
//! Exactly one chaser runs per log. It synchronizes with the writer purely
//! through the checkpoint pair (no shared lock): the writer advances its
//! checkpoint after each durable append and pokes the [`ChaserWaker`]; the
//! chaser reads from its own checkpoint up to the writer's, delivers events
//! in strict log order, then advances and flushes the chaser checkpoint.
//! Nothing downstream may treat a record as locally confirmed before the
//! chaser checkpoint has passed it.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::checkpoint::Checkpoint;
use super::error::LogResult;
use super::manager::{ChunkManager, SequentialReader};
use super::record::{LogRecord, PrepareFlags};

/// Confirmation raised by the chaser, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChaseEvent {
    /// A record became locally confirmed.
    RecordConfirmed(LogRecord),
    /// A commit record finalized its transaction. Raised immediately after
    /// the `RecordConfirmed` for the commit itself.
    TransactionConfirmed {
        transaction_position: u64,
        commit_position: u64,
        first_event_number: i64,
        last_event_number: i64,
    },
}

/// Downstream consumer of chase events (the index/commit layer).
pub trait ChaseConsumer: Send + 'static {
    fn confirm(&self, event: ChaseEvent);
}

/// A consumer that forwards events over a channel; the usual test and
/// integration wiring.
pub struct ChannelConsumer {
    tx: Sender<ChaseEvent>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, Receiver<ChaseEvent>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }
}

impl ChaseConsumer for ChannelConsumer {
    fn confirm(&self, event: ChaseEvent) {
        let _ = self.tx.send(event);
    }
}

impl<F> ChaseConsumer for F
where
    F: Fn(ChaseEvent) + Send + 'static,
{
    fn confirm(&self, event: ChaseEvent) {
        self(event)
    }
}

/// Handle the writer uses to nudge the chaser after an append. Cheap to
/// clone; a full wake queue means a wake is already pending, which is all
/// the coalescing needed.
#[derive(Clone)]
pub struct ChaserWaker {
    tx: Sender<()>,
}

impl ChaserWaker {
    pub fn wake(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
        }
    }
}

/// The chase cursor itself. Drive it directly with [`chase_once`] or hand it
/// to [`spawn_chaser`] for the production background loop.
///
/// [`chase_once`]: Chaser::chase_once
pub struct Chaser<C: ChaseConsumer> {
    reader: SequentialReader,
    writer_checkpoint: Arc<Checkpoint>,
    chaser_checkpoint: Arc<Checkpoint>,
    consumer: C,
    /// Prepares seen so far per open transaction position; consumed when the
    /// commit arrives so `last_event_number` can be computed.
    open_transactions: HashMap<u64, u64>,
}

impl<C: ChaseConsumer> Chaser<C> {
    pub fn new(
        manager: Arc<ChunkManager>,
        writer_checkpoint: Arc<Checkpoint>,
        chaser_checkpoint: Arc<Checkpoint>,
        consumer: C,
    ) -> Self {
        let from = chaser_checkpoint.read();
        Self {
            reader: SequentialReader::new(manager, from),
            writer_checkpoint,
            chaser_checkpoint,
            consumer,
            open_transactions: HashMap::new(),
        }
    }

    /// Current confirmation boundary.
    pub fn position(&self) -> u64 {
        self.chaser_checkpoint.read()
    }

    /// Chases from the chaser checkpoint up to the writer checkpoint,
    /// delivering one event per record (plus the transaction event per
    /// commit) in log order. Returns whether any record was confirmed.
    ///
    /// A torn frame at the live tail means "nothing more to chase yet" and
    /// ends the cycle without error. The checkpoint is flushed once per
    /// cycle, after all deliveries, so a crash re-delivers at-least-once
    /// rather than skipping records.
    pub fn chase_once(&mut self) -> LogResult<bool> {
        let target = self.writer_checkpoint.read();
        let mut progressed = false;
        while let Some(record) = self.reader.try_read_next(target)? {
            self.deliver(record);
            self.chaser_checkpoint.write(self.reader.position());
            progressed = true;
        }
        if self.reader.position() < target {
            // Dead tail hop may leave the cursor mid-gap; the checkpoint
            // still reflects every delivered record.
            debug!(
                chased_to = self.reader.position(),
                writer = target,
                "chase cycle stopped short of writer checkpoint"
            );
        }
        if progressed {
            self.chaser_checkpoint.flush()?;
        }
        Ok(progressed)
    }

    fn deliver(&mut self, record: LogRecord) {
        match &record {
            LogRecord::Prepare(prepare) => {
                let counts = self
                    .open_transactions
                    .entry(prepare.transaction_position)
                    .or_insert(0);
                *counts += 1;
                let implicit = prepare.flags.contains(PrepareFlags::IS_COMMITTED);
                let ends = prepare.flags.contains(PrepareFlags::TRANSACTION_END);
                self.consumer.confirm(ChaseEvent::RecordConfirmed(record.clone()));
                if implicit && ends {
                    // Implicitly committed transaction: no commit record
                    // will follow, finalize it here.
                    let prepares = self
                        .open_transactions
                        .remove(&prepare.transaction_position)
                        .unwrap_or(1);
                    self.consumer.confirm(ChaseEvent::TransactionConfirmed {
                        transaction_position: prepare.transaction_position,
                        commit_position: prepare.log_position,
                        first_event_number: 0,
                        last_event_number: prepares as i64 - 1,
                    });
                }
            }
            LogRecord::Commit(commit) => {
                let prepares = self
                    .open_transactions
                    .remove(&commit.transaction_position)
                    .unwrap_or(0);
                let last_event_number = if prepares == 0 {
                    commit.first_event_number
                } else {
                    commit.first_event_number + prepares as i64 - 1
                };
                let transaction_position = commit.transaction_position;
                let commit_position = commit.log_position;
                let first_event_number = commit.first_event_number;
                self.consumer.confirm(ChaseEvent::RecordConfirmed(record));
                self.consumer.confirm(ChaseEvent::TransactionConfirmed {
                    transaction_position,
                    commit_position,
                    first_event_number,
                    last_event_number,
                });
            }
            LogRecord::Epoch(_) | LogRecord::System(_) => {
                self.consumer.confirm(ChaseEvent::RecordConfirmed(record));
            }
        }
    }
}

/// A running background chaser. Dropping the handle without calling
/// [`shutdown`](ChaserHandle::shutdown) detaches the thread.
pub struct ChaserHandle {
    tx: Sender<()>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ChaserHandle {
    /// A waker for the writer to signal new durable bytes.
    pub fn waker(&self) -> ChaserWaker {
        ChaserWaker {
            tx: self.tx.clone(),
        }
    }

    /// Requests a cooperative stop and waits for the thread. The chaser
    /// finishes the record it is on and runs one final catch-up cycle, so no
    /// already-durable record goes unconfirmed.
    pub fn shutdown(mut self) -> LogResult<()> {
        self.cancel.cancel();
        let _ = self.tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(super::error::LogError::internal("chaser thread panicked"));
            }
        }
        Ok(())
    }
}

/// Spawns the background chase loop.
///
/// The loop wakes on writer signals and additionally polls every
/// `poll_interval` (belt and suspenders against a lost wake). An I/O or
/// corruption error stops the chaser; per the propagation policy the
/// component fails loud and stays down until restart-time recovery.
pub fn spawn_chaser<C: ChaseConsumer>(
    mut chaser: Chaser<C>,
    poll_interval: Duration,
) -> LogResult<ChaserHandle> {
    let (tx, rx) = channel::bounded::<()>(1);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = thread::Builder::new()
        .name("evlog-chaser".to_string())
        .spawn(move || {
            info!("chaser started");
            loop {
                if token.is_cancelled() {
                    if let Err(err) = chaser.chase_once() {
                        error!(error = %err, "final chase cycle failed");
                    }
                    info!("chaser stopped");
                    return;
                }
                match rx.recv_timeout(poll_interval) {
                    Ok(()) | Err(channel::RecvTimeoutError::Timeout) => {
                        if let Err(err) = chaser.chase_once() {
                            error!(error = %err, "chaser stopped on error");
                            return;
                        }
                    }
                    Err(channel::RecvTimeoutError::Disconnected) => {
                        info!("chaser stopped: all wakers dropped");
                        return;
                    }
                }
            }
        })
        .map_err(|err| {
            super::error::LogError::internal(format!("failed to spawn chaser thread: {err}"))
        })?;
    Ok(ChaserHandle {
        tx,
        cancel,
        handle: Some(handle),
    })
}
