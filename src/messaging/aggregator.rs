//! Partition batch aggregator
//!
//! Collects the records of every claimed partition of one (group, topic) into
//! per-partition windows, hands full or drained windows to a single dispatch
//! task and commits offsets only after the batch handler succeeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::group::GroupSession;
use crate::error::{MqError, Result};
use crate::types::{BatchConfig, ConsumerRecord, GroupKey};

/// Application logic for batches. Returning `false` leaves the batch
/// uncommitted so it is consumed again after the next rebalance.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    async fn handle_batch(&self, key: &GroupKey, records: &[ConsumerRecord]) -> bool;
}

#[async_trait]
impl<F> BatchHandler for F
where
    F: Fn(&[ConsumerRecord]) -> bool + Send + Sync + 'static,
{
    async fn handle_batch(&self, _key: &GroupKey, records: &[ConsumerRecord]) -> bool {
        self(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    /// Records are buffered or batches are queued
    Accumulating,
    /// The batch handler is running
    Dispatching,
}

/// Records of one partition waiting to become a batch.
struct BatchWindow {
    records: Vec<ConsumerRecord>,
    sessions: SessionTracker,
}

struct Batch {
    partition: i32,
    records: Vec<ConsumerRecord>,
    session: Arc<dyn GroupSession>,
}

impl Batch {
    fn first_offset(&self) -> i64 {
        self.records.first().map_or(0, |r| r.offset)
    }

    fn last_offset(&self) -> i64 {
        self.records.last().map_or(0, |r| r.offset)
    }
}

fn same_session(a: &Arc<dyn GroupSession>, b: &Arc<dyn GroupSession>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionAge {
    Current,
    New,
    /// Replaced by a newer session of the same partition
    Stale,
}

/// Sessions seen for one partition. Replaced sessions are remembered while
/// anything still holds them, so late records of a revoked claim are
/// recognized instead of being taken for a new session.
struct SessionTracker {
    current: Arc<dyn GroupSession>,
    retired: Vec<Weak<dyn GroupSession>>,
}

impl SessionTracker {
    fn new(session: &Arc<dyn GroupSession>) -> Self {
        Self {
            current: session.clone(),
            retired: Vec::new(),
        }
    }

    fn is_current(&self, session: &Arc<dyn GroupSession>) -> bool {
        same_session(&self.current, session)
    }

    fn observe(&mut self, session: &Arc<dyn GroupSession>) -> SessionAge {
        if self.is_current(session) {
            return SessionAge::Current;
        }

        let ptr = Arc::as_ptr(session) as *const ();
        if self.retired.iter().any(|w| std::ptr::eq(w.as_ptr() as *const (), ptr)) {
            return SessionAge::Stale;
        }

        self.retired.retain(|w| w.strong_count() > 0);
        let previous = std::mem::replace(&mut self.current, session.clone());
        self.retired.push(Arc::downgrade(&previous));
        SessionAge::New
    }
}

/// Batches records of one (group, topic) and commits after success.
pub struct PartitionBatchAggregator {
    key: GroupKey,
    config: BatchConfig,
    windows: Mutex<HashMap<i32, BatchWindow>>,
    queue: mpsc::Sender<Batch>,
    dispatching: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionBatchAggregator {
    /// Create the aggregator and spawn its dispatch task.
    pub fn start(
        key: GroupKey,
        config: BatchConfig,
        handler: Arc<dyn BatchHandler>,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let config = BatchConfig::new(config.batch_size, config.queue_depth);
        let (queue, batches) = mpsc::channel(config.queue_depth);
        let dispatching = Arc::new(AtomicBool::new(false));
        let cancel = cancel.child_token();

        let task = tokio::spawn(dispatch_loop(
            key.clone(),
            batches,
            handler,
            dispatching.clone(),
            cancel.clone(),
        ));

        info!(
            key = %key,
            batch_size = config.batch_size,
            queue_depth = config.queue_depth,
            "Batch aggregator started"
        );

        Arc::new(Self {
            key,
            config,
            windows: Mutex::new(HashMap::new()),
            queue,
            dispatching,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    /// Append `record` to its partition's window. The window is flushed to
    /// the dispatch queue when full or when `remaining` says the partition
    /// has nothing more buffered. Waits while the dispatch queue is full.
    pub async fn attach(
        &self,
        record: ConsumerRecord,
        session: &Arc<dyn GroupSession>,
        remaining: usize,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MqError::Closed);
        }

        let batch = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            let window = windows.entry(record.partition).or_insert_with(|| BatchWindow {
                records: Vec::with_capacity(self.config.batch_size),
                sessions: SessionTracker::new(session),
            });

            // Records of an earlier session are consumed again from the
            // committed offset, so they must not be batched twice
            match window.sessions.observe(session) {
                SessionAge::Current => {}
                SessionAge::New => {
                    if !window.records.is_empty() {
                        debug!(
                            key = %self.key,
                            partition = record.partition,
                            dropped = window.records.len(),
                            "Discarding window of previous session"
                        );
                        window.records.clear();
                    }
                }
                SessionAge::Stale => {
                    debug!(
                        key = %self.key,
                        partition = record.partition,
                        offset = record.offset,
                        "Dropping record of a revoked session"
                    );
                    return Ok(());
                }
            }

            let partition = record.partition;
            window.records.push(record);

            if window.records.len() >= self.config.batch_size || remaining == 0 {
                let records = std::mem::replace(
                    &mut window.records,
                    Vec::with_capacity(self.config.batch_size),
                );
                Some(Batch {
                    partition,
                    records,
                    session: session.clone(),
                })
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(MqError::Closed),
                sent = self.queue.send(batch) => sent.map_err(|_| MqError::Closed)?,
            }
        }
        Ok(())
    }

    pub fn state(&self) -> AggregatorState {
        if self.dispatching.load(Ordering::SeqCst) {
            return AggregatorState::Dispatching;
        }

        let queued = self.queue.max_capacity() - self.queue.capacity();
        let buffered = self
            .windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|w| !w.records.is_empty());

        if queued > 0 || buffered {
            AggregatorState::Accumulating
        } else {
            AggregatorState::Idle
        }
    }

    /// Stop the dispatch task. Queued and in-flight batches are abandoned
    /// without commit.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(key = %self.key, error = %e, "Dispatch task ended abnormally");
            }
        }
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Commit bookkeeping of one partition within its current session.
struct PartitionLedger {
    sessions: SessionTracker,
    /// First offset of the earliest failed batch
    failed_at: Option<i64>,
    /// Next offset the broker confirmed as committed
    committed: Option<i64>,
}

/// Decides which batch results may be committed so commits never skip a
/// failed batch and never move backwards within a session.
#[derive(Default)]
struct CommitLedger {
    partitions: HashMap<i32, PartitionLedger>,
}

impl CommitLedger {
    /// Record the outcome of `batch`; returns the offset to commit, if any.
    fn settle(&mut self, batch: &Batch, handled: bool) -> Option<i64> {
        let ledger = self
            .partitions
            .entry(batch.partition)
            .or_insert_with(|| PartitionLedger {
                sessions: SessionTracker::new(&batch.session),
                failed_at: None,
                committed: None,
            });

        // The broker redelivers from its committed offset after a rebalance
        match ledger.sessions.observe(&batch.session) {
            SessionAge::Current => {}
            SessionAge::New => {
                ledger.failed_at = None;
                ledger.committed = None;
            }
            SessionAge::Stale => return None,
        }

        let first = batch.first_offset();
        if !handled {
            ledger.failed_at = Some(ledger.failed_at.map_or(first, |f| f.min(first)));
            return None;
        }

        if let Some(failed_at) = ledger.failed_at {
            if first > failed_at {
                return None;
            }
            ledger.failed_at = None;
        }

        let next = batch.last_offset() + 1;
        if ledger.committed.map_or(false, |c| next <= c) {
            return None;
        }
        Some(next)
    }

    /// Remember that the commit of `next` for `batch` went through.
    fn confirm(&mut self, batch: &Batch, next: i64) {
        if let Some(ledger) = self.partitions.get_mut(&batch.partition) {
            if ledger.sessions.is_current(&batch.session) {
                ledger.committed = Some(ledger.committed.map_or(next, |c| c.max(next)));
            }
        }
    }
}

async fn dispatch_loop(
    key: GroupKey,
    mut batches: mpsc::Receiver<Batch>,
    handler: Arc<dyn BatchHandler>,
    dispatching: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut ledger = CommitLedger::default();

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        dispatching.store(true, Ordering::SeqCst);
        let handled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                dispatching.store(false, Ordering::SeqCst);
                break;
            }
            handled = handler.handle_batch(&key, &batch.records) => handled,
        };
        dispatching.store(false, Ordering::SeqCst);

        let Some(next) = ledger.settle(&batch, handled) else {
            debug!(
                key = %key,
                partition = batch.partition,
                first_offset = batch.first_offset(),
                last_offset = batch.last_offset(),
                handled,
                "Batch not committed"
            );
            continue;
        };

        let committed = batch
            .session
            .mark_offset(&key.topic, batch.partition, next)
            .and_then(|()| batch.session.commit());
        match committed {
            Ok(()) => {
                ledger.confirm(&batch, next);
                debug!(
                    key = %key,
                    partition = batch.partition,
                    offset = next,
                    records = batch.records.len(),
                    "Batch committed"
                );
            }
            Err(e) => warn!(
                key = %key,
                partition = batch.partition,
                offset = next,
                error = %e,
                "Offset commit failed"
            ),
        }
    }

    debug!(key = %key, "Dispatch task stopped");
}
