//! Bounded priority request dispatcher
//!
//! Accepts asynchronous operations tagged with a priority, runs at most
//! `max_concurrent` at a time, and retries failures with exponential
//! backoff. A full backlog rejects new submissions immediately; that is
//! the system's backpressure, not an error to retry.
//!
//! Order placement must preempt low-value background refreshes under
//! load: pending items are selected priority-first, FIFO within a
//! priority band. Items already running are never preempted.
//!
//! Scheduling is event-driven: enqueue, task completion, and backoff
//! expiry each wake a background scheduler through a [`Notify`], so
//! there is no polling timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Error types for dispatcher submissions
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backlog is at capacity; fatal for this submission
    #[error("request queue is full ({0} pending)")]
    Full(usize),

    /// The item was removed before it ran
    #[error("request {0} was cancelled")]
    Cancelled(Uuid),

    /// The operation failed on every attempt
    #[error("request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: anyhow::Error,
    },

    /// The queue was dropped while the item was outstanding
    #[error("request queue shut down")]
    Closed,
}

/// Relative urgency of a submission
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// Configuration for a [`RequestQueue`]
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum operations in flight at once
    pub max_concurrent: usize,

    /// Maximum pending (not yet running) items before enqueue rejects
    pub max_queue_size: usize,

    /// Base delay for exponential backoff
    pub retry_delay: Duration,

    /// Select pending items priority-first; plain FIFO when false
    pub priority_order: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 50,
            retry_delay: Duration::from_millis(1000),
            priority_order: true,
        }
    }
}

/// Per-submission options for [`RequestQueue::enqueue`]
#[derive(Default)]
pub struct EnqueueOptions {
    pub priority: Option<Priority>,
    pub max_retries: Option<u32>,
    pub id: Option<Uuid>,
}

impl EnqueueOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// Snapshot of queue occupancy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
}

type TaskFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

struct QueuedRequest<T> {
    id: Uuid,
    priority: Priority,
    execute: TaskFn<T>,
    retries: u32,
    max_retries: u32,
    /// Enqueue time, FIFO tie-break within a priority band
    timestamp: DateTime<Utc>,
    seq: u64,
    tx: oneshot::Sender<Result<T, QueueError>>,
}

struct QueueState<T> {
    pending: Vec<QueuedRequest<T>>,
    running: usize,
    next_seq: u64,
}

struct QueueInner<T> {
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    notify: Arc<Notify>,
    shutdown: AtomicBool,
}

/// The bounded priority dispatcher
///
/// One instance per process, constructed at the application root and
/// passed to the features that submit work through it.
pub struct RequestQueue<T: Send + 'static> {
    inner: Arc<QueueInner<T>>,
}

/// Caller's handle to an accepted submission
pub struct TaskHandle<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> TaskHandle<T> {
    /// The id the item was enqueued under
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the operation's terminal outcome
    pub async fn join(self) -> Result<T, QueueError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(QueueError::Closed),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Create a dispatcher and start its scheduler task
    pub fn new(config: QueueConfig) -> Self {
        let inner = Arc::new(QueueInner {
            config,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                running: 0,
                next_seq: 0,
            }),
            notify: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        let notify = inner.notify.clone();
        tokio::spawn(async move {
            scheduler_loop(weak, notify).await;
        });

        Self { inner }
    }

    /// Submit an operation
    ///
    /// Rejects synchronously with [`QueueError::Full`] when the backlog
    /// is at capacity, before the operation runs. Otherwise returns a
    /// handle whose `join` resolves with the operation's result, or with
    /// the terminal error once retries are exhausted.
    pub fn enqueue<F, Fut>(
        &self,
        execute: F,
        options: EnqueueOptions,
    ) -> Result<TaskHandle<T>, QueueError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let id = options.id.unwrap_or_else(Uuid::new_v4);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = lock_state(&self.inner.state);
            if state.pending.len() >= self.inner.config.max_queue_size {
                return Err(QueueError::Full(state.pending.len()));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(QueuedRequest {
                id,
                priority: options.priority.unwrap_or(Priority::Medium),
                execute: Arc::new(move || {
                    Box::pin(execute()) as BoxFuture<'static, anyhow::Result<T>>
                }),
                retries: 0,
                max_retries: options.max_retries.unwrap_or(3),
                timestamp: Utc::now(),
                seq,
                tx,
            });
        }
        self.inner.notify.notify_one();

        Ok(TaskHandle { id, rx })
    }

    /// Current pending/running counts
    pub fn status(&self) -> QueueStatus {
        let state = lock_state(&self.inner.state);
        QueueStatus {
            pending: state.pending.len(),
            running: state.running,
        }
    }

    /// Cancel a pending item by id
    ///
    /// Items already dispatched cannot be cancelled; there is no
    /// preemption primitive. Returns whether an item was removed.
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = lock_state(&self.inner.state);
            match state.pending.iter().position(|r| r.id == id) {
                Some(index) => Some(state.pending.swap_remove(index)),
                None => None,
            }
        };
        match removed {
            Some(request) => {
                let _ = request.tx.send(Err(QueueError::Cancelled(id)));
                true
            }
            None => false,
        }
    }

    /// Cancel every pending item
    pub fn clear(&self) {
        let drained: Vec<QueuedRequest<T>> = {
            let mut state = lock_state(&self.inner.state);
            state.pending.drain(..).collect()
        };
        for request in drained {
            let id = request.id;
            let _ = request.tx.send(Err(QueueError::Cancelled(id)));
        }
    }
}

impl<T: Send + 'static> Drop for RequestQueue<T> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }
}

fn lock_state<T>(state: &Mutex<QueueState<T>>) -> std::sync::MutexGuard<'_, QueueState<T>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn scheduler_loop<T: Send + 'static>(weak: Weak<QueueInner<T>>, notify: Arc<Notify>) {
    loop {
        {
            let Some(inner) = weak.upgrade() else { break };
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            dispatch_ready(&inner);
        }
        notify.notified().await;
    }
}

/// Move items from pending to running while capacity allows
fn dispatch_ready<T: Send + 'static>(inner: &Arc<QueueInner<T>>) {
    loop {
        let request = {
            let mut state = lock_state(&inner.state);
            if state.running >= inner.config.max_concurrent || state.pending.is_empty() {
                return;
            }
            let index = select_next(&state.pending, inner.config.priority_order);
            state.running += 1;
            state.pending.remove(index)
        };
        spawn_attempt(inner.clone(), request);
    }
}

/// Index of the next item: priority rank, then enqueue time, then
/// submission order for same-instant ties
fn select_next<T>(pending: &[QueuedRequest<T>], priority_order: bool) -> usize {
    let mut best = 0;
    for (index, request) in pending.iter().enumerate().skip(1) {
        let better = if priority_order {
            (request.priority.rank(), request.timestamp, request.seq)
                < (
                    pending[best].priority.rank(),
                    pending[best].timestamp,
                    pending[best].seq,
                )
        } else {
            (request.timestamp, request.seq) < (pending[best].timestamp, pending[best].seq)
        };
        if better {
            best = index;
        }
    }
    best
}

fn spawn_attempt<T: Send + 'static>(inner: Arc<QueueInner<T>>, mut request: QueuedRequest<T>) {
    tokio::spawn(async move {
        let outcome = (request.execute)().await;

        match outcome {
            Ok(value) => {
                let _ = request.tx.send(Ok(value));
                finish_slot(&inner);
            }
            Err(error) => {
                if request.retries < request.max_retries {
                    request.retries += 1;
                    let delay = backoff_delay(inner.config.retry_delay, request.retries);
                    log::debug!(
                        "request {} failed (attempt {}), retrying in {:?}: {}",
                        request.id,
                        request.retries,
                        delay,
                        error
                    );
                    finish_slot(&inner);
                    // Re-insert after the backoff delay, then wake the
                    // scheduler; the item competes by its original
                    // enqueue order within its priority band.
                    tokio::time::sleep(delay).await;
                    {
                        let mut state = lock_state(&inner.state);
                        state.pending.push(request);
                    }
                    inner.notify.notify_one();
                } else {
                    let attempts = request.retries + 1;
                    log::warn!(
                        "request {} dropped after {} attempts: {}",
                        request.id,
                        attempts,
                        error
                    );
                    let _ = request.tx.send(Err(QueueError::RetriesExhausted {
                        attempts,
                        last_error: error,
                    }));
                    finish_slot(&inner);
                }
            }
        }
    });
}

fn finish_slot<T>(inner: &Arc<QueueInner<T>>) {
    {
        let mut state = lock_state(&inner.state);
        state.running = state.running.saturating_sub(1);
    }
    inner.notify.notify_one();
}

/// `retry_delay * 2^(retries - 1)`
fn backoff_delay(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retries.saturating_sub(1)))
}
