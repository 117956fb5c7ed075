//! Producer/consumer plumbing shared by every phase.
//!
//! ```text
//!   builder pool ──(sealed chunks)──> uploader pool ──(tokens)──> poller
//!        ^   |
//!        └───┘ builders enqueue builders for subdirectories
//! ```
//!
//! Builder tasks feed themselves, so there is no single "no more work" moment.
//! Completion is inferred by [`IdleDetector`]: every pool has no queued and no
//! running task, and nothing changed for a grace period. Time is read through
//! a [`Clock`] so tests can drive the grace period by hand.

use crate::error::{Result, TransferError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Most tasks a pool will hold in its queue
pub const TASKS_MAX_CAPACITY: usize = 5_000_000;

/// How often the idle detector looks at the pools
pub const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time for idle detection.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        ManualClock(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

// =============================================================================
// StopSignal
// =============================================================================

/// Cooperative graceful-stop flag, checked at task entry and between pages.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is triggered.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// WorkerPool
// =============================================================================

type Task = BoxFuture<'static, Result<()>>;

struct PoolState {
    queue: VecDeque<Task>,
    active: usize,
    last_activity: Instant,
    closed: bool,
}

struct PoolInner {
    name: &'static str,
    limit: AtomicUsize,
    state: Mutex<PoolState>,
    wake: Notify,
    space: Notify,
    error: Mutex<Option<TransferError>>,
    clock: Arc<dyn Clock>,
}

impl PoolInner {
    fn record_error(&self, err: TransferError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            tracing::error!("{} task failed: {}", self.name, err);
            *slot = Some(err);
        } else {
            tracing::debug!("{} task failed: {}", self.name, err);
        }
    }
}

/// Releases a running slot even if the task panics.
struct ActiveGuard(Arc<PoolInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        {
            let mut state = self.0.state.lock();
            state.active -= 1;
            state.last_activity = self.0.clock.now();
        }
        self.0.wake.notify_one();
    }
}

/// Runs submitted tasks with at most `limit` running at once. The limit can
/// change while tasks are running.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, limit: usize, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(PoolInner {
            name,
            limit: AtomicUsize::new(limit.max(1)),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                last_activity: clock.now(),
                closed: false,
            }),
            wake: Notify::new(),
            space: Notify::new(),
            error: Mutex::new(None),
            clock,
        });
        let handle = tokio::spawn(Self::dispatch(inner.clone()));
        Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    async fn dispatch(inner: Arc<PoolInner>) {
        loop {
            {
                let mut state = inner.state.lock();
                let limit = inner.limit.load(Ordering::SeqCst);
                let mut started = false;
                while state.active < limit {
                    let Some(task) = state.queue.pop_front() else {
                        break;
                    };
                    state.active += 1;
                    state.last_activity = inner.clock.now();
                    started = true;
                    let guard = ActiveGuard(inner.clone());
                    let owner = inner.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = task.await {
                            owner.record_error(e);
                        }
                    });
                }
                if started {
                    inner.space.notify_waiters();
                }
                if state.closed && state.queue.is_empty() && state.active == 0 {
                    return;
                }
            }
            inner.wake.notified().await;
        }
    }

    /// Queue a task. Waits while the queue is at capacity.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut task: Option<Task> = Some(Box::pin(task));
        loop {
            let space = self.inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(TransferError::Task(format!(
                        "{} pool is closed",
                        self.inner.name
                    )));
                }
                if state.queue.len() < TASKS_MAX_CAPACITY {
                    if let Some(task) = task.take() {
                        state.queue.push_back(task);
                    }
                    state.last_activity = self.inner.clock.now();
                    drop(state);
                    self.inner.wake.notify_one();
                    return Ok(());
                }
            }
            space.await;
        }
    }

    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let previous = self.inner.limit.swap(limit, Ordering::SeqCst);
        if previous != limit {
            tracing::debug!(
                "{} pool resized from {} to {}",
                self.inner.name,
                previous,
                limit
            );
            self.inner.wake.notify_one();
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// No task queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.active == 0 && state.queue.is_empty()
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.state.lock().last_activity
    }

    pub fn has_error(&self) -> bool {
        self.inner.error.lock().is_some()
    }

    pub fn take_error(&self) -> Option<TransferError> {
        self.inner.error.lock().take()
    }

    /// Stop accepting tasks and wait for queued and running ones to finish.
    pub async fn close(&self) -> Result<()> {
        self.inner.state.lock().closed = true;
        self.inner.wake.notify_one();
        self.inner.space.notify_waiters();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }
}

// =============================================================================
// IdleDetector
// =============================================================================

/// Decides when a set of self-feeding pools has run out of work.
pub struct IdleDetector {
    pools: Vec<WorkerPool>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl IdleDetector {
    pub fn new(pools: Vec<WorkerPool>, clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self {
            pools,
            clock,
            grace,
        }
    }

    /// Every pool is idle and none changed within the grace period.
    pub fn is_idle(&self) -> bool {
        if !self.pools.iter().all(WorkerPool::is_idle) {
            return false;
        }
        let now = self.clock.now();
        self.pools
            .iter()
            .map(WorkerPool::last_activity)
            .all(|at| now.saturating_duration_since(at) >= self.grace)
    }

    /// Wait until idle. Returns early with the first task error of any pool.
    pub async fn wait(&self, check_every: Duration) -> Result<()> {
        loop {
            for pool in &self.pools {
                if let Some(err) = pool.take_error() {
                    return Err(err);
                }
            }
            if self.is_idle() {
                return Ok(());
            }
            tokio::time::sleep(check_every).await;
        }
    }
}
