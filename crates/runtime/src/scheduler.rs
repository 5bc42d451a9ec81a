//! Bounded worker pool for cooperative work items.
//!
//! A fixed set of async workers pulls items from a priority queue and runs
//! each one on the blocking pool until it yields. Items decide nothing about
//! their own re-execution: they ask to be woken ([`WorkScheduler::submit`] or
//! [`WorkScheduler::schedule_after`]) and the scheduler decides when.
//!
//! Every item owns a [`WorkGate`]. The gate is what guarantees that a single
//! item never runs on two workers at once: a wake-up that arrives while the
//! item is running is folded into one follow-up run.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_error::{ErrorCode, Result, SluiceError};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Where an item is in its scheduling lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Idle,
    Queued,
    Running,
    /// Woken while running; runs again once the current run returns.
    MoreWork,
    /// Finished; never runs again.
    Done,
}

#[derive(Debug)]
pub struct WorkGate {
    state: Mutex<ThreadState>,
}

impl Default for WorkGate {
    fn default() -> Self {
        Self {
            state: Mutex::new(ThreadState::Idle),
        }
    }
}

impl WorkGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    /// Records a wake-up. Returns true when the caller must enqueue the item.
    pub fn request_run(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ThreadState::Idle => {
                *state = ThreadState::Queued;
                true
            }
            ThreadState::Running => {
                *state = ThreadState::MoreWork;
                false
            }
            ThreadState::Queued | ThreadState::MoreWork | ThreadState::Done => false,
        }
    }

    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ThreadState::Queued {
            *state = ThreadState::Running;
            true
        } else {
            false
        }
    }

    /// Ends a run. Returns true when a wake-up arrived meanwhile.
    fn end(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ThreadState::MoreWork => {
                *state = ThreadState::Queued;
                true
            }
            ThreadState::Running => {
                *state = ThreadState::Idle;
                false
            }
            _ => false,
        }
    }

    /// Marks the item finished. Later wake-ups are ignored.
    pub fn finish(&self) {
        *self.state.lock() = ThreadState::Done;
    }
}

pub trait WorkItem: Send + Sync + 'static {
    fn name(&self) -> String;

    fn gate(&self) -> &WorkGate;

    /// Ordering key; lower values run first.
    fn priority(&self) -> i32 {
        0
    }

    fn created_at(&self) -> Instant;

    /// Runs until completion or the next yield point.
    fn run(&self);

    /// The scheduler refused the item. Called with the gate held, like a run.
    fn on_rejected(&self, error: SluiceError);

    /// `run` panicked.
    fn on_failure(&self, error: SluiceError);
}

struct QueueEntry {
    item: Arc<dyn WorkItem>,
    priority: i32,
    created_at: Instant,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap pops the greatest entry, so every key is reversed
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub max_workers: usize,
    pub submitted: u64,
    pub delayed: u64,
    pub runs: u64,
    pub rejected: u64,
    pub panics: u64,
    pub queued: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delayed: AtomicU64,
    runs: AtomicU64,
    rejected: AtomicU64,
    panics: AtomicU64,
}

struct Inner {
    max_workers: usize,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    work_available: Notify,
    in_flight: AtomicUsize,
    drained: Notify,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    handle: Handle,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkScheduler {
    inner: Arc<Inner>,
}

impl WorkScheduler {
    /// Starts `max_workers` workers on `handle`.
    pub fn new(max_workers: usize, handle: Handle) -> Self {
        let max_workers = max_workers.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            max_workers,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            work_available: Notify::new(),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
            handle: handle.clone(),
            counters: Counters::default(),
            workers: Mutex::new(Vec::with_capacity(max_workers)),
        });

        let workers = (0..max_workers)
            .map(|worker| handle.spawn(worker_loop(inner.clone(), worker)))
            .collect();
        *inner.workers.lock() = workers;

        info!(target: "scheduler", max_workers, "Work scheduler started");
        Self { inner }
    }

    /// Wakes `item`. Queues it unless it is already queued, running or done.
    ///
    /// Fails once the scheduler is shutting down; the item's rejection path
    /// has then already run.
    pub fn submit(&self, item: Arc<dyn WorkItem>) -> Result<()> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            let err = shutdown_error();
            if item.gate().request_run() {
                reject(&self.inner, item, err.clone());
            }
            return Err(err);
        }
        if item.gate().request_run() {
            self.inner.counters.submitted.fetch_add(1, Ordering::Relaxed);
            enqueue(&self.inner, item);
        }
        Ok(())
    }

    /// Wakes `item` no earlier than `delay` from now.
    pub fn schedule_after(&self, item: Arc<dyn WorkItem>, delay: Duration) {
        self.inner.counters.delayed.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "scheduler",
            item = %item.name(),
            delay_ms = delay.as_millis() as u64,
            "Delayed wake-up scheduled"
        );
        let scheduler = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        self.inner.handle.spawn(async move {
            if !*shutdown_rx.borrow() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            if let Err(e) = scheduler.submit(item) {
                debug!(target: "scheduler", error = %e, "Delayed wake-up rejected");
            }
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.inner.counters;
        SchedulerStats {
            max_workers: self.inner.max_workers,
            submitted: counters.submitted.load(Ordering::Relaxed),
            delayed: counters.delayed.load(Ordering::Relaxed),
            runs: counters.runs.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            panics: counters.panics.load(Ordering::Relaxed),
            queued: self.inner.queue.lock().len(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Stops accepting work, rejects everything still queued and waits up to
    /// `timeout` for running items to return. Returns whether it drained.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            debug!(target: "scheduler", "Shutdown already in progress");
        }
        let _ = self.inner.shutdown_tx.send(true);

        let queued: Vec<QueueEntry> = self.inner.queue.lock().drain().collect();
        if !queued.is_empty() {
            info!(target: "scheduler", count = queued.len(), "Rejecting queued work items");
        }
        for entry in queued {
            reject(&self.inner, entry.item, shutdown_error());
        }
        self.inner.work_available.notify_waiters();

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.workers.lock());
            for worker in workers {
                let _ = worker.await;
            }
            info!(target: "scheduler", "Work scheduler stopped");
        } else {
            warn!(
                target: "scheduler",
                in_flight = self.inner.in_flight.load(Ordering::SeqCst),
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timed out with work still running"
            );
        }
        drained
    }
}

fn shutdown_error() -> SluiceError {
    SluiceError::new(
        ErrorCode::SchedulerShutdown,
        "Work scheduler is shutting down",
    )
}

fn enqueue(inner: &Arc<Inner>, item: Arc<dyn WorkItem>) {
    if inner.shutdown.load(Ordering::SeqCst) {
        reject(inner, item, shutdown_error());
        return;
    }
    let entry = QueueEntry {
        priority: item.priority(),
        created_at: item.created_at(),
        seq: inner.seq.fetch_add(1, Ordering::Relaxed),
        item,
    };
    inner.queue.lock().push(entry);
    inner.work_available.notify_one();
}

/// Runs the rejection path of an item whose gate is `Queued`.
fn reject(inner: &Inner, item: Arc<dyn WorkItem>, err: SluiceError) {
    inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
    if !item.gate().begin() {
        return;
    }
    warn!(target: "scheduler", item = %item.name(), error = %err, "Work item rejected");
    item.on_rejected(err);
    // No further runs once rejected
    item.gate().end();
}

async fn worker_loop(inner: Arc<Inner>, worker: usize) {
    trace!(target: "scheduler", worker, "Worker started");
    loop {
        let notified = inner.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = inner.queue.lock().pop();
        if let Some(entry) = next {
            run_entry(&inner, entry.item).await;
            continue;
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        notified.await;
    }
    trace!(target: "scheduler", worker, "Worker stopped");
}

async fn run_entry(inner: &Arc<Inner>, item: Arc<dyn WorkItem>) {
    if !item.gate().begin() {
        return;
    }
    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    inner.counters.runs.fetch_add(1, Ordering::Relaxed);

    let runner = item.clone();
    let panicked = tokio::task::spawn_blocking(move || {
        match std::panic::catch_unwind(AssertUnwindSafe(|| runner.run())) {
            Ok(()) => false,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(target: "scheduler", item = %runner.name(), panic = %message, "Work item panicked");
                runner.on_failure(SluiceError::new(
                    ErrorCode::InternalPanic,
                    format!("Work item panicked: {}", message),
                ));
                true
            }
        }
    })
    .await;

    match panicked {
        Ok(true) => {
            inner.counters.panics.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {}
        Err(e) => {
            error!(target: "scheduler", item = %item.name(), error = %e, "Work item task failed");
            item.on_failure(SluiceError::new(
                ErrorCode::InternalPanic,
                format!("Work item task failed: {}", e),
            ));
        }
    }

    if item.gate().end() {
        enqueue(inner, item);
    }
    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.drained.notify_waiters();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
