//! Per-repository ordered scheduling.
//!
//! Events are grouped into one queue per repository DID. A worker claims a
//! whole queue, drains it in arrival order, and releases it, so at most one
//! worker ever processes a given repository at a time. Different repositories
//! proceed independently.

pub mod autoscale;
pub mod pool;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cursor::StreamCursor;
use crate::errors::SchedulerError;
use crate::event::FirehoseEvent;
use crate::metrics::SharedMetricsPublisher;

pub use autoscale::{AutoScaler, ScaleDecision, ScalingPolicy, ScalingSample, run_autoscaler};
pub use pool::WorkerPool;

/// Work performed for each event once its repository queue is claimed.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &FirehoseEvent);
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Upper bound on events accepted but not yet completed.
    pub max_pending: usize,
    /// Upper bound on events waiting in any single repository queue.
    pub max_repo_depth: usize,
    /// Events a worker drains from one repository before giving others a turn.
    pub batch_limit: usize,
    /// Processing bound for one event; the event is abandoned past it.
    pub event_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            max_repo_depth: 500,
            batch_limit: 32,
            event_timeout: Duration::from_secs(60),
        }
    }
}

/// Why a non-blocking submit was refused. The event is handed back.
#[derive(Debug)]
pub enum SubmitError {
    Backpressure(FirehoseEvent),
    Closed(FirehoseEvent),
}

#[derive(Default)]
struct RepoQueue {
    events: VecDeque<FirehoseEvent>,
    owner: Option<usize>,
}

#[derive(Default)]
struct QueueArena {
    queues: HashMap<String, RepoQueue>,
    /// Repositories with pending events and no owner, in the order they became eligible.
    ready: VecDeque<String>,
}

pub struct RepoScheduler {
    config: SchedulerConfig,
    processor: Arc<dyn EventProcessor>,
    cursor: Arc<StreamCursor>,
    metrics: SharedMetricsPublisher,
    arena: Mutex<QueueArena>,
    pending: AtomicUsize,
    active: AtomicUsize,
    closed: AtomicBool,
    work_ready: Notify,
    capacity_freed: Notify,
}

impl RepoScheduler {
    pub fn new(
        config: SchedulerConfig,
        processor: Arc<dyn EventProcessor>,
        cursor: Arc<StreamCursor>,
        metrics: SharedMetricsPublisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            processor,
            cursor,
            metrics,
            arena: Mutex::new(QueueArena::default()),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            work_ready: Notify::new(),
            capacity_freed: Notify::new(),
        })
    }

    /// Non-blocking enqueue onto the event's repository queue.
    ///
    /// On success the event's sequence is claimed on the cursor.
    pub fn submit(&self, event: FirehoseEvent) -> Result<(), SubmitError> {
        let mut arena = self.arena.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed(event));
        }
        if self.pending.load(Ordering::SeqCst) >= self.config.max_pending {
            return Err(SubmitError::Backpressure(event));
        }

        let did = event.did.clone();
        let queue = arena.queues.entry(did.clone()).or_default();
        if queue.events.len() >= self.config.max_repo_depth {
            return Err(SubmitError::Backpressure(event));
        }

        let became_ready = queue.owner.is_none() && queue.events.is_empty();
        self.cursor.claim(event.sequence);
        queue.events.push_back(event);
        self.pending.fetch_add(1, Ordering::SeqCst);
        if became_ready {
            arena.ready.push_back(did);
        }
        drop(arena);

        self.work_ready.notify_one();
        Ok(())
    }

    /// Flow-controlled enqueue used by stream consumers.
    ///
    /// Waits for capacity instead of buffering past the configured bounds.
    pub async fn enqueue(&self, mut event: FirehoseEvent) -> Result<(), SchedulerError> {
        let mut throttled_at: Option<Instant> = None;
        loop {
            let notified = self.capacity_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.submit(event) {
                Ok(()) => {
                    if let Some(started) = throttled_at {
                        self.metrics
                            .time("scheduler.backpressure_wait", started.elapsed().as_millis() as u64)
                            .await;
                    }
                    return Ok(());
                }
                Err(SubmitError::Closed(_)) => return Err(SchedulerError::Closed),
                Err(SubmitError::Backpressure(returned)) => {
                    if throttled_at.is_none() {
                        debug!(
                            did = %returned.did,
                            seq = returned.sequence,
                            pending = self.pending(),
                            "Scheduler at capacity, pausing intake"
                        );
                        self.metrics.incr("scheduler.backpressure").await;
                        throttled_at = Some(Instant::now());
                    }
                    event = returned;
                    notified.await;
                }
            }
        }
    }

    /// Stop accepting events and wake idle workers so they can exit.
    ///
    /// Events still queued are left unprocessed; they remain in flight on the
    /// cursor and are replayed after restart.
    pub fn close(&self) {
        {
            let _arena = self.arena.lock();
            self.closed.store(true, Ordering::SeqCst);
        }
        self.work_ready.notify_waiters();
        self.capacity_freed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn ready_repos(&self) -> usize {
        self.arena.lock().ready.len()
    }

    pub fn queue_count(&self) -> usize {
        self.arena.lock().queues.len()
    }

    pub fn cursor(&self) -> &Arc<StreamCursor> {
        &self.cursor
    }

    fn claim_next(&self, worker_id: usize) -> Option<String> {
        let mut arena = self.arena.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        while let Some(did) = arena.ready.pop_front() {
            if let Some(queue) = arena.queues.get_mut(&did)
                && queue.owner.is_none()
                && !queue.events.is_empty()
            {
                queue.owner = Some(worker_id);
                return Some(did);
            }
        }
        None
    }

    /// Pop the next event of a claimed queue, or release and collect the queue when empty.
    fn take_next(&self, worker_id: usize, did: &str) -> Option<FirehoseEvent> {
        let mut arena = self.arena.lock();
        let queue = arena.queues.get_mut(did)?;
        debug_assert_eq!(queue.owner, Some(worker_id));
        match queue.events.pop_front() {
            Some(event) => Some(event),
            None => {
                arena.queues.remove(did);
                None
            }
        }
    }

    /// Give up ownership of a claimed queue that may still hold events.
    fn release(&self, worker_id: usize, did: &str) {
        let mut arena = self.arena.lock();
        let Some(queue) = arena.queues.get_mut(did) else {
            return;
        };
        if queue.owner != Some(worker_id) {
            return;
        }
        queue.owner = None;
        if queue.events.is_empty() {
            arena.queues.remove(did);
            return;
        }
        arena.ready.push_back(did.to_string());
        drop(arena);
        self.work_ready.notify_one();
    }

    async fn process_one(&self, worker_id: usize, event: FirehoseEvent) {
        let seq = event.sequence;
        let started = Instant::now();
        self.active.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::time::timeout(self.config.event_timeout, self.processor.process(&event)).await;
        if outcome.is_err() {
            warn!(
                worker = worker_id,
                did = %event.did,
                seq,
                timeout_ms = self.config.event_timeout.as_millis() as u64,
                "Event processing timed out, abandoning event"
            );
            self.metrics.incr("worker.event_abandoned").await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.cursor.complete(seq);
        self.capacity_freed.notify_waiters();
        self.metrics
            .time("worker.event", started.elapsed().as_millis() as u64)
            .await;
    }

    /// Drain one claimed repository until it is empty, the batch limit is hit,
    /// or the worker is told to stop.
    async fn drain_repo(&self, worker_id: usize, did: &str, retire: &CancellationToken) {
        let mut processed = 0;
        loop {
            if retire.is_cancelled() || self.is_closed() || processed >= self.config.batch_limit {
                self.release(worker_id, did);
                return;
            }
            let Some(event) = self.take_next(worker_id, did) else {
                return;
            };
            self.process_one(worker_id, event).await;
            processed += 1;
        }
    }

    /// Worker loop: claim an eligible repository, drain it, repeat.
    pub(crate) async fn run_worker(self: Arc<Self>, worker_id: usize, retire: CancellationToken) {
        debug!(worker = worker_id, "Worker started");
        loop {
            if retire.is_cancelled() || self.is_closed() {
                break;
            }

            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(did) = self.claim_next(worker_id) {
                self.drain_repo(worker_id, &did, &retire).await;
                continue;
            }

            tokio::select! {
                () = &mut notified => {}
                () = retire.cancelled() => break,
            }
        }
        debug!(worker = worker_id, "Worker stopped");
    }
}
