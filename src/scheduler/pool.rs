use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use super::RepoScheduler;

struct WorkerHandle {
    id: usize,
    retire: CancellationToken,
}

/// The set of worker tasks draining a [`RepoScheduler`].
///
/// Only the owner (the binary, or the scaling controller) resizes the pool.
pub struct WorkerPool {
    scheduler: Arc<RepoScheduler>,
    tracker: TaskTracker,
    workers: Mutex<Vec<WorkerHandle>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<RepoScheduler>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            tracker: TaskTracker::new(),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn scheduler(&self) -> &Arc<RepoScheduler> {
        &self.scheduler
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Grow or shrink to exactly `target` workers.
    ///
    /// Retired workers finish the event in hand and hand their repository back
    /// to the ready list before exiting.
    pub fn resize(&self, target: usize) {
        if self.scheduler.is_closed() {
            return;
        }
        let mut workers = self.workers.lock();
        while workers.len() < target {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let retire = CancellationToken::new();
            self.tracker
                .spawn(self.scheduler.clone().run_worker(id, retire.clone()));
            workers.push(WorkerHandle { id, retire });
        }
        while workers.len() > target {
            if let Some(handle) = workers.pop() {
                handle.retire.cancel();
                tracing::debug!(worker = handle.id, "Retiring worker");
            }
        }
    }

    /// Close the scheduler and wait for every worker to exit.
    ///
    /// Returns `false` when workers were still busy at the deadline; they are
    /// abandoned and their events stay in flight on the cursor.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.scheduler.close();
        {
            let mut workers = self.workers.lock();
            for handle in workers.drain(..) {
                handle.retire.cancel();
            }
        }
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!(pending = self.scheduler.pending(), "Worker pool drained");
                true
            }
            Err(_) => {
                warn!(
                    busy = self.scheduler.active_workers(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker pool did not drain before the shutdown deadline"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{MemoryCursorStore, StreamCursor, StreamId};
    use crate::event::FirehoseEvent;
    use crate::metrics::NoOpMetricsPublisher;
    use crate::scheduler::{EventProcessor, SchedulerConfig};
    use async_trait::async_trait;

    struct Sleepy(Duration);

    #[async_trait]
    impl EventProcessor for Sleepy {
        async fn process(&self, _event: &FirehoseEvent) {
            tokio::time::sleep(self.0).await;
        }
    }

    fn pool(delay: Duration) -> Arc<WorkerPool> {
        let metrics = Arc::new(NoOpMetricsPublisher);
        let cursor = Arc::new(StreamCursor::new(
            StreamId::Firehose,
            Arc::new(MemoryCursorStore::new()),
            metrics.clone(),
        ));
        let scheduler = RepoScheduler::new(
            SchedulerConfig::default(),
            Arc::new(Sleepy(delay)),
            cursor,
            metrics,
        );
        WorkerPool::new(scheduler)
    }

    #[tokio::test]
    async fn test_resize_grows_and_shrinks() {
        let pool = pool(Duration::from_millis(1));
        pool.resize(4);
        assert_eq!(pool.size(), 4);
        pool.resize(1);
        assert_eq!(pool.size(), 1);
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_unstarted_events_in_flight() {
        let pool = pool(Duration::from_millis(50));
        for seq in 1..=5 {
            pool.scheduler()
                .submit(FirehoseEvent::commit(seq, "did:plc:alice", vec![]))
                .unwrap();
        }
        pool.resize(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(pool.shutdown(Duration::from_secs(2)).await);
        let cursor = pool.scheduler().cursor();
        // The first event finished; the rest were never started.
        assert_eq!(cursor.safe_sequence(), 1);
        assert_eq!(cursor.in_flight(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded() {
        let pool = pool(Duration::from_secs(30));
        pool.scheduler()
            .submit(FirehoseEvent::commit(1, "did:plc:alice", vec![]))
            .unwrap();
        pool.resize(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        assert!(!pool.shutdown(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
