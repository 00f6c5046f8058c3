//! Relay subscription.
//!
//! [`FirehoseConsumer`] keeps one websocket open to the relay, decodes frames
//! in arrival order, and hands every repository event to the
//! [`RepoScheduler`]. Reads stop while the scheduler applies backpressure.
//! After a disconnect it resumes from the highest sequence it handed off.

pub mod frame;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cursor::StreamCursor;
use crate::errors::{ConfigError, FirehoseError};
use crate::metrics::SharedMetricsPublisher;
use crate::scheduler::RepoScheduler;

pub use frame::{DecodedFrame, decode_frame};

const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Consecutive connection failures after which each failure logs at error level.
const SUSTAINED_FAILURES: u32 = 10;

/// Where to start when no cursor has been persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FirehoseStart {
    #[default]
    Latest,
    Earliest,
    Sequence(i64),
}

impl FirehoseStart {
    fn cursor_param(&self) -> Option<i64> {
        match self {
            FirehoseStart::Latest => None,
            FirehoseStart::Earliest => Some(0),
            FirehoseStart::Sequence(seq) => Some(*seq),
        }
    }
}

impl FromStr for FirehoseStart {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "latest" => Ok(FirehoseStart::Latest),
            "earliest" => Ok(FirehoseStart::Earliest),
            other => other
                .parse::<i64>()
                .ok()
                .filter(|seq| *seq >= 0)
                .map(FirehoseStart::Sequence)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var_name: "FIREHOSE_START".to_string(),
                    details: format!("expected latest, earliest or a sequence number, got {}", other),
                }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FirehoseConfig {
    /// Relay base URL, e.g. `wss://bsky.network`.
    pub relay_host: String,
    pub start: FirehoseStart,
    pub read_timeout: Duration,
}

impl FirehoseConfig {
    pub fn new(relay_host: &str, start: FirehoseStart) -> Self {
        Self {
            relay_host: relay_host.trim_end_matches('/').to_string(),
            start,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Subscription URL, resuming after `resume_from` when it is set.
    pub fn subscribe_url(&self, resume_from: Option<i64>) -> String {
        let base = format!("{}/xrpc/com.atproto.sync.subscribeRepos", self.relay_host);
        match resume_from.or(self.start.cursor_param()) {
            Some(seq) => format!("{}?cursor={}", base, seq),
            None => base,
        }
    }
}

pub struct FirehoseConsumer {
    config: FirehoseConfig,
    scheduler: Arc<RepoScheduler>,
    metrics: SharedMetricsPublisher,
}

impl FirehoseConsumer {
    pub fn new(
        config: FirehoseConfig,
        scheduler: Arc<RepoScheduler>,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            config,
            scheduler,
            metrics,
        }
    }

    fn cursor(&self) -> &Arc<StreamCursor> {
        self.scheduler.cursor()
    }

    fn resume_from(&self) -> Option<i64> {
        let claimed = self.cursor().last_claimed();
        (claimed > 0).then_some(claimed)
    }

    /// Consume until `cancel` fires, reconnecting with exponential backoff.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.connect_and_consume(&cancel, &mut backoff, &mut failures).await {
                Ok(()) => {
                    info!(
                        last_claimed = self.cursor().last_claimed(),
                        "Firehose consumer stopped"
                    );
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    self.metrics.incr("firehose.reconnects").await;
                    if failures >= SUSTAINED_FAILURES {
                        error!(
                            error = %e,
                            failures,
                            wait_ms = wait.as_millis() as u64,
                            "Firehose connection keeps failing, reconnecting"
                        );
                    } else {
                        warn!(
                            error = %e,
                            failures,
                            wait_ms = wait.as_millis() as u64,
                            "Firehose connection lost, reconnecting"
                        );
                    }

                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_consume(
        &self,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
        failures: &mut u32,
    ) -> Result<(), FirehoseError> {
        let url = self.config.subscribe_url(self.resume_from());
        info!(url = %url, "Connecting to firehose");

        let (stream, _) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = connect_async(url.as_str()) => result.map_err(|e| FirehoseError::ConnectionFailed {
                details: e.to_string(),
            })?,
        };
        let (mut write, mut read) = stream.split();
        backoff.reset();
        *failures = 0;
        info!("Firehose connected");

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                result = timeout(self.config.read_timeout, read.next()) => result,
            };

            match result {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    let handled = tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        handled = self.handle_frame(&data) => handled,
                    };
                    match handled {
                        Ok(()) => {}
                        Err(FirehoseError::SchedulerClosed { seq }) => {
                            debug!(seq, "Scheduler closed, stopping firehose consumer");
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(Some(Ok(Message::Ping(data)))) => {
                    trace!("Received ping, sending pong");
                    write
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| FirehoseError::Transport {
                            details: format!("pong failed: {}", e),
                        })?;
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return Err(FirehoseError::Transport {
                        details: format!("connection closed by relay: {:?}", frame),
                    });
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    return Err(FirehoseError::Transport {
                        details: e.to_string(),
                    });
                }
                Ok(None) => {
                    return Err(FirehoseError::Transport {
                        details: "stream ended".to_string(),
                    });
                }
                Err(_) => {
                    return Err(FirehoseError::ReadTimeout {
                        seconds: self.config.read_timeout.as_secs(),
                    });
                }
            }
        }
    }

    /// Decode one frame and hand its event to the scheduler.
    ///
    /// Waits while the scheduler is at capacity. Undecodable frames are
    /// skipped; when their sequence is readable the cursor still moves past
    /// them. Only relay error frames and a closed scheduler are returned as
    /// errors.
    pub async fn handle_frame(&self, data: &[u8]) -> Result<(), FirehoseError> {
        let cursor = self.cursor();
        match decode_frame(data).await {
            Ok(DecodedFrame::Event(event)) => {
                let seq = event.sequence;
                if seq <= cursor.last_claimed() {
                    trace!(seq, "Dropping replayed frame");
                    self.metrics.incr("firehose.replayed").await;
                    return Ok(());
                }
                let kind = event.kind.as_str();
                self.scheduler
                    .enqueue(event)
                    .await
                    .map_err(|_| FirehoseError::SchedulerClosed { seq })?;
                self.metrics
                    .incr_with_tags("firehose.events", &[("kind", kind)])
                    .await;
            }
            Ok(DecodedFrame::Sequenced { seq, message_type }) => {
                trace!(seq, message_type = %message_type, "Frame needs no processing");
                cursor.advance(seq);
            }
            Ok(DecodedFrame::Info { name, message }) => {
                info!(name = ?name, message = ?message, "Relay info frame");
            }
            Ok(DecodedFrame::Ignored { message_type }) => {
                trace!(message_type = ?message_type, "Ignoring frame");
            }
            Err(e @ FirehoseError::ErrorFrame { .. }) => {
                error!(error = %e, "Relay sent error frame");
                return Err(e);
            }
            Err(FirehoseError::PayloadDecode {
                seq: Some(seq),
                message_type,
                details,
            }) => {
                warn!(seq, message_type = %message_type, error = %details, "Skipping undecodable frame");
                self.metrics.incr("firehose.decode_failed").await;
                cursor.advance(seq);
            }
            Err(e) => {
                warn!(error = %e, last_claimed = cursor.last_claimed(), "Skipping undecodable frame");
                self.metrics.incr("firehose.decode_failed").await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{MemoryCursorStore, StreamId};
    use crate::event::FirehoseEvent;
    use crate::firehose::frame::tests::{commit_frame, make_frame};
    use crate::metrics::NoOpMetricsPublisher;
    use crate::scheduler::{EventProcessor, SchedulerConfig, WorkerPool};
    use crate::test_helpers::MockMetricsPublisher;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::Serialize;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<i64>>);

    #[async_trait]
    impl EventProcessor for Recorder {
        async fn process(&self, event: &FirehoseEvent) {
            self.0.lock().push(event.sequence);
        }
    }

    fn consumer(config: SchedulerConfig, processor: Arc<Recorder>) -> FirehoseConsumer {
        let metrics = Arc::new(NoOpMetricsPublisher);
        let cursor = Arc::new(StreamCursor::new(
            StreamId::Firehose,
            Arc::new(MemoryCursorStore::new()),
            metrics.clone(),
        ));
        let scheduler = RepoScheduler::new(config, processor, cursor, metrics.clone());
        FirehoseConsumer::new(
            FirehoseConfig::new("ws://127.0.0.1:1", FirehoseStart::Latest),
            scheduler,
            metrics,
        )
    }

    #[derive(Serialize)]
    struct BrokenCommit {
        seq: i64,
        repo: i64,
    }

    #[test]
    fn test_firehose_start_parsing() {
        assert_eq!("latest".parse::<FirehoseStart>().unwrap(), FirehoseStart::Latest);
        assert_eq!("earliest".parse::<FirehoseStart>().unwrap(), FirehoseStart::Earliest);
        assert_eq!("42".parse::<FirehoseStart>().unwrap(), FirehoseStart::Sequence(42));
        assert!("-3".parse::<FirehoseStart>().is_err());
        assert!("soon".parse::<FirehoseStart>().is_err());
    }

    #[test]
    fn test_subscribe_url() {
        let config = FirehoseConfig::new("wss://relay.test/", FirehoseStart::Latest);
        assert_eq!(
            config.subscribe_url(None),
            "wss://relay.test/xrpc/com.atproto.sync.subscribeRepos"
        );
        assert_eq!(
            config.subscribe_url(Some(77)),
            "wss://relay.test/xrpc/com.atproto.sync.subscribeRepos?cursor=77"
        );
        let earliest = FirehoseConfig::new("wss://relay.test", FirehoseStart::Earliest);
        assert!(earliest.subscribe_url(None).ends_with("?cursor=0"));
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_stream() {
        let recorder = Arc::new(Recorder::default());
        let consumer = consumer(SchedulerConfig::default(), recorder.clone());

        consumer
            .handle_frame(&commit_frame(1, "did:plc:alice", &[("create", "app.bsky.feed.post/a")]))
            .await
            .unwrap();
        consumer
            .handle_frame(&make_frame(1, Some("#commit"), &BrokenCommit { seq: 2, repo: 7 }))
            .await
            .unwrap();
        consumer.handle_frame(b"\xff\x00garbage").await.unwrap();
        consumer
            .handle_frame(&commit_frame(3, "did:plc:bob", &[("create", "app.bsky.feed.post/b")]))
            .await
            .unwrap();

        let scheduler = consumer.scheduler.clone();
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.cursor().last_claimed(), 3);

        let pool = WorkerPool::new(scheduler.clone());
        pool.resize(2);
        for _ in 0..100 {
            if scheduler.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(pool.shutdown(Duration::from_secs(1)).await);

        let mut seen = recorder.0.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 3]);
        // The malformed frame's sequence is passed over, not held back.
        assert_eq!(scheduler.cursor().safe_sequence(), 3);
    }

    #[tokio::test]
    async fn test_replayed_frames_are_dropped() {
        let metrics = Arc::new(MockMetricsPublisher::new());
        let cursor = Arc::new(StreamCursor::new(
            StreamId::Firehose,
            Arc::new(MemoryCursorStore::new()),
            metrics.clone(),
        ));
        let scheduler = RepoScheduler::new(
            SchedulerConfig::default(),
            Arc::new(Recorder::default()),
            cursor,
            metrics.clone(),
        );
        let consumer = FirehoseConsumer::new(
            FirehoseConfig::new("ws://127.0.0.1:1", FirehoseStart::Latest),
            scheduler,
            metrics.clone(),
        );

        let frame = commit_frame(10, "did:plc:alice", &[("create", "app.bsky.feed.post/a")]);
        consumer.handle_frame(&frame).await.unwrap();
        consumer.handle_frame(&frame).await.unwrap();
        assert_eq!(consumer.scheduler.pending(), 1);
        assert_eq!(metrics.get_counter("firehose.replayed"), 1);
        assert_eq!(metrics.get_counter("firehose.events"), 1);
    }

    #[tokio::test]
    async fn test_error_frame_is_transport_error() {
        #[derive(Serialize)]
        struct ErrorBody {
            error: String,
            message: String,
        }
        let consumer = consumer(SchedulerConfig::default(), Arc::new(Recorder::default()));
        let frame = make_frame(
            -1,
            None,
            &ErrorBody {
                error: "FutureCursor".to_string(),
                message: "cursor in the future".to_string(),
            },
        );
        let err = consumer.handle_frame(&frame).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_backpressure_pauses_intake() {
        let config = SchedulerConfig {
            max_pending: 2,
            ..SchedulerConfig::default()
        };
        let consumer = Arc::new(consumer(config, Arc::new(Recorder::default())));
        for seq in 1..=2 {
            consumer
                .handle_frame(&commit_frame(seq, "did:plc:alice", &[]))
                .await
                .unwrap();
        }

        let blocked = {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                consumer
                    .handle_frame(&commit_frame(3, "did:plc:alice", &[]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(consumer.scheduler.pending(), 2);

        let pool = WorkerPool::new(consumer.scheduler.clone());
        pool.resize(1);
        blocked.await.unwrap().unwrap();
        assert!(pool.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_run_consumes_from_websocket() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            for seq in [5, 6] {
                ws.send(Message::Binary(commit_frame(seq, "did:plc:alice", &[])))
                    .await
                    .unwrap();
            }
            // Hold the connection open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let metrics = Arc::new(NoOpMetricsPublisher);
        let cursor = Arc::new(StreamCursor::new(
            StreamId::Firehose,
            Arc::new(MemoryCursorStore::new()),
            metrics.clone(),
        ));
        let scheduler = RepoScheduler::new(
            SchedulerConfig::default(),
            Arc::new(Recorder::default()),
            cursor,
            metrics.clone(),
        );
        let consumer = Arc::new(FirehoseConsumer::new(
            FirehoseConfig::new(&format!("ws://{}", addr), FirehoseStart::Latest),
            scheduler.clone(),
            metrics,
        ));

        let cancel = CancellationToken::new();
        let handle = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        for _ in 0..200 {
            if scheduler.pending() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.cursor().last_claimed(), 6);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
