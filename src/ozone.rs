//! Secondary consumer for moderation events recorded by the local Ozone service.
//!
//! Events are read oldest first and replayed to every reroute destination.
//! Progress is a `createdAt` timestamp cursor persisted after each page.

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cursor::TimestampCursor;
use crate::dispatch::{ActionDispatcher, ModerationEventView, OzoneClient};
use crate::errors::OzoneError;
use crate::metrics::SharedMetricsPublisher;

/// Moderation event types that are replayed to destinations.
pub const FORWARDABLE_EVENT_TYPES: &[&str] = &[
    "tools.ozone.moderation.defs#modEventTakedown",
    "tools.ozone.moderation.defs#modEventReverseTakedown",
    "tools.ozone.moderation.defs#modEventLabel",
    "tools.ozone.moderation.defs#modEventReport",
    "tools.ozone.moderation.defs#modEventEscalate",
    "tools.ozone.moderation.defs#modEventAcknowledge",
    "tools.ozone.moderation.defs#modEventComment",
    "tools.ozone.moderation.defs#modEventTag",
];

#[derive(Clone, Debug)]
pub struct OzoneConsumerConfig {
    pub poll_interval: Duration,
    pub page_limit: u32,
}

impl Default for OzoneConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            page_limit: 100,
        }
    }
}

pub struct OzoneConsumer {
    client: Arc<OzoneClient>,
    dispatcher: Arc<ActionDispatcher>,
    cursor: Arc<TimestampCursor>,
    excluded_creators: HashSet<String>,
    config: OzoneConsumerConfig,
    metrics: SharedMetricsPublisher,
}

impl OzoneConsumer {
    /// `excluded_creators` holds operator DIDs whose events are never replayed,
    /// normally the local operator and every destination operator.
    pub fn new(
        client: Arc<OzoneClient>,
        dispatcher: Arc<ActionDispatcher>,
        cursor: Arc<TimestampCursor>,
        excluded_creators: impl IntoIterator<Item = String>,
        config: OzoneConsumerConfig,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            client,
            dispatcher,
            cursor,
            excluded_creators: excluded_creators.into_iter().collect(),
            config,
            metrics,
        }
    }

    fn should_forward(&self, event: &ModerationEventView) -> bool {
        if self.excluded_creators.contains(&event.created_by) {
            return false;
        }
        FORWARDABLE_EVENT_TYPES.contains(&event.event_type())
    }

    /// Fetch and replay one page. Returns the number of events on the page.
    pub async fn poll_once(&self) -> Result<usize, OzoneError> {
        let page = self
            .client
            .query_events(self.cursor.current(), self.config.page_limit)
            .await
            .map_err(|e| OzoneError::QueryFailed {
                details: e.to_string(),
            })?;

        for event in &page.events {
            if self.should_forward(event) {
                let delivered = self.dispatcher.forward_event(event).await;
                debug!(
                    event_id = event.id,
                    event_type = event.event_type(),
                    created_by = %event.created_by,
                    delivered,
                    "Forwarded moderation event"
                );
            } else {
                trace!(
                    event_id = event.id,
                    event_type = event.event_type(),
                    created_by = %event.created_by,
                    "Moderation event not forwarded"
                );
                self.metrics.incr("ozone.filtered").await;
            }
            self.cursor.advance(event.created_at);
        }

        if !page.events.is_empty() {
            self.metrics.count("ozone.events", page.events.len() as u64).await;
            if let Err(e) = self.cursor.persist().await {
                warn!(error = ?e, "Failed to persist moderation event cursor");
            }
        }
        Ok(page.events.len())
    }

    /// Poll until `cancel` fires. Query failures back off exponentially and are retried.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.poll_interval,
            max_interval: Duration::from_secs(300),
            max_elapsed_time: None,
            ..Default::default()
        };

        info!(
            host = self.client.host(),
            cursor = ?self.cursor.current(),
            "Starting moderation event consumer"
        );

        loop {
            let wait = match self.poll_once().await {
                Ok(count) => {
                    backoff.reset();
                    if count as u32 >= self.config.page_limit {
                        // Full page, more are waiting.
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(300));
                    warn!(error = %e, wait_ms = wait.as_millis() as u64, "Moderation event poll failed");
                    self.metrics.incr("ozone.poll_failed").await;
                    wait
                }
            };

            tokio::select! {
                () = cancel.cancelled() => {
                    if let Err(e) = self.cursor.persist().await {
                        warn!(error = ?e, "Failed to persist moderation event cursor");
                    }
                    info!("Moderation event consumer stopped");
                    return Ok(());
                }
                () = tokio::time::sleep(wait) => {}
            }
        }
    }
}
