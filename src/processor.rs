//! Worker-side pipeline for one firehose event: resolve the identity,
//! evaluate the rules, dispatch the effects.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::dispatch::{ActionDispatcher, DispatchContext, DispatchReport};
use crate::engine::RuleEngine;
use crate::event::{EventKind, FirehoseEvent};
use crate::identity::{Identity, IdentityDirectory};
use crate::metrics::SharedMetricsPublisher;
use crate::scheduler::EventProcessor;

pub struct RulePipeline {
    identities: Arc<dyn IdentityDirectory>,
    engine: Arc<dyn RuleEngine>,
    dispatcher: Arc<ActionDispatcher>,
    identity_timeout: Duration,
    metrics: SharedMetricsPublisher,
}

impl RulePipeline {
    pub fn new(
        identities: Arc<dyn IdentityDirectory>,
        engine: Arc<dyn RuleEngine>,
        dispatcher: Arc<ActionDispatcher>,
        identity_timeout: Duration,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            identities,
            engine,
            dispatcher,
            identity_timeout,
            metrics,
        }
    }

    /// Resolve the event's account. Failures and timeouts yield `None`; rules
    /// accept an unknown identity.
    async fn resolve_identity(&self, event: &FirehoseEvent) -> Option<Identity> {
        if event.kind == EventKind::Identity
            && let Err(e) = self.identities.purge(&event.did).await
        {
            warn!(did = %event.did, error = ?e, "Failed to purge cached identity");
        }

        match tokio::time::timeout(self.identity_timeout, self.identities.lookup_did(&event.did))
            .await
        {
            Ok(Ok(identity)) => {
                if identity.is_none() {
                    debug!(did = %event.did, "Account not found in identity registry");
                }
                identity
            }
            Ok(Err(e)) => {
                warn!(seq = event.sequence, did = %event.did, error = ?e, "Identity lookup failed");
                self.metrics.incr("identity.lookup_failed").await;
                None
            }
            Err(_) => {
                warn!(
                    seq = event.sequence,
                    did = %event.did,
                    timeout_ms = self.identity_timeout.as_millis() as u64,
                    "Identity lookup timed out"
                );
                self.metrics.incr("identity.lookup_timeout").await;
                None
            }
        }
    }

    /// Run the full pipeline for one event and report what was dispatched.
    #[instrument(skip_all, fields(seq = event.sequence, did = %event.did, kind = event.kind.as_str()))]
    pub async fn handle(&self, event: &FirehoseEvent) -> DispatchReport {
        let started = Instant::now();
        let identity = self.resolve_identity(event).await;

        let effects = match self.engine.evaluate(event, identity.as_ref()).await {
            Ok(effects) => effects,
            Err(e) => {
                warn!(error = %e, "Rule evaluation failed, treating event as having no effects");
                self.metrics.incr("rules.failed").await;
                Vec::new()
            }
        };

        self.metrics
            .time_with_tags(
                "rules.evaluate",
                started.elapsed().as_millis() as u64,
                &[("kind", event.kind.as_str())],
            )
            .await;

        if effects.is_empty() {
            return DispatchReport::default();
        }

        let ctx = DispatchContext {
            sequence: event.sequence,
            did: event.did.clone(),
        };
        let report = self.dispatcher.dispatch(&ctx, &effects).await;
        debug!(
            effects = effects.len(),
            applied = report.applied,
            dropped = report.dropped,
            "Dispatched effects"
        );
        report
    }
}

#[async_trait]
impl EventProcessor for RulePipeline {
    async fn process(&self, event: &FirehoseEvent) {
        self.handle(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ApplyOutcome, ModerationEventView, ModerationService, RetryPolicy};
    use crate::engine::{Effect, EffectTarget};
    use crate::errors::{DispatchError, IdentityError, RuleError};
    use crate::metrics::NoOpMetricsPublisher;
    use crate::test_helpers::test_identity;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubDirectory {
        purged: AtomicUsize,
        slow: bool,
    }

    #[async_trait]
    impl IdentityDirectory for StubDirectory {
        async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(Some(test_identity(did, "alice.test")))
        }

        async fn resolve_handle(&self, _handle: &str) -> Result<Option<String>, IdentityError> {
            Ok(None)
        }

        async fn purge(&self, _did: &str) -> Result<(), IdentityError> {
            self.purged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Labels every event, failing on sequence 13; records whether identity was known.
    #[derive(Default)]
    struct StubEngine {
        saw_identity: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl RuleEngine for StubEngine {
        async fn evaluate(
            &self,
            event: &FirehoseEvent,
            identity: Option<&Identity>,
        ) -> Result<Vec<Effect>, RuleError> {
            self.saw_identity.lock().push(identity.is_some());
            if event.sequence == 13 {
                return Err(RuleError::EvaluationFailed {
                    rule: "stub".to_string(),
                    details: "unlucky".to_string(),
                });
            }
            Ok(vec![Effect::label(
                EffectTarget::account(&event.did),
                &format!("seq-{}", event.sequence),
                "stub",
            )])
        }
    }

    #[derive(Default)]
    struct CountingService(AtomicUsize);

    #[async_trait]
    impl ModerationService for CountingService {
        fn name(&self) -> &str {
            "counting"
        }

        async fn apply(&self, _effect: &Effect) -> Result<ApplyOutcome, DispatchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ApplyOutcome::Applied)
        }

        async fn forward(&self, _event: &ModerationEventView) -> Result<ApplyOutcome, DispatchError> {
            Ok(ApplyOutcome::Applied)
        }
    }

    fn pipeline(
        directory: Arc<StubDirectory>,
        engine: Arc<StubEngine>,
        service: Arc<CountingService>,
    ) -> RulePipeline {
        let metrics = Arc::new(NoOpMetricsPublisher);
        let dispatcher = Arc::new(
            ActionDispatcher::new(RetryPolicy::default(), metrics.clone()).with_moderation(service),
        );
        RulePipeline::new(
            directory,
            engine,
            dispatcher,
            Duration::from_millis(50),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_effects_are_dispatched() {
        let service = Arc::new(CountingService::default());
        let pipeline = pipeline(
            Arc::new(StubDirectory::default()),
            Arc::new(StubEngine::default()),
            service.clone(),
        );

        let report = pipeline
            .handle(&FirehoseEvent::commit(1, "did:plc:alice", vec![]))
            .await;
        assert_eq!(report.applied, 1);
        assert_eq!(service.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rule_error_means_no_effects() {
        let service = Arc::new(CountingService::default());
        let pipeline = pipeline(
            Arc::new(StubDirectory::default()),
            Arc::new(StubEngine::default()),
            service.clone(),
        );

        let report = pipeline
            .handle(&FirehoseEvent::commit(13, "did:plc:alice", vec![]))
            .await;
        assert_eq!(report, DispatchReport::default());
        assert_eq!(service.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identity_timeout_yields_unknown_identity() {
        let engine = Arc::new(StubEngine::default());
        let pipeline = pipeline(
            Arc::new(StubDirectory {
                slow: true,
                ..Default::default()
            }),
            engine.clone(),
            Arc::new(CountingService::default()),
        );

        pipeline
            .handle(&FirehoseEvent::commit(1, "did:plc:alice", vec![]))
            .await;
        assert_eq!(*engine.saw_identity.lock(), vec![false]);
    }

    #[tokio::test]
    async fn test_identity_event_purges_cache() {
        let directory = Arc::new(StubDirectory::default());
        let engine = Arc::new(StubEngine::default());
        let pipeline = pipeline(
            directory.clone(),
            engine.clone(),
            Arc::new(CountingService::default()),
        );

        pipeline
            .handle(&FirehoseEvent::new(
                2,
                "did:plc:alice",
                EventKind::Identity,
                vec![],
            ))
            .await;
        assert_eq!(directory.purged.load(Ordering::SeqCst), 1);
        assert_eq!(*engine.saw_identity.lock(), vec![true]);
    }
}
