//! Applying rule effects to downstream moderation services.
//!
//! [`ActionDispatcher`] walks the effects for one event in order and sends each
//! to the moderation service, the account host, and any reroute destinations.
//! Every call goes through the shared [`RetryPolicy`]. A recent-keys LRU keyed
//! by event and effect keeps a replayed event from writing twice, and "already
//! exists" responses count as success.

pub mod ozone;
pub mod pds;
pub mod retry;
pub mod slack;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::{AccountAction, Effect, EffectKind};
use crate::errors::{ConfigError, DispatchError};
use crate::metrics::SharedMetricsPublisher;

pub use ozone::{ModerationEventView, OzoneClient};
pub use pds::PdsAdminClient;
pub use retry::RetryPolicy;
pub use slack::SlackNotifier;

const DEFAULT_APPLIED_CAPACITY: usize = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

#[async_trait]
pub trait ModerationService: Send + Sync {
    /// Identifies the service in logs and idempotency keys.
    fn name(&self) -> &str;

    async fn apply(&self, effect: &Effect) -> Result<ApplyOutcome, DispatchError>;

    /// Replay a moderation event recorded by another service.
    async fn forward(&self, event: &ModerationEventView) -> Result<ApplyOutcome, DispatchError>;

    /// Make one authenticated read to confirm the configured credentials.
    async fn verify(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait AccountHostService: Send + Sync {
    async fn takedown(&self, did: &str, reference: &str) -> Result<ApplyOutcome, DispatchError>;

    async fn verify(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), DispatchError>;
}

/// Map a downstream HTTP response onto an outcome or a classified error.
pub(crate) async fn classify_response(
    response: reqwest::Response,
) -> Result<ApplyOutcome, DispatchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(ApplyOutcome::Applied);
    }
    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        409 => Ok(ApplyOutcome::AlreadyApplied),
        400..=499 if body.contains("AlreadyExists") || body.contains("Duplicate") => {
            Ok(ApplyOutcome::AlreadyApplied)
        }
        429 => Err(DispatchError::RateLimited { body }),
        code if code >= 500 => Err(DispatchError::Server { status: code, body }),
        code => Err(DispatchError::Rejected { status: code, body }),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RerouteMode {
    #[default]
    Off,
    /// Apply effects locally and also forward them.
    Additional,
    /// Only forward.
    Exclusive,
}

impl FromStr for RerouteMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "off" | "false" | "0" => Ok(RerouteMode::Off),
            "additional" | "true" | "1" => Ok(RerouteMode::Additional),
            "exclusive" => Ok(RerouteMode::Exclusive),
            other => Err(ConfigError::InvalidValue {
                var_name: "REROUTE_EVENTS".to_string(),
                details: format!("unknown reroute mode {}", other),
            }),
        }
    }
}

/// Where an effect came from, for logging.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub sequence: i64,
    pub did: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub applied: usize,
    pub already_applied: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub dropped: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: &DispatchReport) {
        self.applied += other.applied;
        self.already_applied += other.already_applied;
        self.forwarded += other.forwarded;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }
}

enum Delivery {
    Applied,
    AlreadyApplied,
    Dropped,
}

pub struct ActionDispatcher {
    moderation: Option<Arc<dyn ModerationService>>,
    account_host: Option<Arc<dyn AccountHostService>>,
    destinations: Vec<Arc<dyn ModerationService>>,
    notifier: Option<Arc<dyn Notifier>>,
    reroute: RerouteMode,
    retry: RetryPolicy,
    applied: Mutex<LruCache<String, ()>>,
    metrics: SharedMetricsPublisher,
}

impl ActionDispatcher {
    pub fn new(retry: RetryPolicy, metrics: SharedMetricsPublisher) -> Self {
        Self {
            moderation: None,
            account_host: None,
            destinations: Vec::new(),
            notifier: None,
            reroute: RerouteMode::Off,
            retry,
            applied: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_APPLIED_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            metrics,
        }
    }

    pub fn with_moderation(mut self, service: Arc<dyn ModerationService>) -> Self {
        self.moderation = Some(service);
        self
    }

    pub fn with_account_host(mut self, service: Arc<dyn AccountHostService>) -> Self {
        self.account_host = Some(service);
        self
    }

    pub fn with_reroute(
        mut self,
        mode: RerouteMode,
        destinations: Vec<Arc<dyn ModerationService>>,
    ) -> Self {
        self.reroute = mode;
        self.destinations = destinations;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn reroute_mode(&self) -> RerouteMode {
        self.reroute
    }

    pub fn destinations(&self) -> &[Arc<dyn ModerationService>] {
        &self.destinations
    }

    /// Confirm every configured service accepts our credentials.
    ///
    /// Transient failures are retried with the dispatch policy; anything left
    /// over is returned so startup can abort.
    pub async fn verify_credentials(&self) -> Result<(), DispatchError> {
        for service in self.moderation.iter().chain(self.destinations.iter()) {
            self.retry
                .run("verify_credentials", |_| service.verify())
                .await
                .map_err(|e| DispatchError::CredentialsRejected {
                    service: service.name().to_string(),
                    details: e.to_string(),
                })?;
            info!(service = service.name(), "Moderation service credentials accepted");
        }
        if let Some(host) = &self.account_host {
            self.retry
                .run("verify_credentials", |_| host.verify())
                .await
                .map_err(|e| DispatchError::CredentialsRejected {
                    service: "account-host".to_string(),
                    details: e.to_string(),
                })?;
            info!("Account host credentials accepted");
        }
        Ok(())
    }

    /// Apply `effects` for one event, strictly in order.
    ///
    /// Never fails: exhausted and rejected effects are logged with their full
    /// context and counted as dropped.
    pub async fn dispatch(&self, ctx: &DispatchContext, effects: &[Effect]) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut notable = Vec::new();

        for effect in effects {
            let local = match effect.kind {
                EffectKind::EventReroute => false,
                _ => self.reroute != RerouteMode::Exclusive,
            };
            let forward = self.reroute != RerouteMode::Off;

            if !local && !forward {
                debug!(
                    seq = ctx.sequence,
                    did = %ctx.did,
                    rule = %effect.source_rule,
                    "Reroute disabled, dropping reroute effect"
                );
                report.skipped += 1;
                continue;
            }

            if local {
                match &self.moderation {
                    Some(service) => {
                        let delivery = self.deliver(ctx, service.as_ref(), effect).await;
                        self.record(&mut report, &delivery);
                        if matches!(delivery, Delivery::Applied) {
                            notable.push(effect);
                        }
                        if !matches!(delivery, Delivery::Dropped) {
                            self.apply_account_host(ctx, effect, &mut report).await;
                        }
                    }
                    None => {
                        info!(
                            seq = ctx.sequence,
                            did = %ctx.did,
                            kind = effect.kind.as_str(),
                            target = %effect.target,
                            rule = %effect.source_rule,
                            reason = %effect.reason,
                            "Dry run, moderation service not configured"
                        );
                        report.skipped += 1;
                    }
                }
            }

            if forward {
                for destination in &self.destinations {
                    match self.deliver(ctx, destination.as_ref(), effect).await {
                        Delivery::Dropped => report.dropped += 1,
                        _ => report.forwarded += 1,
                    }
                }
            }
        }

        self.notify(ctx, &notable).await;
        self.metrics
            .count("dispatch.applied", report.applied as u64)
            .await;
        if report.dropped > 0 {
            self.metrics
                .count("dispatch.dropped", report.dropped as u64)
                .await;
        }
        report
    }

    /// Replay a moderation event from the secondary stream to every destination.
    ///
    /// Returns the number of destinations that accepted it.
    pub async fn forward_event(&self, event: &ModerationEventView) -> usize {
        let mut delivered = 0;
        for destination in &self.destinations {
            let key = format!("{}:forward:{}", destination.name(), event.id);
            if self.applied.lock().contains(&key) {
                delivered += 1;
                continue;
            }

            let result = self
                .retry
                .run("forward_event", |_| destination.forward(event))
                .await;
            match result {
                Ok(_) => {
                    self.applied.lock().put(key, ());
                    self.metrics
                        .incr_with_tags("reroute.forwarded", &[("destination", destination.name())])
                        .await;
                    delivered += 1;
                }
                Err(e) => {
                    error!(
                        destination = destination.name(),
                        event_id = event.id,
                        event_type = event.event_type(),
                        error = %e,
                        "Dropped moderation event forward"
                    );
                    self.metrics.incr("reroute.dropped").await;
                }
            }
        }
        delivered
    }

    async fn deliver(
        &self,
        ctx: &DispatchContext,
        service: &dyn ModerationService,
        effect: &Effect,
    ) -> Delivery {
        let key = format!("{}:{}", service.name(), effect.idempotency_key(ctx.sequence));
        if self.applied.lock().contains(&key) {
            info!(
                seq = ctx.sequence,
                did = %ctx.did,
                kind = effect.kind.as_str(),
                target = %effect.target,
                rule = %effect.source_rule,
                "Effect already applied for this event, skipping"
            );
            return Delivery::AlreadyApplied;
        }

        let result = self
            .retry
            .run(effect.kind.as_str(), |_| service.apply(effect))
            .await;

        match result {
            Ok(outcome) => {
                self.applied.lock().put(key, ());
                let tag = match outcome {
                    ApplyOutcome::Applied => "applied",
                    ApplyOutcome::AlreadyApplied => "already_applied",
                };
                self.metrics
                    .incr_with_tags(
                        "dispatch.effects",
                        &[("kind", effect.kind.as_str()), ("outcome", tag)],
                    )
                    .await;
                match outcome {
                    ApplyOutcome::Applied => Delivery::Applied,
                    ApplyOutcome::AlreadyApplied => Delivery::AlreadyApplied,
                }
            }
            Err(e) => {
                error!(
                    seq = ctx.sequence,
                    did = %ctx.did,
                    service = service.name(),
                    kind = effect.kind.as_str(),
                    target = %effect.target,
                    rule = %effect.source_rule,
                    reason = %effect.reason,
                    error = %e,
                    "Dropped moderation effect"
                );
                Delivery::Dropped
            }
        }
    }

    async fn apply_account_host(
        &self,
        ctx: &DispatchContext,
        effect: &Effect,
        report: &mut DispatchReport,
    ) {
        let EffectKind::AccountAction {
            action: AccountAction::Takedown,
        } = effect.kind
        else {
            return;
        };
        let Some(host) = &self.account_host else {
            return;
        };

        let did = effect.target.did();
        let key = format!("account-host:{}", effect.idempotency_key(ctx.sequence));
        if self.applied.lock().contains(&key) {
            return;
        }

        let reference = format!("automod:{}", effect.source_rule);
        match self
            .retry
            .run("takedown", |_| host.takedown(did, &reference))
            .await
        {
            Ok(_) => {
                self.applied.lock().put(key, ());
            }
            Err(e) => {
                error!(
                    seq = ctx.sequence,
                    did = %did,
                    rule = %effect.source_rule,
                    error = %e,
                    "Dropped account host takedown"
                );
                report.dropped += 1;
            }
        }
    }

    fn record(&self, report: &mut DispatchReport, delivery: &Delivery) {
        match delivery {
            Delivery::Applied => report.applied += 1,
            Delivery::AlreadyApplied => report.already_applied += 1,
            Delivery::Dropped => report.dropped += 1,
        }
    }

    async fn notify(&self, ctx: &DispatchContext, effects: &[&Effect]) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let lines: Vec<String> = effects
            .iter()
            .filter(|effect| {
                matches!(
                    effect.kind,
                    EffectKind::AccountAction { .. } | EffectKind::Report { .. }
                )
            })
            .map(|effect| {
                format!(
                    "• {} on {} by {}: {}",
                    effect.kind.as_str(),
                    effect.target,
                    effect.source_rule,
                    effect.reason
                )
            })
            .collect();
        if lines.is_empty() {
            return;
        }

        let text = format!("⚠ Automod actions for `{}`\n{}", ctx.did, lines.join("\n"));
        if let Err(e) = notifier.notify(&text).await {
            warn!(did = %ctx.did, error = %e, "Failed to send notification");
        }
    }
}
