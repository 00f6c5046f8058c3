//! Worker-count controller.
//!
//! [`AutoScaler`] is a pure decision function over sampled backlog so it can be
//! driven with synthetic inputs; [`run_autoscaler`] feeds it real samples and
//! applies its decisions to a [`WorkerPool`].

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::WorkerPool;
use crate::errors::SchedulerError;
use crate::metrics::SharedMetricsPublisher;

#[derive(Clone, Debug)]
pub struct ScalingPolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Pending events above which the pool grows.
    pub high_water: usize,
    /// Workers added per growth decision.
    pub step: usize,
    /// How long spare workers must sit idle before one is retired.
    pub idle_cooldown: Duration,
}

impl ScalingPolicy {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(SchedulerError::InvalidWorkerBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        Ok(())
    }
}

/// One observation of scheduler load.
#[derive(Clone, Copy, Debug)]
pub struct ScalingSample {
    pub backlog: usize,
    pub ready_repos: usize,
    pub active_workers: usize,
    pub pool_size: usize,
    pub at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Grow(usize),
    Shrink(usize),
}

impl ScaleDecision {
    pub fn apply(&self, size: usize) -> usize {
        match self {
            ScaleDecision::Hold => size,
            ScaleDecision::Grow(n) => size + n,
            ScaleDecision::Shrink(n) => size.saturating_sub(*n),
        }
    }
}

pub struct AutoScaler {
    policy: ScalingPolicy,
    idle_since: Option<Instant>,
}

impl AutoScaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            idle_since: None,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn observe(&mut self, sample: ScalingSample) -> ScaleDecision {
        let ScalingPolicy {
            min_workers,
            max_workers,
            high_water,
            step,
            idle_cooldown,
        } = self.policy;

        if sample.pool_size < min_workers {
            self.idle_since = None;
            return ScaleDecision::Grow(min_workers - sample.pool_size);
        }
        if sample.pool_size > max_workers {
            self.idle_since = None;
            return ScaleDecision::Shrink(sample.pool_size - max_workers);
        }

        if sample.backlog > high_water {
            self.idle_since = None;
            let room = max_workers - sample.pool_size;
            return if room == 0 {
                ScaleDecision::Hold
            } else {
                ScaleDecision::Grow(step.max(1).min(room))
            };
        }

        let has_spare = sample.active_workers < sample.pool_size && sample.ready_repos == 0;
        if !has_spare {
            self.idle_since = None;
            return ScaleDecision::Hold;
        }

        match self.idle_since {
            None => {
                self.idle_since = Some(sample.at);
                ScaleDecision::Hold
            }
            Some(since) if sample.at.duration_since(since) >= idle_cooldown => {
                if sample.pool_size > min_workers {
                    // Restart the cooldown so shrinking happens one worker at a time.
                    self.idle_since = Some(sample.at);
                    ScaleDecision::Shrink(1)
                } else {
                    ScaleDecision::Hold
                }
            }
            Some(_) => ScaleDecision::Hold,
        }
    }
}

/// Sample the pool every `interval` and resize it within the policy bounds.
pub async fn run_autoscaler(
    pool: Arc<WorkerPool>,
    mut scaler: AutoScaler,
    interval: Duration,
    metrics: SharedMetricsPublisher,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        min = scaler.policy().min_workers,
        max = scaler.policy().max_workers,
        high_water = scaler.policy().high_water,
        "Worker auto-scaling enabled"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let scheduler = pool.scheduler();
        let sample = ScalingSample {
            backlog: scheduler.pending(),
            ready_repos: scheduler.ready_repos(),
            active_workers: scheduler.active_workers(),
            pool_size: pool.size(),
            at: Instant::now(),
        };

        let decision = scaler.observe(sample);
        if decision != ScaleDecision::Hold {
            let target = decision.apply(sample.pool_size);
            debug!(
                backlog = sample.backlog,
                from = sample.pool_size,
                to = target,
                "Resizing worker pool"
            );
            pool.resize(target);
        }

        metrics.gauge("scheduler.pending", sample.backlog as u64).await;
        metrics.gauge("scheduler.workers", pool.size() as u64).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            min_workers: 2,
            max_workers: 10,
            high_water: 50,
            step: 4,
            idle_cooldown: Duration::from_secs(30),
        }
    }

    fn sample(backlog: usize, active: usize, size: usize, at: Instant) -> ScalingSample {
        ScalingSample {
            backlog,
            ready_repos: if backlog > active { backlog - active } else { 0 },
            active_workers: active,
            pool_size: size,
            at,
        }
    }

    #[test]
    fn test_grows_to_minimum() {
        let mut scaler = AutoScaler::new(policy());
        let decision = scaler.observe(sample(0, 0, 0, Instant::now()));
        assert_eq!(decision, ScaleDecision::Grow(2));
    }

    #[test]
    fn test_grows_under_backlog_and_caps_at_max() {
        let mut scaler = AutoScaler::new(policy());
        let now = Instant::now();

        assert_eq!(scaler.observe(sample(200, 2, 2, now)), ScaleDecision::Grow(4));
        assert_eq!(scaler.observe(sample(200, 6, 6, now)), ScaleDecision::Grow(4));
        assert_eq!(scaler.observe(sample(200, 8, 8, now)), ScaleDecision::Grow(2));
        assert_eq!(scaler.observe(sample(200, 10, 10, now)), ScaleDecision::Hold);
    }

    #[test]
    fn test_shrinks_only_after_cooldown() {
        let mut scaler = AutoScaler::new(policy());
        let start = Instant::now();

        assert_eq!(scaler.observe(sample(0, 1, 6, start)), ScaleDecision::Hold);
        assert_eq!(
            scaler.observe(sample(0, 1, 6, start + Duration::from_secs(10))),
            ScaleDecision::Hold
        );
        assert_eq!(
            scaler.observe(sample(0, 1, 6, start + Duration::from_secs(31))),
            ScaleDecision::Shrink(1)
        );
        // Cooldown restarts after each shrink.
        assert_eq!(
            scaler.observe(sample(0, 1, 5, start + Duration::from_secs(32))),
            ScaleDecision::Hold
        );
        assert_eq!(
            scaler.observe(sample(0, 1, 5, start + Duration::from_secs(62))),
            ScaleDecision::Shrink(1)
        );
    }

    #[test]
    fn test_busy_period_resets_idle_timer() {
        let mut scaler = AutoScaler::new(policy());
        let start = Instant::now();

        scaler.observe(sample(0, 1, 6, start));
        // All workers busy: not idle.
        scaler.observe(sample(6, 6, 6, start + Duration::from_secs(20)));
        assert_eq!(
            scaler.observe(sample(0, 1, 6, start + Duration::from_secs(35))),
            ScaleDecision::Hold
        );
    }

    #[test]
    fn test_never_shrinks_below_minimum() {
        let mut scaler = AutoScaler::new(policy());
        let start = Instant::now();

        scaler.observe(sample(0, 0, 2, start));
        assert_eq!(
            scaler.observe(sample(0, 0, 2, start + Duration::from_secs(120))),
            ScaleDecision::Hold
        );
    }

    #[test]
    fn test_policy_validation() {
        let mut invalid = policy();
        invalid.min_workers = 20;
        assert!(invalid.validate().is_err());
        assert!(policy().validate().is_ok());
    }
}
