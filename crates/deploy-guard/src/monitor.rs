//! Active rollout watch.
//!
//! While a deployment rolls out, a background task samples the service's
//! error rate and the deployment status on a fixed interval. The watch ends
//! when the rollout settles, when the error rate stays above its ceiling for
//! too many samples in a row, when the watch window elapses, or when the
//! handle is cancelled or dropped. A deployment that is merely steady, with
//! no rollout observed since the watch started, has not completed anything.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::MonitorConfig;
use crate::error::GuardError;
use crate::poll::with_timeout;
use crate::rollback::{RollbackController, RollbackTarget};
use crate::services::{DeploymentStatus, MetricsService, OrchestrationService, Target};

/// How a watched rollout ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RolloutOutcome {
    /// Deployment reached steady state
    Completed {
        samples: u32,
        last_error_rate: Option<f64>,
    },
    /// Error rate stayed above the ceiling
    Failed {
        error_rate: f64,
        /// Revision restored by the automatic rollback
        rolled_back_to: Option<i64>,
        rollback_error: Option<String>,
    },
    /// The watch window elapsed first
    TimedOut { samples: u32 },
    /// Stopped through the handle
    Cancelled,
}

/// Handle to a running rollout watch. Dropping it stops the watch.
pub struct MonitorHandle {
    deployment: String,
    token: CancellationToken,
    task: JoinHandle<RolloutOutcome>,
    _guard: DropGuard,
}

impl MonitorHandle {
    /// Stop the watch. Idempotent.
    pub fn cancel(&self) {
        debug!(deployment = %self.deployment, "Cancelling rollout watch");
        self.token.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the watch to end.
    pub async fn wait(self) -> Result<RolloutOutcome, GuardError> {
        let Self { task, _guard, .. } = self;
        task.await
            .map_err(|e| GuardError::Collaborator(anyhow::anyhow!("rollout watch task failed: {e}")))
    }
}

/// Starts rollout watches.
#[derive(Clone)]
pub struct DeploymentMonitor {
    inner: Arc<Watcher>,
}

struct Watcher {
    orchestration: Arc<dyn OrchestrationService>,
    metrics: Arc<dyn MetricsService>,
    rollback: Arc<RollbackController>,
    config: MonitorConfig,
    call_timeout: Duration,
}

impl DeploymentMonitor {
    #[must_use]
    pub fn new(
        orchestration: Arc<dyn OrchestrationService>,
        metrics: Arc<dyn MetricsService>,
        rollback: Arc<RollbackController>,
        config: MonitorConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Watcher {
                orchestration,
                metrics,
                rollback,
                config,
                call_timeout,
            }),
        }
    }

    /// Record the deployment's current state, then spawn a watch over
    /// `target`'s rollout.
    ///
    /// The rollout counts as complete only once it has been seen under way
    /// (a newer spec generation than the recorded one, or replica counts out
    /// of agreement) and has settled again.
    pub async fn start(&self, target: Target) -> MonitorHandle {
        let baseline = match with_timeout(
            self.inner.call_timeout,
            "deployment status",
            self.inner
                .orchestration
                .deployment_status(&target.namespace, &target.deployment),
        )
        .await
        {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = %e, "Failed to read pre-rollout status");
                None
            }
        };

        let token = CancellationToken::new();
        let watcher = Arc::clone(&self.inner);
        let cancelled = token.clone();
        let deployment = target.qualified();
        let span = tracing::info_span!("rollout_watch", deployment = %deployment);

        info!(
            deployment = %deployment,
            generation = baseline.map(|b| b.generation),
            "Starting rollout watch"
        );
        let task = tokio::spawn(
            async move { watcher.watch(target, baseline, cancelled).await }.instrument(span),
        );

        MonitorHandle {
            deployment,
            _guard: token.clone().drop_guard(),
            token,
            task,
        }
    }
}

/// The status shows a rollout that began after `baseline` was read.
fn rollout_started(baseline: Option<&DeploymentStatus>, status: &DeploymentStatus) -> bool {
    !status.is_steady() || baseline.is_some_and(|b| status.generation > b.generation)
}

impl Watcher {
    async fn watch(
        &self,
        target: Target,
        baseline: Option<DeploymentStatus>,
        cancelled: CancellationToken,
    ) -> RolloutOutcome {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(Duration::from_secs(self.config.max_duration_secs));
        tokio::pin!(deadline);

        let mut samples = 0;
        let mut breaches = 0;
        let mut last_error_rate = None;
        let mut rollout_seen = false;

        loop {
            tokio::select! {
                () = cancelled.cancelled() => {
                    info!("Rollout watch cancelled");
                    return RolloutOutcome::Cancelled;
                }
                () = &mut deadline => {
                    warn!(samples, rollout_seen, "Rollout watch window elapsed before steady state");
                    return RolloutOutcome::TimedOut { samples };
                }
                _ = interval.tick() => {}
            }

            samples += 1;
            let within_ceiling = match with_timeout(
                self.call_timeout,
                "error rate",
                self.metrics.error_rate(&target.service),
            )
            .await
            {
                Ok(rate) if rate > self.config.max_error_rate => {
                    breaches += 1;
                    last_error_rate = Some(rate);
                    warn!(
                        error_rate = rate,
                        ceiling = self.config.max_error_rate,
                        breaches,
                        "Rollout error rate above ceiling"
                    );
                    if breaches >= self.config.consecutive_breaches {
                        return self.fail(&target, rate).await;
                    }
                    false
                }
                Ok(rate) => {
                    breaches = 0;
                    last_error_rate = Some(rate);
                    true
                }
                Err(e) => {
                    warn!(error = %e, "Failed to sample rollout error rate");
                    false
                }
            };

            match with_timeout(
                self.call_timeout,
                "deployment status",
                self.orchestration
                    .deployment_status(&target.namespace, &target.deployment),
            )
            .await
            {
                Ok(status) => {
                    if !rollout_seen && rollout_started(baseline.as_ref(), &status) {
                        debug!(generation = status.generation, "Rollout under way");
                        rollout_seen = true;
                    }
                    // A breaching or missing sample never completes the watch.
                    if rollout_seen && status.is_steady() && within_ceiling {
                        info!(samples, "Rollout reached steady state");
                        return RolloutOutcome::Completed {
                            samples,
                            last_error_rate,
                        };
                    }
                    debug!(
                        replicas = status.replicas,
                        available = status.available_replicas,
                        updated = status.updated_replicas,
                        rollout_seen,
                        "Rollout in progress"
                    );
                }
                Err(e) => warn!(error = %e, "Failed to read rollout status"),
            }
        }
    }

    async fn fail(&self, target: &Target, error_rate: f64) -> RolloutOutcome {
        error!(error_rate, "Rollout failed on sustained error rate");

        if !self.config.rollback_on_failure {
            return RolloutOutcome::Failed {
                error_rate,
                rolled_back_to: None,
                rollback_error: None,
            };
        }

        match self.rollback.rollback(&RollbackTarget::for_target(target)).await {
            Ok(outcome) => RolloutOutcome::Failed {
                error_rate,
                rolled_back_to: Some(outcome.revision),
                rollback_error: None,
            },
            Err(e) => RolloutOutcome::Failed {
                error_rate,
                rolled_back_to: None,
                rollback_error: Some(e.to_string()),
            },
        }
    }
}
