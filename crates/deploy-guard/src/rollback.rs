//! Rollback to the last known-good revision.
//!
//! A rollback walks `Idle → SelectingRevision → RollingBack →
//! WaitingForSteadyState → Verifying` and ends in `Complete` or `Failed`.
//! A forensic snapshot of the deployment is written before anything is
//! mutated, and every failure is escalated.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::RollbackConfig;
use crate::error::GuardError;
use crate::metrics::MetricName;
use crate::poll::{poll_until, with_timeout};
use crate::services::{
    DeploymentRevision, Incident, MetricsService, NotificationService, OrchestrationService,
    RevisionStatus, Target,
};

/// A rollback request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackTarget {
    pub namespace: String,
    pub deployment: String,
    /// Explicit revision; the most recent stable one when absent
    pub revision: Option<i64>,
    /// Accept an explicit revision that fails the stability predicate
    pub force: bool,
    /// Pod selector used for verification
    pub selector: String,
    /// Service whose health endpoint and metrics are checked
    pub service: String,
}

impl RollbackTarget {
    #[must_use]
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        let deployment = deployment.into();
        Self {
            namespace: namespace.into(),
            revision: None,
            force: false,
            selector: format!("app={deployment}"),
            service: deployment.clone(),
            deployment,
        }
    }

    /// Rollback request for a guarded target.
    #[must_use]
    pub fn for_target(target: &Target) -> Self {
        Self {
            namespace: target.namespace.clone(),
            deployment: target.deployment.clone(),
            revision: None,
            force: false,
            selector: target.selector.clone(),
            service: target.service.clone(),
        }
    }

    #[must_use]
    pub fn with_revision(mut self, revision: i64) -> Self {
        self.revision = Some(revision);
        self
    }

    #[must_use]
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }
}

/// Rollback state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPhase {
    Idle,
    SelectingRevision,
    RollingBack,
    WaitingForSteadyState,
    Verifying,
    Complete,
    Failed,
}

impl fmt::Display for RollbackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SelectingRevision => "selecting_revision",
            Self::RollingBack => "rolling_back",
            Self::WaitingForSteadyState => "waiting_for_steady_state",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Results of the three post-rollback checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackVerification {
    pub pods_running: usize,
    pub pods_total: usize,
    pub service_healthy: bool,
    pub error_rate: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    /// Failed checks, empty on success
    pub failures: Vec<String>,
}

impl RollbackVerification {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn running_ratio(&self) -> f64 {
        if self.pods_total == 0 {
            0.0
        } else {
            self.pods_running as f64 / self.pods_total as f64
        }
    }
}

/// A completed rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub deployment: String,
    pub revision: i64,
    pub phases: Vec<RollbackPhase>,
    pub snapshot_path: PathBuf,
    pub verification: RollbackVerification,
    pub completed_at: DateTime<Utc>,
}

/// Completed, not marked failed, and recorded error rate below `max_error_rate`.
///
/// A revision without a recorded error rate is not considered stable.
#[must_use]
pub fn is_stable(revision: &DeploymentRevision, max_error_rate: f64) -> bool {
    revision.status == RevisionStatus::Complete
        && !revision.is_labeled_failed()
        && revision
            .metrics
            .error_rate
            .is_some_and(|rate| rate < max_error_rate)
}

/// Highest-numbered stable revision in `history`.
#[must_use]
pub fn select_revision(
    history: &[DeploymentRevision],
    max_error_rate: f64,
) -> Option<&DeploymentRevision> {
    let mut candidates: Vec<&DeploymentRevision> = history.iter().collect();
    candidates.sort_by(|a, b| b.revision.cmp(&a.revision));
    candidates
        .into_iter()
        .find(|revision| is_stable(revision, max_error_rate))
}

/// Selects, performs and verifies rollbacks.
pub struct RollbackController {
    orchestration: Arc<dyn OrchestrationService>,
    metrics: Arc<dyn MetricsService>,
    notifications: Arc<dyn NotificationService>,
    clock: Arc<dyn Clock>,
    config: RollbackConfig,
    call_timeout: Duration,
}

struct Progress {
    deployment: String,
    phases: Vec<RollbackPhase>,
}

impl Progress {
    fn enter(&mut self, phase: RollbackPhase) {
        info!(deployment = %self.deployment, phase = %phase, "Rollback phase");
        self.phases.push(phase);
    }
}

impl RollbackController {
    #[must_use]
    pub fn new(
        orchestration: Arc<dyn OrchestrationService>,
        metrics: Arc<dyn MetricsService>,
        notifications: Arc<dyn NotificationService>,
        clock: Arc<dyn Clock>,
        config: RollbackConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            orchestration,
            metrics,
            notifications,
            clock,
            config,
            call_timeout,
        }
    }

    /// Roll `target` back and verify the result. Every failure is escalated.
    #[instrument(skip(self), fields(deployment = %target.qualified()))]
    pub async fn rollback(&self, target: &RollbackTarget) -> Result<RollbackOutcome, GuardError> {
        let mut progress = Progress {
            deployment: target.qualified(),
            phases: vec![RollbackPhase::Idle],
        };

        match self.run(target, &mut progress).await {
            Ok(outcome) => {
                self.announce(&outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                progress.enter(RollbackPhase::Failed);
                error!(error = %e, "Rollback failed");
                self.escalate(target, &e, &progress.phases).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        target: &RollbackTarget,
        progress: &mut Progress,
    ) -> Result<RollbackOutcome, GuardError> {
        let deployment = target.qualified();

        progress.enter(RollbackPhase::SelectingRevision);
        let history = with_timeout(
            self.call_timeout,
            "revision history",
            self.orchestration
                .deployment_history(&target.namespace, &target.deployment),
        )
        .await
        .map_err(|e| GuardError::RollbackFailed {
            deployment: deployment.clone(),
            reason: format!("could not read revision history: {e:#}"),
        })?;
        let revision = self.resolve_revision(target, &history)?;
        info!(revision, "Selected rollback revision");

        let snapshot_path = self.persist_snapshot(target).await.map_err(|e| {
            GuardError::RollbackFailed {
                deployment: deployment.clone(),
                reason: format!("could not persist pre-rollback snapshot: {e:#}"),
            }
        })?;

        progress.enter(RollbackPhase::RollingBack);
        with_timeout(
            self.call_timeout,
            "rollback",
            self.orchestration
                .rollback_deployment(&target.namespace, &target.deployment, revision),
        )
        .await
        .map_err(|e| GuardError::RollbackFailed {
            deployment: deployment.clone(),
            reason: format!("rollback to revision {revision} rejected: {e:#}"),
        })?;

        progress.enter(RollbackPhase::WaitingForSteadyState);
        let policy = self.config.steady_state_policy();
        poll_until(policy, &format!("rollback of {deployment}"), || async {
            let status = with_timeout(
                self.call_timeout,
                "deployment status",
                self.orchestration
                    .deployment_status(&target.namespace, &target.deployment),
            )
            .await?;
            Ok(status.is_steady())
        })
        .await
        .map_err(|_| GuardError::RollbackTimeout {
            deployment: deployment.clone(),
            attempts: policy.max_attempts,
        })?;

        progress.enter(RollbackPhase::Verifying);
        let verification = self.verify(target).await;
        if !verification.passed() {
            return Err(GuardError::RollbackFailed {
                deployment,
                reason: format!("verification failed: {}", verification.failures.join("; ")),
            });
        }

        progress.enter(RollbackPhase::Complete);
        Ok(RollbackOutcome {
            deployment,
            revision,
            phases: progress.phases.clone(),
            snapshot_path,
            verification,
            completed_at: self.clock.now(),
        })
    }

    fn resolve_revision(
        &self,
        target: &RollbackTarget,
        history: &[DeploymentRevision],
    ) -> Result<i64, GuardError> {
        let deployment = target.qualified();

        if let Some(requested) = target.revision {
            let Some(entry) = history.iter().find(|r| r.revision == requested) else {
                return Err(GuardError::RollbackFailed {
                    deployment,
                    reason: format!("revision {requested} not found in history"),
                });
            };
            if !is_stable(entry, self.config.max_error_rate) {
                if !target.force {
                    return Err(GuardError::RollbackFailed {
                        deployment,
                        reason: format!(
                            "revision {requested} is not stable; pass force to roll back anyway"
                        ),
                    });
                }
                warn!(revision = requested, "Forcing rollback to unstable revision");
            }
            return Ok(requested);
        }

        // The newest revision is the one being rolled back from.
        let current = history.iter().map(|r| r.revision).max();
        let previous: Vec<DeploymentRevision> = history
            .iter()
            .filter(|r| Some(r.revision) != current)
            .cloned()
            .collect();

        select_revision(&previous, self.config.max_error_rate)
            .map(|r| r.revision)
            .ok_or(GuardError::NoStableRevision { deployment })
    }

    async fn persist_snapshot(&self, target: &RollbackTarget) -> anyhow::Result<PathBuf> {
        let snapshot = with_timeout(
            self.call_timeout,
            "deployment snapshot",
            self.orchestration
                .snapshot_deployment(&target.namespace, &target.deployment),
        )
        .await?;

        let dir = PathBuf::from(&self.config.snapshot_dir);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = dir.join(format!(
            "{}-{}-{}.json",
            target.namespace,
            target.deployment,
            self.clock.now().format("%Y%m%dT%H%M%SZ")
        ));
        let body = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(path = %path.display(), "Persisted pre-rollback snapshot");
        Ok(path)
    }

    /// Pod-running ratio, service health, live error rate and latency.
    async fn verify(&self, target: &RollbackTarget) -> RollbackVerification {
        let limit = self.call_timeout;
        let (pods, health, error_rate, snapshot) = tokio::join!(
            with_timeout(
                limit,
                "list pods",
                self.orchestration.pods(&target.namespace, &target.selector)
            ),
            with_timeout(
                limit,
                "service health",
                self.orchestration
                    .service_health(&target.namespace, &target.service)
            ),
            with_timeout(limit, "error rate", self.metrics.error_rate(&target.service)),
            with_timeout(
                limit,
                "current metrics",
                self.metrics.current_metrics(&target.service)
            ),
        );

        let mut verification = RollbackVerification::default();

        match pods {
            Ok(pods) => {
                verification.pods_total = pods.len();
                verification.pods_running = pods.iter().filter(|p| p.is_running()).count();
                if verification.running_ratio() < self.config.min_running_ratio {
                    verification.failures.push(format!(
                        "pod-ratio: {}/{} pods running, need {:.0}%",
                        verification.pods_running,
                        verification.pods_total,
                        self.config.min_running_ratio * 100.0
                    ));
                }
            }
            Err(e) => verification
                .failures
                .push(format!("pod-ratio: pod status unavailable: {e:#}")),
        }

        match health {
            Ok(health) => {
                verification.service_healthy = health.healthy;
                if !health.healthy {
                    verification
                        .failures
                        .push(format!("service-health: {}", health.detail));
                }
            }
            Err(e) => verification
                .failures
                .push(format!("service-health: endpoint unavailable: {e:#}")),
        }

        let mut metric_failures = Vec::new();
        match error_rate {
            Ok(rate) => {
                verification.error_rate = Some(rate);
                if rate >= self.config.verify_max_error_rate {
                    metric_failures.push(format!(
                        "error rate {rate} not below {}",
                        self.config.verify_max_error_rate
                    ));
                }
            }
            Err(e) => metric_failures.push(format!("error rate unavailable: {e:#}")),
        }
        match snapshot.map(|s| s.get(MetricName::LatencyP95Ms)) {
            Ok(Some(latency)) => {
                verification.latency_p95_ms = Some(latency);
                if latency >= self.config.verify_max_latency_p95_ms {
                    metric_failures.push(format!(
                        "p95 latency {latency}ms not below {}ms",
                        self.config.verify_max_latency_p95_ms
                    ));
                }
            }
            Ok(None) => metric_failures.push("p95 latency missing".to_string()),
            Err(e) => metric_failures.push(format!("latency unavailable: {e:#}")),
        }
        if !metric_failures.is_empty() {
            verification
                .failures
                .push(format!("metrics: {}", metric_failures.join(", ")));
        }

        verification
    }

    async fn escalate(&self, target: &RollbackTarget, err: &GuardError, phases: &[RollbackPhase]) {
        let mut incident = Incident::new(
            target.qualified(),
            "rollback_failed",
            format!("Rollback of {} failed", target.qualified()),
            self.clock.now(),
        );
        incident.attempted_actions = phases.iter().map(ToString::to_string).collect();
        incident.error = Some(err.to_string());

        if let Err(e) = with_timeout(
            self.call_timeout,
            "escalation",
            self.notifications.escalate_incident(&incident),
        )
        .await
        {
            error!(error = %e, "Failed to escalate rollback failure");
        }
    }

    async fn announce(&self, outcome: &RollbackOutcome) {
        if let Err(e) = with_timeout(
            self.call_timeout,
            "rollback announcement",
            self.notifications
                .announce_rollback(&outcome.deployment, outcome.revision),
        )
        .await
        {
            warn!(error = %e, "Failed to announce rollback");
        }
    }
}
