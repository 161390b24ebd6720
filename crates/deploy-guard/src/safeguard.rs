//! Pre-deployment safeguard checks.
//!
//! A deployment may only start once every critical check passes. Checks are
//! independent boolean preconditions, run concurrently, and a check that
//! errors or times out simply counts as failed.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::SafeguardConfig;
use crate::error::GuardError;
use crate::services::{MetricsService, OrchestrationService};

pub const CLUSTER_HEALTH: &str = "cluster-health";
pub const RESOURCE_QUOTA: &str = "resource-quota";
pub const BACKUP_STATUS: &str = "backup-status";
pub const CURRENT_LOAD: &str = "current-load";
pub const DEPENDENCIES: &str = "dependencies";
pub const CERTIFICATES: &str = "certificates";
pub const NETWORK_POLICIES: &str = "network-policies";

/// How a failed check affects the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks the deployment
    Critical,
    /// Logged only
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => f.write_str("critical"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

/// A boolean precondition.
#[async_trait]
pub trait Precondition: Send + Sync {
    async fn holds(&self) -> Result<bool>;
}

struct FnPrecondition<F>(F);

#[async_trait]
impl<F, Fut> Precondition for FnPrecondition<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn holds(&self) -> Result<bool> {
        (self.0)().await
    }
}

/// A named, severity-tagged precondition.
#[derive(Clone)]
pub struct SafeguardCheck {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    precondition: Arc<dyn Precondition>,
}

impl SafeguardCheck {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        precondition: Arc<dyn Precondition>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            severity,
            precondition,
        }
    }

    /// Check backed by an async closure.
    #[must_use]
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        precondition: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        Self::new(name, description, severity, Arc::new(FnPrecondition(precondition)))
    }
}

impl fmt::Debug for SafeguardCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeguardCheck")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish_non_exhaustive()
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub passed: bool,
    /// Error or timeout, when the check did not answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Results of a gate that let the deployment through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub results: Vec<CheckResult>,
}

impl GateReport {
    /// Warning checks that failed.
    #[must_use]
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.results
            .iter()
            .filter(|r| !r.passed && r.severity == Severity::Warning)
            .collect()
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

/// Runs the registered safeguard checks.
pub struct SafeguardChecker {
    checks: Vec<SafeguardCheck>,
    check_timeout: Duration,
}

impl SafeguardChecker {
    #[must_use]
    pub fn new(checks: Vec<SafeguardCheck>, check_timeout: Duration) -> Self {
        Self {
            checks,
            check_timeout,
        }
    }

    #[must_use]
    pub fn with_check(mut self, check: SafeguardCheck) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn checks(&self) -> &[SafeguardCheck] {
        &self.checks
    }

    /// Run every check concurrently. Never fails; broken checks report `passed = false`.
    pub async fn run_all(&self) -> Vec<CheckResult> {
        join_all(self.checks.iter().map(|check| self.run_check(check))).await
    }

    /// Run all checks and block on any failed critical check.
    #[instrument(skip(self), fields(checks = self.checks.len()))]
    pub async fn gate(&self) -> Result<GateReport, GuardError> {
        let results = self.run_all().await;

        let blocking: Vec<String> = results
            .iter()
            .filter(|r| !r.passed && r.severity == Severity::Critical)
            .map(|r| r.name.clone())
            .collect();

        for warning in results
            .iter()
            .filter(|r| !r.passed && r.severity == Severity::Warning)
        {
            warn!(check = %warning.name, description = %warning.description, "Safeguard warning");
        }

        if !blocking.is_empty() {
            error!(failed = ?blocking, "Deployment blocked by safeguard checks");
            return Err(GuardError::DeploymentBlocked { reasons: blocking });
        }

        info!(passed = results.iter().filter(|r| r.passed).count(), "Safeguard gate passed");
        Ok(GateReport { results })
    }

    async fn run_check(&self, check: &SafeguardCheck) -> CheckResult {
        let started = Instant::now();
        let (passed, error) = match tokio::time::timeout(self.check_timeout, check.precondition.holds()).await
        {
            Ok(Ok(passed)) => (passed, None),
            Ok(Err(e)) => {
                warn!(check = %check.name, error = %format!("{e:#}"), "Safeguard check errored");
                (false, Some(format!("{e:#}")))
            }
            Err(_) => {
                warn!(check = %check.name, timeout_secs = self.check_timeout.as_secs(), "Safeguard check timed out");
                (
                    false,
                    Some(format!("timed out after {}s", self.check_timeout.as_secs())),
                )
            }
        };

        debug!(check = %check.name, passed, "Safeguard check finished");
        CheckResult {
            name: check.name.clone(),
            description: check.description.clone(),
            severity: check.severity,
            passed,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// The standard pre-deployment battery, thresholds and severities from `config`.
    #[must_use]
    pub fn standard(
        orchestration: Arc<dyn OrchestrationService>,
        metrics: Arc<dyn MetricsService>,
        clock: Arc<dyn Clock>,
        config: &SafeguardConfig,
    ) -> Self {
        let mut checks = Vec::new();
        let severity = |name: &str, default: Severity| {
            config.severities.get(name).copied().unwrap_or(default)
        };

        checks.push(SafeguardCheck::from_fn(
            CLUSTER_HEALTH,
            "All nodes ready and no unhealthy components",
            severity(CLUSTER_HEALTH, Severity::Critical),
            {
                let orchestration = orchestration.clone();
                move || {
                    let orchestration = orchestration.clone();
                    async move {
                        let health = orchestration.cluster_health().await?;
                        if !health.unhealthy.is_empty() {
                            debug!(unhealthy = ?health.unhealthy, "Cluster reports unhealthy components");
                        }
                        Ok(health.is_healthy())
                    }
                }
            },
        ));

        checks.push(SafeguardCheck::from_fn(
            RESOURCE_QUOTA,
            format!(
                "Quota utilization in {} below {:.0}%",
                config.namespace,
                config.max_quota_utilization * 100.0
            ),
            severity(RESOURCE_QUOTA, Severity::Critical),
            {
                let orchestration = orchestration.clone();
                let namespace = config.namespace.clone();
                let ceiling = config.max_quota_utilization;
                move || {
                    let orchestration = orchestration.clone();
                    let namespace = namespace.clone();
                    async move {
                        let quotas = orchestration.resource_quotas(&namespace).await?;
                        Ok(quotas.iter().all(|q| q.utilization() < ceiling))
                    }
                }
            },
        ));

        checks.push(SafeguardCheck::from_fn(
            BACKUP_STATUS,
            format!(
                "Successful backup within the last {}h",
                config.max_backup_age_hours
            ),
            severity(BACKUP_STATUS, Severity::Critical),
            {
                let orchestration = orchestration.clone();
                let clock = clock.clone();
                let max_age = ChronoDuration::hours(config.max_backup_age_hours as i64);
                move || {
                    let orchestration = orchestration.clone();
                    let clock = clock.clone();
                    async move {
                        let Some(backup) = orchestration.latest_backup().await? else {
                            return Ok(false);
                        };
                        Ok(backup.succeeded && clock.now() - backup.completed_at <= max_age)
                    }
                }
            },
        ));

        checks.push(SafeguardCheck::from_fn(
            CURRENT_LOAD,
            format!("Cluster load below {:.0}%", config.max_load * 100.0),
            severity(CURRENT_LOAD, Severity::Warning),
            {
                let metrics = metrics.clone();
                let ceiling = config.max_load;
                move || {
                    let metrics = metrics.clone();
                    async move { Ok(metrics.current_load().await? < ceiling) }
                }
            },
        ));

        checks.push(SafeguardCheck::from_fn(
            DEPENDENCIES,
            "Upstream dependencies healthy",
            severity(DEPENDENCIES, Severity::Critical),
            {
                let orchestration = orchestration.clone();
                let required = config.dependencies.clone();
                move || {
                    let orchestration = orchestration.clone();
                    let required = required.clone();
                    async move {
                        let statuses = orchestration.check_dependencies().await?;
                        let missing = required
                            .iter()
                            .filter(|name| !statuses.iter().any(|s| &s.name == *name))
                            .count();
                        Ok(missing == 0 && statuses.iter().all(|s| s.healthy))
                    }
                }
            },
        ));

        checks.push(SafeguardCheck::from_fn(
            CERTIFICATES,
            format!(
                "Certificates valid for more than {} days",
                config.min_certificate_validity_days
            ),
            severity(CERTIFICATES, Severity::Warning),
            {
                let orchestration = orchestration.clone();
                let clock = clock.clone();
                let min_validity = ChronoDuration::days(config.min_certificate_validity_days as i64);
                move || {
                    let orchestration = orchestration.clone();
                    let clock = clock.clone();
                    async move {
                        let now = clock.now();
                        let certificates = orchestration.check_certificates().await?;
                        Ok(certificates
                            .iter()
                            .all(|c| c.not_after - now > min_validity))
                    }
                }
            },
        ));

        checks.push(SafeguardCheck::from_fn(
            NETWORK_POLICIES,
            format!("Network policies present in {}", config.namespace),
            severity(NETWORK_POLICIES, Severity::Warning),
            {
                let namespace = config.namespace.clone();
                let minimum = config.min_network_policies;
                move || {
                    let orchestration = orchestration.clone();
                    let namespace = namespace.clone();
                    async move {
                        Ok(orchestration.network_policies(&namespace).await?.len() >= minimum)
                    }
                }
            },
        ));

        checks.retain(|check| !config.disabled.contains(&check.name));

        Self::new(checks, Duration::from_secs(config.check_timeout_secs))
    }
}
