//! Post-remediation recovery verification.
//!
//! Recovery criteria are an explicit incident → criterion table. After a
//! remediation runs, the verifier re-samples the triggering metric from its
//! most specific source, checks the target's general health, and only then
//! declares the incident recovered.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::config::RecoveryConfig;
use crate::error::GuardError;
use crate::history::CooldownTable;
use crate::metrics::{Comparison, MetricName, MetricSnapshot};
use crate::poll::with_timeout;
use crate::services::{Incident, MetricsService, NotificationService, OrchestrationService, Target};

/// Classification of a detected incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    PodCrash,
    HighMemory,
    HighLatency,
    HighErrorRate,
    HighCpu,
    DatabaseConnection,
    SlowQueries,
    CacheFragmentation,
    MemoryLeak,
}

impl IncidentType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PodCrash => "pod_crash",
            Self::HighMemory => "high_memory",
            Self::HighLatency => "high_latency",
            Self::HighErrorRate => "high_error_rate",
            Self::HighCpu => "high_cpu",
            Self::DatabaseConnection => "database_connection",
            Self::SlowQueries => "slow_queries",
            Self::CacheFragmentation => "cache_fragmentation",
            Self::MemoryLeak => "memory_leak",
        }
    }

    /// Incident a rule on `metric` remediates when none is configured.
    #[must_use]
    pub const fn for_metric(metric: MetricName) -> Self {
        match metric {
            MetricName::RestartCount => Self::PodCrash,
            MetricName::MemoryUsage => Self::HighMemory,
            MetricName::LatencyP95Ms => Self::HighLatency,
            MetricName::ErrorRate => Self::HighErrorRate,
            MetricName::CpuUsage | MetricName::RequestRate => Self::HighCpu,
            MetricName::ConnectionErrors => Self::DatabaseConnection,
            MetricName::SlowQueries => Self::SlowQueries,
            MetricName::MemoryFragmentation => Self::CacheFragmentation,
            MetricName::MemoryLeak => Self::MemoryLeak,
        }
    }

    /// Built-in recovery criterion.
    #[must_use]
    pub const fn default_criterion(&self) -> RecoveryCriterion {
        match self {
            Self::PodCrash => RecoveryCriterion::new(MetricName::RestartCount, Comparison::Eq, 0.0),
            Self::HighMemory => RecoveryCriterion::new(MetricName::MemoryUsage, Comparison::Lt, 0.80),
            Self::HighLatency => {
                RecoveryCriterion::new(MetricName::LatencyP95Ms, Comparison::Lt, 500.0)
            }
            Self::HighErrorRate => RecoveryCriterion::new(MetricName::ErrorRate, Comparison::Lt, 0.01),
            Self::HighCpu => RecoveryCriterion::new(MetricName::CpuUsage, Comparison::Lt, 0.80),
            Self::DatabaseConnection => {
                RecoveryCriterion::new(MetricName::ConnectionErrors, Comparison::Eq, 0.0)
            }
            Self::SlowQueries => RecoveryCriterion::new(MetricName::SlowQueries, Comparison::Lte, 5.0),
            Self::CacheFragmentation => {
                RecoveryCriterion::new(MetricName::MemoryFragmentation, Comparison::Lt, 1.5)
            }
            Self::MemoryLeak => RecoveryCriterion::new(MetricName::MemoryLeak, Comparison::Eq, 0.0),
        }
    }

    pub const ALL: [Self; 9] = [
        Self::PodCrash,
        Self::HighMemory,
        Self::HighLatency,
        Self::HighErrorRate,
        Self::HighCpu,
        Self::DatabaseConnection,
        Self::SlowQueries,
        Self::CacheFragmentation,
        Self::MemoryLeak,
    ];
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition a re-sampled metric must satisfy for an incident to count as recovered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryCriterion {
    pub metric: MetricName,
    pub comparison: Comparison,
    pub threshold: f64,
}

impl RecoveryCriterion {
    #[must_use]
    pub const fn new(metric: MetricName, comparison: Comparison, threshold: f64) -> Self {
        Self {
            metric,
            comparison,
            threshold,
        }
    }

    #[must_use]
    pub fn is_met(&self, value: f64) -> bool {
        self.comparison.holds(value, self.threshold)
    }
}

impl fmt::Display for RecoveryCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.metric,
            self.comparison.symbol(),
            self.threshold
        )
    }
}

/// Incident → recovery criterion mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryTable {
    criteria: BTreeMap<IncidentType, RecoveryCriterion>,
}

impl Default for RecoveryTable {
    fn default() -> Self {
        Self {
            criteria: IncidentType::ALL
                .iter()
                .map(|incident| (*incident, incident.default_criterion()))
                .collect(),
        }
    }
}

impl RecoveryTable {
    /// Built-in table with `overrides` applied on top.
    #[must_use]
    pub fn with_overrides(overrides: &BTreeMap<IncidentType, RecoveryCriterion>) -> Self {
        let mut table = Self::default();
        table
            .criteria
            .extend(overrides.iter().map(|(incident, criterion)| (*incident, *criterion)));
        table
    }

    #[must_use]
    pub fn criterion(&self, incident: IncidentType) -> RecoveryCriterion {
        self.criteria
            .get(&incident)
            .copied()
            .unwrap_or_else(|| incident.default_criterion())
    }
}

/// Outcome of a recovery check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub incident: IncidentType,
    pub recovered: bool,
    pub criterion: RecoveryCriterion,
    /// Re-sampled value of the criterion metric, when it could be read
    pub observed: Option<f64>,
    /// Failed checks, empty when recovered
    pub failures: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl Verification {
    /// Failed checks joined for messages.
    #[must_use]
    pub fn detail(&self) -> String {
        if self.failures.is_empty() {
            "all checks passed".to_string()
        } else {
            self.failures.join("; ")
        }
    }
}

/// Re-samples targets after remediation and classifies them.
pub struct RecoveryVerifier {
    orchestration: Arc<dyn OrchestrationService>,
    metrics: Arc<dyn MetricsService>,
    notifications: Arc<dyn NotificationService>,
    cooldowns: Arc<CooldownTable>,
    clock: Arc<dyn Clock>,
    table: RecoveryTable,
    config: RecoveryConfig,
    call_timeout: Duration,
}

impl RecoveryVerifier {
    #[must_use]
    pub fn new(
        orchestration: Arc<dyn OrchestrationService>,
        metrics: Arc<dyn MetricsService>,
        notifications: Arc<dyn NotificationService>,
        cooldowns: Arc<CooldownTable>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            table: RecoveryTable::with_overrides(&config.criteria),
            orchestration,
            metrics,
            notifications,
            cooldowns,
            clock,
            config,
            call_timeout,
        }
    }

    #[must_use]
    pub fn table(&self) -> &RecoveryTable {
        &self.table
    }

    /// Check whether `target` recovered from `incident`.
    ///
    /// Collaborator failures count as "not recovered". On recovery the
    /// target's cooldown clock is reset and a recovery notification is sent.
    #[instrument(skip(self, target), fields(target = %target.name, incident = %incident))]
    pub async fn verify(&self, target: &Target, incident: IncidentType) -> Verification {
        let criterion = self.table.criterion(incident);

        let (observed, health) = tokio::join!(
            self.sample(target, criterion.metric),
            self.general_health(target)
        );

        let mut failures = health;
        let observed = match observed {
            Ok(value) => {
                if !criterion.is_met(value) {
                    failures.insert(0, format!("{} = {value} (need {criterion})", criterion.metric));
                }
                Some(value)
            }
            Err(e) => {
                failures.insert(0, format!("{} unavailable: {e:#}", criterion.metric));
                None
            }
        };

        let checked_at = self.clock.now();
        let verification = Verification {
            incident,
            recovered: failures.is_empty(),
            criterion,
            observed,
            failures,
            checked_at,
        };

        if verification.recovered {
            info!(observed = ?observed, "Recovery verified");
            self.cooldowns.stamp(&target.name, checked_at).await;
            self.announce_recovery(target, &verification).await;
        } else {
            warn!(detail = %verification.detail(), "Target still degraded");
        }

        verification
    }

    /// Like [`verify`](Self::verify), failing with `RecoveryNotVerified` when still degraded.
    pub async fn ensure_recovered(
        &self,
        target: &Target,
        incident: IncidentType,
    ) -> Result<Verification, GuardError> {
        let verification = self.verify(target, incident).await;
        if verification.recovered {
            Ok(verification)
        } else {
            Err(GuardError::RecoveryNotVerified {
                target: target.name.clone(),
                incident: incident.to_string(),
                detail: verification.detail(),
            })
        }
    }

    async fn announce_recovery(&self, target: &Target, verification: &Verification) {
        let mut incident = Incident::new(
            &target.name,
            verification.incident.as_str(),
            format!(
                "{} recovered from {} ({})",
                target.name, verification.incident, verification.criterion
            ),
            verification.checked_at,
        );
        incident.metrics = verification.observed.map(|value| {
            MetricSnapshot::new(verification.checked_at).with(verification.criterion.metric, value)
        });

        if let Err(e) = with_timeout(
            self.call_timeout,
            "recovery notification",
            self.notifications.send_recovery_success(&incident),
        )
        .await
        {
            warn!(error = %e, "Failed to send recovery notification");
        }
    }

    /// Read `metric` from its most specific source.
    async fn sample(&self, target: &Target, metric: MetricName) -> Result<f64> {
        let service = target.service.as_str();
        let limit = self.call_timeout;
        match metric {
            MetricName::RestartCount => {
                let pods = with_timeout(
                    limit,
                    "list pods",
                    self.orchestration.pods(&target.namespace, &target.selector),
                )
                .await?;
                Ok(f64::from(pods.iter().map(|p| p.restart_count).max().unwrap_or(0)))
            }
            MetricName::ErrorRate => {
                with_timeout(limit, "error rate", self.metrics.error_rate(service)).await
            }
            MetricName::ConnectionErrors => {
                with_timeout(limit, "connection errors", self.metrics.connection_errors(service))
                    .await
                    .map(|n| n as f64)
            }
            MetricName::SlowQueries => {
                with_timeout(limit, "slow queries", self.metrics.slow_queries(service))
                    .await
                    .map(|n| n as f64)
            }
            MetricName::MemoryFragmentation => {
                with_timeout(
                    limit,
                    "memory fragmentation",
                    self.metrics.memory_fragmentation(service),
                )
                .await
            }
            MetricName::MemoryLeak => {
                with_timeout(limit, "memory leak check", self.metrics.check_memory_leak(service))
                    .await
                    .map(|leaking| if leaking { 1.0 } else { 0.0 })
            }
            _ => {
                let snapshot =
                    with_timeout(limit, "current metrics", self.metrics.current_metrics(service))
                        .await?;
                snapshot
                    .get(metric)
                    .ok_or_else(|| anyhow!("{metric} missing from snapshot"))
            }
        }
    }

    /// Pods running, service healthy, error rate and latency within ceilings.
    async fn general_health(&self, target: &Target) -> Vec<String> {
        let limit = self.call_timeout;
        let (pods, service, error_rate, snapshot) = tokio::join!(
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

        let mut failures = Vec::new();

        if self.config.require_pods_running {
            match pods {
                Ok(pods) if pods.is_empty() => failures.push("no pods found".to_string()),
                Ok(pods) => {
                    let down: Vec<&str> = pods
                        .iter()
                        .filter(|p| !p.is_running())
                        .map(|p| p.name.as_str())
                        .collect();
                    if !down.is_empty() {
                        failures.push(format!("pods not running: {}", down.join(", ")));
                    }
                }
                Err(e) => failures.push(format!("pod status unavailable: {e:#}")),
            }
        }

        if self.config.require_service_healthy {
            match service {
                Ok(health) if health.healthy => {}
                Ok(health) => failures.push(format!("service unhealthy: {}", health.detail)),
                Err(e) => failures.push(format!("service health unavailable: {e:#}")),
            }
        }

        match error_rate {
            Ok(rate) if rate <= self.config.max_error_rate => {}
            Ok(rate) => failures.push(format!(
                "error rate {rate} above {}",
                self.config.max_error_rate
            )),
            Err(e) => failures.push(format!("error rate unavailable: {e:#}")),
        }

        match snapshot.map(|s| s.get(MetricName::LatencyP95Ms)) {
            Ok(Some(latency)) if latency <= self.config.max_latency_p95_ms => {}
            Ok(Some(latency)) => failures.push(format!(
                "p95 latency {latency}ms above {}ms",
                self.config.max_latency_p95_ms
            )),
            Ok(None) => failures.push("p95 latency missing from snapshot".to_string()),
            Err(e) => failures.push(format!("latency unavailable: {e:#}")),
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::{
        MockMetricsService, MockNotificationService, MockOrchestrationService, PodInfo,
        ServiceHealth,
    };

    fn healthy_orchestration(restarts: u32) -> MockOrchestrationService {
        let mut orchestration = MockOrchestrationService::new();
        orchestration.expect_pods().returning(move |_, _| {
            Ok(vec![PodInfo {
                name: "api-0".to_string(),
                phase: "Running".to_string(),
                ready: true,
                restart_count: restarts,
            }])
        });
        orchestration.expect_service_health().returning(|_, _| {
            Ok(ServiceHealth {
                healthy: true,
                detail: "ok".to_string(),
            })
        });
        orchestration
    }

    fn metrics_with_memory(memory: f64) -> MockMetricsService {
        let mut metrics = MockMetricsService::new();
        metrics.expect_error_rate().returning(|_| Ok(0.001));
        metrics.expect_current_metrics().returning(move |_| {
            Ok(MetricSnapshot::new(Utc::now())
                .with(MetricName::MemoryUsage, memory)
                .with(MetricName::LatencyP95Ms, 120.0))
        });
        metrics
    }

    fn verifier(
        orchestration: MockOrchestrationService,
        metrics: MockMetricsService,
        notifications: MockNotificationService,
        cooldowns: Arc<CooldownTable>,
        clock: Arc<ManualClock>,
    ) -> RecoveryVerifier {
        RecoveryVerifier::new(
            Arc::new(orchestration),
            Arc::new(metrics),
            Arc::new(notifications),
            cooldowns,
            clock,
            RecoveryConfig::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_high_memory_recovered_resets_cooldown() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let cooldowns = Arc::new(CooldownTable::new());
        let mut notifications = MockNotificationService::new();
        notifications
            .expect_send_recovery_success()
            .withf(|incident| incident.kind == "high_memory")
            .times(1)
            .returning(|_| Ok(()));

        let verifier = verifier(
            healthy_orchestration(0),
            metrics_with_memory(0.60),
            notifications,
            cooldowns.clone(),
            clock,
        );
        let verification = verifier
            .verify(&Target::named("prod", "api"), IncidentType::HighMemory)
            .await;

        assert!(verification.recovered, "{}", verification.detail());
        assert_eq!(verification.observed, Some(0.60));
        assert_eq!(cooldowns.last_action("api").await, Some(now));
    }

    #[tokio::test]
    async fn test_memory_still_high_is_not_recovered() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cooldowns = Arc::new(CooldownTable::new());
        let mut notifications = MockNotificationService::new();
        notifications.expect_send_recovery_success().never();

        let verifier = verifier(
            healthy_orchestration(0),
            metrics_with_memory(0.92),
            notifications,
            cooldowns.clone(),
            clock,
        );
        let err = verifier
            .ensure_recovered(&Target::named("prod", "api"), IncidentType::HighMemory)
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::RecoveryNotVerified { .. }));
        assert!(err.to_string().contains("memory_usage = 0.92"));
        assert!(cooldowns.last_action("api").await.is_none());
    }

    #[tokio::test]
    async fn test_pod_crash_uses_restart_counts() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut notifications = MockNotificationService::new();
        notifications.expect_send_recovery_success().never();

        let verifier = verifier(
            healthy_orchestration(4),
            metrics_with_memory(0.5),
            notifications,
            Arc::new(CooldownTable::new()),
            clock,
        );
        let verification = verifier
            .verify(&Target::named("prod", "api"), IncidentType::PodCrash)
            .await;
        assert!(!verification.recovered);
        assert_eq!(verification.observed, Some(4.0));
    }

    #[tokio::test]
    async fn test_unreadable_metric_is_not_recovered() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut metrics = metrics_with_memory(0.5);
        metrics
            .expect_connection_errors()
            .returning(|_| Err(anyhow!("prometheus unreachable")));
        let mut notifications = MockNotificationService::new();
        notifications.expect_send_recovery_success().never();

        let verifier = verifier(
            healthy_orchestration(0),
            metrics,
            notifications,
            Arc::new(CooldownTable::new()),
            clock,
        );
        let verification = verifier
            .verify(&Target::named("prod", "db"), IncidentType::DatabaseConnection)
            .await;
        assert!(!verification.recovered);
        assert!(verification.observed.is_none());
        assert!(verification.detail().contains("prometheus unreachable"));
    }

    #[test]
    fn test_table_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            IncidentType::HighLatency,
            RecoveryCriterion::new(MetricName::LatencyP95Ms, Comparison::Lt, 250.0),
        );
        let table = RecoveryTable::with_overrides(&overrides);
        assert!((table.criterion(IncidentType::HighLatency).threshold - 250.0).abs() < f64::EPSILON);
        assert_eq!(
            table.criterion(IncidentType::PodCrash),
            IncidentType::PodCrash.default_criterion()
        );
    }

    #[test]
    fn test_incident_inferred_from_metric() {
        assert_eq!(IncidentType::for_metric(MetricName::MemoryUsage), IncidentType::HighMemory);
        assert_eq!(IncidentType::for_metric(MetricName::RestartCount), IncidentType::PodCrash);
        let json = serde_json::to_string(&IncidentType::CacheFragmentation).unwrap();
        assert_eq!(json, "\"cache_fragmentation\"");
    }
}
