//! Facade wiring every component from one configuration.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::adapters::{
    ChannelNotifier, EventJournal, HttpDataPlane, KubectlOrchestrator, PrometheusMetrics,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{GuardConfig, TargetConfig};
use crate::error::{GuardError, Result};
use crate::executor::ActionExecutor;
use crate::history::{CooldownTable, EventLog};
use crate::monitor::{DeploymentMonitor, MonitorHandle};
use crate::orchestrator::{GuardedTarget, OrchestratorParts, RemediationOrchestrator, TickSummary};
use crate::poll::with_timeout;
use crate::report::RemediationReport;
use crate::rollback::{RollbackController, RollbackOutcome, RollbackTarget};
use crate::rules::RuleEvaluator;
use crate::safeguard::{GateReport, SafeguardChecker};
use crate::services::{
    DataPlaneService, MetricsService, NotificationService, OrchestrationService, Target,
};
use crate::verifier::RecoveryVerifier;

/// The engine's produced interface.
pub struct DeployGuard {
    config: GuardConfig,
    /// Targets as of the latest configuration applied
    targets: RwLock<Vec<TargetConfig>>,
    safeguards: SafeguardChecker,
    rollback: Arc<RollbackController>,
    orchestrator: RemediationOrchestrator,
    notifications: Arc<dyn NotificationService>,
}

/// Collects collaborators for [`DeployGuard`].
#[derive(Default)]
pub struct DeployGuardBuilder {
    config: GuardConfig,
    orchestration: Option<Arc<dyn OrchestrationService>>,
    metrics: Option<Arc<dyn MetricsService>>,
    data_plane: Option<Arc<dyn DataPlaneService>>,
    notifications: Option<Arc<dyn NotificationService>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DeployGuardBuilder {
    #[must_use]
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn orchestration(mut self, orchestration: Arc<dyn OrchestrationService>) -> Self {
        self.orchestration = Some(orchestration);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn data_plane(mut self, data_plane: Arc<dyn DataPlaneService>) -> Self {
        self.data_plane = Some(data_plane);
        self
    }

    #[must_use]
    pub fn notifications(mut self, notifications: Arc<dyn NotificationService>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and wire the components.
    pub fn build(self) -> Result<DeployGuard> {
        let missing = |what: &str| GuardError::Config(format!("no {what} service provided"));
        let orchestration = self.orchestration.ok_or_else(|| missing("orchestration"))?;
        let metrics = self.metrics.ok_or_else(|| missing("metrics"))?;
        let data_plane = self.data_plane.ok_or_else(|| missing("data-plane"))?;
        let notifications = self.notifications.ok_or_else(|| missing("notification"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let config = self.config;
        config.validate()?;
        let call_timeout = config.polling.call_timeout();

        let safeguards = SafeguardChecker::standard(
            orchestration.clone(),
            metrics.clone(),
            clock.clone(),
            &config.safeguards,
        );
        let cooldowns = Arc::new(CooldownTable::new());
        let rollback = Arc::new(RollbackController::new(
            orchestration.clone(),
            metrics.clone(),
            notifications.clone(),
            clock.clone(),
            config.rollback.clone(),
            call_timeout,
        ));
        let executor = Arc::new(ActionExecutor::new(
            orchestration.clone(),
            data_plane,
            notifications.clone(),
            clock.clone(),
            config.polling.policy(),
            call_timeout,
        ));
        let verifier = Arc::new(RecoveryVerifier::new(
            orchestration.clone(),
            metrics.clone(),
            notifications.clone(),
            cooldowns.clone(),
            clock.clone(),
            config.recovery.clone(),
            call_timeout,
        ));
        let monitor = DeploymentMonitor::new(
            orchestration,
            metrics.clone(),
            rollback.clone(),
            config.monitor.clone(),
            call_timeout,
        );

        let targets = config.targets.iter().map(guarded).collect();

        let orchestrator = RemediationOrchestrator::new(
            OrchestratorParts {
                evaluator: Arc::new(RuleEvaluator::new(config.rule_sets())),
                executor,
                verifier,
                rollback: rollback.clone(),
                monitor,
                metrics,
                notifications: notifications.clone(),
                cooldowns,
                events: Arc::new(EventLog::new(config.orchestrator.event_log_capacity)),
                clock,
            },
            targets,
            config.orchestrator.max_consecutive_failures,
            Duration::from_secs(config.orchestrator.tick_interval_secs),
            call_timeout,
        );

        Ok(DeployGuard {
            targets: RwLock::new(config.targets.clone()),
            config,
            safeguards,
            rollback,
            orchestrator,
            notifications,
        })
    }
}

fn guarded(target: &TargetConfig) -> GuardedTarget {
    GuardedTarget {
        target: target.target(),
        auto_rollback: target.auto_rollback,
    }
}

impl DeployGuard {
    #[must_use]
    pub fn builder() -> DeployGuardBuilder {
        DeployGuardBuilder::default()
    }

    /// Wire the kubectl, Prometheus, data-plane and notification adapters.
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let endpoints = &config.endpoints;
        let timeout = Duration::from_secs(endpoints.request_timeout_secs);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let orchestration = KubectlOrchestrator::new(&endpoints.kubectl, endpoints.kube_context.clone())
            .with_dependencies(
                config.safeguards.dependencies.clone(),
                &config.safeguards.namespace,
            );
        let metrics = PrometheusMetrics::new(
            &endpoints.prometheus_url,
            timeout,
            EventJournal::new(PathBuf::from(&endpoints.event_journal))
                .with_max_bytes(endpoints.event_journal_max_bytes),
            clock.clone(),
        )?
        .with_queries(endpoints.metric_queries.clone());
        let data_plane = HttpDataPlane::new(&endpoints.data_plane_url, timeout)?;

        let notifier = if endpoints.notify_disabled {
            notify::Notifier::disabled()
        } else {
            let mut channels: Vec<Arc<dyn notify::NotifyChannel>> = Vec::new();
            if let Some(url) = &endpoints.slack_webhook_url {
                channels.push(Arc::new(notify::SlackChannel::new(url.clone())));
            }
            if let Some(url) = &endpoints.pager_webhook_url {
                channels.push(Arc::new(notify::WebhookChannel::new(url.clone())));
            }
            notify::Notifier::with_channels(channels)
        };

        Self::builder()
            .config(config.clone())
            .orchestration(Arc::new(orchestration))
            .metrics(Arc::new(metrics))
            .data_plane(Arc::new(data_plane))
            .notifications(Arc::new(ChannelNotifier::new(notifier)))
            .clock(clock)
            .build()
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    #[must_use]
    pub fn orchestrator(&self) -> &RemediationOrchestrator {
        &self.orchestrator
    }

    /// Guarded target by name.
    pub fn target(&self, name: &str) -> Result<Target> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name == name)
            .map(TargetConfig::target)
            .ok_or_else(|| GuardError::Config(format!("unknown target '{name}'")))
    }

    /// Apply the targets and remediation rules of `config` to the running
    /// engine. The configuration is validated first and nothing changes when
    /// it is rejected. Other sections only take effect on restart.
    pub async fn reconfigure(&self, config: &GuardConfig) -> Result<()> {
        config.validate()?;
        let targets = config
            .targets
            .iter()
            .map(|t| (guarded(t), t.rules.clone()))
            .collect();
        self.orchestrator.reconfigure(targets).await;
        *self.targets.write().unwrap_or_else(PoisonError::into_inner) = config.targets.clone();
        info!(targets = config.targets.len(), "Configuration reloaded");
        Ok(())
    }

    /// Run the pre-deployment safeguards. A refusal is also announced.
    #[instrument(skip(self), fields(namespace = %self.config.safeguards.namespace))]
    pub async fn gate(&self) -> Result<GateReport> {
        let result = self.safeguards.gate().await;

        if let Err(GuardError::DeploymentBlocked { reasons }) = &result {
            if let Err(e) = with_timeout(
                self.config.polling.call_timeout(),
                "blocked announcement",
                self.notifications
                    .announce_blocked(&self.config.safeguards.namespace, reasons),
            )
            .await
            {
                warn!(error = %e, "Failed to announce blocked deployment");
            }
        }
        result
    }

    /// Gate, then watch the rollout of `target`.
    ///
    /// The caller starts the rollout itself once this returns.
    pub async fn start_monitored_deployment(&self, target: Target) -> Result<MonitorHandle> {
        let report = self.gate().await?;
        for warning in report.warnings() {
            warn!(check = %warning.name, "Proceeding despite failed warning check");
        }
        info!(deployment = %target.qualified(), "Safeguards passed, watching rollout");
        Ok(self.orchestrator.monitor_deployment(target).await)
    }

    pub async fn rollback(&self, target: &RollbackTarget) -> Result<RollbackOutcome> {
        self.rollback.rollback(target).await
    }

    pub async fn report(&self, hours: u32) -> RemediationReport {
        self.orchestrator.report(hours).await
    }

    pub async fn tick(&self) -> TickSummary {
        self.orchestrator.tick().await
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        self.orchestrator.run(shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{MockDataPlaneService, MockMetricsService, MockNotificationService, MockOrchestrationService};

    #[test]
    fn test_builder_requires_collaborators() {
        let err = DeployGuard::builder()
            .orchestration(Arc::new(MockOrchestrationService::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, GuardError::Config(msg) if msg.contains("metrics")));
    }

    #[tokio::test]
    async fn test_unknown_target_is_a_config_error() {
        let guard = DeployGuard::builder()
            .orchestration(Arc::new(MockOrchestrationService::new()))
            .metrics(Arc::new(MockMetricsService::new()))
            .data_plane(Arc::new(MockDataPlaneService::new()))
            .notifications(Arc::new(MockNotificationService::new()))
            .build()
            .unwrap();
        assert!(matches!(guard.target("api"), Err(GuardError::Config(_))));
        assert!(guard.orchestrator().targets().await.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_gate_is_announced() {
        let mut orchestration = MockOrchestrationService::new();
        orchestration
            .expect_cluster_health()
            .returning(|| Err(anyhow::anyhow!("api server unreachable")));
        orchestration
            .expect_resource_quotas()
            .returning(|_| Ok(Vec::new()));
        orchestration.expect_latest_backup().returning(|| Ok(None));
        orchestration
            .expect_check_dependencies()
            .returning(|| Ok(Vec::new()));
        orchestration
            .expect_check_certificates()
            .returning(|| Ok(Vec::new()));
        orchestration
            .expect_network_policies()
            .returning(|_| Ok(vec!["default-deny".to_string()]));
        let mut metrics = MockMetricsService::new();
        metrics.expect_current_load().returning(|| Ok(0.2));
        let mut notifications = MockNotificationService::new();
        notifications
            .expect_announce_blocked()
            .withf(|namespace, reasons| {
                namespace == "default"
                    && reasons.contains(&"cluster-health".to_string())
                    && reasons.contains(&"backup-status".to_string())
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let guard = DeployGuard::builder()
            .orchestration(Arc::new(orchestration))
            .metrics(Arc::new(metrics))
            .data_plane(Arc::new(MockDataPlaneService::new()))
            .notifications(Arc::new(notifications))
            .build()
            .unwrap();

        let err = guard.gate().await.unwrap_err();
        assert!(matches!(err, GuardError::DeploymentBlocked { .. }));
    }
}
