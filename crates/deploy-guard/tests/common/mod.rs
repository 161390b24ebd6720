//! In-memory collaborators shared by the integration tests.
//!
//! A single [`FakeWorld`] plays the cluster, the metrics backend, the data
//! layer and the paging channel, so a test can mutate one piece of state and
//! observe every component react to it.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use deploy_guard::clock::{Clock, ManualClock};
use deploy_guard::config::TargetConfig;
use deploy_guard::services::{
    Alert, BackupInfo, CertificateInfo, ClusterHealth, DataPlaneService, DependencyStatus,
    DeploymentRevision, DeploymentStatus, FailoverParams, FlushParams, Incident, MetricsService,
    NotificationService, OptimizeParams, OrchestrationService, PodInfo, ResourceQuota,
    RestartParams, RevisionMetrics, RevisionStatus, ScaleParams, ServiceHealth, Target,
};
use deploy_guard::{DeployGuard, GuardConfig, MetricName, MetricSnapshot, RemediationEvent};

/// Mutable state behind the fake collaborators.
pub struct WorldState {
    pub cluster: ClusterHealth,
    pub backup: Option<BackupInfo>,
    pub load: f64,
    pub history: Vec<DeploymentRevision>,
    pub status: DeploymentStatus,
    /// Status reported once a rollback has been issued; `None` keeps `status`
    pub status_after_rollback: Option<DeploymentStatus>,
    /// Error rate reported once a rollback has been issued
    pub error_rate_after_rollback: Option<f64>,
    pub pods: Vec<PodInfo>,
    pub service_healthy: bool,
    pub error_rate: f64,
    /// Error rate reported once a restart has been issued
    pub error_rate_after_restart: Option<f64>,
    pub latency_p95_ms: f64,
    pub memory_usage: f64,
    pub metrics_unavailable: bool,
    pub failover_fails: bool,
    /// How long a restart call takes
    pub restart_delay: Option<Duration>,
    /// Mutating collaborator calls, in order (`restart api`, `rollback api 5`, ...)
    pub calls: Vec<String>,
    /// Notifications sent, as `kind:subject`
    pub notifications: Vec<String>,
    pub recorded: Vec<RemediationEvent>,
}

impl WorldState {
    /// Record a spec change the controller picks up at once.
    fn bump_generation(&mut self) {
        self.status.generation += 1;
        self.status.observed_generation = self.status.generation;
    }
}

pub fn steady(replicas: i32) -> DeploymentStatus {
    DeploymentStatus {
        replicas,
        available_replicas: replicas,
        updated_replicas: replicas,
        ready_replicas: replicas,
        generation: 1,
        observed_generation: 1,
    }
}

pub fn progressing(replicas: i32) -> DeploymentStatus {
    DeploymentStatus {
        available_replicas: replicas - 1,
        updated_replicas: 1,
        ..steady(replicas)
    }
}

pub fn revision(number: i64, error_rate: Option<f64>) -> DeploymentRevision {
    DeploymentRevision {
        revision: number,
        status: RevisionStatus::Complete,
        labels: BTreeMap::new(),
        metrics: RevisionMetrics { error_rate },
    }
}

pub fn running_pod(name: &str) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        phase: "Running".to_string(),
        ready: true,
        restart_count: 0,
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Fake cluster, metrics backend, data layer and pager in one.
pub struct FakeWorld {
    pub clock: Arc<ManualClock>,
    state: Mutex<WorldState>,
}

impl FakeWorld {
    /// A healthy cluster with one three-replica deployment.
    pub fn healthy() -> Arc<Self> {
        let clock = Arc::new(ManualClock::new(start_time()));
        let state = WorldState {
            cluster: ClusterHealth {
                ready_nodes: 3,
                total_nodes: 3,
                unhealthy: Vec::new(),
            },
            backup: Some(BackupInfo {
                name: "nightly".to_string(),
                completed_at: start_time() - chrono::Duration::hours(2),
                succeeded: true,
            }),
            load: 0.35,
            history: vec![revision(1, Some(0.001)), revision(2, Some(0.002))],
            status: steady(3),
            status_after_rollback: None,
            error_rate_after_rollback: None,
            pods: vec![running_pod("api-1"), running_pod("api-2"), running_pod("api-3")],
            service_healthy: true,
            error_rate: 0.002,
            error_rate_after_restart: None,
            latency_p95_ms: 120.0,
            memory_usage: 0.45,
            metrics_unavailable: false,
            failover_fails: false,
            restart_delay: None,
            calls: Vec::new(),
            notifications: Vec::new(),
            recorded: Vec::new(),
        };
        Arc::new(Self {
            clock,
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn notified(&self, kind: &str) -> bool {
        self.state()
            .notifications
            .iter()
            .any(|n| n.starts_with(&format!("{kind}:")))
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Facade wired to this world.
    pub fn guard(self: &Arc<Self>, config: GuardConfig) -> DeployGuard {
        DeployGuard::builder()
            .config(config)
            .orchestration(self.clone())
            .metrics(self.clone())
            .data_plane(self.clone())
            .notifications(self.clone())
            .clock(self.clock.clone())
            .build()
            .unwrap()
    }
}

/// Config with one target named `api` in `prod` and fast polling.
pub fn config_with(target: TargetConfig, snapshot_dir: &std::path::Path) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.safeguards.namespace = "prod".to_string();
    config.polling.interval_secs = 1;
    config.polling.max_attempts = 5;
    config.rollback.steady_state_interval_secs = 1;
    config.rollback.steady_state_max_attempts = 5;
    config.rollback.snapshot_dir = snapshot_dir.display().to_string();
    config.monitor.interval_secs = 10;
    config.targets = vec![target];
    config
}

pub fn api_target(rules: Vec<deploy_guard::RemediationRule>) -> TargetConfig {
    TargetConfig {
        name: "api".to_string(),
        namespace: "prod".to_string(),
        rules,
        ..TargetConfig::default()
    }
}

#[async_trait]
impl OrchestrationService for FakeWorld {
    async fn cluster_health(&self) -> Result<ClusterHealth> {
        Ok(self.state().cluster.clone())
    }

    async fn resource_quotas(&self, _namespace: &str) -> Result<Vec<ResourceQuota>> {
        Ok(vec![ResourceQuota {
            name: "compute".to_string(),
            resource: "limits.cpu".to_string(),
            used: 4.0,
            hard: 16.0,
        }])
    }

    async fn latest_backup(&self) -> Result<Option<BackupInfo>> {
        Ok(self.state().backup.clone())
    }

    async fn check_dependencies(&self) -> Result<Vec<DependencyStatus>> {
        Ok(Vec::new())
    }

    async fn check_certificates(&self) -> Result<Vec<CertificateInfo>> {
        Ok(vec![CertificateInfo {
            name: "api-tls".to_string(),
            namespace: "prod".to_string(),
            not_after: self.clock.now() + chrono::Duration::days(80),
        }])
    }

    async fn network_policies(&self, _namespace: &str) -> Result<Vec<String>> {
        Ok(vec!["default-deny".to_string()])
    }

    async fn restart(&self, target: &Target, _params: &RestartParams) -> Result<()> {
        let delay = {
            let mut state = self.state();
            state.calls.push(format!("restart {}", target.name));
            state.bump_generation();
            if let Some(rate) = state.error_rate_after_restart {
                state.error_rate = rate;
            }
            state.restart_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn scale(&self, target: &Target, params: &ScaleParams) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("scale {}", target.name));
        if let Some(replicas) = params.replicas {
            let generation = state.status.generation;
            state.status = DeploymentStatus {
                generation,
                observed_generation: generation,
                ..steady(replicas)
            };
        }
        state.bump_generation();
        Ok(())
    }

    async fn deployment_history(
        &self,
        _namespace: &str,
        _deployment: &str,
    ) -> Result<Vec<DeploymentRevision>> {
        Ok(self.state().history.clone())
    }

    async fn rollback_deployment(
        &self,
        _namespace: &str,
        deployment: &str,
        revision: i64,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("rollback {deployment} {revision}"));
        if let Some(status) = state.status_after_rollback {
            let generation = state.status.generation;
            state.status = DeploymentStatus {
                generation,
                observed_generation: generation,
                ..status
            };
        }
        state.bump_generation();
        if let Some(rate) = state.error_rate_after_rollback {
            state.error_rate = rate;
        }
        Ok(())
    }

    async fn deployment_status(
        &self,
        _namespace: &str,
        _deployment: &str,
    ) -> Result<DeploymentStatus> {
        Ok(self.state().status)
    }

    async fn pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodInfo>> {
        Ok(self.state().pods.clone())
    }

    async fn service_health(&self, _namespace: &str, service: &str) -> Result<ServiceHealth> {
        let healthy = self.state().service_healthy;
        Ok(ServiceHealth {
            healthy,
            detail: format!("{service} /healthz"),
        })
    }

    async fn snapshot_deployment(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "metadata": {"name": deployment, "namespace": namespace},
            "status": {"replicas": self.state().status.replicas},
        }))
    }
}

#[async_trait]
impl MetricsService for FakeWorld {
    async fn current_load(&self) -> Result<f64> {
        Ok(self.state().load)
    }

    async fn current_metrics(&self, service: &str) -> Result<MetricSnapshot> {
        let state = self.state();
        if state.metrics_unavailable {
            bail!("prometheus unreachable while querying {service}");
        }
        Ok(MetricSnapshot::new(self.clock.now())
            .with(MetricName::ErrorRate, state.error_rate)
            .with(MetricName::LatencyP95Ms, state.latency_p95_ms)
            .with(MetricName::MemoryUsage, state.memory_usage)
            .with(MetricName::CpuUsage, 0.3))
    }

    async fn error_rate(&self, service: &str) -> Result<f64> {
        let state = self.state();
        if state.metrics_unavailable {
            bail!("prometheus unreachable while querying {service}");
        }
        Ok(state.error_rate)
    }

    async fn check_memory_leak(&self, _service: &str) -> Result<bool> {
        Ok(false)
    }

    async fn connection_errors(&self, _service: &str) -> Result<u64> {
        Ok(0)
    }

    async fn slow_queries(&self, _service: &str) -> Result<u64> {
        Ok(0)
    }

    async fn memory_fragmentation(&self, _service: &str) -> Result<f64> {
        Ok(1.1)
    }

    async fn record_remediation_event(&self, event: &RemediationEvent) -> Result<()> {
        self.state().recorded.push(event.clone());
        Ok(())
    }

    async fn remediation_events(
        &self,
        service: &str,
        window: chrono::Duration,
    ) -> Result<Vec<RemediationEvent>> {
        let cutoff = self.clock.now() - window;
        Ok(self
            .state()
            .recorded
            .iter()
            .filter(|e| e.target == service && e.occurred_at >= cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DataPlaneService for FakeWorld {
    async fn failover(&self, target: &Target, _params: &FailoverParams) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("failover {}", target.name));
        if state.failover_fails {
            return Err(anyhow!("no healthy replica to promote"));
        }
        Ok(())
    }

    async fn replication_in_sync(&self, _target: &Target) -> Result<bool> {
        Ok(true)
    }

    async fn flush_cache(&self, target: &Target, _params: &FlushParams) -> Result<()> {
        self.state().calls.push(format!("flush {}", target.name));
        Ok(())
    }

    async fn flush_complete(&self, _target: &Target) -> Result<bool> {
        Ok(true)
    }

    async fn optimize(&self, target: &Target, _params: &OptimizeParams) -> Result<()> {
        self.state().calls.push(format!("optimize {}", target.name));
        Ok(())
    }
}

#[async_trait]
impl NotificationService for FakeWorld {
    async fn escalate_incident(&self, incident: &Incident) -> Result<()> {
        self.state()
            .notifications
            .push(format!("escalated:{}", incident.kind));
        Ok(())
    }

    async fn send_recovery_success(&self, incident: &Incident) -> Result<()> {
        self.state()
            .notifications
            .push(format!("recovered:{}", incident.kind));
        Ok(())
    }

    async fn dispatch_alert(&self, alert: &Alert) -> Result<()> {
        self.state()
            .notifications
            .push(format!("alert:{}", alert.message));
        Ok(())
    }

    async fn announce_blocked(&self, namespace: &str, reasons: &[String]) -> Result<()> {
        self.state()
            .notifications
            .push(format!("blocked:{namespace} {}", reasons.join(",")));
        Ok(())
    }

    async fn announce_rollback(&self, deployment: &str, revision: i64) -> Result<()> {
        self.state()
            .notifications
            .push(format!("rollback:{deployment} {revision}"));
        Ok(())
    }
}
