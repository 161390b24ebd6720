//! Collaborator interfaces consumed by the engine.
//!
//! The engine never talks to Kubernetes, Prometheus, the data layer or the
//! paging channel directly. Each of those sits behind one of the traits below
//! and is injected into the components as an `Arc<dyn ...>`, so tests can swap
//! in fakes or mocks.

pub mod types;

use anyhow::Result;
use async_trait::async_trait;

use crate::history::RemediationEvent;
use crate::metrics::MetricSnapshot;

pub use types::{
    Alert, AlertSeverity, BackupInfo, CertificateInfo, ClusterHealth, DependencyStatus,
    DeploymentRevision, DeploymentStatus, FailoverParams, FlushMode, FlushParams, Incident,
    NotifyParams, OptimizeParams, PodInfo, ResourceQuota, RestartMode, RestartParams,
    RevisionMetrics, RevisionStatus, ScaleParams, ServiceHealth, Target,
};

/// Workload orchestration platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrchestrationService: Send + Sync {
    /// Node and control-plane health.
    async fn cluster_health(&self) -> Result<ClusterHealth>;

    /// Quota usage in `namespace`.
    async fn resource_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>>;

    /// Most recent backup, if any exist.
    async fn latest_backup(&self) -> Result<Option<BackupInfo>>;

    /// Health of the platform's upstream dependencies.
    async fn check_dependencies(&self) -> Result<Vec<DependencyStatus>>;

    /// Certificates managed by the platform.
    async fn check_certificates(&self) -> Result<Vec<CertificateInfo>>;

    /// Names of the network policies in `namespace`.
    async fn network_policies(&self, namespace: &str) -> Result<Vec<String>>;

    /// Restart the target's pods or deployment.
    async fn restart(&self, target: &Target, params: &RestartParams) -> Result<()>;

    /// Adjust replicas or resource limits of the target.
    async fn scale(&self, target: &Target, params: &ScaleParams) -> Result<()>;

    /// Revision history of a deployment.
    async fn deployment_history(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<Vec<DeploymentRevision>>;

    /// Roll a deployment back to `revision`.
    async fn rollback_deployment(&self, namespace: &str, deployment: &str, revision: i64)
        -> Result<()>;

    /// Current replica counts of a deployment.
    async fn deployment_status(&self, namespace: &str, deployment: &str)
        -> Result<DeploymentStatus>;

    /// Pods matching `selector`.
    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>>;

    /// Health endpoint of a service.
    async fn service_health(&self, namespace: &str, service: &str) -> Result<ServiceHealth>;

    /// Full current state of a deployment, kept for forensics before a rollback.
    async fn snapshot_deployment(&self, namespace: &str, deployment: &str)
        -> Result<serde_json::Value>;
}

/// Metrics backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsService: Send + Sync {
    /// Cluster-wide load as a fraction of capacity.
    async fn current_load(&self) -> Result<f64>;

    /// Current metric snapshot for a service.
    async fn current_metrics(&self, service: &str) -> Result<MetricSnapshot>;

    /// Current error rate of a service.
    async fn error_rate(&self, service: &str) -> Result<f64>;

    /// Whether the service's memory trend looks like a leak.
    async fn check_memory_leak(&self, service: &str) -> Result<bool>;

    /// Data-layer connection errors for a service.
    async fn connection_errors(&self, service: &str) -> Result<u64>;

    /// Slow queries issued by a service.
    async fn slow_queries(&self, service: &str) -> Result<u64>;

    /// Cache memory fragmentation ratio for a service.
    async fn memory_fragmentation(&self, service: &str) -> Result<f64>;

    /// Persist a remediation event.
    async fn record_remediation_event(&self, event: &RemediationEvent) -> Result<()>;

    /// Remediation events for a service within the trailing `window`.
    async fn remediation_events(
        &self,
        service: &str,
        window: chrono::Duration,
    ) -> Result<Vec<RemediationEvent>>;
}

/// Data layer (databases and caches) behind a target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataPlaneService: Send + Sync {
    /// Promote a replica of the target's database.
    async fn failover(&self, target: &Target, params: &FailoverParams) -> Result<()>;

    /// Replication of the promoted primary has caught up.
    async fn replication_in_sync(&self, target: &Target) -> Result<bool>;

    /// Invalidate the target's cache.
    async fn flush_cache(&self, target: &Target, params: &FlushParams) -> Result<()>;

    /// The last flush has finished.
    async fn flush_complete(&self, target: &Target) -> Result<bool>;

    /// Run an optimization pass on the target's database.
    async fn optimize(&self, target: &Target, params: &OptimizeParams) -> Result<()>;
}

/// Paging and notification channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Hand an incident to humans.
    async fn escalate_incident(&self, incident: &Incident) -> Result<()>;

    /// Report that an incident recovered.
    async fn send_recovery_success(&self, incident: &Incident) -> Result<()>;

    /// Dispatch a page requested by a `notify` action.
    async fn dispatch_alert(&self, alert: &Alert) -> Result<()>;

    /// Report that critical safeguards refused a deployment.
    async fn announce_blocked(&self, namespace: &str, reasons: &[String]) -> Result<()>;

    /// Report a completed rollback.
    async fn announce_rollback(&self, deployment: &str, revision: i64) -> Result<()>;
}
