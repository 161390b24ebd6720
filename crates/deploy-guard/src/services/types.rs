//! Types exchanged with the orchestration, metrics, data-plane and notification collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metrics::MetricSnapshot;

/// A workload the engine guards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Target key (cooldowns, event log, rule grouping)
    pub name: String,
    /// Kubernetes namespace
    pub namespace: String,
    /// Deployment name
    pub deployment: String,
    /// Pod label selector
    pub selector: String,
    /// Service name used for health endpoints and metric queries
    pub service: String,
}

impl Target {
    /// Target whose deployment, selector and service are all derived from `name`.
    #[must_use]
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            deployment: name.clone(),
            selector: format!("app={name}"),
            service: name.clone(),
            name,
        }
    }

    /// `namespace/deployment`, used in log lines and error messages.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }
}

/// Node-level cluster health.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Nodes reporting Ready
    pub ready_nodes: u32,
    /// All nodes
    pub total_nodes: u32,
    /// Nodes or control-plane components reporting problems
    pub unhealthy: Vec<String>,
}

impl ClusterHealth {
    /// Every node is ready and nothing is reported unhealthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.total_nodes > 0 && self.ready_nodes == self.total_nodes && self.unhealthy.is_empty()
    }
}

/// One resource line of a namespace quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub name: String,
    pub resource: String,
    pub used: f64,
    pub hard: f64,
}

impl ResourceQuota {
    /// Fraction of the hard limit in use; an unbounded quota reports 0.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.hard <= 0.0 {
            0.0
        } else {
            self.used / self.hard
        }
    }
}

/// Most recent backup known to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub completed_at: DateTime<Utc>,
    pub succeeded: bool,
}

/// Health of an upstream dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// A TLS certificate and its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub name: String,
    pub namespace: String,
    pub not_after: DateTime<Utc>,
}

/// Rollout status of a historical revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionStatus {
    Complete,
    Progressing,
    Failed,
    Unknown,
}

/// Metrics recorded against a revision while it was live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionMetrics {
    pub error_rate: Option<f64>,
}

/// One entry of a deployment's revision history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRevision {
    pub revision: i64,
    pub status: RevisionStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: RevisionMetrics,
}

impl DeploymentRevision {
    /// Whether the revision carries a `failed` marker label.
    #[must_use]
    pub fn is_labeled_failed(&self) -> bool {
        self.labels
            .iter()
            .any(|(key, value)| (key == "failed" && value != "false") || value == "failed")
    }
}

/// Replica counts and spec generations of a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub replicas: i32,
    pub available_replicas: i32,
    pub updated_replicas: i32,
    pub ready_replicas: i32,
    /// Spec generation, bumped by every spec change
    #[serde(default)]
    pub generation: i64,
    /// Latest generation the deployment controller has acted on
    #[serde(default)]
    pub observed_generation: i64,
}

impl DeploymentStatus {
    /// The controller has caught up with the spec and desired, available
    /// and updated replica counts agree.
    #[must_use]
    pub fn is_steady(&self) -> bool {
        self.observed_generation >= self.generation
            && self.replicas == self.available_replicas
            && self.replicas == self.updated_replicas
    }

    /// A spec change made after `before` was read has been rolled out.
    #[must_use]
    pub fn settled_since(&self, before: &Self) -> bool {
        self.generation > before.generation && self.is_steady()
    }
}

/// Summary of a pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub restart_count: u32,
}

impl PodInfo {
    /// Pod is in the Running phase.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// Result of a service health endpoint request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub detail: String,
}

/// How a restart is carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Rolling restart of the whole deployment
    #[default]
    Rollout,
    /// Delete the target's pods and let the controller recreate them
    Pods,
}

/// Parameters for a `restart` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartParams {
    pub mode: RestartMode,
    /// Termination grace period handed to the pods. A rolling restart
    /// keeps the pod template's own period when unset.
    pub grace_period_secs: Option<u64>,
}

impl RestartParams {
    /// Grace period used when deleting pods directly.
    pub const DEFAULT_POD_GRACE_SECS: u64 = 30;
}

/// Parameters for a `scale` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    /// Absolute replica count
    pub replicas: Option<i32>,
    /// Relative change applied to the current replica count
    pub delta: Option<i32>,
    /// New CPU limit, e.g. `"2"` or `"1500m"`
    pub cpu_limit: Option<String>,
    /// New memory limit, e.g. `"2Gi"`
    pub memory_limit: Option<String>,
}

/// Parameters for a `failover` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverParams {
    /// Wait until the promoted replica reports replication in sync
    pub wait_for_sync: bool,
    /// Preferred replica to promote
    pub replica: Option<String>,
}

impl Default for FailoverParams {
    fn default() -> Self {
        Self {
            wait_for_sync: true,
            replica: None,
        }
    }
}

/// Whether a cache flush is awaited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    #[default]
    Sync,
    Async,
}

/// Parameters for a `flush` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushParams {
    pub mode: FlushMode,
    /// Key pattern to invalidate; everything when absent
    pub pattern: Option<String>,
}

/// Parameters for an `optimize` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeParams {
    /// Refresh planner statistics
    pub analyze: bool,
    /// Rebuild bloated indexes
    pub reindex: bool,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            analyze: true,
            reindex: false,
        }
    }
}

/// Severity of an alert or incident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// Parameters for a `notify` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyParams {
    pub severity: AlertSeverity,
    pub message: Option<String>,
    pub channel: Option<String>,
}

/// Page dispatched by a `notify` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub target: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub channel: Option<String>,
}

/// A failure handed to humans, or the record of a recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub target: String,
    /// Incident classification (`high_memory`, `rollback_failed`, ...)
    pub kind: String,
    pub summary: String,
    pub attempted_actions: Vec<String>,
    pub error: Option<String>,
    pub metrics: Option<MetricSnapshot>,
    pub opened_at: DateTime<Utc>,
}

impl Incident {
    /// New incident with a random id.
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        kind: impl Into<String>,
        summary: impl Into<String>,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            kind: kind.into(),
            summary: summary.into(),
            attempted_actions: Vec::new(),
            error: None,
            metrics: None,
            opened_at,
        }
    }
}
