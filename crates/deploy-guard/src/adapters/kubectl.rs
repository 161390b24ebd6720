//! Orchestration through the `kubectl` CLI.
//!
//! Objects are read with `-o json` and decoded into `k8s-openapi` types.
//! CRDs without generated schemas (Velero backups, cert-manager
//! certificates) are read as plain JSON.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, ResourceQuota as QuotaObject};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, info};

use crate::services::{
    BackupInfo, CertificateInfo, ClusterHealth, DependencyStatus, DeploymentRevision,
    DeploymentStatus, OrchestrationService, PodInfo, ResourceQuota, RestartMode, RestartParams,
    RevisionMetrics, RevisionStatus, ScaleParams, ServiceHealth, Target,
};

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";
const ERROR_RATE_ANNOTATION: &str = "deploy-guard.io/error-rate";
const GUARD_ANNOTATION_PREFIX: &str = "deploy-guard.io/";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const NODE_PRESSURE_CONDITIONS: [&str; 3] = ["MemoryPressure", "DiskPressure", "PIDPressure"];

/// `kubectl get ... -o json` list output.
#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// [`OrchestrationService`] backed by `kubectl`.
pub struct KubectlOrchestrator {
    binary: String,
    context: Option<String>,
    /// Deployments checked by `check_dependencies`, as `namespace/name` or `name`
    dependencies: Vec<String>,
    default_namespace: String,
    backup_namespace: String,
}

impl KubectlOrchestrator {
    #[must_use]
    pub fn new(binary: impl Into<String>, context: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            context,
            dependencies: Vec::new(),
            default_namespace: "default".to_string(),
            backup_namespace: "velero".to_string(),
        }
    }

    /// Deployments that must be available before a deploy proceeds.
    #[must_use]
    pub fn with_dependencies(
        mut self,
        dependencies: Vec<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        self.dependencies = dependencies;
        self.default_namespace = default_namespace.into();
        self
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.binary);
        if let Some(context) = &self.context {
            command.args(["--context", context]);
        }
        command.args(args);
        debug!(binary = %self.binary, ?args, "Running kubectl");

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute {} {}", self.binary, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("kubectl {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(output.stdout)
    }

    async fn get_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run(args).await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("Failed to parse kubectl {} output", args.join(" ")))
    }

    async fn get_deployment(&self, namespace: &str, deployment: &str) -> Result<Deployment> {
        self.get_json(&["get", "deployment", deployment, "-n", namespace, "-o", "json"])
            .await
    }

    async fn dependency_status(&self, dependency: &str) -> DependencyStatus {
        let (namespace, name) = dependency
            .split_once('/')
            .unwrap_or((self.default_namespace.as_str(), dependency));

        match self.get_deployment(namespace, name).await {
            Ok(deployment) => {
                let status = deployment_status_from(&deployment);
                DependencyStatus {
                    name: dependency.to_string(),
                    healthy: status.available_replicas > 0
                        && status.available_replicas >= status.replicas,
                    detail: Some(format!(
                        "{}/{} replicas available",
                        status.available_replicas, status.replicas
                    )),
                }
            }
            Err(e) => DependencyStatus {
                name: dependency.to_string(),
                healthy: false,
                detail: Some(format!("{e:#}")),
            },
        }
    }
}

#[async_trait]
impl OrchestrationService for KubectlOrchestrator {
    async fn cluster_health(&self) -> Result<ClusterHealth> {
        let nodes: ItemList<Node> = self.get_json(&["get", "nodes", "-o", "json"]).await?;
        Ok(cluster_health_from(&nodes.items))
    }

    async fn resource_quotas(&self, namespace: &str) -> Result<Vec<ResourceQuota>> {
        let quotas: ItemList<QuotaObject> = self
            .get_json(&["get", "resourcequota", "-n", namespace, "-o", "json"])
            .await?;
        Ok(quotas.items.iter().flat_map(quota_lines).collect())
    }

    async fn latest_backup(&self) -> Result<Option<BackupInfo>> {
        let backups: serde_json::Value = self
            .get_json(&[
                "get",
                "backups.velero.io",
                "-n",
                &self.backup_namespace,
                "-o",
                "json",
            ])
            .await?;
        Ok(latest_backup_from(&backups))
    }

    async fn check_dependencies(&self) -> Result<Vec<DependencyStatus>> {
        let mut statuses = Vec::with_capacity(self.dependencies.len());
        for dependency in &self.dependencies {
            statuses.push(self.dependency_status(dependency).await);
        }
        Ok(statuses)
    }

    async fn check_certificates(&self) -> Result<Vec<CertificateInfo>> {
        let certificates: serde_json::Value = self
            .get_json(&["get", "certificates.cert-manager.io", "-A", "-o", "json"])
            .await?;
        Ok(certificates_from(&certificates))
    }

    async fn network_policies(&self, namespace: &str) -> Result<Vec<String>> {
        let policies: ItemList<NetworkPolicy> = self
            .get_json(&["get", "networkpolicy", "-n", namespace, "-o", "json"])
            .await?;
        Ok(policies
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn restart(&self, target: &Target, params: &RestartParams) -> Result<()> {
        match params.mode {
            RestartMode::Rollout => {
                let resource = format!("deployment/{}", target.deployment);
                match params.grace_period_secs {
                    None => {
                        self.run(&["rollout", "restart", &resource, "-n", &target.namespace])
                            .await?;
                    }
                    Some(grace) => {
                        // Same template annotation `rollout restart` sets, plus the
                        // grace period, so both land in one rollout.
                        let patch = restart_patch(Utc::now(), grace).to_string();
                        self.run(&[
                            "patch",
                            &resource,
                            "-n",
                            &target.namespace,
                            "--type=strategic",
                            "-p",
                            &patch,
                        ])
                        .await?;
                    }
                }
            }
            RestartMode::Pods => {
                let grace = format!(
                    "--grace-period={}",
                    params
                        .grace_period_secs
                        .unwrap_or(RestartParams::DEFAULT_POD_GRACE_SECS)
                );
                self.run(&[
                    "delete",
                    "pod",
                    "-n",
                    &target.namespace,
                    "-l",
                    &target.selector,
                    &grace,
                    "--wait=false",
                ])
                .await?;
            }
        }
        info!(target = %target.qualified(), mode = ?params.mode, "Restart issued");
        Ok(())
    }

    async fn scale(&self, target: &Target, params: &ScaleParams) -> Result<()> {
        let resource = format!("deployment/{}", target.deployment);

        if params.delta.is_some() && params.replicas.is_none() {
            bail!("relative scaling must be resolved to a replica count first");
        }

        if let Some(replicas) = params.replicas {
            let replicas = format!("--replicas={replicas}");
            self.run(&["scale", &resource, "-n", &target.namespace, &replicas])
                .await?;
        }

        let mut limits = Vec::new();
        if let Some(cpu) = &params.cpu_limit {
            limits.push(format!("cpu={cpu}"));
        }
        if let Some(memory) = &params.memory_limit {
            limits.push(format!("memory={memory}"));
        }
        if !limits.is_empty() {
            let limits = format!("--limits={}", limits.join(","));
            self.run(&["set", "resources", &resource, "-n", &target.namespace, &limits])
                .await?;
        }

        info!(target = %target.qualified(), ?params, "Scale issued");
        Ok(())
    }

    async fn deployment_history(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<Vec<DeploymentRevision>> {
        let current = self.get_deployment(namespace, deployment).await?;
        let replica_sets: ItemList<ReplicaSet> = self
            .get_json(&["get", "replicasets", "-n", namespace, "-o", "json"])
            .await?;
        Ok(revisions_from(&current, deployment, &replica_sets.items))
    }

    async fn rollback_deployment(
        &self,
        namespace: &str,
        deployment: &str,
        revision: i64,
    ) -> Result<()> {
        let resource = format!("deployment/{deployment}");
        let to_revision = format!("--to-revision={revision}");
        self.run(&["rollout", "undo", &resource, "-n", namespace, &to_revision])
            .await?;
        Ok(())
    }

    async fn deployment_status(&self, namespace: &str, deployment: &str) -> Result<DeploymentStatus> {
        Ok(deployment_status_from(
            &self.get_deployment(namespace, deployment).await?,
        ))
    }

    async fn pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodInfo>> {
        let pods: ItemList<Pod> = self
            .get_json(&["get", "pods", "-n", namespace, "-l", selector, "-o", "json"])
            .await?;
        Ok(pods.items.iter().map(pod_info_from).collect())
    }

    async fn service_health(&self, namespace: &str, service: &str) -> Result<ServiceHealth> {
        let endpoints: Endpoints = self
            .get_json(&["get", "endpoints", service, "-n", namespace, "-o", "json"])
            .await?;
        Ok(service_health_from(&endpoints))
    }

    async fn snapshot_deployment(
        &self,
        namespace: &str,
        deployment: &str,
    ) -> Result<serde_json::Value> {
        self.get_json(&["get", "deployment", deployment, "-n", namespace, "-o", "json"])
            .await
    }
}

/// Decimal and binary Kubernetes quantity suffixes.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;

    let factor = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        _ => return None,
    };
    Some(number * factor)
}

fn cluster_health_from(nodes: &[Node]) -> ClusterHealth {
    let mut health = ClusterHealth {
        total_nodes: nodes.len() as u32,
        ..ClusterHealth::default()
    };

    for node in nodes {
        let name = node.metadata.name.clone().unwrap_or_default();
        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();

        let ready = conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        if ready {
            health.ready_nodes += 1;
        } else {
            health.unhealthy.push(format!("{name}: NotReady"));
        }

        for condition in conditions {
            if NODE_PRESSURE_CONDITIONS.contains(&condition.type_.as_str())
                && condition.status == "True"
            {
                health.unhealthy.push(format!("{name}: {}", condition.type_));
            }
        }
    }
    health
}

fn quota_lines(quota: &QuotaObject) -> Vec<ResourceQuota> {
    let name = quota.metadata.name.clone().unwrap_or_default();
    let Some(status) = &quota.status else {
        return Vec::new();
    };
    let used = status.used.clone().unwrap_or_default();

    status
        .hard
        .iter()
        .flatten()
        .filter_map(|(resource, hard)| {
            let hard = parse_quantity(&hard.0)?;
            let used = used
                .get(resource)
                .and_then(|q| parse_quantity(&q.0))
                .unwrap_or(0.0);
            Some(ResourceQuota {
                name: name.clone(),
                resource: resource.clone(),
                used,
                hard,
            })
        })
        .collect()
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn latest_backup_from(backups: &serde_json::Value) -> Option<BackupInfo> {
    backups["items"]
        .as_array()?
        .iter()
        .filter_map(|item| {
            Some(BackupInfo {
                name: item["metadata"]["name"].as_str()?.to_string(),
                completed_at: parse_timestamp(&item["status"]["completionTimestamp"])?,
                succeeded: item["status"]["phase"].as_str() == Some("Completed"),
            })
        })
        .max_by_key(|b| b.completed_at)
}

fn certificates_from(certificates: &serde_json::Value) -> Vec<CertificateInfo> {
    certificates["items"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(CertificateInfo {
                        name: item["metadata"]["name"].as_str()?.to_string(),
                        namespace: item["metadata"]["namespace"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        not_after: parse_timestamp(&item["status"]["notAfter"])?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn deployment_status_from(deployment: &Deployment) -> DeploymentStatus {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();

    DeploymentStatus {
        replicas: desired,
        available_replicas: status.available_replicas.unwrap_or(0),
        updated_replicas: status.updated_replicas.unwrap_or(0),
        ready_replicas: status.ready_replicas.unwrap_or(0),
        generation: deployment.metadata.generation.unwrap_or(0),
        observed_generation: status.observed_generation.unwrap_or(0),
    }
}

/// Strategic merge patch restarting every pod with a new grace period.
fn restart_patch(at: DateTime<Utc>, grace_period_secs: u64) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: at.to_rfc3339_opts(SecondsFormat::Secs, true)
                    }
                },
                "spec": {"terminationGracePeriodSeconds": grace_period_secs}
            }
        }
    })
}

/// Rollout status of the deployment's current revision.
fn current_rollout_status(deployment: &Deployment) -> RevisionStatus {
    let progressing = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Progressing"));

    match progressing.and_then(|c| c.reason.as_deref()) {
        Some("NewReplicaSetAvailable") => RevisionStatus::Complete,
        Some("ProgressDeadlineExceeded") => RevisionStatus::Failed,
        Some(_) => RevisionStatus::Progressing,
        None => RevisionStatus::Unknown,
    }
}

fn revisions_from(
    current: &Deployment,
    deployment: &str,
    replica_sets: &[ReplicaSet],
) -> Vec<DeploymentRevision> {
    let current_revision = current
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REVISION_ANNOTATION))
        .and_then(|r| r.parse::<i64>().ok());

    let mut revisions: Vec<DeploymentRevision> = replica_sets
        .iter()
        .filter(|rs| {
            rs.metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.kind == "Deployment" && owner.name == deployment)
        })
        .filter_map(|rs| {
            let annotations = rs.metadata.annotations.clone().unwrap_or_default();
            let revision = annotations.get(REVISION_ANNOTATION)?.parse::<i64>().ok()?;

            let mut labels: BTreeMap<String, String> =
                rs.metadata.labels.clone().unwrap_or_default();
            labels.extend(
                annotations
                    .iter()
                    .filter(|(key, _)| key.starts_with(GUARD_ANNOTATION_PREFIX))
                    .map(|(key, value)| (key.clone(), value.clone())),
            );

            let status = if Some(revision) == current_revision {
                current_rollout_status(current)
            } else {
                RevisionStatus::Complete
            };

            Some(DeploymentRevision {
                revision,
                status,
                metrics: RevisionMetrics {
                    error_rate: annotations
                        .get(ERROR_RATE_ANNOTATION)
                        .and_then(|v| v.parse().ok()),
                },
                labels,
            })
        })
        .collect();

    revisions.sort_by_key(|r| r.revision);
    revisions
}

fn pod_info_from(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready: status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            }),
        restart_count: status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|containers| {
                containers
                    .iter()
                    .map(|c| c.restart_count.max(0) as u32)
                    .sum()
            })
            .unwrap_or(0),
    }
}

fn service_health_from(endpoints: &Endpoints) -> ServiceHealth {
    let (ready, not_ready) = endpoints
        .subsets
        .iter()
        .flatten()
        .fold((0, 0), |(ready, not_ready), subset| {
            (
                ready + subset.addresses.as_ref().map_or(0, Vec::len),
                not_ready + subset.not_ready_addresses.as_ref().map_or(0, Vec::len),
            )
        });

    ServiceHealth {
        healthy: ready > 0,
        detail: format!("{ready} ready endpoints, {not_ready} not ready"),
    }
}
