//! Engine configuration.
//!
//! Loaded from a JSON or YAML file (picked by extension), then overlaid with
//! environment variables for endpoints and secrets. Every section has
//! defaults, so an empty file is a valid (if target-less) configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{GuardError, Result};
use crate::metrics::MetricName;
use crate::poll::PollPolicy;
use crate::rules::RemediationRule;
use crate::safeguard::Severity;
use crate::services::Target;
use crate::verifier::{IncidentType, RecoveryCriterion};

/// Config file used when neither `--config` nor `DEPLOY_GUARD_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "deploy-guard.json";

/// Default Prometheus service URL (internal Kubernetes DNS)
pub const DEFAULT_PROMETHEUS_URL: &str =
    "http://prometheus-server.observability.svc.cluster.local:80";

const DEFAULT_DATA_PLANE_URL: &str = "http://data-plane-admin.platform.svc.cluster.local:8080";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub safeguards: SafeguardConfig,
    pub polling: PollConfig,
    pub targets: Vec<TargetConfig>,
    pub recovery: RecoveryConfig,
    pub rollback: RollbackConfig,
    pub monitor: MonitorConfig,
    pub orchestrator: OrchestratorConfig,
    pub telemetry: TelemetryConfig,
    pub endpoints: EndpointConfig,
}

/// Pre-deployment safeguard thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeguardConfig {
    /// Namespace whose quotas and network policies are checked
    pub namespace: String,
    /// Upper bound on a single safeguard check
    pub check_timeout_secs: u64,
    /// Highest acceptable quota utilization (fraction)
    pub max_quota_utilization: f64,
    /// Oldest acceptable successful backup
    pub max_backup_age_hours: u64,
    /// Highest acceptable cluster load (fraction)
    pub max_load: f64,
    /// Certificates must stay valid for longer than this
    pub min_certificate_validity_days: u64,
    /// Minimum number of network policies in the namespace
    pub min_network_policies: usize,
    /// Dependencies that must be reported (and healthy)
    pub dependencies: Vec<String>,
    /// Per-check severity overrides, keyed by check name
    pub severities: BTreeMap<String, Severity>,
    /// Checks to skip entirely
    pub disabled: Vec<String>,
}

impl Default for SafeguardConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            check_timeout_secs: 30,
            max_quota_utilization: 0.9,
            max_backup_age_hours: 24,
            max_load: 0.8,
            min_certificate_validity_days: 30,
            min_network_policies: 1,
            dependencies: Vec::new(),
            severities: BTreeMap::new(),
            disabled: Vec::new(),
        }
    }
}

/// Completion polling for remediation actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
    /// Upper bound on any single collaborator call
    pub call_timeout_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_attempts: 60,
            call_timeout_secs: 30,
        }
    }
}

impl PollConfig {
    #[must_use]
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_secs(self.interval_secs), self.max_attempts)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// A guarded workload and its remediation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    pub namespace: String,
    /// Deployment name; defaults to `name`
    pub deployment: Option<String>,
    /// Pod selector; defaults to `app=<name>`
    pub selector: Option<String>,
    /// Service name; defaults to `name`
    pub service: Option<String>,
    /// Evaluated in declaration order
    pub rules: Vec<RemediationRule>,
    /// Roll back automatically once remediation has been escalated
    pub auto_rollback: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: "default".to_string(),
            deployment: None,
            selector: None,
            service: None,
            rules: Vec::new(),
            auto_rollback: false,
        }
    }
}

impl TargetConfig {
    #[must_use]
    pub fn target(&self) -> Target {
        let mut target = Target::named(&self.namespace, &self.name);
        if let Some(deployment) = &self.deployment {
            target.deployment.clone_from(deployment);
        }
        if let Some(selector) = &self.selector {
            target.selector.clone_from(selector);
        }
        if let Some(service) = &self.service {
            target.service.clone_from(service);
        }
        target
    }
}

/// Recovery criteria and general health ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Overrides of the built-in incident → criterion table
    pub criteria: BTreeMap<IncidentType, RecoveryCriterion>,
    pub require_pods_running: bool,
    pub require_service_healthy: bool,
    pub max_error_rate: f64,
    pub max_latency_p95_ms: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            criteria: BTreeMap::new(),
            require_pods_running: true,
            require_service_healthy: true,
            max_error_rate: 0.05,
            max_latency_p95_ms: 1000.0,
        }
    }
}

/// Rollback selection, steady-state wait and verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// A revision is stable only below this recorded error rate
    pub max_error_rate: f64,
    pub steady_state_interval_secs: u64,
    pub steady_state_max_attempts: u32,
    /// Fraction of pods that must be running after the rollback
    pub min_running_ratio: f64,
    pub verify_max_error_rate: f64,
    pub verify_max_latency_p95_ms: f64,
    /// Where pre-rollback snapshots are written
    pub snapshot_dir: String,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_error_rate: 0.01,
            steady_state_interval_secs: 10,
            steady_state_max_attempts: 30,
            min_running_ratio: 0.9,
            verify_max_error_rate: 0.01,
            verify_max_latency_p95_ms: 1000.0,
            snapshot_dir: "rollback-snapshots".to_string(),
        }
    }
}

impl RollbackConfig {
    #[must_use]
    pub fn steady_state_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.steady_state_interval_secs),
            self.steady_state_max_attempts,
        )
    }
}

/// Active rollout watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub max_error_rate: f64,
    /// Consecutive samples above the ceiling before the rollout is failed
    pub consecutive_breaches: u32,
    /// Longest rollout window watched
    pub max_duration_secs: u64,
    pub rollback_on_failure: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            max_error_rate: 0.05,
            consecutive_breaches: 3,
            max_duration_secs: 1800,
            rollback_on_failure: true,
        }
    }
}

/// Remediation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_secs: u64,
    /// Failed remediation attempts in a row before a target is escalated
    pub max_consecutive_failures: u32,
    /// Events retained per target
    pub event_log_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_consecutive_failures: 3,
            event_log_capacity: 500,
        }
    }
}

/// Tracing export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP gRPC endpoint; span export is off when unset
    pub otlp_endpoint: Option<String>,
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "deploy-guard".to_string(),
            otlp_endpoint: None,
            environment: "development".to_string(),
        }
    }
}

/// Collaborator endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub prometheus_url: String,
    /// PromQL overrides per metric; `{service}` is substituted
    pub metric_queries: BTreeMap<MetricName, String>,
    pub data_plane_url: String,
    pub kubectl: String,
    pub kube_context: Option<String>,
    /// JSONL file remediation events are journaled to
    pub event_journal: String,
    /// Size at which the journal is rotated to `<file>.1`, replacing the
    /// previous rotation
    pub event_journal_max_bytes: u64,
    pub slack_webhook_url: Option<String>,
    pub pager_webhook_url: Option<String>,
    pub notify_disabled: bool,
    /// HTTP client timeout
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            prometheus_url: DEFAULT_PROMETHEUS_URL.to_string(),
            metric_queries: BTreeMap::new(),
            data_plane_url: DEFAULT_DATA_PLANE_URL.to_string(),
            kubectl: "kubectl".to_string(),
            kube_context: None,
            event_journal: "deploy-guard-events.jsonl".to_string(),
            event_journal_max_bytes: 16 * 1024 * 1024,
            slack_webhook_url: None,
            pager_webhook_url: None,
            notify_disabled: false,
            request_timeout_secs: 30,
        }
    }
}

impl GuardConfig {
    /// Load, apply environment overrides and validate.
    ///
    /// Resolution order for the file: `path`, then `DEPLOY_GUARD_CONFIG`, then
    /// `deploy-guard.json` in the current directory. Without any file the
    /// defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("DEPLOY_GUARD_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::load_from_path(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                info!("No config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file, YAML for `.yaml`/`.yml` and JSON otherwise.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let config = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| GuardError::Config(format!("{}: {e}", path.display())))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| GuardError::Config(format!("{}: {e}", path.display())))?
        };

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Overlay endpoint and telemetry settings from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PROMETHEUS_URL") {
            self.endpoints.prometheus_url = url;
        }
        if let Some(url) = lookup("DATA_PLANE_URL") {
            self.endpoints.data_plane_url = url;
        }
        if let Some(url) = lookup("SLACK_WEBHOOK_URL") {
            self.endpoints.slack_webhook_url = Some(url);
        }
        if let Some(url) = lookup("PAGER_WEBHOOK_URL") {
            self.endpoints.pager_webhook_url = Some(url);
        }
        if let Some(flag) = lookup("NOTIFY_DISABLED") {
            self.endpoints.notify_disabled = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(endpoint) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
        if let Some(environment) = lookup("ENVIRONMENT") {
            self.telemetry.environment = environment;
        }
        debug!("Applied environment overrides");
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(GuardError::Config(msg)) };

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return invalid("target with empty name".to_string());
            }
            if !seen.insert(target.name.as_str()) {
                return invalid(format!("duplicate target '{}'", target.name));
            }
            for rule in &target.rules {
                if rule.actions.is_empty() {
                    return invalid(format!(
                        "rule '{}' of target '{}' has no actions",
                        rule.display_name(),
                        target.name
                    ));
                }
                for action in &rule.actions {
                    if let Err(e) = action.validate() {
                        return invalid(format!(
                            "rule '{}' of target '{}': {e:#}",
                            rule.display_name(),
                            target.name
                        ));
                    }
                }
            }
        }

        if self.polling.interval_secs == 0 || self.polling.max_attempts == 0 {
            return invalid("polling interval and max attempts must be positive".to_string());
        }
        if self.polling.call_timeout_secs == 0 {
            return invalid("polling call timeout must be positive".to_string());
        }
        if self.rollback.steady_state_interval_secs == 0 || self.rollback.steady_state_max_attempts == 0
        {
            return invalid("rollback steady-state polling must be positive".to_string());
        }
        if self.monitor.interval_secs == 0 || self.monitor.consecutive_breaches == 0 {
            return invalid("monitor interval and breach count must be positive".to_string());
        }
        if self.orchestrator.tick_interval_secs == 0 {
            return invalid("orchestrator tick interval must be positive".to_string());
        }
        if self.orchestrator.event_log_capacity == 0 {
            return invalid("event log capacity must be positive".to_string());
        }
        if self.endpoints.event_journal_max_bytes == 0 {
            return invalid("event journal size limit must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.rollback.min_running_ratio) {
            return invalid("rollback min_running_ratio must be within 0..=1".to_string());
        }

        Ok(())
    }

    /// Target → rules grouping for the rule evaluator.
    #[must_use]
    pub fn rule_sets(&self) -> Vec<(String, Vec<RemediationRule>)> {
        self.targets
            .iter()
            .map(|t| (t.name.clone(), t.rules.clone()))
            .collect()
    }

    #[must_use]
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}
