//! Prometheus-backed metrics service.
//!
//! Every metric is an instant PromQL query with a `{service}` placeholder.
//! Remediation events are journaled to a local JSONL file.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::journal::EventJournal;
use crate::clock::Clock;
use crate::history::RemediationEvent;
use crate::metrics::{MetricName, MetricSnapshot};
use crate::services::MetricsService;

const LOAD_QUERY: &str = r#"1 - avg(rate(node_cpu_seconds_total{mode="idle"}[5m]))"#;

/// Built-in PromQL for `metric`.
#[must_use]
pub fn default_query(metric: MetricName) -> &'static str {
    match metric {
        MetricName::ErrorRate => {
            r#"sum(rate(http_requests_total{service="{service}",status=~"5.."}[5m])) / sum(rate(http_requests_total{service="{service}"}[5m]))"#
        }
        MetricName::LatencyP95Ms => {
            r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{service="{service}"}[5m])) by (le)) * 1000"#
        }
        MetricName::CpuUsage => {
            r#"sum(rate(container_cpu_usage_seconds_total{pod=~"{service}-.*"}[5m])) / sum(kube_pod_container_resource_limits{pod=~"{service}-.*",resource="cpu"})"#
        }
        MetricName::MemoryUsage => {
            r#"sum(container_memory_working_set_bytes{pod=~"{service}-.*"}) / sum(kube_pod_container_resource_limits{pod=~"{service}-.*",resource="memory"})"#
        }
        MetricName::RestartCount => {
            r#"max(increase(kube_pod_container_status_restarts_total{pod=~"{service}-.*"}[15m]))"#
        }
        MetricName::ConnectionErrors => {
            r#"sum(increase(db_connection_errors_total{service="{service}"}[5m]))"#
        }
        MetricName::SlowQueries => r#"sum(increase(db_slow_queries_total{service="{service}"}[5m]))"#,
        MetricName::MemoryFragmentation => r#"max(redis_mem_fragmentation_ratio{service="{service}"})"#,
        MetricName::MemoryLeak => {
            r#"sum(deriv(container_memory_working_set_bytes{pod=~"{service}-.*"}[1h])) > bool 0"#
        }
        MetricName::RequestRate => r#"sum(rate(http_requests_total{service="{service}"}[5m]))"#,
    }
}

/// Prometheus query response
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: Option<(f64, String)>,
}

/// [`MetricsService`] over the Prometheus HTTP API.
pub struct PrometheusMetrics {
    client: reqwest::Client,
    base_url: String,
    queries: BTreeMap<MetricName, String>,
    journal: EventJournal,
    clock: Arc<dyn Clock>,
}

impl PrometheusMetrics {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        journal: EventJournal,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            queries: BTreeMap::new(),
            journal,
            clock,
        })
    }

    /// Replace built-in queries.
    #[must_use]
    pub fn with_queries(mut self, queries: BTreeMap<MetricName, String>) -> Self {
        self.queries = queries;
        self
    }

    fn query_for(&self, metric: MetricName, service: &str) -> String {
        self.queries
            .get(&metric)
            .map_or_else(|| default_query(metric), String::as_str)
            .replace("{service}", service)
    }

    /// Execute an instant query and return the first sample, if any.
    pub async fn query(&self, promql: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!(query = %promql, "Querying Prometheus");

        let response = self
            .client
            .get(&url)
            .query(&[("query", promql)])
            .send()
            .await
            .context("Failed to send Prometheus query")?;

        if !response.status().is_success() {
            bail!("Prometheus returned {}", response.status());
        }

        let body: PrometheusResponse = response
            .json()
            .await
            .context("Failed to parse Prometheus response")?;

        if body.status != "success" {
            bail!(
                "Prometheus query failed: {}",
                body.error.unwrap_or_else(|| body.status.clone())
            );
        }

        let sample = body
            .data
            .and_then(|d| d.result.into_iter().find_map(|r| r.value))
            .map(|(_, value)| value.parse::<f64>())
            .transpose()
            .context("Prometheus returned a non-numeric sample")?;

        Ok(sample.filter(|v| v.is_finite()))
    }

    async fn metric(&self, metric: MetricName, service: &str) -> Result<f64> {
        self.query(&self.query_for(metric, service))
            .await?
            .ok_or_else(|| anyhow!("no {metric} samples for {service}"))
    }
}

#[async_trait]
impl MetricsService for PrometheusMetrics {
    async fn current_load(&self) -> Result<f64> {
        self.query(LOAD_QUERY)
            .await?
            .ok_or_else(|| anyhow!("no node CPU samples"))
    }

    async fn current_metrics(&self, service: &str) -> Result<MetricSnapshot> {
        let results = join_all(MetricName::ALL.iter().map(|metric| async move {
            (*metric, self.query(&self.query_for(*metric, service)).await)
        }))
        .await;

        let mut snapshot = MetricSnapshot::new(self.clock.now());
        let mut errors = Vec::new();
        for (metric, result) in results {
            match result {
                Ok(Some(value)) => snapshot.insert(metric, value),
                Ok(None) => debug!(metric = %metric, service, "No samples"),
                Err(e) => errors.push(format!("{metric}: {e:#}")),
            }
        }

        if snapshot.values.is_empty() && !errors.is_empty() {
            bail!("all metric queries failed for {service}: {}", errors.join("; "));
        }
        if !errors.is_empty() {
            warn!(service, failed = errors.len(), "Some metric queries failed");
        }
        Ok(snapshot)
    }

    async fn error_rate(&self, service: &str) -> Result<f64> {
        self.metric(MetricName::ErrorRate, service).await
    }

    async fn check_memory_leak(&self, service: &str) -> Result<bool> {
        Ok(self.metric(MetricName::MemoryLeak, service).await? > 0.0)
    }

    async fn connection_errors(&self, service: &str) -> Result<u64> {
        Ok(self.metric(MetricName::ConnectionErrors, service).await?.round().max(0.0) as u64)
    }

    async fn slow_queries(&self, service: &str) -> Result<u64> {
        Ok(self.metric(MetricName::SlowQueries, service).await?.round().max(0.0) as u64)
    }

    async fn memory_fragmentation(&self, service: &str) -> Result<f64> {
        self.metric(MetricName::MemoryFragmentation, service).await
    }

    async fn record_remediation_event(&self, event: &RemediationEvent) -> Result<()> {
        self.journal.append(event).await
    }

    async fn remediation_events(
        &self,
        service: &str,
        window: chrono::Duration,
    ) -> Result<Vec<RemediationEvent>> {
        self.journal.read(service, self.clock.now() - window).await
    }
}
