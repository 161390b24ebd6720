//! Typed metric snapshots.
//!
//! Every metric the engine reasons about has a fixed name, so rule conditions
//! and recovery criteria are validated when the configuration is loaded
//! instead of being looked up by arbitrary strings at evaluation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metrics understood by rules and recovery criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    /// Fraction of failed requests (0.0-1.0)
    ErrorRate,
    /// 95th percentile request latency in milliseconds
    #[serde(rename = "latency_p95_ms")]
    LatencyP95Ms,
    /// CPU usage as a fraction of the limit
    CpuUsage,
    /// Memory usage as a fraction of the limit
    MemoryUsage,
    /// Highest container restart count across the target's pods
    RestartCount,
    /// Data-layer connection errors in the sampling window
    ConnectionErrors,
    /// Slow queries in the sampling window
    SlowQueries,
    /// Cache allocator fragmentation ratio
    MemoryFragmentation,
    /// 1.0 when a memory leak is suspected, 0.0 otherwise
    MemoryLeak,
    /// Requests per second
    RequestRate,
}

impl MetricName {
    /// Stable snake_case name, as used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::LatencyP95Ms => "latency_p95_ms",
            Self::CpuUsage => "cpu_usage",
            Self::MemoryUsage => "memory_usage",
            Self::RestartCount => "restart_count",
            Self::ConnectionErrors => "connection_errors",
            Self::SlowQueries => "slow_queries",
            Self::MemoryFragmentation => "memory_fragmentation",
            Self::MemoryLeak => "memory_leak",
            Self::RequestRate => "request_rate",
        }
    }

    /// All known metrics.
    pub const ALL: [Self; 10] = [
        Self::ErrorRate,
        Self::LatencyP95Ms,
        Self::CpuUsage,
        Self::MemoryUsage,
        Self::RestartCount,
        Self::ConnectionErrors,
        Self::SlowQueries,
        Self::MemoryFragmentation,
        Self::MemoryLeak,
        Self::RequestRate,
    ];
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied between a sampled value and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
}

impl Comparison {
    /// Evaluate `value <op> threshold`.
    #[must_use]
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
        }
    }

    /// Operator symbol for reports and log lines.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Gte => ">=",
            Self::Lte => "<=",
        }
    }
}

/// Point-in-time sample of a target's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// When the sample was taken
    pub taken_at: DateTime<Utc>,
    /// Sampled values; metrics the backend could not provide are absent
    pub values: BTreeMap<MetricName, f64>,
}

impl MetricSnapshot {
    /// Empty snapshot taken at `taken_at`.
    #[must_use]
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, metric: MetricName, value: f64) -> Self {
        self.values.insert(metric, value);
        self
    }

    /// Look up a metric value.
    #[must_use]
    pub fn get(&self, metric: MetricName) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    /// Set a metric value.
    pub fn insert(&mut self, metric: MetricName, value: f64) {
        self.values.insert(metric, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparisons() {
        assert!(Comparison::Gt.holds(0.08, 0.05));
        assert!(!Comparison::Gt.holds(0.05, 0.05));
        assert!(Comparison::Lt.holds(0.6, 0.8));
        assert!(Comparison::Eq.holds(0.0, 0.0));
        assert!(!Comparison::Eq.holds(0.1, 0.0));
        assert!(Comparison::Gte.holds(5.0, 5.0));
        assert!(Comparison::Lte.holds(5.0, 5.0));
    }

    #[test]
    fn test_metric_names_round_trip_config_spelling() {
        for metric in MetricName::ALL {
            let json = serde_json::to_string(&metric).unwrap();
            assert_eq!(json, format!("\"{}\"", metric.as_str()));
        }
        let parsed: Result<MetricName, _> = serde_json::from_str("\"queue_depth\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = MetricSnapshot::new(Utc::now()).with(MetricName::ErrorRate, 0.08);
        assert_eq!(snapshot.get(MetricName::ErrorRate), Some(0.08));
        assert_eq!(snapshot.get(MetricName::CpuUsage), None);
    }
}
