//! Remediation rules and the sustained-breach evaluator.
//!
//! A rule matches only after its condition has held continuously for the
//! rule's duration. The evaluator keeps one breach timer per (target, rule)
//! pair; any sample where the condition does not hold, or where the metric is
//! missing, clears that timer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::executor::RemediationAction;
use crate::metrics::{Comparison, MetricName, MetricSnapshot};
use crate::verifier::IncidentType;

/// Metric condition of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: MetricName,
    pub operator: Comparison,
    pub threshold: f64,
    /// Seconds the condition must hold before the rule fires
    #[serde(default, alias = "duration")]
    pub duration_secs: u64,
}

impl Condition {
    /// Evaluate against a snapshot. A missing metric never holds.
    #[must_use]
    pub fn holds(&self, snapshot: &MetricSnapshot) -> Option<f64> {
        let value = snapshot.get(self.metric)?;
        self.operator.holds(value, self.threshold).then_some(value)
    }

    /// Required breach duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs as i64)
    }
}

/// Condition-to-action mapping for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRule {
    /// Rule name for logs and reports; derived from the condition when empty
    #[serde(default)]
    pub name: String,
    pub condition: Condition,
    /// Executed strictly in order
    pub actions: Vec<RemediationAction>,
    /// Minimum seconds between two remediation attempts on the target
    #[serde(default, alias = "cooldown")]
    pub cooldown_secs: u64,
    /// Incident classification used for recovery verification
    #[serde(default)]
    pub incident: Option<IncidentType>,
}

impl RemediationRule {
    /// Rule on `metric <operator> threshold` held for `duration_secs`.
    #[must_use]
    pub fn new(metric: MetricName, operator: Comparison, threshold: f64, duration_secs: u64) -> Self {
        Self {
            name: String::new(),
            condition: Condition {
                metric,
                operator,
                threshold,
                duration_secs,
            },
            actions: Vec::new(),
            cooldown_secs: 0,
            incident: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: RemediationAction) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    #[must_use]
    pub fn with_incident(mut self, incident: IncidentType) -> Self {
        self.incident = Some(incident);
        self
    }

    /// Name used in logs and reports.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!(
                "{} {} {}",
                self.condition.metric,
                self.condition.operator.symbol(),
                self.condition.threshold
            )
        } else {
            self.name.clone()
        }
    }

    /// Cooldown as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_secs as i64)
    }

    /// Incident this rule remediates, explicit or inferred from its metric.
    #[must_use]
    pub fn incident_type(&self) -> IncidentType {
        self.incident
            .unwrap_or_else(|| IncidentType::for_metric(self.condition.metric))
    }
}

/// A rule whose condition has held for at least its duration.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// Declaration index within the target's rule list
    pub index: usize,
    pub rule: RemediationRule,
    /// Sampled value that satisfied the condition
    pub value: f64,
    /// When the current breach began
    pub breach_started: DateTime<Utc>,
}

type BreachKey = (String, usize);

/// Matches metric snapshots against per-target rule lists.
pub struct RuleEvaluator {
    rules: RwLock<HashMap<String, Arc<[RemediationRule]>>>,
    breaches: Mutex<HashMap<BreachKey, DateTime<Utc>>>,
}

impl RuleEvaluator {
    /// Create an evaluator from target → rules groupings.
    pub fn new(rules: impl IntoIterator<Item = (String, Vec<RemediationRule>)>) -> Self {
        Self {
            rules: RwLock::new(Self::index(rules)),
            breaches: Mutex::new(HashMap::new()),
        }
    }

    fn index(
        rules: impl IntoIterator<Item = (String, Vec<RemediationRule>)>,
    ) -> HashMap<String, Arc<[RemediationRule]>> {
        rules
            .into_iter()
            .map(|(target, rules)| (target, Arc::from(rules)))
            .collect()
    }

    /// Rules configured for `target`, in declaration order.
    pub async fn rules_for(&self, target: &str) -> Arc<[RemediationRule]> {
        self.rules
            .read()
            .await
            .get(target)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Every target with at least one rule.
    pub async fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.rules.read().await.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Rules whose condition currently holds and has held for their duration.
    ///
    /// The snapshot's timestamp is the observation time. Breach timers of every
    /// rule are updated, including rules that do not match yet.
    pub async fn matches(&self, target: &str, snapshot: &MetricSnapshot) -> Vec<RuleMatch> {
        let rules = self.rules_for(target).await;
        let observed_at = snapshot.taken_at;
        let mut breaches = self.breaches.lock().await;
        let mut matched = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            let key = (target.to_string(), index);
            let Some(value) = rule.condition.holds(snapshot) else {
                if breaches.remove(&key).is_some() {
                    debug!(target = %target, rule = %rule.display_name(), "Breach cleared");
                }
                continue;
            };

            let started = *breaches.entry(key).or_insert(observed_at);
            if observed_at - started >= rule.condition.duration() {
                matched.push(RuleMatch {
                    index,
                    rule: rule.clone(),
                    value,
                    breach_started: started,
                });
            } else {
                debug!(
                    target = %target,
                    rule = %rule.display_name(),
                    value = %value,
                    held_secs = (observed_at - started).num_seconds(),
                    "Breach not yet sustained"
                );
            }
        }

        matched
    }

    /// First matching rule in declaration order; the only one acted on per cycle.
    pub async fn first_match(&self, target: &str, snapshot: &MetricSnapshot) -> Option<RuleMatch> {
        self.matches(target, snapshot).await.into_iter().next()
    }

    /// Forget breach timers of `target`, e.g. after it was remediated.
    pub async fn reset(&self, target: &str) {
        self.breaches.lock().await.retain(|(t, _), _| t != target);
    }

    /// Replace the rule configuration. Breach timers are dropped since rule
    /// indexes no longer line up.
    pub async fn reconfigure(&self, rules: impl IntoIterator<Item = (String, Vec<RemediationRule>)>) {
        let rules = Self::index(rules);
        info!(targets = rules.len(), "Reconfiguring remediation rules");
        *self.rules.write().await = rules;
        self.breaches.lock().await.clear();
    }

    /// Longest cooldown among the target's rules.
    pub async fn max_cooldown(&self, target: &str) -> Duration {
        self.rules_for(target)
            .await
            .iter()
            .map(RemediationRule::cooldown)
            .max()
            .unwrap_or_else(Duration::zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionType;

    fn error_rate_rule() -> RemediationRule {
        RemediationRule::new(MetricName::ErrorRate, Comparison::Gt, 0.05, 300)
            .with_name("high-error-rate")
            .with_action(RemediationAction::new(ActionType::Restart))
            .with_cooldown(900)
    }

    fn sample(at: DateTime<Utc>, error_rate: f64) -> MetricSnapshot {
        MetricSnapshot::new(at).with(MetricName::ErrorRate, error_rate)
    }

    #[tokio::test]
    async fn test_single_noisy_sample_does_not_match() {
        let evaluator = RuleEvaluator::new([("api".to_string(), vec![error_rate_rule()])]);
        let t0 = Utc::now();

        assert!(evaluator.matches("api", &sample(t0, 0.5)).await.is_empty());
        // Dropping below the threshold resets the timer
        assert!(evaluator
            .matches("api", &sample(t0 + Duration::seconds(60), 0.01))
            .await
            .is_empty());
        assert!(evaluator
            .matches("api", &sample(t0 + Duration::seconds(400), 0.5))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_sustained_breach_matches_after_duration() {
        let evaluator = RuleEvaluator::new([("api".to_string(), vec![error_rate_rule()])]);
        let t0 = Utc::now();

        for secs in (0..300).step_by(30) {
            let at = t0 + Duration::seconds(secs);
            assert!(evaluator.matches("api", &sample(at, 0.08)).await.is_empty());
        }

        let matched = evaluator
            .matches("api", &sample(t0 + Duration::seconds(300), 0.08))
            .await;
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].breach_started, t0);
        assert!((matched[0].value - 0.08).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_metric_fails_closed() {
        let rule = RemediationRule::new(MetricName::MemoryUsage, Comparison::Lt, 0.5, 0);
        let evaluator = RuleEvaluator::new([("api".to_string(), vec![rule])]);
        // memory_usage absent: an `lt` rule must not treat it as zero
        let matched = evaluator.matches("api", &sample(Utc::now(), 0.0)).await;
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn test_first_match_uses_declaration_order() {
        let latency = RemediationRule::new(MetricName::LatencyP95Ms, Comparison::Gt, 500.0, 0)
            .with_name("latency");
        let errors =
            RemediationRule::new(MetricName::ErrorRate, Comparison::Gt, 0.05, 0).with_name("errors");
        let evaluator = RuleEvaluator::new([("api".to_string(), vec![latency, errors])]);

        let snapshot = MetricSnapshot::new(Utc::now())
            .with(MetricName::ErrorRate, 0.2)
            .with(MetricName::LatencyP95Ms, 900.0);
        assert_eq!(evaluator.matches("api", &snapshot).await.len(), 2);
        let first = evaluator.first_match("api", &snapshot).await.unwrap();
        assert_eq!(first.rule.name, "latency");
        assert_eq!(first.index, 0);
    }

    #[tokio::test]
    async fn test_eq_operator() {
        let rule = RemediationRule::new(MetricName::RequestRate, Comparison::Eq, 0.0, 0);
        let evaluator = RuleEvaluator::new([("api".to_string(), vec![rule])]);
        let idle = MetricSnapshot::new(Utc::now()).with(MetricName::RequestRate, 0.0);
        let busy = MetricSnapshot::new(Utc::now()).with(MetricName::RequestRate, 12.0);
        assert_eq!(evaluator.matches("api", &idle).await.len(), 1);
        assert!(evaluator.matches("api", &busy).await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_and_reconfigure_clear_timers() {
        let evaluator = RuleEvaluator::new([("api".to_string(), vec![error_rate_rule()])]);
        let t0 = Utc::now();
        evaluator.matches("api", &sample(t0, 0.08)).await;
        evaluator.reset("api").await;
        assert!(evaluator
            .matches("api", &sample(t0 + Duration::seconds(300), 0.08))
            .await
            .is_empty());

        evaluator
            .reconfigure([("api".to_string(), vec![error_rate_rule().with_cooldown(60)])])
            .await;
        assert_eq!(evaluator.max_cooldown("api").await, Duration::seconds(60));
        assert!(evaluator
            .matches("api", &sample(t0 + Duration::seconds(600), 0.08))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_has_no_rules() {
        let evaluator = RuleEvaluator::new(Vec::new());
        assert!(evaluator.rules_for("ghost").await.is_empty());
        assert_eq!(evaluator.max_cooldown("ghost").await, Duration::zero());
    }

    #[test]
    fn test_rule_deserializes_from_config_shape() {
        let rule: RemediationRule = serde_json::from_value(serde_json::json!({
            "condition": {"metric": "error_rate", "operator": "gt", "threshold": 0.05, "duration": 300},
            "actions": [{"type": "restart"}],
            "cooldown": 900
        }))
        .unwrap();
        assert_eq!(rule.condition.duration_secs, 300);
        assert_eq!(rule.cooldown_secs, 900);
        assert_eq!(rule.incident_type(), IncidentType::HighErrorRate);
        assert_eq!(rule.display_name(), "error_rate > 0.05");
    }
}
