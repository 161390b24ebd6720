//! Remediation history: the per-target event log and the cooldown table.
//!
//! These are the only pieces of shared mutable state in the engine. Both are
//! guarded by tokio locks and are safe to use from concurrent target cycles.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::GuardError;
use crate::executor::RemediationAction;
use crate::metrics::MetricSnapshot;
use crate::verifier::IncidentType;

/// Outcome of one attempted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationResult {
    pub success: bool,
    pub action: RemediationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Metrics at the time the remediation was triggered
    pub metrics: MetricSnapshot,
    pub executed_at: DateTime<Utc>,
}

impl RemediationResult {
    #[must_use]
    pub fn succeeded(
        action: RemediationAction,
        metrics: MetricSnapshot,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: true,
            action,
            error: None,
            metrics,
            executed_at,
        }
    }

    #[must_use]
    pub fn failed(
        action: RemediationAction,
        error: &GuardError,
        metrics: MetricSnapshot,
        executed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            action,
            error: Some(error.to_string()),
            metrics,
            executed_at,
        }
    }
}

/// One remediation attempt against a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEvent {
    pub id: String,
    pub target: String,
    /// Display name of the rule that triggered
    pub rule: String,
    pub incident: IncidentType,
    pub results: Vec<RemediationResult>,
    /// Recovery was verified after the actions ran
    pub recovered: bool,
    /// The attempt was handed to humans
    pub escalated: bool,
    /// Why the attempt did not succeed, if it did not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl RemediationEvent {
    /// New event with a random id.
    #[must_use]
    pub fn new(
        target: impl Into<String>,
        rule: impl Into<String>,
        incident: IncidentType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            rule: rule.into(),
            incident,
            results: Vec::new(),
            recovered: false,
            escalated: false,
            error: None,
            occurred_at,
        }
    }

    /// Every action succeeded and recovery was verified.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.recovered && self.results.iter().all(|r| r.success)
    }

    /// Actions that ran, in order, rendered for humans.
    #[must_use]
    pub fn attempted_actions(&self) -> Vec<String> {
        self.results.iter().map(|r| r.action.to_string()).collect()
    }
}

/// Bounded per-target log of remediation events.
///
/// Each target keeps at most `capacity` events; the oldest are dropped first.
pub struct EventLog {
    capacity: usize,
    events: RwLock<HashMap<String, VecDeque<RemediationEvent>>>,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(HashMap::new()),
        }
    }

    /// Record an event under its target.
    pub async fn append(&self, event: RemediationEvent) {
        let mut events = self.events.write().await;
        let log = events.entry(event.target.clone()).or_default();
        if log.len() == self.capacity {
            if let Some(dropped) = log.pop_front() {
                debug!(target = %dropped.target, event = %dropped.id, "Event log full, dropping oldest");
            }
        }
        log.push_back(event);
    }

    /// Events of `target`, oldest first.
    pub async fn events_for(&self, target: &str) -> Vec<RemediationEvent> {
        self.events
            .read()
            .await
            .get(target)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Events of every target that occurred at or after `cutoff`, oldest first.
    pub async fn since(&self, cutoff: DateTime<Utc>) -> Vec<RemediationEvent> {
        let mut events: Vec<RemediationEvent> = self
            .events
            .read()
            .await
            .values()
            .flatten()
            .filter(|e| e.occurred_at >= cutoff)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.occurred_at);
        events
    }

    /// Time of the most recent event of `target`.
    pub async fn last_event_at(&self, target: &str) -> Option<DateTime<Utc>> {
        self.events
            .read()
            .await
            .get(target)
            .and_then(|log| log.back())
            .map(|e| e.occurred_at)
    }

    /// Total number of retained events.
    pub async fn len(&self) -> usize {
        self.events.read().await.values().map(VecDeque::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Last remediation time per target.
#[derive(Default)]
pub struct CooldownTable {
    last_action: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CooldownTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remediation attempt (or verified recovery) at `at`.
    pub async fn stamp(&self, target: &str, at: DateTime<Utc>) {
        self.last_action.lock().await.insert(target.to_string(), at);
    }

    pub async fn last_action(&self, target: &str) -> Option<DateTime<Utc>> {
        self.last_action.lock().await.get(target).copied()
    }

    /// Whether less than `cooldown` has passed since the last action on `target`.
    pub async fn in_cooldown(&self, target: &str, cooldown: Duration, now: DateTime<Utc>) -> bool {
        self.remaining(target, cooldown, now).await.is_some()
    }

    /// Time left in the cooldown window, if the target is inside one.
    pub async fn remaining(
        &self,
        target: &str,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let last = self.last_action(target).await?;
        let elapsed = now - last;
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionType;

    fn event(target: &str, at: DateTime<Utc>) -> RemediationEvent {
        RemediationEvent::new(target, "error_rate > 0.05", IncidentType::HighErrorRate, at)
    }

    #[tokio::test]
    async fn test_event_log_is_bounded_per_target() {
        let log = EventLog::new(2);
        let start = Utc::now();
        for i in 0..3 {
            log.append(event("api", start + Duration::seconds(i))).await;
        }
        log.append(event("worker", start)).await;

        let api = log.events_for("api").await;
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].occurred_at, start + Duration::seconds(1));
        assert_eq!(log.len().await, 3);
    }

    #[tokio::test]
    async fn test_since_filters_and_orders() {
        let log = EventLog::new(10);
        let now = Utc::now();
        log.append(event("worker", now - Duration::minutes(5))).await;
        log.append(event("api", now - Duration::hours(3))).await;
        log.append(event("api", now - Duration::minutes(30))).await;

        let recent = log.since(now - Duration::hours(1)).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].target, "api");
        assert_eq!(recent[1].target, "worker");
    }

    #[tokio::test]
    async fn test_cooldown_window() {
        let table = CooldownTable::new();
        let now = Utc::now();
        assert!(!table.in_cooldown("api", Duration::seconds(900), now).await);

        table.stamp("api", now).await;
        let later = now + Duration::seconds(60);
        assert!(table.in_cooldown("api", Duration::seconds(900), later).await);
        assert_eq!(
            table.remaining("api", Duration::seconds(900), later).await,
            Some(Duration::seconds(840))
        );
        assert!(!table.in_cooldown("api", Duration::seconds(900), now + Duration::seconds(900)).await);
        assert!(!table.in_cooldown("worker", Duration::seconds(900), later).await);
    }

    #[test]
    fn test_event_success_requires_recovery() {
        let now = Utc::now();
        let mut e = event("api", now);
        e.results.push(RemediationResult::succeeded(
            RemediationAction::new(ActionType::Restart),
            MetricSnapshot::new(now),
            now,
        ));
        assert!(!e.succeeded());
        e.recovered = true;
        assert!(e.succeeded());
        assert_eq!(e.attempted_actions(), vec!["restart".to_string()]);
    }
}
