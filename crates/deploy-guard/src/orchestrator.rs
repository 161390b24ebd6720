//! Remediation loop.
//!
//! Each tick evaluates every target concurrently. A target is skipped while
//! another cycle holds its lock or while it is inside its cooldown window.
//! Otherwise its metrics are matched against its rules and the first match
//! is executed, verified, journaled and, after repeated failures, escalated.
//! All state changes go through the executor or the rollback controller.

use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::error::GuardError;
use crate::executor::ActionExecutor;
use crate::history::{CooldownTable, EventLog, RemediationEvent};
use crate::metrics::MetricSnapshot;
use crate::monitor::{DeploymentMonitor, MonitorHandle};
use crate::poll::with_timeout;
use crate::report::RemediationReport;
use crate::rollback::{RollbackController, RollbackTarget};
use crate::rules::{RemediationRule, RuleEvaluator, RuleMatch};
use crate::services::{Incident, MetricsService, NotificationService, Target};
use crate::verifier::RecoveryVerifier;

/// A target under remediation.
#[derive(Debug, Clone)]
pub struct GuardedTarget {
    pub target: Target,
    /// Roll back once remediation has been escalated
    pub auto_rollback: bool,
}

/// What a tick did with one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Another cycle is still working on the target
    Busy,
    /// Inside the cooldown window
    Cooldown { remaining_secs: i64 },
    /// Metrics could not be fetched
    MetricsUnavailable { error: String },
    /// No rule matched
    Healthy,
    /// Actions ran and recovery was verified
    Remediated { rule: String, event_id: String },
    /// Actions failed or recovery was not verified
    Failed {
        rule: String,
        event_id: String,
        escalated: bool,
    },
}

/// Per-target outcomes of one tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub outcomes: BTreeMap<String, TargetOutcome>,
}

impl TickSummary {
    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    #[must_use]
    pub fn remediated(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Remediated { .. }))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                TargetOutcome::Busy
                    | TargetOutcome::Cooldown { .. }
                    | TargetOutcome::MetricsUnavailable { .. }
            )
        })
    }

    #[must_use]
    pub fn escalated(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed { escalated: true, .. }))
    }
}

/// Shared components handed to the orchestrator.
pub struct OrchestratorParts {
    pub evaluator: Arc<RuleEvaluator>,
    pub executor: Arc<ActionExecutor>,
    pub verifier: Arc<RecoveryVerifier>,
    pub rollback: Arc<RollbackController>,
    pub monitor: DeploymentMonitor,
    pub metrics: Arc<dyn MetricsService>,
    pub notifications: Arc<dyn NotificationService>,
    pub cooldowns: Arc<CooldownTable>,
    pub events: Arc<EventLog>,
    pub clock: Arc<dyn Clock>,
}

/// A guarded target and the lock serializing its remediation.
struct TargetSlot {
    guarded: GuardedTarget,
    lock: Arc<Mutex<()>>,
}

/// Top-level remediation loop.
pub struct RemediationOrchestrator {
    parts: OrchestratorParts,
    roster: RwLock<Vec<Arc<TargetSlot>>>,
    failures: Mutex<HashMap<String, u32>>,
    max_consecutive_failures: u32,
    tick_interval: Duration,
    call_timeout: Duration,
}

impl RemediationOrchestrator {
    #[must_use]
    pub fn new(
        parts: OrchestratorParts,
        targets: Vec<GuardedTarget>,
        max_consecutive_failures: u32,
        tick_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        let roster = targets
            .into_iter()
            .map(|guarded| {
                Arc::new(TargetSlot {
                    guarded,
                    lock: Arc::default(),
                })
            })
            .collect();
        Self {
            parts,
            roster: RwLock::new(roster),
            failures: Mutex::new(HashMap::new()),
            max_consecutive_failures: max_consecutive_failures.max(1),
            tick_interval,
            call_timeout,
        }
    }

    /// Targets currently under remediation.
    pub async fn targets(&self) -> Vec<GuardedTarget> {
        self.roster
            .read()
            .await
            .iter()
            .map(|slot| slot.guarded.clone())
            .collect()
    }

    /// Replace the guarded targets and their rules in one step.
    ///
    /// Targets kept by name keep their lock, so a cycle already running for
    /// one of them still excludes the next. Removed targets lose their
    /// failure counters; every breach timer is dropped.
    pub async fn reconfigure(&self, targets: Vec<(GuardedTarget, Vec<RemediationRule>)>) {
        let mut roster = self.roster.write().await;
        let mut previous: HashMap<String, Arc<Mutex<()>>> = roster
            .iter()
            .map(|slot| (slot.guarded.target.name.clone(), Arc::clone(&slot.lock)))
            .collect();

        let mut rule_sets = Vec::with_capacity(targets.len());
        let mut slots = Vec::with_capacity(targets.len());
        for (guarded, rules) in targets {
            let name = guarded.target.name.clone();
            let lock = previous.remove(&name).unwrap_or_default();
            rule_sets.push((name, rules));
            slots.push(Arc::new(TargetSlot { guarded, lock }));
        }

        self.parts.evaluator.reconfigure(rule_sets).await;
        {
            let mut failures = self.failures.lock().await;
            for removed in previous.keys() {
                failures.remove(removed);
            }
        }

        info!(
            targets = slots.len(),
            removed = previous.len(),
            "Remediation targets reconfigured"
        );
        *roster = slots;
    }

    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.parts.events
    }

    #[must_use]
    pub fn cooldowns(&self) -> &CooldownTable {
        &self.parts.cooldowns
    }

    /// One evaluation cycle across every target.
    pub async fn tick(&self) -> TickSummary {
        let roster = self.roster.read().await.clone();
        let outcomes = join_all(roster.iter().map(|slot| async move {
            let outcome = self.evaluate(slot).await;
            (slot.guarded.target.name.clone(), outcome)
        }))
        .await;

        let summary = TickSummary {
            outcomes: outcomes.into_iter().collect(),
        };
        info!(
            targets = summary.outcomes.len(),
            remediated = summary.remediated(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            "Remediation tick finished"
        );
        summary
    }

    /// Tick on a fixed interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.tick_interval.as_secs(),
            targets = self.roster.read().await.len(),
            "Remediation loop started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Remediation loop stopped");
    }

    /// Watch the rollout of `target`.
    pub async fn monitor_deployment(&self, target: Target) -> MonitorHandle {
        self.parts.monitor.start(target).await
    }

    /// Remediation summary for the trailing `hours`.
    ///
    /// Events come from the metrics service's journal; a target whose
    /// journal cannot be read falls back to the in-process event log.
    pub async fn report(&self, hours: u32) -> RemediationReport {
        let now = self.parts.clock.now();
        let window = ChronoDuration::hours(i64::from(hours));
        let mut events = Vec::new();

        for guarded in self.targets().await {
            let name = &guarded.target.name;
            match with_timeout(
                self.call_timeout,
                "remediation events",
                self.parts.metrics.remediation_events(name, window),
            )
            .await
            {
                Ok(journaled) => events.extend(journaled),
                Err(e) => {
                    warn!(target = %name, error = %e, "Journal unavailable, reporting from memory");
                    let cutoff = now - window;
                    events.extend(
                        self.parts
                            .events
                            .events_for(name)
                            .await
                            .into_iter()
                            .filter(|event| event.occurred_at >= cutoff),
                    );
                }
            }
        }

        RemediationReport::build(events, hours, now)
    }

    #[instrument(skip(self, slot), fields(target = %slot.guarded.target.name))]
    async fn evaluate(&self, slot: &TargetSlot) -> TargetOutcome {
        let guarded = &slot.guarded;
        let name = guarded.target.name.as_str();
        let Ok(_held) = slot.lock.try_lock() else {
            debug!("Previous cycle still running, skipping");
            return TargetOutcome::Busy;
        };

        let now = self.parts.clock.now();
        let cooldown = self.parts.evaluator.max_cooldown(name).await;
        if let Some(remaining) = self.parts.cooldowns.remaining(name, cooldown, now).await {
            debug!(remaining_secs = remaining.num_seconds(), "In cooldown, skipping");
            return TargetOutcome::Cooldown {
                remaining_secs: remaining.num_seconds(),
            };
        }

        let snapshot = match with_timeout(
            self.call_timeout,
            "metrics fetch",
            self.parts.metrics.current_metrics(&guarded.target.service),
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Metrics unavailable, skipping target this cycle");
                return TargetOutcome::MetricsUnavailable {
                    error: format!("{e:#}"),
                };
            }
        };

        match self.parts.evaluator.first_match(name, &snapshot).await {
            Some(matched) => self.remediate(guarded, matched, snapshot).await,
            None => TargetOutcome::Healthy,
        }
    }

    async fn remediate(
        &self,
        guarded: &GuardedTarget,
        matched: RuleMatch,
        snapshot: MetricSnapshot,
    ) -> TargetOutcome {
        let target = &guarded.target;
        let rule_name = matched.rule.display_name();
        let incident = matched.rule.incident_type();
        info!(
            rule = %rule_name,
            value = matched.value,
            incident = %incident,
            breach_secs = (snapshot.taken_at - matched.breach_started).num_seconds(),
            "Remediation rule matched"
        );

        let mut event = RemediationEvent::new(&target.name, &rule_name, incident, self.parts.clock.now());
        event.results = self
            .parts
            .executor
            .execute_sequence(target, &matched.rule.actions, &snapshot)
            .await;

        let all_ran = event.results.len() == matched.rule.actions.len()
            && event.results.iter().all(|r| r.success);
        if all_ran {
            match self.parts.verifier.ensure_recovered(target, incident).await {
                Ok(_) => event.recovered = true,
                Err(e) => event.error = Some(e.to_string()),
            }
        } else {
            event.error = event.results.iter().rev().find_map(|r| r.error.clone());
        }

        self.parts.cooldowns.stamp(&target.name, self.parts.clock.now()).await;
        self.parts.evaluator.reset(&target.name).await;

        if !event.succeeded() {
            event.escalated = self.record_failure(guarded, &event, &snapshot).await;
        } else {
            self.failures.lock().await.remove(&target.name);
        }

        let outcome = if event.succeeded() {
            TargetOutcome::Remediated {
                rule: rule_name,
                event_id: event.id.clone(),
            }
        } else {
            TargetOutcome::Failed {
                rule: rule_name,
                event_id: event.id.clone(),
                escalated: event.escalated,
            }
        };

        if let Err(e) = with_timeout(
            self.call_timeout,
            "record remediation event",
            self.parts.metrics.record_remediation_event(&event),
        )
        .await
        {
            warn!(error = %e, "Failed to journal remediation event");
        }
        self.parts.events.append(event).await;

        outcome
    }

    /// Count a failed attempt; escalate once the limit is reached. Returns
    /// whether the target was escalated.
    async fn record_failure(
        &self,
        guarded: &GuardedTarget,
        event: &RemediationEvent,
        snapshot: &MetricSnapshot,
    ) -> bool {
        let name = &guarded.target.name;
        let attempts = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(name.clone()).or_insert(0);
            *count += 1;
            let attempts = *count;
            if attempts >= self.max_consecutive_failures {
                failures.remove(name);
            }
            attempts
        };

        warn!(
            attempts,
            max = self.max_consecutive_failures,
            error = event.error.as_deref().unwrap_or("unknown"),
            "Remediation attempt failed"
        );
        if attempts < self.max_consecutive_failures {
            return false;
        }

        let mut incident = Incident::new(
            name,
            event.incident.as_str(),
            format!(
                "Automated remediation of {} failed {attempts} times in a row ({})",
                name, event.rule
            ),
            self.parts.clock.now(),
        );
        incident.attempted_actions = event.attempted_actions();
        incident.error.clone_from(&event.error);
        incident.metrics = Some(snapshot.clone());

        error!(incident = %incident.id, "Escalating remediation failure");
        if let Err(e) = with_timeout(
            self.call_timeout,
            "escalation",
            self.parts.notifications.escalate_incident(&incident),
        )
        .await
        {
            error!(error = %e, "Failed to escalate incident");
        }

        if guarded.auto_rollback {
            info!("Auto-rollback enabled, handing target to rollback controller");
            match self
                .parts
                .rollback
                .rollback(&RollbackTarget::for_target(&guarded.target))
                .await
            {
                Ok(outcome) => info!(revision = outcome.revision, "Auto-rollback complete"),
                Err(e) => log_rollback_failure(&e),
            }
        }

        true
    }
}

fn log_rollback_failure(err: &GuardError) {
    error!(error = %err, escalated = err.requires_escalation(), "Auto-rollback failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{MonitorConfig, RecoveryConfig, RollbackConfig};
    use crate::executor::{ActionType, RemediationAction};
    use crate::metrics::{Comparison, MetricName};
    use crate::poll::PollPolicy;
    use crate::rules::RemediationRule;
    use crate::services::{
        DataPlaneService, DeploymentStatus, MockDataPlaneService, MockMetricsService,
        MockNotificationService, MockOrchestrationService, OrchestrationService, PodInfo,
        ServiceHealth,
    };
    use anyhow::anyhow;
    use chrono::Utc;

    struct Harness {
        orchestrator: RemediationOrchestrator,
        clock: Arc<ManualClock>,
    }

    fn harness(
        orchestration: MockOrchestrationService,
        metrics: MockMetricsService,
        notifications: MockNotificationService,
        rules: Vec<RemediationRule>,
        max_failures: u32,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let orchestration: Arc<dyn OrchestrationService> = Arc::new(orchestration);
        let metrics: Arc<dyn MetricsService> = Arc::new(metrics);
        let notifications: Arc<dyn NotificationService> = Arc::new(notifications);
        let data_plane: Arc<dyn DataPlaneService> = Arc::new(MockDataPlaneService::new());
        let cooldowns = Arc::new(CooldownTable::new());
        let timeout = Duration::from_secs(5);

        let rollback = Arc::new(RollbackController::new(
            orchestration.clone(),
            metrics.clone(),
            notifications.clone(),
            clock.clone(),
            RollbackConfig::default(),
            timeout,
        ));
        let parts = OrchestratorParts {
            evaluator: Arc::new(RuleEvaluator::new([("api".to_string(), rules)])),
            executor: Arc::new(ActionExecutor::new(
                orchestration.clone(),
                data_plane,
                notifications.clone(),
                clock.clone(),
                PollPolicy::new(Duration::from_secs(1), 3),
                timeout,
            )),
            verifier: Arc::new(RecoveryVerifier::new(
                orchestration.clone(),
                metrics.clone(),
                notifications.clone(),
                cooldowns.clone(),
                clock.clone(),
                RecoveryConfig::default(),
                timeout,
            )),
            monitor: DeploymentMonitor::new(
                orchestration,
                metrics.clone(),
                rollback.clone(),
                MonitorConfig::default(),
                timeout,
            ),
            rollback,
            metrics,
            notifications,
            cooldowns,
            events: Arc::new(EventLog::new(10)),
            clock: clock.clone(),
        };

        Harness {
            orchestrator: RemediationOrchestrator::new(
                parts,
                vec![GuardedTarget {
                    target: Target::named("prod", "api"),
                    auto_rollback: false,
                }],
                max_failures,
                Duration::from_secs(60),
                timeout,
            ),
            clock,
        }
    }

    fn restart_rule() -> RemediationRule {
        RemediationRule::new(MetricName::MemoryUsage, Comparison::Gt, 0.9, 0)
            .with_action(RemediationAction::new(ActionType::Restart))
            .with_cooldown(600)
    }

    fn steady_platform() -> MockOrchestrationService {
        let mut orchestration = MockOrchestrationService::new();
        orchestration.expect_restart().returning(|_, _| Ok(()));
        // Every read sees the controller caught up with a newer spec.
        let mut generation = 0;
        orchestration.expect_deployment_status().returning(move |_, _| {
            generation += 1;
            Ok(DeploymentStatus {
                replicas: 2,
                available_replicas: 2,
                updated_replicas: 2,
                ready_replicas: 2,
                generation,
                observed_generation: generation,
            })
        });
        orchestration.expect_pods().returning(|_, _| {
            Ok(vec![PodInfo {
                name: "api-0".to_string(),
                phase: "Running".to_string(),
                ready: true,
                restart_count: 0,
            }])
        });
        orchestration.expect_service_health().returning(|_, _| {
            Ok(ServiceHealth {
                healthy: true,
                detail: "ok".to_string(),
            })
        });
        orchestration
    }

    fn metrics_with_memory(memory: f64) -> MockMetricsService {
        let mut metrics = MockMetricsService::new();
        metrics.expect_current_metrics().returning(move |_| {
            Ok(MetricSnapshot::new(Utc::now())
                .with(MetricName::MemoryUsage, memory)
                .with(MetricName::LatencyP95Ms, 100.0))
        });
        metrics.expect_error_rate().returning(|_| Ok(0.0));
        metrics.expect_record_remediation_event().returning(|_| Ok(()));
        metrics
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_escalates_after_limit() {
        let mut notifications = MockNotificationService::new();
        notifications
            .expect_escalate_incident()
            .withf(|incident| incident.kind == "high_memory" && incident.attempted_actions == ["restart"])
            .times(1)
            .returning(|_| Ok(()));
        notifications.expect_send_recovery_success().never();

        let h = harness(
            steady_platform(),
            metrics_with_memory(0.95),
            notifications,
            vec![restart_rule()],
            2,
        );

        let first = h.orchestrator.tick().await;
        assert!(matches!(
            first.outcomes["api"],
            TargetOutcome::Failed { escalated: false, .. }
        ));

        h.clock.advance(ChronoDuration::seconds(601));
        let second = h.orchestrator.tick().await;
        assert_eq!(second.escalated(), 1);

        let events = h.orchestrator.events().events_for("api").await;
        assert_eq!(events.len(), 2);
        assert!(events[1].escalated);
        assert!(events[0].error.as_deref().unwrap().contains("not verified"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_failure_skips_target() {
        let mut metrics = MockMetricsService::new();
        metrics
            .expect_current_metrics()
            .returning(|_| Err(anyhow!("prometheus down")));
        metrics.expect_record_remediation_event().never();

        let h = harness(
            MockOrchestrationService::new(),
            metrics,
            MockNotificationService::new(),
            vec![restart_rule()],
            3,
        );
        let summary = h.orchestrator.tick().await;
        assert!(matches!(
            summary.outcomes["api"],
            TargetOutcome::MetricsUnavailable { .. }
        ));
        assert!(h.orchestrator.events().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_target_is_left_alone() {
        let mut orchestration = MockOrchestrationService::new();
        orchestration.expect_restart().never();

        let h = harness(
            orchestration,
            metrics_with_memory(0.4),
            MockNotificationService::new(),
            vec![restart_rule()],
            3,
        );
        let summary = h.orchestrator.tick().await;
        assert_eq!(summary.outcomes["api"], TargetOutcome::Healthy);
        assert!(h.orchestrator.cooldowns().last_action("api").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_swaps_targets_and_rules() {
        let mut orchestration = MockOrchestrationService::new();
        orchestration.expect_restart().never();
        let h = harness(
            orchestration,
            metrics_with_memory(0.95),
            MockNotificationService::new(),
            Vec::new(),
            3,
        );

        let summary = h.orchestrator.tick().await;
        assert_eq!(summary.outcomes["api"], TargetOutcome::Healthy);

        let worker = GuardedTarget {
            target: Target::named("prod", "worker"),
            auto_rollback: true,
        };
        let lenient = RemediationRule::new(MetricName::MemoryUsage, Comparison::Gt, 0.99, 0)
            .with_action(RemediationAction::new(ActionType::Restart));
        h.orchestrator.reconfigure(vec![(worker, vec![lenient])]).await;

        let targets = h.orchestrator.targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].target.name, "worker");
        assert!(targets[0].auto_rollback);

        let summary = h.orchestrator.tick().await;
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes["worker"], TargetOutcome::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_falls_back_to_event_log() {
        let mut metrics = metrics_with_memory(0.95);
        metrics
            .expect_remediation_events()
            .returning(|_, _| Err(anyhow!("journal missing")));
        let mut notifications = MockNotificationService::new();
        notifications.expect_escalate_incident().returning(|_| Ok(()));

        let h = harness(steady_platform(), metrics, notifications, vec![restart_rule()], 3);
        h.orchestrator.tick().await;

        let report = h.orchestrator.report(24).await;
        assert_eq!(report.total_events, 1);
        assert_eq!(report.targets[0].target, "api");
    }
}
