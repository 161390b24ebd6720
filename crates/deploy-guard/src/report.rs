//! Remediation report for operators.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Duration, Utc};
use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::history::RemediationEvent;

const REPORT_TEMPLATE: &str = include_str!("../templates/report.hbs");

/// `{{mark flag}}` renders a check mark or a cross.
fn mark_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let flag = h
        .param(0)
        .and_then(|p| p.value().as_bool())
        .unwrap_or(false);
    out.write(if flag { "✓" } else { "✗" })?;
    Ok(())
}

/// One executed action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

/// One remediation event, flattened for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub id: String,
    pub occurred_at: String,
    pub rule: String,
    pub incident: String,
    pub recovered: bool,
    pub escalated: bool,
    pub actions: Vec<ActionSummary>,
    /// Metrics at the time the rule triggered
    pub metrics: Vec<MetricValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&RemediationEvent> for EventSummary {
    fn from(event: &RemediationEvent) -> Self {
        let metrics = event
            .results
            .first()
            .map(|r| {
                r.metrics
                    .values
                    .iter()
                    .map(|(name, value)| MetricValue {
                        name: name.to_string(),
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            id: event.id.clone(),
            occurred_at: event.occurred_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            rule: event.rule.clone(),
            incident: event.incident.to_string(),
            recovered: event.recovered,
            escalated: event.escalated,
            actions: event
                .results
                .iter()
                .map(|r| ActionSummary {
                    action: r.action.to_string(),
                    success: r.success,
                    error: r.error.clone(),
                })
                .collect(),
            metrics,
            error: event.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleCount {
    pub rule: String,
    pub count: usize,
}

/// Summary of one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub event_count: usize,
    pub recovered: usize,
    pub escalated: usize,
    pub rules: Vec<RuleCount>,
    pub events: Vec<EventSummary>,
}

/// Per-target remediation summary over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationReport {
    pub generated_at: DateTime<Utc>,
    pub hours: u32,
    pub total_events: usize,
    pub recovered: usize,
    pub escalated: usize,
    pub targets: Vec<TargetReport>,
}

impl RemediationReport {
    /// Summarize the events of the last `hours` before `now`.
    #[must_use]
    pub fn build(events: Vec<RemediationEvent>, hours: u32, now: DateTime<Utc>) -> Self {
        let cutoff = now - Duration::hours(i64::from(hours));
        let mut by_target: BTreeMap<String, Vec<RemediationEvent>> = BTreeMap::new();
        for event in events.into_iter().filter(|e| e.occurred_at >= cutoff) {
            by_target.entry(event.target.clone()).or_default().push(event);
        }

        let targets: Vec<TargetReport> = by_target
            .into_iter()
            .map(|(target, mut events)| {
                events.sort_by_key(|e| e.occurred_at);

                let mut rules: BTreeMap<&str, usize> = BTreeMap::new();
                for event in &events {
                    *rules.entry(event.rule.as_str()).or_default() += 1;
                }

                TargetReport {
                    event_count: events.len(),
                    recovered: events.iter().filter(|e| e.recovered).count(),
                    escalated: events.iter().filter(|e| e.escalated).count(),
                    rules: rules
                        .into_iter()
                        .map(|(rule, count)| RuleCount {
                            rule: rule.to_string(),
                            count,
                        })
                        .collect(),
                    events: events.iter().map(EventSummary::from).collect(),
                    target,
                }
            })
            .collect();

        Self {
            generated_at: now,
            hours,
            total_events: targets.iter().map(|t| t.event_count).sum(),
            recovered: targets.iter().map(|t| t.recovered).sum(),
            escalated: targets.iter().map(|t| t.escalated).sum(),
            targets,
        }
    }

    /// Human-readable rendering.
    pub fn render_text(&self) -> Result<String> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("mark", Box::new(mark_helper));
        handlebars
            .register_template_string("report", REPORT_TEMPLATE)
            .context("Failed to register report template")?;
        handlebars
            .render("report", self)
            .context("Failed to render remediation report")
    }

    pub fn render_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize remediation report")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ActionType, RemediationAction};
    use crate::history::RemediationResult;
    use crate::metrics::{MetricName, MetricSnapshot};
    use crate::verifier::IncidentType;

    fn event(target: &str, rule: &str, at: DateTime<Utc>, recovered: bool) -> RemediationEvent {
        let mut event = RemediationEvent::new(target, rule, IncidentType::HighErrorRate, at);
        event.results.push(RemediationResult::succeeded(
            RemediationAction::new(ActionType::Restart),
            MetricSnapshot::new(at).with(MetricName::ErrorRate, 0.08),
            at,
        ));
        event.recovered = recovered;
        event
    }

    #[test]
    fn test_build_groups_by_target_within_window() {
        let now = Utc::now();
        let events = vec![
            event("api", "error_rate > 0.05", now - Duration::hours(1), true),
            event("api", "error_rate > 0.05", now - Duration::minutes(10), false),
            event("worker", "memory_usage > 0.9", now - Duration::hours(2), true),
            event("api", "error_rate > 0.05", now - Duration::hours(30), true),
        ];

        let report = RemediationReport::build(events, 24, now);
        assert_eq!(report.total_events, 3);
        assert_eq!(report.recovered, 2);
        assert_eq!(report.targets.len(), 2);

        let api = &report.targets[0];
        assert_eq!(api.target, "api");
        assert_eq!(api.event_count, 2);
        assert_eq!(api.rules[0].count, 2);
        assert_eq!(api.events[0].metrics[0].name, "error_rate");
    }

    #[test]
    fn test_render_text_lists_actions_and_metrics() {
        let now = Utc::now();
        let report = RemediationReport::build(
            vec![event("api", "error_rate > 0.05", now, true)],
            24,
            now,
        );
        let text = report.render_text().unwrap();
        assert!(text.contains("== api =="));
        assert!(text.contains("error_rate > 0.05 (x1)"));
        assert!(text.contains("✓ restart"));
        assert!(text.contains("error_rate=0.08"));
    }

    #[test]
    fn test_render_empty_report() {
        let report = RemediationReport::build(Vec::new(), 6, Utc::now());
        assert!(report.render_text().unwrap().contains("No remediation events."));
        let json: serde_json::Value = serde_json::from_str(&report.render_json().unwrap()).unwrap();
        assert_eq!(json["total_events"], 0);
    }
}
