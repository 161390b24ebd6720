//! [`NotificationService`] over the `notify` channels.

use anyhow::{bail, Result};
use async_trait::async_trait;
use notify::{Notifier, NotifyEvent, Severity};
use tracing::warn;

use crate::services::{Alert, AlertSeverity, Incident, NotificationService};

fn severity(severity: AlertSeverity) -> Severity {
    match severity {
        AlertSeverity::Info => Severity::Info,
        AlertSeverity::Warning => Severity::Warning,
        AlertSeverity::Critical => Severity::Critical,
    }
}

pub struct ChannelNotifier {
    notifier: Notifier,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }

    /// Succeeds when at least one channel accepted the event.
    async fn deliver(&self, event: NotifyEvent) -> Result<()> {
        if !self.notifier.has_channels() {
            warn!(title = %event.title(), "No notification channels, dropping event");
            return Ok(());
        }

        let results = self.notifier.notify_and_wait(event).await;
        if results.iter().any(|(_, result)| result.is_ok()) {
            return Ok(());
        }

        let errors: Vec<String> = results
            .iter()
            .filter_map(|(channel, result)| result.as_ref().err().map(|e| format!("{channel}: {e}")))
            .collect();
        bail!("notification not delivered: {}", errors.join("; "))
    }
}

#[async_trait]
impl NotificationService for ChannelNotifier {
    async fn escalate_incident(&self, incident: &Incident) -> Result<()> {
        self.deliver(NotifyEvent::IncidentEscalated {
            incident_id: incident.id.clone(),
            target: incident.target.clone(),
            kind: incident.kind.clone(),
            summary: incident.summary.clone(),
            attempted_actions: incident.attempted_actions.clone(),
            error: incident.error.clone(),
            timestamp: incident.opened_at,
        })
        .await
    }

    async fn send_recovery_success(&self, incident: &Incident) -> Result<()> {
        self.deliver(NotifyEvent::RecoverySucceeded {
            incident_id: incident.id.clone(),
            target: incident.target.clone(),
            kind: incident.kind.clone(),
            summary: incident.summary.clone(),
            timestamp: incident.opened_at,
        })
        .await
    }

    async fn dispatch_alert(&self, alert: &Alert) -> Result<()> {
        self.deliver(NotifyEvent::RemediationAlert {
            target: alert.target.clone(),
            severity: severity(alert.severity),
            message: alert.message.clone(),
            channel: alert.channel.clone(),
            timestamp: chrono::Utc::now(),
        })
        .await
    }

    async fn announce_blocked(&self, namespace: &str, reasons: &[String]) -> Result<()> {
        self.deliver(NotifyEvent::DeploymentBlocked {
            namespace: namespace.to_string(),
            reasons: reasons.to_vec(),
            timestamp: chrono::Utc::now(),
        })
        .await
    }

    async fn announce_rollback(&self, deployment: &str, revision: i64) -> Result<()> {
        self.deliver(NotifyEvent::RollbackCompleted {
            deployment: deployment.to_string(),
            revision,
            timestamp: chrono::Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::{NotifyChannel, SlackChannel, WebhookChannel};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_escalation_reaches_pager() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/page"))
            .and(body_partial_json(serde_json::json!({
                "type": "incident_escalated",
                "target": "api",
                "attempted_actions": ["restart", "scale"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let pager: Arc<dyn NotifyChannel> =
            Arc::new(WebhookChannel::new(format!("{}/page", server.uri())));
        let notifier = ChannelNotifier::new(Notifier::with_channels(vec![pager]));
        let mut incident = Incident::new(
            "api",
            "high_error_rate",
            "Remediation failed",
            chrono::Utc::now(),
        );
        incident.attempted_actions = vec!["restart".to_string(), "scale".to_string()];
        notifier.escalate_incident(&incident).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_channels_failing_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let slack: Arc<dyn NotifyChannel> = Arc::new(SlackChannel::new(server.uri()));
        let notifier = ChannelNotifier::new(Notifier::with_channels(vec![slack]));
        let alert = Alert {
            target: "api".to_string(),
            severity: AlertSeverity::Critical,
            message: "paging".to_string(),
            channel: None,
        };
        let err = notifier.dispatch_alert(&alert).await.unwrap_err();
        assert!(err.to_string().contains("slack returned 500"));
    }

    #[tokio::test]
    async fn test_no_channels_is_not_an_error() {
        let notifier = ChannelNotifier::new(Notifier::disabled());
        notifier
            .announce_blocked("prod", &["backup-status".to_string()])
            .await
            .unwrap();
    }
}
