//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL).ok();

        if webhook_url.is_none() {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn format_payload(event: &NotifyEvent) -> SlackPayload {
        let fields = Self::format_fields(event)
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        SlackPayload {
            attachments: vec![SlackAttachment {
                fallback: event.title(),
                color: event.severity().color().to_string(),
                author_name: Some("deploy-guard".to_string()),
                title: event.title(),
                text: Self::format_description(event),
                fields,
                footer: Some(format!(
                    "{} | {}",
                    event.severity().as_str(),
                    event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
                )),
                ts: Some(event.timestamp().timestamp()),
            }],
        }
    }

    fn format_description(event: &NotifyEvent) -> String {
        match event {
            NotifyEvent::DeploymentBlocked { reasons, .. } => {
                let list = reasons
                    .iter()
                    .map(|r| format!("• `{r}`"))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("Critical safeguards failed:\n{list}")
            }

            NotifyEvent::RemediationAlert { message, .. } => message.clone(),

            NotifyEvent::IncidentEscalated {
                summary,
                attempted_actions,
                error,
                ..
            } => {
                let mut text = summary.clone();
                if !attempted_actions.is_empty() {
                    text.push_str(&format!("\n*Attempted:* {}", attempted_actions.join(", ")));
                }
                if let Some(error) = error {
                    text.push_str(&format!("\n*Error:* {error}"));
                }
                text
            }

            NotifyEvent::RollbackCompleted {
                deployment,
                revision,
                ..
            } => format!("`{deployment}` is serving revision {revision} and passed verification"),

            NotifyEvent::RecoverySucceeded { summary, .. } => format!("✅ {summary}"),
        }
    }

    fn format_fields(event: &NotifyEvent) -> Vec<(String, String)> {
        match event {
            NotifyEvent::DeploymentBlocked {
                namespace, reasons, ..
            } => vec![
                ("Namespace".to_string(), namespace.clone()),
                ("Failed checks".to_string(), reasons.len().to_string()),
            ],

            NotifyEvent::RemediationAlert {
                target, severity, ..
            } => vec![
                ("Target".to_string(), target.clone()),
                ("Severity".to_string(), severity.as_str().to_string()),
            ],

            NotifyEvent::RollbackCompleted {
                deployment,
                revision,
                ..
            } => vec![
                ("Deployment".to_string(), deployment.clone()),
                ("Revision".to_string(), revision.to_string()),
            ],

            NotifyEvent::IncidentEscalated {
                incident_id,
                target,
                kind,
                ..
            }
            | NotifyEvent::RecoverySucceeded {
                incident_id,
                target,
                kind,
                ..
            } => vec![
                ("Incident".to_string(), incident_id.clone()),
                ("Target".to_string(), target.clone()),
                ("Type".to_string(), kind.clone()),
            ],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()))?;

        debug!(channel = "slack", title = %event.title(), "Sending notification");

        let response = self
            .client
            .post(webhook_url)
            .json(&Self::format_payload(event))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let err = ChannelError::from_response("slack", response).await;
        warn!(channel = "slack", error = %err, "Slack webhook request failed");
        Err(err)
    }
}

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}
