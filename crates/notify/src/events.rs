//! Notification event types for deployment safety and remediation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Hex color used for Slack attachments.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",
            Self::Warning => "#f39c12",
            Self::Critical => "#e74c3c",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// Critical safeguards failed and a deployment was refused
    DeploymentBlocked {
        namespace: String,
        reasons: Vec<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A `notify` remediation action paged someone
    RemediationAlert {
        target: String,
        severity: Severity,
        message: String,
        /// Preferred channel; all channels when absent
        #[serde(default)]
        channel: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Automated remediation gave up and handed the incident to humans
    IncidentEscalated {
        incident_id: String,
        target: String,
        kind: String,
        summary: String,
        #[serde(default)]
        attempted_actions: Vec<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A deployment was rolled back and the restored revision verified
    RollbackCompleted {
        deployment: String,
        revision: i64,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A remediated incident was verified as recovered
    RecoverySucceeded {
        incident_id: String,
        target: String,
        kind: String,
        summary: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::DeploymentBlocked { namespace, .. } => {
                format!("Deployment Blocked: {namespace}")
            }
            Self::RemediationAlert { target, .. } => format!("Remediation Alert: {target}"),
            Self::IncidentEscalated { target, kind, .. } => {
                format!("Incident Escalated: {kind} on {target}")
            }
            Self::RollbackCompleted {
                deployment,
                revision,
                ..
            } => format!("Rolled Back: {deployment} to revision {revision}"),
            Self::RecoverySucceeded { target, kind, .. } => {
                format!("Recovered: {kind} on {target}")
            }
        }
    }

    /// Get the severity for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::DeploymentBlocked { .. } => Severity::Warning,
            Self::RemediationAlert { severity, .. } => *severity,
            Self::IncidentEscalated { .. } => Severity::Critical,
            Self::RollbackCompleted { .. } | Self::RecoverySucceeded { .. } => Severity::Info,
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DeploymentBlocked { timestamp, .. }
            | Self::RemediationAlert { timestamp, .. }
            | Self::IncidentEscalated { timestamp, .. }
            | Self::RollbackCompleted { timestamp, .. }
            | Self::RecoverySucceeded { timestamp, .. } => *timestamp,
        }
    }

    /// Channel the event asked for, if any.
    #[must_use]
    pub fn preferred_channel(&self) -> Option<&str> {
        match self {
            Self::RemediationAlert { channel, .. } => channel.as_deref(),
            _ => None,
        }
    }
}
