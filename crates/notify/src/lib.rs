//! Notification channels for deployment safety and remediation events.
//!
//! # Usage
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent};
//!
//! # async fn example() {
//! // Create notifier from environment variables
//! let notifier = Notifier::from_env();
//!
//! // Send a notification and collect per-channel results
//! let results = notifier
//!     .notify_and_wait(NotifyEvent::DeploymentBlocked {
//!         namespace: "prod".to_string(),
//!         reasons: vec!["backup-status".to_string()],
//!         timestamp: chrono::Utc::now(),
//!     })
//!     .await;
//! # }
//! ```
//!
//! # Configuration
//!
//! - `SLACK_WEBHOOK_URL`: Slack webhook URL (enables the `slack` channel)
//! - `PAGER_WEBHOOK_URL`: JSON webhook URL (enables the `pager` channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Central notification dispatcher.
///
/// Events go to every enabled channel, unless the event names a preferred
/// channel that is configured, in which case only that one receives it.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let candidates: Vec<Arc<dyn NotifyChannel>> = vec![
            Arc::new(SlackChannel::from_env()),
            Arc::new(WebhookChannel::from_env()),
        ];
        Self::with_channels(candidates.into_iter().filter(|c| c.enabled()).collect())
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            info!(
                channel_count = channels.len(),
                "Notification system initialized"
            );
        }

        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a disabled notifier (for testing or when notifications are off).
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    fn recipients(&self, event: &NotifyEvent) -> Vec<Arc<dyn NotifyChannel>> {
        if self.disabled {
            return vec![];
        }

        let enabled = self.channels.iter().filter(|c| c.enabled());
        let preferred: Vec<_> = event
            .preferred_channel()
            .map(|name| enabled.clone().filter(|c| c.name() == name).cloned().collect())
            .unwrap_or_default();

        if preferred.is_empty() {
            enabled.cloned().collect()
        } else {
            preferred
        }
    }

    /// Send a notification to all recipients (fire-and-forget).
    ///
    /// Spawns one task per channel and returns immediately. Errors are logged.
    pub fn notify(&self, event: NotifyEvent) {
        let recipients = self.recipients(&event);
        if recipients.is_empty() {
            debug!("No recipients, skipping event");
            return;
        }

        let event = Arc::new(event);
        for channel in recipients {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = channel.send(&event).await {
                    error!(channel = channel.name(), error = %e, "Failed to send notification");
                }
            });
        }
    }

    /// Send a notification and wait for every recipient.
    ///
    /// Returns one result per channel that was tried.
    pub async fn notify_and_wait(
        &self,
        event: NotifyEvent,
    ) -> Vec<(String, Result<(), ChannelError>)> {
        let mut results = vec![];
        for channel in self.recipients(&event) {
            let result = channel.send(&event).await;
            if let Err(e) = &result {
                error!(channel = channel.name(), error = %e, "Failed to send notification");
            }
            results.push((channel.name().to_string(), result));
        }
        results
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        name: &'static str,
        sent: AtomicUsize,
    }

    impl CountingChannel {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                sent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for CountingChannel {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _event: &NotifyEvent) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn alert(channel: Option<&str>) -> NotifyEvent {
        NotifyEvent::RemediationAlert {
            target: "api".to_string(),
            severity: Severity::Warning,
            message: "Automated remediation in progress for api".to_string(),
            channel: channel.map(str::to_string),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(!notifier.has_channels());
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn test_event_titles_and_severity() {
        let event = NotifyEvent::DeploymentBlocked {
            namespace: "prod".to_string(),
            reasons: vec!["cluster-health".to_string()],
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.title(), "Deployment Blocked: prod");
        assert_eq!(event.severity(), Severity::Warning);
        assert_eq!(alert(None).title(), "Remediation Alert: api");
    }

    #[tokio::test]
    async fn test_preferred_channel_routing() {
        let slack = CountingChannel::new("slack");
        let pager = CountingChannel::new("pager");
        let notifier = Notifier::with_channels(vec![
            slack.clone() as Arc<dyn NotifyChannel>,
            pager.clone() as Arc<dyn NotifyChannel>,
        ]);

        let results = notifier.notify_and_wait(alert(Some("pager"))).await;
        assert_eq!(results.len(), 1);
        assert_eq!(pager.sent.load(Ordering::SeqCst), 1);
        assert_eq!(slack.sent.load(Ordering::SeqCst), 0);

        // Unknown preference falls back to every channel.
        let results = notifier.notify_and_wait(alert(Some("sms"))).await;
        assert_eq!(results.len(), 2);
        assert_eq!(slack.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_notifier_sends_nothing() {
        let notifier = Notifier::disabled();
        assert!(notifier.notify_and_wait(alert(None)).await.is_empty());
    }
}
