//! Generic JSON webhook channel, used for paging integrations.
//!
//! The event is posted as-is, tagged with its `type`.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the paging webhook URL.
const ENV_PAGER_WEBHOOK_URL: &str = "PAGER_WEBHOOK_URL";

/// Posts events as JSON to a webhook.
pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            url: std::env::var(ENV_PAGER_WEBHOOK_URL).ok(),
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            url: Some(url),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "pager"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_PAGER_WEBHOOK_URL.to_string()))?;

        debug!(channel = "pager", title = %event.title(), "Sending notification");
        let response = self.client.post(url).json(event).send().await?;

        if response.status().is_success() {
            return Ok(());
        }

        let err = ChannelError::from_response("pager", response).await;
        warn!(channel = "pager", error = %err, "Webhook request failed");
        Err(err)
    }
}
