//! Notification sinks

use async_trait::async_trait;
use serde::Serialize;
use shared::{process_info, NotificationEvent, ProcessId, UserId};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::traits::NotificationSink;

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, user_id: &UserId, event: &NotificationEvent) -> OrchestratorResult<()> {
        process_info!(ProcessId::current(), "🔔 [{}] {}", user_id, event.headline());
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    user_id: &'a UserId,
    headline: String,
    event: &'a NotificationEvent,
}

/// Posts notifications as JSON to a webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, user_id: &UserId, event: &NotificationEvent) -> OrchestratorResult<()> {
        let payload = WebhookPayload {
            user_id,
            headline: event.headline(),
            event,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::Notification { message: e.to_string() })?;

        if !response.status().is_success() {
            return Err(OrchestratorError::Notification {
                message: format!("webhook answered {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Sink chosen at startup
pub enum ConfiguredNotifier {
    Log(LogNotifier),
    Webhook(WebhookNotifier),
}

impl ConfiguredNotifier {
    /// Webhook when a URL is given, log otherwise
    pub fn from_url(url: Option<String>) -> Self {
        match url {
            Some(url) => ConfiguredNotifier::Webhook(WebhookNotifier::new(url)),
            None => ConfiguredNotifier::Log(LogNotifier),
        }
    }
}

#[async_trait]
impl NotificationSink for ConfiguredNotifier {
    async fn notify(&self, user_id: &UserId, event: &NotificationEvent) -> OrchestratorResult<()> {
        match self {
            ConfiguredNotifier::Log(sink) => sink.notify(user_id, event).await,
            ConfiguredNotifier::Webhook(sink) => sink.notify(user_id, event).await,
        }
    }
}
