//! Operator notification channel
//!
//! Payment confirmations and failed enforcements are pushed as plain text to a
//! Telegram chat. Delivery is fire-and-forget: [`dispatch`] spawns the send and
//! only logs failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Classify, ErrorKind};

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifications disabled")]
    Disabled,

    #[error("bot token not configured")]
    MissingToken,

    #[error("telegram API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Classify for NotifyError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Disabled | Self::MissingToken => ErrorKind::Validation,
            Self::Api(_) | Self::Http(_) => ErrorKind::Connectivity,
        }
    }
}

/// Something that can deliver a text message to operators
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotifyError>;
}

/// Send without waiting; failures are logged and dropped
pub fn dispatch(notifier: Arc<dyn Notifier>, message: String) {
    tokio::spawn(async move {
        if let Err(e) = notifier.send(&message).await {
            warn!(error = %e, "notification not delivered");
        }
    });
}

/// Telegram settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    /// Chat receiving operator messages
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".into()
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: default_api_base(),
        }
    }
}

/// Telegram Bot API notifier
pub struct TelegramNotifier {
    settings: TelegramSettings,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(settings: TelegramSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { settings, client }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        if !self.settings.enabled {
            return Err(NotifyError::Disabled);
        }
        if self.settings.bot_token.is_empty() {
            return Err(NotifyError::MissingToken);
        }

        let url = format!(
            "{}/bot{}/sendMessage",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.bot_token
        );
        debug!(chat_id = %self.settings.chat_id, "sending telegram message");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.settings.chat_id,
                "text": message,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: TelegramResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Api(format!("{}: {}", status, e)))?;

        if !status.is_success() || !body.ok {
            return Err(NotifyError::Api(
                body.description.unwrap_or_else(|| status.to_string()),
            ));
        }
        Ok(())
    }
}

/// Notifier that discards everything
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _message: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_telegram_refuses() {
        let notifier = TelegramNotifier::new(TelegramSettings {
            enabled: false,
            bot_token: "123:abc".into(),
            chat_id: "42".into(),
            api_base: default_api_base(),
        });
        assert!(matches!(notifier.send("hi").await, Err(NotifyError::Disabled)));
    }

    #[tokio::test]
    async fn test_missing_token() {
        let notifier = TelegramNotifier::new(TelegramSettings {
            enabled: true,
            ..Default::default()
        });
        let err = notifier.send("hi").await.unwrap_err();
        assert!(matches!(err, NotifyError::MissingToken));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
