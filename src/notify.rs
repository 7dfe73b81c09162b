//! The one-shot alert channel used for the final notification.

use crate::{NotifyError, TelegramConfig};
use serde::Serialize;
use std::{future::Future, time::Duration};
use tracing::instrument;

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Delivers a text message somewhere a human will see it.
pub trait Notifier: Send + Sync + 'static {
    /// Send `message`. Failures are reported, never retried.
    fn send(&self, message: &str) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Notifier used when no transport is configured. Every send reports
/// [`NotifyError::NotConfigured`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    async fn send(&self, _message: &str) -> Result<(), NotifyError> {
        Err(NotifyError::NotConfigured)
    }
}

/// Sends messages through the Telegram bot API.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    config: TelegramConfig,
    api_base: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    /// Create a notifier for the configured bot and chat.
    pub fn new(config: TelegramConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(6))
            .build()?;
        Ok(Self {
            client,
            config,
            api_base: TELEGRAM_API.to_owned(),
        })
    }

    /// Point the notifier at a different API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

impl Notifier for TelegramNotifier {
    #[instrument(skip_all, fields(chat_id = %self.config.chat_id, len = message.len()), name = "Telegram send")]
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.endpoint())
            .json(&SendMessage {
                chat_id: &self.config.chat_id,
                text: message,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// The notifier selected by configuration: Telegram when credentials are
/// set, otherwise disabled.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    /// Telegram bot.
    Telegram(TelegramNotifier),
    /// No transport.
    Disabled(DisabledNotifier),
}

impl ConfiguredNotifier {
    /// Pick a notifier for `config`.
    pub fn from_config(config: Option<&TelegramConfig>) -> Result<Self, NotifyError> {
        Ok(match config {
            Some(config) => Self::Telegram(TelegramNotifier::new(config.clone())?),
            None => Self::Disabled(DisabledNotifier),
        })
    }
}

impl Notifier for ConfiguredNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        match self {
            Self::Telegram(n) => n.send(message).await,
            Self::Disabled(n) => n.send(message).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_reports_not_configured() {
        let err = DisabledNotifier.send("hello").await.unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }

    #[tokio::test]
    async fn unconfigured_notifier_is_disabled() {
        let notifier = ConfiguredNotifier::from_config(None).unwrap();
        assert!(matches!(notifier, ConfiguredNotifier::Disabled(_)));
        assert!(matches!(
            notifier.send("x").await,
            Err(NotifyError::NotConfigured)
        ));
    }

    #[test]
    fn telegram_endpoint_includes_token() {
        let notifier = TelegramNotifier::new(TelegramConfig {
            bot_token: "123:abc".into(),
            chat_id: "42".into(),
        })
        .unwrap()
        .with_api_base("http://localhost:9999/");
        assert_eq!(
            notifier.endpoint(),
            "http://localhost:9999/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn message_body_shape() {
        let body = serde_json::to_value(SendMessage {
            chat_id: "42",
            text: "GPU hot",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"chat_id": "42", "text": "GPU hot"}));
    }
}
