//! # Telegram notification transport
//!
//! Delivers outbox entries through the Telegram Bot API `sendMessage` method.
//! The outbox target is the chat id.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use zeroize::Zeroizing;

use crate::domain::errors::DeliveryError;
use crate::domain::repositories::notification_transport::{DeliveryResult, NotificationTransport};

/// Telegram Bot API base URL
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Channel name outbox entries use to reach this transport
pub const TELEGRAM_CHANNEL: &str = "telegram";

/// Longest response body kept in a rejection error
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

pub struct TelegramTransport {
    client: Client,
    bot_token: Zeroizing<String>,
    api_base: String,
}

impl std::fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("api_base", &self.api_base)
            .field("bot_token", &"<REDACTED>")
            .finish()
    }
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> Result<Self, String> {
        Self::new_with_base(bot_token, TELEGRAM_API_BASE)
    }

    /// Create a transport that talks to `api_base` instead of the public Bot API.
    pub fn new_with_base(bot_token: &str, api_base: &str) -> Result<Self, String> {
        if bot_token.trim().is_empty() {
            return Err("Telegram bot token is empty".to_string());
        }

        let client = Client::builder()
            .user_agent("tradevault/0.1.0")
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            bot_token: Zeroizing::new(bot_token.trim().to_string()),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn format_text(title: &str, body: &str) -> String {
        if body.is_empty() {
            title.to_string()
        } else {
            format!("{}\n\n{}", title, body)
        }
    }
}

#[async_trait]
impl NotificationTransport for TelegramTransport {
    fn channel(&self) -> &str {
        TELEGRAM_CHANNEL
    }

    async fn send(&self, target: &str, title: &str, body: &str) -> DeliveryResult {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token.as_str());
        let request = SendMessageRequest {
            chat_id: target,
            text: Self::format_text(title, body),
            disable_web_page_preview: true,
        };

        // reqwest errors carry the URL, which contains the token
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            text.truncate(MAX_ERROR_BODY);
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!("Telegram message delivered to chat {}", target);
        Ok(())
    }
}
