use crate::application::services::notify_worker::OutboxConfig;
use crate::domain::entities::notification::AlertRoute;
use crate::domain::services::alert_adapter::AdapterSettings;
use crate::persistence::DatabaseConfig;
use zeroize::Zeroizing;

/// Webhook server settings
#[derive(Clone)]
pub struct WebhookConfig {
    pub bind_addr: String,
    /// Shared secret expected in `X-Auth-Token`; `None` disables the check
    pub secret_token: Option<Zeroizing<String>>,
    /// Account that orders created from alerts belong to
    pub account_id: Option<i64>,
    pub default_exchange: String,
    pub rate_limit_per_minute: u32,
    /// Stop distance in percent of the alert price (3.0 = 3%)
    pub stop_loss_pct: f64,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("bind_addr", &self.bind_addr)
            .field("secret_token", &self.secret_token.as_ref().map(|_| "<REDACTED>"))
            .field("account_id", &self.account_id)
            .field("default_exchange", &self.default_exchange)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("stop_loss_pct", &self.stop_loss_pct)
            .finish()
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        let adapter = AdapterSettings::default();
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            secret_token: None,
            account_id: None,
            default_exchange: adapter.default_exchange,
            rate_limit_per_minute: 120,
            stop_loss_pct: adapter.stop_loss_pct,
        }
    }
}

impl WebhookConfig {
    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            default_exchange: self.default_exchange.clone(),
            stop_loss_pct: self.stop_loss_pct,
        }
    }
}

/// Complete process configuration
#[derive(Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub outbox: OutboxConfig,
    pub webhook: WebhookConfig,
    /// Destination of operational alerts raised by the ledger
    pub alert_route: AlertRoute,
    pub telegram_bot_token: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("database", &self.database)
            .field("outbox", &self.outbox)
            .field("webhook", &self.webhook)
            .field("alert_route", &self.alert_route)
            .field("telegram_bot_token", &self.telegram_bot_token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            outbox: OutboxConfig::default(),
            webhook: WebhookConfig::default(),
            alert_route: AlertRoute::new("telegram", ""),
            telegram_bot_token: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppConfig {
        let mut config = AppConfig {
            database: DatabaseConfig::from_env(),
            outbox: OutboxConfig::from_env(),
            ..AppConfig::default()
        };
        config.apply(|name| std::env::var(name).ok());
        config
    }

    /// Override webhook, alert route and transport settings from `lookup`.
    /// Invalid values are logged and leave the default in place.
    pub fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("WEBHOOK_BIND_ADDR") {
            match addr.trim().parse::<std::net::SocketAddr>() {
                Ok(_) => self.webhook.bind_addr = addr.trim().to_string(),
                Err(e) => {
                    tracing::warn!(
                        "Invalid WEBHOOK_BIND_ADDR '{}': {}, using default: {}",
                        addr,
                        e,
                        self.webhook.bind_addr
                    );
                }
            }
        }

        self.webhook.secret_token = secret(lookup("WEBHOOK_SECRET_TOKEN"));

        if let Some(id) = lookup("WEBHOOK_ACCOUNT_ID") {
            match id.trim().parse::<i64>() {
                Ok(value) if value > 0 => self.webhook.account_id = Some(value),
                Ok(value) => {
                    tracing::warn!("Invalid WEBHOOK_ACCOUNT_ID value: {} (must be positive)", value);
                }
                Err(e) => {
                    tracing::warn!("Failed to parse WEBHOOK_ACCOUNT_ID '{}': {}", id, e);
                }
            }
        }

        if let Some(exchange) = lookup("WEBHOOK_DEFAULT_EXCHANGE") {
            if !exchange.trim().is_empty() {
                self.webhook.default_exchange = exchange.trim().to_lowercase();
            }
        }

        if let Some(limit) = lookup("WEBHOOK_RATE_LIMIT_PER_MINUTE") {
            match limit.trim().parse::<u32>() {
                Ok(value) if value > 0 => self.webhook.rate_limit_per_minute = value,
                Ok(value) => {
                    tracing::warn!(
                        "Invalid WEBHOOK_RATE_LIMIT_PER_MINUTE value: {} (must be positive), using default: {}",
                        value,
                        self.webhook.rate_limit_per_minute
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse WEBHOOK_RATE_LIMIT_PER_MINUTE '{}': {}, using default: {}",
                        limit,
                        e,
                        self.webhook.rate_limit_per_minute
                    );
                }
            }
        }

        if let Some(pct) = lookup("STOP_LOSS_PCT") {
            match pct.trim().parse::<f64>() {
                Ok(value) if value > 0.0 && value < 100.0 => self.webhook.stop_loss_pct = value,
                Ok(value) => {
                    tracing::warn!(
                        "Invalid STOP_LOSS_PCT value: {} (must be between 0 and 100), using default: {}",
                        value,
                        self.webhook.stop_loss_pct
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse STOP_LOSS_PCT '{}': {}, using default: {}",
                        pct,
                        e,
                        self.webhook.stop_loss_pct
                    );
                }
            }
        }

        if let Some(channel) = lookup("ALERT_CHANNEL") {
            if !channel.trim().is_empty() {
                self.alert_route.channel = channel.trim().to_string();
            }
        }
        if let Some(target) = lookup("ALERT_TARGET") {
            self.alert_route.target = target.trim().to_string();
        }

        self.telegram_bot_token = secret(lookup("TELEGRAM_BOT_TOKEN"));
    }
}

fn secret(value: Option<String>) -> Option<Zeroizing<String>> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(Zeroizing::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn apply_vars(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = AppConfig::default();
        config.apply(|name| vars.get(name).cloned());
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.webhook.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.webhook.default_exchange, "binance");
        assert_eq!(config.webhook.stop_loss_pct, 3.0);
        assert!(config.webhook.secret_token.is_none());
        assert_eq!(config.outbox.max_fail_count, 5);
        assert_eq!(config.alert_route.channel, "telegram");
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = apply_vars(&[
            ("WEBHOOK_BIND_ADDR", "127.0.0.1:9000"),
            ("WEBHOOK_SECRET_TOKEN", "tok"),
            ("WEBHOOK_ACCOUNT_ID", "7"),
            ("WEBHOOK_DEFAULT_EXCHANGE", "Coinbase"),
            ("WEBHOOK_RATE_LIMIT_PER_MINUTE", "30"),
            ("STOP_LOSS_PCT", "2.5"),
            ("ALERT_CHANNEL", "telegram"),
            ("ALERT_TARGET", "-100123"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
        ]);
        assert_eq!(config.webhook.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.webhook.secret_token.as_ref().map(|t| t.as_str()), Some("tok"));
        assert_eq!(config.webhook.account_id, Some(7));
        assert_eq!(config.webhook.default_exchange, "coinbase");
        assert_eq!(config.webhook.rate_limit_per_minute, 30);
        assert_eq!(config.webhook.adapter_settings().stop_loss_pct, 2.5);
        assert_eq!(config.alert_route, AlertRoute::new("telegram", "-100123"));
        assert!(config.telegram_bot_token.is_some());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = apply_vars(&[
            ("WEBHOOK_BIND_ADDR", "not an address"),
            ("WEBHOOK_ACCOUNT_ID", "-3"),
            ("WEBHOOK_RATE_LIMIT_PER_MINUTE", "0"),
            ("STOP_LOSS_PCT", "abc"),
            ("WEBHOOK_SECRET_TOKEN", "  "),
        ]);
        assert_eq!(config.webhook.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.webhook.account_id, None);
        assert_eq!(config.webhook.rate_limit_per_minute, 120);
        assert_eq!(config.webhook.stop_loss_pct, 3.0);
        assert!(config.webhook.secret_token.is_none());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = apply_vars(&[
            ("WEBHOOK_SECRET_TOKEN", "hunter2"),
            ("TELEGRAM_BOT_TOKEN", "123:bottoken"),
        ]);
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("bottoken"));
    }
}
