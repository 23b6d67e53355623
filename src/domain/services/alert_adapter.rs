//! Turns a validated TradingView alert into an internal trading decision.

use tracing::info;

use crate::domain::entities::alert::{Decision, TradingViewAlert};
use crate::domain::entities::order::{OrderSide, OrderType};
use crate::domain::errors::IntakeError;

/// Reward multiple applied to the stop distance when deriving a take-profit level.
pub const TAKE_PROFIT_RATIO: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub default_exchange: String,
    pub stop_loss_pct: f64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            default_exchange: "binance".to_string(),
            stop_loss_pct: 3.0,
        }
    }
}

/// Parse a raw alert body.
pub fn parse_alert(raw: &str) -> Result<TradingViewAlert, IntakeError> {
    let alert: TradingViewAlert = serde_json::from_str(raw)
        .map_err(|e| IntakeError::InvalidPayload(format!("malformed alert: {}", e)))?;

    if alert.symbol.trim().is_empty() {
        return Err(IntakeError::InvalidPayload("symbol is empty".to_string()));
    }
    if alert.idempotency_key.trim().is_empty() {
        return Err(IntakeError::InvalidPayload(
            "idempotency_key is empty".to_string(),
        ));
    }
    if !alert.price.is_finite() || alert.price <= 0.0 {
        return Err(IntakeError::InvalidPayload(format!(
            "price must be positive, got {}",
            alert.price
        )));
    }
    if !alert.qty.is_finite() || alert.qty <= 0.0 {
        return Err(IntakeError::InvalidPayload(format!(
            "qty must be positive, got {}",
            alert.qty
        )));
    }

    Ok(alert)
}

/// Derive the order decision: percentage stop below (buy) or above (sell) the alert
/// price, take-profit at 1.5x the stop distance on the other side.
pub fn adapt_alert(
    alert: &TradingViewAlert,
    settings: &AdapterSettings,
) -> Result<Decision, IntakeError> {
    let side = OrderSide::parse(&alert.side)
        .ok_or_else(|| IntakeError::InvalidPayload(format!("unknown side '{}'", alert.side)))?;

    let order_type = match alert.order_type.as_deref() {
        None => OrderType::Market,
        Some(value) => OrderType::parse(value).ok_or_else(|| {
            IntakeError::InvalidPayload(format!("unknown order_type '{}'", value))
        })?,
    };

    let offset = settings.stop_loss_pct / 100.0;
    let (stop_loss, take_profit) = match side {
        OrderSide::Buy => {
            let stop = alert.price * (1.0 - offset);
            (stop, alert.price + (alert.price - stop) * TAKE_PROFIT_RATIO)
        }
        OrderSide::Sell => {
            let stop = alert.price * (1.0 + offset);
            (stop, alert.price - (stop - alert.price) * TAKE_PROFIT_RATIO)
        }
    };

    let exchange = alert
        .exchange
        .clone()
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| settings.default_exchange.clone());

    info!(
        "Adapting alert {} for {}:{} ({})",
        alert.idempotency_key,
        exchange,
        alert.symbol,
        alert.strategy.as_deref().unwrap_or("unnamed strategy")
    );

    Ok(Decision {
        exchange,
        symbol: alert.symbol.clone(),
        side,
        order_type,
        price: alert.price,
        quantity: alert.qty,
        stop_loss: Some(stop_loss),
        take_profit: Some(take_profit),
        idempotency_key: alert.idempotency_key.clone(),
        strategy: alert.strategy.clone(),
    })
}
