use serde::{Deserialize, Serialize};

use super::order::{OrderSide, OrderType};

/// Signal payload posted by a TradingView alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingViewAlert {
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub idempotency_key: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
}

/// An internal trading decision, ready for the order ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub idempotency_key: String,
    pub strategy: Option<String>,
}
