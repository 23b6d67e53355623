//! Database Models
//!
//! Row types for the ledger, journal, outbox and inbound tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::entities::instrument::{InstrumentRef, TradingRules};
use crate::domain::entities::notification::{OutboxStatus, Severity};
use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType};
use crate::domain::entities::position::Position;
use crate::domain::entities::transaction::TransactionType;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountRecord {
    pub id: i64,
    pub name: String,
    pub base_currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstrumentRecord {
    pub id: i64,
    pub exchange: String,
    pub symbol: String,
    /// JSON-encoded `TradingRules`
    pub trading_rules: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstrumentRecord {
    pub fn rules(&self) -> Result<TradingRules, serde_json::Error> {
        serde_json::from_str(&self.trading_rules)
    }

    pub fn instrument_ref(&self) -> InstrumentRef {
        InstrumentRef::new(&self.exchange, &self.symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub account_id: i64,
    pub instrument_id: i64,
    pub exchange: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub idempotency_key: String,
    pub side: String,
    pub order_type: String,
    pub status: String,
    pub price: f64,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Parsed status. The CHECK constraint keeps the column inside the known set.
    pub fn order_status(&self) -> OrderStatus {
        OrderStatus::parse(&self.status).unwrap_or(OrderStatus::Rejected)
    }

    pub fn order_side(&self) -> OrderSide {
        OrderSide::parse(&self.side).unwrap_or(OrderSide::Buy)
    }

    pub fn kind(&self) -> OrderType {
        OrderType::parse(&self.order_type).unwrap_or(OrderType::Market)
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: i64,
    pub order_id: i64,
    pub trade_id: Option<String>,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub account_id: i64,
    pub instrument_id: i64,
    pub quantity: f64,
    pub average_entry_price: f64,
    pub initial_stop: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn to_position(&self) -> Position {
        Position {
            quantity: self.quantity,
            average_entry_price: self.average_entry_price,
            initial_stop: self.initial_stop,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransactionRecord {
    pub id: i64,
    pub account_id: i64,
    pub transaction_type: String,
    pub amount: f64,
    pub related_order_id: Option<i64>,
    pub instrument_id: Option<i64>,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub reverses_id: Option<i64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn kind(&self) -> Option<TransactionType> {
        TransactionType::parse(&self.transaction_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationTargetRecord {
    pub channel: String,
    pub target: String,
    pub enabled: bool,
    pub min_severity: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub channel: String,
    pub target: String,
    pub severity: String,
    pub severity_rank: i64,
    pub title: String,
    pub body: String,
    pub dedupe_key: Option<String>,
    pub status: String,
    pub fail_count: i64,
    pub last_error: Option<String>,
    pub send_after: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn outbox_status(&self) -> Option<OutboxStatus> {
        OutboxStatus::parse(&self.status)
    }

    pub fn severity_level(&self) -> Option<Severity> {
        Severity::parse(&self.severity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InboundDedupeRecord {
    pub idempotency_key: String,
    pub source: String,
    pub payload_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub seen_count: i64,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InboundAlertRecord {
    pub id: i64,
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub dedupe_key: Option<String>,
    pub payload: String,
    pub payload_hash: String,
    pub parsed: bool,
    pub error: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// The single versioned configuration row consulted before admitting new orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SystemConfig {
    pub version: i64,
    pub trading_enabled: bool,
    /// Maximum tolerated net loss since UTC midnight; `<= 0` disables the check.
    pub daily_loss_limit: f64,
    /// Maximum tolerated net loss since Monday 00:00 UTC; `<= 0` disables the check.
    pub weekly_loss_limit: f64,
    pub updated_at: DateTime<Utc>,
}
