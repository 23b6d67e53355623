use serde::{Deserialize, Serialize};

use super::instrument::InstrumentRef;

/// Relative tolerance used when comparing cumulative fill quantity against the
/// requested quantity.
pub const FILL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(OrderSide::Buy),
            "sell" | "short" => Some(OrderSide::Sell),
            _ => None,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "market" => Some(OrderType::Market),
            "limit" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

/// Order lifecycle status.
///
/// NEW and PARTIALLY_FILLED are *active*: they are the only statuses covered by the
/// duplicate-prevention indexes. Every other status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether `transition(order, self -> target)` is legal.
    ///
    /// Fill-driven statuses (PARTIALLY_FILLED, FILLED) are only reached through
    /// `record_fill`; manual transitions target CANCELED, REJECTED or EXPIRED.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        if !self.is_active() {
            return false;
        }
        match target {
            OrderStatus::New => false,
            OrderStatus::PartiallyFilled
            | OrderStatus::Filled
            | OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Expired => true,
        }
    }

    /// Targets accepted by the manual `transition` operation.
    pub fn is_manual_target(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Status an active order takes after its cumulative fill reaches `filled`.
    pub fn after_fill(requested: f64, filled: f64) -> OrderStatus {
        if filled + requested * FILL_EPSILON >= requested {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed order, as produced by a decision producer.
#[derive(Debug, Clone)]
pub struct SubmitOrder {
    pub account_id: i64,
    pub instrument: InstrumentRef,
    pub idempotency_key: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price, or the reference price of a market order.
    pub price: f64,
    pub quantity: f64,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

/// Result of `submit`: `created == false` means an active order with the same
/// idempotency key already existed and its identity is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitOutcome {
    pub order_id: i64,
    pub client_order_id: String,
    pub created: bool,
}

/// A fill reported by the exchange connector.
#[derive(Debug, Clone)]
pub struct FillReport {
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    /// Exchange trade id; when present, a redelivered fill is recognised and ignored.
    pub trade_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Recorded {
        execution_id: i64,
        status: OrderStatus,
        filled_quantity: f64,
        realized_pnl: f64,
    },
    Duplicate {
        execution_id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_statuses() {
        assert!(OrderStatus::New.is_active());
        assert!(OrderStatus::PartiallyFilled.is_active());
        for status in [
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
    }

    #[test]
    fn test_terminal_statuses_accept_no_transition() {
        let all = [
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ];
        for from in [
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_active_transitions() {
        assert!(OrderStatus::New.can_transition_to(OrderStatus::Canceled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Expired));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::PartiallyFilled));
        assert!(!OrderStatus::New.can_transition_to(OrderStatus::New));
    }

    #[test]
    fn test_manual_targets() {
        assert!(OrderStatus::Canceled.is_manual_target());
        assert!(OrderStatus::Rejected.is_manual_target());
        assert!(OrderStatus::Expired.is_manual_target());
        assert!(!OrderStatus::Filled.is_manual_target());
        assert!(!OrderStatus::New.is_manual_target());
    }

    #[test]
    fn test_status_after_fill() {
        assert_eq!(OrderStatus::after_fill(1.0, 0.4), OrderStatus::PartiallyFilled);
        assert_eq!(OrderStatus::after_fill(1.0, 1.0), OrderStatus::Filled);
        // 0.1 + 0.2 != 0.3 in binary floating point
        assert_eq!(OrderStatus::after_fill(0.3, 0.1 + 0.2), OrderStatus::Filled);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            OrderStatus::New,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("CANCELLED"), None);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!(OrderSide::parse("BUY"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse("sell"), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("hold"), None);
        assert_eq!(OrderSide::Sell.sign(), -1.0);
        assert_eq!(OrderSide::Buy.to_string(), "BUY");
    }
}
