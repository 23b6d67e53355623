use serde::{Deserialize, Serialize};

/// Identifies a tradable instrument on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentRef {
    pub exchange: String,
    pub symbol: String,
}

impl InstrumentRef {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for InstrumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Exchange trading rules for an instrument, stored as JSON next to the instrument.
///
/// Every field is optional; a missing field imposes no constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradingRules {
    /// Decimal places allowed in the price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_precision: Option<u32>,
    /// Decimal places allowed in the quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_order_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_notional_value: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_parse_exchange_json() {
        let rules: TradingRules = serde_json::from_str(
            r#"{"min_order_size": 0.001, "price_precision": 2, "size_precision": 5, "min_notional_value": 10.0}"#,
        )
        .unwrap();
        assert_eq!(rules.price_precision, Some(2));
        assert_eq!(rules.size_precision, Some(5));
        assert_eq!(rules.min_order_size, Some(0.001));
        assert_eq!(rules.min_notional_value, Some(10.0));
    }

    #[test]
    fn test_rules_missing_fields_are_unconstrained() {
        let rules: TradingRules = serde_json::from_str("{}").unwrap();
        assert_eq!(rules, TradingRules::default());
    }

    #[test]
    fn test_instrument_ref_display() {
        assert_eq!(InstrumentRef::new("binance", "BTC/USDT").to_string(), "binance:BTC/USDT");
    }
}
