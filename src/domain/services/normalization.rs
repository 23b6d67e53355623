//! Normalization Gate
//!
//! Rewrites a proposed price and quantity to the instrument's precision and checks
//! the result against its minimum size and minimum notional. The ledger runs the gate
//! before opening the write transaction, so a rejected order leaves no row behind and
//! the same idempotency key can be retried with corrected values.

use crate::domain::entities::instrument::TradingRules;
use crate::domain::errors::LedgerError;

/// A price/quantity pair after normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalized {
    pub price: f64,
    pub quantity: f64,
}

impl Normalized {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Pluggable per-instrument normalization rule.
pub trait NormalizationPolicy: Send + Sync {
    fn normalize(
        &self,
        rules: &TradingRules,
        price: f64,
        quantity: f64,
    ) -> Result<Normalized, LedgerError>;
}

/// Rounds to the configured decimal precision, then enforces the minimums.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecisionPolicy;

impl NormalizationPolicy for PrecisionPolicy {
    fn normalize(
        &self,
        rules: &TradingRules,
        price: f64,
        quantity: f64,
    ) -> Result<Normalized, LedgerError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(LedgerError::InvalidOrder(format!(
                "price must be a positive number, got {}",
                price
            )));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(LedgerError::InvalidOrder(format!(
                "quantity must be a positive number, got {}",
                quantity
            )));
        }

        let normalized = Normalized {
            price: round_to(price, rules.price_precision),
            quantity: round_to(quantity, rules.size_precision),
        };

        if normalized.price <= 0.0 {
            return Err(LedgerError::InvalidOrder(format!(
                "price {} rounds to {} at the instrument's precision",
                price, normalized.price
            )));
        }

        if normalized.quantity <= 0.0 {
            return Err(LedgerError::MinOrderSizeViolation {
                quantity: normalized.quantity,
                minimum: rules.min_order_size.unwrap_or(0.0),
            });
        }

        if let Some(minimum) = rules.min_order_size {
            if normalized.quantity < minimum {
                return Err(LedgerError::MinOrderSizeViolation {
                    quantity: normalized.quantity,
                    minimum,
                });
            }
        }

        if let Some(minimum) = rules.min_notional_value {
            let notional = normalized.notional();
            if notional < minimum {
                return Err(LedgerError::MinNotionalViolation { notional, minimum });
            }
        }

        Ok(normalized)
    }
}

/// Round half away from zero to `decimals` places; `None` leaves the value untouched.
pub fn round_to(value: f64, decimals: Option<u32>) -> f64 {
    match decimals {
        Some(decimals) => {
            let factor = 10f64.powi(decimals as i32);
            (value * factor).round() / factor
        }
        None => value,
    }
}
