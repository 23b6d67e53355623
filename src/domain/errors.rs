use std::time::Duration;

use thiserror::Error;

use crate::domain::entities::order::OrderStatus;

/// Failure taxonomy shared by the ledger, the outbox and the intake path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected input; nothing was written.
    Validation,
    /// Kill switch or loss limit blocked admission of a new order.
    Admission,
    /// A uniqueness claim is held by someone else.
    Conflict,
    /// Append-only breach or illegal state change. Always fatal to the operation.
    InvariantViolation,
    /// Delivery or exchange I/O failed; retried under the backoff schedule.
    TransientDeliveryFailure,
    /// Retry ceiling reached; surfaced as an operational alert.
    IntegrityExhaustion,
    NotFound,
    Storage,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Admission => "admission",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::InvariantViolation => "invariant_violation",
            ErrorCategory::TransientDeliveryFailure => "transient_delivery_failure",
            ErrorCategory::IntegrityExhaustion => "integrity_exhaustion",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Storage => "storage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossWindow {
    Daily,
    Weekly,
}

impl std::fmt::Display for LossWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossWindow::Daily => write!(f, "daily"),
            LossWindow::Weekly => write!(f, "weekly"),
        }
    }
}

/// Errors raised by the order ledger and the transaction journal.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("min notional violation: notional {notional} below minimum {minimum}")]
    MinNotionalViolation { notional: f64, minimum: f64 },

    #[error("min order size violation: quantity {quantity} below minimum {minimum}")]
    MinOrderSizeViolation { quantity: f64, minimum: f64 },

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Unknown account: {0}")]
    UnknownAccount(i64),

    #[error("Unknown order: {0}")]
    UnknownOrder(i64),

    #[error("Unknown journal entry: {0}")]
    UnknownTransaction(i64),

    #[error("Trading is disabled by the kill switch")]
    TradingDisabled,

    #[error("{window} loss limit breached: loss {loss:.2} >= limit {limit:.2}")]
    LossLimitBreached {
        window: LossWindow,
        loss: f64,
        limit: f64,
    },

    #[error("Exchange order id {exchange_order_id} on {exchange} is already claimed by an active order")]
    DuplicateExchangeId {
        exchange: String,
        exchange_order_id: String,
    },

    #[error("Order {order_id} is already bound to exchange order id {existing}")]
    ExchangeIdAlreadyBound { order_id: i64, existing: String },

    #[error("Invalid state transition for order {order_id}: {from} -> {to}")]
    InvalidStateTransition {
        order_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Fill exceeds order {order_id}: filled {filled} > requested {requested}")]
    FillExceedsOrder {
        order_id: i64,
        requested: f64,
        filled: f64,
    },

    #[error("{table} is append-only")]
    AppendOnlyViolation { table: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(sqlx::Error),
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::InvalidOrder(_)
            | LedgerError::MinNotionalViolation { .. }
            | LedgerError::MinOrderSizeViolation { .. }
            | LedgerError::UnknownInstrument(_)
            | LedgerError::Serialization(_) => ErrorCategory::Validation,
            LedgerError::UnknownAccount(_)
            | LedgerError::UnknownOrder(_)
            | LedgerError::UnknownTransaction(_) => ErrorCategory::NotFound,
            LedgerError::TradingDisabled | LedgerError::LossLimitBreached { .. } => {
                ErrorCategory::Admission
            }
            LedgerError::DuplicateExchangeId { .. } | LedgerError::ExchangeIdAlreadyBound { .. } => {
                ErrorCategory::Conflict
            }
            LedgerError::InvalidStateTransition { .. }
            | LedgerError::FillExceedsOrder { .. }
            | LedgerError::AppendOnlyViolation { .. } => ErrorCategory::InvariantViolation,
            LedgerError::Storage(_) => ErrorCategory::Storage,
        }
    }

    /// Short code for logs and webhook responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidOrder(_) => "ERR_INVALID_ORDER",
            LedgerError::MinNotionalViolation { .. } => "ERR_MIN_NOTIONAL",
            LedgerError::MinOrderSizeViolation { .. } => "ERR_MIN_ORDER_SIZE",
            LedgerError::UnknownInstrument(_) => "ERR_UNKNOWN_INSTRUMENT",
            LedgerError::UnknownAccount(_) => "ERR_UNKNOWN_ACCOUNT",
            LedgerError::UnknownOrder(_) => "ERR_UNKNOWN_ORDER",
            LedgerError::UnknownTransaction(_) => "ERR_UNKNOWN_TRANSACTION",
            LedgerError::TradingDisabled => "ERR_TRADING_DISABLED",
            LedgerError::LossLimitBreached { .. } => "ERR_LOSS_LIMIT",
            LedgerError::DuplicateExchangeId { .. } => "ERR_DUPLICATE_EXCHANGE_ID",
            LedgerError::ExchangeIdAlreadyBound { .. } => "ERR_EXCHANGE_ID_BOUND",
            LedgerError::InvalidStateTransition { .. } => "ERR_INVALID_STATE_TRANSITION",
            LedgerError::FillExceedsOrder { .. } => "ERR_OVERFILL",
            LedgerError::AppendOnlyViolation { .. } => "ERR_APPEND_ONLY",
            LedgerError::Serialization(_) => "ERR_SERIALIZATION",
            LedgerError::Storage(_) => "ERR_STORAGE",
        }
    }

    /// Retrying the identical call might succeed (only storage hiccups qualify).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match append_only_table(&err) {
            Some(table) => LedgerError::AppendOnlyViolation { table },
            None => LedgerError::Storage(err),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

/// Name of the protected table when `err` is an append-only trigger abort.
pub fn append_only_table(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .message()
            .strip_suffix(" is append-only")
            .map(|table| table.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}

/// Errors raised by the notification outbox.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("Unknown outbox entry: {0}")]
    UnknownEntry(i64),

    #[error("Lease on outbox entry {id} is no longer held by {owner}")]
    LeaseLost { id: i64, owner: String },

    #[error("Corrupt outbox record: {0}")]
    InvalidRecord(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl OutboxError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            OutboxError::UnknownEntry(_) => ErrorCategory::NotFound,
            OutboxError::LeaseLost { .. } => ErrorCategory::Conflict,
            OutboxError::InvalidRecord(_) => ErrorCategory::InvariantViolation,
            OutboxError::Storage(_) => ErrorCategory::Storage,
        }
    }
}

/// A failed delivery attempt. Every variant counts as a failure for backoff purposes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),

    #[error("Delivery rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No transport registered for channel {0}")]
    NoTransport(String),
}

impl DeliveryError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::TransientDeliveryFailure
    }
}

/// Errors raised by the inbound dedupe store, the intake box and the intake pipeline.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Unknown inbound alert: {0}")]
    UnknownAlert(i64),

    #[error("Inbound alert {0} was already resolved")]
    AlertAlreadyResolved(i64),

    #[error("Invalid alert payload: {0}")]
    InvalidPayload(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl IntakeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            IntakeError::UnknownAlert(_) => ErrorCategory::NotFound,
            IntakeError::AlertAlreadyResolved(_) => ErrorCategory::InvariantViolation,
            IntakeError::InvalidPayload(_) => ErrorCategory::Validation,
            IntakeError::Storage(_) => ErrorCategory::Storage,
            IntakeError::Ledger(err) => err.category(),
        }
    }
}

/// Errors raised by the versioned system configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("System configuration version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("System configuration row is missing")]
    Missing,

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl From<ConfigError> for LedgerError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Storage(e) => LedgerError::Storage(e),
            other => LedgerError::InvalidOrder(format!("system configuration unavailable: {other}")),
        }
    }
}

impl From<OutboxError> for LedgerError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Storage(e) => LedgerError::Storage(e),
            other => LedgerError::Serialization(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_categories() {
        assert_eq!(
            LedgerError::MinNotionalViolation {
                notional: 1.0,
                minimum: 10.0
            }
            .category(),
            ErrorCategory::Validation
        );
        assert_eq!(LedgerError::TradingDisabled.category(), ErrorCategory::Admission);
        assert_eq!(
            LedgerError::AppendOnlyViolation {
                table: "transactions".into()
            }
            .category(),
            ErrorCategory::InvariantViolation
        );
        assert_eq!(
            LedgerError::InvalidStateTransition {
                order_id: 1,
                from: OrderStatus::Filled,
                to: OrderStatus::Canceled
            }
            .category(),
            ErrorCategory::InvariantViolation
        );
        assert_eq!(
            LedgerError::DuplicateExchangeId {
                exchange: "binance".into(),
                exchange_order_id: "42".into()
            }
            .category(),
            ErrorCategory::Conflict
        );
    }

    #[test]
    fn test_error_messages() {
        let err = LedgerError::AppendOnlyViolation {
            table: "transactions".into(),
        };
        assert_eq!(err.to_string(), "transactions is append-only");
        assert_eq!(err.error_code(), "ERR_APPEND_ONLY");

        let err = LedgerError::MinNotionalViolation {
            notional: 1.23,
            minimum: 10.0,
        };
        assert!(err.to_string().contains("min notional violation"));
    }

    #[test]
    fn test_only_storage_is_recoverable() {
        assert!(!LedgerError::TradingDisabled.is_recoverable());
        assert!(LedgerError::Storage(sqlx::Error::PoolTimedOut).is_recoverable());
    }

    #[test]
    fn test_non_database_errors_are_not_append_only() {
        assert_eq!(append_only_table(&sqlx::Error::RowNotFound), None);
        assert!(matches!(
            LedgerError::from(sqlx::Error::RowNotFound),
            LedgerError::Storage(_)
        ));
    }

    #[test]
    fn test_delivery_errors_are_transient() {
        let err = DeliveryError::Timeout(Duration::from_secs(10));
        assert_eq!(err.category(), ErrorCategory::TransientDeliveryFailure);
        assert!(err.to_string().contains("timed out"));
    }
}
