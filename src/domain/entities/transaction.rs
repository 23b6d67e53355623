use serde::{Deserialize, Serialize};

/// Kind of balance-affecting event recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Fill,
    Fee,
    Funding,
    RealizedPnl,
    RiskAction,
    /// Compensating entry; corrections never touch the original row.
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "DEPOSIT",
            TransactionType::Withdrawal => "WITHDRAWAL",
            TransactionType::Fill => "FILL",
            TransactionType::Fee => "FEE",
            TransactionType::Funding => "FUNDING",
            TransactionType::RealizedPnl => "REALIZED_PNL",
            TransactionType::RiskAction => "RISK_ACTION",
            TransactionType::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEPOSIT" => Some(TransactionType::Deposit),
            "WITHDRAWAL" => Some(TransactionType::Withdrawal),
            "FILL" => Some(TransactionType::Fill),
            "FEE" => Some(TransactionType::Fee),
            "FUNDING" => Some(TransactionType::Funding),
            "REALIZED_PNL" => Some(TransactionType::RealizedPnl),
            "RISK_ACTION" => Some(TransactionType::RiskAction),
            "ADJUSTMENT" => Some(TransactionType::Adjustment),
            _ => None,
        }
    }

    /// Entry types that count towards realized profit and loss.
    pub fn pnl_types() -> [TransactionType; 3] {
        [
            TransactionType::RealizedPnl,
            TransactionType::Fee,
            TransactionType::Funding,
        ]
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A journal entry to append. `amount` is a signed cash amount in quote currency.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: i64,
    pub transaction_type: TransactionType,
    pub amount: f64,
    pub related_order_id: Option<i64>,
    pub instrument_id: Option<i64>,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub reverses_id: Option<i64>,
    pub note: Option<String>,
}

impl NewTransaction {
    pub fn new(account_id: i64, transaction_type: TransactionType, amount: f64) -> Self {
        Self {
            account_id,
            transaction_type,
            amount,
            related_order_id: None,
            instrument_id: None,
            quantity: None,
            price: None,
            reverses_id: None,
            note: None,
        }
    }

    pub fn for_order(mut self, order_id: i64, instrument_id: i64) -> Self {
        self.related_order_id = Some(order_id);
        self.instrument_id = Some(instrument_id);
        self
    }

    pub fn with_trade(mut self, quantity: f64, price: f64) -> Self {
        self.quantity = Some(quantity);
        self.price = Some(price);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
