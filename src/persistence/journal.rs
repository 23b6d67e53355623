//! Append-Only Transaction Journal
//!
//! The journal is the system of record for every balance-affecting event. This type
//! only exposes inserts; corrections are written as new ADJUSTMENT entries that point at
//! the entry they cancel. The storage triggers reject UPDATE and DELETE from any other
//! caller as well, and those aborts surface as `LedgerError::AppendOnlyViolation`.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::models::TransactionRecord;
use super::DbPool;
use crate::domain::entities::transaction::{NewTransaction, TransactionType};
use crate::domain::errors::{is_unique_violation, LedgerError};

#[derive(Clone)]
pub struct TransactionJournal {
    pool: DbPool,
}

impl TransactionJournal {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &NewTransaction) -> Result<TransactionRecord, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        append_in(&mut conn, entry, Utc::now()).await
    }

    /// Cancel `entry_id` with a compensating ADJUSTMENT of the opposite amount.
    ///
    /// An entry can be reversed once; reversing it again returns the existing reversal.
    pub async fn reverse(&self, entry_id: i64, reason: &str) -> Result<TransactionRecord, LedgerError> {
        let original = self
            .get(entry_id)
            .await?
            .ok_or(LedgerError::UnknownTransaction(entry_id))?;

        let mut reversal = NewTransaction::new(
            original.account_id,
            TransactionType::Adjustment,
            -original.amount,
        )
        .with_note(format!("reversal of #{}: {}", entry_id, reason));
        reversal.related_order_id = original.related_order_id;
        reversal.instrument_id = original.instrument_id;
        reversal.reverses_id = Some(entry_id);

        match self.append(&reversal).await {
            Ok(record) => {
                info!(
                    "Reversed journal entry {} ({} {:.8}) with entry {}",
                    entry_id, original.transaction_type, original.amount, record.id
                );
                Ok(record)
            }
            Err(LedgerError::Storage(e)) if is_unique_violation(&e) => {
                debug!("Journal entry {} already reversed", entry_id);
                sqlx::query_as::<_, TransactionRecord>(
                    "SELECT * FROM transactions WHERE reverses_id = ?1",
                )
                .bind(entry_id)
                .fetch_one(&self.pool)
                .await
                .map_err(LedgerError::from)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<TransactionRecord>, LedgerError> {
        let record = sqlx::query_as::<_, TransactionRecord>("SELECT * FROM transactions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    /// Entries for one account, oldest first.
    pub async fn list_for_account(&self, account_id: i64) -> Result<Vec<TransactionRecord>, LedgerError> {
        let records = sqlx::query_as::<_, TransactionRecord>(
            "SELECT * FROM transactions WHERE account_id = ?1 ORDER BY id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Cash balance of the account.
    ///
    /// REALIZED_PNL entries are memo entries (the cash already moved with the FILL
    /// entries), so they and their reversals are left out of the sum.
    pub async fn balance(&self, account_id: i64) -> Result<f64, LedgerError> {
        let (balance,): (f64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(t.amount), 0.0)
            FROM transactions t
            LEFT JOIN transactions r ON r.id = t.reverses_id
            WHERE t.account_id = ?1
              AND t.transaction_type != 'REALIZED_PNL'
              AND (r.id IS NULL OR r.transaction_type != 'REALIZED_PNL')
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    pub async fn net_pnl_since(&self, account_id: i64, since: DateTime<Utc>) -> Result<f64, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        net_pnl_since_in(&mut conn, account_id, since).await
    }
}

/// Insert one entry on an existing connection or transaction.
pub(crate) async fn append_in(
    conn: &mut SqliteConnection,
    entry: &NewTransaction,
    now: DateTime<Utc>,
) -> Result<TransactionRecord, LedgerError> {
    let record = sqlx::query_as::<_, TransactionRecord>(
        r#"
        INSERT INTO transactions (
            account_id, transaction_type, amount, related_order_id, instrument_id,
            quantity, price, reverses_id, note, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        RETURNING *
        "#,
    )
    .bind(entry.account_id)
    .bind(entry.transaction_type.as_str())
    .bind(entry.amount)
    .bind(entry.related_order_id)
    .bind(entry.instrument_id)
    .bind(entry.quantity)
    .bind(entry.price)
    .bind(entry.reverses_id)
    .bind(&entry.note)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    debug!(
        "Journal +{} {} {:.8} for account {}",
        record.id, record.transaction_type, record.amount, record.account_id
    );
    Ok(record)
}

/// Net realized result (REALIZED_PNL + FEE + FUNDING, and reversals of those) since `since`.
pub(crate) async fn net_pnl_since_in(
    conn: &mut SqliteConnection,
    account_id: i64,
    since: DateTime<Utc>,
) -> Result<f64, LedgerError> {
    let (net,): (f64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(t.amount), 0.0)
        FROM transactions t
        LEFT JOIN transactions r ON r.id = t.reverses_id
        WHERE t.account_id = ?1
          AND t.created_at >= ?2
          AND (
              t.transaction_type IN ('REALIZED_PNL', 'FEE', 'FUNDING')
              OR r.transaction_type IN ('REALIZED_PNL', 'FEE', 'FUNDING')
          )
        "#,
    )
    .bind(account_id)
    .bind(since)
    .fetch_one(&mut *conn)
    .await?;
    Ok(net)
}
