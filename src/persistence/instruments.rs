//! Instrument registry with per-instrument trading rules.

use chrono::Utc;
use tracing::{debug, error};

use super::models::InstrumentRecord;
use super::DbPool;
use crate::domain::entities::instrument::{InstrumentRef, TradingRules};
use crate::domain::errors::LedgerError;

pub struct InstrumentRegistry {
    pool: DbPool,
}

impl InstrumentRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register an instrument, replacing the rules of an existing one.
    pub async fn register(
        &self,
        exchange: &str,
        symbol: &str,
        rules: &TradingRules,
    ) -> Result<InstrumentRecord, LedgerError> {
        let rules_json = serde_json::to_string(rules)?;
        let now = Utc::now();

        let record = sqlx::query_as::<_, InstrumentRecord>(
            r#"
            INSERT INTO instruments (exchange, symbol, trading_rules, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(exchange, symbol) DO UPDATE SET
                trading_rules = excluded.trading_rules,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(exchange)
        .bind(symbol)
        .bind(&rules_json)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register instrument {}:{}: {}", exchange, symbol, e);
            LedgerError::from(e)
        })?;

        debug!("Registered instrument {} as {}", record.instrument_ref(), record.id);
        Ok(record)
    }

    pub async fn resolve(&self, instrument: &InstrumentRef) -> Result<InstrumentRecord, LedgerError> {
        sqlx::query_as::<_, InstrumentRecord>(
            "SELECT * FROM instruments WHERE exchange = ?1 AND symbol = ?2",
        )
        .bind(&instrument.exchange)
        .bind(&instrument.symbol)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::UnknownInstrument(instrument.to_string()))
    }
}
