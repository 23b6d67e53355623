//! Idempotent Order Ledger
//!
//! Authoritative order table. Duplicate prevention rests on the two partial unique
//! indexes (`ux_orders_idem_active`, `ux_orders_exchange_id_active`); the code never
//! decides "does it exist?" by reading first and writing later. A losing writer sees the
//! constraint violation and answers with the winner's identity.
//!
//! Every multi-statement operation opens its transaction with a write to the order row
//! (`lock_order`) so the connection holds the write lock before it reads anything.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use super::instruments::InstrumentRegistry;
use super::journal::{append_in, net_pnl_since_in};
use super::models::{ExecutionRecord, OrderRecord, PositionRecord, SystemConfig};
use super::outbox::NotificationOutbox;
use super::system_config::lock_config_in;
use super::DbPool;
use crate::domain::entities::notification::{AlertRoute, Severity};
use crate::domain::entities::order::{
    FillOutcome, FillReport, OrderStatus, SubmitOrder, SubmitOutcome, FILL_EPSILON,
};
use crate::domain::entities::position::Position;
use crate::domain::entities::transaction::{NewTransaction, TransactionType};
use crate::domain::errors::{is_foreign_key_violation, is_unique_violation, LedgerError, LossWindow};
use crate::domain::services::normalization::{NormalizationPolicy, PrecisionPolicy};

#[derive(Clone)]
pub struct OrderLedger {
    pool: DbPool,
    instruments: Arc<InstrumentRegistry>,
    outbox: NotificationOutbox,
    alert_route: AlertRoute,
    policy: Arc<dyn NormalizationPolicy>,
}

impl OrderLedger {
    /// The system configuration row is consulted before every new admission; blocked
    /// admissions are reported to `alert_route` through `outbox`.
    pub fn new(
        pool: DbPool,
        outbox: NotificationOutbox,
        alert_route: AlertRoute,
    ) -> Self {
        Self {
            instruments: Arc::new(InstrumentRegistry::new(pool.clone())),
            pool,
            outbox,
            alert_route,
            policy: Arc::new(PrecisionPolicy),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn NormalizationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Create a NEW order, or return the active order already holding the key.
    pub async fn submit(&self, order: &SubmitOrder) -> Result<SubmitOutcome, LedgerError> {
        if order.idempotency_key.trim().is_empty() {
            return Err(LedgerError::InvalidOrder(
                "idempotency key must not be empty".to_string(),
            ));
        }

        let instrument = self.instruments.resolve(&order.instrument).await?;

        if let Some(existing) = self.find_active(order.account_id, &order.idempotency_key).await? {
            info!(
                "Replay of idempotency key {} for account {}: order {} already active",
                order.idempotency_key, order.account_id, existing.id
            );
            return Ok(outcome(&existing, false));
        }

        let rules = instrument.rules()?;
        let now = Utc::now();

        // The configuration is read under the write lock, so a kill switch flipped
        // concurrently lands either before this admission or after the insert commits.
        let mut tx = self.pool.begin().await?;
        if let Some(block) = admission_in(&mut tx, order.account_id, now).await? {
            tx.rollback().await?;
            self.alert_blocked(order.account_id, &block.config, &block.reason, &block.message, now)
                .await;
            return Err(block.error);
        }

        let normalized = self.policy.normalize(&rules, order.price, order.quantity)?;
        let client_order_id = format!("c{}-{:016x}", order.account_id, rand::random::<u64>());

        let inserted = sqlx::query_as::<_, OrderRecord>(
            r#"
            INSERT INTO orders (
                account_id, instrument_id, exchange, client_order_id, idempotency_key,
                side, order_type, status, price, quantity, filled_quantity,
                stop_price, take_profit_price, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'NEW', ?8, ?9, 0, ?10, ?11, ?12, ?12)
            RETURNING *
            "#,
        )
        .bind(order.account_id)
        .bind(instrument.id)
        .bind(&instrument.exchange)
        .bind(&client_order_id)
        .bind(&order.idempotency_key)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(normalized.price)
        .bind(normalized.quantity)
        .bind(order.stop_price)
        .bind(order.take_profit_price)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(record) => {
                tx.commit().await?;
                info!(
                    "Order {} ({}) created: {} {} {} @ {} for account {} [key {}]",
                    record.id,
                    record.client_order_id,
                    order.side,
                    record.quantity,
                    instrument.instrument_ref(),
                    record.price,
                    record.account_id,
                    record.idempotency_key
                );
                Ok(outcome(&record, true))
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                match self.find_active(order.account_id, &order.idempotency_key).await? {
                    Some(existing) => {
                        info!(
                            "Concurrent submit of key {} for account {} resolved to order {}",
                            order.idempotency_key, order.account_id, existing.id
                        );
                        Ok(outcome(&existing, false))
                    }
                    None => {
                        error!("Unique violation without an active order for key {}: {}", order.idempotency_key, e);
                        Err(LedgerError::Storage(e))
                    }
                }
            }
            Err(e) if is_foreign_key_violation(&e) => Err(LedgerError::UnknownAccount(order.account_id)),
            Err(e) => {
                error!("Failed to insert order for key {}: {}", order.idempotency_key, e);
                Err(e.into())
            }
        }
    }

    /// Record the exchange's acknowledgment id on an order.
    pub async fn bind_exchange_id(
        &self,
        order_id: i64,
        exchange_order_id: &str,
    ) -> Result<OrderRecord, LedgerError> {
        if exchange_order_id.trim().is_empty() {
            return Err(LedgerError::InvalidOrder(
                "exchange order id must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let order = lock_order(&mut tx, order_id, now).await?;

        match order.exchange_order_id.as_deref() {
            Some(existing) if existing == exchange_order_id => {
                tx.rollback().await?;
                debug!("Order {} already bound to {}", order_id, exchange_order_id);
                return Ok(order);
            }
            Some(existing) => {
                return Err(LedgerError::ExchangeIdAlreadyBound {
                    order_id,
                    existing: existing.to_string(),
                });
            }
            None => {}
        }

        let bound = sqlx::query_as::<_, OrderRecord>(
            "UPDATE orders SET exchange_order_id = ?1, updated_at = ?2 WHERE id = ?3 RETURNING *",
        )
        .bind(exchange_order_id)
        .bind(now)
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await;

        match bound {
            Ok(record) => {
                tx.commit().await?;
                info!("Order {} bound to exchange order id {}", order_id, exchange_order_id);
                Ok(record)
            }
            Err(e) if is_unique_violation(&e) => {
                warn!(
                    "Exchange order id {} on {} is already claimed by another active order",
                    exchange_order_id, order.exchange
                );
                Err(LedgerError::DuplicateExchangeId {
                    exchange: order.exchange,
                    exchange_order_id: exchange_order_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one exchange fill: execution row, order progress, position and journal
    /// entries, all committed together.
    pub async fn record_fill(&self, order_id: i64, fill: &FillReport) -> Result<FillOutcome, LedgerError> {
        if !fill.price.is_finite() || fill.price <= 0.0 {
            return Err(LedgerError::InvalidOrder(format!("fill price must be positive, got {}", fill.price)));
        }
        if !fill.quantity.is_finite() || fill.quantity <= 0.0 {
            return Err(LedgerError::InvalidOrder(format!(
                "fill quantity must be positive, got {}",
                fill.quantity
            )));
        }
        if !fill.fee.is_finite() {
            return Err(LedgerError::InvalidOrder("fill fee must be finite".to_string()));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let order = lock_order(&mut tx, order_id, now).await?;

        if let Some(trade_id) = &fill.trade_id {
            let known: Option<(i64,)> = sqlx::query_as("SELECT id FROM executions WHERE trade_id = ?1")
                .bind(trade_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some((execution_id,)) = known {
                tx.rollback().await?;
                info!("Fill {} for order {} already recorded as execution {}", trade_id, order_id, execution_id);
                return Ok(FillOutcome::Duplicate { execution_id });
            }
        }

        let status = order.order_status();
        let filled = order.filled_quantity + fill.quantity;
        let next_status = OrderStatus::after_fill(order.quantity, filled);

        if !status.is_active() {
            return Err(LedgerError::InvalidStateTransition {
                order_id,
                from: status,
                to: next_status,
            });
        }
        if filled > order.quantity * (1.0 + FILL_EPSILON) {
            return Err(LedgerError::FillExceedsOrder {
                order_id,
                requested: order.quantity,
                filled,
            });
        }

        let average = (order.avg_fill_price.unwrap_or(0.0) * order.filled_quantity
            + fill.price * fill.quantity)
            / filled;

        let execution = sqlx::query_as::<_, ExecutionRecord>(
            r#"
            INSERT INTO executions (order_id, trade_id, price, quantity, fee, executed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING *
            "#,
        )
        .bind(order_id)
        .bind(&fill.trade_id)
        .bind(fill.price)
        .bind(fill.quantity)
        .bind(fill.fee)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE orders
            SET filled_quantity = ?1, avg_fill_price = ?2, status = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(filled)
        .bind(average)
        .bind(next_status.as_str())
        .bind(now)
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        let side = order.order_side();
        let mut position = load_position(&mut tx, order.account_id, order.instrument_id)
            .await?
            .map(|p| p.to_position())
            .unwrap_or_default();
        let realized_pnl = position.apply_fill(side, fill.quantity, fill.price, order.stop_price);
        save_position(&mut tx, order.account_id, order.instrument_id, &position, now).await?;

        let cash = -side.sign() * fill.price * fill.quantity;
        let mut entries = vec![NewTransaction::new(order.account_id, TransactionType::Fill, cash)
            .for_order(order_id, order.instrument_id)
            .with_trade(fill.quantity, fill.price)];
        if fill.fee != 0.0 {
            entries.push(
                NewTransaction::new(order.account_id, TransactionType::Fee, -fill.fee)
                    .for_order(order_id, order.instrument_id),
            );
        }
        if realized_pnl != 0.0 {
            entries.push(
                NewTransaction::new(order.account_id, TransactionType::RealizedPnl, realized_pnl)
                    .for_order(order_id, order.instrument_id)
                    .with_trade(fill.quantity, fill.price),
            );
        }
        for entry in &entries {
            append_in(&mut tx, entry, now).await?;
        }

        tx.commit().await?;

        info!(
            "Fill on order {}: {} @ {} (fee {}), filled {}/{} -> {}, realized {:.8}",
            order_id, fill.quantity, fill.price, fill.fee, filled, order.quantity, next_status, realized_pnl
        );

        Ok(FillOutcome::Recorded {
            execution_id: execution.id,
            status: next_status,
            filled_quantity: filled,
            realized_pnl,
        })
    }

    /// Move an active order to CANCELED, REJECTED or EXPIRED.
    pub async fn transition(&self, order_id: i64, target: OrderStatus) -> Result<OrderRecord, LedgerError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let order = lock_order(&mut tx, order_id, now).await?;
        let from = order.order_status();

        if !target.is_manual_target() || !from.can_transition_to(target) {
            warn!("Rejected transition of order {}: {} -> {}", order_id, from, target);
            return Err(LedgerError::InvalidStateTransition {
                order_id,
                from,
                to: target,
            });
        }

        let record = sqlx::query_as::<_, OrderRecord>(
            "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3 RETURNING *",
        )
        .bind(target.as_str())
        .bind(now)
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Order {} transitioned {} -> {}", order_id, from, target);
        Ok(record)
    }

    pub async fn get(&self, order_id: i64) -> Result<OrderRecord, LedgerError> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE id = ?1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::UnknownOrder(order_id))
    }

    pub async fn find_active(
        &self,
        account_id: i64,
        idempotency_key: &str,
    ) -> Result<Option<OrderRecord>, LedgerError> {
        let record = sqlx::query_as::<_, OrderRecord>(
            r#"
            SELECT * FROM orders
            WHERE account_id = ?1 AND idempotency_key = ?2
              AND status IN ('NEW', 'PARTIALLY_FILLED')
            "#,
        )
        .bind(account_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn count_active(&self, account_id: i64) -> Result<i64, LedgerError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM orders WHERE account_id = ?1 AND status IN ('NEW', 'PARTIALLY_FILLED')",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn executions(&self, order_id: i64) -> Result<Vec<ExecutionRecord>, LedgerError> {
        let records = sqlx::query_as::<_, ExecutionRecord>(
            "SELECT * FROM executions WHERE order_id = ?1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn position(
        &self,
        account_id: i64,
        instrument_id: i64,
    ) -> Result<Option<PositionRecord>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        load_position(&mut conn, account_id, instrument_id).await
    }

    /// Refuse new admissions when the kill switch is off or a loss limit is reached,
    /// and raise a CRITICAL alert for it.
    async fn alert_blocked(
        &self,
        account_id: i64,
        config: &SystemConfig,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        warn!("Admission blocked for account {}: {}", account_id, message);

        let dedupe_key = format!(
            "admission-blocked:{}:{}:v{}:{}",
            account_id,
            reason,
            config.version,
            now.format("%Y-%m-%d")
        );
        let notification = self.alert_route.notification(
            Severity::Critical,
            format!("Order admission blocked (account {})", account_id),
            message,
            Some(dedupe_key),
        );
        if let Err(e) = self.outbox.enqueue(&notification).await {
            error!("Failed to enqueue admission alert for account {}: {}", account_id, e);
        }
    }
}

/// Why an admission was refused, carried out of the transaction so the alert is
/// enqueued after rollback.
struct AdmissionBlock {
    config: SystemConfig,
    reason: String,
    message: String,
    error: LedgerError,
}

/// Kill switch first, then the daily and weekly loss windows.
async fn admission_in(
    conn: &mut SqliteConnection,
    account_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<AdmissionBlock>, LedgerError> {
    let config = lock_config_in(conn).await?;

    if !config.trading_enabled {
        return Ok(Some(AdmissionBlock {
            config,
            reason: "kill-switch".to_string(),
            message: "Trading is disabled by the kill switch".to_string(),
            error: LedgerError::TradingDisabled,
        }));
    }

    let windows = [
        (LossWindow::Daily, config.daily_loss_limit, day_start(now)),
        (LossWindow::Weekly, config.weekly_loss_limit, week_start(now)),
    ];
    for (window, limit, since) in windows {
        if limit <= 0.0 {
            continue;
        }
        let loss = -net_pnl_since_in(conn, account_id, since).await?;
        if loss >= limit {
            return Ok(Some(AdmissionBlock {
                reason: format!("{}-loss-limit", window),
                message: format!(
                    "{} loss {:.2} reached the limit of {:.2}; new orders are blocked",
                    window, loss, limit
                ),
                error: LedgerError::LossLimitBreached { window, loss, limit },
                config,
            }));
        }
    }

    Ok(None)
}

fn outcome(record: &OrderRecord, created: bool) -> SubmitOutcome {
    SubmitOutcome {
        order_id: record.id,
        client_order_id: record.client_order_id.clone(),
        created,
    }
}

/// Write-lock the order row for the rest of the transaction and return it.
async fn lock_order(
    conn: &mut SqliteConnection,
    order_id: i64,
    now: DateTime<Utc>,
) -> Result<OrderRecord, LedgerError> {
    sqlx::query_as::<_, OrderRecord>("UPDATE orders SET updated_at = ?1 WHERE id = ?2 RETURNING *")
        .bind(now)
        .bind(order_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(LedgerError::UnknownOrder(order_id))
}

async fn load_position(
    conn: &mut SqliteConnection,
    account_id: i64,
    instrument_id: i64,
) -> Result<Option<PositionRecord>, LedgerError> {
    let record = sqlx::query_as::<_, PositionRecord>(
        "SELECT * FROM positions WHERE account_id = ?1 AND instrument_id = ?2",
    )
    .bind(account_id)
    .bind(instrument_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(record)
}

async fn save_position(
    conn: &mut SqliteConnection,
    account_id: i64,
    instrument_id: i64,
    position: &Position,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO positions (account_id, instrument_id, quantity, average_entry_price, initial_stop, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(account_id, instrument_id) DO UPDATE SET
            quantity = excluded.quantity,
            average_entry_price = excluded.average_entry_price,
            initial_stop = excluded.initial_stop,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(account_id)
    .bind(instrument_id)
    .bind(position.quantity)
    .bind(position.average_entry_price)
    .bind(position.initial_stop)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// 00:00 UTC of the day containing `now`.
pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Monday 00:00 UTC of the ISO week containing `now`.
pub fn week_start(now: DateTime<Utc>) -> DateTime<Utc> {
    day_start(now) - Duration::days(now.weekday().num_days_from_monday() as i64)
}
