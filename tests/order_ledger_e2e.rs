//! Order ledger end-to-end tests
//!
//! Idempotent submission under concurrency, lifecycle transitions, fills feeding
//! positions and the journal, exchange id binding, and the admission gate.

use futures_util::future::join_all;

use tradevault::domain::entities::instrument::{InstrumentRef, TradingRules};
use tradevault::domain::entities::notification::{AlertRoute, OutboxStatus};
use tradevault::domain::entities::order::{
    FillOutcome, FillReport, OrderSide, OrderStatus, OrderType, SubmitOrder,
};
use tradevault::domain::entities::transaction::{NewTransaction, TransactionType};
use tradevault::domain::errors::{ErrorCategory, LedgerError, LossWindow};
use tradevault::persistence::accounts::AccountRepository;
use tradevault::persistence::instruments::InstrumentRegistry;
use tradevault::persistence::journal::TransactionJournal;
use tradevault::persistence::order_ledger::OrderLedger;
use tradevault::persistence::outbox::NotificationOutbox;
use tradevault::persistence::system_config::{SystemConfigStore, SystemConfigUpdate};
use tradevault::persistence::{init_database, DbPool};

struct Harness {
    pool: DbPool,
    ledger: OrderLedger,
    journal: TransactionJournal,
    outbox: NotificationOutbox,
    config: SystemConfigStore,
    account_id: i64,
}

async fn harness() -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let account = AccountRepository::new(pool.clone()).create("main").await.unwrap();
    InstrumentRegistry::new(pool.clone())
        .register(
            "binance",
            "BTCUSDT",
            &TradingRules {
                price_precision: Some(2),
                size_precision: Some(5),
                min_order_size: Some(0.0001),
                min_notional_value: Some(10.0),
            },
        )
        .await
        .unwrap();

    let config = SystemConfigStore::new(pool.clone());
    let outbox = NotificationOutbox::new(pool.clone());
    let ledger = OrderLedger::new(
        pool.clone(),
        outbox.clone(),
        AlertRoute::new("telegram", "-100123"),
    );

    Harness {
        journal: TransactionJournal::new(pool.clone()),
        pool,
        ledger,
        outbox,
        config,
        account_id: account.id,
    }
}

fn order(account_id: i64, key: &str, side: OrderSide, price: f64, quantity: f64) -> SubmitOrder {
    SubmitOrder {
        account_id,
        instrument: InstrumentRef::new("binance", "BTCUSDT"),
        idempotency_key: key.to_string(),
        side,
        order_type: OrderType::Limit,
        price,
        quantity,
        stop_price: None,
        take_profit_price: None,
    }
}

fn fill(price: f64, quantity: f64, fee: f64, trade_id: &str) -> FillReport {
    FillReport {
        price,
        quantity,
        fee,
        trade_id: Some(trade_id.to_string()),
    }
}

#[tokio::test]
async fn test_replayed_submit_returns_same_order() {
    let h = harness().await;
    let request = order(h.account_id, "tv:abc:1", OrderSide::Buy, 65000.0, 0.01);

    let first = h.ledger.submit(&request).await.unwrap();
    let second = h.ledger.submit(&request).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.order_id, second.order_id);
    assert_eq!(first.client_order_id, second.client_order_id);
    assert_eq!(h.ledger.count_active(h.account_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_submits_create_one_order() {
    let h = harness().await;
    let request = order(h.account_id, "tv:race:1", OrderSide::Buy, 65000.0, 0.01);

    let results = join_all((0..8).map(|_| h.ledger.submit(&request))).await;
    let outcomes: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.created).count(), 1);
    assert!(outcomes.iter().all(|o| o.order_id == outcomes[0].order_id));
    assert_eq!(h.ledger.count_active(h.account_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_terminal_order_frees_the_key() {
    let h = harness().await;
    let request = order(h.account_id, "tv:abc:2", OrderSide::Buy, 65000.0, 0.01);

    let first = h.ledger.submit(&request).await.unwrap();
    let canceled = h
        .ledger
        .transition(first.order_id, OrderStatus::Canceled)
        .await
        .unwrap();
    assert_eq!(canceled.order_status(), OrderStatus::Canceled);

    let again = h.ledger.transition(first.order_id, OrderStatus::Expired).await;
    assert!(matches!(
        again,
        Err(LedgerError::InvalidStateTransition {
            from: OrderStatus::Canceled,
            to: OrderStatus::Expired,
            ..
        })
    ));

    let not_manual = h.ledger.transition(first.order_id, OrderStatus::Filled).await;
    assert!(matches!(not_manual, Err(LedgerError::InvalidStateTransition { .. })));

    let second = h.ledger.submit(&request).await.unwrap();
    assert!(second.created);
    assert_ne!(second.order_id, first.order_id);
}

#[tokio::test]
async fn test_min_notional_rejection_then_valid_retry() {
    let h = harness().await;

    let too_small = order(h.account_id, "tv:small:1", OrderSide::Buy, 65000.0, 0.0001);
    let err = h.ledger.submit(&too_small).await.unwrap_err();
    assert!(matches!(err, LedgerError::MinNotionalViolation { .. }));
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(h.ledger.count_active(h.account_id).await.unwrap(), 0);

    let valid = order(h.account_id, "tv:small:1", OrderSide::Buy, 65000.0, 0.001);
    let outcome = h.ledger.submit(&valid).await.unwrap();
    assert!(outcome.created);
}

#[tokio::test]
async fn test_submit_normalizes_price_and_quantity() {
    let h = harness().await;
    let request = order(h.account_id, "tv:norm:1", OrderSide::Sell, 65000.123, 0.0123456);

    let outcome = h.ledger.submit(&request).await.unwrap();
    let stored = h.ledger.get(outcome.order_id).await.unwrap();
    assert_eq!(stored.price, 65000.12);
    assert_eq!(stored.quantity, 0.01235);
    assert_eq!(stored.order_status(), OrderStatus::New);
}

#[tokio::test]
async fn test_unknown_instrument_and_account() {
    let h = harness().await;

    let mut request = order(h.account_id, "tv:x:1", OrderSide::Buy, 1.0, 100.0);
    request.instrument = InstrumentRef::new("binance", "DOGEUSDT");
    assert!(matches!(
        h.ledger.submit(&request).await,
        Err(LedgerError::UnknownInstrument(_))
    ));

    let request = order(9999, "tv:x:2", OrderSide::Buy, 65000.0, 0.01);
    assert!(matches!(
        h.ledger.submit(&request).await,
        Err(LedgerError::UnknownAccount(9999))
    ));
}

#[tokio::test]
async fn test_fills_update_order_position_and_journal() {
    let h = harness().await;

    let mut buy = order(h.account_id, "tv:fill:1", OrderSide::Buy, 65000.0, 0.01);
    buy.stop_price = Some(63050.0);
    let buy = h.ledger.submit(&buy).await.unwrap();

    let partial = h
        .ledger
        .record_fill(buy.order_id, &fill(65000.0, 0.004, 0.1, "t1"))
        .await
        .unwrap();
    assert!(matches!(
        partial,
        FillOutcome::Recorded {
            status: OrderStatus::PartiallyFilled,
            ..
        }
    ));

    let redelivered = h
        .ledger
        .record_fill(buy.order_id, &fill(65000.0, 0.004, 0.1, "t1"))
        .await
        .unwrap();
    assert!(matches!(redelivered, FillOutcome::Duplicate { .. }));

    let done = h
        .ledger
        .record_fill(buy.order_id, &fill(65000.0, 0.006, 0.1, "t2"))
        .await
        .unwrap();
    assert!(matches!(
        done,
        FillOutcome::Recorded {
            status: OrderStatus::Filled,
            ..
        }
    ));
    assert_eq!(h.ledger.executions(buy.order_id).await.unwrap().len(), 2);

    // Filled orders accept no more fills
    let late = h
        .ledger
        .record_fill(buy.order_id, &fill(65000.0, 0.001, 0.0, "t3"))
        .await;
    assert!(matches!(late, Err(LedgerError::InvalidStateTransition { .. })));

    let record = h.ledger.get(buy.order_id).await.unwrap();
    let position = h
        .ledger
        .position(h.account_id, record.instrument_id)
        .await
        .unwrap()
        .unwrap();
    assert!((position.quantity - 0.01).abs() < 1e-12);
    assert!((position.average_entry_price - 65000.0).abs() < 1e-9);
    assert_eq!(position.initial_stop, Some(63050.0));

    // Close at a profit
    let sell = h
        .ledger
        .submit(&order(h.account_id, "tv:fill:2", OrderSide::Sell, 66000.0, 0.01))
        .await
        .unwrap();
    match h
        .ledger
        .record_fill(sell.order_id, &fill(66000.0, 0.01, 0.2, "t4"))
        .await
        .unwrap()
    {
        FillOutcome::Recorded { realized_pnl, .. } => assert!((realized_pnl - 10.0).abs() < 1e-9),
        other => panic!("expected recorded fill, got {:?}", other),
    }

    let position = h
        .ledger
        .position(h.account_id, record.instrument_id)
        .await
        .unwrap()
        .unwrap();
    assert!(position.quantity.abs() < 1e-12);

    let entries = h.journal.list_for_account(h.account_id).await.unwrap();
    let count = |kind: TransactionType| entries.iter().filter(|e| e.kind() == Some(kind)).count();
    assert_eq!(count(TransactionType::Fill), 3);
    assert_eq!(count(TransactionType::Fee), 3);
    assert_eq!(count(TransactionType::RealizedPnl), 1);

    // -650 + 660 cash, minus 0.4 in fees
    let balance = h.journal.balance(h.account_id).await.unwrap();
    assert!((balance - 9.6).abs() < 1e-6, "balance was {}", balance);
}

#[tokio::test]
async fn test_overfill_is_refused() {
    let h = harness().await;
    let buy = h
        .ledger
        .submit(&order(h.account_id, "tv:over:1", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap();

    let err = h
        .ledger
        .record_fill(buy.order_id, &fill(65000.0, 0.02, 0.0, "o1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::FillExceedsOrder { .. }));
    assert!(h.ledger.executions(buy.order_id).await.unwrap().is_empty());
    assert_eq!(h.ledger.get(buy.order_id).await.unwrap().filled_quantity, 0.0);
}

#[tokio::test]
async fn test_exchange_id_binding() {
    let h = harness().await;
    let a = h
        .ledger
        .submit(&order(h.account_id, "tv:bind:1", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap();
    let b = h
        .ledger
        .submit(&order(h.account_id, "tv:bind:2", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap();

    let bound = h.ledger.bind_exchange_id(a.order_id, "ex-1").await.unwrap();
    assert_eq!(bound.exchange_order_id.as_deref(), Some("ex-1"));

    // Same id again is a no-op
    h.ledger.bind_exchange_id(a.order_id, "ex-1").await.unwrap();

    let taken = h.ledger.bind_exchange_id(b.order_id, "ex-1").await.unwrap_err();
    assert!(matches!(taken, LedgerError::DuplicateExchangeId { .. }));
    assert_eq!(taken.category(), ErrorCategory::Conflict);

    let rebound = h.ledger.bind_exchange_id(a.order_id, "ex-2").await.unwrap_err();
    assert!(matches!(rebound, LedgerError::ExchangeIdAlreadyBound { .. }));
}

#[tokio::test]
async fn test_kill_switch_blocks_new_orders_and_alerts_once() {
    let h = harness().await;
    let existing = h
        .ledger
        .submit(&order(h.account_id, "tv:kill:0", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap();

    h.config.set_trading_enabled(false).await.unwrap();

    for key in ["tv:kill:1", "tv:kill:2"] {
        let err = h
            .ledger
            .submit(&order(h.account_id, key, OrderSide::Buy, 65000.0, 0.01))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TradingDisabled));
        assert_eq!(err.category(), ErrorCategory::Admission);
    }

    // One CRITICAL alert per account, reason, config version and day
    assert_eq!(h.outbox.count_by_status(OutboxStatus::Pending).await.unwrap(), 1);
    let (severity, target): (String, String) =
        sqlx::query_as("SELECT severity, target FROM notification_outbox")
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(severity, "CRITICAL");
    assert_eq!(target, "-100123");

    // Replays of active orders still answer
    let replay = h
        .ledger
        .submit(&order(h.account_id, "tv:kill:0", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap();
    assert_eq!(replay.order_id, existing.order_id);

    h.config.set_trading_enabled(true).await.unwrap();
    let admitted = h
        .ledger
        .submit(&order(h.account_id, "tv:kill:1", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap();
    assert!(admitted.created);
}

#[tokio::test]
async fn test_daily_loss_limit_blocks_admission() {
    let h = harness().await;
    let current = h.config.load().await.unwrap();
    h.config
        .compare_and_swap(
            current.version,
            SystemConfigUpdate {
                daily_loss_limit: Some(100.0),
                ..SystemConfigUpdate::default()
            },
        )
        .await
        .unwrap();

    h.journal
        .append(&NewTransaction::new(h.account_id, TransactionType::Fee, -150.0))
        .await
        .unwrap();

    let err = h
        .ledger
        .submit(&order(h.account_id, "tv:loss:1", OrderSide::Buy, 65000.0, 0.01))
        .await
        .unwrap_err();
    match err {
        LedgerError::LossLimitBreached { window, loss, limit } => {
            assert_eq!(window, LossWindow::Daily);
            assert!((loss - 150.0).abs() < 1e-9);
            assert_eq!(limit, 100.0);
        }
        other => panic!("expected loss limit breach, got {:?}", other),
    }
    assert_eq!(h.outbox.count_by_status(OutboxStatus::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn test_stale_config_version_is_refused() {
    let h = harness().await;
    let current = h.config.load().await.unwrap();
    h.config.set_trading_enabled(false).await.unwrap();

    let stale = h
        .config
        .compare_and_swap(
            current.version,
            SystemConfigUpdate {
                trading_enabled: Some(true),
                ..SystemConfigUpdate::default()
            },
        )
        .await;
    assert!(stale.is_err());
    assert!(!h.config.load().await.unwrap().trading_enabled);
}

#[tokio::test]
async fn test_journal_rows_cannot_be_rewritten() {
    let h = harness().await;
    let entry = h
        .journal
        .append(&NewTransaction::new(h.account_id, TransactionType::Deposit, 1000.0))
        .await
        .unwrap();

    let update = sqlx::query("UPDATE transactions SET amount = 1.0 WHERE id = ?1")
        .bind(entry.id)
        .execute(&h.pool)
        .await
        .unwrap_err();
    assert!(matches!(
        LedgerError::from(update),
        LedgerError::AppendOnlyViolation { ref table } if table == "transactions"
    ));

    let delete = sqlx::query("DELETE FROM transactions WHERE id = ?1")
        .bind(entry.id)
        .execute(&h.pool)
        .await
        .unwrap_err();
    assert!(matches!(
        LedgerError::from(delete),
        LedgerError::AppendOnlyViolation { .. }
    ));

    let reversal = h.journal.reverse(entry.id, "typo").await.unwrap();
    assert_eq!(reversal.amount, -1000.0);
    assert_eq!(reversal.reverses_id, Some(entry.id));
    assert!(h.journal.balance(h.account_id).await.unwrap().abs() < 1e-9);
}
