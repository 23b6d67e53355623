//! Persistence Layer
//!
//! SQLite storage for the order ledger, the transaction journal, the notification
//! outbox and the inbound webhook tables. Async access through sqlx.
//!
//! # Integrity rules held by the schema
//!
//! - `ux_orders_idem_active`: one active (NEW / PARTIALLY_FILLED) order per
//!   (account, idempotency key).
//! - `ux_orders_exchange_id_active`: one active order per (exchange, exchange order id).
//! - `transactions` and `executions` reject UPDATE and DELETE from any caller.
//! - `notification_outbox.dedupe_key` and `inbound_alerts.dedupe_key` are unique when
//!   present; NULL keys never collide.
//! - `system_configuration` holds exactly one row (id = 1).
//!
//! Every timestamp is bound explicitly from `chrono::Utc` so that stored values share
//! one text encoding and compare lexically.

pub mod accounts;
pub mod inbound;
pub mod instruments;
pub mod journal;
pub mod models;
pub mod order_ledger;
pub mod outbox;
pub mod system_config;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

/// Initialize a pool with default settings for `database_url`.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    init_database_with(&DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    })
    .await
}

/// Initialize the database connection pool and run migrations.
///
/// `sqlite::memory:` gives every pool its own shared-cache in-memory database, which
/// is what the test suites use.
pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

    // Ensure data directory exists
    if !in_memory {
        if let Some(db_path) = config.url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "accounts",
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            base_currency TEXT NOT NULL DEFAULT 'USDT',
            created_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "instruments",
        r#"
        CREATE TABLE IF NOT EXISTS instruments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            exchange TEXT NOT NULL,
            symbol TEXT NOT NULL,
            trading_rules TEXT NOT NULL DEFAULT '{}',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            UNIQUE (exchange, symbol)
        )
        "#,
    ),
    (
        "orders",
        r#"
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            instrument_id INTEGER NOT NULL REFERENCES instruments(id),
            exchange TEXT NOT NULL,
            client_order_id TEXT NOT NULL UNIQUE,
            exchange_order_id TEXT,
            idempotency_key TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
            order_type TEXT NOT NULL CHECK(order_type IN ('market', 'limit')),
            status TEXT NOT NULL CHECK(status IN
                ('NEW', 'PARTIALLY_FILLED', 'FILLED', 'CANCELED', 'REJECTED', 'EXPIRED')),
            price REAL NOT NULL CHECK(price > 0),
            quantity REAL NOT NULL CHECK(quantity > 0),
            filled_quantity REAL NOT NULL DEFAULT 0,
            avg_fill_price REAL,
            stop_price REAL,
            take_profit_price REAL,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "ux_orders_idem_active",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_orders_idem_active
        ON orders(account_id, idempotency_key)
        WHERE status IN ('NEW', 'PARTIALLY_FILLED')
        "#,
    ),
    (
        "ux_orders_exchange_id_active",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_orders_exchange_id_active
        ON orders(exchange, exchange_order_id)
        WHERE status IN ('NEW', 'PARTIALLY_FILLED') AND exchange_order_id IS NOT NULL
        "#,
    ),
    (
        "idx_orders_account_status",
        "CREATE INDEX IF NOT EXISTS idx_orders_account_status ON orders(account_id, status)",
    ),
    (
        "executions",
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL REFERENCES orders(id),
            trade_id TEXT UNIQUE,
            price REAL NOT NULL CHECK(price > 0),
            quantity REAL NOT NULL CHECK(quantity > 0),
            fee REAL NOT NULL DEFAULT 0,
            executed_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "idx_executions_order",
        "CREATE INDEX IF NOT EXISTS idx_executions_order ON executions(order_id)",
    ),
    (
        "positions",
        r#"
        CREATE TABLE IF NOT EXISTS positions (
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            instrument_id INTEGER NOT NULL REFERENCES instruments(id),
            quantity REAL NOT NULL DEFAULT 0,
            average_entry_price REAL NOT NULL DEFAULT 0,
            initial_stop REAL,
            updated_at DATETIME NOT NULL,
            PRIMARY KEY (account_id, instrument_id)
        )
        "#,
    ),
    (
        "transactions",
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            transaction_type TEXT NOT NULL CHECK(transaction_type IN
                ('DEPOSIT', 'WITHDRAWAL', 'FILL', 'FEE', 'FUNDING',
                 'REALIZED_PNL', 'RISK_ACTION', 'ADJUSTMENT')),
            amount REAL NOT NULL,
            related_order_id INTEGER REFERENCES orders(id),
            instrument_id INTEGER REFERENCES instruments(id),
            quantity REAL,
            price REAL,
            reverses_id INTEGER REFERENCES transactions(id),
            note TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "idx_transactions_account_time",
        "CREATE INDEX IF NOT EXISTS idx_transactions_account_time ON transactions(account_id, created_at)",
    ),
    (
        "ux_transactions_single_reversal",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ux_transactions_single_reversal
        ON transactions(reverses_id)
        WHERE reverses_id IS NOT NULL
        "#,
    ),
    (
        "trg_transactions_no_update",
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_transactions_no_update
        BEFORE UPDATE ON transactions
        BEGIN
            SELECT RAISE(ABORT, 'transactions is append-only');
        END
        "#,
    ),
    (
        "trg_transactions_no_delete",
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_transactions_no_delete
        BEFORE DELETE ON transactions
        BEGIN
            SELECT RAISE(ABORT, 'transactions is append-only');
        END
        "#,
    ),
    (
        "trg_executions_no_update",
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_executions_no_update
        BEFORE UPDATE ON executions
        BEGIN
            SELECT RAISE(ABORT, 'executions is append-only');
        END
        "#,
    ),
    (
        "trg_executions_no_delete",
        r#"
        CREATE TRIGGER IF NOT EXISTS trg_executions_no_delete
        BEFORE DELETE ON executions
        BEGIN
            SELECT RAISE(ABORT, 'executions is append-only');
        END
        "#,
    ),
    (
        "notification_targets",
        r#"
        CREATE TABLE IF NOT EXISTS notification_targets (
            channel TEXT NOT NULL,
            target TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            min_severity INTEGER NOT NULL DEFAULT 0,
            updated_at DATETIME NOT NULL,
            PRIMARY KEY (channel, target)
        )
        "#,
    ),
    (
        "notification_outbox",
        r#"
        CREATE TABLE IF NOT EXISTS notification_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            target TEXT NOT NULL,
            severity TEXT NOT NULL CHECK(severity IN ('INFO', 'WARN', 'ERROR', 'CRITICAL')),
            severity_rank INTEGER NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            dedupe_key TEXT UNIQUE,
            status TEXT NOT NULL DEFAULT 'PENDING' CHECK(status IN ('PENDING', 'SENT', 'FAILED')),
            fail_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            send_after DATETIME,
            lease_owner TEXT,
            lease_expires_at DATETIME,
            sent_at DATETIME,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
    (
        "idx_outbox_pending",
        "CREATE INDEX IF NOT EXISTS idx_outbox_pending ON notification_outbox(status, send_after)",
    ),
    (
        "inbound_dedupe_keys",
        r#"
        CREATE TABLE IF NOT EXISTS inbound_dedupe_keys (
            idempotency_key TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            first_seen_at DATETIME NOT NULL,
            last_seen_at DATETIME NOT NULL,
            seen_count INTEGER NOT NULL DEFAULT 1,
            processed INTEGER NOT NULL DEFAULT 0,
            processed_at DATETIME
        )
        "#,
    ),
    (
        "inbound_alerts",
        r#"
        CREATE TABLE IF NOT EXISTS inbound_alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            received_at DATETIME NOT NULL,
            dedupe_key TEXT UNIQUE,
            payload TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            parsed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            resolved_at DATETIME
        )
        "#,
    ),
    (
        "system_configuration",
        r#"
        CREATE TABLE IF NOT EXISTS system_configuration (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            version INTEGER NOT NULL,
            trading_enabled INTEGER NOT NULL,
            daily_loss_limit REAL NOT NULL DEFAULT 0,
            weekly_loss_limit REAL NOT NULL DEFAULT 0,
            updated_at DATETIME NOT NULL
        )
        "#,
    ),
];

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    for (name, statement) in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create {}: {}", name, e)))?;
    }

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO system_configuration
            (id, version, trading_enabled, daily_loss_limit, weekly_loss_limit, updated_at)
        VALUES (1, 1, 1, 0, 0, ?1)
        "#,
    )
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to seed system_configuration: {}", e))
    })?;

    info!("✓ Database migrations completed");
    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradevault.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradevault.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let url = std::env::var("DATABASE_URL").unwrap_or(defaults.url);
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);
        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_queries);

        Self {
            url,
            max_connections,
            log_queries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (
                'accounts', 'instruments', 'orders', 'executions', 'positions',
                'transactions', 'notification_targets', 'notification_outbox',
                'inbound_dedupe_keys', 'inbound_alerts', 'system_configuration'
            )
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(result.0, 11);

        let triggers: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(triggers.0, 4);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        let rows: (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), MAX(version) FROM system_configuration")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(rows, (1, 1));
    }

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.url, "sqlite://data/tradevault.db");
        assert_eq!(config.max_connections, 5);
    }
}
