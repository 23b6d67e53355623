//! Versioned system configuration (kill switch and loss limits).
//!
//! A single row, updated only through compare-and-swap on `version`. Readers always go
//! to the database; there is no process-wide cached copy.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use super::models::SystemConfig;
use super::DbPool;
use crate::domain::errors::ConfigError;

/// Fields to change; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct SystemConfigUpdate {
    pub trading_enabled: Option<bool>,
    pub daily_loss_limit: Option<f64>,
    pub weekly_loss_limit: Option<f64>,
}

#[derive(Clone)]
pub struct SystemConfigStore {
    pool: DbPool,
}

impl SystemConfigStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self) -> Result<SystemConfig, ConfigError> {
        sqlx::query_as::<_, SystemConfig>(
            r#"
            SELECT version, trading_enabled, daily_loss_limit, weekly_loss_limit, updated_at
            FROM system_configuration
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ConfigError::Missing)
    }

    /// Apply `update` if the stored version still equals `expected_version`.
    pub async fn compare_and_swap(
        &self,
        expected_version: i64,
        update: SystemConfigUpdate,
    ) -> Result<SystemConfig, ConfigError> {
        let swapped = sqlx::query_as::<_, SystemConfig>(
            r#"
            UPDATE system_configuration
            SET version = version + 1,
                trading_enabled = COALESCE(?1, trading_enabled),
                daily_loss_limit = COALESCE(?2, daily_loss_limit),
                weekly_loss_limit = COALESCE(?3, weekly_loss_limit),
                updated_at = ?4
            WHERE id = 1 AND version = ?5
            RETURNING version, trading_enabled, daily_loss_limit, weekly_loss_limit, updated_at
            "#,
        )
        .bind(update.trading_enabled)
        .bind(update.daily_loss_limit)
        .bind(update.weekly_loss_limit)
        .bind(Utc::now())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        match swapped {
            Some(config) => {
                info!(
                    "System configuration v{} (trading_enabled={}, daily_loss_limit={}, weekly_loss_limit={})",
                    config.version,
                    config.trading_enabled,
                    config.daily_loss_limit,
                    config.weekly_loss_limit
                );
                Ok(config)
            }
            None => {
                let current = self.load().await?;
                warn!(
                    "System configuration CAS lost: expected v{}, found v{}",
                    expected_version, current.version
                );
                Err(ConfigError::VersionConflict {
                    expected: expected_version,
                    actual: current.version,
                })
            }
        }
    }

    /// Flip the kill switch against the current version.
    pub async fn set_trading_enabled(&self, enabled: bool) -> Result<SystemConfig, ConfigError> {
        let current = self.load().await?;
        self.compare_and_swap(
            current.version,
            SystemConfigUpdate {
                trading_enabled: Some(enabled),
                ..SystemConfigUpdate::default()
            },
        )
        .await
    }
}

/// Read the configuration row through a no-op write, so the surrounding transaction
/// holds the write lock and no CAS can land before it commits.
pub(crate) async fn lock_config_in(conn: &mut SqliteConnection) -> Result<SystemConfig, ConfigError> {
    sqlx::query_as::<_, SystemConfig>(
        r#"
        UPDATE system_configuration
        SET updated_at = updated_at
        WHERE id = 1
        RETURNING version, trading_enabled, daily_loss_limit, weekly_loss_limit, updated_at
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(ConfigError::Missing)
}
