//! Account reference data.

use chrono::Utc;
use tracing::{debug, error};

use super::models::AccountRecord;
use super::DbPool;
use crate::domain::errors::{is_unique_violation, LedgerError};

pub struct AccountRepository {
    pool: DbPool,
}

impl AccountRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create an account, or return the existing one with the same name.
    pub async fn create(&self, name: &str) -> Result<AccountRecord, LedgerError> {
        let inserted = sqlx::query_as::<_, AccountRecord>(
            r#"
            INSERT INTO accounts (name, created_at)
            VALUES (?1, ?2)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(record) => {
                debug!("Created account {} ({})", record.id, record.name);
                Ok(record)
            }
            Err(e) if is_unique_violation(&e) => {
                sqlx::query_as::<_, AccountRecord>("SELECT * FROM accounts WHERE name = ?1")
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(LedgerError::from)
            }
            Err(e) => {
                error!("Failed to create account {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, id: i64) -> Result<AccountRecord, LedgerError> {
        sqlx::query_as::<_, AccountRecord>("SELECT * FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::UnknownAccount(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    #[tokio::test]
    async fn test_create_is_idempotent_by_name() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = AccountRepository::new(pool);

        let first = repo.create("main").await.unwrap();
        let second = repo.create("main").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.base_currency, "USDT");

        assert_eq!(repo.get(first.id).await.unwrap().name, "main");
        assert!(matches!(
            repo.get(999).await,
            Err(LedgerError::UnknownAccount(999))
        ));
    }
}
