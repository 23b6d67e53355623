//! Inbound Dedupe Store and Webhook Intake Box
//!
//! `InboundDedupeStore` remembers which external idempotency keys have been seen.
//! `WebhookIntakeBox` keeps the raw copy of every received payload for audit, resolved
//! exactly once as parsed or errored by the adapter.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::models::{InboundAlertRecord, InboundDedupeRecord};
use super::DbPool;
use crate::domain::errors::IntakeError;

/// Result of `mark_seen`.
#[derive(Debug, Clone)]
pub struct SeenOutcome {
    pub record: InboundDedupeRecord,
    /// This call created the record.
    pub first_sighting: bool,
    /// The stored hash differs from the hash passed to this call.
    pub payload_drift: bool,
}

#[derive(Clone)]
pub struct InboundDedupeStore {
    pool: DbPool,
}

impl InboundDedupeStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record a sighting of `key`.
    ///
    /// The first call inserts the record. Later calls only advance `last_seen_at` (and
    /// the sighting counter); `first_seen_at`, `payload_hash` and `processed` keep their
    /// original values. A hash mismatch is logged and reported, never rejected.
    pub async fn mark_seen(
        &self,
        key: &str,
        payload_hash: &str,
        source: &str,
    ) -> Result<SeenOutcome, IntakeError> {
        self.mark_seen_at(key, payload_hash, source, Utc::now()).await
    }

    pub async fn mark_seen_at(
        &self,
        key: &str,
        payload_hash: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<SeenOutcome, IntakeError> {
        let record = sqlx::query_as::<_, InboundDedupeRecord>(
            r#"
            INSERT INTO inbound_dedupe_keys (
                idempotency_key, source, payload_hash, first_seen_at, last_seen_at,
                seen_count, processed
            )
            VALUES (?1, ?2, ?3, ?4, ?4, 1, 0)
            ON CONFLICT(idempotency_key) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                seen_count = inbound_dedupe_keys.seen_count + 1
            RETURNING *
            "#,
        )
        .bind(key)
        .bind(source)
        .bind(payload_hash)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let first_sighting = record.seen_count == 1;
        let payload_drift = record.payload_hash != payload_hash;

        if payload_drift {
            warn!(
                "Inbound key {} from {} reused with a different payload (stored {}, received {})",
                key, source, record.payload_hash, payload_hash
            );
        } else if !first_sighting {
            debug!("Inbound key {} seen {} times", key, record.seen_count);
        }

        Ok(SeenOutcome {
            record,
            first_sighting,
            payload_drift,
        })
    }

    /// Flag the key as having produced its effect.
    pub async fn mark_processed(&self, key: &str) -> Result<(), IntakeError> {
        sqlx::query(
            r#"
            UPDATE inbound_dedupe_keys
            SET processed = 1, processed_at = ?1
            WHERE idempotency_key = ?2 AND processed = 0
            "#,
        )
        .bind(Utc::now())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<InboundDedupeRecord>, IntakeError> {
        let record = sqlx::query_as::<_, InboundDedupeRecord>(
            "SELECT * FROM inbound_dedupe_keys WHERE idempotency_key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

/// Result of `receive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Stored(i64),
    /// The dedupe key was already taken; holds the earlier row's id.
    Duplicate(i64),
}

impl Received {
    pub fn id(&self) -> i64 {
        match self {
            Received::Stored(id) | Received::Duplicate(id) => *id,
        }
    }
}

#[derive(Clone)]
pub struct WebhookIntakeBox {
    pool: DbPool,
}

impl WebhookIntakeBox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Persist a raw payload. Absent dedupe keys never collide.
    pub async fn receive(
        &self,
        source: &str,
        payload: &str,
        payload_hash: &str,
        dedupe_key: Option<&str>,
    ) -> Result<Received, IntakeError> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO inbound_alerts (source, received_at, dedupe_key, payload, payload_hash, parsed)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(dedupe_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(source)
        .bind(Utc::now())
        .bind(dedupe_key)
        .bind(payload)
        .bind(payload_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = inserted {
            debug!("Stored inbound alert {} from {}", id, source);
            return Ok(Received::Stored(id));
        }

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM inbound_alerts WHERE dedupe_key = ?1")
            .bind(dedupe_key)
            .fetch_one(&self.pool)
            .await?;
        debug!("Inbound alert with key {:?} already stored as {}", dedupe_key, id);
        Ok(Received::Duplicate(id))
    }

    pub async fn mark_parsed(&self, id: i64) -> Result<(), IntakeError> {
        let rows = sqlx::query(
            r#"
            UPDATE inbound_alerts
            SET parsed = 1, resolved_at = ?1
            WHERE id = ?2 AND parsed = 0 AND error IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.check_resolved(id, rows).await
    }

    pub async fn mark_error(&self, id: i64, message: &str) -> Result<(), IntakeError> {
        let rows = sqlx::query(
            r#"
            UPDATE inbound_alerts
            SET error = ?1, resolved_at = ?2
            WHERE id = ?3 AND parsed = 0 AND error IS NULL
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.check_resolved(id, rows).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<InboundAlertRecord>, IntakeError> {
        let record = sqlx::query_as::<_, InboundAlertRecord>("SELECT * FROM inbound_alerts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn check_resolved(&self, id: i64, rows: u64) -> Result<(), IntakeError> {
        if rows > 0 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(_) => Err(IntakeError::AlertAlreadyResolved(id)),
            None => Err(IntakeError::UnknownAlert(id)),
        }
    }
}
