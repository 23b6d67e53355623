//! Notification Outbox
//!
//! Durable queue of messages waiting for delivery. Producers enqueue with an optional
//! dedupe key (first writer wins). Workers claim rows with a lease instead of a row
//! lock: one UPDATE stamps `lease_owner` and `lease_expires_at` on up to N eligible rows
//! and returns them. Rows carrying a live lease are skipped, never waited on. Results
//! are written back with a compare-and-swap on `lease_owner`, so a worker whose lease
//! expired cannot overwrite the bookkeeping of the worker that re-claimed the row.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::models::{NotificationTargetRecord, OutboxRecord};
use super::DbPool;
use crate::domain::entities::notification::{NewNotification, OutboxStatus, Severity};
use crate::domain::errors::OutboxError;
use crate::domain::services::backoff::{next_retry, RetryDecision};

#[derive(Clone)]
pub struct NotificationOutbox {
    pool: DbPool,
}

impl NotificationOutbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue a message and return its id. A colliding dedupe key returns the id of
    /// the entry that already holds it.
    pub async fn enqueue(&self, notification: &NewNotification) -> Result<i64, OutboxError> {
        let now = Utc::now();
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO notification_outbox (
                channel, target, severity, severity_rank, title, body, dedupe_key,
                status, fail_count, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', 0, ?8, ?8)
            ON CONFLICT(dedupe_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&notification.channel)
        .bind(&notification.target)
        .bind(notification.severity.as_str())
        .bind(notification.severity.rank())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.dedupe_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue notification '{}': {}", notification.title, e);
            OutboxError::Storage(e)
        })?;

        if let Some((id,)) = inserted {
            debug!(
                "Enqueued {} notification {} for {}:{}",
                notification.severity, id, notification.channel, notification.target
            );
            return Ok(id);
        }

        // Only a dedupe key collision makes the insert a no-op.
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM notification_outbox WHERE dedupe_key = ?1")
            .bind(&notification.dedupe_key)
            .fetch_one(&self.pool)
            .await?;
        debug!(
            "Notification with dedupe key {:?} already queued as {}",
            notification.dedupe_key, id
        );
        Ok(id)
    }

    /// Claim up to `limit` deliverable entries for `owner` until `now + lease_for`.
    ///
    /// Eligible: PENDING, past `send_after`, no live lease, and not filtered out by a
    /// registered target (disabled, or severity below its minimum). Oldest first.
    pub async fn lease(
        &self,
        owner: &str,
        limit: i64,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut leased = sqlx::query_as::<_, OutboxRecord>(
            r#"
            UPDATE notification_outbox
            SET lease_owner = ?1, lease_expires_at = ?2, updated_at = ?3
            WHERE id IN (
                SELECT o.id
                FROM notification_outbox o
                LEFT JOIN notification_targets t
                    ON t.channel = o.channel AND t.target = o.target
                WHERE o.status = 'PENDING'
                  AND (o.send_after IS NULL OR o.send_after <= ?3)
                  AND (o.lease_expires_at IS NULL OR o.lease_expires_at <= ?3)
                  AND (t.channel IS NULL OR (t.enabled = 1 AND o.severity_rank >= t.min_severity))
                ORDER BY o.created_at, o.id
                LIMIT ?4
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(now + lease_for)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        leased.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        if !leased.is_empty() {
            debug!("{} leased {} outbox entries", owner, leased.len());
        }
        Ok(leased)
    }

    /// Extend `owner`'s lease on one entry to `now + lease_for`. Returns `false` when
    /// the entry is no longer PENDING under `owner`; the caller must not deliver it.
    pub async fn renew_lease(
        &self,
        id: i64,
        owner: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let rows = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET lease_expires_at = ?1, updated_at = ?2
            WHERE id = ?3 AND lease_owner = ?4 AND status = 'PENDING'
            "#,
        )
        .bind(now + lease_for)
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            warn!("{} lost the lease on outbox entry {} before delivering it", owner, id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Mark a leased entry SENT. Returns `false` when the lease was lost meanwhile.
    pub async fn mark_sent(&self, id: i64, owner: &str, now: DateTime<Utc>) -> Result<bool, OutboxError> {
        let rows = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'SENT', sent_at = ?1, lease_owner = NULL, lease_expires_at = NULL,
                updated_at = ?1
            WHERE id = ?2 AND lease_owner = ?3 AND status = 'PENDING'
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            warn!("{} lost the lease on outbox entry {} before marking it sent", owner, id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Record a failed attempt on a leased entry: schedule the retry, or mark FAILED
    /// once `max_fail_count` is reached. `None` when the lease was lost meanwhile.
    pub async fn record_failure(
        &self,
        entry: &OutboxRecord,
        owner: &str,
        reason: &str,
        max_fail_count: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryDecision>, OutboxError> {
        let decision = next_retry(entry.fail_count, max_fail_count, now);
        let (fail_count, status, send_after) = match decision {
            RetryDecision::RetryAt {
                fail_count,
                send_after,
            } => (fail_count, OutboxStatus::Pending, Some(send_after)),
            RetryDecision::GiveUp { fail_count } => (fail_count, OutboxStatus::Failed, entry.send_after),
        };

        let rows = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = ?1, fail_count = ?2, send_after = ?3, last_error = ?4,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?5
            WHERE id = ?6 AND lease_owner = ?7 AND status = 'PENDING' AND fail_count = ?8
            "#,
        )
        .bind(status.as_str())
        .bind(fail_count)
        .bind(send_after)
        .bind(reason)
        .bind(now)
        .bind(entry.id)
        .bind(owner)
        .bind(entry.fail_count)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            warn!(
                "{} lost the lease on outbox entry {} before recording its failure",
                owner, entry.id
            );
            return Ok(None);
        }
        Ok(Some(decision))
    }

    pub async fn get(&self, id: i64) -> Result<Option<OutboxRecord>, OutboxError> {
        let record = sqlx::query_as::<_, OutboxRecord>("SELECT * FROM notification_outbox WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notification_outbox WHERE status = ?1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Register or update a delivery target's filter.
    pub async fn set_target(
        &self,
        channel: &str,
        target: &str,
        enabled: bool,
        min_severity: Severity,
    ) -> Result<NotificationTargetRecord, OutboxError> {
        let record = sqlx::query_as::<_, NotificationTargetRecord>(
            r#"
            INSERT INTO notification_targets (channel, target, enabled, min_severity, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(channel, target) DO UPDATE SET
                enabled = excluded.enabled,
                min_severity = excluded.min_severity,
                updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(channel)
        .bind(target)
        .bind(enabled)
        .bind(min_severity.rank())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!(
            "Notification target {}:{} enabled={} min_severity={}",
            channel, target, enabled, min_severity
        );
        Ok(record)
    }
}
