//! Notification outbox worker.
//!
//! One cycle: lease a batch, then for each entry renew its lease, deliver it outside of
//! any transaction and write the result back under the lease. Several workers can run
//! against the same database; the lease keeps them off each other's rows, and an entry
//! whose lease was taken over mid-batch is skipped rather than delivered twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{DeliveryError, ErrorCategory, OutboxError};
use crate::domain::repositories::notification_transport::NotificationTransport;
use crate::domain::services::backoff::{RetryDecision, DEFAULT_MAX_FAIL_COUNT};
use crate::persistence::models::OutboxRecord;
use crate::persistence::outbox::NotificationOutbox;
use crate::task_runner::{run_with_circuit_breaker, CircuitBreakerConfig, TaskError};

/// Outbox worker settings
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Failed attempts after which an entry becomes FAILED
    pub max_fail_count: i64,
    /// Entries leased per cycle
    pub batch_size: i64,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub delivery_timeout: Duration,
    /// Number of concurrent workers the binary starts
    pub workers: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_fail_count: DEFAULT_MAX_FAIL_COUNT,
            batch_size: 10,
            lease_duration: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(10),
            workers: 1,
        }
    }
}

impl OutboxConfig {
    /// Load from `OUTBOX_*` environment variables; invalid values keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = parse_positive::<i64>("OUTBOX_MAX_FAIL_COUNT") {
            config.max_fail_count = value;
        }
        if let Some(value) = parse_positive::<i64>("OUTBOX_BATCH_SIZE") {
            config.batch_size = value;
        }
        if let Some(secs) = parse_positive::<u64>("OUTBOX_LEASE_SECS") {
            config.lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive::<u64>("OUTBOX_POLL_INTERVAL_SECS") {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive::<u64>("OUTBOX_DELIVERY_TIMEOUT_SECS") {
            config.delivery_timeout = Duration::from_secs(secs);
        }
        if let Some(workers) = parse_positive::<usize>("OUTBOX_WORKERS") {
            config.workers = workers;
        }

        config.ensure_lease_covers_delivery();
        config
    }

    /// Each entry's lease is renewed right before its delivery, so one delivery
    /// timeout must fit inside one lease. A shorter lease is stretched to twice the
    /// timeout.
    pub fn ensure_lease_covers_delivery(&mut self) {
        if self.delivery_timeout >= self.lease_duration {
            let stretched = self.delivery_timeout * 2;
            warn!(
                "OUTBOX_LEASE_SECS ({:?}) does not cover OUTBOX_DELIVERY_TIMEOUT_SECS ({:?}); using a {:?} lease",
                self.lease_duration, self.delivery_timeout, stretched
            );
            self.lease_duration = stretched;
        }
    }
}

fn parse_positive<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        Ok(value) => {
            warn!("Invalid {} value: {} (must be positive), using default", name, value);
            None
        }
        Err(e) => {
            warn!("Failed to parse {} '{}': {}, using default", name, raw, e);
            None
        }
    }
}

/// Outcome counts of one worker cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub leased: usize,
    pub sent: usize,
    pub retried: usize,
    /// Entries that reached FAILED in this cycle.
    pub exhausted: Vec<i64>,
    /// Entries whose lease was taken over before the result was written.
    pub lost_leases: usize,
}

pub struct NotifyWorker {
    id: String,
    outbox: NotificationOutbox,
    transports: HashMap<String, Arc<dyn NotificationTransport>>,
    config: OutboxConfig,
}

impl NotifyWorker {
    pub fn new(outbox: NotificationOutbox, config: OutboxConfig) -> Self {
        Self {
            id: format!("notify-{:08x}", rand::random::<u32>()),
            outbox,
            transports: HashMap::new(),
            config,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Route entries of `transport.channel()` to `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn NotificationTransport>) -> Self {
        self.transports.insert(transport.channel().to_string(), transport);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, OutboxError> {
        self.run_cycle_with(Utc::now).await
    }

    /// Run one cycle with the clock frozen at `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, OutboxError> {
        self.run_cycle_with(move || now).await
    }

    /// Lease a batch, then renew, deliver and record each entry in turn. `clock` is
    /// read again for every entry so late entries in a slow batch get fresh leases
    /// and fresh backoff.
    async fn run_cycle_with<C>(&self, clock: C) -> Result<CycleReport, OutboxError>
    where
        C: Fn() -> DateTime<Utc>,
    {
        let lease_for = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let entries = self
            .outbox
            .lease(&self.id, self.config.batch_size, lease_for, clock())
            .await?;

        let mut report = CycleReport {
            leased: entries.len(),
            ..CycleReport::default()
        };

        for entry in &entries {
            if !self.outbox.renew_lease(entry.id, &self.id, lease_for, clock()).await? {
                report.lost_leases += 1;
                continue;
            }

            let delivered = self.deliver(entry).await;
            let now = clock();
            match delivered {
                Ok(()) => {
                    if self.outbox.mark_sent(entry.id, &self.id, now).await? {
                        debug!("Outbox entry {} sent to {}:{}", entry.id, entry.channel, entry.target);
                        report.sent += 1;
                    } else {
                        report.lost_leases += 1;
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    match self
                        .outbox
                        .record_failure(entry, &self.id, &reason, self.config.max_fail_count, now)
                        .await?
                    {
                        Some(RetryDecision::RetryAt {
                            fail_count,
                            send_after,
                        }) => {
                            warn!(
                                "[{}] Outbox entry {} delivery failed ({}/{}): {}; retry after {}",
                                err.category(),
                                entry.id,
                                fail_count,
                                self.config.max_fail_count,
                                reason,
                                send_after
                            );
                            report.retried += 1;
                        }
                        Some(RetryDecision::GiveUp { fail_count }) => {
                            error!(
                                "[{}] Outbox entry {} ({} '{}' to {}:{}) FAILED after {} attempts: {}",
                                ErrorCategory::IntegrityExhaustion,
                                entry.id,
                                entry.severity,
                                entry.title,
                                entry.channel,
                                entry.target,
                                fail_count,
                                reason
                            );
                            report.exhausted.push(entry.id);
                        }
                        None => report.lost_leases += 1,
                    }
                }
            }
        }

        if report.leased > 0 {
            info!(
                "{}: leased {}, sent {}, retrying {}, failed {}",
                self.id,
                report.leased,
                report.sent,
                report.retried,
                report.exhausted.len()
            );
        }
        Ok(report)
    }

    async fn deliver(&self, entry: &OutboxRecord) -> Result<(), DeliveryError> {
        let transport = self
            .transports
            .get(&entry.channel)
            .ok_or_else(|| DeliveryError::NoTransport(entry.channel.clone()))?;

        match tokio::time::timeout(
            self.config.delivery_timeout,
            transport.send(&entry.target, &entry.title, &entry.body),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.config.delivery_timeout)),
        }
    }

    /// Poll until `shutdown` flips, under the circuit breaker.
    pub async fn run(
        &self,
        breaker: CircuitBreakerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TaskError> {
        info!("Notification worker {} started", self.id);
        run_with_circuit_breaker(&self.id, breaker, self.config.poll_interval, shutdown, move || async move {
            self.run_cycle().await.map(|_| ()).map_err(|e| e.to_string())
        })
        .await
    }
}
