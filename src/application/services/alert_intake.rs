//! Alert intake pipeline.
//!
//! raw payload → dedupe sighting → intake box → parse/adapt → order ledger.
//! The raw payload is stored before anything can fail on its content, so every
//! received alert ends up either parsed or carrying its error. A redelivered alert
//! whose stored copy is still unresolved is processed again.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::domain::entities::instrument::InstrumentRef;
use crate::domain::entities::order::SubmitOrder;
use crate::domain::errors::{ErrorCategory, IntakeError};
use crate::domain::services::alert_adapter::{adapt_alert, parse_alert, AdapterSettings};
use crate::persistence::inbound::{InboundDedupeStore, Received, WebhookIntakeBox};
use crate::persistence::order_ledger::OrderLedger;

/// What happened to one inbound alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntakeOutcome {
    /// The ledger holds an active order for the alert. `created` is false when the
    /// ledger answered with an order that already carried the idempotency key.
    Accepted {
        alert_id: i64,
        order_id: i64,
        client_order_id: String,
        created: bool,
    },
    /// The same dedupe key was received and resolved before; nothing was done.
    Duplicate { alert_id: i64 },
    /// The payload could not be parsed or adapted.
    Invalid { alert_id: i64, reason: String },
    /// The ledger refused the order (validation, admission, unknown instrument).
    Rejected {
        alert_id: i64,
        code: String,
        reason: String,
    },
}

/// SHA-256 of the raw payload, lowercase hex.
pub fn payload_hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Pull `idempotency_key` out of a payload without requiring the rest to be valid.
fn extract_key(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("idempotency_key")?
        .as_str()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct AlertIntakeService {
    dedupe: InboundDedupeStore,
    intake: WebhookIntakeBox,
    ledger: OrderLedger,
    account_id: i64,
    adapter: AdapterSettings,
}

impl AlertIntakeService {
    /// Orders from alerts are submitted for `account_id`.
    pub fn new(
        dedupe: InboundDedupeStore,
        intake: WebhookIntakeBox,
        ledger: OrderLedger,
        account_id: i64,
        adapter: AdapterSettings,
    ) -> Self {
        Self {
            dedupe,
            intake,
            ledger,
            account_id,
            adapter,
        }
    }

    /// Run one raw payload through the pipeline.
    ///
    /// # Errors
    /// Only storage failures surface as `Err`; everything the payload itself causes is
    /// an `IntakeOutcome`.
    pub async fn ingest(&self, source: &str, raw: &str) -> Result<IntakeOutcome, IntakeError> {
        let hash = payload_hash(raw);
        let key = extract_key(raw);

        if let Some(key) = key.as_deref() {
            self.dedupe.mark_seen(key, &hash, source).await?;
        }

        let alert_id = match self.intake.receive(source, raw, &hash, key.as_deref()).await? {
            Received::Stored(id) => id,
            Received::Duplicate(id) => {
                let stored = self.intake.get(id).await?.ok_or(IntakeError::UnknownAlert(id))?;
                if stored.parsed || stored.error.is_some() {
                    info!("Duplicate alert from {} (key {:?}), stored as {}", source, key, id);
                    return Ok(IntakeOutcome::Duplicate { alert_id: id });
                }
                // Stored but never resolved: the earlier attempt died part-way
                warn!("Alert {} from {} (key {:?}) was never resolved, processing it again", id, source, key);
                id
            }
        };

        self.process(alert_id, source, raw).await
    }

    /// Parse, adapt and submit a stored alert, then resolve it. Submitting is
    /// idempotent on the alert's key, so running this twice for one alert is safe.
    async fn process(&self, alert_id: i64, source: &str, raw: &str) -> Result<IntakeOutcome, IntakeError> {
        let decision = match parse_alert(raw).and_then(|alert| adapt_alert(&alert, &self.adapter)) {
            Ok(decision) => decision,
            Err(e) => {
                let reason = e.to_string();
                warn!("Alert {} from {} is invalid: {}", alert_id, source, reason);
                settled(self.intake.mark_error(alert_id, &reason).await)?;
                return Ok(IntakeOutcome::Invalid { alert_id, reason });
            }
        };

        let order = SubmitOrder {
            account_id: self.account_id,
            instrument: InstrumentRef::new(decision.exchange.clone(), decision.symbol.clone()),
            idempotency_key: decision.idempotency_key.clone(),
            side: decision.side,
            order_type: decision.order_type,
            price: decision.price,
            quantity: decision.quantity,
            stop_price: decision.stop_loss,
            take_profit_price: decision.take_profit,
        };

        match self.ledger.submit(&order).await {
            Ok(outcome) => {
                settled(self.intake.mark_parsed(alert_id).await)?;
                self.dedupe.mark_processed(&decision.idempotency_key).await?;
                Ok(IntakeOutcome::Accepted {
                    alert_id,
                    order_id: outcome.order_id,
                    client_order_id: outcome.client_order_id,
                    created: outcome.created,
                })
            }
            Err(e) if e.category() == ErrorCategory::Storage => {
                // Left unresolved so a redelivery of the alert runs it again
                error!("Alert {} could not be submitted: {}", alert_id, e);
                Err(IntakeError::Ledger(e))
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    "[{}] Alert {} rejected by the ledger: {}",
                    e.category(),
                    alert_id,
                    reason
                );
                settled(self.intake.mark_error(alert_id, &reason).await)?;
                Ok(IntakeOutcome::Rejected {
                    alert_id,
                    code: e.error_code().to_string(),
                    reason,
                })
            }
        }
    }
}

/// A concurrent delivery of the same alert may resolve it first with the same result.
fn settled(result: Result<(), IntakeError>) -> Result<(), IntakeError> {
    match result {
        Err(IntakeError::AlertAlreadyResolved(id)) => {
            debug!("Alert {} was already resolved by a concurrent delivery", id);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::instrument::TradingRules;
    use crate::domain::entities::notification::AlertRoute;
    use crate::persistence::accounts::AccountRepository;
    use crate::persistence::instruments::InstrumentRegistry;
    use crate::persistence::outbox::NotificationOutbox;
    use crate::persistence::{init_database, DbPool};

    async fn setup() -> (DbPool, AlertIntakeService) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let account = AccountRepository::new(pool.clone()).create("tv").await.unwrap();
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

        let ledger = OrderLedger::new(
            pool.clone(),
            NotificationOutbox::new(pool.clone()),
            AlertRoute::new("telegram", "ops"),
        );
        let service = AlertIntakeService::new(
            InboundDedupeStore::new(pool.clone()),
            WebhookIntakeBox::new(pool.clone()),
            ledger,
            account.id,
            AdapterSettings::default(),
        );
        (pool, service)
    }

    #[test]
    fn test_payload_hash_is_sha256_hex() {
        assert_eq!(
            payload_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_extract_key_tolerates_partial_payloads() {
        assert_eq!(
            extract_key(r#"{"idempotency_key":"k1","qty":"oops"}"#).as_deref(),
            Some("k1")
        );
        assert_eq!(extract_key(r#"{"idempotency_key":"  "}"#), None);
        assert_eq!(extract_key("not json"), None);
    }

    #[tokio::test]
    async fn test_valid_alert_creates_order_once() {
        let (_pool, service) = setup().await;
        let raw = r#"{"symbol":"BTCUSDT","side":"buy","qty":0.01,"price":65000.0,"idempotency_key":"tv:abc:1"}"#;

        let first = service.ingest("tradingview", raw).await.unwrap();
        let alert_id = match &first {
            IntakeOutcome::Accepted { alert_id, created, .. } => {
                assert!(*created);
                *alert_id
            }
            other => panic!("expected accepted, got {:?}", other),
        };

        let second = service.ingest("tradingview", raw).await.unwrap();
        assert_eq!(second, IntakeOutcome::Duplicate { alert_id });

        let seen = service.dedupe.get("tv:abc:1").await.unwrap().unwrap();
        assert_eq!(seen.seen_count, 2);
        assert!(seen.processed);
        assert_eq!(service.ledger.count_active(service.account_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_kept_with_error() {
        let (_pool, service) = setup().await;

        let outcome = service.ingest("tradingview", "{not json").await.unwrap();
        let alert_id = match outcome {
            IntakeOutcome::Invalid { alert_id, .. } => alert_id,
            other => panic!("expected invalid, got {:?}", other),
        };

        let stored = service.intake.get(alert_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, "{not json");
        assert!(!stored.parsed);
        assert!(stored.error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_unknown_instrument_is_rejected() {
        let (_pool, service) = setup().await;
        let raw = r#"{"symbol":"DOGEUSDT","side":"sell","qty":100,"price":0.1,"idempotency_key":"tv:doge:1"}"#;

        match service.ingest("tradingview", raw).await.unwrap() {
            IntakeOutcome::Rejected { code, alert_id, .. } => {
                assert_eq!(code, "ERR_UNKNOWN_INSTRUMENT");
                let stored = service.intake.get(alert_id).await.unwrap().unwrap();
                assert!(stored.error.is_some());
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        let seen = service.dedupe.get("tv:doge:1").await.unwrap().unwrap();
        assert!(!seen.processed);
    }

    #[tokio::test]
    async fn test_unresolved_alert_is_processed_on_redelivery() {
        let (_pool, service) = setup().await;
        let raw = r#"{"symbol":"BTCUSDT","side":"sell","qty":0.01,"price":65000.0,"idempotency_key":"tv:crash:1"}"#;

        // Stored by an attempt that never got to resolve it
        let stored = service
            .intake
            .receive("tradingview", raw, &payload_hash(raw), Some("tv:crash:1"))
            .await
            .unwrap()
            .id();

        match service.ingest("tradingview", raw).await.unwrap() {
            IntakeOutcome::Accepted { alert_id, created, .. } => {
                assert_eq!(alert_id, stored);
                assert!(created);
            }
            other => panic!("expected accepted, got {:?}", other),
        }
        assert!(service.intake.get(stored).await.unwrap().unwrap().parsed);

        assert_eq!(
            service.ingest("tradingview", raw).await.unwrap(),
            IntakeOutcome::Duplicate { alert_id: stored }
        );
        assert_eq!(service.ledger.count_active(service.account_id).await.unwrap(), 1);
    }
}
