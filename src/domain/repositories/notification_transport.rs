//! Notification Transport Trait
//!
//! Delivery seam between the outbox worker and a concrete chat API. The worker only
//! needs to know whether a send succeeded; everything else (formatting, retries,
//! timeouts) belongs to the worker.

use async_trait::async_trait;

use crate::domain::errors::DeliveryError;

pub type DeliveryResult = Result<(), DeliveryError>;

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Channel name this transport serves, e.g. `telegram`.
    fn channel(&self) -> &str;

    /// Deliver one message. Any `Err` counts as a failed attempt.
    async fn send(&self, target: &str, title: &str, body: &str) -> DeliveryResult;
}
