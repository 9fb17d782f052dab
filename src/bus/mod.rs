//! Event bus abstraction with at-least-once delivery and dead-lettering.
//!
//! The bus hands each delivery to a [`MessageHandler`]. A handler that
//! returns `Ok` has taken responsibility for the message (including manual
//! acks); a handler that returns `Err` signals a fault the adapter resolves
//! by redelivering, and after the delivery budget is spent, by publishing a
//! [`DeadLetterEvent`](events::DeadLetterEvent) and acking the original.

mod events;
mod memory;
mod nats;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use events::{DLQ_STREAM_NAME, DeadLetterEvent, Event, IndexListingEvent, dlq_subject};
pub use memory::{DeliveryReport, InMemoryEventBus};
pub use nats::NatsEventBus;

/// Default delay before the adapter redelivers after a handler fault.
pub const ADAPTER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default delivery budget before a message is dead-lettered.
pub const DEFAULT_MAX_DELIVER: u32 = 5;

/// Reason string attached to dead-letter events.
pub const DLQ_REASON_EXHAUSTED: &str = "Exceeded max delivery attempts";

/// Error type handlers may return to the bus adapter.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker rejected or failed an operation.
    #[error("bus error on {subject}: {message}")]
    Broker {
        /// The subject involved.
        subject: String,
        /// Broker-reported detail.
        message: String,
    },

    /// An event could not be serialized for publishing.
    #[error("failed to encode event for {subject}: {source}")]
    Encode {
        /// The subject involved.
        subject: String,
        /// The underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl BusError {
    /// Creates a broker error.
    pub fn broker(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// One delivered message with explicit acknowledgment controls.
#[async_trait]
pub trait IncomingMessage: Send + Sync {
    /// Raw payload bytes.
    fn payload(&self) -> &[u8];

    /// How many times the broker has delivered this message (1-based).
    fn delivery_count(&self) -> u64;

    /// Acknowledges the message, removing it from the stream.
    async fn ack(&self) -> Result<(), BusError>;

    /// Negatively acknowledges, asking for redelivery after `delay`.
    async fn nak(&self, delay: Duration) -> Result<(), BusError>;
}

/// Consumer callback registered through [`EventBus::subscribe`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery.
    async fn handle(&self, message: &dyn IncomingMessage) -> Result<(), HandlerError>;
}

/// Hook invoked when a message exhausts its delivery budget, before the
/// dead-letter event is published.
#[async_trait]
pub trait FailureHook: Send + Sync {
    /// Observes the exhausted message and the final error.
    async fn on_exhausted(&self, message: &dyn IncomingMessage, error: &HandlerError);
}

/// Subscription configuration.
#[derive(Default)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries outstanding at once; zero means
    /// broker default.
    pub max_in_flight: usize,
    /// When false, the adapter acks automatically after `Ok` returns.
    pub manual_ack: bool,
    /// Optional exhaustion observer.
    pub on_failure: Option<std::sync::Arc<dyn FailureHook>>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("max_in_flight", &self.max_in_flight)
            .field("manual_ack", &self.manual_ack)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Durable publish/subscribe seam consumed by the worker.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Durably publishes a payload; resolves only after the broker has
    /// persisted it.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Registers a competing consumer for a subject.
    async fn subscribe(
        &self,
        subject: &str,
        handler: std::sync::Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<(), BusError>;
}

/// Serializes and publishes a typed event to its own topic.
pub async fn publish_event<E: serde::Serialize + events::Event>(
    bus: &dyn EventBus,
    event: &E,
) -> Result<(), BusError> {
    let payload = serde_json::to_vec(event).map_err(|source| BusError::Encode {
        subject: event.topic().to_string(),
        source,
    })?;
    bus.publish(event.topic(), payload).await
}
