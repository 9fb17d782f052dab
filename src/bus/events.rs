//! Domain events carried on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the durable stream holding dead-lettered messages.
pub const DLQ_STREAM_NAME: &str = "DLQ";

/// Common surface of every published event.
pub trait Event {
    /// Subject the event is published to.
    fn topic(&self) -> &str;
}

/// Published when a listing transitions to ACTIVE, asking the search
/// indexer to pick it up. Consumers must be idempotent: the publish is
/// at-least-once relative to the DB transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexListingEvent {
    /// Unique event id.
    pub event_id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Subject the event is published to.
    pub topic: String,
    /// The newly activated listing.
    pub listing_id: String,
}

impl IndexListingEvent {
    /// Creates an event for a fresh activation.
    #[must_use]
    pub fn new(topic: impl Into<String>, listing_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            topic: topic.into(),
            listing_id: listing_id.into(),
        }
    }
}

impl Event for IndexListingEvent {
    fn topic(&self) -> &str {
        &self.topic
    }
}

/// Published to the DLQ stream when a message exhausts its delivery budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Unique event id.
    pub event_id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// The DLQ subject this event is published to (`dlq.<origin>`).
    pub topic: String,
    /// The decoded original payload, or a wrapper with the raw body when
    /// decoding failed.
    pub original_event: serde_json::Value,
    /// Why the message was dead-lettered.
    pub reason: String,
    /// The last handler error observed.
    pub latest_error: Option<String>,
}

impl DeadLetterEvent {
    /// Creates a dead-letter event for a message that arrived on
    /// `origin_subject`.
    #[must_use]
    pub fn new(
        origin_subject: &str,
        original_event: serde_json::Value,
        reason: impl Into<String>,
        latest_error: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            topic: dlq_subject(origin_subject),
            original_event,
            reason: reason.into(),
            latest_error,
        }
    }
}

impl Event for DeadLetterEvent {
    fn topic(&self) -> &str {
        &self.topic
    }
}

/// Maps an origin subject to its dead-letter subject.
#[must_use]
pub fn dlq_subject(origin_subject: &str) -> String {
    format!("dlq.{origin_subject}")
}

/// Decodes a raw payload for embedding in a [`DeadLetterEvent`], falling
/// back to a stringified wrapper when the payload is not valid JSON.
#[must_use]
pub fn dead_letter_payload(raw: &[u8]) -> serde_json::Value {
    match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(e) => serde_json::json!({
            "original_data": String::from_utf8_lossy(raw),
            "decode_error": e.to_string(),
        }),
    }
}
