//! Deterministic in-memory event bus.
//!
//! Mirrors the NATS adapter's delivery semantics (delivery counting,
//! handler-fault redelivery, dead-lettering after the budget is spent)
//! without a broker or timers. `deliver` drives one message through every
//! redelivery synchronously and reports what happened, which is what the
//! end-to-end tests assert against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::events::{DeadLetterEvent, dead_letter_payload};
use super::{
    ADAPTER_RETRY_DELAY, BusError, DEFAULT_MAX_DELIVER, DLQ_REASON_EXHAUSTED, EventBus,
    IncomingMessage, MessageHandler, SubscribeOptions, publish_event,
};

struct Subscription {
    handler: Arc<dyn MessageHandler>,
    options: SubscribeOptions,
}

#[derive(Default)]
struct BusState {
    published: Vec<(String, Vec<u8>)>,
    subscriptions: HashMap<String, Subscription>,
}

/// In-memory bus for tests, benches, and local mode.
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
    max_deliver: u32,
}

/// What happened while driving one message to resolution.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Number of times the handler saw the message.
    pub deliveries: u32,
    /// Whether the message ended acked (by the handler or the adapter).
    pub acked: bool,
    /// Whether the adapter dead-lettered the message.
    pub dead_lettered: bool,
    /// Redelivery delays requested via nak, in order.
    pub nak_delays: Vec<Duration>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELIVER)
    }
}

impl InMemoryEventBus {
    /// Creates a bus with the given delivery budget.
    #[must_use]
    pub fn new(max_deliver: u32) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            max_deliver,
        }
    }

    /// Events published so far as (subject, payload) pairs.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Published payloads on one subject, decoded as JSON.
    #[must_use]
    pub fn published_on(&self, subject: &str) -> Vec<serde_json::Value> {
        self.lock()
            .published
            .iter()
            .filter(|(s, _)| s == subject)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Drives one message through the subscribed handler, following naks
    /// and handler faults until the message is acked, dead-lettered, or the
    /// broker would stop redelivering.
    pub async fn deliver(&self, subject: &str, payload: &[u8]) -> DeliveryReport {
        let (handler, manual_ack, on_failure) = {
            let state = self.lock();
            let Some(subscription) = state.subscriptions.get(subject) else {
                warn!(subject, "deliver on subject with no subscription");
                return DeliveryReport::default();
            };
            (
                Arc::clone(&subscription.handler),
                subscription.options.manual_ack,
                subscription.options.on_failure.clone(),
            )
        };

        let mut report = DeliveryReport::default();

        for attempt in 1..=self.max_deliver {
            report.deliveries = attempt;
            let message = MemoryMessage::new(payload.to_vec(), u64::from(attempt));

            match handler.handle(&message).await {
                Ok(()) => {
                    if !manual_ack {
                        let _ = message.ack().await;
                    }
                    let disposition = message.disposition();
                    match disposition {
                        Disposition::Acked => {
                            report.acked = true;
                            return report;
                        }
                        Disposition::Naked(delay) => {
                            report.nak_delays.push(delay);
                            debug!(subject, attempt, "handler naked, redelivering");
                            continue;
                        }
                        Disposition::Unresolved => {
                            // Manual-ack handler that neither acked nor
                            // naked: the broker would redeliver after
                            // ack-wait.
                            continue;
                        }
                    }
                }
                Err(handler_error) => {
                    if u64::from(attempt) >= u64::from(self.max_deliver) {
                        if let Some(hook) = on_failure.as_ref() {
                            hook.on_exhausted(&message, &handler_error).await;
                        }
                        let event = DeadLetterEvent::new(
                            subject,
                            dead_letter_payload(payload),
                            DLQ_REASON_EXHAUSTED,
                            Some(handler_error.to_string()),
                        );
                        let _ = publish_event(self, &event).await;
                        let _ = message.ack().await;
                        report.acked = true;
                        report.dead_lettered = true;
                        return report;
                    }
                    report.nak_delays.push(ADAPTER_RETRY_DELAY);
                    warn!(subject, attempt, error = %handler_error, "handler fault, redelivering");
                }
            }
        }

        // Delivery budget spent without an ack: the broker stops
        // redelivering (handler-initiated naks do not dead-letter).
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.lock().published.push((subject.to_string(), payload));
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<(), BusError> {
        self.lock()
            .subscriptions
            .insert(subject.to_string(), Subscription { handler, options });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Unresolved,
    Acked,
    Naked(Duration),
}

/// One simulated delivery with recorded ack/nak disposition.
struct MemoryMessage {
    payload: Vec<u8>,
    delivery: u64,
    disposition: Mutex<Disposition>,
}

impl MemoryMessage {
    fn new(payload: Vec<u8>, delivery: u64) -> Self {
        Self {
            payload,
            delivery,
            disposition: Mutex::new(Disposition::Unresolved),
        }
    }

    fn disposition(&self) -> Disposition {
        match self.disposition.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_disposition(&self, disposition: Disposition) {
        if let Ok(mut guard) = self.disposition.lock() {
            // First resolution wins, like a broker ignoring a second ack.
            if *guard == Disposition::Unresolved {
                *guard = disposition;
            }
        }
    }
}

#[async_trait]
impl IncomingMessage for MemoryMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivery
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.set_disposition(Disposition::Acked);
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> Result<(), BusError> {
        self.set_disposition(Disposition::Naked(delay));
        Ok(())
    }
}
