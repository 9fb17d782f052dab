//! NATS JetStream bus adapter.
//!
//! Subscriptions are durable push consumers in a delivery group, so the
//! broker load-balances messages across worker replicas and bounds the
//! number of unacknowledged deliveries. Redelivery bookkeeping (delivery
//! counting, dead-lettering) lives here so handlers only decide ok/err.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::consumer::push;
use async_nats::jetstream::{self, AckKind, stream};
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use super::events::{DLQ_STREAM_NAME, DeadLetterEvent, dead_letter_payload};
use super::{
    ADAPTER_RETRY_DELAY, BusError, DLQ_REASON_EXHAUSTED, EventBus, IncomingMessage,
    MessageHandler, SubscribeOptions, publish_event,
};

/// Broker-side redelivery window: how long a delivery may stay
/// unacknowledged before the broker hands it to another worker.
const ACK_WAIT: Duration = Duration::from_secs(60);

/// Retention for dead-lettered messages.
const DLQ_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// JetStream-backed event bus.
pub struct NatsEventBus {
    jetstream: jetstream::Context,
    stream_name: String,
    durable_name: String,
    queue_group: String,
    max_deliver: u32,
}

impl NatsEventBus {
    /// Creates a bus over an established NATS connection.
    ///
    /// * `stream_name` - the stream carrying ingress subjects.
    /// * `durable_name` - per-deployment consumer identity.
    /// * `queue_group` - delivery group shared by worker replicas.
    /// * `max_deliver` - delivery budget before dead-lettering.
    #[must_use]
    pub fn new(
        client: async_nats::Client,
        stream_name: impl Into<String>,
        durable_name: impl Into<String>,
        queue_group: impl Into<String>,
        max_deliver: u32,
    ) -> Self {
        Self {
            jetstream: jetstream::new(client),
            stream_name: stream_name.into(),
            durable_name: durable_name.into(),
            queue_group: queue_group.into(),
            max_deliver,
        }
    }

    /// Creates the DLQ stream if it does not exist yet. Safe to call from
    /// every subscriber.
    pub async fn ensure_dlq_stream(&self) -> Result<(), BusError> {
        self.jetstream
            .get_or_create_stream(stream::Config {
                name: DLQ_STREAM_NAME.to_string(),
                subjects: vec!["dlq.>".to_string()],
                storage: stream::StorageType::File,
                retention: stream::RetentionPolicy::Limits,
                max_age: DLQ_MAX_AGE,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::broker("dlq.>", e.to_string()))?;
        debug!("DLQ stream verified");
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &NatsIncomingMessage,
        subject: &str,
        error: &super::HandlerError,
        on_failure: Option<&Arc<dyn super::FailureHook>>,
    ) {
        error!(
            subject,
            max_deliver = self.max_deliver,
            error = %error,
            "message exceeded max delivery attempts, dead-lettering"
        );

        if let Some(hook) = on_failure {
            hook.on_exhausted(message, error).await;
        }

        let event = DeadLetterEvent::new(
            subject,
            dead_letter_payload(message.payload()),
            DLQ_REASON_EXHAUSTED,
            Some(error.to_string()),
        );
        if let Err(publish_err) = publish_event(self, &event).await {
            // The message stays acked either way; losing the DLQ copy is
            // logged loudly rather than looping the poison message forever.
            error!(error = %publish_err, "failed to publish dead-letter event");
        }

        if let Err(ack_err) = message.ack().await {
            warn!(error = %ack_err, "failed to ack dead-lettered message");
        }
    }
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::broker(subject, e.to_string()))?;
        // Wait for the stream's persistence acknowledgment.
        ack.await
            .map_err(|e| BusError::broker(subject, e.to_string()))?;
        debug!(subject, "published event");
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<(), BusError> {
        self.ensure_dlq_stream().await?;

        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::broker(subject, e.to_string()))?;

        let deliver_subject = format!("delivery.{}", self.durable_name);
        let consumer = stream
            .create_consumer(push::Config {
                durable_name: Some(self.durable_name.clone()),
                deliver_subject: deliver_subject.clone(),
                deliver_group: Some(self.queue_group.clone()),
                filter_subject: subject.to_string(),
                max_ack_pending: options.max_in_flight as i64,
                ack_policy: AckPolicy::Explicit,
                ack_wait: ACK_WAIT,
                max_deliver: i64::from(self.max_deliver),
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::broker(subject, e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::broker(subject, e.to_string()))?;

        info!(
            subject,
            durable = %self.durable_name,
            queue = %self.queue_group,
            max_in_flight = options.max_in_flight,
            "subscribed"
        );

        let bus = self.clone_for_dispatch();
        let subject = subject.to_string();
        let manual_ack = options.manual_ack;
        let on_failure = options.on_failure;

        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "error receiving from consumer stream");
                        continue;
                    }
                };

                let handler = Arc::clone(&handler);
                let bus = bus.clone_for_dispatch();
                let subject = subject.clone();
                let on_failure = on_failure.clone();

                // Dispatch on a task so the broker's in-flight window, not
                // this loop, is the delivery throttle.
                tokio::spawn(async move {
                    let incoming = NatsIncomingMessage::new(message);
                    match handler.handle(&incoming).await {
                        Ok(()) => {
                            if !manual_ack {
                                if let Err(e) = incoming.ack().await {
                                    warn!(error = %e, "auto-ack failed");
                                }
                            }
                        }
                        Err(handler_error) => {
                            if incoming.delivery_count() >= u64::from(bus.max_deliver) {
                                bus.dead_letter(
                                    &incoming,
                                    &subject,
                                    &handler_error,
                                    on_failure.as_ref(),
                                )
                                .await;
                            } else {
                                warn!(
                                    subject = %subject,
                                    attempt = incoming.delivery_count(),
                                    error = %handler_error,
                                    "handler failed, requesting redelivery"
                                );
                                if let Err(e) = incoming.nak(ADAPTER_RETRY_DELAY).await {
                                    warn!(error = %e, "nak failed");
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(())
    }
}

impl NatsEventBus {
    /// Cheap handle for dispatch tasks; the JetStream context is itself a
    /// cloneable handle over the connection.
    fn clone_for_dispatch(&self) -> Self {
        Self {
            jetstream: self.jetstream.clone(),
            stream_name: self.stream_name.clone(),
            durable_name: self.durable_name.clone(),
            queue_group: self.queue_group.clone(),
            max_deliver: self.max_deliver,
        }
    }
}

/// One JetStream delivery exposed through the bus-neutral trait.
struct NatsIncomingMessage {
    message: jetstream::Message,
}

impl NatsIncomingMessage {
    fn new(message: jetstream::Message) -> Self {
        Self { message }
    }
}

#[async_trait]
impl IncomingMessage for NatsIncomingMessage {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_count(&self) -> u64 {
        self.message
            .info()
            .map(|info| info.delivered.max(0) as u64)
            .unwrap_or(1)
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::broker(self.message.subject.as_str(), e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BusError::broker(self.message.subject.as_str(), e.to_string()))
    }
}
