//! Single-Get Consumer
//!
//! On-demand pull of exactly one message per HTTP request. The delivery is
//! acked only after the response value has been materialized; if the ack
//! then fails, the broker will redeliver, the client already has the body,
//! and the path degrades to at-least-once rather than losing the message.

use lapin::Channel;
use lapin::options::{BasicAckOptions, BasicGetOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{AmqpError, field_table_to_headers};
use crate::domain::identity::IdentityGuard;
use crate::domain::payload::OCTET_STREAM;
use crate::infrastructure::metrics;

/// Consume failure, translated to a status code at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The broker failed the `basic.get`.
    #[error("basic.get failed: {0}")]
    Amqp(#[from] lapin::Error),
}

/// A message pulled off a queue, shaped for the HTTP response.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    /// Stored wire bytes.
    pub body: Vec<u8>,
    /// Content type the message was published with.
    pub content_type: String,
    /// `correlation_id` property, if the publisher set one.
    pub correlation_id: Option<String>,
    /// Pass-through `X-Bunny-*` headers stored on the message.
    pub headers: Vec<(String, String)>,
    /// Broker-reported count of messages left on the queue.
    pub message_count: u32,
    /// Whether the broker had delivered this message before.
    pub redelivered: bool,
}

/// One queue's on-demand pull path.
pub struct Consumer {
    queue: String,
    guard: IdentityGuard,
    channel: Channel,
    gate: Arc<Mutex<()>>,
}

impl Consumer {
    /// Build a consumer over the shared regular channel.
    #[must_use]
    pub fn new(
        queue: String,
        guard: IdentityGuard,
        channel: Channel,
        gate: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            queue,
            guard,
            channel,
            gate,
        }
    }

    /// The queue this consumer serves.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The route's identity guard.
    #[must_use]
    pub fn guard(&self) -> &IdentityGuard {
        &self.guard
    }

    /// Passively assert that the queue exists on the broker.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::QueueMissing`] when the broker refuses the
    /// passive declare; the caller treats this as startup-fatal.
    pub async fn assert_queue(&self) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| AmqpError::QueueMissing {
                queue: self.queue.clone(),
                source,
            })?;
        Ok(())
    }

    /// Pull at most one message.
    ///
    /// Returns `Ok(None)` when the queue is empty. On a hit, the delivery
    /// is acked after the [`ConsumedMessage`] has been built; an ack
    /// failure is logged and the message is returned anyway.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Amqp`] when the `basic.get` itself fails.
    pub async fn consume_one(&self) -> Result<Option<ConsumedMessage>, ConsumeError> {
        let get_result = {
            // Shares the regular channel with non-confirm publishers.
            let _frame_lock = self.gate.lock().await;
            self.channel
                .basic_get(&self.queue, BasicGetOptions { no_ack: false })
                .await?
        };

        let Some(message) = get_result else {
            metrics::record_consume(&self.queue, "empty");
            return Ok(None);
        };

        let delivery = message.delivery;
        let properties = &delivery.properties;

        let consumed = ConsumedMessage {
            body: delivery.data.clone(),
            content_type: properties
                .content_type()
                .as_ref()
                .map_or_else(|| OCTET_STREAM.to_string(), |s| s.as_str().to_string()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            headers: field_table_to_headers(properties.headers().as_ref()),
            message_count: message.message_count,
            redelivered: delivery.redelivered,
        };

        if let Err(error) = delivery.acker.ack(BasicAckOptions::default()).await {
            // The client gets the body either way; the broker will simply
            // redeliver. At-least-once, not exactly-once.
            tracing::error!(
                queue = %self.queue,
                error = %error,
                "Failed to ack consumed message, broker will redeliver"
            );
        }

        metrics::record_consume(&self.queue, "delivered");
        tracing::debug!(
            queue = %self.queue,
            bytes = consumed.body.len(),
            remaining = consumed.message_count,
            "Consumed one message"
        );
        Ok(Some(consumed))
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
