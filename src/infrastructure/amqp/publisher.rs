//! Queue Publisher
//!
//! Owns one queue's outbound path. A publisher parses the request body
//! through its route's payload parser, shapes AMQP properties from the
//! `X-Bunny-*` headers, and publishes on either the confirm channel
//! (awaiting the broker's verdict) or the shared regular channel
//! (fire-and-forget).

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{AmqpError, headers_to_field_table};
use crate::domain::identity::IdentityGuard;
use crate::domain::payload::{PayloadError, PayloadParser};
use crate::infrastructure::lifecycle::InFlightCounter;
use crate::infrastructure::metrics;

/// Publish failure, translated to a status code at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The request body failed the route's content discipline.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// The broker nacked or returned the message.
    #[error("broker rejected the publish: {0}")]
    Rejected(String),

    /// The channel failed while publishing.
    #[error("publish failed: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Result of an accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    /// Bytes handed to the broker after parsing/canonicalization.
    pub content_length_bytes: usize,
    /// Whether the broker confirmed this publish.
    pub confirmed: bool,
}

/// Proxy metadata extracted from the HTTP request by the router.
#[derive(Debug, Clone, Default)]
pub struct PublishHeaders {
    /// Request `Content-Type`, if any.
    pub content_type: Option<String>,
    /// `X-Bunny-CorrelationID`, if present.
    pub correlation_id: Option<String>,
    /// Remaining pass-through `X-Bunny-*` headers, lower-cased.
    pub passthrough: Vec<(String, String)>,
}

/// One queue's outbound path.
pub struct Publisher {
    queue: String,
    parser: PayloadParser,
    guard: IdentityGuard,
    channel: Channel,
    confirm: bool,
    // Present only for the shared regular channel.
    gate: Option<Arc<Mutex<()>>>,
    in_flight: InFlightCounter,
}

impl Publisher {
    /// Build a publisher over an already-open channel.
    #[must_use]
    pub fn new(
        queue: String,
        parser: PayloadParser,
        guard: IdentityGuard,
        channel: Channel,
        confirm: bool,
        gate: Option<Arc<Mutex<()>>>,
    ) -> Self {
        Self {
            queue,
            parser,
            guard,
            channel,
            confirm,
            gate,
            in_flight: InFlightCounter::new(),
        }
    }

    /// The queue this publisher serves.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The route's identity guard.
    #[must_use]
    pub fn guard(&self) -> &IdentityGuard {
        &self.guard
    }

    /// Number of publishes currently awaiting the broker.
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.in_flight.current()
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

    /// Parse, publish, and (for confirm routes) await the broker's verdict.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Payload`] when the body fails the route's parser.
    /// - [`PublishError::Rejected`] on a negative or returned confirm.
    /// - [`PublishError::Amqp`] when the channel fails synchronously.
    pub async fn send(
        &self,
        headers: &PublishHeaders,
        body: &[u8],
    ) -> Result<PublishReceipt, PublishError> {
        let payload = self
            .parser
            .parse_inbound(headers.content_type.as_deref(), body)?;
        let properties = self.build_properties(headers, payload.content_type());
        let content_length_bytes = payload.bytes.len();

        let _slot = self.in_flight.track();

        // The regular channel is shared with consumers; hold its gate for
        // the duration of the publish frame.
        let frame_lock = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };
        let confirm_future = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload.bytes,
                properties,
            )
            .await?;
        drop(frame_lock);

        if !self.confirm {
            tracing::debug!(queue = %self.queue, bytes = content_length_bytes, "Published without confirm");
            metrics::record_publish(&self.queue, "unconfirmed");
            return Ok(PublishReceipt {
                content_length_bytes,
                confirmed: false,
            });
        }

        match confirm_future.await? {
            Confirmation::Ack(None) => {
                tracing::debug!(queue = %self.queue, bytes = content_length_bytes, "Publish confirmed");
                metrics::record_publish(&self.queue, "confirmed");
                Ok(PublishReceipt {
                    content_length_bytes,
                    confirmed: true,
                })
            }
            Confirmation::Ack(Some(_returned)) => {
                metrics::record_publish(&self.queue, "rejected");
                Err(PublishError::Rejected(
                    "broker returned the message as unroutable".to_string(),
                ))
            }
            Confirmation::Nack(_) => {
                metrics::record_publish(&self.queue, "rejected");
                Err(PublishError::Rejected("broker nacked the message".to_string()))
            }
            Confirmation::NotRequested => {
                // Confirm channel without confirms means the pane was wired
                // wrong; refuse rather than lie about delivery.
                metrics::record_publish(&self.queue, "rejected");
                Err(PublishError::Rejected(
                    "confirm channel did not request confirms".to_string(),
                ))
            }
        }
    }

    fn build_properties(&self, headers: &PublishHeaders, content_type: &str) -> BasicProperties {
        let mut properties =
            BasicProperties::default().with_content_type(ShortString::from(content_type));

        if let Some(correlation_id) = &headers.correlation_id {
            properties =
                properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }

        if !headers.passthrough.is_empty() {
            properties = properties.with_headers(headers_to_field_table(&headers.passthrough));
        }

        properties
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("queue", &self.queue)
            .field("confirm", &self.confirm)
            .field("parser", &self.parser)
            .finish_non_exhaustive()
    }
}
