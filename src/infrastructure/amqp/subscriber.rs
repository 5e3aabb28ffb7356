//! Push Subscriber
//!
//! A subscriber maintains a continuous, prefetch-bounded flow of deliveries
//! from one queue to one HTTP target. Each delivery becomes a POST with the
//! stored bytes and headers; a 2xx acks the message, anything else walks a
//! bounded retry ladder and finally nack-requeues so the broker redelivers.
//!
//! # Per-delivery state machine
//!
//! ```text
//! RECEIVED → POSTING → SUCCESS → ACK → done
//!                   → FAILURE → (attempt ≤ retries)? WAIT → POSTING
//!                                                  : NACK_REQUEUE → done
//! ```
//!
//! Retries for one delivery are strictly sequential; across deliveries up
//! to `prefetch` POSTs run concurrently with no ordering guarantee.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use lapin::Channel;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AmqpError, field_table_to_headers};
use crate::domain::backoff::{BackoffStrategy, backoff_delay};
use crate::domain::payload::OCTET_STREAM;
use crate::infrastructure::config::SubscriberEntry;
use crate::infrastructure::lifecycle::{CloseEvent, InFlightCounter};
use crate::infrastructure::metrics;

// =============================================================================
// Push Pipeline
// =============================================================================

/// A single push attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    /// The target answered outside 2xx.
    #[error("target answered status {0}")]
    Status(u16),

    /// The request did not complete within the deadline.
    #[error("push timed out")]
    Timeout,

    /// Connection-level failure.
    #[error("push failed: {0}")]
    Network(String),
}

/// Everything one delivery needs to become a POST.
#[derive(Debug, Clone)]
pub struct PushRequest {
    /// Where the delivery goes.
    pub target: reqwest::Url,
    /// Stored wire bytes.
    pub body: Bytes,
    /// Content type the message was published with.
    pub content_type: String,
    /// `correlation_id` property, if the publisher set one.
    pub correlation_id: Option<String>,
    /// Pass-through `X-Bunny-*` headers stored on the message.
    pub passthrough: Vec<(String, String)>,
    /// The broker's redelivered flag for *this* delivery; constant across
    /// the retry ladder, flips only on a fresh broker delivery.
    pub redelivered: bool,
}

/// Retry discipline for one subscriber.
#[derive(Debug, Clone, Copy)]
pub struct PushPolicy {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// How the delay between attempts grows.
    pub strategy: BackoffStrategy,
    /// Base delay between attempts.
    pub retry_delay: Duration,
}

/// Terminal result of the retry ladder for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The target accepted the delivery.
    Delivered {
        /// Attempts spent, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed; the delivery must be nack-requeued.
    Exhausted {
        /// Attempts spent.
        attempts: u32,
    },
    /// A hard stop cancelled the ladder mid-flight.
    Cancelled,
}

/// Run the retry ladder for one delivery.
///
/// Attempts are numbered from 1. After a failed attempt `a ≤ retries` the
/// ladder sleeps `backoff_delay(strategy, retry_delay, a)` and tries again;
/// the attempt after the last permitted retry ends in [`PushOutcome::Exhausted`].
/// Cancelling `cancel` aborts the in-flight POST or sleep immediately.
pub async fn push_with_retry(
    client: &reqwest::Client,
    request: &PushRequest,
    policy: &PushPolicy,
    cancel: &CancellationToken,
) -> PushOutcome {
    let mut attempt: u32 = 1;
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return PushOutcome::Cancelled,
            result = post_once(client, request, policy.timeout) => result,
        };

        match result {
            Ok(()) => return PushOutcome::Delivered { attempts: attempt },
            Err(error) => {
                tracing::warn!(
                    target = %request.target,
                    attempt,
                    error = %error,
                    "Push attempt failed"
                );
                if attempt > policy.retries {
                    return PushOutcome::Exhausted { attempts: attempt };
                }
                let delay = backoff_delay(policy.strategy, policy.retry_delay, attempt);
                tokio::select! {
                    () = cancel.cancelled() => return PushOutcome::Cancelled,
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

async fn post_once(
    client: &reqwest::Client,
    request: &PushRequest,
    timeout: Duration,
) -> Result<(), PushError> {
    let mut builder = client
        .post(request.target.clone())
        .timeout(timeout)
        .header("content-type", request.content_type.as_str())
        .header(
            "x-bunny-redelivered",
            if request.redelivered { "true" } else { "false" },
        );

    if let Some(correlation_id) = &request.correlation_id {
        builder = builder.header("x-bunny-correlationid", correlation_id.as_str());
    }
    for (name, value) in &request.passthrough {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder
        .body(request.body.clone())
        .send()
        .await
        .map_err(|error| {
            if error.is_timeout() {
                PushError::Timeout
            } else {
                PushError::Network(error.to_string())
            }
        })?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(PushError::Status(status.as_u16()))
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Lifecycle of a subscriber. `Stopped` is terminal for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Built but not yet consuming.
    Idle,
    /// Consuming deliveries.
    Running,
    /// Consumer cancelled, in-flight pushes finishing.
    Stopping,
    /// Pull loop exited.
    Stopped,
}

/// One queue's push loop.
pub struct Subscriber {
    queue: String,
    target: reqwest::Url,
    prefetch: u16,
    policy: PushPolicy,
    channel: Channel,
    http: reqwest::Client,
    state: parking_lot::RwLock<SubscriberState>,
    consumer_tag: parking_lot::Mutex<Option<String>>,
    in_flight: InFlightCounter,
    hard_cancel: CancellationToken,
    stopping: AtomicBool,
    close_tx: mpsc::UnboundedSender<CloseEvent>,
}

impl Subscriber {
    /// Build a subscriber from its configuration entry.
    ///
    /// # Errors
    ///
    /// Returns a message when the target URL does not parse or the HTTP
    /// client cannot be built; both are startup-fatal.
    pub fn new(
        entry: &SubscriberEntry,
        channel: Channel,
        close_tx: mpsc::UnboundedSender<CloseEvent>,
    ) -> Result<Self, String> {
        let target =
            reqwest::Url::parse(&entry.target).map_err(|e| format!("invalid target URL: {e}"))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            queue: entry.queue.clone(),
            target,
            prefetch: entry.prefetch,
            policy: PushPolicy {
                timeout: entry.timeout_duration(),
                retries: entry.retries,
                strategy: entry.backoff_strategy,
                retry_delay: entry.retry_delay_duration(),
            },
            channel,
            http,
            state: parking_lot::RwLock::new(SubscriberState::Idle),
            consumer_tag: parking_lot::Mutex::new(None),
            in_flight: InFlightCounter::new(),
            hard_cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            close_tx,
        })
    }

    /// The queue this subscriber consumes.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriberState {
        *self.state.read()
    }

    /// Number of deliveries currently in the push pipeline.
    #[must_use]
    pub fn in_flight_pushes(&self) -> i64 {
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

    /// Set the prefetch window, register the consumer, and spawn the pull
    /// loop.
    ///
    /// Subscribers are started one at a time so the per-consumer qos
    /// applies to the consumer registered right after it.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError`] when qos or consume registration fails.
    pub async fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>, AmqpError> {
        self.channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("bunny-rest-proxy-{}", self.queue);
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        *self.consumer_tag.lock() = Some(tag);
        *self.state.write() = SubscriberState::Running;

        tracing::info!(
            queue = %self.queue,
            target = %self.target,
            prefetch = self.prefetch,
            retries = self.policy.retries,
            backoff = self.policy.strategy.as_str(),
            "Subscriber started"
        );

        let this = Arc::clone(self);
        Ok(tokio::spawn(this.run(consumer)))
    }

    /// Cancel the subscriber.
    ///
    /// `hard = false` stops pulling new deliveries and lets in-flight
    /// pushes run to their natural end. `hard = true` additionally aborts
    /// in-flight pushes; their tags are nack-requeued. Calling `stop`
    /// again only ever escalates soft to hard.
    pub async fn stop(&self, hard: bool) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            if hard {
                self.hard_cancel.cancel();
            }
            return;
        }
        *self.state.write() = SubscriberState::Stopping;

        let tag = self.consumer_tag.lock().take();
        if let Some(tag) = tag {
            if let Err(error) = self
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                tracing::debug!(queue = %self.queue, error = %error, "basic.cancel failed");
            }
        }

        if hard {
            self.hard_cancel.cancel();
        }
        tracing::info!(queue = %self.queue, hard, "Subscriber stopping");
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>, mut consumer: lapin::Consumer) {
        while let Some(next) = consumer.next().await {
            match next {
                Ok(delivery) => {
                    // Claim the in-flight slot before spawning so the drain
                    // poll can never observe a delivery in limbo.
                    let slot = self.in_flight.track();
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _slot = slot;
                        this.handle_delivery(delivery).await;
                    });
                }
                Err(error) => {
                    tracing::error!(queue = %self.queue, error = %error, "Consumer stream error");
                    break;
                }
            }
        }

        if self.is_stopping() {
            tracing::info!(queue = %self.queue, "Subscriber pull loop drained");
        } else {
            // The broker closed our consumer underneath us.
            let _ = self.close_tx.send(CloseEvent::ConsumerEnded {
                queue: self.queue.clone(),
            });
        }
        *self.state.write() = SubscriberState::Stopped;
    }

    async fn handle_delivery(&self, mut delivery: Delivery) {
        let properties = &delivery.properties;
        let request = PushRequest {
            target: self.target.clone(),
            body: Bytes::from(std::mem::take(&mut delivery.data)),
            content_type: properties
                .content_type()
                .as_ref()
                .map_or_else(|| OCTET_STREAM.to_string(), |s| s.as_str().to_string()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            passthrough: field_table_to_headers(properties.headers().as_ref()),
            redelivered: delivery.redelivered,
        };

        let outcome = push_with_retry(&self.http, &request, &self.policy, &self.hard_cancel).await;

        match outcome {
            PushOutcome::Delivered { attempts } => {
                metrics::record_push(&self.queue, "delivered");
                tracing::debug!(queue = %self.queue, attempts, "Delivery pushed");
                if let Err(error) = delivery.acker.ack(BasicAckOptions::default()).await {
                    tracing::error!(queue = %self.queue, error = %error, "Failed to ack pushed delivery");
                }
            }
            PushOutcome::Exhausted { attempts } => {
                metrics::record_push(&self.queue, "requeued");
                tracing::warn!(
                    queue = %self.queue,
                    attempts,
                    "Push attempts exhausted, requeueing delivery"
                );
                self.nack_requeue(&delivery).await;
            }
            PushOutcome::Cancelled => {
                metrics::record_push(&self.queue, "cancelled");
                tracing::info!(queue = %self.queue, "Push cancelled, requeueing delivery");
                self.nack_requeue(&delivery).await;
            }
        }
    }

    async fn nack_requeue(&self, delivery: &Delivery) {
        let options = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        };
        if let Err(error) = delivery.acker.nack(options).await {
            tracing::error!(queue = %self.queue, error = %error, "Failed to nack delivery");
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("queue", &self.queue)
            .field("target", &self.target.as_str())
            .field("prefetch", &self.prefetch)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
