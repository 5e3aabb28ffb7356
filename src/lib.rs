#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::too_many_lines,
        clippy::needless_pass_by_value
    )
)]

//! Bunny REST Proxy - HTTP to AMQP 0-9-1 Bridge
//!
//! A REST proxy that lets HTTP clients publish to, consume from, and receive
//! pushes out of RabbitMQ queues without speaking AMQP themselves.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Payload shaping and access control, no I/O
//!   - `payload`: binary/JSON message parsing with optional JSON Schema
//!   - `identity`: per-queue identity allowlists with constant-time tokens
//!   - `backoff`: retry delay computation
//!   - `headers`: the `X-Bunny-*` header namespace
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `amqp`: connection pane, publishers, consumers, push subscribers
//!   - `http`: axum router exposing the REST surface
//!   - `config`: environment settings and the YAML route file
//!   - `lifecycle`: shutdown flags, in-flight accounting, drain coordinator
//!   - `metrics`: Prometheus instrumentation
//!   - `telemetry`: tracing subscriber setup
//!
//! # Data Flow
//!
//! ```text
//! POST /publish/{q} ──► Router ──► Guard ──► Parser ──► Publisher ──► AMQP
//! GET  /consume/{q} ──► Router ──► Guard ──► Consumer ◄────────────── AMQP
//!                                  Subscriber ◄── deliveries ──────── AMQP
//!                                      └──► POST target URL (retry/backoff)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - payload, identity, and retry logic with no broker I/O.
pub mod domain;

/// Infrastructure layer - AMQP, HTTP, configuration, and lifecycle adapters.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::backoff::{BackoffStrategy, backoff_delay};
pub use domain::identity::{Forbidden, IdentityGuard, IdentityRegistry};
pub use domain::payload::{ContentKind, Payload, PayloadError, PayloadParser};

// Configuration
pub use infrastructure::config::{
    ConfigError, ConsumerEntry, FileConfig, IdentityEntry, ProxyConfig, PublisherEntry,
    SubscriberEntry,
};

// AMQP components
pub use infrastructure::amqp::{
    AmqpConnection, AmqpError, ConsumedMessage, Consumer, PublishError, PublishHeaders,
    PublishReceipt, Publisher, Subscriber, SubscriberState,
};

// HTTP surface (for integration tests)
pub use infrastructure::http::{AppState, ApiError, build_router};

// Lifecycle
pub use infrastructure::lifecycle::{
    CloseEvent, InFlightCounter, LifecycleCoordinator, ShutdownFlags, drain_in_flight,
};

// Push pipeline (for integration tests)
pub use infrastructure::amqp::subscriber::{
    PushError, PushOutcome, PushPolicy, PushRequest, push_with_retry,
};

// Telemetry + metrics
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::telemetry::init as init_telemetry;
