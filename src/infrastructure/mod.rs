//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete bindings of the domain logic to the broker, the HTTP surface,
//! configuration sources, and the process lifecycle.

/// AMQP connection pane, publishers, consumers, and push subscribers.
pub mod amqp;

/// Environment settings and the YAML route configuration.
pub mod config;

/// REST surface: router, handlers, and error mapping.
pub mod http;

/// Shutdown flags, in-flight accounting, and the drain coordinator.
pub mod lifecycle;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing subscriber setup.
pub mod telemetry;
