//! Domain Layer - Message shaping and access control.
//!
//! This layer contains the proxy's core decisions: how request bodies become
//! broker payloads, who may touch a queue, and how retry delays are computed.
//! Nothing here talks to the broker or the network.

/// Retry delay computation for subscriber pushes.
pub mod backoff;

/// The `X-Bunny-*` header namespace and pass-through filtering.
pub mod headers;

/// Identity registry and per-queue allowlist enforcement.
pub mod identity;

/// Binary and JSON payload parsing with optional JSON Schema validation.
pub mod payload;
