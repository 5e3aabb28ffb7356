//! API Error Mapping
//!
//! One error kind per failure class, each with a fixed status code and a
//! JSON body `{"error": KIND, "message": ...}`. Domain and broker errors
//! convert into these kinds at the handler boundary; nothing below the
//! router knows about status codes.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::identity::Forbidden;
use crate::domain::payload::PayloadError;
use crate::infrastructure::amqp::{ConsumeError, PublishError};
use crate::infrastructure::metrics;

static INTERNAL_ERROR_SEQ: AtomicU64 = AtomicU64::new(1);

/// A request failed; the variant decides the status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Request content type does not match the route. 415.
    #[error("{0}")]
    UnsupportedContentType(String),

    /// Body failed JSON parsing or schema validation. 400.
    #[error("{0}")]
    InvalidPayload(String),

    /// Identity check failed. 403.
    #[error("identity or token not accepted for this queue")]
    Forbidden,

    /// No route is configured for this queue name. 404.
    #[error("no route configured for queue '{0}'")]
    UnknownQueue(String),

    /// The queue had no message to hand out. 423.
    #[error("queue '{0}' is empty")]
    Empty(String),

    /// The broker refused or failed the publish. 502.
    #[error("{0}")]
    BrokerRejected(String),

    /// The proxy is draining and no longer accepts work. 503.
    #[error("proxy is shutting down")]
    ShuttingDown,

    /// Anything unexpected. 500, with a correlation id in the logs.
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    /// Stable kind tag used in bodies, logs, and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedContentType(_) => "UNSUPPORTED_CONTENT_TYPE",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::Forbidden => "FORBIDDEN",
            Self::UnknownQueue(_) => "UNKNOWN_QUEUE",
            Self::Empty(_) => "EMPTY",
            Self::BrokerRejected(_) => "BROKER_REJECTED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// The status code this kind maps to.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UnknownQueue(_) => StatusCode::NOT_FOUND,
            Self::Empty(_) => StatusCode::LOCKED,
            Self::BrokerRejected(_) => StatusCode::BAD_GATEWAY,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_http_error(self.kind());

        let message = if let Self::Internal(detail) = &self {
            // Clients get an opaque correlation id; the detail stays in the
            // logs.
            let correlation = INTERNAL_ERROR_SEQ.fetch_add(1, Ordering::Relaxed);
            tracing::error!(correlation, detail = %detail, "Internal error");
            format!("internal error (correlation {correlation})")
        } else {
            self.to_string()
        };

        (
            self.status(),
            Json(ErrorBody {
                error: self.kind(),
                message,
            }),
        )
            .into_response()
    }
}

impl From<Forbidden> for ApiError {
    fn from(_: Forbidden) -> Self {
        Self::Forbidden
    }
}

impl From<PayloadError> for ApiError {
    fn from(error: PayloadError) -> Self {
        match error {
            PayloadError::UnsupportedContentType { .. } => {
                Self::UnsupportedContentType(error.to_string())
            }
            PayloadError::InvalidPayload(_) | PayloadError::SchemaViolation(_) => {
                Self::InvalidPayload(error.to_string())
            }
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(error: PublishError) -> Self {
        match error {
            PublishError::Payload(payload) => payload.into(),
            PublishError::Rejected(detail) => Self::BrokerRejected(detail),
            PublishError::Amqp(amqp) => {
                Self::BrokerRejected(format!("channel error during publish: {amqp}"))
            }
        }
    }
}

impl From<ConsumeError> for ApiError {
    fn from(error: ConsumeError) -> Self {
        match error {
            ConsumeError::Amqp(amqp) => Self::Internal(amqp.to_string()),
        }
    }
}
