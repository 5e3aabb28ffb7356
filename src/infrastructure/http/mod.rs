//! REST Surface
//!
//! Thin adapter binding URL paths to the publish, consume, and liveness
//! endpoints and translating domain errors into status codes.
//!
//! # Routes
//!
//! - `GET /` - liveness probe (always answers, even while draining)
//! - `GET /metrics` - Prometheus metrics (also exempt from the drain gate)
//! - `POST /publish/:queue` - publish one message, 201 on acceptance
//! - `GET /consume/:queue` - pull one message, 205 on delivery
//!
//! Once `pending_shutdown` flips, publish and consume answer 503.

mod error;

pub use error::ApiError;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;

use crate::domain::headers;
use crate::infrastructure::amqp::{Consumer, PublishHeaders, Publisher};
use crate::infrastructure::lifecycle::ShutdownFlags;
use crate::infrastructure::metrics::get_metrics_handle;

/// Shared state behind every handler.
pub struct AppState {
    /// Publish routes by queue name.
    pub publishers: HashMap<String, Arc<Publisher>>,
    /// Consume routes by queue name.
    pub consumers: HashMap<String, Arc<Consumer>>,
    /// Process shutdown flags.
    pub flags: Arc<ShutdownFlags>,
}

/// Build the router over shared state.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/publish/:queue", post(publish_handler))
        .route("/consume/:queue", get(consume_handler))
        .with_state(state)
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "bunny-rest-proxy")
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if state.flags.is_pending() {
        return Err(ApiError::ShuttingDown);
    }

    let publisher = state
        .publishers
        .get(&queue)
        .ok_or_else(|| ApiError::UnknownQueue(queue.clone()))?;

    publisher.guard().authorize(
        header_str(&request_headers, headers::IDENTITY),
        header_str(&request_headers, headers::TOKEN),
    )?;

    let publish_headers = extract_publish_headers(&request_headers);
    let receipt = publisher.send(&publish_headers, &body).await?;

    Ok((StatusCode::CREATED, Json(receipt)).into_response())
}

async fn consume_handler(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    if state.flags.is_pending() {
        return Err(ApiError::ShuttingDown);
    }

    let consumer = state
        .consumers
        .get(&queue)
        .ok_or_else(|| ApiError::UnknownQueue(queue.clone()))?;

    consumer.guard().authorize(
        header_str(&request_headers, headers::IDENTITY),
        header_str(&request_headers, headers::TOKEN),
    )?;

    let message = consumer
        .consume_one()
        .await?
        .ok_or_else(|| ApiError::Empty(queue.clone()))?;

    let mut response_headers = HeaderMap::new();
    insert_header(&mut response_headers, CONTENT_TYPE.as_str(), &message.content_type);
    insert_header(
        &mut response_headers,
        headers::MESSAGE_COUNT,
        &message.message_count.to_string(),
    );
    if let Some(correlation_id) = &message.correlation_id {
        insert_header(&mut response_headers, headers::CORRELATION_ID, correlation_id);
    }
    for (name, value) in &message.headers {
        insert_header(&mut response_headers, name, value);
    }

    // 205 mirrors the queue's state change; kept for client compatibility.
    Ok((StatusCode::RESET_CONTENT, response_headers, message.body).into_response())
}

/// Pull the proxy metadata out of the request headers.
fn extract_publish_headers(request_headers: &HeaderMap) -> PublishHeaders {
    let pairs = request_headers.iter().filter_map(|(name, value)| {
        value.to_str().ok().map(|value| (name.as_str(), value))
    });

    PublishHeaders {
        content_type: header_str(request_headers, CONTENT_TYPE.as_str()).map(ToString::to_string),
        correlation_id: header_str(request_headers, headers::CORRELATION_ID)
            .map(ToString::to_string),
        passthrough: headers::passthrough(pairs),
    }
}

fn header_str<'a>(request_headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    request_headers.get(name).and_then(|v| v.to_str().ok())
}

fn insert_header(map: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::try_from(name),
        HeaderValue::try_from(value),
    ) {
        (Ok(name), Ok(value)) => {
            map.insert(name, value);
        }
        _ => {
            tracing::debug!(header = name, "Dropping unrepresentable response header");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn empty_state() -> Arc<AppState> {
        Arc::new(AppState {
            publishers: HashMap::new(),
            consumers: HashMap::new(),
            flags: Arc::new(ShutdownFlags::new()),
        })
    }

    #[tokio::test]
    async fn liveness_always_answers() {
        let router = build_router(empty_state());
        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_publish_queue_is_404() {
        let router = build_router(empty_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/publish/ghost")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_consume_queue_is_404() {
        let router = build_router(empty_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/consume/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn draining_proxy_answers_503_except_liveness() {
        let state = empty_state();
        state.flags.set_pending();
        let router = build_router(Arc::clone(&state));

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/publish/anything")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/consume/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = router
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn publish_header_extraction_strips_credentials() {
        let mut request_headers = HeaderMap::new();
        request_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        request_headers.insert("x-bunny-identity", HeaderValue::from_static("Bob"));
        request_headers.insert("x-bunny-token", HeaderValue::from_static("secret"));
        request_headers.insert("x-bunny-correlationid", HeaderValue::from_static("id-7"));
        request_headers.insert("x-bunny-trace", HeaderValue::from_static("t1"));

        let extracted = extract_publish_headers(&request_headers);
        assert_eq!(extracted.content_type.as_deref(), Some("application/json"));
        assert_eq!(extracted.correlation_id.as_deref(), Some("id-7"));
        assert_eq!(
            extracted.passthrough,
            vec![("x-bunny-trace".to_string(), "t1".to_string())]
        );
    }
}
