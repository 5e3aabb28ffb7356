//! AMQP Adapters
//!
//! Everything that touches the broker lives here: the connection pane that
//! owns the single connection and its two channels, the publish and consume
//! adapters, and the push subscribers.
//!
//! # Channel discipline
//!
//! The pane opens exactly two channels. The **confirm** channel has
//! publisher confirms enabled and carries only confirm-publisher traffic.
//! The **regular** channel is shared by non-confirm publishers, single-get
//! consumers, and subscriber consume/ack frames; publishes and `basic.get`
//! on it are serialized through an async mutex because an AMQP channel is
//! not reentrant from the proxy's point of view.
//!
//! The pane never reconnects. A lost connection or channel is routed to the
//! lifecycle coordinator and takes the process down.

pub mod consumer;
pub mod publisher;
pub mod subscriber;

pub use consumer::{ConsumeError, ConsumedMessage, Consumer};
pub use publisher::{PublishError, PublishHeaders, PublishReceipt, Publisher};
pub use subscriber::{Subscriber, SubscriberState};

use std::sync::Arc;

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, Connection, ConnectionProperties, options::ConfirmSelectOptions};
use tokio::sync::{Mutex, mpsc};

use super::lifecycle::CloseEvent;
use crate::domain::headers;

/// Errors from the broker side of the proxy.
#[derive(Debug, thiserror::Error)]
pub enum AmqpError {
    /// Could not establish the connection.
    #[error("AMQP connection failed: {0}")]
    Connect(#[source] lapin::Error),

    /// Could not open or configure a channel.
    #[error("AMQP channel setup failed: {0}")]
    Channel(#[source] lapin::Error),

    /// A queue referenced by the configuration does not exist on the broker.
    #[error("queue '{queue}' does not exist on the broker: {source}")]
    QueueMissing {
        /// The missing queue.
        queue: String,
        /// The broker's refusal.
        source: lapin::Error,
    },

    /// Any other broker operation failure.
    #[error("AMQP operation failed: {0}")]
    Operation(#[from] lapin::Error),
}

/// The proxy's one connection and its two channels.
///
/// Components hold channel clones (a `lapin::Channel` is a cheap handle);
/// the pane keeps the connection itself so the lifecycle coordinator can
/// close it exactly once.
pub struct AmqpConnection {
    connection: Connection,
    regular: Channel,
    confirm: Channel,
    regular_gate: Arc<Mutex<()>>,
}

impl AmqpConnection {
    /// Connect and open both channels.
    ///
    /// Connection- and channel-level errors observed after startup are
    /// forwarded to `close_tx` so the lifecycle coordinator can start the
    /// error path.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError`] when the connection or either channel cannot
    /// be established.
    pub async fn connect(
        url: &str,
        close_tx: mpsc::UnboundedSender<CloseEvent>,
    ) -> Result<Self, AmqpError> {
        let options = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(url, options)
            .await
            .map_err(AmqpError::Connect)?;

        let connection_close_tx = close_tx.clone();
        connection.on_error(move |error| {
            tracing::error!(error = %error, "AMQP connection error");
            let _ = connection_close_tx.send(CloseEvent::Connection(error));
        });

        // A channel can be closed by the broker while the connection stays
        // up; each channel reports its own loss to the lifecycle.
        let regular = connection
            .create_channel()
            .await
            .map_err(AmqpError::Channel)?;
        let regular_close_tx = close_tx.clone();
        regular.on_error(move |error| {
            tracing::error!(error = %error, "AMQP regular channel error");
            let _ = regular_close_tx.send(CloseEvent::Channel {
                channel: "regular",
                error,
            });
        });

        let confirm = connection
            .create_channel()
            .await
            .map_err(AmqpError::Channel)?;
        confirm
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(AmqpError::Channel)?;
        let confirm_close_tx = close_tx;
        confirm.on_error(move |error| {
            tracing::error!(error = %error, "AMQP confirm channel error");
            let _ = confirm_close_tx.send(CloseEvent::Channel {
                channel: "confirm",
                error,
            });
        });

        tracing::info!("AMQP connection established, channels open");

        Ok(Self {
            connection,
            regular,
            confirm,
            regular_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Handle to the shared non-confirm channel.
    #[must_use]
    pub fn regular_channel(&self) -> Channel {
        self.regular.clone()
    }

    /// Handle to the confirm channel.
    #[must_use]
    pub fn confirm_channel(&self) -> Channel {
        self.confirm.clone()
    }

    /// Mutex serializing publishes and `basic.get` on the regular channel.
    #[must_use]
    pub fn regular_gate(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.regular_gate)
    }

    /// Close the connection (and with it both channels).
    pub async fn close(&self) {
        if let Err(error) = self.connection.close(200, "shutting down").await {
            tracing::debug!(error = %error, "AMQP connection close reported an error");
        }
    }
}

// =============================================================================
// Header Conversions
// =============================================================================

/// Build an AMQP header table from pass-through `(name, value)` pairs.
#[must_use]
pub(crate) fn headers_to_field_table(pairs: &[(String, String)]) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in pairs {
        table.insert(
            ShortString::from(name.as_str()),
            AMQPValue::LongString(LongString::from(value.as_str())),
        );
    }
    table
}

/// Extract pass-through `X-Bunny-*` headers from an AMQP header table.
///
/// Proxy-owned names are skipped so stored headers can never shadow the
/// values the proxy sets itself on the way out.
#[must_use]
pub(crate) fn field_table_to_headers(table: Option<&FieldTable>) -> Vec<(String, String)> {
    let Some(table) = table else {
        return Vec::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let name = key.as_str();
            if !name.starts_with(headers::PREFIX) || headers::is_reserved(name) {
                return None;
            }
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortShortInt(i) => i.to_string(),
                AMQPValue::LongInt(i) => i.to_string(),
                AMQPValue::LongLongInt(i) => i.to_string(),
                AMQPValue::Boolean(b) => b.to_string(),
                _ => return None,
            };
            Some((name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_table_round_trip() {
        let pairs = vec![
            ("x-bunny-trace".to_string(), "abc".to_string()),
            ("x-bunny-origin".to_string(), "svc-a".to_string()),
        ];
        let table = headers_to_field_table(&pairs);
        let mut back = field_table_to_headers(Some(&table));
        back.sort();
        let mut expected = pairs;
        expected.sort();
        assert_eq!(back, expected);
    }

    #[test]
    fn proxy_owned_names_do_not_leak_back_out() {
        let pairs = vec![
            ("x-bunny-redelivered".to_string(), "true".to_string()),
            ("x-bunny-message-count".to_string(), "9".to_string()),
            ("x-bunny-trace".to_string(), "abc".to_string()),
        ];
        let table = headers_to_field_table(&pairs);
        let back = field_table_to_headers(Some(&table));
        assert_eq!(
            back,
            vec![("x-bunny-trace".to_string(), "abc".to_string())]
        );
    }

    #[test]
    fn absent_table_yields_no_headers() {
        assert!(field_table_to_headers(None).is_empty());
    }

    #[test]
    fn foreign_header_names_are_skipped() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("x-death"),
            AMQPValue::LongString(LongString::from("count")),
        );
        assert!(field_table_to_headers(Some(&table)).is_empty());
    }
}
