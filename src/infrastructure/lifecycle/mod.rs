//! Process Lifecycle
//!
//! Owns the two write-once shutdown flags, the in-flight counters that
//! couple the message paths to the drain logic, and the coordinator that
//! turns a signal or an unexpected broker close into an orderly stop.
//!
//! # Shutdown paths
//!
//! **Graceful** (SIGTERM/SIGINT): flip `pending_shutdown` so the router
//! starts answering 503, cancel every subscriber softly, poll the summed
//! push counter for up to five one-second sleeps, then close the broker
//! connection and the HTTP server.
//!
//! **Error** (broker connection or channel lost while not shutting down):
//! flip `error_shutdown`, stop subscribers hard, close whatever is left,
//! and let the process exit non-zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::amqp::{AmqpConnection, Subscriber};

/// Poll attempts granted to the graceful drain.
pub const DRAIN_ATTEMPTS: u32 = 5;

/// Sleep between drain polls.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Close Events
// =============================================================================

/// Something on the broker side went away without being asked to.
#[derive(Debug)]
pub enum CloseEvent {
    /// The AMQP connection errored out.
    Connection(lapin::Error),
    /// One of the two channels errored out while the connection stayed up.
    Channel {
        /// Which channel: `"regular"` or `"confirm"`.
        channel: &'static str,
        /// The channel's error.
        error: lapin::Error,
    },
    /// A subscriber's delivery stream ended while it was supposed to run.
    ConsumerEnded {
        /// Queue the subscriber was consuming.
        queue: String,
    },
}

// =============================================================================
// Shutdown Flags
// =============================================================================

/// The two monotonic process flags.
///
/// Both are write-once: the first caller to set a flag wins and observes
/// `true` back, every later call is a no-op. Components read them through
/// shared references; nothing ever clears them.
#[derive(Debug, Default)]
pub struct ShutdownFlags {
    pending: AtomicBool,
    error: AtomicBool,
}

impl ShutdownFlags {
    /// Fresh flags, both unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `pending_shutdown`. Returns `true` only for the first caller.
    pub fn set_pending(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether a shutdown has begun.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Set `error_shutdown`. Returns `true` only for the first caller.
    pub fn set_error(&self) -> bool {
        self.error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Whether the process is going down because the broker went away.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }
}

// =============================================================================
// In-Flight Accounting
// =============================================================================

/// Shared counter of operations currently in flight.
///
/// Incremented when work is accepted, decremented by the guard's `Drop`, so
/// every exit path (success, error, cancellation) balances the counter and
/// it can never go negative.
#[derive(Debug, Clone, Default)]
pub struct InFlightCounter {
    count: Arc<AtomicI64>,
}

impl InFlightCounter {
    /// A counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of in-flight operations.
    #[must_use]
    pub fn current(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Account for one operation; the returned guard releases it on drop.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }
}

/// Releases one in-flight slot when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Drain
// =============================================================================

/// Poll `in_flight` until it reports zero or the attempt budget runs out.
///
/// Returns `true` when the count reached zero. A zero count on the first
/// look returns immediately without sleeping.
pub async fn drain_in_flight<F>(in_flight: F, attempts: u32, interval: Duration) -> bool
where
    F: Fn() -> i64,
{
    for attempt in 1..=attempts {
        let remaining = in_flight();
        if remaining == 0 {
            return true;
        }
        tracing::info!(attempt, remaining, "Waiting for in-flight pushes to drain");
        tokio::time::sleep(interval).await;
    }
    in_flight() == 0
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives the process through one of the two shutdown paths.
pub struct LifecycleCoordinator {
    flags: Arc<ShutdownFlags>,
    amqp: AmqpConnection,
    subscribers: Vec<Arc<Subscriber>>,
    http_cancel: CancellationToken,
    close_rx: mpsc::UnboundedReceiver<CloseEvent>,
}

impl LifecycleCoordinator {
    /// Wire up the coordinator.
    #[must_use]
    pub fn new(
        flags: Arc<ShutdownFlags>,
        amqp: AmqpConnection,
        subscribers: Vec<Arc<Subscriber>>,
        http_cancel: CancellationToken,
        close_rx: mpsc::UnboundedReceiver<CloseEvent>,
    ) -> Self {
        Self {
            flags,
            amqp,
            subscribers,
            http_cancel,
            close_rx,
        }
    }

    /// Block until a shutdown trigger arrives, then run the matching path.
    ///
    /// Returns `Ok(())` after a graceful drain and `Err` after an error
    /// shutdown so `main` can exit non-zero.
    pub async fn run(mut self) -> Result<(), LifecycleError> {
        let trigger = tokio::select! {
            () = await_signal() => None,
            event = self.close_rx.recv() => event,
        };

        match trigger {
            Some(event) if !self.flags.is_pending() => {
                self.error_shutdown(&event).await;
                Err(LifecycleError::BrokerLost(describe(&event)))
            }
            // A close observed after shutdown began is expected noise; so is
            // a plain signal.
            _ => {
                self.graceful().await;
                Ok(())
            }
        }
    }

    async fn graceful(&mut self) {
        if !self.flags.set_pending() {
            return;
        }
        tracing::info!("Graceful shutdown started");

        for subscriber in &self.subscribers {
            subscriber.stop(false).await;
        }

        let subscribers = self.subscribers.clone();
        let drained = drain_in_flight(
            move || subscribers.iter().map(|s| s.in_flight_pushes()).sum(),
            DRAIN_ATTEMPTS,
            DRAIN_INTERVAL,
        )
        .await;

        if !drained {
            let remaining: i64 = self.subscribers.iter().map(|s| s.in_flight_pushes()).sum();
            tracing::warn!(remaining, "Drain budget expired, closing anyway");
        }

        self.amqp.close().await;
        self.http_cancel.cancel();
        tracing::info!("Graceful shutdown complete");
    }

    async fn error_shutdown(&mut self, event: &CloseEvent) {
        self.flags.set_error();
        self.flags.set_pending();
        tracing::error!(event = %describe(event), "Unexpected broker close, shutting down");

        for subscriber in &self.subscribers {
            subscriber.stop(true).await;
        }

        self.amqp.close().await;
        self.http_cancel.cancel();
    }
}

fn describe(event: &CloseEvent) -> String {
    match event {
        CloseEvent::Connection(e) => format!("connection error: {e}"),
        CloseEvent::Channel { channel, error } => {
            format!("{channel} channel error: {error}")
        }
        CloseEvent::ConsumerEnded { queue } => {
            format!("consumer stream for queue '{queue}' ended")
        }
    }
}

/// The process is going down on the error path.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The broker connection or a channel closed unexpectedly.
    #[error("broker lost: {0}")]
    BrokerLost(String),
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
