//! Retry Backoff
//!
//! Computes the delay between push attempts for a failed delivery. The
//! strategy and base delay come from the subscriber's configuration; the
//! delay is a pure function of the attempt number so retries are fully
//! deterministic and testable.

use std::time::Duration;

use serde::Deserialize;

/// How the delay between push retries grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay for every attempt.
    #[default]
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay doubles with each attempt.
    Exponential,
}

impl BackoffStrategy {
    /// Strategy name, as written in the configuration file.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }
}

/// Delay before retry attempt `attempt` (1-based).
///
/// - `fixed` → `base`
/// - `linear` → `base × attempt`
/// - `exponential` → `base × 2^(attempt − 1)`
///
/// Saturates instead of overflowing for absurd attempt numbers.
#[must_use]
pub fn backoff_delay(strategy: BackoffStrategy, base: Duration, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
            base.saturating_mul(factor)
        }
    }
}
