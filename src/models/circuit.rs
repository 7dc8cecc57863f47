// Circuit breaker state, log entries and thresholds

//! # Circuit Data Model
//!
//! Every protected call site (usually a port) owns a **circuit**: an ordered log
//! of [`CircuitLogEntry`] values. The circuit's state is the state recorded on
//! its newest entry, or [`CircuitState::Closed`] when the log is empty.
//!
//! [`Thresholds`] decide when a circuit trips. Each error kind can have its own
//! [`Threshold`]; unknown kinds fall back to the `default` entry and then to the
//! runtime-wide default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are suppressed until the retry delay elapses
    Open,
    /// One probe call is in flight
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "halfOpen"),
        }
    }
}

/// One entry in a circuit's log.
///
/// Entries without an error are attempted calls; entries with an error are
/// failures or external error signals.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitLogEntry {
    /// Monotonic time used for windows and retry delays
    #[serde(skip)]
    pub at: Instant,
    pub timestamp: DateTime<Utc>,
    pub state: CircuitState,
    /// Error kind, if this entry records a failure
    pub error: Option<String>,
    /// How long an Open circuit waits after this entry before probing
    pub retry_delay: Duration,
}

impl CircuitLogEntry {
    pub fn new(state: CircuitState, error: Option<String>, retry_delay: Duration) -> Self {
        Self {
            at: Instant::now(),
            timestamp: Utc::now(),
            state,
            error,
            retry_delay,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Called with the circuit id and the call's arguments when a call is
/// suppressed or trips the breaker.
pub type Fallback = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Breaker tuning for one error kind.
#[derive(Clone)]
pub struct Threshold {
    /// Percent of failures (relative to successful calls) that trips the breaker
    pub error_rate: f64,
    /// Successful calls needed in the window before the rate counts
    pub call_volume: usize,
    /// Sliding window length
    pub interval: Duration,
    /// Wait after opening before a probe is allowed
    pub retry_delay: Duration,
    pub fallback: Option<Fallback>,
}

impl Threshold {
    pub fn new(error_rate: f64, call_volume: usize, interval: Duration, retry_delay: Duration) -> Self {
        Self {
            error_rate,
            call_volume,
            interval,
            retry_delay,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: impl Fn(&str, &[Value]) + Send + Sync + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::new(20.0, 5, Duration::from_millis(9_000), Duration::from_millis(10_000))
    }
}

impl fmt::Debug for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Threshold")
            .field("error_rate", &self.error_rate)
            .field("call_volume", &self.call_volume)
            .field("interval", &self.interval)
            .field("retry_delay", &self.retry_delay)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Thresholds for a circuit, keyed by error kind.
#[derive(Debug, Clone, Default)]
pub struct Thresholds {
    pub default: Option<Threshold>,
    pub by_kind: HashMap<String, Threshold>,
}

impl Thresholds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, threshold: Threshold) -> Self {
        self.default = Some(threshold);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>, threshold: Threshold) -> Self {
        self.by_kind.insert(kind.into(), threshold);
        self
    }

    /// Threshold for `kind`, else this circuit's default, else `None`.
    pub fn lookup(&self, kind: Option<&str>) -> Option<&Threshold> {
        kind.and_then(|k| self.by_kind.get(k))
            .or(self.default.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prefers_the_error_kind() {
        let thresholds = Thresholds::new()
            .with_default(Threshold::new(50.0, 1, Duration::from_secs(1), Duration::from_secs(1)))
            .with_kind(
                "TimeoutExpired",
                Threshold::new(10.0, 2, Duration::from_secs(5), Duration::from_secs(30)),
            );

        assert_eq!(thresholds.lookup(Some("TimeoutExpired")).map(|t| t.call_volume), Some(2));
        assert_eq!(thresholds.lookup(Some("Other")).map(|t| t.call_volume), Some(1));
        assert_eq!(thresholds.lookup(None).map(|t| t.call_volume), Some(1));
        assert!(Thresholds::new().lookup(Some("Other")).is_none());
    }
}
