// Circuit breaker
// Sliding-window error tracking with Closed / Open / HalfOpen states

//! # Circuit Breaker
//!
//! A [`CircuitBreaker`] wraps calls to one circuit id (normally a port name).
//! All breakers with the same id share one log in a [`CircuitRegistry`].
//!
//! ## State Machine
//!
//! ```text
//!            breach                    retry delay elapsed
//!   Closed ─────────► Open ───────────────────────────► HalfOpen
//!     ▲                 ▲                                  │
//!     │                 └────────── probe failed ──────────┤
//!     └──────────────────────────── probe succeeded ───────┘
//! ```
//!
//! ## Breach Rule
//!
//! Over the entries younger than the threshold's interval:
//! - `errors` = entries carrying an error
//! - `calls` = entries without one
//! - breached when `calls > call_volume` and `errors / calls * 100 > error_rate`
//!
//! ## HalfOpen
//!
//! Exactly one caller wins the Open to HalfOpen transition and runs the probe.
//! Everyone else is suppressed until the probe settles.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::broker::{EventBroker, Subscription};
use crate::models::{
    CircuitLogEntry, CircuitState, Event, SubscribeOptions, Threshold, Thresholds,
};
use crate::PortflowError;

/// Result of a call made through a breaker.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The call ran and succeeded
    Completed(T),
    /// The call ran and failed; the circuit stayed closed
    Failed(PortflowError),
    /// The call ran and failed; the circuit is now open
    Tripped(PortflowError),
    /// The circuit was open; the call did not run
    Suppressed,
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn into_result(self, circuit: &str) -> crate::Result<T> {
        match self {
            Outcome::Completed(value) => Ok(value),
            Outcome::Failed(err) | Outcome::Tripped(err) => Err(err),
            Outcome::Suppressed => Err(PortflowError::BreachOpen {
                circuit: circuit.to_string(),
            }),
        }
    }
}

/// Snapshot of one circuit for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub id: String,
    pub state: CircuitState,
    pub entries: usize,
    pub errors: usize,
    pub last_error: Option<String>,
}

pub(crate) enum Admission {
    Closed,
    Probe,
    Suppressed,
}

/// Shared log store for every circuit in one runtime.
pub struct CircuitRegistry {
    logs: DashMap<String, Vec<CircuitLogEntry>>,
    default_threshold: Threshold,
    max_entries: usize,
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(Threshold::default(), 1_000)
    }
}

impl CircuitRegistry {
    pub fn new(default_threshold: Threshold, max_entries: usize) -> Self {
        Self {
            logs: DashMap::new(),
            default_threshold,
            max_entries: max_entries.max(1),
        }
    }

    /// Threshold for `kind`: the circuit's per-kind entry, then the circuit's
    /// default, then the registry default.
    pub fn threshold_for(&self, kind: Option<&str>, thresholds: &Thresholds) -> Threshold {
        thresholds
            .lookup(kind)
            .cloned()
            .unwrap_or_else(|| self.default_threshold.clone())
    }

    pub fn state(&self, id: &str) -> CircuitState {
        self.logs
            .get(id)
            .map(|log| current_state(&log))
            .unwrap_or(CircuitState::Closed)
    }

    pub fn log(&self, id: &str) -> Vec<CircuitLogEntry> {
        self.logs.get(id).map(|log| log.clone()).unwrap_or_default()
    }

    pub fn reset(&self, id: &str) {
        self.logs.remove(id);
    }

    pub fn status(&self) -> Vec<CircuitStatus> {
        let mut status: Vec<CircuitStatus> = self
            .logs
            .iter()
            .map(|log| CircuitStatus {
                id: log.key().clone(),
                state: current_state(&log),
                entries: log.len(),
                errors: log.iter().filter(|e| e.is_error()).count(),
                last_error: last_error_kind(&log),
            })
            .collect();
        status.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }

    /// Decide whether a call may run and record the attempt.
    pub(crate) fn admit(&self, id: &str, thresholds: &Thresholds) -> Admission {
        let now = Instant::now();
        let mut log = self.logs.entry(id.to_string()).or_default();

        match current_state(&log) {
            CircuitState::Closed => {
                let delay = self.threshold_for(None, thresholds).retry_delay;
                self.push(&mut log, CircuitLogEntry::new(CircuitState::Closed, None, delay));
                Admission::Closed
            }
            CircuitState::Open => {
                if ready_to_test(&log, now) {
                    let delay = log.last().map(|e| e.retry_delay).unwrap_or_default();
                    self.push(&mut log, CircuitLogEntry::new(CircuitState::HalfOpen, None, delay));
                    Admission::Probe
                } else {
                    Admission::Suppressed
                }
            }
            // A probe whose caller vanished must not pin the circuit half-open.
            CircuitState::HalfOpen if ready_to_test(&log, now) => {
                let delay = log.last().map(|e| e.retry_delay).unwrap_or_default();
                self.push(&mut log, CircuitLogEntry::new(CircuitState::HalfOpen, None, delay));
                Admission::Probe
            }
            CircuitState::HalfOpen => Admission::Suppressed,
        }
    }

    pub(crate) fn record_probe_success(&self, id: &str, thresholds: &Thresholds) {
        let delay = self.threshold_for(None, thresholds).retry_delay;
        let mut log = self.logs.entry(id.to_string()).or_default();
        self.push(&mut log, CircuitLogEntry::new(CircuitState::Closed, None, delay));
    }

    /// Append an error of `kind` and return the resulting state.
    ///
    /// A half-open circuit re-opens; a closed circuit opens when the error
    /// breaches the threshold for its kind. Also used for error signals that
    /// do not come from a wrapped call.
    pub fn record_error(&self, id: &str, kind: &str, thresholds: &Thresholds) -> CircuitState {
        let threshold = self.threshold_for(Some(kind), thresholds);
        let now = Instant::now();
        let mut log = self.logs.entry(id.to_string()).or_default();
        let previous = current_state(&log);

        self.push(
            &mut log,
            CircuitLogEntry::new(previous, Some(kind.to_string()), threshold.retry_delay),
        );

        let next = match previous {
            CircuitState::HalfOpen => CircuitState::Open,
            CircuitState::Closed if threshold_breached(&log, &threshold, now) => CircuitState::Open,
            state => state,
        };

        if let Some(last) = log.last_mut() {
            last.state = next;
        }
        if next != previous {
            warn!(circuit = id, error = kind, from = %previous, to = %next, "Circuit state changed");
        } else {
            debug!(circuit = id, error = kind, state = %next, "Circuit error recorded");
        }
        next
    }

    pub(crate) fn last_error_kind(&self, id: &str) -> Option<String> {
        self.logs.get(id).and_then(|log| last_error_kind(&log))
    }

    fn push(&self, log: &mut Vec<CircuitLogEntry>, entry: CircuitLogEntry) {
        log.push(entry);
        if log.len() > self.max_entries {
            let excess = log.len() - self.max_entries;
            log.drain(..excess);
        }
    }
}

fn current_state(log: &[CircuitLogEntry]) -> CircuitState {
    log.last().map(|e| e.state).unwrap_or(CircuitState::Closed)
}

fn last_error_kind(log: &[CircuitLogEntry]) -> Option<String> {
    log.iter().rev().find_map(|e| e.error.clone())
}

fn ready_to_test(log: &[CircuitLogEntry], now: Instant) -> bool {
    match log.last() {
        Some(last) => now.saturating_duration_since(last.at) >= last.retry_delay,
        None => true,
    }
}

fn threshold_breached(log: &[CircuitLogEntry], threshold: &Threshold, now: Instant) -> bool {
    let in_window = log
        .iter()
        .filter(|e| now.saturating_duration_since(e.at) < threshold.interval);
    let (errors, calls) = in_window.fold((0usize, 0usize), |(errors, calls), e| {
        if e.is_error() {
            (errors + 1, calls)
        } else {
            (errors, calls + 1)
        }
    });

    if calls <= threshold.call_volume {
        return false;
    }
    let error_rate = errors as f64 / calls as f64 * 100.0;
    error_rate > threshold.error_rate
}

/// A handle on one circuit.
#[derive(Clone)]
pub struct CircuitBreaker {
    id: String,
    thresholds: Thresholds,
    registry: Arc<CircuitRegistry>,
}

impl CircuitBreaker {
    pub fn new(id: impl Into<String>, thresholds: Thresholds, registry: Arc<CircuitRegistry>) -> Self {
        Self {
            id: id.into(),
            thresholds,
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> CircuitState {
        self.registry.state(&self.id)
    }

    /// Run `call` if the circuit allows it.
    ///
    /// `args` are only handed to the fallback.
    pub async fn invoke<T, F, Fut>(&self, args: &[Value], call: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        match self.registry.admit(&self.id, &self.thresholds) {
            Admission::Suppressed => {
                debug!(circuit = %self.id, "Circuit open, call suppressed");
                let kind = self.registry.last_error_kind(&self.id);
                self.fallback(kind.as_deref(), args);
                Outcome::Suppressed
            }
            Admission::Closed => match call().await {
                Ok(value) => Outcome::Completed(value),
                Err(err) => self.on_error(err, args),
            },
            Admission::Probe => {
                info!(circuit = %self.id, "Circuit half-open, probing");
                match call().await {
                    Ok(value) => {
                        self.registry.record_probe_success(&self.id, &self.thresholds);
                        info!(circuit = %self.id, "Probe succeeded, circuit closed");
                        Outcome::Completed(value)
                    }
                    Err(err) => self.on_error(err, args),
                }
            }
        }
    }

    fn on_error<T>(&self, err: PortflowError, args: &[Value]) -> Outcome<T> {
        let kind = err.kind().to_string();
        match self.registry.record_error(&self.id, &kind, &self.thresholds) {
            CircuitState::Open => {
                self.fallback(Some(&kind), args);
                Outcome::Tripped(err)
            }
            _ => Outcome::Failed(err),
        }
    }

    fn fallback(&self, kind: Option<&str>, args: &[Value]) {
        let threshold = self.registry.threshold_for(kind, &self.thresholds);
        if let Some(fallback) = threshold.fallback {
            fallback(&self.id, args);
        }
    }

    /// Record an error on this circuit whenever one of `event_names` is published.
    ///
    /// The event name itself is logged as the error kind, so thresholds keyed
    /// by event name apply to these signals.
    pub fn detect_errors(&self, event_names: &[String], broker: &EventBroker) -> Vec<Subscription> {
        event_names
            .iter()
            .filter_map(|name| {
                let breaker = self.clone();
                broker.subscribe(
                    name,
                    move |event: Event| {
                        let breaker = breaker.clone();
                        async move {
                            breaker
                                .registry
                                .record_error(&breaker.id, &event.name, &breaker.thresholds);
                            anyhow::Ok(())
                        }
                    },
                    SubscribeOptions::default(),
                )
            })
            .collect()
    }
}
