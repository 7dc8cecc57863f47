// Port declarations, adapter seams and invocation results

//! # Ports
//!
//! A **port** is a named outbound call a model makes to an external service.
//! Ports are declared with [`PortSpec`] and grouped with their adapters in a
//! [`ModelSpec`]. The actual I/O lives behind the [`PortAdapter`] trait; the
//! optional rollback lives behind [`UndoAction`].
//!
//! ## Chaining
//!
//! A port that declares `produces_event` announces its completion on the
//! broker. A port that declares `consumes_event` is invoked automatically when
//! that event is published. Both kinds are recorded in the model's port flow.
//!
//! ## Retries
//!
//! When a port's deadline elapses the runtime calls it again with a
//! [`PortArg::Retry`] marker appended to its arguments. The number of markers
//! plus one is the attempt number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::circuit::Thresholds;
use super::model::{CompensationStatus, Model};

/// Everything an adapter needs for one call.
#[derive(Debug, Clone)]
pub struct PortCall {
    pub model: Model,
    pub port: String,
    pub args: Vec<PortArg>,
}

impl PortCall {
    /// Caller-supplied arguments, without retry markers.
    pub fn values(&self) -> Vec<Value> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                PortArg::Value(value) => Some(value.clone()),
                PortArg::Retry(_) => None,
            })
            .collect()
    }

    /// 1 for the first call, 2 for the first retry, and so on.
    pub fn attempt(&self) -> usize {
        attempt_of(&self.args)
    }
}

/// Performs the I/O behind a port.
///
/// Implementations must be idempotent: a call whose deadline elapsed may still
/// complete after the runtime has started a retry.
#[async_trait]
pub trait PortAdapter: Send + Sync {
    /// Returns the (possibly updated) model.
    async fn invoke(&self, call: PortCall) -> anyhow::Result<Model>;
}

#[async_trait]
impl<F, Fut> PortAdapter for F
where
    F: Fn(PortCall) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Model>> + Send + 'static,
{
    async fn invoke(&self, call: PortCall) -> anyhow::Result<Model> {
        (self)(call).await
    }
}

/// Reverses the effect of a completed port.
#[async_trait]
pub trait UndoAction: Send + Sync {
    async fn undo(&self, model: Model) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> UndoAction for F
where
    F: Fn(Model) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn undo(&self, model: Model) -> anyhow::Result<()> {
        (self)(model).await
    }
}

/// Passed to a port's timeout callback each time its deadline elapses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutNotice {
    pub model_id: Uuid,
    pub model_name: String,
    pub port: String,
    pub attempt: usize,
}

pub type TimeoutCallback = Arc<dyn Fn(&TimeoutNotice) + Send + Sync>;

/// Declaration of one port.
#[derive(Clone)]
pub struct PortSpec {
    pub name: String,
    /// Invoke this port when the event is published
    pub consumes_event: Option<String>,
    /// Publish this event when the port completes
    pub produces_event: Option<String>,
    /// Per-attempt deadline; `None` uses the runtime default, zero disables it
    pub timeout: Option<Duration>,
    /// Attempt budget; `None` uses the runtime default
    pub max_retry: Option<u32>,
    pub circuit_breaker: Thresholds,
    pub undo: Option<Arc<dyn UndoAction>>,
    /// Undo attempt budget; `None` uses the runtime default
    pub undo_retries: Option<u32>,
    pub disabled: bool,
    pub timeout_callback: Option<TimeoutCallback>,
}

impl PortSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumes_event: None,
            produces_event: None,
            timeout: None,
            max_retry: None,
            circuit_breaker: Thresholds::default(),
            undo: None,
            undo_retries: None,
            disabled: false,
            timeout_callback: None,
        }
    }

    pub fn consumes(mut self, event: impl Into<String>) -> Self {
        self.consumes_event = Some(event.into());
        self
    }

    pub fn produces(mut self, event: impl Into<String>) -> Self {
        self.produces_event = Some(event.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn circuit_breaker(mut self, thresholds: Thresholds) -> Self {
        self.circuit_breaker = thresholds;
        self
    }

    pub fn undo(mut self, undo: impl UndoAction + 'static) -> Self {
        self.undo = Some(Arc::new(undo));
        self
    }

    pub fn undo_retries(mut self, retries: u32) -> Self {
        self.undo_retries = Some(retries);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn on_timeout(mut self, callback: impl Fn(&TimeoutNotice) + Send + Sync + 'static) -> Self {
        self.timeout_callback = Some(Arc::new(callback));
        self
    }

    /// Whether completions of this port are recorded in the port flow.
    pub fn is_chained(&self) -> bool {
        self.produces_event.is_some() || self.consumes_event.is_some()
    }
}

impl fmt::Debug for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSpec")
            .field("name", &self.name)
            .field("consumes_event", &self.consumes_event)
            .field("produces_event", &self.produces_event)
            .field("timeout", &self.timeout)
            .field("max_retry", &self.max_retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("undo", &self.undo.is_some())
            .field("undo_retries", &self.undo_retries)
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// A model declaration: its ports and the adapters that implement them.
#[derive(Clone)]
pub struct ModelSpec {
    pub model_name: String,
    pub ports: Vec<PortSpec>,
    pub adapters: HashMap<String, Arc<dyn PortAdapter>>,
}

impl ModelSpec {
    pub fn new(model_name: impl AsRef<str>) -> Self {
        Self {
            model_name: model_name.as_ref().to_uppercase(),
            ports: Vec::new(),
            adapters: HashMap::new(),
        }
    }

    pub fn port(mut self, port: PortSpec) -> Self {
        self.ports.push(port);
        self
    }

    pub fn adapter(mut self, port: impl Into<String>, adapter: impl PortAdapter + 'static) -> Self {
        self.adapters.insert(port.into(), Arc::new(adapter));
        self
    }
}

impl fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut adapters: Vec<&String> = self.adapters.keys().collect();
        adapters.sort();
        f.debug_struct("ModelSpec")
            .field("model_name", &self.model_name)
            .field("ports", &self.ports)
            .field("adapters", &adapters)
            .finish()
    }
}

/// Shared state of one retry chain: the original call and every retry it spawned.
#[derive(Debug, Default)]
pub(crate) struct RetryChain {
    expired: AtomicBool,
    compensating: AtomicBool,
}

impl RetryChain {
    pub(crate) fn mark_expired(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// True for exactly one caller per chain.
    pub(crate) fn begin_compensation(&self) -> bool {
        self.compensating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Appended to a port's arguments for every timer-driven retry.
#[derive(Debug, Clone)]
pub struct RetryMarker {
    pub called_by_timer: DateTime<Utc>,
    pub(crate) chain: Arc<RetryChain>,
}

impl RetryMarker {
    pub(crate) fn new(chain: Arc<RetryChain>) -> Self {
        Self {
            called_by_timer: Utc::now(),
            chain,
        }
    }
}

/// One argument of a port call.
#[derive(Debug, Clone)]
pub enum PortArg {
    Value(Value),
    Retry(RetryMarker),
}

impl From<Value> for PortArg {
    fn from(value: Value) -> Self {
        PortArg::Value(value)
    }
}

pub(crate) fn attempt_of(args: &[PortArg]) -> usize {
    args.iter()
        .filter(|arg| matches!(arg, PortArg::Retry(_)))
        .count()
        + 1
}

/// The chain the call belongs to, or a new one for a first attempt.
pub(crate) fn chain_of(args: &[PortArg]) -> Arc<RetryChain> {
    args.iter()
        .find_map(|arg| match arg {
            PortArg::Retry(marker) => Some(Arc::clone(&marker.chain)),
            PortArg::Value(_) => None,
        })
        .unwrap_or_default()
}

/// How a port invocation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PortStatus {
    /// The adapter returned successfully
    Completed,
    /// The port is disabled or has no adapter; nothing ran
    Disabled,
    /// The adapter failed; the circuit stayed closed
    SoftFailure { error: String },
    /// The adapter failed and the circuit opened
    Tripped { error: String },
    /// The circuit was open; the adapter was not called
    Suppressed,
    /// The retry budget ran out and the model was rolled back
    Compensated { result: CompensationStatus },
}

/// A port invocation's model and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortResult {
    pub model: Model,
    #[serde(flatten)]
    pub status: PortStatus,
}

impl PortResult {
    pub fn new(model: Model, status: PortStatus) -> Self {
        Self { model, status }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PortStatus::Completed
    }
}
