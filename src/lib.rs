// Portflow - Rust Edition
// An in-process runtime for event-driven domain models: ports, retries and sagas

//! # Portflow Library
//!
//! This is the main library crate for Portflow, the runtime that sits underneath
//! event-driven domain models. A model declares **ports** (named outbound calls to
//! external services); Portflow invokes them with timeouts and retries, chains
//! them together through events, protects them with circuit breakers, runs them
//! on worker threads and, when a chain fails for good, undoes the completed steps
//! in reverse order.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Event`]: A named notification with a JSON payload
//! - [`Model`]: A domain model instance and the ordered port flow it went through
//! - [`PortSpec`] / [`ModelSpec`]: Declarative port and model configuration
//! - [`Threshold`] / [`Thresholds`]: Circuit breaker tuning per error kind
//! - [`Job`] / [`JobResult`]: Units of work shipped to worker threads
//!
//! ### Engines
//!
//! #### [`EventBroker`]
//! Named and pattern subscriptions with `once`, `delay`, `filter`, `singleton`,
//! `privileged` and origin options. Handler failures are logged, never rethrown.
//!
//! #### [`CircuitBreaker`] and [`CircuitRegistry`]
//! Per-id sliding-window error rate tracking with Closed, Open and HalfOpen
//! states. The registry is injectable, so tests and workers each own one.
//!
//! #### [`ThreadPool`] and [`ThreadPoolRegistry`]
//! Named pools of OS threads with their own single-threaded tokio runtimes.
//! Jobs are dispatched by name, queued when all workers are busy, and pools can
//! be drained, reloaded and destroyed.
//!
//! #### [`ModelPorts`]
//! The port invocation runtime: deadline timers, bounded retries, event chaining
//! between ports and port flow bookkeeping.
//!
//! #### [`Compensator`]
//! Walks a model's port flow backwards calling each port's undo action.
//!
//! ### Runtime Roles
//! [`Runtime::run_as_coordinator`] and [`Runtime::run_as_worker`] are the two
//! entry points. The coordinator owns the pools; every worker owns its own
//! broker and circuit logs.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the internal
//! module structure. Instead of `use portflow::engine::broker::EventBroker`,
//! users can write `use portflow::EventBroker`.

// Core domain models (data only)
pub mod models;

// Engines: broker, breaker, pools, ports, compensation and runtime roles
pub mod engine;

// Layered runtime configuration
pub mod config;

// Re-export core domain types for easy access
pub use models::{
    CircuitLogEntry,    // One entry in a circuit's log
    CircuitState,       // Closed / Open / HalfOpen
    CompensationStatus, // COMPLETE / INCOMPLETE
    Event,              // Broker notification
    EventKey,           // Exact name or regex pattern
    Job,                // Unit of work for a worker
    JobResult,          // What a worker returned
    Model,              // Domain model instance
    ModelSpec,          // Model declaration: ports + adapters
    PortAdapter,        // Outbound call seam
    PortArg,            // Port argument or retry marker
    PortCall,           // Input handed to an adapter
    PortJobRequest,     // Job payload for port jobs
    PortResult,         // Typed outcome of a port invocation
    PortSpec,           // Port declaration
    PortStatus,         // Completed / SoftFailure / Compensated ...
    PublishOptions,     // Publish-side flags
    SubscribeOptions,   // Subscribe-side flags
    Threshold,          // Breaker tuning for one error kind
    Thresholds,         // Breaker tuning per error kind
    UndoAction,         // Compensation seam
};

// Re-export engine types for convenience
pub use engine::{
    broker::{EventBroker, EventHandler, Subscription},
    circuit_breaker::{CircuitBreaker, CircuitRegistry, CircuitStatus, Outcome},
    compensator::Compensator,
    ports::ModelPorts,
    runtime::{Coordinator, ModelWorkerSetup, Role, Runtime},
    storage::{InMemoryModelStorage, ModelStorage},
    thread_pool::{
        EventForwarder, JobHandler, JobTable, PoolOptions, PoolStatus, StaticJobs, ThreadPool,
        ThreadPoolRegistry, WorkerContext, WorkerSetup, WorkerStatus,
    },
};

pub use config::RuntimeConfig;

// Core error types
use thiserror::Error;

/// Error kind recorded when an adapter fails without classifying its error.
pub const ADAPTER_ERROR_KIND: &str = "AdapterError";

/// Error kind recorded against a port's circuit when its undo action times out.
pub const UNDO_TIMEOUT_KIND: &str = "undoTimeout";

/// Custom error types for Portflow operations
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types
#[derive(Error, Debug)]
pub enum PortflowError {
    /// An adapter call failed with an unclassified error
    #[error("Adapter for port {port} failed: {message}")]
    Adapter { port: String, message: String },

    /// An error carrying an explicit kind, used to pick circuit thresholds
    #[error("{kind}: {message}")]
    Classified { kind: String, message: String },

    /// The retry budget of a port was exhausted
    #[error("Port {port} of {model} timed out after {max_retry} retries")]
    TimeoutExpired {
        model: String,
        port: String,
        max_retry: u32,
    },

    /// The circuit is open and the call was not attempted
    #[error("Circuit {circuit} is open")]
    BreachOpen { circuit: String },

    /// An undo action did not finish within its deadline
    #[error("Undo for port {port} timed out after {timeout_ms}ms")]
    UndoTimeout { port: String, timeout_ms: u64 },

    /// Compensation gave up on a port
    #[error("Undo for port {port} failed after {attempts} attempts: {reason}")]
    UndoRetriesExceeded {
        port: String,
        attempts: u32,
        reason: String,
    },

    /// The pool is closed to new work
    #[error("Thread pool {pool} is closed")]
    PoolClosed { pool: String },

    /// Drain was requested on a pool that still accepts work
    #[error("Thread pool {pool} must be closed before draining")]
    PoolNotClosed { pool: String },

    /// In-flight jobs did not finish in time
    #[error("Thread pool {pool} did not drain within {timeout_ms}ms")]
    DrainTimeout { pool: String, timeout_ms: u64 },

    /// A worker thread died while running a job
    #[error("Worker {worker} of pool {pool} crashed while running {job}")]
    WorkerCrashed {
        pool: String,
        worker: usize,
        job: String,
    },

    /// A worker thread could not be started
    #[error("Worker of pool {pool} failed to start: {reason}")]
    WorkerStart { pool: String, reason: String },

    /// A job name that no worker knows about
    #[error("Unknown job {job} for pool {pool}")]
    UnknownJob { pool: String, job: String },

    /// A job handler returned an error
    #[error("Job {job} failed: {message}")]
    JobFailed { job: String, message: String },

    /// No pool is registered under this name
    #[error("Thread pool not found: {0}")]
    PoolNotFound(String),

    /// A port name the model does not declare
    #[error("Unknown port {port} for model {model}")]
    UnknownPort { model: String, port: String },

    /// A model instance that storage does not know about
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// A model or port declaration that cannot be bound
    #[error("Invalid model spec: {0}")]
    InvalidSpec(String),

    /// Error when invalid input is provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backends and other collaborators report through anyhow
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortflowError {
    /// Build an error with a caller-chosen kind.
    ///
    /// Adapters return these (wrapped in `anyhow`) to select a specific
    /// circuit threshold instead of the default one.
    pub fn classified(kind: impl Into<String>, message: impl Into<String>) -> Self {
        PortflowError::Classified {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The error kind used to look up circuit thresholds.
    pub fn kind(&self) -> &str {
        match self {
            PortflowError::Adapter { .. } => ADAPTER_ERROR_KIND,
            PortflowError::Classified { kind, .. } => kind,
            PortflowError::TimeoutExpired { .. } => "TimeoutExpired",
            PortflowError::BreachOpen { .. } => "BreachOpen",
            PortflowError::UndoTimeout { .. } => UNDO_TIMEOUT_KIND,
            PortflowError::UndoRetriesExceeded { .. } => "UndoRetriesExceeded",
            PortflowError::PoolClosed { .. } => "PoolClosed",
            PortflowError::PoolNotClosed { .. } => "PoolNotClosed",
            PortflowError::DrainTimeout { .. } => "DrainTimeout",
            PortflowError::WorkerCrashed { .. } => "WorkerCrashed",
            PortflowError::WorkerStart { .. } => "WorkerStart",
            PortflowError::UnknownJob { .. } => "UnknownJob",
            PortflowError::JobFailed { .. } => "JobFailed",
            PortflowError::PoolNotFound(_) => "PoolNotFound",
            PortflowError::UnknownPort { .. } => "UnknownPort",
            PortflowError::ModelNotFound(_) => "ModelNotFound",
            PortflowError::InvalidSpec(_) => "InvalidSpec",
            PortflowError::InvalidInput(_) => "InvalidInput",
            PortflowError::Config(_) => "ConfigError",
            PortflowError::Serialization(_) => "SerializationError",
            PortflowError::Storage(_) => "StorageError",
            PortflowError::Internal(_) => "InternalError",
        }
    }

    /// Convert an adapter's `anyhow` error into a crate error.
    ///
    /// A `PortflowError` anywhere in the chain is kept as is so its kind
    /// survives; anything else becomes [`PortflowError::Adapter`].
    pub fn from_adapter(port: &str, err: anyhow::Error) -> Self {
        match err.downcast::<PortflowError>() {
            Ok(inner) => inner,
            Err(other) => PortflowError::Adapter {
                port: port.to_string(),
                message: format!("{other:#}"),
            },
        }
    }
}

impl From<std::io::Error> for PortflowError {
    fn from(err: std::io::Error) -> Self {
        PortflowError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, PortflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_keep_their_classification() {
        let err = anyhow::Error::new(PortflowError::classified("ConnectionRefused", "db down"));
        let converted = PortflowError::from_adapter("reserve", err);
        assert_eq!(converted.kind(), "ConnectionRefused");

        let plain = PortflowError::from_adapter("reserve", anyhow::anyhow!("boom"));
        assert_eq!(plain.kind(), ADAPTER_ERROR_KIND);
        assert!(plain.to_string().contains("boom"));
    }

    #[test]
    fn undo_timeouts_use_the_sentinel_kind() {
        let err = PortflowError::UndoTimeout {
            port: "charge".into(),
            timeout_ms: 10,
        };
        assert_eq!(err.kind(), UNDO_TIMEOUT_KIND);
    }
}
