// Core domain models for Portflow
// Plain data: events, circuits, ports, model instances and jobs

//! # Domain Models Module
//!
//! This module holds the data the engines pass around. Nothing in here
//! spawns tasks or holds locks; behaviour lives in [`crate::engine`].
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a clean, flat API.
//! Users can import `use portflow::models::Model` instead of
//! `use portflow::models::model::Model`.

// Broker events, keys and subscription options
pub mod event;

// Circuit states, log entries and thresholds
pub mod circuit;

// Port declarations and the adapter/undo seams
pub mod port;

// Model instances and compensation status
pub mod model;

// Jobs for worker threads
pub mod job;

pub use event::{
    Event, EventKey, EventPredicate, PublishOptions, SubscribeOptions, SubscriptionId,
};

pub use circuit::{CircuitLogEntry, CircuitState, Fallback, Threshold, Thresholds};

pub use port::{
    ModelSpec, PortAdapter, PortArg, PortCall, PortResult, PortSpec, PortStatus, RetryMarker,
    TimeoutCallback, TimeoutNotice, UndoAction,
};

pub use model::{CompensationStatus, Model};

pub use job::{Job, JobResult, PortJobRequest};
