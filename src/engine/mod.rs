// Portflow engines
// Everything that spawns tasks, holds locks or talks to adapters lives here

//! # Engine Module
//!
//! The engine is the layer between the plain data in [`crate::models`] and
//! the outside world: adapters, worker threads and event consumers.
//!
//! ## Architecture Overview
//!
//! Components, leaves first:
//!
//! - **Event Broker** (`broker`): in-process publish/subscribe. Depends on
//!   nothing else.
//! - **Circuit Breaker** (`circuit_breaker`): per-id call logs and the
//!   Closed/Open/HalfOpen state machine. Uses the broker to turn published
//!   events into error signals.
//! - **Thread Pools** (`thread_pool`): worker threads with their own runtimes,
//!   FIFO overflow queues and a registry keyed by model group.
//! - **Port Runtime** (`ports`): timers, retries and event chaining around
//!   each adapter call, protected by a breaker.
//! - **Compensator** (`compensator`): LIFO undo over a model's port flow.
//! - **Runtime Roles** (`runtime`): wires the above together as a coordinator
//!   or a worker.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types from `lib.rs` for a flat API

/// Publish/subscribe event broker
pub mod broker;

/// Circuit breaker state machine and its log registry
pub mod circuit_breaker;

/// Saga compensation over a model's port flow
pub mod compensator;

/// Names of the lifecycle events the runtime publishes
pub mod domain_events;

/// Port invocation runtime: timeouts, retries, chaining
pub mod ports;

/// Coordinator and worker roles
pub mod runtime;

/// Model persistence boundary
pub mod storage;

/// Worker thread pools and their registry
pub mod thread_pool;
