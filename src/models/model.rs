// Domain model instances
// A model instance plus the bookkeeping the port runtime keeps on it

//! # Model Instances
//!
//! A [`Model`] is one instance of a domain model (an order, a shipment, ...).
//! Besides its business `data` it carries the runtime's bookkeeping:
//!
//! - **port_flow**: the ordered names of chained ports that completed for
//!   this instance. Compensation walks it backwards.
//! - **compensate**: set once a rollback starts. Chained handlers skip
//!   instances with this flag.
//! - **compensate_result**: the terminal outcome of the last rollback.
//!
//! ## Rust Learning Notes:
//!
//! ### Value Semantics
//! `Model` is a plain `Clone` value. The runtime never shares a mutable model
//! between tasks; it reads the latest copy from storage, changes it and saves
//! it back (last writer wins).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Terminal outcome of a compensation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    /// Every completed port was undone
    Complete,
    /// At least one completed port is still recorded in the port flow
    Incomplete,
}

impl fmt::Display for CompensationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompensationStatus::Complete => write!(f, "COMPLETE"),
            CompensationStatus::Incomplete => write!(f, "INCOMPLETE"),
        }
    }
}

/// A domain model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: Uuid,
    pub model_name: String,
    pub data: Value,
    #[serde(default)]
    pub port_flow: Vec<String>,
    #[serde(default)]
    pub compensate: bool,
    #[serde(default)]
    pub compensate_result: Option<CompensationStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Create a fresh instance. Model names are stored upper case.
    pub fn new(model_name: impl AsRef<str>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            model_name: model_name.as_ref().to_uppercase(),
            data,
            port_flow: Vec::new(),
            compensate: false,
            compensate_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn port_flow(&self) -> &[String] {
        &self.port_flow
    }

    /// True once a rollback has started for this instance.
    pub fn is_compensating(&self) -> bool {
        self.compensate
    }

    /// Record that `port` completed as part of a chain.
    pub fn record_port(&mut self, port: impl Into<String>) {
        self.port_flow.push(port.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Shallow merge of `changes` into `data` when both are JSON objects;
    /// otherwise `changes` replaces `data`.
    pub fn merge_data(&mut self, changes: Value) {
        match (&mut self.data, changes) {
            (Value::Object(current), Value::Object(changes)) => {
                for (key, value) in changes {
                    current.insert(key, value);
                }
            }
            (data, changes) => *data = changes,
        }
        self.touch();
    }
}
