// Jobs shipped to worker threads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unit of work addressed to a job handler by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub data: Value,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            submitted_at: Utc::now(),
        }
    }
}

/// What a worker handed back for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub job: String,
    pub pool: String,
    pub worker_id: usize,
    pub value: Value,
    pub duration_ms: u64,
}

/// Payload of the per-port jobs a model pool understands.
///
/// Either `model_id` names a stored instance, or `data` creates a new one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortJobRequest {
    #[serde(default)]
    pub model_id: Option<Uuid>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl PortJobRequest {
    pub fn for_model(model_id: Uuid) -> Self {
        Self {
            model_id: Some(model_id),
            ..Self::default()
        }
    }

    pub fn create(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }
}
