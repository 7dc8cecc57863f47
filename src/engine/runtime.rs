// Runtime roles
// Coordinator and worker entry points and the pieces each one owns

//! # Runtime Roles
//!
//! A process runs one **coordinator** and any number of **workers**. They share
//! only the model storage:
//!
//! | | Coordinator | Worker |
//! |---|---|---|
//! | Event broker | own | own, forwarded to the coordinator |
//! | Circuit logs | own | own |
//! | Thread pools | owns the registry | none |
//! | Port adapters | none | bound by [`ModelWorkerSetup`] |
//!
//! The coordinator decides where work goes; workers perform the writes by
//! running ports as jobs. That keeps one writer per model group at a time.

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::engine::broker::EventBroker;
use crate::engine::circuit_breaker::CircuitRegistry;
use crate::engine::ports::ModelPorts;
use crate::engine::storage::ModelStorage;
use crate::engine::thread_pool::{
    JobTable, PoolOptions, ThreadPoolRegistry, WorkerContext, WorkerSetup,
};
use crate::models::{Event, JobResult, Model, ModelSpec, PortJobRequest, PortResult, SubscribeOptions};
use crate::{PortflowError, Result};

/// Job name that rolls a model back on a worker.
pub const COMPENSATE_JOB: &str = "compensate";

/// Which side of the pool a runtime is on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Coordinator,
    Worker { pool: String, worker_id: usize },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Worker { pool, worker_id } => write!(f, "worker {pool}#{worker_id}"),
        }
    }
}

/// The per-context services every component is built from.
#[derive(Clone)]
pub struct Runtime {
    role: Role,
    config: Arc<RuntimeConfig>,
    broker: Arc<EventBroker>,
    circuits: Arc<CircuitRegistry>,
    storage: Arc<dyn ModelStorage>,
}

impl Runtime {
    pub fn new(role: Role, config: Arc<RuntimeConfig>, storage: Arc<dyn ModelStorage>) -> Self {
        let circuits = CircuitRegistry::new(config.breaker.threshold(), config.breaker.max_log_entries);
        Self {
            role,
            config,
            broker: Arc::new(EventBroker::new()),
            circuits: Arc::new(circuits),
            storage,
        }
    }

    /// A coordinator-side runtime without pools, for running ports in-process.
    pub fn standalone(config: RuntimeConfig, storage: Arc<dyn ModelStorage>) -> Self {
        Self::new(Role::Coordinator, Arc::new(config), storage)
    }

    /// Start the coordinator: validates `config` and creates the pool registry.
    pub fn run_as_coordinator(config: RuntimeConfig, storage: Arc<dyn ModelStorage>) -> Result<Coordinator> {
        config.validate()?;
        let runtime = Self::standalone(config, storage);
        let pools = ThreadPoolRegistry::new(Arc::clone(&runtime.broker), runtime.config.pool.options());
        info!(role = %runtime.role, "Runtime started");
        Ok(Coordinator {
            runtime,
            pools: Arc::new(pools),
            models: DashMap::new(),
        })
    }

    /// Build the runtime of one worker thread.
    pub fn run_as_worker(
        config: Arc<RuntimeConfig>,
        storage: Arc<dyn ModelStorage>,
        context: &WorkerContext,
    ) -> Runtime {
        let role = Role::Worker {
            pool: context.pool.clone(),
            worker_id: context.worker_id,
        };
        debug!(role = %role, "Runtime started");
        Self::new(role, config, storage)
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn storage(&self) -> &Arc<dyn ModelStorage> {
        &self.storage
    }

    pub fn bind_model(&self, spec: ModelSpec) -> Result<Arc<ModelPorts>> {
        ModelPorts::bind(self, spec)
    }
}

/// Builds a model's ports on each worker and exposes them as jobs.
///
/// Jobs are named after the ports and take a [`PortJobRequest`]; the extra
/// `compensate` job rolls back the model named by `model_id`.
pub struct ModelWorkerSetup {
    spec: ModelSpec,
    config: Arc<RuntimeConfig>,
    storage: Arc<dyn ModelStorage>,
}

impl ModelWorkerSetup {
    pub fn new(spec: ModelSpec, config: Arc<RuntimeConfig>, storage: Arc<dyn ModelStorage>) -> Self {
        Self { spec, config, storage }
    }
}

impl WorkerSetup for ModelWorkerSetup {
    fn job_names(&self) -> Vec<String> {
        self.spec
            .ports
            .iter()
            .map(|port| port.name.clone())
            .chain(std::iter::once(COMPENSATE_JOB.to_string()))
            .collect()
    }

    fn setup(&self, context: &WorkerContext) -> Result<JobTable> {
        let runtime = Runtime::run_as_worker(Arc::clone(&self.config), Arc::clone(&self.storage), context);
        let ports = runtime.bind_model(self.spec.clone())?;

        let everything = regex::Regex::new(".+")
            .map_err(|e| PortflowError::Internal(format!("event forwarding pattern: {e}")))?;
        let forwarder = context.events.clone();
        runtime.broker().subscribe(
            everything,
            move |event: Event| {
                forwarder.forward(event);
                async { anyhow::Ok(()) }
            },
            SubscribeOptions::default(),
        );

        let mut jobs = JobTable::new();
        for port in ports.port_names() {
            let ports = Arc::clone(&ports);
            let job_port = port.clone();
            jobs = jobs.with_job(port, move |data: Value| {
                let ports = Arc::clone(&ports);
                let port = job_port.clone();
                async move {
                    let request: PortJobRequest = serde_json::from_value(data)?;
                    let model = ports.load_or_create(&request).await?;
                    let result = ports.invoke(model, &port, request.args).await?;
                    anyhow::Ok(serde_json::to_value(result)?)
                }
            });
        }

        let compensating = Arc::clone(&ports);
        jobs = jobs.with_job(COMPENSATE_JOB, move |data: Value| {
            let ports = Arc::clone(&compensating);
            async move {
                let request: PortJobRequest = serde_json::from_value(data)?;
                let model = ports.load_or_create(&request).await?;
                let model = ports.undo(&model).await?;
                anyhow::Ok(serde_json::to_value(model)?)
            }
        });
        Ok(jobs)
    }
}

/// The coordinating side: pools, registered models and dispatch.
pub struct Coordinator {
    runtime: Runtime,
    pools: Arc<ThreadPoolRegistry>,
    models: DashMap<String, ModelSpec>,
}

impl Coordinator {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        self.runtime.broker()
    }

    pub fn pools(&self) -> &Arc<ThreadPoolRegistry> {
        &self.pools
    }

    /// Register a model group. Its pool starts on first use.
    pub fn register_model(&self, spec: ModelSpec) -> Result<()> {
        self.register_model_with(spec, None)
    }

    pub fn register_model_with(&self, spec: ModelSpec, options: Option<PoolOptions>) -> Result<()> {
        ModelPorts::validate(&spec)?;
        let group = spec.model_name.to_uppercase();
        let setup = ModelWorkerSetup::new(
            spec.clone(),
            Arc::clone(self.runtime.config()),
            Arc::clone(self.runtime.storage()),
        );
        self.pools.register(&group, Arc::new(setup), options);
        self.models.insert(group.clone(), spec);
        info!(model = %group, "Model registered");
        Ok(())
    }

    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    /// Run a raw job on the group's pool.
    pub async fn run_job(&self, group: &str, job: &str, data: Value) -> Result<JobResult> {
        let pool = self.pools.get_thread_pool(group, None).await?;
        pool.run(job, data).await
    }

    /// Run `port` of a `group` model on a worker.
    pub async fn invoke_port(&self, group: &str, port: &str, request: PortJobRequest) -> Result<PortResult> {
        let group_key = group.to_uppercase();
        let declared = self
            .models
            .get(&group_key)
            .map(|spec| spec.ports.iter().any(|p| p.name == port));
        match declared {
            None => return Err(PortflowError::PoolNotFound(group_key)),
            Some(false) => {
                return Err(PortflowError::UnknownPort {
                    model: group_key,
                    port: port.to_string(),
                })
            }
            Some(true) => {}
        }

        let result = self
            .run_job(&group_key, port, serde_json::to_value(request)?)
            .await?;
        Ok(serde_json::from_value(result.value)?)
    }

    /// Roll back a stored model on a worker of its group.
    pub async fn compensate(&self, group: &str, model_id: Uuid) -> Result<Model> {
        let request = PortJobRequest::for_model(model_id);
        let result = self
            .run_job(group, COMPENSATE_JOB, serde_json::to_value(request)?)
            .await?;
        Ok(serde_json::from_value(result.value)?)
    }

    pub async fn shutdown(&self) {
        self.pools.shutdown().await;
        info!(role = %self.runtime.role, "Runtime stopped");
    }
}
