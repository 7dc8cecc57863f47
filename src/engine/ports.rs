// Port invocation runtime
// Binds a model's ports to adapters with timers, retries, breakers and chaining

//! # Port Invocation Runtime
//!
//! [`ModelPorts::bind`] turns a [`ModelSpec`] into callable ports for one
//! runtime. Every call goes through the port's [`CircuitBreaker`] and, inside
//! it, through these steps:
//!
//! 1. **Disabled**: a disabled port (or one without an adapter) returns the
//!    model untouched.
//! 2. **Deadline**: unless the port's timeout is zero, a timer is armed. When
//!    it fires the runtime publishes `portTimeout_<port>_<MODEL>`, runs the
//!    port's timeout callback and calls the port again with one more
//!    [`PortArg::Retry`] marker. The in-flight call is not cancelled.
//! 3. **Budget**: a call carrying more markers than `max_retry` does not run.
//!    The runtime publishes `portRetryFailed_<port>_<MODEL>` and rolls the
//!    model back with the [`Compensator`].
//! 4. **Adapter**: on success the timer is cancelled. A chained port appends
//!    itself to the port flow, saves the model and publishes its
//!    `produces_event` with `{port, modelId, modelName}`.
//! 5. **Failure**: the error goes to the breaker. The timer stays armed, so a
//!    failing call is retried at its deadline like a slow one. A retry the
//!    open circuit suppresses arms the next timer itself, so the budget still
//!    runs out and ends in compensation.
//!
//! Ports that declare `consumes_event` hold a singleton subscription for it.
//! The handler loads the model named in the payload and invokes the port
//! unless the model is being compensated.
//!
//! ## Rust Learning Notes:
//!
//! ### Why `BoxFuture`?
//! A timer spawns a retry that calls the port again, so the invocation future
//! would contain itself. Boxing it behind [`BoxFuture`] gives the recursion a
//! fixed size.
//!
//! ### Weak References in Handlers
//! The broker outlives any one binding. Handlers hold a [`Weak`] pointer so a
//! dropped `ModelPorts` is not kept alive by its own subscriptions.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::circuit_breaker::{CircuitBreaker, Outcome};
use crate::engine::compensator::Compensator;
use crate::engine::domain_events;
use crate::engine::broker::Subscription;
use crate::engine::runtime::Runtime;
use crate::models::port::{attempt_of, chain_of, RetryChain};
use crate::models::{
    CompensationStatus, Event, Model, ModelSpec, PortAdapter, PortArg, PortCall, PortJobRequest,
    PortResult, PortSpec, PortStatus, PublishOptions, RetryMarker, SubscribeOptions, TimeoutNotice,
};
use crate::{PortflowError, Result};

struct PortEntry {
    spec: PortSpec,
    adapter: Option<Arc<dyn PortAdapter>>,
    breaker: CircuitBreaker,
    timeout: Duration,
    max_retry: u32,
}

impl PortEntry {
    fn is_enabled(&self) -> bool {
        !self.spec.disabled && self.adapter.is_some()
    }
}

/// The bound ports of one model type.
pub struct ModelPorts {
    model_name: String,
    runtime: Runtime,
    ports: HashMap<String, PortEntry>,
    compensator: Compensator,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ModelPorts {
    /// Check a model declaration without binding it.
    pub fn validate(spec: &ModelSpec) -> Result<()> {
        if spec.model_name.trim().is_empty() {
            return Err(PortflowError::InvalidSpec("model name is empty".into()));
        }

        let mut names = HashSet::new();
        for port in &spec.ports {
            if port.name.trim().is_empty() {
                return Err(PortflowError::InvalidSpec(format!(
                    "{}: port name is empty",
                    spec.model_name
                )));
            }
            if !names.insert(port.name.as_str()) {
                return Err(PortflowError::InvalidSpec(format!(
                    "{}: port {} is declared twice",
                    spec.model_name, port.name
                )));
            }
            if port.consumes_event.is_some() && port.consumes_event == port.produces_event {
                return Err(PortflowError::InvalidSpec(format!(
                    "{}: port {} consumes the event it produces",
                    spec.model_name, port.name
                )));
            }
        }

        if let Some(unknown) = spec.adapters.keys().find(|name| !names.contains(name.as_str())) {
            return Err(PortflowError::InvalidSpec(format!(
                "{}: adapter for undeclared port {}",
                spec.model_name, unknown
            )));
        }
        Ok(())
    }

    /// Bind `spec` to `runtime`: build breakers, register chained consumers.
    pub fn bind(runtime: &Runtime, spec: ModelSpec) -> Result<Arc<ModelPorts>> {
        Self::validate(&spec)?;
        let config = runtime.config();
        let model_name = spec.model_name.to_uppercase();

        let mut compensator = Compensator::new(
            &model_name,
            Arc::clone(runtime.broker()),
            Arc::clone(runtime.storage()),
            &config.compensation,
        );
        let mut ports = HashMap::with_capacity(spec.ports.len());
        for port in spec.ports {
            let breaker = CircuitBreaker::new(
                port.name.clone(),
                port.circuit_breaker.clone(),
                Arc::clone(runtime.circuits()),
            );
            compensator.add_step(
                port.name.clone(),
                port.undo.clone(),
                port.undo_retries,
                breaker.clone(),
            );
            let entry = PortEntry {
                adapter: spec.adapters.get(&port.name).cloned(),
                timeout: port.timeout.unwrap_or_else(|| config.port_timeout()),
                max_retry: port.max_retry.unwrap_or(config.port.max_retry),
                breaker,
                spec: port,
            };
            ports.insert(entry.spec.name.clone(), entry);
        }

        let bound = Arc::new(ModelPorts {
            model_name,
            runtime: runtime.clone(),
            ports,
            compensator,
            subscriptions: Mutex::new(Vec::new()),
        });
        bound.subscribe_all();
        info!(model = %bound.model_name, ports = bound.ports.len(), "Model ports bound");
        Ok(bound)
    }

    fn subscribe_all(self: &Arc<Self>) {
        let broker = self.runtime.broker();
        let mut subscriptions = Vec::new();

        for entry in self.ports.values() {
            let port = &entry.spec.name;
            subscriptions.extend(entry.breaker.detect_errors(
                &[
                    domain_events::port_timeout(port, &self.model_name),
                    domain_events::port_retry_failed(port, &self.model_name),
                ],
                broker,
            ));

            let Some(event) = entry.spec.consumes_event.as_deref() else {
                continue;
            };
            if !entry.is_enabled() {
                debug!(model = %self.model_name, port = %port, "Disabled port does not listen");
                continue;
            }

            let weak: Weak<ModelPorts> = Arc::downgrade(self);
            let port_name = port.clone();
            let subscribed = broker.subscribe(
                event,
                move |event: Event| {
                    let weak = weak.clone();
                    let port = port_name.clone();
                    async move {
                        match weak.upgrade() {
                            Some(ports) => ports.on_chained_event(&port, event).await,
                            None => Ok(()),
                        }
                    }
                },
                SubscribeOptions::default().singleton(),
            );
            match subscribed {
                Some(subscription) => subscriptions.push(subscription),
                None => warn!(
                    model = %self.model_name,
                    port = %port,
                    event,
                    "Another handler already consumes this event, port will not be chained"
                ),
            }
        }

        if let Ok(mut held) = self.subscriptions.lock() {
            held.extend(subscriptions);
        }
    }

    /// Drop this binding's broker subscriptions.
    pub fn unbind(&self) {
        let subscriptions = match self.subscriptions.lock() {
            Ok(mut held) => std::mem::take(&mut *held),
            Err(_) => return,
        };
        for subscription in subscriptions {
            self.runtime.broker().cancel(&subscription);
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn port_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn breaker(&self, port: &str) -> Option<&CircuitBreaker> {
        self.ports.get(port).map(|entry| &entry.breaker)
    }

    /// Create and store a new instance of this model.
    pub async fn create(&self, data: Value) -> Result<Model> {
        let model = Model::new(&self.model_name, data);
        self.runtime.storage().save(model).await
    }

    /// The stored instance a job names, or a new one built from its data.
    pub async fn load_or_create(&self, request: &PortJobRequest) -> Result<Model> {
        match request.model_id {
            Some(id) => self.runtime.storage().load(&id).await,
            None => self.create(request.data.clone().unwrap_or(Value::Null)).await,
        }
    }

    /// Invoke `port` on `model` with caller arguments.
    pub fn invoke(
        self: &Arc<Self>,
        model: Model,
        port: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<PortResult>> {
        self.dispatch(model, port, args.into_iter().map(PortArg::Value).collect())
    }

    /// Roll `model` back through its port flow.
    pub async fn undo(&self, model: &Model) -> Result<Model> {
        self.compensator.compensate(model).await
    }

    fn dispatch(
        self: &Arc<Self>,
        model: Model,
        port: &str,
        args: Vec<PortArg>,
    ) -> BoxFuture<'static, Result<PortResult>> {
        let this = Arc::clone(self);
        let port = port.to_string();
        async move { this.invoke_port(model, &port, args).await }.boxed()
    }

    async fn invoke_port(self: Arc<Self>, model: Model, port: &str, args: Vec<PortArg>) -> Result<PortResult> {
        let entry = self.entry(port)?;
        let adapter = match &entry.adapter {
            Some(adapter) if !entry.spec.disabled => Arc::clone(adapter),
            _ => {
                debug!(model = %self.model_name, port, "Port disabled, skipping");
                return Ok(PortResult::new(model, PortStatus::Disabled));
            }
        };

        let chain = chain_of(&args);
        let retries = attempt_of(&args) - 1;
        if retries > entry.max_retry as usize {
            return self.retries_exhausted(entry, model, chain).await;
        }

        let values: Vec<Value> = args
            .iter()
            .filter_map(|arg| match arg {
                PortArg::Value(value) => Some(value.clone()),
                PortArg::Retry(_) => None,
            })
            .collect();

        // A timer-driven call keeps its args so an open circuit cannot end the chain.
        let pending = (retries > 0 && !entry.timeout.is_zero()).then(|| args.clone());
        let outcome = entry
            .breaker
            .invoke(&values, || self.run_port(entry, adapter, model.clone(), args, Arc::clone(&chain)))
            .await;

        let (error, tripped) = match outcome {
            Outcome::Completed(result) => return Ok(result),
            Outcome::Suppressed => {
                if let Some(args) = pending {
                    debug!(model = %self.model_name, port, attempt = retries + 1, "Retry suppressed, rearming timer");
                    self.arm_timer(port, entry.timeout, &model, &args, chain);
                }
                return Ok(PortResult::new(model, PortStatus::Suppressed));
            }
            Outcome::Failed(error) => (error, false),
            Outcome::Tripped(error) => (error, true),
        };

        if chain.is_expired() && chain.begin_compensation() {
            return self.compensated(model).await;
        }
        let error = error.to_string();
        let status = if tripped {
            PortStatus::Tripped { error }
        } else {
            PortStatus::SoftFailure { error }
        };
        Ok(PortResult::new(model, status))
    }

    fn entry(&self, port: &str) -> Result<&PortEntry> {
        self.ports.get(port).ok_or_else(|| PortflowError::UnknownPort {
            model: self.model_name.clone(),
            port: port.to_string(),
        })
    }

    async fn run_port(
        self: &Arc<Self>,
        entry: &PortEntry,
        adapter: Arc<dyn PortAdapter>,
        model: Model,
        args: Vec<PortArg>,
        chain: Arc<RetryChain>,
    ) -> Result<PortResult> {
        let port = entry.spec.name.as_str();
        let attempt = attempt_of(&args);
        let timer = (!entry.timeout.is_zero())
            .then(|| self.arm_timer(port, entry.timeout, &model, &args, chain));

        let call = PortCall {
            model: model.clone(),
            port: port.to_string(),
            args,
        };
        let updated = adapter
            .invoke(call)
            .await
            .map_err(|e| PortflowError::from_adapter(port, e))?;

        if let Some(timer) = timer {
            timer.abort();
        }
        if attempt > 1 {
            info!(model = %self.model_name, port, attempt, "Retry worked");
            self.publish(
                domain_events::port_retry_worked(port, &self.model_name),
                json!({ "modelId": model.id, "port": port, "attempt": attempt }),
            )
            .await;
        }

        let updated = if entry.spec.is_chained() {
            self.record_completion(entry, &model, updated).await?
        } else {
            updated
        };
        Ok(PortResult::new(updated, PortStatus::Completed))
    }

    /// Append `port` to the flow, save, announce and return the latest copy.
    async fn record_completion(&self, entry: &PortEntry, before: &Model, after: Model) -> Result<Model> {
        let port = entry.spec.name.as_str();
        let mut model = if after.id == before.id { after } else { before.clone() };
        model.port_flow = before.port_flow.clone();
        model.record_port(port);
        let model = self.runtime.storage().save(model).await?;
        debug!(model = %self.model_name, id = %model.id, flow = ?model.port_flow, "Port flow updated");

        let Some(event) = entry.spec.produces_event.as_deref() else {
            return Ok(model);
        };
        self.publish(
            event.to_string(),
            json!({ "port": port, "modelId": model.id, "modelName": self.model_name }),
        )
        .await;

        let latest = self.runtime.storage().find(&model.id).await?;
        Ok(latest.unwrap_or(model))
    }

    fn arm_timer(
        self: &Arc<Self>,
        port: &str,
        timeout: Duration,
        model: &Model,
        args: &[PortArg],
        chain: Arc<RetryChain>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let port = port.to_string();
        let model = model.clone();
        let mut retry_args = args.to_vec();
        retry_args.push(PortArg::Retry(RetryMarker::new(chain)));

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // The retry must survive the timer being aborted by a late success.
            tokio::spawn(this.on_timeout(model, port, retry_args));
        })
    }

    async fn on_timeout(self: Arc<Self>, model: Model, port: String, retry_args: Vec<PortArg>) {
        let current = match self.runtime.storage().find(&model.id).await {
            Ok(Some(current)) => current,
            Ok(None) => model,
            Err(e) => {
                warn!(model = %self.model_name, port = %port, error = %e, "Could not reload model for retry");
                model
            }
        };
        if current.is_compensating() {
            debug!(model = %self.model_name, port = %port, "Model is compensating, not retrying");
            return;
        }

        let timed_out = attempt_of(&retry_args) - 1;
        warn!(model = %self.model_name, id = %current.id, port = %port, attempt = timed_out, "Port timed out, retrying");
        self.publish(
            domain_events::port_timeout(&port, &self.model_name),
            json!({ "modelId": current.id, "port": port, "attempt": timed_out }),
        )
        .await;

        if let Some(callback) = self
            .ports
            .get(&port)
            .and_then(|entry| entry.spec.timeout_callback.clone())
        {
            callback(&TimeoutNotice {
                model_id: current.id,
                model_name: self.model_name.clone(),
                port: port.clone(),
                attempt: timed_out,
            });
        }

        match self.dispatch(current, &port, retry_args).await {
            Ok(result) => debug!(model = %self.model_name, port = %port, status = ?result.status, "Retry finished"),
            Err(e) => warn!(model = %self.model_name, port = %port, error = %e, "Retry failed"),
        }
    }

    async fn retries_exhausted(&self, entry: &PortEntry, model: Model, chain: Arc<RetryChain>) -> Result<PortResult> {
        let port = entry.spec.name.as_str();
        let error = PortflowError::TimeoutExpired {
            model: self.model_name.clone(),
            port: port.to_string(),
            max_retry: entry.max_retry,
        };
        warn!(model = %self.model_name, id = %model.id, port, error = %error, "Retry budget exhausted");
        chain.mark_expired();
        self.publish(
            domain_events::port_retry_failed(port, &self.model_name),
            json!({ "modelId": model.id, "port": port, "error": error.to_string() }),
        )
        .await;

        if chain.begin_compensation() {
            return self.compensated(model).await;
        }
        Ok(PortResult::new(
            model,
            PortStatus::SoftFailure {
                error: error.to_string(),
            },
        ))
    }

    async fn compensated(&self, model: Model) -> Result<PortResult> {
        let model = self.undo(&model).await?;
        let result = model
            .compensate_result
            .unwrap_or(CompensationStatus::Incomplete);
        Ok(PortResult::new(model, PortStatus::Compensated { result }))
    }

    async fn on_chained_event(self: Arc<Self>, port: &str, event: Event) -> anyhow::Result<()> {
        let model_name = event.payload.get("modelName").and_then(Value::as_str);
        if model_name.is_some_and(|name| !name.eq_ignore_ascii_case(&self.model_name)) {
            return Ok(());
        }
        let Some(id) = event
            .payload
            .get("modelId")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            warn!(model = %self.model_name, port, event = %event.name, "Chained event without a model id");
            return Ok(());
        };

        let Some(model) = self.runtime.storage().find(&id).await? else {
            warn!(model = %self.model_name, port, %id, "Chained event for an unknown model");
            return Ok(());
        };
        if model.is_compensating() {
            info!(model = %self.model_name, port, %id, "Model is compensating, chain stops here");
            return Ok(());
        }

        debug!(model = %self.model_name, port, event = %event.name, "Chained event received");
        let result = self.invoke(model, port, Vec::new()).await?;
        debug!(model = %self.model_name, port, status = ?result.status, "Chained port finished");
        Ok(())
    }

    async fn publish(&self, event: String, payload: Value) {
        self.runtime
            .broker()
            .publish(&event, payload, PublishOptions::default())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::engine::storage::InMemoryModelStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::standalone(RuntimeConfig::default(), Arc::new(InMemoryModelStorage::new()))
    }

    fn echo(model: Model) -> impl std::future::Future<Output = anyhow::Result<Model>> {
        async move { anyhow::Ok(model) }
    }

    #[test]
    fn rejects_inconsistent_specs() {
        let duplicate = ModelSpec::new("order")
            .port(PortSpec::new("a"))
            .port(PortSpec::new("a"));
        assert!(matches!(ModelPorts::validate(&duplicate), Err(PortflowError::InvalidSpec(_))));

        let stray = ModelSpec::new("order")
            .port(PortSpec::new("a"))
            .adapter("b", |call: PortCall| echo(call.model));
        assert!(ModelPorts::validate(&stray).is_err());

        let looped = ModelSpec::new("order").port(PortSpec::new("a").consumes("x").produces("x"));
        assert!(ModelPorts::validate(&looped).is_err());
    }

    #[tokio::test]
    async fn disabled_and_unwired_ports_do_nothing() {
        let runtime = runtime();
        let spec = ModelSpec::new("order")
            .port(PortSpec::new("off").disabled(true))
            .port(PortSpec::new("unwired"))
            .adapter("off", |call: PortCall| echo(call.model));
        let ports = runtime.bind_model(spec).unwrap();
        let model = ports.create(json!({})).await.unwrap();

        for port in ["off", "unwired"] {
            let result = ports.invoke(model.clone(), port, vec![]).await.unwrap();
            assert_eq!(result.status, PortStatus::Disabled);
            assert_eq!(result.model, model);
        }
        assert!(matches!(
            ports.invoke(model, "missing", vec![]).await,
            Err(PortflowError::UnknownPort { .. })
        ));
    }

    #[tokio::test]
    async fn adapters_see_caller_arguments() {
        let runtime = runtime();
        let spec = ModelSpec::new("order")
            .port(PortSpec::new("price").timeout(Duration::ZERO))
            .adapter("price", |call: PortCall| async move {
                let mut model = call.model.clone();
                model.merge_data(json!({ "price": call.values()[0], "attempt": call.attempt() }));
                anyhow::Ok(model)
            });
        let ports = runtime.bind_model(spec).unwrap();
        let model = ports.create(json!({})).await.unwrap();

        let result = ports.invoke(model, "price", vec![json!(42)]).await.unwrap();
        assert!(result.is_completed());
        assert_eq!(result.model.data, json!({ "price": 42, "attempt": 1 }));
        assert!(result.model.port_flow().is_empty());
    }

    #[tokio::test]
    async fn failures_surface_as_typed_statuses() {
        let runtime = runtime();
        let spec = ModelSpec::new("order")
            .port(PortSpec::new("charge").timeout(Duration::ZERO))
            .adapter("charge", |_call: PortCall| async move {
                Err::<Model, _>(anyhow::anyhow!("card declined"))
            });
        let ports = runtime.bind_model(spec).unwrap();
        let model = ports.create(json!({})).await.unwrap();

        let result = ports.invoke(model, "charge", vec![]).await.unwrap();
        match result.status {
            PortStatus::SoftFailure { error } => assert!(error.contains("card declined")),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(runtime.circuits().log("charge").iter().filter(|e| e.is_error()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_are_retried_and_reported() {
        let runtime = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let notices = Arc::new(Mutex::new(Vec::new()));
        let spec = {
            let calls = Arc::clone(&calls);
            let notices = Arc::clone(&notices);
            ModelSpec::new("order")
                .port(
                    PortSpec::new("quote")
                        .timeout(Duration::from_millis(100))
                        .on_timeout(move |notice: &TimeoutNotice| {
                            notices.lock().unwrap().push(notice.attempt)
                        }),
                )
                .adapter("quote", move |call: PortCall| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if call.attempt() == 1 {
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                        anyhow::Ok(call.model)
                    }
                })
        };
        let ports = runtime.bind_model(spec).unwrap();

        let worked = Arc::new(AtomicUsize::new(0));
        {
            let worked = Arc::clone(&worked);
            runtime.broker().subscribe(
                "portRetryWorked_quote_ORDER",
                move |_event: Event| {
                    let worked = Arc::clone(&worked);
                    async move {
                        worked.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                },
                SubscribeOptions::default(),
            );
        }

        let model = ports.create(json!({})).await.unwrap();
        let result = ports.invoke(model, "quote", vec![]).await.unwrap();
        assert!(result.is_completed());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*notices.lock().unwrap(), vec![1]);
        assert_eq!(worked.load(Ordering::SeqCst), 1);
    }
}
