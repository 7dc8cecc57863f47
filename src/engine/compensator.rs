// Saga compensation
// Rolls a model back by undoing its completed ports, newest first

//! # Compensator
//!
//! When a chain of ports cannot finish, the ports that already completed are
//! undone in reverse order. The model's port flow is the record of what
//! completed; it only ever shrinks from the tail here, and every successful
//! undo is saved before the next one starts, so progress survives a later
//! failure.
//!
//! ## Outcome
//!
//! - **COMPLETE**: the port flow is empty afterwards
//! - **INCOMPLETE**: an undo ran out of attempts; the remaining flow is what
//!   an operator has to clean up by hand
//!
//! Both are terminal. The result is saved on the model and announced with
//! `undoWorked_<MODEL>` or `undoFailed_<MODEL>`.
//!
//! Undo calls go through the same circuit as the port's forward calls, so a
//! failing undo spends the port's error budget too.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CompensationConfig;
use crate::engine::broker::EventBroker;
use crate::engine::circuit_breaker::CircuitBreaker;
use crate::engine::domain_events;
use crate::engine::storage::ModelStorage;
use crate::models::{CompensationStatus, Model, PublishOptions, UndoAction};
use crate::{PortflowError, Result};

struct UndoStep {
    action: Option<Arc<dyn UndoAction>>,
    retries: Option<u32>,
    breaker: CircuitBreaker,
}

/// Undoes the completed ports of one model type.
pub struct Compensator {
    model_name: String,
    steps: HashMap<String, UndoStep>,
    broker: Arc<EventBroker>,
    storage: Arc<dyn ModelStorage>,
    max_undo_retries: u32,
    undo_timeout: Duration,
    retry_delay: Duration,
}

impl Compensator {
    pub fn new(
        model_name: impl AsRef<str>,
        broker: Arc<EventBroker>,
        storage: Arc<dyn ModelStorage>,
        config: &CompensationConfig,
    ) -> Self {
        Self {
            model_name: model_name.as_ref().to_uppercase(),
            steps: HashMap::new(),
            broker,
            storage,
            max_undo_retries: config.max_undo_retries,
            undo_timeout: config.undo_timeout(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Register how `port` is undone. `retries` overrides the default budget.
    pub fn add_step(
        &mut self,
        port: impl Into<String>,
        action: Option<Arc<dyn UndoAction>>,
        retries: Option<u32>,
        breaker: CircuitBreaker,
    ) {
        self.steps.insert(
            port.into(),
            UndoStep {
                action,
                retries,
                breaker,
            },
        );
    }

    /// Roll `model` back and return it with its final status recorded.
    ///
    /// Only storage failures are returned as errors; a rollback that gives up
    /// is reported through `compensate_result`.
    pub async fn compensate(&self, model: &Model) -> Result<Model> {
        let mut model = self
            .storage
            .find(&model.id)
            .await?
            .unwrap_or_else(|| model.clone());

        info!(model = %self.model_name, id = %model.id, flow = ?model.port_flow, "Compensation started");
        self.broker
            .publish(
                &domain_events::undo_started(&self.model_name),
                json!({ "modelId": model.id, "portFlow": model.port_flow }),
                PublishOptions::default(),
            )
            .await;

        model.compensate = true;
        model.touch();
        let mut model = self.storage.save(model).await?;

        let mut aborted: Option<PortflowError> = None;
        let flow = model.port_flow.clone();
        for (index, port) in flow.iter().enumerate().rev() {
            match self.steps.get(port) {
                Some(UndoStep {
                    action: Some(action),
                    retries,
                    breaker,
                }) => {
                    if let Err(e) = self.undo_port(port, action, *retries, breaker, &model).await {
                        aborted = Some(e);
                        break;
                    }
                    debug!(model = %self.model_name, port = %port, "Port undone");
                }
                _ => debug!(model = %self.model_name, port = %port, "Nothing to undo"),
            }
            model.port_flow.truncate(index);
            model.touch();
            model = self.storage.save(model).await?;
        }

        let status = if aborted.is_none() && model.port_flow.is_empty() {
            CompensationStatus::Complete
        } else {
            CompensationStatus::Incomplete
        };
        model.compensate_result = Some(status);
        model.touch();
        let model = self.storage.save(model).await?;

        let mut payload = json!({ "modelId": model.id, "compensateResult": status });
        if let (Some(error), Value::Object(fields)) = (&aborted, &mut payload) {
            fields.insert("error".to_string(), json!(error.to_string()));
        }
        let event = match status {
            CompensationStatus::Complete => {
                info!(model = %self.model_name, id = %model.id, "Compensation complete");
                domain_events::undo_worked(&self.model_name)
            }
            CompensationStatus::Incomplete => {
                warn!(
                    model = %self.model_name,
                    id = %model.id,
                    remaining = ?model.port_flow,
                    error = aborted.as_ref().map(|e| e.to_string()),
                    "Compensation incomplete, manual intervention required"
                );
                domain_events::undo_failed(&self.model_name)
            }
        };
        self.broker
            .publish(&event, payload, PublishOptions::default())
            .await;

        Ok(model)
    }

    async fn undo_port(
        &self,
        port: &str,
        action: &Arc<dyn UndoAction>,
        retries: Option<u32>,
        breaker: &CircuitBreaker,
        model: &Model,
    ) -> Result<()> {
        let limit = retries.unwrap_or(self.max_undo_retries);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = breaker
                .invoke(&[], || async {
                    match tokio::time::timeout(self.undo_timeout, action.undo(model.clone())).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(PortflowError::from_adapter(port, e)),
                        Err(_) => Err(PortflowError::UndoTimeout {
                            port: port.to_string(),
                            timeout_ms: self.undo_timeout.as_millis() as u64,
                        }),
                    }
                })
                .await;

            let error = match outcome.into_result(breaker.id()) {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            warn!(model = %self.model_name, port, attempt = attempts, error = %error, "Undo attempt failed");

            if attempts > limit {
                return Err(PortflowError::UndoRetriesExceeded {
                    port: port.to_string(),
                    attempts,
                    reason: error.to_string(),
                });
            }
            if !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }
}
