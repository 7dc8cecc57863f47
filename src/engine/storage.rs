// Storage abstraction for model instances
// This defines the interface the port runtime persists models through

//! # Storage Abstraction Layer
//!
//! The port runtime never keeps model instances in memory between calls. It
//! loads the latest copy, lets an adapter or undo step change it, and saves it
//! back. Whatever backs that is hidden behind [`ModelStorage`].
//!
//! ## Storage Architecture
//!
//! The storage layer follows the **Repository Pattern**:
//! - **ModelStorage trait**: the interface the runtime depends on
//! - **InMemoryModelStorage**: default implementation for development/testing
//!
//! ## Consistency
//!
//! Saves are whole-document replacements and the last writer wins. Worker
//! threads share one storage handle with the coordinator, so a model saved on
//! one worker is visible to every other.
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates:
//! - Async traits with the async-trait crate
//! - Trait objects (`Arc<dyn ModelStorage>`) shared across threads
//! - Handling lock poisoning instead of unwrapping it

use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::models::Model;
use crate::{PortflowError, Result};

/// Persistence for model instances.
///
/// ## Return Value
/// `find` returns `Result<Option<Model>>`:
/// - `Ok(Some(model))`: found it
/// - `Ok(None)`: no instance with that id (not an error)
/// - `Err(error)`: the backend failed
#[async_trait::async_trait]
pub trait ModelStorage: Send + Sync {
    /// Insert or replace an instance, returning what was stored.
    async fn save(&self, model: Model) -> Result<Model>;

    async fn find(&self, id: &Uuid) -> Result<Option<Model>>;

    /// List instances, optionally only those of one model name.
    async fn list(&self, model_name: Option<&str>) -> Result<Vec<Model>>;

    /// Remove an instance. Returns whether it existed.
    async fn delete(&self, id: &Uuid) -> Result<bool>;

    /// Like [`ModelStorage::find`], but a missing instance is an error.
    async fn load(&self, id: &Uuid) -> Result<Model> {
        self.find(id)
            .await?
            .ok_or_else(|| PortflowError::ModelNotFound(id.to_string()))
    }
}

/// In-memory storage for development, tests and single-process deployments.
///
/// ## Limitations
///
/// - **Not persistent**: data is lost when the process exits
/// - **Not distributed**: shared by threads of one process only
#[derive(Default)]
pub struct InMemoryModelStorage {
    models: RwLock<HashMap<Uuid, Model>>,
}

impl InMemoryModelStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> PortflowError {
        PortflowError::Internal("model storage lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl ModelStorage for InMemoryModelStorage {
    async fn save(&self, model: Model) -> Result<Model> {
        let mut models = self.models.write().map_err(|_| Self::poisoned())?;
        models.insert(model.id, model.clone());
        Ok(model)
    }

    async fn find(&self, id: &Uuid) -> Result<Option<Model>> {
        let models = self.models.read().map_err(|_| Self::poisoned())?;
        Ok(models.get(id).cloned())
    }

    async fn list(&self, model_name: Option<&str>) -> Result<Vec<Model>> {
        let models = self.models.read().map_err(|_| Self::poisoned())?;
        let mut found: Vec<Model> = models
            .values()
            .filter(|model| match model_name {
                Some(name) => model.model_name.eq_ignore_ascii_case(name),
                None => true,
            })
            .cloned()
            .collect();
        found.sort_by_key(|model| model.created_at);
        Ok(found)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool> {
        let mut models = self.models.write().map_err(|_| Self::poisoned())?;
        Ok(models.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn saves_replace_the_stored_copy() {
        let storage = InMemoryModelStorage::new();
        let mut model = storage.save(Model::new("order", json!({"qty": 1}))).await.unwrap();

        model.record_port("reserve");
        storage.save(model.clone()).await.unwrap();

        let loaded = storage.load(&model.id).await.unwrap();
        assert_eq!(loaded.port_flow(), ["reserve".to_string()]);
    }

    #[tokio::test]
    async fn list_filters_by_model_name() {
        let storage = InMemoryModelStorage::new();
        storage.save(Model::new("order", json!({}))).await.unwrap();
        storage.save(Model::new("order", json!({}))).await.unwrap();
        storage.save(Model::new("invoice", json!({}))).await.unwrap();

        assert_eq!(storage.list(Some("Order")).await.unwrap().len(), 2);
        assert_eq!(storage.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_models_are_none_for_find_and_errors_for_load() {
        let storage = InMemoryModelStorage::new();
        let id = Uuid::new_v4();
        assert!(storage.find(&id).await.unwrap().is_none());
        assert!(matches!(storage.load(&id).await, Err(PortflowError::ModelNotFound(_))));
        assert!(!storage.delete(&id).await.unwrap());
    }
}
