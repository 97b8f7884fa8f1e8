//! In-memory context store.
//!
//! Each scope is one JSON object behind a `RwLock`. This is the built-in
//! default store and supports both blocking and async access.

use crate::path;
use crate::store::{scope_is_active, ContextStore, StoreConfig, StoreFactory, SyncAccess};
use crate::ContextError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of a scope's object
    pub fn export_scope(&self, scope: &str) -> Option<Value> {
        self.read().get(scope).cloned()
    }

    /// Replace a scope's object wholesale
    pub fn import_scope(&self, scope: impl Into<String>, value: Map<String, Value>) {
        self.write().insert(scope.into(), Value::Object(value));
    }

    pub fn scopes(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn remove_scope(&self, scope: &str) {
        self.write().remove(scope);
    }

    pub fn retain_active(&self, active_ids: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.write().retain(|scope, _| {
            let keep = scope_is_active(scope, active_ids);
            if !keep {
                removed.push(scope.clone());
            }
            keep
        });
        removed
    }
}

impl SyncAccess for MemoryStore {
    fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError> {
        let paths = keys
            .iter()
            .map(|k| path::parse(k))
            .collect::<Result<Vec<_>, _>>()?;
        let data = self.read();
        Ok(paths
            .iter()
            .map(|p| data.get(scope).and_then(|obj| path::get(obj, p)).cloned())
            .collect())
    }

    fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError> {
        let parsed = entries
            .into_iter()
            .map(|(k, v)| path::parse(&k).map(|p| (p, v)))
            .collect::<Result<Vec<_>, _>>()?;
        let mut data = self.write();
        let obj = data
            .entry(scope.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for (p, value) in parsed {
            path::set(obj, &p, value);
        }
        Ok(())
    }

    fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        Ok(match self.read().get(scope) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn open(&self) -> Result<(), ContextError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ContextError> {
        Ok(())
    }

    async fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError> {
        SyncAccess::get(self, scope, keys)
    }

    async fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError> {
        SyncAccess::set(self, scope, entries)
    }

    async fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        SyncAccess::keys(self, scope)
    }

    async fn delete(&self, scope: &str) -> Result<(), ContextError> {
        self.remove_scope(scope);
        Ok(())
    }

    async fn clean(&self, active_ids: &[String]) -> Result<(), ContextError> {
        self.retain_active(active_ids);
        Ok(())
    }

    fn sync_access(&self) -> Option<&dyn SyncAccess> {
        Some(self)
    }
}

pub struct MemoryStoreFactory;

impl StoreFactory for MemoryStoreFactory {
    fn create(&self, _config: StoreConfig) -> Result<Arc<dyn ContextStore>, ContextError> {
        Ok(Arc::new(MemoryStore::new()))
    }

    fn module(&self) -> &str {
        "memory"
    }
}
