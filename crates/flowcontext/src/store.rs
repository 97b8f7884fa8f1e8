use crate::{ContextError, FileStoreFactory, MemoryStoreFactory};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A pluggable persistence backend for context data.
///
/// Scopes are plain strings: `global`, a flow id, or `node:flow`.
/// Keys are property expressions (see [`crate::path`]).
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn open(&self) -> Result<(), ContextError>;

    async fn close(&self) -> Result<(), ContextError>;

    /// Read one value per key, in key order.
    async fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError>;

    /// Write each `(key, value)` pair; a `None` value deletes the key.
    async fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError>;

    async fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError>;

    /// Drop everything stored for a scope.
    async fn delete(&self, scope: &str) -> Result<(), ContextError>;

    /// Drop every scope whose node part is not in `active_ids`. `global` is always kept.
    async fn clean(&self, active_ids: &[String]) -> Result<(), ContextError>;

    /// Non-deferred access, for stores that can answer without awaiting.
    fn sync_access(&self) -> Option<&dyn SyncAccess> {
        None
    }
}

/// Blocking counterpart of the [`ContextStore`] data operations.
pub trait SyncAccess: Send + Sync {
    fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError>;

    fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError>;

    fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError>;
}

/// Settings a store is allowed to see. Nothing else from the runtime
/// settings is handed to store plugins.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    pub user_dir: Option<PathBuf>,
}

/// Configuration handed to a [`StoreFactory`].
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub config: Map<String, Value>,
    pub settings: StoreSettings,
}

impl StoreConfig {
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.config.get(name).and_then(Value::as_bool)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.config.get(name).and_then(Value::as_f64)
    }
}

/// Constructs store instances
pub trait StoreFactory: Send + Sync {
    fn create(&self, config: StoreConfig) -> Result<Arc<dyn ContextStore>, ContextError>;

    /// Module identifier used in logs and when resolving by name
    fn module(&self) -> &str;
}

/// Registry of named store constructors
#[derive(Clone)]
pub struct StoreRegistry {
    factories: HashMap<String, Arc<dyn StoreFactory>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the built-in `memory` and `localfilesystem` stores
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MemoryStoreFactory));
        registry.register(Arc::new(FileStoreFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn StoreFactory>) {
        let module = factory.module().to_string();
        tracing::debug!("Registering context store module: {}", module);
        self.factories.insert(module, factory);
    }

    pub fn get(&self, module: &str) -> Option<Arc<dyn StoreFactory>> {
        self.factories.get(module).cloned()
    }

    pub fn list_modules(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Which scopes survive a clean pass.
pub(crate) fn scope_is_active(scope: &str, active_ids: &[String]) -> bool {
    if scope == "global" {
        return true;
    }
    let node_part = scope.split(':').next().unwrap_or(scope);
    active_ids.iter().any(|id| id == node_part)
}
