//! Owner of every context object and of the configured store set.

use crate::context::{Context, DEFAULT_STORE};
use crate::store::{ContextStore, StoreConfig, StoreFactory, StoreRegistry, StoreSettings};
use crate::{ContextError, MemoryStore};
use futures::future::try_join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

/// Where a configured store comes from.
#[derive(Clone)]
pub enum StoreModule {
    /// A module registered in the [`StoreRegistry`], e.g. `memory`.
    Named(String),
    /// A factory supplied directly by the embedder.
    Factory(Arc<dyn StoreFactory>),
}

impl fmt::Debug for StoreModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreModule::Named(name) => f.debug_tuple("Named").field(name).finish(),
            StoreModule::Factory(factory) => f.debug_tuple("Factory").field(&factory.module()).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StorageEntry {
    /// `"default": "<name>"` selects another entry as the default store.
    Alias(String),
    Store {
        module: Option<StoreModule>,
        config: Map<String, Value>,
    },
}

/// Ordered `contextStorage` configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    entries: Vec<(String, StorageEntry)>,
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the settings-file form. Malformed entries are kept so that
    /// [`ContextManager::load`] can report them.
    pub fn from_json(map: &Map<String, Value>) -> Self {
        let entries = map
            .iter()
            .map(|(name, value)| {
                let entry = match value {
                    Value::String(target) => StorageEntry::Alias(target.clone()),
                    Value::Object(obj) => StorageEntry::Store {
                        module: obj
                            .get("module")
                            .and_then(Value::as_str)
                            .map(|m| StoreModule::Named(m.to_string())),
                        config: obj
                            .get("config")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default(),
                    },
                    _ => StorageEntry::Store {
                        module: None,
                        config: Map::new(),
                    },
                };
                (name.clone(), entry)
            })
            .collect();
        Self { entries }
    }

    pub fn with_store(mut self, name: impl Into<String>, module: impl Into<String>, config: Map<String, Value>) -> Self {
        self.entries.push((
            name.into(),
            StorageEntry::Store {
                module: Some(StoreModule::Named(module.into())),
                config,
            },
        ));
        self
    }

    pub fn with_factory(
        mut self,
        name: impl Into<String>,
        factory: Arc<dyn StoreFactory>,
        config: Map<String, Value>,
    ) -> Self {
        self.entries.push((
            name.into(),
            StorageEntry::Store {
                module: Some(StoreModule::Factory(factory)),
                config,
            },
        ));
        self
    }

    pub fn with_default(mut self, target: impl Into<String>) -> Self {
        self.entries.push(("default".to_string(), StorageEntry::Alias(target.into())));
        self
    }

    pub fn entries(&self) -> &[(String, StorageEntry)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub user_dir: Option<PathBuf>,
    /// Seed for the global context.
    pub function_global_context: Map<String, Value>,
    /// Whether seed keys are listed by `keys()` on the global context.
    pub export_global_context_keys: bool,
    pub context_storage: StorageConfig,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            user_dir: None,
            function_global_context: Map::new(),
            export_global_context_keys: true,
            context_storage: StorageConfig::default(),
        }
    }
}

/// Outcome of [`ContextManager::list_stores`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreListing {
    pub default: String,
    pub stores: Vec<String>,
}

struct Stores {
    named: HashMap<String, Arc<dyn ContextStore>>,
    default: Arc<dyn ContextStore>,
    default_name: String,
    listed: Vec<String>,
    configured: bool,
}

impl Stores {
    fn builtin() -> Self {
        Self {
            named: HashMap::new(),
            default: Arc::new(MemoryStore::new()),
            default_name: "memory".to_string(),
            listed: Vec::new(),
            configured: false,
        }
    }

    fn distinct(&self) -> Vec<(String, Arc<dyn ContextStore>)> {
        let all = self
            .named
            .iter()
            .map(|(name, store)| (name.clone(), store.clone()))
            .chain(std::iter::once((self.default_name.clone(), self.default.clone())));
        dedupe(all)
    }
}

fn dedupe(stores: impl Iterator<Item = (String, Arc<dyn ContextStore>)>) -> Vec<(String, Arc<dyn ContextStore>)> {
    let mut out: Vec<(String, Arc<dyn ContextStore>)> = Vec::new();
    for (name, store) in stores {
        let ptr = Arc::as_ptr(&store) as *const ();
        if !out.iter().any(|(_, s)| Arc::as_ptr(s) as *const () == ptr) {
            out.push((name, store));
        }
    }
    out
}

/// State shared between the manager and the contexts it hands out.
pub(crate) struct Shared {
    stores: RwLock<Stores>,
    warned: Mutex<HashMap<String, usize>>,
    warnings: AtomicUsize,
    export_global_keys: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            stores: RwLock::new(Stores::builtin()),
            warned: Mutex::new(HashMap::new()),
            warnings: AtomicUsize::new(0),
            export_global_keys: AtomicBool::new(true),
        }
    }

    fn stores(&self) -> RwLockReadGuard<'_, Stores> {
        self.stores.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_stores(&self, stores: Stores) {
        *self.stores.write().unwrap_or_else(PoisonError::into_inner) = stores;
    }

    pub(crate) fn export_global_keys(&self) -> bool {
        self.export_global_keys.load(Ordering::Relaxed)
    }

    /// Store for a name; unknown names fall back to the default with a
    /// single warning per name.
    pub(crate) fn resolve(&self, name: &str) -> Arc<dyn ContextStore> {
        let stores = self.stores();
        if name == DEFAULT_STORE {
            return stores.default.clone();
        }
        if let Some(store) = stores.named.get(name) {
            return store.clone();
        }
        if name != stores.default_name {
            self.warn_unknown(name);
        }
        stores.default.clone()
    }

    fn warn_unknown(&self, name: &str) {
        let mut warned = self.warned.lock().unwrap_or_else(PoisonError::into_inner);
        let count = warned.entry(name.to_string()).or_insert(0);
        if *count == 0 {
            tracing::warn!("Unknown context store '{}' specified. Using default store.", name);
            self.warnings.fetch_add(1, Ordering::Relaxed);
        }
        *count = count.saturating_add(1);
    }
}

/// Creates, caches and cleans up contexts, and manages the stores behind them.
pub struct ContextManager {
    registry: StoreRegistry,
    settings: RwLock<ContextSettings>,
    contexts: Mutex<HashMap<String, Arc<Context>>>,
    shared: Arc<Shared>,
}

impl ContextManager {
    pub fn new(settings: ContextSettings) -> Self {
        Self::with_registry(StoreRegistry::with_builtins(), settings)
    }

    pub fn with_registry(registry: StoreRegistry, settings: ContextSettings) -> Self {
        let manager = Self {
            registry,
            settings: RwLock::new(ContextSettings::default()),
            contexts: Mutex::new(HashMap::new()),
            shared: Arc::new(Shared::new()),
        };
        manager.init(settings);
        manager
    }

    /// Reset to the given settings: drops every cached context, recreates
    /// the global context and falls back to a fresh in-memory default store.
    pub fn init(&self, settings: ContextSettings) {
        self.shared
            .export_global_keys
            .store(settings.export_global_context_keys, Ordering::Relaxed);
        self.shared.replace_stores(Stores::builtin());

        let global = Context::new_global(settings.function_global_context.clone(), self.shared.clone());
        let mut contexts = self.contexts();
        contexts.clear();
        contexts.insert("global".to_string(), global);
        drop(contexts);

        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Instantiate and open the configured stores.
    pub async fn load(&self) -> Result<(), ContextError> {
        let (storage, store_settings) = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            (
                settings.context_storage.clone(),
                StoreSettings {
                    user_dir: settings.user_dir.clone(),
                },
            )
        };
        let entries: Vec<&(String, StorageEntry)> =
            storage.entries().iter().filter(|(name, _)| name != DEFAULT_STORE).collect();

        if entries.is_empty() {
            tracing::info!("Context store: 'default' [module=memory]");
            let default = self.shared.stores().default.clone();
            return default.open().await;
        }

        let has_default = entries.iter().any(|(name, _)| name == "default");
        let mut first: Option<String> = None;
        let mut alias: Option<String> = None;
        let mut named: HashMap<String, Arc<dyn ContextStore>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (name, entry) in &entries {
            if !valid_store_name(name) {
                return Err(ContextError::InvalidStoreName(name.clone()));
            }
            match entry {
                StorageEntry::Alias(target) if name == "default" => {
                    if !entries.iter().any(|(n, _)| n == target) {
                        return Err(ContextError::InvalidDefaultStore(target.clone()));
                    }
                    alias = Some(target.clone());
                }
                StorageEntry::Store {
                    module: Some(module),
                    config,
                } => {
                    if !has_default && first.is_none() {
                        first = Some(name.clone());
                    }
                    let factory = match module {
                        StoreModule::Named(module) => self
                            .registry
                            .get(module)
                            .ok_or_else(|| ContextError::load_failed(module, "module not registered"))?,
                        StoreModule::Factory(factory) => factory.clone(),
                    };
                    let store = factory
                        .create(StoreConfig {
                            config: config.clone(),
                            settings: store_settings.clone(),
                        })
                        .map_err(|e| match e {
                            e @ ContextError::LoadFailed { .. } => e,
                            other => ContextError::load_failed(factory.module(), other),
                        })?;
                    tracing::info!("Context store: '{}' [module={}]", name, factory.module());
                    named.insert(name.clone(), store);
                    order.push(name.clone());
                }
                _ => return Err(ContextError::ModuleNotDefined(name.clone())),
            }
        }

        let opening = dedupe(named.iter().map(|(n, s)| (n.clone(), s.clone())));
        try_join_all(opening.iter().map(|(name, store)| async move {
            store
                .open()
                .await
                .map_err(|e| ContextError::load_failed(name.as_str(), e))
        }))
        .await?;

        let default_name = alias
            .or_else(|| has_default.then(|| "default".to_string()))
            .or(first)
            .ok_or_else(|| ContextError::InvalidDefaultStore("default".to_string()))?;
        let default = named
            .get(&default_name)
            .cloned()
            .ok_or_else(|| ContextError::InvalidDefaultStore(default_name.clone()))?;
        let listed = order.into_iter().filter(|n| *n != default_name).collect();

        self.shared.replace_stores(Stores {
            named,
            default,
            default_name,
            listed,
            configured: true,
        });
        Ok(())
    }

    /// The default store's name and the other selectable store names.
    pub fn list_stores(&self) -> StoreListing {
        let stores = self.shared.stores();
        StoreListing {
            default: stores.default_name.clone(),
            stores: stores.listed.clone(),
        }
    }

    pub fn global(&self) -> Arc<Context> {
        let mut contexts = self.contexts();
        Self::global_in(&mut contexts, &self.shared)
    }

    /// Context for a node; with a flow id the node is scoped `node:flow`
    /// and its `$parent` is the flow context.
    pub fn get(&self, node_id: &str, flow_id: Option<&str>) -> Arc<Context> {
        let context_id = scope_id(node_id, flow_id);
        let mut contexts = self.contexts();
        if let Some(existing) = contexts.get(&context_id) {
            return existing.clone();
        }
        let global = Self::global_in(&mut contexts, &self.shared);
        let flow = flow_id.map(|flow_id| match contexts.get(flow_id) {
            Some(flow) => flow.clone(),
            None => {
                let flow = Context::new_flow(flow_id, global.clone(), Some(global.clone()), self.shared.clone());
                contexts.insert(flow_id.to_string(), flow.clone());
                flow
            }
        });
        let context = Context::new_node(context_id.clone(), flow, Some(global), self.shared.clone());
        contexts.insert(context_id, context.clone());
        context
    }

    /// Context for a flow nested under `parent_id` (a flow id or `global`).
    /// An unknown parent is replaced by an empty read-only root.
    pub fn get_flow_context(&self, flow_id: &str, parent_id: &str) -> Arc<Context> {
        let mut contexts = self.contexts();
        if let Some(existing) = contexts.get(flow_id) {
            return existing.clone();
        }
        let global = Self::global_in(&mut contexts, &self.shared);
        let parent = match contexts.get(parent_id) {
            Some(parent) => parent.clone(),
            None => {
                let root = Context::new_root(parent_id, self.shared.clone());
                contexts.insert(parent_id.to_string(), root.clone());
                root
            }
        };
        let context = Context::new_flow(flow_id, parent, Some(global), self.shared.clone());
        contexts.insert(flow_id.to_string(), context.clone());
        context
    }

    /// Forget a node's context. Data is only erased when running on the
    /// built-in memory store; configured stores keep it.
    pub async fn delete(&self, node_id: &str, flow_id: Option<&str>) -> Result<(), ContextError> {
        let (configured, default) = {
            let stores = self.shared.stores();
            (stores.configured, stores.default.clone())
        };
        if configured {
            return Ok(());
        }
        let context_id = scope_id(node_id, flow_id);
        self.contexts().remove(&context_id);
        default.delete(&context_id).await
    }

    /// Drop contexts and stored data for nodes not listed in `active_ids`.
    pub async fn clean(&self, active_ids: &[String]) -> Result<(), ContextError> {
        self.contexts().retain(|id, _| {
            let node = id.split(':').next().unwrap_or(id);
            id == "global" || active_ids.iter().any(|active| active == node)
        });
        let stores = self.shared.stores().distinct();
        try_join_all(stores.iter().map(|(_, store)| store.clean(active_ids))).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ContextError> {
        let stores = self.shared.stores().distinct();
        try_join_all(stores.iter().map(|(_, store)| store.close())).await?;
        Ok(())
    }

    /// Number of distinct unknown store names that have been warned about.
    pub fn unknown_store_warnings(&self) -> usize {
        self.shared.warnings.load(Ordering::Relaxed)
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<String, Arc<Context>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn global_in(contexts: &mut HashMap<String, Arc<Context>>, shared: &Arc<Shared>) -> Arc<Context> {
        contexts
            .entry("global".to_string())
            .or_insert_with(|| Context::new_global(Map::new(), shared.clone()))
            .clone()
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(ContextSettings::default())
    }
}

fn scope_id(node_id: &str, flow_id: Option<&str>) -> String {
    match flow_id {
        Some(flow_id) => format!("{node_id}:{flow_id}"),
        None => node_id.to_string(),
    }
}

fn valid_store_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn storage_config_keeps_file_order() {
        let raw = json!({
            "file": {"module": "localfilesystem", "config": {"dir": "/tmp"}},
            "default": "file",
            "broken": 3,
        });
        let storage = StorageConfig::from_json(raw.as_object().unwrap());
        let names: Vec<&str> = storage.entries().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["file", "default", "broken"]);
        assert!(matches!(&storage.entries()[1].1, StorageEntry::Alias(t) if t == "file"));
        assert!(matches!(&storage.entries()[2].1, StorageEntry::Store { module: None, .. }));
    }

    #[test]
    fn store_names_are_word_characters() {
        assert!(valid_store_name("file_2"));
        assert!(!valid_store_name("my-store"));
        assert!(!valid_store_name(""));
    }

    #[test]
    fn scope_ids() {
        assert_eq!(scope_id("n1", Some("f1")), "n1:f1");
        assert_eq!(scope_id("n1", None), "n1");
    }
}
