use crate::manager::Shared;
use crate::path;
use crate::ContextError;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Name of the default store slot.
pub const DEFAULT_STORE: &str = "_";

const PARENT: &str = "$parent";
const PARENT_PREFIX: &str = "$parent.";

/// Result of a single-key lookup.
#[derive(Debug, Clone)]
pub enum Entry {
    Missing,
    Value(Value),
    /// `$parent` resolves to the parent context itself.
    Context(Arc<Context>),
}

impl Entry {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Entry::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Entry::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&Arc<Context>> {
        match self {
            Entry::Context(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Entry::Missing)
    }
}

impl From<Option<Value>> for Entry {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Entry::Missing, Entry::Value)
    }
}

enum Route<'a> {
    Done(Entry),
    Local {
        ctx: &'a Context,
        key: &'a str,
        store: &'a str,
    },
}

/// Scoped key/value access for one node, flow or the global scope.
///
/// Node contexts delegate `$parent` to their flow, flow contexts to their
/// parent flow or the global context. The global context additionally falls
/// back to the seed values supplied at initialisation.
pub struct Context {
    scope: String,
    seed: Option<Value>,
    inert: bool,
    parent: Option<Arc<Context>>,
    flow: Option<Arc<Context>>,
    global: Option<Arc<Context>>,
    shared: Arc<Shared>,
}

impl Context {
    pub(crate) fn new_global(seed: Map<String, Value>, shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            scope: "global".to_string(),
            seed: Some(Value::Object(seed)),
            inert: false,
            parent: None,
            flow: None,
            global: None,
            shared,
        })
    }

    pub(crate) fn new_flow(
        id: impl Into<String>,
        parent: Arc<Context>,
        global: Option<Arc<Context>>,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scope: id.into(),
            seed: None,
            inert: false,
            parent: Some(parent),
            flow: None,
            global,
            shared,
        })
    }

    pub(crate) fn new_node(
        id: impl Into<String>,
        flow: Option<Arc<Context>>,
        global: Option<Arc<Context>>,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scope: id.into(),
            seed: None,
            inert: false,
            parent: flow.clone(),
            flow,
            global,
            shared,
        })
    }

    /// A context that holds nothing and ignores writes, standing in for a
    /// parent flow that has not been created.
    pub(crate) fn new_root(id: impl Into<String>, shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            scope: id.into(),
            seed: None,
            inert: true,
            parent: None,
            flow: None,
            global: None,
            shared,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub fn flow(&self) -> Option<&Arc<Context>> {
        self.flow.as_ref()
    }

    pub fn global(&self) -> Option<&Arc<Context>> {
        self.global.as_ref()
    }

    /// Look up one key. `store` overrides any `#:(store)::` prefix in the key.
    pub fn get(&self, key: &str, store: Option<&str>) -> Result<Entry, ContextError> {
        match self.route(key, store)? {
            Route::Done(entry) => Ok(entry),
            Route::Local { ctx, key, store } => {
                let mut values = ctx.get_local(&[key.to_string()], store)?;
                Ok(values.pop().flatten().into())
            }
        }
    }

    pub async fn get_async(&self, key: &str, store: Option<&str>) -> Result<Entry, ContextError> {
        match self.route(key, store)? {
            Route::Done(entry) => Ok(entry),
            Route::Local { ctx, key, store } => {
                let mut values = ctx.get_local_async(&[key.to_string()], store).await?;
                Ok(values.pop().flatten().into())
            }
        }
    }

    /// Look up several keys at once; values come back in key order.
    pub fn get_many(&self, keys: &[&str], store: Option<&str>) -> Result<Vec<Option<Value>>, ContextError> {
        let keys = validate_keys(keys)?;
        self.get_local(&keys, store.unwrap_or(DEFAULT_STORE))
    }

    pub async fn get_many_async(
        &self,
        keys: &[&str],
        store: Option<&str>,
    ) -> Result<Vec<Option<Value>>, ContextError> {
        let keys = validate_keys(keys)?;
        self.get_local_async(&keys, store.unwrap_or(DEFAULT_STORE)).await
    }

    /// Write one key. Setting `None` removes it; `$parent` on its own is ignored.
    pub fn set(&self, key: &str, value: impl Into<Option<Value>>, store: Option<&str>) -> Result<(), ContextError> {
        match self.route(key, store)? {
            Route::Done(_) => Ok(()),
            Route::Local { ctx, key, store } => {
                if ctx.inert {
                    return Ok(());
                }
                let backend = ctx.shared.resolve(store);
                let sync = backend
                    .sync_access()
                    .ok_or_else(|| ContextError::SyncUnsupported(store.to_string()))?;
                sync.set(&ctx.scope, vec![(key.to_string(), value.into())])
            }
        }
    }

    pub async fn set_async(
        &self,
        key: &str,
        value: impl Into<Option<Value>>,
        store: Option<&str>,
    ) -> Result<(), ContextError> {
        let value = value.into();
        match self.route(key, store)? {
            Route::Done(_) => Ok(()),
            Route::Local { ctx, key, store } => {
                if ctx.inert {
                    return Ok(());
                }
                let backend = ctx.shared.resolve(store);
                backend.set(&ctx.scope, vec![(key.to_string(), value)]).await
            }
        }
    }

    /// Keys held for this scope. For the global scope the seed's top-level
    /// keys are listed first unless key export is disabled.
    pub fn keys(&self, store: Option<&str>) -> Result<Vec<String>, ContextError> {
        if self.inert {
            return Ok(Vec::new());
        }
        let name = store.unwrap_or(DEFAULT_STORE);
        let backend = self.shared.resolve(name);
        let sync = backend
            .sync_access()
            .ok_or_else(|| ContextError::SyncUnsupported(name.to_string()))?;
        let keys = sync.keys(&self.scope)?;
        Ok(self.merge_seed_keys(keys))
    }

    pub async fn keys_async(&self, store: Option<&str>) -> Result<Vec<String>, ContextError> {
        if self.inert {
            return Ok(Vec::new());
        }
        let backend = self.shared.resolve(store.unwrap_or(DEFAULT_STORE));
        let keys = backend.keys(&self.scope).await?;
        Ok(self.merge_seed_keys(keys))
    }

    fn route<'a>(&'a self, key: &'a str, store: Option<&'a str>) -> Result<Route<'a>, ContextError> {
        if key.is_empty() {
            return Err(ContextError::InvalidKey);
        }
        let (prefixed, key) = path::split_store(key);
        let store = store.or(prefixed).unwrap_or(DEFAULT_STORE);

        if key == PARENT {
            return Ok(Route::Done(parent_entry(self)));
        }
        let Some(mut rest) = key.strip_prefix(PARENT_PREFIX) else {
            return Ok(Route::Local { ctx: self, key, store });
        };
        let mut ctx = self.parent.as_deref();
        while let Some(next) = rest.strip_prefix(PARENT_PREFIX) {
            ctx = ctx.and_then(|c| c.parent.as_deref());
            rest = next;
        }
        match ctx {
            None => Ok(Route::Done(Entry::Missing)),
            Some(ctx) if rest == PARENT => Ok(Route::Done(parent_entry(ctx))),
            Some(_) if rest.is_empty() => Ok(Route::Done(Entry::Missing)),
            Some(ctx) => Ok(Route::Local { ctx, key: rest, store }),
        }
    }

    fn get_local(&self, keys: &[String], store: &str) -> Result<Vec<Option<Value>>, ContextError> {
        if self.inert {
            return Ok(vec![None; keys.len()]);
        }
        let backend = self.shared.resolve(store);
        let sync = backend
            .sync_access()
            .ok_or_else(|| ContextError::SyncUnsupported(store.to_string()))?;
        let mut values = sync.get(&self.scope, keys)?;
        self.fill_from_seed(keys, &mut values)?;
        Ok(values)
    }

    async fn get_local_async(&self, keys: &[String], store: &str) -> Result<Vec<Option<Value>>, ContextError> {
        if self.inert {
            return Ok(vec![None; keys.len()]);
        }
        let backend = self.shared.resolve(store);
        let mut values = backend.get(&self.scope, keys).await?;
        self.fill_from_seed(keys, &mut values)?;
        Ok(values)
    }

    /// Seed values are read-time defaults; they never shadow stored values.
    fn fill_from_seed(&self, keys: &[String], values: &mut [Option<Value>]) -> Result<(), ContextError> {
        let Some(seed) = &self.seed else {
            return Ok(());
        };
        for (key, value) in keys.iter().zip(values.iter_mut()) {
            if value.is_none() {
                *value = path::get_expr(seed, key)?.cloned();
            }
        }
        Ok(())
    }

    fn merge_seed_keys(&self, keys: Vec<String>) -> Vec<String> {
        let seed_keys = match &self.seed {
            Some(Value::Object(seed)) if self.shared.export_global_keys() => seed.keys(),
            _ => return keys,
        };
        let mut merged: Vec<String> = seed_keys.cloned().collect();
        for key in keys {
            if !merged.contains(&key) {
                merged.push(key);
            }
        }
        merged
    }
}

fn parent_entry(ctx: &Context) -> Entry {
    ctx.parent.clone().map_or(Entry::Missing, Entry::Context)
}

fn validate_keys(keys: &[&str]) -> Result<Vec<String>, ContextError> {
    if keys.is_empty() || keys.iter().any(|k| k.is_empty()) {
        return Err(ContextError::InvalidKey);
    }
    Ok(keys.iter().map(|k| k.to_string()).collect())
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("scope", &self.scope)
            .field("parent", &self.parent.as_ref().map(|p| p.scope.as_str()))
            .finish()
    }
}
