//! File-backed context store, registered as the `localfilesystem` module.
//!
//! Layout under `<dir>/<base>`:
//! ```text
//! global/global.json      global scope
//! <flow>/flow.json        flow scope
//! <flow>/<node>.json      node scope (`node:flow`)
//! ```
//! With `cache` enabled (the default) every scope is loaded at open, reads and
//! writes hit the in-memory copy, and dirty scopes are written back every
//! `flushInterval` seconds and on close.

use crate::memory::MemoryStore;
use crate::path;
use crate::store::{scope_is_active, ContextStore, StoreConfig, StoreFactory, SyncAccess};
use crate::ContextError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE: &str = "context";
const DEFAULT_FLUSH_INTERVAL_SECS: f64 = 30.0;

pub struct FileStore {
    inner: Arc<Inner>,
    flush_interval: Duration,
    flusher: Mutex<Option<Flusher>>,
}

struct Flusher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    base: PathBuf,
    cache: Option<MemoryStore>,
    dirty: Mutex<HashSet<String>>,
    /// Held while files are written so overlapping flushes do not race.
    io: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(base: impl Into<PathBuf>, cache: bool, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                base: base.into(),
                cache: cache.then(MemoryStore::new),
                dirty: Mutex::new(HashSet::new()),
                io: tokio::sync::Mutex::new(()),
            }),
            flush_interval,
            flusher: Mutex::new(None),
        }
    }

    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    /// Write every dirty scope to disk now.
    pub async fn flush(&self) -> Result<(), ContextError> {
        self.inner.flush().await
    }

    fn start_flusher(&self) {
        if self.flush_interval.is_zero() {
            return;
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = self.inner.clone();
        let interval = self.flush_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = inner.flush().await {
                            tracing::warn!("Context flush to {} failed: {}", inner.base.display(), e);
                        }
                    }
                }
            }
        });
        *self.flusher.lock().unwrap_or_else(PoisonError::into_inner) = Some(Flusher { cancel, handle });
    }

    fn flusher_running(&self) -> bool {
        self.flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Path of the file holding `scope`. Each part of the scope id is escaped
/// into a single path component so ids cannot leave the base directory.
fn storage_path(base: &Path, scope: &str) -> PathBuf {
    let mut parts = scope.splitn(2, ':');
    let first = parts.next().unwrap_or(scope);
    match parts.next() {
        Some(flow) => base
            .join(encode_component(flow))
            .join(format!("{}.json", encode_component(first))),
        None if scope == "global" => base.join("global").join("global.json"),
        None => base.join(encode_component(scope)).join("flow.json"),
    }
}

/// Inverse of [`storage_path`]: directory name and file stem to scope id.
fn scope_from_path(dir: &str, stem: &str) -> String {
    match (dir, stem) {
        ("global", "global") => "global".to_string(),
        (flow, "flow") => decode_component(flow),
        (flow, node) => format!("{}:{}", decode_component(node), decode_component(flow)),
    }
}

fn encode_component(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    if !out.is_empty() && out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
    }
    out
}

fn decode_component(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let escaped = rest
            .get(at + 1..at + 3)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .filter(u8::is_ascii);
        match escaped {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[at + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[at + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

impl Inner {
    fn mark_dirty(&self, scope: &str) {
        self.dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.to_string());
    }

    async fn read_scope(&self, scope: &str) -> Result<Map<String, Value>, ContextError> {
        read_file(&storage_path(&self.base, scope)).await
    }

    async fn write_scope(&self, scope: &str, data: Option<Map<String, Value>>) -> Result<(), ContextError> {
        let path = storage_path(&self.base, scope);
        match data {
            Some(map) if !map.is_empty() => {
                if let Some(dir) = path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                let tmp = path.with_extension("json.tmp");
                let contents = serde_json::to_string_pretty(&Value::Object(map))?;
                tokio::fs::write(&tmp, contents).await?;
                tokio::fs::rename(&tmp, &path).await?;
                Ok(())
            }
            _ => remove_file(&path).await,
        }
    }

    async fn flush(&self) -> Result<(), ContextError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let _io = self.io.lock().await;
        let scopes: Vec<String> = self
            .dirty
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (i, scope) in scopes.iter().enumerate() {
            let data = match cache.export_scope(scope) {
                Some(Value::Object(map)) => Some(map),
                _ => None,
            };
            if let Err(e) = self.write_scope(scope, data).await {
                let mut dirty = self.dirty.lock().unwrap_or_else(PoisonError::into_inner);
                dirty.extend(scopes[i..].iter().cloned());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Every `(scope, path)` pair currently on disk.
    async fn stored_scopes(&self) -> Result<Vec<(String, PathBuf)>, ContextError> {
        let mut found = Vec::new();
        let mut dirs = match tokio::fs::read_dir(&self.base).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = dir.file_name().to_string_lossy().into_owned();
            let mut files = tokio::fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    found.push((scope_from_path(&dir_name, stem), path.clone()));
                }
            }
        }
        Ok(found)
    }
}

async fn read_file(path: &Path) -> Result<Map<String, Value>, ContextError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<Value>(&contents)? {
            Value::Object(map) => Ok(map),
            _ => Err(ContextError::Serialization(format!(
                "{} does not contain a JSON object",
                path.display()
            ))),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_file(path: &Path) -> Result<(), ContextError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl SyncAccess for FileStore {
    fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError> {
        match &self.inner.cache {
            Some(cache) => SyncAccess::get(cache, scope, keys),
            None => Err(ContextError::SyncUnsupported("localfilesystem".to_string())),
        }
    }

    fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError> {
        let Some(cache) = &self.inner.cache else {
            return Err(ContextError::SyncUnsupported("localfilesystem".to_string()));
        };
        SyncAccess::set(cache, scope, entries)?;
        self.inner.mark_dirty(scope);
        if !self.flusher_running() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    if let Err(e) = inner.flush().await {
                        tracing::warn!("Context flush to {} failed: {}", inner.base.display(), e);
                    }
                });
            }
        }
        Ok(())
    }

    fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        match &self.inner.cache {
            Some(cache) => SyncAccess::keys(cache, scope),
            None => Err(ContextError::SyncUnsupported("localfilesystem".to_string())),
        }
    }
}

#[async_trait]
impl ContextStore for FileStore {
    async fn open(&self) -> Result<(), ContextError> {
        tokio::fs::create_dir_all(&self.inner.base).await?;
        if let Some(cache) = &self.inner.cache {
            for (scope, path) in self.inner.stored_scopes().await? {
                cache.import_scope(scope, read_file(&path).await?);
            }
            self.start_flusher();
        }
        tracing::debug!("Opened context store at {}", self.inner.base.display());
        Ok(())
    }

    async fn close(&self) -> Result<(), ContextError> {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flusher) = flusher {
            flusher.cancel.cancel();
            let _ = flusher.handle.await;
        }
        self.inner.flush().await
    }

    async fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError> {
        if let Some(cache) = &self.inner.cache {
            return SyncAccess::get(cache, scope, keys);
        }
        let paths = keys
            .iter()
            .map(|k| path::parse(k))
            .collect::<Result<Vec<_>, _>>()?;
        let data = Value::Object(self.inner.read_scope(scope).await?);
        Ok(paths.iter().map(|p| path::get(&data, p).cloned()).collect())
    }

    async fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError> {
        if let Some(cache) = &self.inner.cache {
            SyncAccess::set(cache, scope, entries)?;
            self.inner.mark_dirty(scope);
            if !self.flusher_running() {
                self.inner.flush().await?;
            }
            return Ok(());
        }
        let parsed = entries
            .into_iter()
            .map(|(k, v)| path::parse(&k).map(|p| (p, v)))
            .collect::<Result<Vec<_>, _>>()?;
        let _io = self.inner.io.lock().await;
        let mut data = Value::Object(self.inner.read_scope(scope).await?);
        for (p, value) in parsed {
            path::set(&mut data, &p, value);
        }
        let map = match data {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self.inner.write_scope(scope, map).await
    }

    async fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        if let Some(cache) = &self.inner.cache {
            return SyncAccess::keys(cache, scope);
        }
        Ok(self.inner.read_scope(scope).await?.keys().cloned().collect())
    }

    async fn delete(&self, scope: &str) -> Result<(), ContextError> {
        if let Some(cache) = &self.inner.cache {
            cache.remove_scope(scope);
            self.inner
                .dirty
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(scope);
        }
        remove_file(&storage_path(&self.inner.base, scope)).await
    }

    async fn clean(&self, active_ids: &[String]) -> Result<(), ContextError> {
        if let Some(cache) = &self.inner.cache {
            let removed = cache.retain_active(active_ids);
            let mut dirty = self.inner.dirty.lock().unwrap_or_else(PoisonError::into_inner);
            for scope in &removed {
                dirty.remove(scope);
            }
        }
        for (scope, path) in self.inner.stored_scopes().await? {
            if !scope_is_active(&scope, active_ids) {
                remove_file(&path).await?;
                if let Some(dir) = path.parent() {
                    // Only succeeds once the directory is empty.
                    let _ = tokio::fs::remove_dir(dir).await;
                }
            }
        }
        Ok(())
    }

    fn sync_access(&self) -> Option<&dyn SyncAccess> {
        self.inner.cache.as_ref().map(|_| self as &dyn SyncAccess)
    }
}

pub struct FileStoreFactory;

impl StoreFactory for FileStoreFactory {
    fn create(&self, config: StoreConfig) -> Result<Arc<dyn ContextStore>, ContextError> {
        let dir = config
            .get_str("dir")
            .map(PathBuf::from)
            .or_else(|| config.settings.user_dir.clone())
            .ok_or_else(|| {
                ContextError::load_failed(
                    self.module(),
                    "no storage directory configured (set `dir` or the runtime userDir)",
                )
            })?;
        let base = config.get_str("base").unwrap_or(DEFAULT_BASE);
        let cache = config.get_bool("cache").unwrap_or(true);
        let interval = config
            .get_f64("flushInterval")
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS)
            .max(0.0);
        let interval = Duration::try_from_secs_f64(interval)
            .map_err(|e| ContextError::load_failed(self.module(), format!("invalid flushInterval {interval}: {e}")))?;
        Ok(Arc::new(FileStore::new(dir.join(base), cache, interval)))
    }

    fn module(&self) -> &str {
        "localfilesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(k: &str) -> Vec<String> {
        vec![k.to_string()]
    }

    #[test]
    fn storage_paths_follow_scope_shape() {
        let base = Path::new("/ctx");
        assert_eq!(storage_path(base, "global"), Path::new("/ctx/global/global.json"));
        assert_eq!(storage_path(base, "f1"), Path::new("/ctx/f1/flow.json"));
        assert_eq!(storage_path(base, "n1:f1"), Path::new("/ctx/f1/n1.json"));
        assert_eq!(scope_from_path("f1", "n1"), "n1:f1");
        assert_eq!(scope_from_path("f1", "flow"), "f1");
        assert_eq!(scope_from_path("global", "global"), "global");
    }

    #[test]
    fn scope_ids_stay_inside_the_base() {
        let base = Path::new("/ctx");
        assert_eq!(storage_path(base, "../../etc"), Path::new("/ctx/..%2F..%2Fetc/flow.json"));
        assert_eq!(storage_path(base, "..:.."), Path::new("/ctx/%2E%2E/%2E%2E.json"));
        assert_eq!(storage_path(base, "a/b:f\\1"), Path::new("/ctx/f%5C1/a%2Fb.json"));
        for scope in ["../../etc", "..:..", "a/b:f\\1", "50%:f1"] {
            let path = storage_path(base, scope);
            assert!(path.starts_with(base));
            let dir = path.parent().and_then(Path::file_name).and_then(|d| d.to_str()).unwrap();
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap();
            assert_eq!(scope_from_path(dir, stem), scope);
        }
    }

    #[tokio::test]
    async fn cached_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), true, Duration::from_secs(30));
        store.open().await.unwrap();
        ContextStore::set(&store, "n1:f1", vec![("count".into(), Some(json!(7)))])
            .await
            .unwrap();
        store.close().await.unwrap();
        assert!(dir.path().join("f1").join("n1.json").exists());

        let reopened = FileStore::new(dir.path(), true, Duration::from_secs(30));
        reopened.open().await.unwrap();
        let values = SyncAccess::get(&reopened, "n1:f1", &key("count")).unwrap();
        assert_eq!(values, vec![Some(json!(7))]);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn uncached_store_is_async_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), false, Duration::ZERO);
        store.open().await.unwrap();
        assert!(store.sync_access().is_none());

        ContextStore::set(&store, "global", vec![("a.b".into(), Some(json!("x")))])
            .await
            .unwrap();
        let values = ContextStore::get(&store, "global", &key("a")).await.unwrap();
        assert_eq!(values, vec![Some(json!({"b": "x"}))]);
        assert_eq!(ContextStore::keys(&store, "global").await.unwrap(), key("a"));
    }

    #[tokio::test]
    async fn clean_removes_inactive_scope_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), true, Duration::ZERO);
        store.open().await.unwrap();
        for scope in ["global", "n1:f1", "n2:f1"] {
            ContextStore::set(&store, scope, vec![("k".into(), Some(json!(1)))])
                .await
                .unwrap();
        }
        store.clean(&["n1".to_string(), "f1".to_string()]).await.unwrap();

        assert!(dir.path().join("global").join("global.json").exists());
        assert!(dir.path().join("f1").join("n1.json").exists());
        assert!(!dir.path().join("f1").join("n2.json").exists());
        assert_eq!(ContextStore::get(&store, "n2:f1", &key("k")).await.unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn rapid_sets_without_interval_end_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path(), true, Duration::ZERO));
        store.open().await.unwrap();
        for i in 0..200 {
            SyncAccess::set(store.as_ref(), "n1:f1", vec![("count".into(), Some(json!(i)))]).unwrap();
        }
        store.flush().await.unwrap();

        let on_disk = read_file(&dir.path().join("f1").join("n1.json")).await.unwrap();
        assert_eq!(on_disk.get("count"), Some(&json!(199)));
        assert!(!dir.path().join("f1").join("n1.json.tmp").exists());
        assert!(store.inner.dirty.lock().unwrap().is_empty());
        store.close().await.unwrap();
    }

    #[test]
    fn factory_requires_a_directory() {
        let err = FileStoreFactory.create(StoreConfig::default()).err().unwrap();
        assert!(matches!(err, ContextError::LoadFailed { .. }));
    }
}
