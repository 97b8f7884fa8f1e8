// crates/flowcontext/tests/context_tests.rs

use flowcontext::{
    ContextError, ContextManager, ContextSettings, ContextStore, Entry, MemoryStore, StorageConfig, StoreConfig,
    StoreFactory,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn seeded(seed: Value) -> ContextSettings {
    ContextSettings {
        function_global_context: seed.as_object().cloned().unwrap_or_default(),
        ..ContextSettings::default()
    }
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_parent_of_flow_is_global() {
    let manager = ContextManager::default();
    manager.load().await.unwrap();

    let global = manager.global();
    global.set("x", json!(42), None).unwrap();

    let flow = manager.get_flow_context("f1", "global");
    let via_parent = flow.get("$parent.x", None).unwrap().into_value();
    let direct = global.get("x", None).unwrap().into_value();
    assert_eq!(via_parent, direct);
    assert_eq!(via_parent, Some(json!(42)));

    let parent = flow.get("$parent", None).unwrap();
    let parent = parent.context().expect("$parent should resolve to a context");
    assert!(Arc::ptr_eq(parent, &global), "$parent must be the global context itself");
}

#[tokio::test]
async fn test_node_parent_chain() {
    let manager = ContextManager::default();
    let node = manager.get("n1", Some("f1"));
    assert_eq!(node.scope(), "n1:f1");

    node.flow().unwrap().set("count", json!(3), None).unwrap();
    manager.global().set("limit", json!(10), None).unwrap();

    assert_eq!(node.get("$parent.count", None).unwrap().into_value(), Some(json!(3)));
    assert_eq!(
        node.get("$parent.$parent.limit", None).unwrap().into_value(),
        Some(json!(10))
    );
    assert!(node.get("$parent.$parent.$parent.limit", None).unwrap().is_missing());

    node.set("$parent.written", json!("up"), None).unwrap();
    assert_eq!(
        node.flow().unwrap().get("written", None).unwrap().into_value(),
        Some(json!("up"))
    );
}

#[tokio::test]
async fn test_global_seed_precedence() {
    let manager = ContextManager::new(seeded(json!({"os": "linux", "shared": {"depth": 1}})));
    manager.load().await.unwrap();
    let global = manager.global();

    assert_eq!(global.get("os", None).unwrap().into_value(), Some(json!("linux")));
    assert_eq!(global.get("shared.depth", None).unwrap().into_value(), Some(json!(1)));

    global.set("os", json!("stored"), None).unwrap();
    assert_eq!(global.get("os", None).unwrap().into_value(), Some(json!("stored")));

    global.set("extra", json!(true), None).unwrap();
    let keys = global.keys(None).unwrap();
    assert_eq!(keys, ids(&["os", "shared", "extra"]));
}

#[tokio::test]
async fn test_seed_keys_can_be_hidden() {
    let settings = ContextSettings {
        export_global_context_keys: false,
        ..seeded(json!({"hidden": 1}))
    };
    let manager = ContextManager::new(settings);
    let global = manager.global();
    assert!(global.keys(None).unwrap().is_empty());
    assert_eq!(global.get("hidden", None).unwrap().into_value(), Some(json!(1)));
}

#[tokio::test]
async fn test_seed_is_never_written() {
    let manager = ContextManager::new(seeded(json!({"k": 1})));
    let global = manager.global();
    global.set("k", Option::<Value>::None, None).unwrap();
    assert_eq!(global.get("k", None).unwrap().into_value(), Some(json!(1)));
}

#[tokio::test]
async fn test_get_many_and_async_access() {
    let manager = ContextManager::new(seeded(json!({"b": "seed"})));
    let global = manager.global();
    global.set_async("a", json!(1), None).await.unwrap();

    let values = global.get_many_async(&["a", "b", "c"], None).await.unwrap();
    assert_eq!(values, vec![Some(json!(1)), Some(json!("seed")), None]);

    assert_eq!(global.get_many(&[], None), Err(ContextError::InvalidKey));
    assert_eq!(global.get_many(&["a", ""], None), Err(ContextError::InvalidKey));
    assert!(matches!(global.get("", None), Err(ContextError::InvalidKey)));
}

#[tokio::test]
async fn test_default_alias_listing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Map::new();
    config.insert("dir".into(), json!(dir.path().to_str().unwrap()));
    let settings = ContextSettings {
        context_storage: StorageConfig::new()
            .with_store("fileStore", "localfilesystem", config)
            .with_store("mem", "memory", Map::new())
            .with_default("fileStore"),
        ..ContextSettings::default()
    };
    let manager = ContextManager::new(settings);
    manager.load().await.unwrap();

    let listing = manager.list_stores();
    assert_eq!(listing.default, "fileStore");
    assert_eq!(listing.stores, ids(&["mem"]));
    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_first_store_becomes_default() {
    let settings = ContextSettings {
        context_storage: StorageConfig::new()
            .with_store("a", "memory", Map::new())
            .with_store("b", "memory", Map::new()),
        ..ContextSettings::default()
    };
    let manager = ContextManager::new(settings);
    manager.load().await.unwrap();
    let listing = manager.list_stores();
    assert_eq!(listing.default, "a");
    assert_eq!(listing.stores, ids(&["b"]));
}

#[tokio::test]
async fn test_unconfigured_uses_builtin_memory() {
    let manager = ContextManager::default();
    manager.load().await.unwrap();
    let listing = manager.list_stores();
    assert_eq!(listing.default, "memory");
    assert!(listing.stores.is_empty());
}

#[tokio::test]
async fn test_unknown_store_warns_once() {
    let manager = ContextManager::default();
    manager.load().await.unwrap();
    let node = manager.get("n1", Some("f1"));

    node.set("k", json!("v"), Some("bogus")).unwrap();
    let value = node.get("k", Some("bogus")).unwrap().into_value();
    assert_eq!(value, Some(json!("v")), "fallback store should serve both requests");
    assert_eq!(manager.unknown_store_warnings(), 1);

    node.get("#:(other)::k", None).unwrap();
    assert_eq!(manager.unknown_store_warnings(), 2);
}

#[tokio::test]
async fn test_store_prefix_in_key() {
    let settings = ContextSettings {
        context_storage: StorageConfig::new()
            .with_store("default", "memory", Map::new())
            .with_store("other", "memory", Map::new()),
        ..ContextSettings::default()
    };
    let manager = ContextManager::new(settings);
    manager.load().await.unwrap();
    let flow = manager.get_flow_context("f1", "global");

    flow.set("#:(other)::k", json!("other"), None).unwrap();
    flow.set("k", json!("default"), None).unwrap();
    assert_eq!(flow.get("k", Some("other")).unwrap().into_value(), Some(json!("other")));
    assert_eq!(flow.get("k", None).unwrap().into_value(), Some(json!("default")));
    assert_eq!(manager.unknown_store_warnings(), 0);
}

#[tokio::test]
async fn test_oversized_array_index_is_rejected() {
    let manager = ContextManager::new(ContextSettings::default());
    manager.load().await.unwrap();
    let ctx = manager.get("n1", Some("f1"));

    for key in ["a[18446744073709551615]", "a[4000000000]"] {
        let err = ctx.set(key, json!(1), None).unwrap_err();
        assert!(matches!(err, ContextError::InvalidExpression(_)));
    }
    ctx.set("a[2]", json!(1), None).unwrap();
    assert_eq!(ctx.get("a", None).unwrap().into_value(), Some(json!([null, null, 1])));
}

#[tokio::test]
async fn test_invalid_configurations_abort_load() {
    let bad_name = StorageConfig::new().with_store("my-store", "memory", Map::new());
    let missing_alias = StorageConfig::new()
        .with_store("a", "memory", Map::new())
        .with_default("nope");
    let no_module = StorageConfig::from_json(json!({"a": {"config": {}}}).as_object().unwrap());
    let unknown_module = StorageConfig::new().with_store("a", "redis", Map::new());
    let huge_interval = StorageConfig::new().with_store(
        "file",
        "localfilesystem",
        json!({"dir": "unused", "flushInterval": 1e300}).as_object().cloned().unwrap(),
    );

    for (storage, check) in [
        (bad_name, "name"),
        (missing_alias, "alias"),
        (no_module, "module"),
        (unknown_module, "unknown"),
        (huge_interval, "interval"),
    ] {
        let manager = ContextManager::new(ContextSettings {
            context_storage: storage,
            ..ContextSettings::default()
        });
        let err = manager.load().await.unwrap_err();
        match check {
            "name" => assert_eq!(err, ContextError::InvalidStoreName("my-store".into())),
            "alias" => assert_eq!(err, ContextError::InvalidDefaultStore("nope".into())),
            "module" => assert_eq!(err, ContextError::ModuleNotDefined("a".into())),
            "interval" => match err {
                ContextError::LoadFailed { module, message } => {
                    assert_eq!(module, "localfilesystem");
                    assert!(message.contains("flushInterval"));
                }
                other => panic!("unexpected error: {other}"),
            },
            _ => assert!(matches!(err, ContextError::LoadFailed { .. })),
        }
    }
}

struct CountingFactory {
    opens: Arc<AtomicUsize>,
}

struct CountingStore {
    inner: MemoryStore,
    opens: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ContextStore for CountingStore {
    async fn open(&self) -> Result<(), ContextError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn close(&self) -> Result<(), ContextError> {
        Ok(())
    }
    async fn get(&self, scope: &str, keys: &[String]) -> Result<Vec<Option<Value>>, ContextError> {
        ContextStore::get(&self.inner, scope, keys).await
    }
    async fn set(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<(), ContextError> {
        ContextStore::set(&self.inner, scope, entries).await
    }
    async fn keys(&self, scope: &str) -> Result<Vec<String>, ContextError> {
        ContextStore::keys(&self.inner, scope).await
    }
    async fn delete(&self, scope: &str) -> Result<(), ContextError> {
        ContextStore::delete(&self.inner, scope).await
    }
    async fn clean(&self, active_ids: &[String]) -> Result<(), ContextError> {
        ContextStore::clean(&self.inner, active_ids).await
    }
}

impl StoreFactory for CountingFactory {
    fn create(&self, _config: StoreConfig) -> Result<Arc<dyn ContextStore>, ContextError> {
        Ok(Arc::new(CountingStore {
            inner: MemoryStore::new(),
            opens: self.opens.clone(),
        }))
    }

    fn module(&self) -> &str {
        "counting"
    }
}

#[tokio::test]
async fn test_async_only_store_via_factory() {
    let opens = Arc::new(AtomicUsize::new(0));
    let factory = Arc::new(CountingFactory { opens: opens.clone() });
    let settings = ContextSettings {
        context_storage: StorageConfig::new()
            .with_factory("custom", factory, Map::new())
            .with_default("custom"),
        ..ContextSettings::default()
    };
    let manager = ContextManager::new(settings);
    manager.load().await.unwrap();
    assert_eq!(opens.load(Ordering::SeqCst), 1, "each store opens exactly once");

    let global = manager.global();
    assert!(matches!(
        global.get("k", None),
        Err(ContextError::SyncUnsupported(_))
    ));
    global.set_async("k", json!(5), None).await.unwrap();
    assert_eq!(global.get_async("k", None).await.unwrap().into_value(), Some(json!(5)));
}

#[tokio::test]
async fn test_clean_drops_inactive_scopes() {
    let manager = ContextManager::default();
    let keep = manager.get("n1", Some("f1"));
    let drop = manager.get("n2", Some("f1"));
    keep.set("v", json!(1), None).unwrap();
    drop.set("v", json!(2), None).unwrap();

    manager.clean(&ids(&["n1", "f1"])).await.unwrap();

    let again = manager.get("n2", Some("f1"));
    assert!(!Arc::ptr_eq(&again, &drop), "cached context should be discarded");
    assert!(matches!(again.get("v", None).unwrap(), Entry::Missing));
    assert!(Arc::ptr_eq(&manager.get("n1", Some("f1")), &keep));
    assert_eq!(keep.get("v", None).unwrap().into_value(), Some(json!(1)));
}

#[tokio::test]
async fn test_delete_only_touches_builtin_memory() {
    let manager = ContextManager::default();
    let node = manager.get("n1", Some("f1"));
    node.set("v", json!(1), None).unwrap();
    manager.delete("n1", Some("f1")).await.unwrap();
    assert!(manager.get("n1", Some("f1")).get("v", None).unwrap().is_missing());

    let configured = ContextManager::new(ContextSettings {
        context_storage: StorageConfig::new().with_store("m", "memory", Map::new()),
        ..ContextSettings::default()
    });
    configured.load().await.unwrap();
    let node = configured.get("n1", Some("f1"));
    node.set("v", json!(1), None).unwrap();
    configured.delete("n1", Some("f1")).await.unwrap();
    assert_eq!(node.get("v", None).unwrap().into_value(), Some(json!(1)));
}

#[tokio::test]
async fn test_missing_parent_flow_is_inert() {
    let manager = ContextManager::default();
    let sub = manager.get_flow_context("sub", "missing");
    sub.set("$parent.k", json!(1), None).unwrap();
    assert!(sub.get("$parent.k", None).unwrap().is_missing());
    assert!(sub.get("$parent.$parent", None).unwrap().is_missing());
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let settings = || ContextSettings {
        user_dir: Some(dir.path().to_path_buf()),
        context_storage: StorageConfig::new().with_store("file", "localfilesystem", Map::new()),
        ..ContextSettings::default()
    };

    let manager = ContextManager::new(settings());
    manager.load().await.unwrap();
    manager.get("n1", Some("f1")).set("count", json!(7), None).unwrap();
    manager.close().await.unwrap();

    let restarted = ContextManager::new(settings());
    restarted.load().await.unwrap();
    let value = restarted.get("n1", Some("f1")).get("count", None).unwrap().into_value();
    assert_eq!(value, Some(json!(7)));
    restarted.close().await.unwrap();
}
