// crates/flowruntime/tests/runtime_tests.rs

use flowcore::{FlowConfig, Message, Node, NodeError, RuntimeEvent};
use flowruntime::{DeploySummary, FlowRuntime, NodeFactory, NodeRegistry, RuntimeConfig, RuntimeError, Settings};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Seen = Arc<Mutex<Vec<(String, Message)>>>;
type Closed = Arc<Mutex<Vec<(String, bool)>>>;

/// Records every message it receives.
struct Sink(Seen);

impl NodeFactory for Sink {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let seen = self.0.clone();
        let id = node.id().to_string();
        node.on_input(move |msg, _, _| {
            seen.lock().unwrap().push((id.clone(), msg));
            async { Ok(()) }
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "sink"
    }
}

/// Passes messages on; fails on `{"fail": true}` and reports a status for
/// `{"status": "..."}`. Records its close calls.
struct Relay(Closed);

impl NodeFactory for Relay {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        if node.property("broken").is_some() {
            return Err(NodeError::config("broken relay"));
        }
        let weak = node.handle();
        node.on_input(move |msg, send, _| {
            let node = weak.upgrade();
            async move {
                if msg.get("fail").is_some() {
                    return Err(NodeError::failed("relay failed"));
                }
                if let (Some(node), Some(text)) = (node, msg.get("status").and_then(Value::as_str)) {
                    node.status(text);
                }
                send.send(msg);
                Ok(())
            }
        });
        let closed = self.0.clone();
        let id = node.id().to_string();
        node.on_close_async(move |removed| {
            closed.lock().unwrap().push((id.clone(), removed));
            async { Ok(()) }
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "relay"
    }
}

/// Forwards whatever the flow routes to it; used for `catch` and `status`.
struct Forward(&'static str);

impl NodeFactory for Forward {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        node.on_input(|msg, send, _| async move {
            send.send(msg);
            Ok(())
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        self.0
    }
}

/// Sends one message once the deploy has started it.
struct Starter;

impl NodeFactory for Starter {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let sender = node.sender();
        node.events().on(flowruntime::NODES_STARTED, move |_| {
            sender.send(Message::with_payload("started"));
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "starter"
    }
}

/// Waits `ms` milliseconds inside its handler before passing the message on.
struct Sleeper;

impl NodeFactory for Sleeper {
    fn create(&self, node: &Arc<Node>) -> Result<(), NodeError> {
        let wait = Duration::from_millis(node.property("ms").and_then(Value::as_u64).unwrap_or(0));
        node.on_input(move |msg, send, _| async move {
            tokio::time::sleep(wait).await;
            send.send(msg);
            Ok(())
        });
        Ok(())
    }

    fn node_type(&self) -> &str {
        "sleeper"
    }
}

struct Harness {
    runtime: FlowRuntime,
    seen: Seen,
    closed: Closed,
}

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    init_tracing();
    let seen: Seen = Arc::default();
    let closed: Closed = Arc::default();
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(Sink(seen.clone())));
    registry.register(Arc::new(Relay(closed.clone())));
    registry.register(Arc::new(Forward("catch")));
    registry.register(Arc::new(Forward("status")));
    registry.register(Arc::new(Starter));
    registry.register(Arc::new(Sleeper));
    Harness {
        runtime: FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default()),
        seen,
        closed,
    }
}

fn config(value: Value) -> FlowConfig {
    FlowConfig::from_value(value).unwrap()
}

async fn wait_for(seen: &Seen, count: usize) -> Vec<(String, Message)> {
    for _ in 0..100 {
        if seen.lock().unwrap().len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    seen.lock().unwrap().clone()
}

fn chain() -> Value {
    json!([
        {"id": "f1", "type": "tab", "label": "Main"},
        {"id": "relay", "type": "relay", "z": "f1", "wires": [["out1", "out2"]]},
        {"id": "out1", "type": "sink", "z": "f1", "wires": []},
        {"id": "out2", "type": "sink", "z": "f1", "wires": []}
    ])
}

#[tokio::test]
async fn test_deploy_and_route() {
    let h = harness();
    let summary = h.runtime.deploy(config(chain())).await.unwrap();
    assert_eq!(summary.added, vec!["out1", "out2", "relay"]);
    assert_eq!(h.runtime.flow_ids().await, vec!["f1"]);

    let mut msg = Message::with_payload(json!({"n": 1}));
    msg.set_id("m1");
    h.runtime.inject("relay", msg).await.unwrap();

    let seen = wait_for(&h.seen, 2).await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "out1");
    assert_eq!(seen[1].0, "out2");
    assert!(seen.iter().all(|(_, m)| m.id() == Some("m1")));
    assert!(seen.iter().all(|(_, m)| m.payload() == Some(&json!({"n": 1}))));
}

#[tokio::test]
async fn test_slow_node_does_not_delay_others() {
    let h = harness();
    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "slow", "type": "sleeper", "z": "f1", "ms": 500, "wires": [["late"]]},
            {"id": "late", "type": "sink", "z": "f1"},
            {"id": "fast", "type": "relay", "z": "f1", "wires": [["quick"]]},
            {"id": "quick", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();

    let started = Instant::now();
    h.runtime.inject("slow", Message::with_payload(1)).await.unwrap();
    h.runtime.inject("fast", Message::with_payload(2)).await.unwrap();

    let seen = wait_for(&h.seen, 1).await;
    assert_eq!(seen[0].0, "quick");
    assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());

    let seen = wait_for(&h.seen, 2).await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].0, "late");
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn test_missing_types_fail_the_deploy() {
    let h = harness();
    let err = h
        .runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "a", "type": "mystery", "z": "f1"},
            {"id": "b", "type": "another", "z": "f1"},
            {"id": "c", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap_err();
    match err {
        RuntimeError::MissingTypes(types) => assert_eq!(types, vec!["another", "mystery"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.runtime.flow_ids().await.is_empty());
}

#[tokio::test]
async fn test_factory_failure_skips_node() {
    let h = harness();
    let summary = h
        .runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "bad", "type": "relay", "z": "f1", "broken": true},
            {"id": "good", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "bad");
    assert!(h.runtime.node("bad").await.is_none());
    assert!(h.runtime.node("good").await.is_some());
}

#[tokio::test]
async fn test_disabled_and_unsupported_nodes_are_skipped() {
    let h = harness();
    let summary = h
        .runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "f2", "type": "tab", "disabled": true},
            {"id": "sf", "type": "subflow"},
            {"id": "on", "type": "sink", "z": "f1"},
            {"id": "off", "type": "sink", "z": "f1", "d": true},
            {"id": "in-disabled", "type": "sink", "z": "f2"},
            {"id": "in-subflow", "type": "sink", "z": "sf"},
            {"id": "instance", "type": "subflow:sf", "z": "f1"},
            {"id": "config-node", "type": "sink"}
        ])))
        .await
        .unwrap();
    assert_eq!(summary.added, vec!["on"]);
}

#[tokio::test]
async fn test_redeploy_applies_differences() {
    let h = harness();
    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "keep", "type": "relay", "z": "f1", "wires": [["out1"]]},
            {"id": "rewire", "type": "relay", "z": "f1", "wires": [["out1"]]},
            {"id": "change", "type": "relay", "z": "f1", "mode": "a"},
            {"id": "drop", "type": "relay", "z": "f1"},
            {"id": "out1", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();
    let kept = h.runtime.node("keep").await.unwrap();
    let rewired = h.runtime.node("rewire").await.unwrap();

    let summary = h
        .runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "keep", "type": "relay", "z": "f1", "wires": [["out1"]]},
            {"id": "rewire", "type": "relay", "z": "f1", "wires": [["out2"]]},
            {"id": "change", "type": "relay", "z": "f1", "mode": "b"},
            {"id": "out1", "type": "sink", "z": "f1"},
            {"id": "out2", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();

    assert_eq!(
        summary,
        DeploySummary {
            added: vec!["out2".into()],
            changed: vec!["change".into()],
            rewired: vec!["rewire".into()],
            removed: vec!["drop".into()],
            failed: vec![],
        }
    );
    let mut closed = h.closed.lock().unwrap().clone();
    closed.sort();
    assert_eq!(closed, vec![("change".to_string(), false), ("drop".to_string(), true)]);

    assert!(Arc::ptr_eq(&kept, &h.runtime.node("keep").await.unwrap()));
    let now = h.runtime.node("rewire").await.unwrap();
    assert!(Arc::ptr_eq(&rewired, &now));
    assert_eq!(now.wires(), vec![vec!["out2".to_string()]]);
    assert_eq!(h.runtime.node("change").await.unwrap().property("mode"), Some(&json!("b")));
    assert!(h.runtime.node("drop").await.is_none());

    h.runtime.inject("rewire", Message::with_payload(1)).await.unwrap();
    let seen = wait_for(&h.seen, 1).await;
    assert_eq!(seen[0].0, "out2");
}

#[tokio::test]
async fn test_errors_go_to_catch_nodes() {
    let h = harness();
    let mut events = h.runtime.subscribe_events();
    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "relay", "type": "relay", "z": "f1", "name": "worker"},
            {"id": "elsewhere", "type": "catch", "z": "f1", "scope": ["other"], "wires": [["wrong"]]},
            {"id": "catcher", "type": "catch", "z": "f1", "scope": ["relay"], "wires": [["caught"]]},
            {"id": "caught", "type": "sink", "z": "f1"},
            {"id": "wrong", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();

    let mut msg = Message::with_payload("x");
    msg.set("fail", true);
    h.runtime.inject("relay", msg).await.unwrap();

    let seen = wait_for(&h.seen, 1).await;
    assert_eq!(seen.len(), 1);
    let (sink, caught) = &seen[0];
    assert_eq!(sink, "caught");
    let error = caught.get("error").unwrap();
    assert_eq!(error["message"], json!("relay failed"));
    assert_eq!(error["source"]["id"], json!("relay"));
    assert_eq!(error["source"]["name"], json!("worker"));
    assert_eq!(error["source"]["count"], json!(1));
    assert_eq!(caught.payload(), Some(&json!("x")));

    let mut handled = None;
    for _ in 0..50 {
        match events.recv().await.unwrap() {
            RuntimeEvent::NodeError {
                node_id,
                handled: was_handled,
                ..
            } if node_id == "relay" => {
                handled = Some(was_handled);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(handled, Some(true));
}

#[tokio::test]
async fn test_uncaught_catch_only_gets_leftovers() {
    let h = harness();
    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "relay", "type": "relay", "z": "f1"},
            {"id": "fallback", "type": "catch", "z": "f1", "uncaught": true, "wires": [["last"]]},
            {"id": "last", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();

    let mut msg = Message::new();
    msg.set("fail", true);
    h.runtime.inject("relay", msg).await.unwrap();
    let seen = wait_for(&h.seen, 1).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "last");
}

#[tokio::test]
async fn test_status_goes_to_status_nodes() {
    let h = harness();
    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "relay", "type": "relay", "z": "f1"},
            {"id": "watch", "type": "status", "z": "f1", "wires": [["log"]]},
            {"id": "log", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();

    let mut msg = Message::new();
    msg.set("status", "busy");
    h.runtime.inject("relay", msg).await.unwrap();

    let seen = wait_for(&h.seen, 1).await;
    assert_eq!(seen.len(), 1);
    let status = seen[0].1.get("status").unwrap();
    assert_eq!(status["text"], json!("busy"));
    assert_eq!(status["source"]["id"], json!("relay"));
    assert_eq!(status["source"]["type"], json!("relay"));
}

#[tokio::test]
async fn test_nodes_started_fires_for_new_nodes() {
    let h = harness();
    let flows = json!([
        {"id": "f1", "type": "tab"},
        {"id": "boot", "type": "starter", "z": "f1", "wires": [["log"]]},
        {"id": "log", "type": "sink", "z": "f1"}
    ]);
    h.runtime.deploy(config(flows.clone())).await.unwrap();
    assert_eq!(wait_for(&h.seen, 1).await.len(), 1);

    h.runtime.deploy(config(flows)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.seen.lock().unwrap().len(), 1, "unchanged nodes are not restarted");
}

#[tokio::test]
async fn test_stop_closes_everything() {
    let h = harness();
    let mut events = h.runtime.subscribe_events();
    h.runtime.deploy(config(chain())).await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        RuntimeEvent::FlowsStarted { flow_ids, .. } if flow_ids == vec!["f1".to_string()]
    ));

    h.runtime.close().await.unwrap();
    assert_eq!(h.closed.lock().unwrap().clone(), vec![("relay".to_string(), false)]);
    assert!(h.runtime.flow_ids().await.is_empty());
    assert!(h.runtime.inject("relay", Message::new()).await.is_err());
}

#[tokio::test]
async fn test_contexts_cleaned_on_redeploy() {
    let h = harness();
    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "f2", "type": "tab"},
            {"id": "a", "type": "sink", "z": "f1"},
            {"id": "b", "type": "sink", "z": "f2"}
        ])))
        .await
        .unwrap();
    let b = h.runtime.node("b").await.unwrap();
    b.context().flow().unwrap().set("count", json!(3), None).unwrap();
    h.runtime.contexts().global().set("shared", json!(true), None).unwrap();

    h.runtime
        .deploy(config(json!([
            {"id": "f1", "type": "tab"},
            {"id": "a", "type": "sink", "z": "f1"}
        ])))
        .await
        .unwrap();

    let fresh = h.runtime.contexts().get("b", Some("f2"));
    assert!(fresh.get("$parent.count", None).unwrap().is_missing());
    assert_eq!(
        h.runtime.contexts().global().get("shared", None).unwrap().into_value(),
        Some(json!(true))
    );
}

#[tokio::test]
async fn test_settings_file_configures_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        json!({
            "functionGlobalContext": {"region": "eu"},
            "contextStorage": {"mem": {"module": "memory"}}
        })
        .to_string(),
    )
    .unwrap();

    let settings = Settings::load(&path).await.unwrap();
    let runtime = FlowRuntime::with_config(settings.runtime_config());
    runtime.load().await.unwrap();
    let listing = runtime.contexts().list_stores();
    assert_eq!(listing.default, "mem");
    assert_eq!(
        runtime.contexts().global().get("region", None).unwrap().into_value(),
        Some(json!("eu"))
    );

    assert!(Settings::load(dir.path().join("missing.json")).await.is_err());
}
