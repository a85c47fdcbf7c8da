//! Integration tests for the module bridge.
//!
//! Each test writes a small deployment to a temp dir (config, manifests,
//! one interface) and starts real module bridges against it. The broker is
//! the in-process one; every test gets its own broker host so tests never
//! see each other's traffic.

use crossbeam::channel::{unbounded, Receiver, Sender};
use everest_bridge::{
    CallbackSurface, Descriptor, EverestError, EverestResult, ModuleArgs, ModuleBridge, PeerRef,
    Runtime, Subscriber, WireDocument,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Deployment fixture
// ---------------------------------------------------------------------------

/// `pong` serves `echo_api`; `relay` serves it too by forwarding to `pong`;
/// `ping` requires both.
struct Deployment {
    dir: tempfile::TempDir,
}

impl Deployment {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let d = Self { dir };
        d.write(
            "config.yaml",
            &format!(
                r#"
settings:
  mqtt_broker_host: "it-{}"
  call_timeout_ms: 5000
  log_filter: warn
active_modules:
  pong:
    module: Pong
  relay:
    module: Relay
    connections:
      upstream:
        - module_id: pong
          implementation_id: main
  ping:
    module: Ping
    connections:
      target:
        - module_id: pong
          implementation_id: main
      via_relay:
        - module_id: relay
          implementation_id: main
  ghost_type:
    module: NotInstalled
"#,
                uuid::Uuid::new_v4()
            ),
        );
        d.write(
            "modules/Pong/manifest.yaml",
            "description: answers\nprovides:\n  main:\n    interface: echo_api\n",
        );
        d.write(
            "modules/Relay/manifest.yaml",
            "provides:\n  main:\n    interface: echo_api\nrequires:\n  upstream:\n    interface: echo_api\n",
        );
        d.write(
            "modules/Ping/manifest.yaml",
            r#"
requires:
  target:
    interface: echo_api
  via_relay:
    interface: echo_api
  spare:
    interface: echo_api
    min_connections: 0
"#,
        );
        d.write(
            "interfaces/echo_api.yaml",
            r#"
description: echo things back
cmds:
  echo:
    description: returns its arguments
    arguments:
      msg:
        type: string
  broken:
    description: replies with garbage
vars:
  counter:
    type: integer
"#,
        );
        d
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn conf(&self) -> PathBuf {
        self.dir.path().join("config.yaml")
    }

    fn bridge(&self, module_id: &str) -> Arc<ModuleBridge> {
        Arc::new(ModuleBridge::new(module_id, "", self.conf().to_str().unwrap()).unwrap())
    }

    fn runtime(&self, module_id: &str) -> Runtime {
        Runtime::new(&ModuleArgs {
            prefix: PathBuf::new(),
            conf: self.conf(),
            module: module_id.to_string(),
        })
        .unwrap()
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Mock callback surface
// ---------------------------------------------------------------------------

/// Echoes `echo`, answers `broken` with bytes that are not JSON and records
/// everything it sees. With an upstream set it forwards `echo` instead.
struct MockSurface {
    commands: AtomicUsize,
    variables: Sender<(Descriptor, Value)>,
    upstream: OnceLock<Weak<ModuleBridge>>,
}

impl MockSurface {
    fn new() -> (Arc<Self>, Receiver<(Descriptor, Value)>) {
        let (tx, rx) = unbounded();
        let surface = Arc::new(Self {
            commands: AtomicUsize::new(0),
            variables: tx,
            upstream: OnceLock::new(),
        });
        (surface, rx)
    }

    fn commands(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }
}

impl CallbackSurface for MockSurface {
    fn handle_command(
        &self,
        descriptor: &Descriptor,
        args: WireDocument,
    ) -> EverestResult<WireDocument> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        match descriptor.name.as_str() {
            "echo" => match self.upstream.get().and_then(Weak::upgrade) {
                Some(bridge) => bridge.call_command("upstream", "echo", args),
                None => Ok(args),
            },
            "broken" => Ok(WireDocument::from_bytes(b"{not json".to_vec())),
            other => Err(EverestError::InvalidArgument(other.to_string())),
        }
    }

    fn handle_variable(&self, descriptor: &Descriptor, value: WireDocument) -> EverestResult<()> {
        let value = value.to_native()?;
        match value.as_str() {
            Some("reject") => Err(EverestError::InvalidArgument("reject".to_string())),
            Some("explode") => panic!("variable handler exploded"),
            _ => {
                let _ = self.variables.send((descriptor.clone(), value));
                Ok(())
            }
        }
    }
}

/// Start `pong` serving `main.echo` and `main.broken`.
fn start_pong(d: &Deployment) -> (Arc<ModuleBridge>, Arc<MockSurface>) {
    let pong = d.bridge("pong");
    let (surface, _) = MockSurface::new();
    for name in ["echo", "broken"] {
        pong.provide_command(surface.clone(), &Descriptor::new("main", name))
            .unwrap();
    }
    let manifest = pong.initialize().unwrap().to_native().unwrap();
    assert_eq!(manifest["description"], "answers");
    (pong, surface)
}

fn start(d: &Deployment, module_id: &str) -> Arc<ModuleBridge> {
    let bridge = d.bridge(module_id);
    bridge.initialize().unwrap();
    bridge
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[test]
fn test_echo_end_to_end() {
    let d = Deployment::new();
    let (_pong, surface) = start_pong(&d);
    let ping = start(&d, "ping");

    let args = WireDocument::from_native(&json!({"msg": "hi"})).unwrap();
    let reply = ping.call_command("target", "echo", args).unwrap();
    assert_eq!(reply.to_native().unwrap(), json!({"msg": "hi"}));
    assert_eq!(surface.commands(), 1);

    for i in 0..10 {
        let reply = ping
            .call_command("target", "echo", WireDocument::from_native(&json!(i)).unwrap())
            .unwrap();
        assert_eq!(reply.to_native().unwrap(), json!(i));
    }
    assert_eq!(surface.commands(), 11);
}

#[test]
fn test_nested_call_from_handler() {
    let d = Deployment::new();
    let (_pong, pong_surface) = start_pong(&d);

    let relay = d.bridge("relay");
    let (relay_surface, _) = MockSurface::new();
    relay_surface.upstream.set(Arc::downgrade(&relay)).unwrap();
    relay
        .provide_command(relay_surface.clone(), &Descriptor::new("main", "echo"))
        .unwrap();
    relay.initialize().unwrap();

    let ping = start(&d, "ping");
    let reply = ping
        .call_command(
            "via_relay",
            "echo",
            WireDocument::from_native(&json!({"hops": 2})).unwrap(),
        )
        .unwrap();
    assert_eq!(reply.to_native().unwrap(), json!({"hops": 2}));
    assert_eq!(relay_surface.commands(), 1);
    assert_eq!(pong_surface.commands(), 1);
}

#[test]
fn test_malformed_reply_fails_only_that_call() {
    let d = Deployment::new();
    let (_pong, _) = start_pong(&d);
    let ping = start(&d, "ping");

    match ping.call_command("target", "broken", WireDocument::null()) {
        Err(EverestError::CallFailed { command, reason }) => {
            assert_eq!(command, "broken");
            assert!(reason.contains("Marshal"), "reason: {reason}");
        }
        other => panic!("Expected CallFailed, got {other:?}"),
    }
    let reply = ping
        .call_command("target", "echo", WireDocument::from_native(&json!("still up")).unwrap())
        .unwrap();
    assert_eq!(reply.to_native().unwrap(), json!("still up"));
}

#[test]
fn test_malformed_call_arguments() {
    let d = Deployment::new();
    let (_pong, surface) = start_pong(&d);
    let ping = start(&d, "ping");

    let err = ping
        .call_command("target", "echo", WireDocument::from_bytes(b"[1,".to_vec()))
        .unwrap_err();
    assert!(matches!(err, EverestError::Marshal(_)));
    assert_eq!(surface.commands(), 0);
}

#[test]
fn test_call_without_listener_is_transport_error() {
    let d = Deployment::new();
    let ping = start(&d, "ping");
    let err = ping
        .call_command("target", "echo", WireDocument::null())
        .unwrap_err();
    assert!(matches!(err, EverestError::Transport(_)), "got {err:?}");
}

#[test]
fn test_unknown_requirement_not_found() {
    let d = Deployment::new();
    let ping = start(&d, "ping");
    let (surface, _) = MockSurface::new();

    assert!(matches!(
        ping.call_command("nope", "echo", WireDocument::null()),
        Err(EverestError::NotFound(_))
    ));
    assert!(matches!(
        ping.call_command_at(&PeerRef::with_slot("target", 1), "echo", WireDocument::null()),
        Err(EverestError::NotFound(_))
    ));
    assert!(matches!(
        ping.subscribe_variable(surface, &Descriptor::new("nope", "counter")),
        Err(EverestError::NotFound(_))
    ));
}

#[test]
fn test_provide_unknown_implementation_not_found() {
    let d = Deployment::new();
    let pong = d.bridge("pong");
    let (surface, _) = MockSurface::new();
    assert!(matches!(
        pong.provide_command(surface, &Descriptor::new("other", "echo")),
        Err(EverestError::NotFound(_))
    ));
}

#[test]
fn test_teardown_stops_serving() {
    let d = Deployment::new();
    let (pong, _) = start_pong(&d);
    let ping = start(&d, "ping");
    ping.call_command("target", "echo", WireDocument::null())
        .unwrap();

    drop(pong);
    assert!(matches!(
        ping.call_command("target", "echo", WireDocument::null()),
        Err(EverestError::Transport(_))
    ));
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

#[test]
fn test_variables_arrive_in_publish_order() {
    let d = Deployment::new();
    let ping = d.bridge("ping");
    let (surface, rx) = MockSurface::new();
    ping.subscribe_variable(surface, &Descriptor::new("target", "counter"))
        .unwrap();
    ping.initialize().unwrap();
    let pong = start(&d, "pong");

    for i in 0..100 {
        pong.publish_variable("main", "counter", WireDocument::from_native(&json!(i)).unwrap())
            .unwrap();
    }
    for i in 0..100 {
        let (descriptor, value) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(descriptor, Descriptor::new("target", "counter"));
        assert_eq!(value, json!(i));
    }
}

#[test]
fn test_malformed_publish_keeps_subscriptions() {
    let d = Deployment::new();
    let ping = d.bridge("ping");
    let (surface, rx) = MockSurface::new();
    ping.subscribe_variable(surface, &Descriptor::new("target", "counter"))
        .unwrap();
    ping.initialize().unwrap();
    let pong = start(&d, "pong");

    let err = pong
        .publish_variable("main", "counter", WireDocument::from_bytes(b"{\"a\":".to_vec()))
        .unwrap_err();
    assert!(matches!(err, EverestError::Marshal(_)));

    pong.publish_variable("main", "counter", WireDocument::from_native(&json!(42)).unwrap())
        .unwrap();
    let (_, value) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(value, json!(42));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_failing_variable_handler_keeps_later_updates() {
    let d = Deployment::new();
    let ping = d.bridge("ping");
    let (surface, rx) = MockSurface::new();
    ping.subscribe_variable(surface, &Descriptor::new("target", "counter"))
        .unwrap();
    ping.initialize().unwrap();
    let pong = start(&d, "pong");

    for value in [json!("reject"), json!(1), json!("explode"), json!(2)] {
        pong.publish_variable("main", "counter", WireDocument::from_native(&value).unwrap())
            .unwrap();
    }
    let (_, first) = rx.recv_timeout(WAIT).unwrap();
    let (_, second) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!((first, second), (json!(1), json!(2)));
}

#[test]
fn test_publish_unknown_implementation_not_found() {
    let d = Deployment::new();
    let pong = start(&d, "pong");
    assert!(matches!(
        pong.publish_variable("other", "counter", WireDocument::null()),
        Err(EverestError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn test_initialize_absent_module_is_configuration_error() {
    let d = Deployment::new();
    let ghost = d.bridge("ghost");
    assert!(matches!(
        ghost.initialize(),
        Err(EverestError::Configuration(_))
    ));
    // Listed, but its module type has no manifest installed.
    let uninstalled = d.bridge("ghost_type");
    assert!(matches!(
        uninstalled.initialize(),
        Err(EverestError::Configuration(_))
    ));
}

#[test]
fn test_missing_config_is_configuration_error() {
    let err = ModuleBridge::new("pong", "", "/nonexistent/config.yaml").err();
    assert!(matches!(err, Some(EverestError::Configuration(_))));
}

#[test]
fn test_get_interface() {
    let d = Deployment::new();
    let pong = d.bridge("pong");
    let iface = pong.get_interface("echo_api").unwrap().to_native().unwrap();
    assert!(iface["cmds"].get("echo").is_some());
    assert!(matches!(
        pong.get_interface("no_such_api"),
        Err(EverestError::NotFound(_))
    ));
}

/// Records whether the observer already saw this module ready when the
/// hook ran.
struct ReadyWatcher {
    observer: Arc<ModuleBridge>,
    fired: AtomicUsize,
    seen_early: Mutex<Option<bool>>,
}

impl CallbackSurface for ReadyWatcher {
    fn on_ready(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        *self.seen_early.lock().unwrap() = Some(self.observer.is_peer_ready("pong"));
    }

    fn handle_command(&self, _: &Descriptor, args: WireDocument) -> EverestResult<WireDocument> {
        Ok(args)
    }

    fn handle_variable(&self, _: &Descriptor, _: WireDocument) -> EverestResult<()> {
        Ok(())
    }
}

#[test]
fn test_ready_hook_runs_once_before_peers_see_it() {
    let d = Deployment::new();
    let observer = start(&d, "ping");
    let watcher = Arc::new(ReadyWatcher {
        observer: observer.clone(),
        fired: AtomicUsize::new(0),
        seen_early: Mutex::new(None),
    });

    let pong = start(&d, "pong");
    pong.signal_ready(watcher.clone()).unwrap();
    wait_until("peer readiness", || observer.is_peer_ready("pong"));

    assert_eq!(watcher.fired.load(Ordering::SeqCst), 1);
    assert_eq!(*watcher.seen_early.lock().unwrap(), Some(false));
    assert!(!observer.is_peer_ready("relay"));
}

// ---------------------------------------------------------------------------
// Runtime + Subscriber
// ---------------------------------------------------------------------------

struct MockSubscriber {
    ready: AtomicUsize,
    calls: Mutex<Vec<(String, String, HashMap<String, Value>)>>,
    variables: Sender<(String, String, Value)>,
}

impl MockSubscriber {
    fn new() -> (Arc<Self>, Receiver<(String, String, Value)>) {
        let (tx, rx) = unbounded();
        let sub = Arc::new(Self {
            ready: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            variables: tx,
        });
        (sub, rx)
    }
}

impl Subscriber for MockSubscriber {
    fn handle_command(
        &self,
        implementation_id: &str,
        name: &str,
        parameters: HashMap<String, Value>,
    ) -> EverestResult<Value> {
        self.calls.lock().unwrap().push((
            implementation_id.to_string(),
            name.to_string(),
            parameters.clone(),
        ));
        match parameters.get("msg") {
            Some(msg) => Ok(json!({"msg": msg})),
            None => Err(EverestError::MissingArgument("msg".to_string())),
        }
    }

    fn handle_variable(&self, implementation_id: &str, name: &str, value: Value) -> EverestResult<()> {
        let _ = self
            .variables
            .send((implementation_id.to_string(), name.to_string(), value));
        Ok(())
    }

    fn on_ready(&self) {
        self.ready.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_runtime_wires_manifest_to_subscriber() {
    let d = Deployment::new();

    // Ping first, so it is listening when pong announces readiness.
    let ping_rt = d.runtime("ping");
    let (ping_sub, ping_vars) = MockSubscriber::new();
    let ping_dyn: Arc<dyn Subscriber> = ping_sub.clone();
    ping_rt.set_subscriber(Arc::downgrade(&ping_dyn)).unwrap();

    let pong_rt = d.runtime("pong");
    let (pong_sub, _) = MockSubscriber::new();
    let pong_dyn: Arc<dyn Subscriber> = pong_sub.clone();
    pong_rt.set_subscriber(Arc::downgrade(&pong_dyn)).unwrap();
    // Only the first call has effect.
    pong_rt.set_subscriber(Arc::downgrade(&pong_dyn)).unwrap();

    wait_until("pong ready", || ping_rt.bridge().is_peer_ready("pong"));
    assert_eq!(pong_sub.ready.load(Ordering::SeqCst), 1);

    let reply: Value = ping_rt
        .call_command("target", "echo", &json!({"msg": "hi"}))
        .unwrap();
    assert_eq!(reply, json!({"msg": "hi"}));
    {
        let calls = pong_sub.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "main");
        assert_eq!(calls[0].1, "echo");
        assert_eq!(calls[0].2.get("msg"), Some(&json!("hi")));
    }

    // Subscriber errors come back as call failures.
    let missing = ping_rt.call_command::<_, Value>("target", "echo", &json!({}));
    assert!(matches!(missing, Err(EverestError::CallFailed { .. })));
    let not_object = ping_rt.call_command::<_, Value>("target", "echo", &json!([1, 2]));
    assert!(matches!(not_object, Err(EverestError::CallFailed { .. })));

    pong_rt.publish_variable("main", "counter", &7u32).unwrap();
    let (requirement, name, value) = ping_vars.recv_timeout(WAIT).unwrap();
    assert_eq!(requirement, "target");
    assert_eq!(name, "counter");
    assert_eq!(value, json!(7));
}

#[test]
fn test_failed_set_subscriber_is_not_retried_silently() {
    let d = Deployment::new();
    // Listed in the config, but its manifest is not installed.
    let rt = d.runtime("ghost_type");
    let (sub, _) = MockSubscriber::new();
    let sub: Arc<dyn Subscriber> = sub;

    assert!(matches!(
        rt.set_subscriber(Arc::downgrade(&sub)),
        Err(EverestError::Configuration(_))
    ));
    assert!(matches!(
        rt.set_subscriber(Arc::downgrade(&sub)),
        Err(EverestError::Internal(_))
    ));
}

#[test]
fn test_dropped_subscriber_fails_calls() {
    let d = Deployment::new();
    let pong_rt = d.runtime("pong");
    let (pong_sub, _) = MockSubscriber::new();
    let pong_dyn: Arc<dyn Subscriber> = pong_sub;
    pong_rt.set_subscriber(Arc::downgrade(&pong_dyn)).unwrap();
    drop(pong_dyn);

    let ping = start(&d, "ping");
    let err = ping
        .call_command(
            "target",
            "echo",
            WireDocument::from_native(&json!({"msg": "anyone?"})).unwrap(),
        )
        .unwrap_err();
    assert!(matches!(err, EverestError::CallFailed { .. }), "got {err:?}");
}
