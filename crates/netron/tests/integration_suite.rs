//! Integration tests for two netron runtimes talking to each other.

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use netron::Context;
use netron::Definitions;
use netron::ErrorKind;
use netron::Interface;
use netron::MethodMeta;
use netron::Netron;
use netron::Peer;
use netron::PropertyMeta;
use netron::Reflection;
use netron::RemotePeer;
use netron::Task;
use netron::TaskRequest;
use netron::TaskResult;
use netron::Value;
use netron::event;
use netron::interface::TwinFactory;
use netron::transport::ChannelTransport;
use netron::transport::TcpTransport;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Links two runtimes. Returns (a's view of b, b's view of a).
async fn link(a: &Arc<Netron>, b: &Arc<Netron>) -> (Arc<RemotePeer>, Arc<RemotePeer>) {
    let (ta, tb) = ChannelTransport::pair();
    let (pa, pb) = tokio::join!(a.connect(Arc::new(ta)), b.connect(Arc::new(tb)));
    (pa.expect("a failed to connect"), pb.expect("b failed to connect"))
}

/// Polls `cond` until it holds, failing the test after a few seconds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

struct Counter {
    value: AtomicI64,
}

impl Counter {
    fn new() -> Arc<Self> {
        Arc::new(Self { value: AtomicI64::new(0) })
    }
}

#[async_trait::async_trait]
impl Context for Counter {
    fn reflection(&self) -> Reflection {
        Reflection::new("Counter")
            .method("inc", MethodMeta::returns("number"))
            .property("value", PropertyMeta::of("number").readonly())
    }

    async fn call(&self, method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "inc" => Ok(Value::Int(self.value.fetch_add(1, Ordering::SeqCst) + 1)),
            other => anyhow::bail!("Counter has no method {}", other),
        }
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        (name == "value").then(|| Value::Int(self.value.load(Ordering::SeqCst)))
    }
}

struct Calculator {
    x: Mutex<Option<i64>>,
}

impl Calculator {
    fn new() -> Arc<Self> {
        Arc::new(Self { x: Mutex::new(None) })
    }
}

#[async_trait::async_trait]
impl Context for Calculator {
    fn reflection(&self) -> Reflection {
        Reflection::new("Calculator")
            .description("does arithmetic")
            .twin("CalculatorTwin")
            .method("add", MethodMeta::returns("number").arg("number", "a").arg("number", "b"))
            .method("counter", MethodMeta::returns("Counter"))
            .method("counters", MethodMeta::returns("Counter[]").arg("number", "count"))
            .method("bump", MethodMeta::returns("number").arg("Counter", "counter"))
            .method("fail", MethodMeta::returns("never"))
            .method("remember", MethodMeta::returns("undefined").arg("number", "x"))
            .property("x", PropertyMeta::of("number"))
            .property("label", PropertyMeta::of("string").readonly())
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        match method {
            "add" => {
                let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(a + b))
            }
            "counter" => Ok(Value::Context(Counter::new())),
            "counters" => {
                let count = args.first().and_then(Value::as_i64).unwrap_or(0);
                let defs: Definitions = (0..count)
                    .map(|_| Value::Context(Counter::new()))
                    .collect();
                Ok(Value::Definitions(defs))
            }
            "bump" => match args.into_iter().next() {
                Some(Value::Context(ctx)) => ctx.call("inc", vec![]).await,
                Some(Value::Interface(iface)) => Ok(iface.call("inc", vec![]).await?),
                other => anyhow::bail!("cannot bump {:?}", other),
            },
            "fail" => anyhow::bail!("calculator is broken"),
            "remember" => {
                *self.x.lock().unwrap() = args.first().and_then(Value::as_i64);
                Ok(Value::Int(0))
            }
            other => anyhow::bail!("Calculator has no method {}", other),
        }
    }

    fn get_property(&self, name: &str) -> Option<Value> {
        match name {
            "x" => self.x.lock().unwrap().map(Value::Int),
            "label" => Some(Value::from("calc")),
            _ => None,
        }
    }

    fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        match (name, value.as_i64()) {
            ("x", Some(x)) => {
                *self.x.lock().unwrap() = Some(x);
                Ok(())
            }
            _ => anyhow::bail!("cannot set {} to {:?}", name, value),
        }
    }
}

async fn calculator_setup() -> (Arc<Netron>, Arc<Netron>, Arc<RemotePeer>, Interface) {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    b.attach_context(Calculator::new(), Some("calc")).unwrap();
    let (peer_b, _) = link(&a, &b).await;
    let calc = peer_b.query_interface("calc").expect("calc should be advertised on connect");
    (a, b, peer_b, calc)
}

// --- Test 1: Method call across the wire ---

#[tokio::test]
async fn test_remote_method_call() {
    let (_a, _b, _peer, calc) = calculator_setup().await;
    let sum = calc.call("add", vec![Value::Int(2), Value::Int(3)]).await.unwrap();
    assert_eq!(sum, Value::Int(5));
}

// --- Test 2: Properties ---

#[tokio::test]
async fn test_remote_properties() {
    let (_a, _b, _peer, calc) = calculator_setup().await;

    assert_eq!(calc.get("x").await.unwrap(), Value::Null);
    assert_eq!(calc.get_or("x", Value::Int(7)).await.unwrap(), Value::Int(7));

    calc.set("x", Value::Int(5)).await.unwrap();
    assert_eq!(calc.get("x").await.unwrap(), Value::Int(5));

    assert_eq!(calc.get("label").await.unwrap(), Value::from("calc"));
    let err = calc.set("label", "other").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAccess);
}

// --- Test 3: Errors keep their kind across the wire ---

#[tokio::test]
async fn test_remote_errors() {
    let (_a, _b, peer, calc) = calculator_setup().await;

    let err = calc.call("fail", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Context);
    assert_eq!(err.to_string(), "calculator is broken");

    // Bypass the interface's local checks to reach the remote stub.
    let err = peer.get(calc.def_id(), "nope", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExists);
    let err = peer.set(calc.def_id(), "label", Value::from("x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAccess);
    let err = peer.get(9999, "x", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExists);
}

// --- Test 4: Nested contexts come back as interfaces ---

#[tokio::test]
async fn test_nested_context_interface() {
    let (a, b, _peer, calc) = calculator_setup().await;

    let counter = calc.call("counter", vec![]).await.unwrap().into_interface().unwrap();
    let def = counter.definition();
    assert_eq!(def.name, "Counter");
    assert_eq!(def.parent_id, calc.def_id());
    assert_eq!(def.uid.as_deref(), Some(a.id()));
    assert!(b.stub(def.id).is_some());

    assert_eq!(counter.call("inc", vec![]).await.unwrap(), Value::Int(1));
    assert_eq!(counter.call("inc", vec![]).await.unwrap(), Value::Int(2));
    assert_eq!(counter.get("value").await.unwrap(), Value::Int(2));
}

// --- Test 5: Collections of contexts keep their positions ---

#[tokio::test]
async fn test_definitions_become_interfaces() {
    let (_a, _b, _peer, calc) = calculator_setup().await;

    let result = calc.call("counters", vec![Value::Int(2)]).await.unwrap();
    let items = result.as_definitions().expect("expected a collection");
    assert_eq!(items.len(), 2);

    let first = items.get(0).and_then(Value::as_interface).unwrap();
    let second = items.get(1).and_then(Value::as_interface).unwrap();
    assert_ne!(first.def_id(), second.def_id());
    assert_eq!(first.call("inc", vec![]).await.unwrap(), Value::Int(1));
    assert_eq!(second.call("inc", vec![]).await.unwrap(), Value::Int(1));
}

// --- Test 6: An interface sent back to its owner resolves to the instance ---

#[tokio::test]
async fn test_interface_round_trips_as_reference() {
    let (_a, _b, _peer, calc) = calculator_setup().await;

    let counter = calc.call("counter", vec![]).await.unwrap();
    let bumped = calc.call("bump", vec![counter.clone()]).await.unwrap();
    assert_eq!(bumped, Value::Int(1));
    let counter = counter.into_interface().unwrap();
    assert_eq!(counter.get("value").await.unwrap(), Value::Int(1));
}

// --- Test 7: A local context passed as an argument is served back ---

#[tokio::test]
async fn test_local_context_argument_is_called_back() {
    let (a, _b, peer, calc) = calculator_setup().await;

    let local = Counter::new();
    let bumped = calc.call("bump", vec![Value::Context(local.clone())]).await.unwrap();
    assert_eq!(bumped, Value::Int(1));
    assert_eq!(local.value.load(Ordering::SeqCst), 1);

    // The stub serving it is tagged with the peer it was handed to.
    let ctx: Arc<dyn Context> = local;
    let def = a.ref_context(&(peer.clone() as Arc<dyn Peer>), &ctx, 0);
    assert_eq!(def.uid.as_deref(), Some(peer.id()));
}

// --- Test 8: Context lifecycle is mirrored on the other side ---

#[tokio::test]
async fn test_context_events_propagate() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    let (peer_b, _) = link(&a, &b).await;
    assert!(!peer_b.has_contexts());

    let waiter = tokio::spawn({
        let peer_b = peer_b.clone();
        async move { peer_b.wait_for_context("late").await }
    });
    b.attach_context(Counter::new(), Some("late")).unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap().unwrap();

    let counter = peer_b.query_interface("late").unwrap();
    assert_eq!(counter.call("inc", vec![]).await.unwrap(), Value::Int(1));

    b.detach_context("late", false).unwrap();
    eventually(|| !peer_b.has_context("late")).await;
    assert!(peer_b.query_interface("late").is_err());
}

// --- Test 9: Custom events ---

#[tokio::test]
async fn test_custom_event_subscription() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    let (peer_b, _) = link(&a, &b).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = event::handler(move |name, data| {
        let _ = tx.send((name.to_string(), data.clone()));
    });
    peer_b.subscribe("greeting", handler.clone()).await.unwrap();

    b.emit("greeting", Value::from("hello"));
    let (name, data) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(name, "greeting");
    assert_eq!(data, Value::from("hello"));

    peer_b.unsubscribe("greeting", &handler).await.unwrap();
    b.emit("greeting", Value::from("again"));
    b.emit("other", Value::Null);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

// --- Test 10: Tasks ---

struct Echo;

#[async_trait::async_trait]
impl Task for Echo {
    async fn run(&self, _netron: Arc<Netron>, peer: Arc<dyn Peer>, args: Vec<Value>) -> netron::Result<Value> {
        Ok(Value::List(vec![Value::from(peer.id()), args.into_iter().next().unwrap_or_default()]))
    }
}

#[tokio::test]
async fn test_remote_tasks() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    b.add_task("echo", Arc::new(Echo)).unwrap();
    assert_eq!(b.add_task("echo", Arc::new(Echo)).unwrap_err().kind(), ErrorKind::Exists);
    let (peer_b, _) = link(&a, &b).await;

    let results = peer_b
        .run_task(vec![TaskRequest::new("echo").arg("hi"), TaskRequest::new("missing")])
        .await;

    let echoed = results.get("echo").and_then(TaskResult::value).unwrap();
    assert_eq!(echoed, &Value::List(vec![Value::from(a.id()), Value::from("hi")]));
    let missing = results.get("missing").and_then(TaskResult::error).unwrap();
    assert_eq!(missing.kind, ErrorKind::NotExists);
    assert_eq!(peer_b.get_task_result("echo"), results.get("echo").cloned());
}

// --- Test 11: Twins ---

struct CalculatorTwin {
    def_id: u64,
}

#[tokio::test]
async fn test_twin_is_attached_to_interface() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    let factory: TwinFactory = Arc::new(|iface: &Interface| -> Arc<dyn Any + Send + Sync> {
        Arc::new(CalculatorTwin { def_id: iface.def_id() })
    });
    a.set_interface_twin("CalculatorTwin", factory).unwrap();
    b.attach_context(Calculator::new(), Some("calc")).unwrap();
    let (peer_b, _) = link(&a, &b).await;

    let calc = peer_b.query_interface("calc").unwrap();
    let twin = calc.twin::<CalculatorTwin>().expect("twin should be attached");
    assert_eq!(twin.def_id, calc.def_id());
}

// --- Test 12: Disconnect cleans up both sides ---

#[tokio::test]
async fn test_disconnect_releases_served_contexts() {
    let (a, b, peer_b, calc) = calculator_setup().await;
    let counter = calc.call("counter", vec![]).await.unwrap().into_interface().unwrap();
    let counter_id = counter.def_id();
    assert!(b.stub(counter_id).is_some());

    let mut b_events = b.listen();
    a.disconnect_peer(peer_b.id()).await.unwrap();
    assert!(!peer_b.is_connected());
    assert!(a.peers().is_empty());
    assert!(peer_b.interfaces().is_empty());

    let err = counter.call("inc", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);

    // The other side notices and drops what it served to us.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if b_events.recv().await.unwrap().name == event::PEER_DISCONNECT {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert!(b.stub(counter_id).is_none());
    assert!(b.has_context("calc"));
    assert!(b.peers().is_empty());
}

// --- Test 13: TCP transport ---

#[tokio::test]
async fn test_tcp_connection() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    b.attach_context(Calculator::new(), Some("calc")).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = {
        let b = b.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            b.connect(Arc::new(TcpTransport::new(stream))).await
        })
    };
    let client = TcpTransport::connect(addr).await.unwrap();
    let peer_b = a.connect(Arc::new(client)).await.unwrap();
    let peer_a = server.await.unwrap().unwrap();
    assert_eq!(peer_a.id(), a.id());

    let calc = peer_b.query_interface("calc").unwrap();
    assert_eq!(calc.call("add", vec![Value::Int(20), Value::Int(22)]).await.unwrap(), Value::Int(42));

    a.disconnect().await;
    eventually(|| b.peers().is_empty()).await;
}

// --- Test 14: Duplicate connections are refused ---

#[tokio::test]
async fn test_duplicate_peer_is_refused() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    let _ = link(&a, &b).await;

    let (ta, tb) = ChannelTransport::pair();
    let (again_a, _again_b) = tokio::join!(a.connect(Arc::new(ta)), b.connect(Arc::new(tb)));
    assert_eq!(again_a.unwrap_err().kind(), ErrorKind::Exists);
    assert_eq!(a.peers().len(), 1);
}

// --- Test 15: Fire-and-forget calls still reach the instance ---

#[tokio::test]
async fn test_call_void_reaches_the_instance() {
    let (_a, _b, peer, calc) = calculator_setup().await;

    let () = calc.call_void("remember", vec![Value::Int(7)]).await.unwrap();
    assert_eq!(calc.get("x").await.unwrap(), Value::Int(7));

    let () = peer.call_void(calc.def_id(), "remember", vec![Value::Int(9)]).await.unwrap();
    assert_eq!(calc.get("x").await.unwrap(), Value::Int(9));
}

// --- Test 16: Disconnect wakes anyone waiting for a context ---

#[tokio::test]
async fn test_disconnect_wakes_context_waiters() {
    init_tracing();
    let a = Netron::new();
    let b = Netron::new();
    let (peer_b, _) = link(&a, &b).await;

    let waiter = tokio::spawn({
        let peer_b = peer_b.clone();
        async move { peer_b.wait_for_context("never").await }
    });
    tokio::task::yield_now().await;
    peer_b.disconnect().await;

    let err = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter still pending after disconnect")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}
