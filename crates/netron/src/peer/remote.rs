//! # Remote Peer with Async Pump
//!
//! A [`RemotePeer`] speaks to another runtime over any byte [`Transport`].
//! A background pump reads packets off the transport and:
//!
//! - routes replies to the pending request with the same sequence number,
//! - serves incoming requests concurrently against the local runtime,
//! - re-emits events the remote side publishes to us.
//!
//! Events this side publishes to the remote are queued on an outbox and
//! written in order by a second task, so that event handlers stay synchronous.
//!
//! ## Invariants
//!
//! - Sequence numbers are scoped to one transport.
//! - A pending request is resolved exactly once: by its reply, by the
//!   response timeout, or by disconnect.
//! - Live contexts never cross the wire as such. Outgoing contexts become
//!   definitions served to this peer; interfaces bound to this peer become
//!   references.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::definition::Definition;
use crate::definition::Reference;
use crate::error::Error;
use crate::error::Result;
use crate::error::WireError;
use crate::event;
use crate::event::EventHandler;
use crate::identity::PeerInfo;
use crate::netron::Netron;
use crate::options::Options;
use crate::packet;
use crate::packet::Packet;
use crate::packet::ReplyBody;
use crate::packet::WireTaskRequest;
use crate::packet::WireTaskResult;
use crate::peer::Peer;
use crate::peer::PeerCore;
use crate::peer::event_context_id;
use crate::stub::process_object;
use crate::task::TaskRequest;
use crate::task::TaskResult;
use crate::task::TaskResults;
use crate::task::fail_all;
use crate::transport::Transport;
use crate::value::Value;
use crate::value::WireValue;

pub struct RemotePeer {
    core: PeerCore,
    transport: Arc<dyn Transport>,
    pending: DashMap<u64, oneshot::Sender<Result<ReplyBody>>>,
    seq_gen: AtomicU64,
    connected: AtomicBool,
    response_timeout: Duration,
    /// Contexts the remote runtime has attached, by context id.
    contexts: DashMap<String, Arc<Definition>>,
    /// Forwarders installed on the local runtime on behalf of the remote.
    remote_subscriptions: DashMap<String, EventHandler>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("id", &self.core.id)
            .field("connected", &self.connected)
            .finish()
    }
}

impl RemotePeer {
    pub(crate) fn new(
        info: PeerInfo,
        netron: Weak<Netron>,
        transport: Arc<dyn Transport>,
        options: &Options,
    ) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me: &Weak<RemotePeer>| {
            let me: Weak<dyn Peer> = me.clone();
            Self {
                core: PeerCore::new(info, netron, me, options.event_capacity),
                transport,
                pending: DashMap::new(),
                seq_gen: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                response_timeout: options.response_timeout,
                contexts: DashMap::new(),
                remote_subscriptions: DashMap::new(),
                outbox,
                outbox_rx: Mutex::new(Some(outbox_rx)),
                tasks: Mutex::new(Vec::new()),
            }
        })
    }

    /// Spawns the pump and the outbox writer.
    pub(crate) fn start(self: &Arc<Self>) {
        let Some(mut outbox_rx) = self.outbox_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        let pump = {
            let weak = Arc::downgrade(self);
            let transport = self.transport.clone();
            let peer_id = self.id().to_string();
            tokio::spawn(async move {
                loop {
                    match transport.recv().await {
                        Ok(Some(bytes)) => {
                            let Some(peer) = weak.upgrade() else { break };
                            match packet::decode(&bytes) {
                                Ok(packet) => peer.handle_packet(packet),
                                Err(e) => warn!(peer = %peer_id, error = %e, "dropping undecodable packet"),
                            }
                        }
                        Ok(None) => {
                            debug!(peer = %peer_id, "transport closed");
                            break;
                        }
                        Err(e) => {
                            warn!(peer = %peer_id, error = %e, "transport error in pump");
                            break;
                        }
                    }
                }
                // Tear down from a fresh task, since disconnect aborts this one.
                if let Some(peer) = weak.upgrade() {
                    tokio::spawn(async move { peer.disconnect().await });
                }
            })
        };

        let writer = {
            let transport = self.transport.clone();
            let peer_id = self.id().to_string();
            tokio::spawn(async move {
                while let Some(bytes) = outbox_rx.recv().await {
                    if let Err(e) = transport.send(&bytes).await {
                        warn!(peer = %peer_id, error = %e, "failed to forward event");
                        break;
                    }
                }
            })
        };

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(pump);
            tasks.push(writer);
        }
    }

    fn handle_packet(self: Arc<Self>, packet: Packet) {
        match packet {
            Packet::Reply { seq, status } => {
                let Some((_, tx)) = self.pending.remove(&seq) else {
                    trace!(peer = %self.id(), seq, "reply without pending request");
                    return;
                };
                let _ = tx.send(status.map_err(Error::from));
            }
            Packet::Event { name, data } => {
                self.core.events().emit(&name, Value::from(data));
            }
            Packet::Hello { .. } => {
                warn!(peer = %self.id(), "unexpected hello after handshake");
            }
            request => {
                tokio::spawn(async move { self.serve(request).await });
            }
        }
    }

    async fn serve(self: Arc<Self>, request: Packet) {
        let (seq, status) = match request {
            Packet::Get { seq, def_id, name, data } => {
                (seq, self.serve_get(def_id, &name, data).await.map(ReplyBody::Value))
            }
            Packet::Set { seq, def_id, name, data } => {
                (seq, self.serve_set(def_id, &name, data).await.map(|_| ReplyBody::Done))
            }
            Packet::Task { seq, tasks } => (seq, self.serve_tasks(tasks).await.map(ReplyBody::Tasks)),
            Packet::Subscribe { seq, event } => (seq, self.serve_subscribe(&event).map(|_| ReplyBody::Done)),
            Packet::Unsubscribe { seq, event } => {
                (seq, self.serve_unsubscribe(&event).map(|_| ReplyBody::Done))
            }
            Packet::Reply { .. } | Packet::Event { .. } | Packet::Hello { .. } => return,
        };

        if let Err(e) = &status {
            debug!(peer = %self.id(), seq, error = %e, "request failed");
        }
        let reply = Packet::Reply { seq, status: status.map_err(|e| WireError::from(&e)) };
        if let Err(e) = self.send(&reply).await {
            warn!(peer = %self.id(), seq, error = %e, "failed to send reply");
        }
    }

    fn handles(&self) -> Result<(Arc<Netron>, Arc<dyn Peer>)> {
        Ok((self.netron()?, self.core.handle()?))
    }

    async fn serve_get(&self, def_id: u64, name: &str, data: WireValue) -> Result<WireValue> {
        let (netron, me) = self.handles()?;
        let value = netron.dispatch_get(&me, def_id, name, Value::from(data)).await?;
        self.encode_value(value)
    }

    async fn serve_set(&self, def_id: u64, name: &str, data: WireValue) -> Result<()> {
        let (netron, me) = self.handles()?;
        netron.dispatch_set(&me, def_id, name, Value::from(data)).await
    }

    async fn serve_tasks(&self, tasks: Vec<WireTaskRequest>) -> Result<BTreeMap<String, WireTaskResult>> {
        let (netron, me) = self.handles()?;
        let requests = tasks
            .into_iter()
            .map(|t| TaskRequest { task: t.task, args: t.args.into_iter().map(Value::from).collect() })
            .collect();

        let results = netron.run_peer_task(me, requests).await;
        Ok(results
            .into_iter()
            .map(|(name, result)| {
                let wire = match result {
                    TaskResult::Completed(v) => match self.encode_value(v) {
                        Ok(v) => WireTaskResult::Completed(v),
                        Err(e) => WireTaskResult::Failed(WireError::from(&e)),
                    },
                    TaskResult::Failed(e) => WireTaskResult::Failed(e),
                };
                (name, wire)
            })
            .collect())
    }

    /// Forwards local runtime events named `event` to the remote side.
    fn serve_subscribe(&self, event: &str) -> Result<()> {
        let netron = self.netron()?;
        if self.remote_subscriptions.contains_key(event) {
            return Ok(());
        }

        let outbox = self.outbox.clone();
        let peer_id = self.id().to_string();
        let forward = event::handler(move |name, data| {
            let data = match WireValue::try_from(data.clone()) {
                Ok(data) => data,
                Err(e) => {
                    debug!(peer = %peer_id, event = name, error = %e, "event has no wire form");
                    return;
                }
            };
            match packet::encode(&Packet::Event { name: name.to_string(), data }) {
                Ok(bytes) => {
                    let _ = outbox.send(bytes);
                }
                Err(e) => warn!(peer = %peer_id, event = name, error = %e, "failed to encode event"),
            }
        });

        netron.subscribe(event, forward.clone());
        self.remote_subscriptions.insert(event.to_string(), forward);
        Ok(())
    }

    fn serve_unsubscribe(&self, event: &str) -> Result<()> {
        if let Some((name, forward)) = self.remote_subscriptions.remove(event) {
            self.netron()?.unsubscribe(&name, &forward);
        }
        Ok(())
    }

    /// Keeps the table of remote contexts in step with the remote runtime.
    pub(crate) async fn watch_contexts(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let on_attach = event::handler(move |_, data| {
            if let Some(peer) = weak.upgrade() {
                peer.context_attached(data);
            }
        });
        let weak = Arc::downgrade(self);
        let on_detach = event::handler(move |_, data| {
            if let Some(peer) = weak.upgrade() {
                peer.context_detached(data);
            }
        });

        self.subscribe(event::CONTEXT_ATTACH, on_attach).await?;
        self.subscribe(event::CONTEXT_DETACH, on_detach).await
    }

    fn context_attached(&self, data: &Value) {
        let def = data.as_map().and_then(|m| m.get("def")).and_then(Value::as_definition);
        if let (Some(ctx_id), Some(def)) = (event_context_id(data), def) {
            self.add_context(ctx_id, def.clone());
        }
    }

    fn context_detached(&self, data: &Value) {
        let Some(ctx_id) = event_context_id(data) else { return };
        if let Some((_, def)) = self.contexts.remove(ctx_id) {
            debug!(peer = %self.id(), ctx = ctx_id, def_id = def.id, "remote context detached");
            self.core.forget_definition(def.id);
        }
    }

    pub(crate) fn add_context(&self, ctx_id: &str, def: Arc<Definition>) {
        debug!(peer = %self.id(), ctx = ctx_id, def_id = def.id, "remote context attached");
        self.update_definitions(std::slice::from_ref(&def));
        self.contexts.insert(ctx_id.to_string(), def);
    }

    /// Translates an outgoing value into its wire form.
    fn encode_value(&self, value: Value) -> Result<WireValue> {
        match value {
            Value::Context(ctx) => {
                let (netron, me) = self.handles()?;
                let def = netron.ref_context(&me, &ctx, 0);
                Ok(WireValue::Definition(Arc::unwrap_or_clone(def)))
            }
            Value::Interface(iface) if iface.peer_id() == self.id() => {
                Ok(WireValue::Reference(Reference::new(iface.def_id())))
            }
            Value::Interface(iface) => Err(Error::NotValid(format!(
                "Interface '{}' belongs to peer '{}', not '{}'",
                iface.definition().name,
                iface.peer_id(),
                self.id()
            ))),
            Value::List(items) => Ok(WireValue::List(
                items.into_iter().map(|v| self.encode_value(v)).collect::<Result<_>>()?,
            )),
            Value::Map(map) => Ok(WireValue::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, self.encode_value(v)?)))
                    .collect::<Result<_>>()?,
            )),
            Value::Definitions(defs) => Ok(WireValue::Definitions(
                defs.into_iter().map(|v| self.encode_value(v)).collect::<Result<_>>()?,
            )),
            other => WireValue::try_from(other),
        }
    }

    /// Translates an incoming value for local use.
    fn decode_value(&self, value: WireValue) -> Result<Value> {
        let (netron, me) = self.handles()?;
        process_object(&netron, &me, Value::from(value))
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = packet::encode(packet)?;
        self.transport.send(&bytes).await?;
        Ok(())
    }

    async fn request(&self, make: impl FnOnce(u64) -> Packet + Send) -> Result<ReplyBody> {
        if !self.is_connected() {
            return Err(Error::disconnected(self.id()));
        }

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        if let Err(e) = self.send(&make(seq)).await {
            self.pending.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&seq);
                Err(Error::disconnected(self.id()))
            }
            Err(_) => {
                self.pending.remove(&seq);
                Err(Error::Timeout)
            }
        }
    }

    async fn request_tasks(&self, requests: &[TaskRequest]) -> Result<TaskResults> {
        let tasks = requests
            .iter()
            .map(|r| {
                let args = r.args.iter().cloned().map(|a| self.encode_value(a)).collect::<Result<_>>()?;
                Ok(WireTaskRequest { task: r.task.clone(), args })
            })
            .collect::<Result<Vec<_>>>()?;

        let ReplyBody::Tasks(results) = self.request(|seq| Packet::Task { seq, tasks }).await? else {
            return Err(Error::NotValid("Unexpected reply to task request".into()));
        };

        Ok(results
            .into_iter()
            .map(|(name, result)| {
                let result = match result {
                    WireTaskResult::Completed(v) => match self.decode_value(v) {
                        Ok(v) => TaskResult::Completed(v),
                        Err(e) => TaskResult::Failed(WireError::from(&e)),
                    },
                    WireTaskResult::Failed(e) => TaskResult::Failed(e),
                };
                (name, result)
            })
            .collect())
    }

    fn fail_pending(&self) {
        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(Error::disconnected(self.id())));
            }
        }
    }
}

#[async_trait::async_trait]
impl Peer for RemotePeer {
    fn core(&self) -> &PeerCore {
        &self.core
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.id(), "disconnecting");

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Err(e) = self.transport.close().await {
            debug!(peer = %self.id(), error = %e, "transport close failed");
        }
        self.fail_pending();

        let forwards: Vec<(String, EventHandler)> = self
            .remote_subscriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.remote_subscriptions.clear();

        if let Ok(netron) = self.netron() {
            for (name, forward) in forwards {
                netron.unsubscribe(&name, &forward);
            }
            netron.peer_disconnected(self.id());
        }
        self.contexts.clear();
        self.core.close();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn set(&self, def_id: u64, name: &str, data: Value) -> Result<()> {
        let data = self.encode_value(data)?;
        let name = name.to_string();
        match self.request(|seq| Packet::Set { seq, def_id, name, data }).await? {
            ReplyBody::Done => Ok(()),
            _ => Err(Error::NotValid("Unexpected reply to set".into())),
        }
    }

    async fn get(&self, def_id: u64, name: &str, default: Value) -> Result<Value> {
        let data = self.encode_value(default)?;
        let name = name.to_string();
        match self.request(|seq| Packet::Get { seq, def_id, name, data }).await? {
            ReplyBody::Value(v) => self.decode_value(v),
            _ => Err(Error::NotValid("Unexpected reply to get".into())),
        }
    }

    async fn run_task(&self, requests: Vec<TaskRequest>) -> TaskResults {
        let results = match self.request_tasks(&requests).await {
            Ok(results) => results,
            Err(e) => {
                debug!(peer = %self.id(), error = %e, "task request failed");
                fail_all(&requests, &e)
            }
        };
        self.core.merge_task_results(&results);
        results
    }

    fn has_context(&self, ctx_id: &str) -> bool {
        self.contexts.contains_key(ctx_id)
    }

    fn context_names(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    fn get_context_definition(&self, ctx_id: &str) -> Result<Arc<Definition>> {
        self.contexts
            .get(ctx_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| Error::Unknown(format!("Unknown context '{}'", ctx_id)))
    }

    async fn subscribe(&self, event: &str, handler: EventHandler) -> Result<()> {
        if self.core.events().on(event, handler) {
            let event = event.to_string();
            self.request(|seq| Packet::Subscribe { seq, event }).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, event: &str, handler: &EventHandler) -> Result<()> {
        if self.core.events().off(event, handler) && self.is_connected() {
            let event = event.to_string();
            self.request(|seq| Packet::Unsubscribe { seq, event }).await?;
        }
        Ok(())
    }
}
