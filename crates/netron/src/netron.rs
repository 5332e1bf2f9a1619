//! # Netron Runtime
//!
//! Central registry of one process's remote-object world. Owns the stub
//! table every definition id resolves against, the contexts attached under
//! a name, the connected peers, the task registry and the event bus.
//!
//! Uses DashMap throughout so that pumps of different peers can dispatch
//! into the runtime concurrently without a global lock.
//!
//! ## Invariants
//!
//! - Every definition id maps to at most one stub, and ids are never reused.
//! - Attached contexts have a name and no `uid`; contexts handed out to a
//!   peer carry that peer's id as `uid` and go away with the peer.
//! - An instance is served to a given peer under at most one handed-out
//!   stub, tracked in the `served` index until that stub is removed.
//! - A peer id appears at most once in the peer table.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;

use crate::builder::NetronBuilder;
use crate::definition::Definition;
use crate::error::Error;
use crate::error::Result;
use crate::event;
use crate::event::Event;
use crate::event::EventEmitter;
use crate::event::EventHandler;
use crate::identity::PeerInfo;
use crate::interface::InterfaceFactory;
use crate::interface::TwinFactory;
use crate::options::Options;
use crate::packet;
use crate::packet::Packet;
use crate::peer::OwnPeer;
use crate::peer::Peer;
use crate::peer::RemotePeer;
use crate::reflection::Context;
use crate::reflection::context_addr;
use crate::reflection::same_context;
use crate::registry::IdAllocator;
use crate::stub::Stub;
use crate::task;
use crate::task::Task;
use crate::task::TaskManager;
use crate::task::TaskRequest;
use crate::task::TaskResult;
use crate::task::TaskResults;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::value::Value;

pub struct Netron {
    info: PeerInfo,
    id: String,
    options: Options,
    ids: Arc<dyn IdAllocator>,
    own_peer: Arc<OwnPeer>,
    stubs: DashMap<u64, Arc<Stub>>,
    /// (peer id, instance address) to the definition id handed to that peer.
    served: DashMap<(String, usize), u64>,
    /// Attached context name to definition id.
    contexts: DashMap<String, u64>,
    peers: DashMap<String, Arc<RemotePeer>>,
    interface_factory: InterfaceFactory,
    events: EventEmitter,
    tasks: TaskManager,
}

impl Netron {
    /// A runtime with a random identity and default options.
    pub fn new() -> Arc<Self> {
        NetronBuilder::new().build()
    }

    pub fn builder() -> NetronBuilder {
        NetronBuilder::new()
    }

    pub(crate) fn from_parts(info: PeerInfo, options: Options, ids: Arc<dyn IdAllocator>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Netron>| Self {
            id: info.id.as_base58(),
            own_peer: OwnPeer::new(info.clone(), me.clone(), options.event_capacity),
            events: EventEmitter::new(options.event_capacity),
            info,
            options,
            ids,
            stubs: DashMap::new(),
            served: DashMap::new(),
            contexts: DashMap::new(),
            peers: DashMap::new(),
            interface_factory: InterfaceFactory::new(),
            tasks: TaskManager::new(),
        })
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.info
    }

    /// Base58 id of this runtime, shared with its own peer.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn id_allocator(&self) -> Arc<dyn IdAllocator> {
        self.ids.clone()
    }

    pub fn own_peer(&self) -> Arc<OwnPeer> {
        self.own_peer.clone()
    }

    pub fn interface_factory(&self) -> &InterfaceFactory {
        &self.interface_factory
    }

    // Contexts

    /// Exposes `ctx` under `ctx_id`, or under its reflected name when no id
    /// is given. Returns the id of its definition.
    pub fn attach_context(&self, ctx: Arc<dyn Context>, ctx_id: Option<&str>) -> Result<u64> {
        let reflection = ctx.reflection();
        let name = ctx_id.map_or_else(|| reflection.get_name().to_string(), str::to_string);

        let def = match self.contexts.entry(name.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Exists(format!("Context '{}' already exists", name)));
            }
            Entry::Vacant(slot) => {
                let stub = Arc::new(Stub::with_reflection(self.ids.clone(), ctx, reflection));
                let def = stub.definition().clone();
                self.stubs.insert(def.id, stub);
                slot.insert(def.id);
                def
            }
        };

        debug!(ctx = %name, def_id = def.id, "context attached");
        let def_id = def.id;
        self.events.emit(
            event::CONTEXT_ATTACH,
            Value::map([("id", Value::from(name)), ("def", Value::Definition(def))]),
        );
        Ok(def_id)
    }

    /// Removes the context named `ctx_id`. With `release_originated`, every
    /// context it handed out, directly or not, is released too.
    pub fn detach_context(&self, ctx_id: &str, release_originated: bool) -> Result<u64> {
        let (_, def_id) = self
            .contexts
            .remove(ctx_id)
            .ok_or_else(|| Error::NotExists(format!("Context '{}' not exists", ctx_id)))?;

        self.remove_stub(def_id);
        if release_originated {
            self.release_originated_contexts(def_id);
        }

        debug!(ctx = ctx_id, def_id, "context detached");
        self.events.emit(
            event::CONTEXT_DETACH,
            Value::map([("id", Value::from(ctx_id)), ("defId", Value::from(def_id))]),
        );
        Ok(def_id)
    }

    pub fn detach_all_contexts(&self, release_originated: bool) -> Result<()> {
        for name in self.context_names() {
            self.detach_context(&name, release_originated)?;
        }
        Ok(())
    }

    pub fn has_context(&self, ctx_id: &str) -> bool {
        self.contexts.contains_key(ctx_id)
    }

    pub fn has_contexts(&self) -> bool {
        !self.contexts.is_empty()
    }

    pub fn context_names(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn context_definition(&self, ctx_id: &str) -> Result<Arc<Definition>> {
        let def_id = self
            .contexts
            .get(ctx_id)
            .map(|e| *e.value())
            .ok_or_else(|| Error::Unknown(format!("Unknown context '{}'", ctx_id)))?;
        Ok(self.get_stub(def_id)?.definition().clone())
    }

    // Stubs

    pub fn stub(&self, def_id: u64) -> Option<Arc<Stub>> {
        self.stubs.get(&def_id).map(|s| s.value().clone())
    }

    pub fn get_stub(&self, def_id: u64) -> Result<Arc<Stub>> {
        self.stub(def_id)
            .ok_or_else(|| Error::Unknown(format!("Unknown definition '{}'", def_id)))
    }

    /// Removes the stub of `def_id` along with its entry in the served index.
    fn remove_stub(&self, def_id: u64) -> Option<Arc<Stub>> {
        let (_, stub) = self.stubs.remove(&def_id)?;
        if let Some(uid) = stub.definition().uid.clone() {
            self.served
                .remove_if(&(uid, context_addr(stub.instance())), |_, id| *id == def_id);
        }
        Some(stub)
    }

    /// The definition under which `ctx` is served to `peer`. The first time
    /// a nested stub is created, parented to `parent_id` and tagged with the
    /// peer id; later calls for the same instance and peer reuse it.
    pub fn ref_context(&self, peer: &Arc<dyn Peer>, ctx: &Arc<dyn Context>, parent_id: u64) -> Arc<Definition> {
        let uid = peer.id();
        let mint = || {
            let stub = Arc::new(Stub::nested(self.ids.clone(), ctx.clone(), parent_id, uid.to_string()));
            let def = stub.definition().clone();
            self.stubs.insert(def.id, stub);
            debug!(def_id = def.id, parent_id, peer = uid, "context referenced");
            def
        };

        // The entry guard is held until the new stub is registered.
        match self.served.entry((uid.to_string(), context_addr(ctx))) {
            Entry::Occupied(mut slot) => match self.stub(*slot.get()) {
                Some(stub) => stub.definition().clone(),
                None => {
                    let def = mint();
                    slot.insert(def.id);
                    def
                }
            },
            Entry::Vacant(slot) => {
                let def = mint();
                slot.insert(def.id);
                def
            }
        }
    }

    /// Drops every stub serving `ctx`.
    pub fn release_context(&self, ctx: &Arc<dyn Context>, release_originated: bool) {
        let def_ids: Vec<u64> = self
            .stubs
            .iter()
            .filter(|s| same_context(s.instance(), ctx))
            .map(|s| *s.key())
            .collect();

        for def_id in def_ids {
            self.remove_stub(def_id);
            self.contexts.retain(|_, id| *id != def_id);
            if release_originated {
                self.release_originated_contexts(def_id);
            }
        }
    }

    /// Drops every stub whose parent chain leads to `def_id`.
    pub fn release_originated_contexts(&self, def_id: u64) {
        let mut queue = VecDeque::from([def_id]);
        while let Some(parent) = queue.pop_front() {
            let children: Vec<u64> = self
                .stubs
                .iter()
                .filter(|s| s.definition().parent_id == parent)
                .map(|s| *s.key())
                .collect();
            for child in children {
                if self.remove_stub(child).is_some() {
                    debug!(def_id = child, parent_id = parent, "originated context released");
                    queue.push_back(child);
                }
            }
        }
    }

    fn stub_for_dispatch(&self, def_id: u64) -> Result<Arc<Stub>> {
        self.stub(def_id).ok_or_else(|| {
            Error::NotExists(format!("Context with definition id '{}' not exists", def_id))
        })
    }

    /// Runs a `get` arriving from `peer` against the stub of `def_id`.
    pub async fn dispatch_get(&self, peer: &Arc<dyn Peer>, def_id: u64, name: &str, default: Value) -> Result<Value> {
        self.stub_for_dispatch(def_id)?.get(name, default, peer).await
    }

    /// Runs a `set` arriving from `peer` against the stub of `def_id`.
    pub async fn dispatch_set(&self, peer: &Arc<dyn Peer>, def_id: u64, name: &str, data: Value) -> Result<()> {
        self.stub_for_dispatch(def_id)?.set(name, data, peer).await
    }

    // Peers

    /// Performs the handshake over `transport` and registers the peer on the
    /// other end. Both sides of a connection call this.
    pub async fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<Arc<RemotePeer>> {
        let info = match self.handshake(transport.as_ref()).await {
            Ok(info) => info,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        let peer = RemotePeer::new(info, Arc::downgrade(self), transport.clone(), &self.options);

        let duplicate = match self.peers.entry(peer.id().to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(peer.clone());
                false
            }
        };
        if duplicate {
            let _ = transport.close().await;
            return Err(Error::Exists(format!("Peer '{}' is already connected", peer.id())));
        }

        peer.start();
        if let Err(e) = peer.watch_contexts().await {
            peer.disconnect().await;
            return Err(e);
        }

        let requests = task::CONNECT_TASKS.iter().map(|t| TaskRequest::new(*t)).collect();
        let results = peer.run_task(requests).await;
        if let Some(TaskResult::Completed(Value::Map(defs))) = results.get(task::CONTEXT_DEFS) {
            for (ctx_id, def) in defs {
                if let Some(def) = def.as_definition() {
                    peer.add_context(ctx_id, def.clone());
                }
            }
        }

        info!(peer = %peer.id(), "peer connected");
        self.events.emit(event::PEER_CONNECT, Value::from(peer.id()));
        Ok(peer)
    }

    async fn handshake(&self, transport: &dyn Transport) -> Result<PeerInfo> {
        let hello = packet::encode(&Packet::Hello { info: self.info.clone() })?;
        transport.send(&hello).await?;

        let received = tokio::time::timeout(self.options.response_timeout, transport.recv())
            .await
            .map_err(|_| Error::Timeout)??;
        let Some(bytes) = received else {
            return Err(TransportError::ConnectionLost("Closed during handshake".into()).into());
        };

        match packet::decode(&bytes)? {
            Packet::Hello { info } if info.id == self.info.id => {
                Err(Error::NotValid("Peer presented our own identity".into()))
            }
            Packet::Hello { info } => Ok(info),
            _ => Err(Error::NotValid("Expected hello packet".into())),
        }
    }

    /// The peer with base58 id `peer_id`, including our own.
    pub fn get_peer(&self, peer_id: &str) -> Result<Arc<dyn Peer>> {
        if peer_id == self.id {
            return Ok(self.own_peer.clone());
        }
        self.peers
            .get(peer_id)
            .map(|p| p.value().clone() as Arc<dyn Peer>)
            .ok_or_else(|| Error::Unknown(format!("Unknown peer '{}'", peer_id)))
    }

    /// Every connected remote peer.
    pub fn peers(&self) -> Vec<Arc<RemotePeer>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub async fn disconnect_peer(&self, peer_id: &str) -> Result<()> {
        let peer = self
            .peers
            .get(peer_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::Unknown(format!("Unknown peer '{}'", peer_id)))?;
        peer.disconnect().await;
        Ok(())
    }

    /// Disconnects every remote peer.
    pub async fn disconnect(&self) {
        for peer in self.peers() {
            peer.disconnect().await;
        }
    }

    /// Forgets everything held on behalf of a peer that went away.
    pub(crate) fn peer_disconnected(&self, peer_id: &str) {
        if self.peers.remove(peer_id).is_none() {
            return;
        }

        let served: Vec<u64> = self
            .served
            .iter()
            .filter(|e| e.key().0 == peer_id)
            .map(|e| *e.value())
            .collect();
        for def_id in served {
            self.remove_stub(def_id);
            self.release_originated_contexts(def_id);
        }

        info!(peer = peer_id, "peer disconnected");
        self.events.emit(event::PEER_DISCONNECT, Value::from(peer_id));
    }

    // Tasks

    pub fn add_task(&self, name: &str, task: Arc<dyn Task>) -> Result<()> {
        self.tasks.add(name, task)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.has(name)
    }

    /// Runs tasks requested by `peer` against this runtime.
    pub async fn run_peer_task(self: &Arc<Self>, peer: Arc<dyn Peer>, requests: Vec<TaskRequest>) -> TaskResults {
        self.tasks.run(self.clone(), peer, requests).await
    }

    // Events

    pub fn subscribe(&self, name: &str, handler: EventHandler) {
        self.events.on(name, handler);
    }

    pub fn unsubscribe(&self, name: &str, handler: &EventHandler) {
        self.events.off(name, handler);
    }

    pub fn emit(&self, name: &str, data: Value) {
        self.events.emit(name, data);
    }

    /// A receiver of every event this runtime emits from now on.
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.events.listen()
    }

    // Twins

    pub fn set_interface_twin(&self, name: &str, factory: TwinFactory) -> Result<()> {
        self.interface_factory.set_twin(name, factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::reflection::MethodMeta;
    use crate::reflection::Reflection;

    struct Leaf;

    #[async_trait::async_trait]
    impl Context for Leaf {
        fn reflection(&self) -> Reflection {
            Reflection::new("Leaf").method("ping", MethodMeta::returns("string"))
        }

        async fn call(&self, _method: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
            Ok(Value::from("pong"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refs_share_one_stub() {
        let netron = Netron::new();
        let peer: Arc<dyn Peer> = netron.own_peer();
        let ctx: Arc<dyn Context> = Arc::new(Leaf);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let (netron, peer, ctx) = (netron.clone(), peer.clone(), ctx.clone());
                tokio::spawn(async move { netron.ref_context(&peer, &ctx, 0).id })
            })
            .collect();
        let ids: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]), "ids differ: {:?}", ids);
        assert_eq!(netron.stubs.len(), 1);
        assert_eq!(netron.served.len(), 1);
    }

    #[tokio::test]
    async fn test_released_context_is_referenced_afresh() {
        let netron = Netron::new();
        let peer: Arc<dyn Peer> = netron.own_peer();
        let ctx: Arc<dyn Context> = Arc::new(Leaf);

        let first = netron.ref_context(&peer, &ctx, 0);
        assert_eq!(first.uid.as_deref(), Some(netron.id()));
        netron.release_context(&ctx, false);
        assert!(netron.stub(first.id).is_none());
        assert!(netron.served.is_empty());

        let second = netron.ref_context(&peer, &ctx, 0);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_released_parent_takes_index_entries_of_children() {
        let netron = Netron::new();
        let peer: Arc<dyn Peer> = netron.own_peer();
        let parent_id = netron.attach_context(Arc::new(Leaf), Some("parent")).unwrap();
        let child: Arc<dyn Context> = Arc::new(Leaf);
        let def = netron.ref_context(&peer, &child, parent_id);

        netron.detach_context("parent", true).unwrap();
        assert!(netron.stub(def.id).is_none());
        assert!(netron.served.is_empty());
    }
}
