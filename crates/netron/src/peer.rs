//! # Peers
//!
//! A peer is one endpoint of a runtime's connections. Every variant, whether
//! the in-process [`OwnPeer`] or a [`RemotePeer`] behind some transport,
//! implements the same [`Peer`] trait, so interfaces and tasks never care
//! which one they talk through.
//!
//! ## Invariants
//!
//! - `id()` is the base58 form of the peer's identity, always.
//! - A peer's interface cache is only mutated through that peer.
//! - `disconnect()` may be called any number of times.
//! - `run_task()` never fails as a whole; failures live in the per-task results.

pub mod own;
pub mod remote;

pub use own::OwnPeer;
pub use remote::RemotePeer;

use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

use crate::definition::Definition;
use crate::error::Error;
use crate::error::Result;
use crate::event;
use crate::event::Event;
use crate::event::EventEmitter;
use crate::event::EventHandler;
use crate::identity::PeerInfo;
use crate::interface::Interface;
use crate::netron::Netron;
use crate::reflection::Context;
use crate::task::TaskRequest;
use crate::task::TaskResult;
use crate::task::TaskResults;
use crate::value::Value;

/// State shared by every peer variant.
pub struct PeerCore {
    info: PeerInfo,
    id: String,
    netron: Weak<Netron>,
    me: Weak<dyn Peer>,
    interfaces: DashMap<u64, Interface>,
    definitions: DashMap<u64, Arc<Definition>>,
    tasks: DashMap<String, TaskResult>,
    events: EventEmitter,
    /// Flips to `true` once, when the peer disconnects.
    closed: watch::Sender<bool>,
}

impl PeerCore {
    pub(crate) fn new(
        info: PeerInfo,
        netron: Weak<Netron>,
        me: Weak<dyn Peer>,
        event_capacity: usize,
    ) -> Self {
        Self {
            id: info.id.as_base58(),
            info,
            netron,
            me,
            interfaces: DashMap::new(),
            definitions: DashMap::new(),
            tasks: DashMap::new(),
            events: EventEmitter::new(event_capacity),
            closed: watch::Sender::new(false),
        }
    }

    pub fn netron(&self) -> Result<Arc<Netron>> {
        self.netron
            .upgrade()
            .ok_or_else(|| Error::IllegalState("Netron has been dropped".into()))
    }

    /// A strong handle to the peer owning this core.
    pub fn handle(&self) -> Result<Arc<dyn Peer>> {
        self.me
            .upgrade()
            .ok_or_else(|| Error::IllegalState(format!("Peer '{}' has been dropped", self.id)))
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) fn definition(&self, def_id: u64) -> Option<Arc<Definition>> {
        self.definitions.get(&def_id).map(|d| d.value().clone())
    }

    pub(crate) fn forget_definition(&self, def_id: u64) {
        self.definitions.remove(&def_id);
        self.interfaces.remove(&def_id);
    }

    /// Caches `results` and announces each finished task.
    pub(crate) fn merge_task_results(&self, results: &TaskResults) {
        for (name, result) in results {
            self.tasks.insert(name.clone(), result.clone());
            self.events.emit(event::TASK_RESULT, Value::from(name.as_str()));
        }
    }

    /// Drops cached state and wakes everything waiting on this peer.
    pub(crate) fn close(&self) {
        self.interfaces.clear();
        self.definitions.clear();
        self.tasks.clear();
        self.events.clear();
        self.closed.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait::async_trait]
pub trait Peer: Send + Sync + 'static {
    fn core(&self) -> &PeerCore;

    fn info(&self) -> &PeerInfo {
        &self.core().info
    }

    /// Canonical key of this peer.
    fn id(&self) -> &str {
        &self.core().id
    }

    fn netron(&self) -> Result<Arc<Netron>> {
        self.core().netron()
    }

    /// Interfaces handed out through this peer, keyed by definition id.
    fn interfaces(&self) -> &DashMap<u64, Interface> {
        &self.core().interfaces
    }

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn set(&self, def_id: u64, name: &str, data: Value) -> Result<()>;

    async fn get(&self, def_id: u64, name: &str, default: Value) -> Result<Value>;

    async fn call(&self, def_id: u64, name: &str, args: Vec<Value>) -> Result<Value> {
        self.get(def_id, name, Value::List(args)).await
    }

    async fn call_void(&self, def_id: u64, name: &str, args: Vec<Value>) -> Result<()> {
        self.set(def_id, name, Value::List(args)).await
    }

    async fn run_task(&self, requests: Vec<TaskRequest>) -> TaskResults;

    /// The cached outcome of a task run earlier, or `None` if it never ran.
    fn get_task_result(&self, name: &str) -> Option<TaskResult> {
        self.core().tasks.get(name).map(|r| r.value().clone())
    }

    async fn attach_context(&self, _ctx: Arc<dyn Context>, _ctx_id: Option<&str>) -> Result<u64> {
        Err(Error::not_implemented("attachContext"))
    }

    async fn detach_context(&self, _ctx_id: &str, _release_originated: bool) -> Result<u64> {
        Err(Error::not_implemented("detachContext"))
    }

    async fn detach_all_contexts(&self, release_originated: bool) -> Result<()> {
        for name in self.context_names() {
            self.detach_context(&name, release_originated).await?;
        }
        Ok(())
    }

    fn has_context(&self, ctx_id: &str) -> bool;

    fn has_contexts(&self) -> bool {
        !self.context_names().is_empty()
    }

    fn context_names(&self) -> Vec<String>;

    fn get_context_definition(&self, ctx_id: &str) -> Result<Arc<Definition>>;

    /// Events about contexts coming and going on this peer.
    fn context_events(&self) -> broadcast::Receiver<Event> {
        self.core().events.listen()
    }

    /// Resolves once a context named `ctx_id` exists on this peer. Never times
    /// out by itself, but fails as soon as the peer disconnects.
    async fn wait_for_context(&self, ctx_id: &str) -> Result<()> {
        let mut rx = self.context_events();
        let mut closed = self.core().closed.subscribe();
        if self.has_context(ctx_id) {
            return Ok(());
        }
        if self.core().is_closed() {
            return Err(Error::disconnected(self.id()));
        }
        loop {
            let received = tokio::select! {
                received = rx.recv() => received,
                // The flag only ever moves to `true`, so any wakeup means closed.
                _ = closed.changed() => return Err(Error::disconnected(self.id())),
            };
            match received {
                Ok(ev) if ev.name == event::CONTEXT_ATTACH && event_context_id(&ev.data) == Some(ctx_id) => {
                    return Ok(());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if self.has_context(ctx_id) {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => return Err(Error::disconnected(self.id())),
            }
        }
    }

    fn query_interface(&self, ctx_id: &str) -> Result<Interface> {
        let def = self.get_context_definition(ctx_id)?;
        let def_id = def.id;
        self.update_definitions(&[def]);
        self.query_interface_by_definition(def_id)
    }

    fn query_interface_by_definition(&self, def_id: u64) -> Result<Interface> {
        if let Some(iface) = self.interfaces().get(&def_id) {
            return Ok(iface.value().clone());
        }
        let def = self
            .core()
            .definition(def_id)
            .ok_or_else(|| Error::Unknown(format!("Unknown definition '{}'", def_id)))?;
        let netron = self.netron()?;
        let me = self.core().handle()?;
        Ok(netron.interface_factory().create(def, &me))
    }

    /// Forgets an interface obtained through this peer.
    fn release_interface(&self, iface: &Value) -> Result<()> {
        let Value::Interface(iface) = iface else {
            return Err(Error::NotValid("Object is not a netron interface".into()));
        };
        if iface.peer_id() != self.id() {
            return Err(Error::NotValid(format!(
                "Interface '{}' belongs to peer '{}'",
                iface.definition().name,
                iface.peer_id()
            )));
        }
        self.interfaces().remove(&iface.def_id());
        Ok(())
    }

    /// Records definitions learned from this peer.
    fn update_definitions(&self, defs: &[Arc<Definition>]) {
        for def in defs {
            self.core().definitions.insert(def.id, def.clone());
        }
    }

    async fn subscribe(&self, _event: &str, _handler: EventHandler) -> Result<()> {
        Err(Error::not_implemented("subscribe"))
    }

    async fn unsubscribe(&self, _event: &str, _handler: &EventHandler) -> Result<()> {
        Err(Error::not_implemented("unsubscribe"))
    }
}

/// The `id` field of a context attach or detach event.
pub(crate) fn event_context_id(data: &Value) -> Option<&str> {
    data.as_map()?.get("id")?.as_str()
}
