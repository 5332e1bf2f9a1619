//! The in-process peer of a runtime.
//!
//! Calls through an [`OwnPeer`] never leave the process: they go straight to
//! the runtime's stub table. It is what local code uses to query interfaces
//! of its own contexts with the same API it would use for a remote peer.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;
use tracing::debug;

use crate::definition::Definition;
use crate::definition::Reference;
use crate::error::Result;
use crate::event::Event;
use crate::event::EventHandler;
use crate::identity::PeerInfo;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::peer::PeerCore;
use crate::reflection::Context;
use crate::stub::process_object;
use crate::task::TaskRequest;
use crate::task::TaskResults;
use crate::task::fail_all;
use crate::value::Value;

pub struct OwnPeer {
    core: PeerCore,
    connected: AtomicBool,
}

impl OwnPeer {
    pub(crate) fn new(info: PeerInfo, netron: Weak<Netron>, event_capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<OwnPeer>| {
            let me: Weak<dyn Peer> = me.clone();
            Self {
                core: PeerCore::new(info, netron, me, event_capacity),
                connected: AtomicBool::new(true),
            }
        })
    }

    /// Interfaces of this peer's own contexts stand for the instances
    /// themselves, so they travel back as references.
    fn localize(&self, value: Value) -> Value {
        match value {
            Value::Interface(iface) if iface.peer_id() == self.id() => {
                Value::Reference(Reference::new(iface.def_id()))
            }
            Value::List(items) => Value::List(items.into_iter().map(|v| self.localize(v)).collect()),
            Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, self.localize(v))).collect()),
            Value::Definitions(defs) => {
                Value::Definitions(defs.into_iter().map(|v| self.localize(v)).collect())
            }
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl Peer for OwnPeer {
    fn core(&self) -> &PeerCore {
        &self.core
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(peer = %self.id(), "own peer disconnected");
            self.core.close();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn set(&self, def_id: u64, name: &str, data: Value) -> Result<()> {
        let netron = self.netron()?;
        let me = self.core.handle()?;
        netron.dispatch_set(&me, def_id, name, self.localize(data)).await
    }

    async fn get(&self, def_id: u64, name: &str, default: Value) -> Result<Value> {
        let netron = self.netron()?;
        let me = self.core.handle()?;
        let value = netron.dispatch_get(&me, def_id, name, self.localize(default)).await?;
        process_object(&netron, &me, value)
    }

    async fn run_task(&self, requests: Vec<TaskRequest>) -> TaskResults {
        let handles = self.netron().and_then(|n| Ok((n, self.core.handle()?)));
        let results = match handles {
            Ok((netron, me)) => netron.run_peer_task(me, requests).await,
            Err(e) => fail_all(&requests, &e),
        };
        self.core.merge_task_results(&results);
        results
    }

    async fn attach_context(&self, ctx: Arc<dyn Context>, ctx_id: Option<&str>) -> Result<u64> {
        self.netron()?.attach_context(ctx, ctx_id)
    }

    async fn detach_context(&self, ctx_id: &str, release_originated: bool) -> Result<u64> {
        self.netron()?.detach_context(ctx_id, release_originated)
    }

    fn has_context(&self, ctx_id: &str) -> bool {
        self.netron().is_ok_and(|n| n.has_context(ctx_id))
    }

    fn context_names(&self) -> Vec<String> {
        self.netron().map(|n| n.context_names()).unwrap_or_default()
    }

    fn get_context_definition(&self, ctx_id: &str) -> Result<Arc<Definition>> {
        self.netron()?.context_definition(ctx_id)
    }

    fn context_events(&self) -> broadcast::Receiver<Event> {
        match self.netron() {
            Ok(netron) => netron.listen(),
            Err(_) => self.core.events().listen(),
        }
    }

    async fn subscribe(&self, event: &str, handler: EventHandler) -> Result<()> {
        self.netron()?.subscribe(event, handler);
        Ok(())
    }

    async fn unsubscribe(&self, event: &str, handler: &EventHandler) -> Result<()> {
        self.netron()?.unsubscribe(event, handler);
        Ok(())
    }
}
