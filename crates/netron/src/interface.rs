//! # Interfaces
//!
//! An [`Interface`] is the client-side face of a context living behind some
//! peer. Member access is checked against the definition locally, then turned
//! into `get`/`set` calls on the peer the interface is bound to.
//!
//! The [`InterfaceFactory`] is the only place interfaces are created. It
//! reuses the peer's cached interface for a definition when there is one, and
//! attaches a twin when the definition asks for one that has been registered.

use std::any::Any;
use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::definition::Definition;
use crate::definition::Member;
use crate::error::Error;
use crate::error::Result;
use crate::peer::Peer;
use crate::value::Value;

/// Builds the client-side twin object of an interface.
pub type TwinFactory = Arc<dyn Fn(&Interface) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Proxy for a remote context, bound to one definition and one peer.
#[derive(Clone)]
pub struct Interface {
    def: Arc<Definition>,
    peer_id: String,
    peer: Weak<dyn Peer>,
    twin: Option<Arc<dyn Any + Send + Sync>>,
}

impl Interface {
    pub fn definition(&self) -> &Arc<Definition> {
        &self.def
    }

    pub fn def_id(&self) -> u64 {
        self.def.id
    }

    /// Base58 id of the peer this interface talks through.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn peer(&self) -> Result<Arc<dyn Peer>> {
        self.peer
            .upgrade()
            .ok_or_else(|| Error::IllegalState(format!("Peer '{}' has been dropped", self.peer_id)))
    }

    /// The twin built for this interface, if it is of type `T`.
    pub fn twin<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.twin.clone()?.downcast::<T>().ok()
    }

    fn member(&self, name: &str) -> Result<&Member> {
        self.def.member(name).ok_or_else(|| {
            Error::NotExists(format!("'{}' is not a member of '{}'", name, self.def.name))
        })
    }

    pub async fn get(&self, name: &str) -> Result<Value> {
        self.get_or(name, Value::Null).await
    }

    /// Reads a property, supplying `default` for the case where it is unset.
    pub async fn get_or(&self, name: &str, default: Value) -> Result<Value> {
        if self.member(name)?.is_method() {
            return Err(Error::NotValid(format!("'{}' is a method, not a property", name)));
        }
        self.peer()?.get(self.def.id, name, default).await
    }

    pub async fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        match self.member(name)? {
            Member::Method { .. } => {
                Err(Error::NotValid(format!("'{}' is a method, not a property", name)))
            }
            Member::Property { readonly: true, .. } => {
                Err(Error::InvalidAccess(format!("Property '{}' is not writable", name)))
            }
            Member::Property { .. } => self.peer()?.set(self.def.id, name, value.into()).await,
        }
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_method(name)?;
        self.peer()?.call(self.def.id, name, args).await
    }

    /// Calls a method without waiting for its return value.
    pub async fn call_void(&self, name: &str, args: Vec<Value>) -> Result<()> {
        self.ensure_method(name)?;
        self.peer()?.call_void(self.def.id, name, args).await
    }

    fn ensure_method(&self, name: &str) -> Result<()> {
        if self.member(name)?.is_method() {
            Ok(())
        } else {
            Err(Error::NotValid(format!("'{}' is a property, not a method", name)))
        }
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        self.def.id == other.def.id && self.peer_id == other.peer_id
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("def_id", &self.def.id)
            .field("name", &self.def.name)
            .field("peer_id", &self.peer_id)
            .field("twin", &self.twin.is_some())
            .finish()
    }
}

pub struct InterfaceFactory {
    twins: DashMap<String, TwinFactory>,
}

impl InterfaceFactory {
    pub fn new() -> Self {
        Self { twins: DashMap::new() }
    }

    /// Registers the twin used for definitions naming `name`.
    pub fn set_twin(&self, name: &str, factory: TwinFactory) -> Result<()> {
        match self.twins.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::Exists(format!("Twin for interface '{}' exists", name))),
            Entry::Vacant(slot) => {
                slot.insert(factory);
                Ok(())
            }
        }
    }

    pub fn has_twin(&self, name: &str) -> bool {
        self.twins.contains_key(name)
    }

    /// Returns the interface of `def` bound to `peer`, creating and caching it
    /// in the peer's interface table on first use.
    pub fn create(&self, def: Arc<Definition>, peer: &Arc<dyn Peer>) -> Interface {
        if let Some(existing) = peer.interfaces().get(&def.id) {
            return existing.clone();
        }

        let mut iface = Interface {
            peer_id: peer.id().to_string(),
            peer: Arc::downgrade(peer),
            twin: None,
            def,
        };

        let factory = iface
            .def
            .twin
            .as_deref()
            .and_then(|name| self.twins.get(name).map(|f| f.value().clone()));
        if let Some(factory) = factory {
            iface.twin = Some(factory(&iface));
        }

        peer.interfaces()
            .entry(iface.def.id)
            .or_insert(iface)
            .value()
            .clone()
    }
}

impl Default for InterfaceFactory {
    fn default() -> Self {
        Self::new()
    }
}
