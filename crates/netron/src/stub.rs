//! # Stubs
//!
//! A [`Stub`] is the server-side endpoint of one context. Every remote `get`
//! or `set` aimed at the context's definition id lands here, is checked
//! against the member table, and becomes a real call on the instance.
//!
//! The stub is also the single choke point for values crossing the instance
//! boundary:
//!
//! - **Incoming**: references are resolved to the instances they name, and
//!   definitions become interfaces bound to the calling peer.
//! - **Outgoing**: contexts returned by the instance are registered as nested
//!   definitions, parented to this stub and tagged with the calling peer.
//!
//! ## Invariants
//!
//! - The instance never changes; exposing another one needs another stub.
//! - The definition is built once, on first access, and then frozen.
//! - Errors raised by the instance reach the caller unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;

use tracing::trace;

use crate::definition::Definition;
use crate::definition::Definitions;
use crate::definition::Member;
use crate::error::Error;
use crate::error::Result;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::reflection::Context;
use crate::reflection::Reflection;
use crate::registry::IdAllocator;
use crate::value::Value;

pub struct Stub {
    instance: Arc<dyn Context>,
    reflection: Reflection,
    ids: Arc<dyn IdAllocator>,
    parent_id: u64,
    uid: Option<String>,
    def: OnceLock<Arc<Definition>>,
}

impl Stub {
    /// A top-level stub, reflecting `instance` for its metadata.
    pub fn new(ids: Arc<dyn IdAllocator>, instance: Arc<dyn Context>) -> Self {
        let reflection = instance.reflection();
        Self::with_reflection(ids, instance, reflection)
    }

    /// A top-level stub built from an already computed reflection.
    pub fn with_reflection(
        ids: Arc<dyn IdAllocator>,
        instance: Arc<dyn Context>,
        reflection: Reflection,
    ) -> Self {
        Self {
            instance,
            reflection,
            ids,
            parent_id: 0,
            uid: None,
            def: OnceLock::new(),
        }
    }

    /// A stub for a context produced by the stub `parent_id` and handed out
    /// to the peer `uid`.
    pub(crate) fn nested(
        ids: Arc<dyn IdAllocator>,
        instance: Arc<dyn Context>,
        parent_id: u64,
        uid: String,
    ) -> Self {
        let reflection = instance.reflection();
        Self {
            parent_id,
            uid: Some(uid),
            ..Self::with_reflection(ids, instance, reflection)
        }
    }

    pub fn instance(&self) -> &Arc<dyn Context> {
        &self.instance
    }

    pub fn reflection(&self) -> &Reflection {
        &self.reflection
    }

    /// The definition of this stub. The id is allocated on first access.
    pub fn definition(&self) -> &Arc<Definition> {
        self.def.get_or_init(|| Arc::new(self.build_definition()))
    }

    fn build_definition(&self) -> Definition {
        let r = &self.reflection;
        let mut members = BTreeMap::new();

        for (name, meta) in r.get_methods() {
            members.insert(name.to_string(), Member::Method {
                ty: meta.ty.clone(),
                args: meta
                    .args
                    .iter()
                    .map(|a| (a.ty.clone(), a.description.clone()))
                    .collect(),
                description: meta.description.clone(),
            });
        }

        for (name, meta) in r.get_properties() {
            members.insert(name.to_string(), Member::Property {
                ty: meta.ty.clone(),
                readonly: meta.readonly,
                description: meta.description.clone(),
            });
        }

        Definition {
            id: self.ids.next_id(),
            parent_id: self.parent_id,
            name: r.get_name().to_string(),
            description: r.get_description().map(str::to_string),
            twin: r.get_twin().map(str::to_string),
            uid: self.uid.clone(),
            members,
        }
    }

    fn member(&self, prop: &str) -> Result<&Member> {
        self.definition().member(prop).ok_or_else(|| {
            Error::NotExists(format!("'{}' is not a member of '{}'", prop, self.reflection.get_name()))
        })
    }

    /// Writes a property or calls a method for its side effects only.
    ///
    /// A method's return value is discarded; use [`Stub::get`] to obtain it.
    pub async fn set(&self, prop: &str, data: Value, peer: &Arc<dyn Peer>) -> Result<()> {
        let member = self.member(prop)?;
        let netron = peer.netron()?;
        trace!(def_id = self.definition().id, prop, "stub set");

        match member {
            Member::Method { .. } => {
                let args = self.process_args(&netron, peer, data, true)?.into_args();
                self.instance.call(prop, args).await.map_err(Error::Context)?;
                Ok(())
            }
            Member::Property { readonly: true, .. } => {
                Err(Error::InvalidAccess(format!("Property '{}' is not writable", prop)))
            }
            Member::Property { .. } => {
                let value = self.process_args(&netron, peer, data, false)?;
                self.instance.set_property(prop, value).map_err(Error::Context)
            }
        }
    }

    /// Calls a method or reads a property, returning the result in a form
    /// that can cross back to `peer`.
    ///
    /// For an unset property, `default` is processed and returned instead.
    /// It is written back to the instance only when the runtime is configured
    /// to seed property defaults.
    pub async fn get(&self, prop: &str, default: Value, peer: &Arc<dyn Peer>) -> Result<Value> {
        let member = self.member(prop)?;
        let netron = peer.netron()?;
        trace!(def_id = self.definition().id, prop, "stub get");

        if member.is_method() {
            let args = self.process_args(&netron, peer, default, true)?.into_args();
            let result = self.instance.call(prop, args).await.map_err(Error::Context)?;
            return Ok(self.process_result(&netron, peer, result));
        }

        match self.instance.get_property(prop) {
            Some(value) => Ok(self.process_result(&netron, peer, value)),
            None => {
                let value = self.process_args(&netron, peer, default, false)?;
                if netron.options().seed_property_defaults && !value.is_null() {
                    self.instance
                        .set_property(prop, value.clone())
                        .map_err(Error::Context)?;
                }
                Ok(value)
            }
        }
    }

    /// Translates a value produced by the instance for the trip to `peer`.
    fn process_result(&self, netron: &Netron, peer: &Arc<dyn Peer>, result: Value) -> Value {
        match result {
            Value::Context(ctx) => {
                Value::Definition(netron.ref_context(peer, &ctx, self.definition().id))
            }
            Value::Definitions(defs) => Value::Definitions(
                defs.into_iter()
                    .map(|item| self.process_result(netron, peer, item))
                    .collect::<Definitions>(),
            ),
            other => other,
        }
    }

    /// Translates incoming call data. For a method call the elements of an
    /// argument list are translated one by one; otherwise `args` is a single
    /// value. Either way the translated value is returned.
    fn process_args(
        &self,
        netron: &Netron,
        peer: &Arc<dyn Peer>,
        args: Value,
        is_method: bool,
    ) -> Result<Value> {
        match args {
            Value::List(items) if is_method => items
                .into_iter()
                .map(|arg| process_object(netron, peer, arg))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            single => process_object(netron, peer, single),
        }
    }
}

/// Resolves references against the local stub table and turns definitions
/// into interfaces bound to `peer`. Other values pass through untouched.
pub(crate) fn process_object(netron: &Netron, peer: &Arc<dyn Peer>, obj: Value) -> Result<Value> {
    match obj {
        Value::Reference(r) => {
            let stub = netron.get_stub(r.def_id)?;
            Ok(Value::Context(stub.instance().clone()))
        }
        Value::Definition(def) => {
            peer.update_definitions(std::slice::from_ref(&def));
            Ok(Value::Interface(netron.interface_factory().create(def, peer)))
        }
        Value::Definitions(mut defs) => {
            for item in defs.iter_mut() {
                let taken = std::mem::take(item);
                *item = process_object(netron, peer, taken)?;
            }
            Ok(Value::Definitions(defs))
        }
        other => Ok(other),
    }
}
