//! # Values
//!
//! Everything passed to or returned from a context is a [`Value`]. Besides
//! plain data it has one variant per remote-object kind, so translating a
//! value between its local and wire forms is an exhaustive match instead of
//! structural inspection.
//!
//! [`WireValue`] is the serializable subset. Live contexts and interfaces
//! have no wire form; a peer replaces them with definitions and references
//! before anything is encoded.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::definition::Definition;
use crate::definition::Definitions;
use crate::definition::Reference;
use crate::error::Error;
use crate::error::Result;
use crate::interface::Interface;
use crate::reflection::Context;
use crate::reflection::same_context;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An object the receiving side owns.
    Reference(Reference),
    /// A remote-capable object in descriptor form.
    Definition(Arc<Definition>),
    Definitions(Definitions),
    /// A live local context, not yet registered with a stub.
    Context(Arc<dyn Context>),
    /// A proxy for a context living on some peer.
    Interface(Interface),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_definition(&self) -> Option<&Arc<Definition>> {
        match self {
            Self::Definition(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_definitions(&self) -> Option<&Definitions> {
        match self {
            Self::Definitions(defs) => Some(defs),
            _ => None,
        }
    }

    pub fn as_context(&self) -> Option<&Arc<dyn Context>> {
        match self {
            Self::Context(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<&Interface> {
        match self {
            Self::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    pub fn into_interface(self) -> Option<Interface> {
        match self {
            Self::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    /// Spreads a value into positional method arguments.
    ///
    /// A list is the argument list, null is no arguments, and anything else
    /// is a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Self::List(items) => items,
            Self::Null => Vec::new(),
            other => vec![other],
        }
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Int(i) => write!(f, "Int({})", i),
            Self::Float(x) => write!(f, "Float({})", x),
            Self::String(s) => write!(f, "String({:?})", s),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Reference(r) => write!(f, "Reference({})", r.def_id),
            Self::Definition(d) => write!(f, "Definition({}, {:?})", d.id, d.name),
            Self::Definitions(defs) => f.debug_tuple("Definitions").field(defs).finish(),
            Self::Context(ctx) => write!(f, "Context({:?})", ctx.reflection().get_name()),
            Self::Interface(iface) => write!(f, "{:?}", iface),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Reference(a), Self::Reference(b)) => a == b,
            (Self::Definition(a), Self::Definition(b)) => a == b,
            (Self::Definitions(a), Self::Definitions(b)) => a == b,
            (Self::Context(a), Self::Context(b)) => same_context(a, b),
            (Self::Interface(a), Self::Interface(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

/// Saturates at `i64::MAX`.
impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Reference(r)
    }
}

impl From<Arc<Definition>> for Value {
    fn from(d: Arc<Definition>) -> Self {
        Self::Definition(d)
    }
}

impl From<Definitions> for Value {
    fn from(defs: Definitions) -> Self {
        Self::Definitions(defs)
    }
}

impl From<Arc<dyn Context>> for Value {
    fn from(ctx: Arc<dyn Context>) -> Self {
        Self::Context(ctx)
    }
}

impl From<Interface> for Value {
    fn from(iface: Interface) -> Self {
        Self::Interface(iface)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// The serializable form of a [`Value`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Reference(Reference),
    Definition(Definition),
    Definitions(Vec<WireValue>),
}

impl TryFrom<Value> for WireValue {
    type Error = Error;

    /// Fails on live contexts and interfaces; those need a peer to translate.
    fn try_from(value: Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Int(i) => Self::Int(i),
            Value::Float(x) => Self::Float(x),
            Value::String(s) => Self::String(s),
            Value::List(items) => {
                Self::List(items.into_iter().map(Self::try_from).collect::<Result<_>>()?)
            }
            Value::Map(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Self::try_from(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Reference(r) => Self::Reference(r),
            Value::Definition(d) => Self::Definition(Arc::unwrap_or_clone(d)),
            Value::Definitions(defs) => Self::Definitions(
                defs.into_iter().map(Self::try_from).collect::<Result<_>>()?,
            ),
            Value::Context(ctx) => {
                return Err(Error::NotValid(format!(
                    "Context '{}' has no wire form",
                    ctx.reflection().get_name()
                )));
            }
            Value::Interface(iface) => {
                return Err(Error::NotValid(format!(
                    "Interface of definition '{}' has no wire form",
                    iface.def_id()
                )));
            }
        })
    }
}

impl From<WireValue> for Value {
    fn from(wire: WireValue) -> Self {
        match wire {
            WireValue::Null => Self::Null,
            WireValue::Bool(b) => Self::Bool(b),
            WireValue::Int(i) => Self::Int(i),
            WireValue::Float(x) => Self::Float(x),
            WireValue::String(s) => Self::String(s),
            WireValue::List(items) => Self::List(items.into_iter().map(Self::from).collect()),
            WireValue::Map(map) => Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
            WireValue::Reference(r) => Self::Reference(r),
            WireValue::Definition(d) => Self::Definition(Arc::new(d)),
            WireValue::Definitions(items) => {
                Self::Definitions(items.into_iter().map(Self::from).collect())
            }
        }
    }
}
