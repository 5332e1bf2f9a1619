//! # Definitions and References
//!
//! A [`Definition`] is the capability descriptor of one context: the id its
//! stub is registered under plus the member table a remote peer needs to
//! build an interface. Definitions are shared behind `Arc` and never change
//! once built, since remote peers may already hold a copy.
//!
//! A [`Reference`] names a definition the *receiver* owns. It carries no
//! data and is resolved against the receiver's stub table.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::value::Value;

/// Metadata of one member of a context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Member {
    Method {
        /// Return type name.
        #[serde(rename = "type")]
        ty: String,
        /// `(type name, description)` of every positional argument.
        args: Vec<(String, String)>,
        description: String,
    },
    Property {
        #[serde(rename = "type")]
        ty: String,
        readonly: bool,
        description: String,
    },
}

impl Member {
    pub fn is_method(&self) -> bool {
        matches!(self, Self::Method { .. })
    }

    pub fn is_readonly(&self) -> bool {
        matches!(self, Self::Property { readonly: true, .. })
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Method { ty, .. } | Self::Property { ty, .. } => ty,
        }
    }
}

/// Capability descriptor of a context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub id: u64,
    /// Id of the definition whose method produced this one, 0 at top level.
    #[serde(rename = "parentId")]
    pub parent_id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Name of the client-side twin to use instead of a plain interface.
    #[serde(default)]
    pub twin: Option<String>,
    /// Base58 id of the peer this definition was handed out to.
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(rename = "$")]
    pub members: BTreeMap<String, Member>,
}

impl Definition {
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }
}

/// Wire placeholder for "the object behind `def_id`, owned by the receiver".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "defId")]
    pub def_id: u64,
}

impl Reference {
    pub fn new(def_id: u64) -> Self {
        Self { def_id }
    }
}

/// Ordered collection of remote-capable values.
///
/// Positions mean something to the caller (they mirror the positions of the
/// original result) and are preserved across the wire. Elements start out as
/// contexts or definitions and are replaced in place as they are translated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Definitions {
    items: Vec<Value>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Replaces the element at `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize, value: Value) {
        self.items[index] = value;
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.items.push(value.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Value> {
        self.items.iter_mut()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.items
    }
}

impl From<Vec<Value>> for Definitions {
    fn from(items: Vec<Value>) -> Self {
        Self { items }
    }
}

impl From<Vec<Arc<Definition>>> for Definitions {
    fn from(defs: Vec<Arc<Definition>>) -> Self {
        Self { items: defs.into_iter().map(Value::Definition).collect() }
    }
}

impl FromIterator<Value> for Definitions {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

impl IntoIterator for Definitions {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: u64) -> Arc<Definition> {
        Arc::new(Definition {
            id,
            parent_id: 0,
            name: format!("Ctx{}", id),
            description: None,
            twin: None,
            uid: None,
            members: BTreeMap::new(),
        })
    }

    #[test]
    fn test_definitions_preserve_order() {
        let mut defs = Definitions::from(vec![def(3), def(1)]);
        defs.push(Value::Definition(def(2)));
        let ids: Vec<u64> = defs
            .iter()
            .map(|v| match v {
                Value::Definition(d) => d.id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(defs.len(), 3);
    }

    #[test]
    fn test_definitions_set_replaces_in_place() {
        let mut defs = Definitions::from(vec![def(1), def(2)]);
        defs.set(1, Value::Int(7));
        assert_eq!(defs.get(1), Some(&Value::Int(7)));
        assert!(defs.get(2).is_none());
    }

    #[test]
    #[should_panic]
    fn test_definitions_set_out_of_range_panics() {
        let mut defs = Definitions::new();
        defs.set(0, Value::Null);
    }

    #[test]
    fn test_definition_json_shape() {
        let mut members = BTreeMap::new();
        members.insert("x".to_string(), Member::Property {
            ty: "number".into(),
            readonly: true,
            description: String::new(),
        });
        let d = Definition { members, ..(*def(5)).clone() };
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["parentId"], 0);
        assert_eq!(json["$"]["x"]["type"], "number");
        assert_eq!(json["$"]["x"]["readonly"], true);

        let back: Definition = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
