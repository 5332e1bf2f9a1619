//! # Contexts and their Reflection
//!
//! A context is a local object made callable from other peers. Rust has no
//! runtime reflection, so every context describes itself: [`Context::reflection`]
//! returns the member table the stub builds its definition from, and
//! [`Context::call`], [`Context::get_property`] and [`Context::set_property`]
//! are the dynamic dispatch points the table's names resolve to.

use std::sync::Arc;

use crate::value::Value;

/// A local object exposed to remote peers.
#[async_trait::async_trait]
pub trait Context: Send + Sync + 'static {
    /// Member metadata. Read once per stub, when its definition is built.
    fn reflection(&self) -> Reflection;

    /// Invokes the method `method` with positional `args`.
    async fn call(&self, method: &str, args: Vec<Value>) -> anyhow::Result<Value>;

    /// Reads a property. `None` means the property is currently unset.
    fn get_property(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }

    /// Writes a property.
    fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        let _ = value;
        anyhow::bail!("Context does not store property '{}'", name)
    }
}

/// Identity comparison of two context handles.
pub fn same_context(a: &Arc<dyn Context>, b: &Arc<dyn Context>) -> bool {
    context_addr(a) == context_addr(b)
}

/// Address of the instance behind `ctx`, stable for as long as it is alive.
pub(crate) fn context_addr(ctx: &Arc<dyn Context>) -> usize {
    Arc::as_ptr(ctx) as *const () as usize
}

/// Type name and description of a single method argument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgMeta {
    pub ty: String,
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodMeta {
    /// Return type name.
    pub ty: String,
    pub args: Vec<ArgMeta>,
    pub description: String,
}

impl MethodMeta {
    pub fn returns(ty: impl Into<String>) -> Self {
        Self { ty: ty.into(), ..Self::default() }
    }

    pub fn arg(mut self, ty: impl Into<String>, description: impl Into<String>) -> Self {
        self.args.push(ArgMeta { ty: ty.into(), description: description.into() });
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyMeta {
    pub ty: String,
    pub readonly: bool,
    pub description: String,
}

impl PropertyMeta {
    pub fn of(ty: impl Into<String>) -> Self {
        Self { ty: ty.into(), ..Self::default() }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Everything a stub needs to know about a context to describe it remotely.
///
/// Members keep their declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reflection {
    name: String,
    description: Option<String>,
    twin: Option<String>,
    methods: Vec<(String, MethodMeta)>,
    properties: Vec<(String, PropertyMeta)>,
}

impl Reflection {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Asks clients to use the twin registered under `name` instead of a
    /// plain interface.
    pub fn twin(mut self, name: impl Into<String>) -> Self {
        self.twin = Some(name.into());
        self
    }

    pub fn method(mut self, name: impl Into<String>, meta: MethodMeta) -> Self {
        self.methods.push((name.into(), meta));
        self
    }

    pub fn property(mut self, name: impl Into<String>, meta: PropertyMeta) -> Self {
        self.properties.push((name.into(), meta));
        self
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn has_twin(&self) -> bool {
        self.twin.is_some()
    }

    pub fn get_twin(&self) -> Option<&str> {
        self.twin.as_deref()
    }

    pub fn get_methods(&self) -> impl Iterator<Item = (&str, &MethodMeta)> {
        self.methods.iter().map(|(name, meta)| (name.as_str(), meta))
    }

    pub fn get_properties(&self) -> impl Iterator<Item = (&str, &PropertyMeta)> {
        self.properties.iter().map(|(name, meta)| (name.as_str(), meta))
    }
}
