//! Method tables and implementations.
//!
//! A [`MethodTable`] is the per-type (or per-fragment) record of methods,
//! property accessors, missing-member hooks and full-interception
//! overrides. Tables are immutable once published: the registry hands out
//! `Arc<MethodTable>` snapshots and writers swap in a rebuilt copy.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::dispatch::CallContext;
use crate::error::DispatchError;
use crate::value::{TypeId, Value};

/// Body of a native implementation.
pub type NativeFn =
    dyn Fn(&CallContext<'_>, &[Value]) -> Result<Value, DispatchError> + Send + Sync;

/// Body of a closure-backed implementation; receives its captured environment.
pub type ClosureFn =
    dyn Fn(&CapturedEnv, &CallContext<'_>, &[Value]) -> Result<Value, DispatchError> + Send + Sync;

/// Variables captured by a closure-backed implementation.
#[derive(Debug, Clone, Default)]
pub struct CapturedEnv {
    bindings: FxHashMap<String, Value>,
}

impl CapturedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// A callable member body.
#[derive(Clone)]
pub enum Implementation {
    /// Host function.
    Native(Arc<NativeFn>),
    /// Function plus its captured environment.
    ClosureBacked {
        env: Arc<CapturedEnv>,
        body: Arc<ClosureFn>,
    },
    /// Forwards to another implementation.
    DelegatingTo(Arc<Implementation>),
}

impl Implementation {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&CallContext<'_>, &[Value]) -> Result<Value, DispatchError> + Send + Sync + 'static,
    {
        Implementation::Native(Arc::new(f))
    }

    pub fn closure<F>(env: CapturedEnv, f: F) -> Self
    where
        F: Fn(&CapturedEnv, &CallContext<'_>, &[Value]) -> Result<Value, DispatchError>
            + Send
            + Sync
            + 'static,
    {
        Implementation::ClosureBacked {
            env: Arc::new(env),
            body: Arc::new(f),
        }
    }

    pub fn delegating(target: Implementation) -> Self {
        Implementation::DelegatingTo(Arc::new(target))
    }

    /// Native implementation that always returns `value`.
    pub fn constant(value: impl Into<Value>) -> Self {
        let value = value.into();
        Implementation::native(move |_, _| Ok(value.clone()))
    }

    /// Run the body.
    pub fn invoke(&self, ctx: &CallContext<'_>, args: &[Value]) -> Result<Value, DispatchError> {
        match self {
            Implementation::Native(f) => f(ctx, args),
            Implementation::ClosureBacked { env, body } => body(env, ctx, args),
            Implementation::DelegatingTo(inner) => inner.invoke(ctx, args),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Implementation::Native(_) => "native",
            Implementation::ClosureBacked { .. } => "closure",
            Implementation::DelegatingTo(_) => "delegating",
        }
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Native(_) => f.write_str("Native(..)"),
            Implementation::ClosureBacked { env, .. } => {
                write!(f, "ClosureBacked({} captured)", env.len())
            }
            Implementation::DelegatingTo(inner) => write!(f, "DelegatingTo({:?})", inner),
        }
    }
}

/// Method signature: name plus declared parameter types (arity is `params.len()`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: Arc<str>,
    pub params: Vec<TypeId>,
}

impl Signature {
    pub fn new(name: &str, params: impl Into<Vec<TypeId>>) -> Self {
        Self {
            name: Arc::from(name),
            params: params.into(),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Where a table entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Registered through `register_native_method`.
    Native,
    /// Added at runtime through `add_dynamic_method` or a fragment builder.
    Dynamic,
    /// Copied from the given source type by a mixin.
    Mixin(TypeId),
}

/// One method in a table.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub signature: Signature,
    pub implementation: Implementation,
    pub origin: EntryOrigin,
    /// Entry replaced by a dynamic definition, restored when it is removed.
    shadowed: Option<Box<MethodEntry>>,
}

impl MethodEntry {
    pub fn new(signature: Signature, implementation: Implementation, origin: EntryOrigin) -> Self {
        Self {
            signature,
            implementation,
            origin,
            shadowed: None,
        }
    }

    /// The entry this one replaced, if it was a dynamic definition.
    pub fn shadowed(&self) -> Option<&MethodEntry> {
        self.shadowed.as_deref()
    }
}

/// Getter and setter for a property.
#[derive(Debug, Clone, Default)]
pub struct PropertyAccessors {
    pub getter: Option<Implementation>,
    pub setter: Option<Implementation>,
}

/// Fallback hook kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    MethodMissing,
    PropertyMissing,
}

/// Full-interception override kinds (the per-type "route everything" opt-in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptionKind {
    InvokeMethod,
    GetProperty,
    SetProperty,
}

#[derive(Debug, Clone, Default)]
struct Hooks {
    method_missing: Option<Implementation>,
    property_missing: Option<Implementation>,
}

#[derive(Debug, Clone, Default)]
struct FullInterception {
    invoke_method: Option<Implementation>,
    get_property: Option<Implementation>,
    set_property: Option<Implementation>,
}

/// Methods, properties, hooks and interception overrides of one type or fragment.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: IndexMap<Signature, MethodEntry>,
    properties: IndexMap<Arc<str>, PropertyAccessors>,
    hooks: Hooks,
    interception: FullInterception,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a dynamic method. Used to assemble fragments.
    pub fn with_method(mut self, name: &str, params: impl Into<Vec<TypeId>>, imp: Implementation) -> Self {
        self.insert_dynamic(Signature::new(name, params), imp);
        self
    }

    /// Builder: add a property getter.
    pub fn with_getter(mut self, name: &str, getter: Implementation) -> Self {
        self.property_mut(name).getter = Some(getter);
        self
    }

    /// Builder: add a property setter.
    pub fn with_setter(mut self, name: &str, setter: Implementation) -> Self {
        self.property_mut(name).setter = Some(setter);
        self
    }

    /// Builder: install a hook.
    pub fn with_hook(mut self, kind: HookKind, imp: Implementation) -> Self {
        self.set_hook(kind, imp);
        self
    }

    /// Number of method entries.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
            && self.properties.is_empty()
            && self.hooks.method_missing.is_none()
            && self.hooks.property_missing.is_none()
            && self.interception.invoke_method.is_none()
            && self.interception.get_property.is_none()
            && self.interception.set_property.is_none()
    }

    pub fn get(&self, signature: &Signature) -> Option<&MethodEntry> {
        self.methods.get(signature)
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &MethodEntry> {
        self.methods.values()
    }

    /// Entries sharing `name`, any arity.
    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodEntry> + 'a {
        self.methods
            .values()
            .filter(move |entry| &*entry.signature.name == name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods_named(name).next().is_some()
    }

    /// Insert a native entry. Fails with the existing signature when one is
    /// present and `allow_overwrite` is false.
    pub fn insert_native(
        &mut self,
        signature: Signature,
        imp: Implementation,
        allow_overwrite: bool,
    ) -> Result<(), Signature> {
        if !allow_overwrite && self.methods.contains_key(&signature) {
            return Err(signature);
        }
        let entry = MethodEntry::new(signature.clone(), imp, EntryOrigin::Native);
        self.methods.insert(signature, entry);
        Ok(())
    }

    /// Insert a dynamic entry; any existing entry is kept as its shadow.
    pub fn insert_dynamic(&mut self, signature: Signature, imp: Implementation) {
        let mut entry = MethodEntry::new(signature.clone(), imp, EntryOrigin::Dynamic);
        entry.shadowed = self.methods.get(&signature).cloned().map(Box::new);
        self.methods.insert(signature, entry);
    }

    /// Insert an entry as-is, returning the one it replaced.
    pub fn insert_entry(&mut self, entry: MethodEntry) -> Option<MethodEntry> {
        self.methods.insert(entry.signature.clone(), entry)
    }

    /// Remove a dynamic entry, restoring whatever it shadowed.
    ///
    /// Returns false when the signature is absent or not dynamic.
    pub fn remove_dynamic(&mut self, signature: &Signature) -> bool {
        let shadowed = match self.methods.get(signature) {
            Some(entry) if entry.origin == EntryOrigin::Dynamic => entry.shadowed.clone(),
            _ => return false,
        };
        match shadowed {
            Some(previous) => {
                self.methods.insert(signature.clone(), *previous);
            }
            None => {
                self.methods.shift_remove(signature);
            }
        }
        true
    }

    pub fn property(&self, name: &str) -> Option<&PropertyAccessors> {
        self.properties.get(name)
    }

    /// All properties in insertion order.
    pub fn properties(&self) -> impl Iterator<Item = (&Arc<str>, &PropertyAccessors)> {
        self.properties.iter()
    }

    /// Accessors for `name`, created empty if absent.
    pub fn property_mut(&mut self, name: &str) -> &mut PropertyAccessors {
        self.properties.entry(Arc::from(name)).or_default()
    }

    pub fn hook(&self, kind: HookKind) -> Option<&Implementation> {
        match kind {
            HookKind::MethodMissing => self.hooks.method_missing.as_ref(),
            HookKind::PropertyMissing => self.hooks.property_missing.as_ref(),
        }
    }

    /// Install a hook, returning the previous one.
    pub fn set_hook(&mut self, kind: HookKind, imp: Implementation) -> Option<Implementation> {
        let slot = match kind {
            HookKind::MethodMissing => &mut self.hooks.method_missing,
            HookKind::PropertyMissing => &mut self.hooks.property_missing,
        };
        slot.replace(imp)
    }

    pub fn interception(&self, kind: InterceptionKind) -> Option<&Implementation> {
        match kind {
            InterceptionKind::InvokeMethod => self.interception.invoke_method.as_ref(),
            InterceptionKind::GetProperty => self.interception.get_property.as_ref(),
            InterceptionKind::SetProperty => self.interception.set_property.as_ref(),
        }
    }

    pub fn set_interception(&mut self, kind: InterceptionKind, imp: Option<Implementation>) {
        let slot = match kind {
            InterceptionKind::InvokeMethod => &mut self.interception.invoke_method,
            InterceptionKind::GetProperty => &mut self.interception.get_property,
            InterceptionKind::SetProperty => &mut self.interception.set_property,
        };
        *slot = imp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(name: &str) -> Signature {
        Signature::new(name, vec![])
    }

    #[test]
    fn test_insert_native_conflict() {
        let mut table = MethodTable::new();
        table
            .insert_native(sig("speak"), Implementation::constant("..."), false)
            .unwrap();

        let err = table
            .insert_native(sig("speak"), Implementation::constant("!"), false)
            .unwrap_err();
        assert_eq!(err, sig("speak"));

        assert!(table
            .insert_native(sig("speak"), Implementation::constant("!"), true)
            .is_ok());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dynamic_shadow_restored_on_remove() {
        let mut table = MethodTable::new();
        table
            .insert_native(sig("speak"), Implementation::constant("..."), false)
            .unwrap();
        table.insert_dynamic(sig("speak"), Implementation::constant("Woof"));

        let entry = table.get(&sig("speak")).unwrap();
        assert_eq!(entry.origin, EntryOrigin::Dynamic);
        assert_eq!(entry.shadowed().map(|e| e.origin), Some(EntryOrigin::Native));

        assert!(table.remove_dynamic(&sig("speak")));
        assert_eq!(table.get(&sig("speak")).unwrap().origin, EntryOrigin::Native);

        // Native entries are not removable this way.
        assert!(!table.remove_dynamic(&sig("speak")));
    }

    #[test]
    fn test_methods_named_spans_arities() {
        let table = MethodTable::new()
            .with_method("sum", vec![TypeId::INT, TypeId::INT], Implementation::constant(1))
            .with_method("sum", vec![TypeId::INT], Implementation::constant(2))
            .with_method("other", vec![], Implementation::constant(3));

        assert_eq!(table.methods_named("sum").count(), 2);
        assert!(table.has_method("other"));
        assert!(!table.has_method("missing"));
    }

    #[test]
    fn test_empty_table_reports_empty() {
        assert!(MethodTable::new().is_empty());
        let table = MethodTable::new().with_hook(HookKind::MethodMissing, Implementation::constant(0));
        assert!(!table.is_empty());
        assert!(table.hook(HookKind::MethodMissing).is_some());
        assert!(table.hook(HookKind::PropertyMissing).is_none());
    }

    #[test]
    fn test_property_builders() {
        let table = MethodTable::new()
            .with_getter("name", Implementation::constant("Rex"))
            .with_setter("name", Implementation::constant(Value::Null));
        let accessors = table.property("name").unwrap();
        assert!(accessors.getter.is_some());
        assert!(accessors.setter.is_some());
    }
}
