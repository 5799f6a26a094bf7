//! Type registry: one method table per type, published as snapshots.
//!
//! Every type owns an `Arc<MethodTable>` behind a `parking_lot::RwLock`.
//! Readers clone the `Arc` under a shared lock and then work on an
//! immutable snapshot, so reads never block each other and an in-flight
//! dispatch never observes a half-applied write. Writers are serialized by
//! a per-type mutex, rebuild the table off to the side and swap it in.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{RegistrationConflictError, RegistryError};
use crate::table::{HookKind, Implementation, InterceptionKind, MethodTable, Signature};
use crate::value::TypeId;

/// Inheritance distance used for `Null` arguments: assignable everywhere,
/// exact nowhere.
pub const NULL_DISTANCE: u32 = u32::MAX;

struct TypeEntry {
    name: Arc<str>,
    supertypes: Vec<TypeId>,
    /// Linearized ancestors with their distance, most-derived first, `Object` last.
    lineage: Arc<[(TypeId, u32)]>,
    table: RwLock<Arc<MethodTable>>,
    writer: Mutex<()>,
}

impl TypeEntry {
    fn snapshot(&self) -> Arc<MethodTable> {
        self.table.read().clone()
    }
}

/// Process-independent registry of types and their method tables.
///
/// Constructed explicitly and passed by reference; tests build isolated
/// registries freely.
pub struct TypeRegistry {
    types: RwLock<Vec<Arc<TypeEntry>>>,
    by_name: RwLock<FxHashMap<Arc<str>, TypeId>>,
    empty: Arc<MethodTable>,
}

impl TypeRegistry {
    /// Create a registry holding only the built-in types.
    pub fn new() -> Self {
        let registry = Self {
            types: RwLock::new(Vec::new()),
            by_name: RwLock::new(FxHashMap::default()),
            empty: Arc::new(MethodTable::new()),
        };

        let builtins: [(&str, TypeId, &[TypeId]); 7] = [
            ("Object", TypeId::OBJECT, &[]),
            ("Null", TypeId::NULL, &[TypeId::OBJECT]),
            ("Boolean", TypeId::BOOLEAN, &[TypeId::OBJECT]),
            ("Number", TypeId::NUMBER, &[TypeId::OBJECT]),
            ("Int", TypeId::INT, &[TypeId::NUMBER]),
            ("Double", TypeId::DOUBLE, &[TypeId::NUMBER]),
            ("String", TypeId::STRING, &[TypeId::OBJECT]),
        ];
        for (name, expected, supers) in builtins {
            let id = registry.insert_type(name, supers.to_vec());
            debug_assert_eq!(id, expected);
        }
        registry
    }

    /// Declare a type with the given direct supertypes, in precedence order.
    ///
    /// Declaring an existing name with the same supertypes returns the
    /// existing id. An empty supertype list means `Object`.
    pub fn declare(&self, name: &str, supertypes: &[TypeId]) -> Result<TypeId, RegistryError> {
        let supertypes = if supertypes.is_empty() && name != "Object" {
            vec![TypeId::OBJECT]
        } else {
            supertypes.to_vec()
        };

        if let Some(existing) = self.lookup_name(name) {
            let same = self
                .entry(existing)
                .map(|entry| entry.supertypes == supertypes)
                .unwrap_or(false);
            return if same {
                Ok(existing)
            } else {
                Err(RegistryError::Redeclared {
                    name: name.to_string(),
                })
            };
        }

        for &sup in &supertypes {
            if self.entry(sup).is_none() {
                return Err(RegistryError::UnknownType(sup));
            }
        }

        Ok(self.insert_type(name, supertypes))
    }

    /// Id for `name`, declaring it as a direct `Object` subtype on first reference.
    pub fn type_named(&self, name: &str) -> TypeId {
        if let Some(id) = self.lookup_name(name) {
            return id;
        }
        self.insert_type(name, vec![TypeId::OBJECT])
    }

    /// Id for `name` if declared.
    pub fn lookup_name(&self, name: &str) -> Option<TypeId> {
        self.by_name.read().get(name).copied()
    }

    /// Display name of a type; unknown ids render as `<type#N>`.
    pub fn name_of(&self, id: TypeId) -> Arc<str> {
        match self.entry(id) {
            Some(entry) => entry.name.clone(),
            None => Arc::from(format!("<type#{}>", id.0)),
        }
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.entry(id).is_some()
    }

    /// Number of declared types, built-ins included.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct supertypes of a type.
    pub fn supertypes(&self, id: TypeId) -> Vec<TypeId> {
        self.entry(id)
            .map(|entry| entry.supertypes.clone())
            .unwrap_or_default()
    }

    /// Linearized ancestors with distances, most-derived first.
    ///
    /// Unknown ids linearize as themselves followed by `Object`.
    pub fn lineage(&self, id: TypeId) -> Arc<[(TypeId, u32)]> {
        match self.entry(id) {
            Some(entry) => entry.lineage.clone(),
            None => Arc::from(vec![(id, 0), (TypeId::OBJECT, 1)]),
        }
    }

    /// Whether a value of runtime type `from` can be passed where `to` is declared.
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        self.distance(from, to).is_some()
    }

    /// Inheritance distance from `from` up to `to` (0 for an exact match).
    pub fn distance(&self, from: TypeId, to: TypeId) -> Option<u32> {
        if from == to {
            return Some(0);
        }
        if from == TypeId::NULL {
            return Some(NULL_DISTANCE);
        }
        self.lineage(from)
            .iter()
            .find(|(ancestor, _)| *ancestor == to)
            .map(|(_, distance)| *distance)
    }

    /// Snapshot of a type's table. Unknown types yield an empty table.
    pub fn lookup(&self, id: TypeId) -> Arc<MethodTable> {
        match self.entry(id) {
            Some(entry) => entry.snapshot(),
            None => self.empty.clone(),
        }
    }

    /// Snapshots of every table along the lineage, most-derived first.
    pub fn chain_tables(&self, lineage: &[(TypeId, u32)]) -> Vec<(TypeId, Arc<MethodTable>)> {
        let types = self.types.read();
        lineage
            .iter()
            .filter_map(|(id, _)| types.get(id.index()).map(|entry| (*id, entry.snapshot())))
            .collect()
    }

    /// Apply `f` to a copy of the type's table and publish the result.
    ///
    /// Writers to the same type are serialized; readers keep whichever
    /// snapshot they already hold. If `f` fails nothing is published.
    pub fn update<R, E>(
        &self,
        id: TypeId,
        f: impl FnOnce(&mut MethodTable) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<RegistryError>,
    {
        let entry = self.entry(id).ok_or(RegistryError::UnknownType(id))?;
        let _writer = entry.writer.lock();
        let mut next = MethodTable::clone(&entry.snapshot());
        let result = f(&mut next)?;
        *entry.table.write() = Arc::new(next);
        Ok(result)
    }

    /// Register a method on a type.
    pub fn register(
        &self,
        id: TypeId,
        name: &str,
        params: &[TypeId],
        imp: Implementation,
        allow_overwrite: bool,
    ) -> Result<(), RegistryError> {
        let signature = Signature::new(name, params);
        self.update(id, |table| {
            table
                .insert_native(signature, imp, allow_overwrite)
                .map_err(|sig| {
                    RegistryError::Conflict(RegistrationConflictError {
                        type_name: self.name_of(id).to_string(),
                        signature: self.render_signature(&sig),
                    })
                })
        })?;
        debug!(type_name = %self.name_of(id), method = name, arity = params.len(), "registered method");
        Ok(())
    }

    /// Add a dynamic method, shadowing any existing entry with the same signature.
    pub fn add_dynamic(
        &self,
        id: TypeId,
        name: &str,
        params: &[TypeId],
        imp: Implementation,
    ) -> Result<(), RegistryError> {
        self.update(id, |table| {
            table.insert_dynamic(Signature::new(name, params), imp);
            Ok::<_, RegistryError>(())
        })?;
        debug!(type_name = %self.name_of(id), method = name, "added dynamic method");
        Ok(())
    }

    /// Remove a dynamic method, restoring what it shadowed.
    pub fn remove_dynamic(&self, id: TypeId, name: &str, params: &[TypeId]) -> Result<bool, RegistryError> {
        let signature = Signature::new(name, params);
        self.update(id, |table| Ok::<_, RegistryError>(table.remove_dynamic(&signature)))
    }

    /// Register property accessors. `None` leaves the existing accessor in place.
    pub fn register_property(
        &self,
        id: TypeId,
        name: &str,
        getter: Option<Implementation>,
        setter: Option<Implementation>,
    ) -> Result<(), RegistryError> {
        self.update(id, |table| {
            let accessors = table.property_mut(name);
            if getter.is_some() {
                accessors.getter = getter;
            }
            if setter.is_some() {
                accessors.setter = setter;
            }
            Ok::<_, RegistryError>(())
        })
    }

    pub fn set_hook(&self, id: TypeId, kind: HookKind, imp: Implementation) -> Result<(), RegistryError> {
        self.update(id, |table| {
            table.set_hook(kind, imp);
            Ok::<_, RegistryError>(())
        })
    }

    /// Opt a type into full interception; `None` opts it back out.
    pub fn set_full_interception(
        &self,
        id: TypeId,
        kind: InterceptionKind,
        imp: Option<Implementation>,
    ) -> Result<(), RegistryError> {
        self.update(id, |table| {
            table.set_interception(kind, imp);
            Ok::<_, RegistryError>(())
        })
    }

    /// `name(T1, T2)` rendering used in diagnostics.
    pub fn render_signature(&self, signature: &Signature) -> String {
        let params: Vec<_> = signature
            .params
            .iter()
            .map(|p| self.name_of(*p).to_string())
            .collect();
        format!("{}({})", signature.name, params.join(", "))
    }

    fn entry(&self, id: TypeId) -> Option<Arc<TypeEntry>> {
        self.types.read().get(id.index()).cloned()
    }

    fn insert_type(&self, name: &str, supertypes: Vec<TypeId>) -> TypeId {
        let mut by_name = self.by_name.write();
        if let Some(existing) = by_name.get(name) {
            return *existing;
        }
        let mut types = self.types.write();
        let id = TypeId(types.len() as u32);
        let lineage = linearize(id, &supertypes, &types);
        let name: Arc<str> = Arc::from(name);
        types.push(Arc::new(TypeEntry {
            name: name.clone(),
            supertypes,
            lineage,
            table: RwLock::new(self.empty.clone()),
            writer: Mutex::new(()),
        }));
        by_name.insert(name, id);
        id
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Breadth-first linearization: each ancestor once, at its shortest
/// distance, declaration order among equals, `Object` always last.
fn linearize(id: TypeId, supertypes: &[TypeId], types: &[Arc<TypeEntry>]) -> Arc<[(TypeId, u32)]> {
    let mut order = vec![(id, 0)];
    let mut seen = FxHashSet::default();
    seen.insert(id);
    let mut object_distance = None;

    let mut queue: VecDeque<(TypeId, u32)> = supertypes.iter().map(|s| (*s, 1)).collect();
    while let Some((ty, distance)) = queue.pop_front() {
        if !seen.insert(ty) {
            continue;
        }
        if ty == TypeId::OBJECT {
            object_distance = Some(distance);
            continue;
        }
        order.push((ty, distance));
        if let Some(entry) = types.get(ty.index()) {
            queue.extend(entry.supertypes.iter().map(|s| (*s, distance + 1)));
        }
    }

    if id != TypeId::OBJECT {
        order.push((TypeId::OBJECT, object_distance.unwrap_or(1)));
    }
    Arc::from(order)
}
