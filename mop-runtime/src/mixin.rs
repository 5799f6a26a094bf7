//! Permanent merging of one type's table into another's.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{ConflictKind, MixinConflictWarning, RegistryError};
use crate::registry::TypeRegistry;
use crate::table::{EntryOrigin, HookKind, MethodEntry};
use crate::value::TypeId;

/// Applies mixins and keeps the per-target record of what was merged.
///
/// There is no unmerge: once applied, a mixin's entries stay for the life
/// of the registry (they can still be replaced by later registrations).
#[derive(Debug, Default)]
pub struct MixinMerger {
    records: RwLock<FxHashMap<TypeId, Vec<TypeId>>>,
}

impl MixinMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every method, property and hook of `source`'s own table into
    /// `target`'s. The new table is published in one swap, so concurrent
    /// readers see either none or all of the mixin.
    ///
    /// Collisions are resolved in favor of the mixin and reported.
    pub fn install(
        &self,
        registry: &TypeRegistry,
        target: TypeId,
        source: TypeId,
        log_conflicts: bool,
    ) -> Result<Vec<MixinConflictWarning>, RegistryError> {
        if target == source {
            return Err(RegistryError::SelfMixin {
                name: registry.name_of(target).to_string(),
            });
        }
        if !registry.contains(source) {
            return Err(RegistryError::UnknownType(source));
        }

        let source_table = registry.lookup(source);
        let conflicts = registry.update(target, |table| {
            let mut conflicts = Vec::new();
            let mut conflict = |kind, member: &std::sync::Arc<str>, params: &[TypeId], replaced| {
                conflicts.push(MixinConflictWarning {
                    target,
                    source,
                    kind,
                    member: member.clone(),
                    params: params.to_vec(),
                    replaced,
                });
            };

            for entry in source_table.entries() {
                let merged = MethodEntry::new(
                    entry.signature.clone(),
                    entry.implementation.clone(),
                    EntryOrigin::Mixin(source),
                );
                if let Some(previous) = table.insert_entry(merged) {
                    conflict(
                        ConflictKind::Method,
                        &entry.signature.name,
                        &entry.signature.params,
                        Some(previous.origin),
                    );
                }
            }

            for (name, accessors) in source_table.properties() {
                let existing = table.property_mut(name);
                let collides = (accessors.getter.is_some() && existing.getter.is_some())
                    || (accessors.setter.is_some() && existing.setter.is_some());
                if accessors.getter.is_some() {
                    existing.getter = accessors.getter.clone();
                }
                if accessors.setter.is_some() {
                    existing.setter = accessors.setter.clone();
                }
                if collides {
                    conflict(ConflictKind::Property, name, &[], None);
                }
            }

            for (kind, label) in [
                (HookKind::MethodMissing, "methodMissing"),
                (HookKind::PropertyMissing, "propertyMissing"),
            ] {
                if let Some(hook) = source_table.hook(kind) {
                    if table.set_hook(kind, hook.clone()).is_some() {
                        conflict(ConflictKind::Hook, &std::sync::Arc::from(label), &[], None);
                    }
                }
            }

            self.records.write().entry(target).or_default().push(source);
            Ok::<_, RegistryError>(conflicts)
        })?;

        debug!(
            target_type = %registry.name_of(target),
            source_type = %registry.name_of(source),
            conflicts = conflicts.len(),
            "installed mixin"
        );
        if log_conflicts {
            for warning in &conflicts {
                warn!(
                    target_type = %registry.name_of(warning.target),
                    source_type = %registry.name_of(warning.source),
                    member = %warning.member,
                    kind = ?warning.kind,
                    "mixin replaces existing member"
                );
            }
        }
        Ok(conflicts)
    }

    /// Sources mixed into `target`, in application order.
    pub fn mixins_of(&self, target: TypeId) -> Vec<TypeId> {
        self.records.read().get(&target).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Implementation, Signature};
    use pretty_assertions::assert_eq;

    fn setup() -> (TypeRegistry, TypeId, TypeId, TypeId) {
        let registry = TypeRegistry::new();
        let target = registry.declare("Duck", &[]).unwrap();
        let swim = registry.declare("Swimmer", &[]).unwrap();
        let fly = registry.declare("Flyer", &[]).unwrap();
        registry
            .register(swim, "move", &[], Implementation::constant("swim"), false)
            .unwrap();
        registry
            .register(swim, "paddle", &[], Implementation::constant("paddle"), false)
            .unwrap();
        registry
            .register(fly, "move", &[], Implementation::constant("fly"), false)
            .unwrap();
        (registry, target, swim, fly)
    }

    #[test]
    fn test_install_copies_entries() {
        let (registry, duck, swim, _) = setup();
        let merger = MixinMerger::new();

        let conflicts = merger.install(&registry, duck, swim, false).unwrap();
        assert!(conflicts.is_empty());

        let table = registry.lookup(duck);
        let entry = table.get(&Signature::new("paddle", vec![])).unwrap();
        assert_eq!(entry.origin, EntryOrigin::Mixin(swim));
        assert_eq!(merger.mixins_of(duck), vec![swim]);
    }

    #[test]
    fn test_last_applied_wins_with_warning() {
        let (registry, duck, swim, fly) = setup();
        let merger = MixinMerger::new();

        merger.install(&registry, duck, swim, false).unwrap();
        let conflicts = merger.install(&registry, duck, fly, false).unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(&*conflicts[0].member, "move");
        assert_eq!(conflicts[0].kind, ConflictKind::Method);
        assert_eq!(conflicts[0].replaced, Some(EntryOrigin::Mixin(swim)));

        let table = registry.lookup(duck);
        let entry = table.get(&Signature::new("move", vec![])).unwrap();
        assert_eq!(entry.origin, EntryOrigin::Mixin(fly));
        assert_eq!(merger.mixins_of(duck), vec![swim, fly]);
    }

    #[test]
    fn test_self_mixin_rejected() {
        let (registry, duck, _, _) = setup();
        let err = MixinMerger::new().install(&registry, duck, duck, false).unwrap_err();
        assert!(matches!(err, RegistryError::SelfMixin { .. }));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let (registry, duck, _, _) = setup();
        let err = MixinMerger::new()
            .install(&registry, duck, TypeId(9999), false)
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownType(TypeId(9999)));
    }

    #[test]
    fn test_hooks_and_properties_merge() {
        let (registry, duck, swim, _) = setup();
        registry
            .set_hook(swim, HookKind::MethodMissing, Implementation::constant("missing"))
            .unwrap();
        registry
            .register_property(swim, "depth", Some(Implementation::constant(3)), None)
            .unwrap();
        registry
            .set_hook(duck, HookKind::MethodMissing, Implementation::constant("duck"))
            .unwrap();

        let conflicts = MixinMerger::new().install(&registry, duck, swim, false).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Hook);

        let table = registry.lookup(duck);
        assert!(table.property("depth").unwrap().getter.is_some());
        assert!(table.hook(HookKind::MethodMissing).is_some());
    }
}
