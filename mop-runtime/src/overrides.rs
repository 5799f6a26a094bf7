//! Per-object method table fragments.
//!
//! Entries are keyed by [`ObjectId`] and hold only a weak handle to the
//! object, so an override never extends the object's lifetime. Object ids
//! are never reused, which makes an entry whose object died unreachable;
//! such entries are dropped by [`InstanceOverrideStore::purge`]. Writes
//! never sweep, so they only lock the shard of the object being written.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::table::MethodTable;
use crate::value::{ObjectId, ObjectRef, WeakObject};

struct OverrideSlot {
    owner: WeakObject,
    fragment: Arc<MethodTable>,
}

/// Concurrent weak map from object identity to a table fragment.
///
/// Backed by a sharded map: operations on different objects do not
/// contend, operations on the same object are serialized by its shard.
#[derive(Default)]
pub struct InstanceOverrideStore {
    slots: DashMap<ObjectId, OverrideSlot>,
}

impl InstanceOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the object's fragment.
    pub fn set_override(&self, object: &ObjectRef, fragment: MethodTable) {
        self.slots.insert(
            object.id(),
            OverrideSlot {
                owner: object.downgrade(),
                fragment: Arc::new(fragment),
            },
        );
    }

    /// Edit the object's fragment in place, creating it on first use.
    pub fn update<R>(&self, object: &ObjectRef, f: impl FnOnce(&mut MethodTable) -> R) -> R {
        let mut slot = self.slots.entry(object.id()).or_insert_with(|| OverrideSlot {
            owner: object.downgrade(),
            fragment: Arc::new(MethodTable::new()),
        });
        let mut next = MethodTable::clone(&slot.fragment);
        let result = f(&mut next);
        slot.fragment = Arc::new(next);
        result
    }

    /// Fragment for a live object, if any.
    pub fn get_override(&self, id: ObjectId) -> Option<Arc<MethodTable>> {
        let slot = self.slots.get(&id)?;
        if slot.owner.is_alive() {
            Some(slot.fragment.clone())
        } else {
            None
        }
    }

    /// Drop the object's fragment, returning it.
    pub fn remove(&self, id: ObjectId) -> Option<Arc<MethodTable>> {
        self.slots.remove(&id).map(|(_, slot)| slot.fragment)
    }

    /// Drop the object's fragment if nothing is left in it. Returns whether
    /// the slot was removed.
    pub fn remove_if_empty(&self, id: ObjectId) -> bool {
        self.slots
            .remove_if(&id, |_, slot| slot.fragment.is_empty())
            .is_some()
    }

    /// Remove entries whose object has been dropped. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.owner.is_alive());
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            trace!(removed, "purged dead instance overrides");
        }
        removed
    }

    /// Number of stored entries, dead ones not yet purged included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Implementation;
    use crate::value::TypeId;

    fn fragment() -> MethodTable {
        MethodTable::new().with_method("speak", vec![], Implementation::constant("mine"))
    }

    #[test]
    fn test_set_and_get() {
        let store = InstanceOverrideStore::new();
        let obj = ObjectRef::new(TypeId::OBJECT);
        let other = ObjectRef::new(TypeId::OBJECT);

        store.set_override(&obj, fragment());

        assert!(store.get_override(obj.id()).unwrap().has_method("speak"));
        assert!(store.get_override(other.id()).is_none());
    }

    #[test]
    fn test_override_dies_with_object() {
        let store = InstanceOverrideStore::new();
        let obj = ObjectRef::new(TypeId::OBJECT);
        let id = obj.id();
        store.set_override(&obj, fragment());

        drop(obj);

        assert!(store.get_override(id).is_none());
        assert_eq!(store.purge(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_creates_then_extends() {
        let store = InstanceOverrideStore::new();
        let obj = ObjectRef::new(TypeId::OBJECT);

        store.update(&obj, |t| {
            t.insert_dynamic(crate::table::Signature::new("a", vec![]), Implementation::constant(1))
        });
        store.update(&obj, |t| {
            t.insert_dynamic(crate::table::Signature::new("b", vec![]), Implementation::constant(2))
        });

        let table = store.get_override(obj.id()).unwrap();
        assert!(table.has_method("a"));
        assert!(table.has_method("b"));
    }

    #[test]
    fn test_snapshot_survives_update() {
        let store = InstanceOverrideStore::new();
        let obj = ObjectRef::new(TypeId::OBJECT);
        store.set_override(&obj, fragment());

        let held = store.get_override(obj.id()).unwrap();
        store.update(&obj, |t| {
            t.insert_dynamic(crate::table::Signature::new("extra", vec![]), Implementation::constant(0))
        });

        assert!(!held.has_method("extra"));
        assert!(store.get_override(obj.id()).unwrap().has_method("extra"));
    }

    #[test]
    fn test_inserts_leave_dead_entries_for_purge() {
        let store = InstanceOverrideStore::new();
        for _ in 0..128 {
            let temp = ObjectRef::new(TypeId::OBJECT);
            store.set_override(&temp, fragment());
        }
        assert_eq!(store.len(), 128);
        assert_eq!(store.purge(), 128);
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_if_empty() {
        let store = InstanceOverrideStore::new();
        let obj = ObjectRef::new(TypeId::OBJECT);

        store.set_override(&obj, fragment());
        assert!(!store.remove_if_empty(obj.id()));

        store.update(&obj, |table| *table = MethodTable::new());
        assert!(store.remove_if_empty(obj.id()));
        assert!(store.get_override(obj.id()).is_none());
        assert!(!store.remove_if_empty(obj.id()));
    }
}
