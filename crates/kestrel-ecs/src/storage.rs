//! Per-type component storage.
//!
//! A [`ComponentStore<T>`] is a sparse set: values live in a dense `Vec<T>`
//! with a parallel vector of owning handles, and a sparse table maps each slot
//! index to its dense position. Removal swaps the last dense element into the
//! hole, so the dense array never has gaps and its order is unspecified.
//!
//! Insertion and removal are crate-private: every structural change must go
//! through the [`World`](crate::world::World) so query indices see it. Callers
//! holding a store may only read values or overwrite them in place.

use std::any::Any;

use crate::entity::EntityId;

pub(crate) const ABSENT: u32 = u32::MAX;

/// Resolve `entity` to its dense position given a store's lookup tables.
#[inline]
pub(crate) fn dense_lookup(sparse: &[u32], owners: &[EntityId], entity: EntityId) -> Option<usize> {
    let dense = *sparse.get(entity.slot())?;
    if dense == ABSENT {
        return None;
    }
    let dense = dense as usize;
    (owners[dense] == entity).then_some(dense)
}

/// Dense storage for all components of type `T`.
#[derive(Debug)]
pub struct ComponentStore<T> {
    values: Vec<T>,
    owners: Vec<EntityId>,
    sparse: Vec<u32>,
}

impl<T> ComponentStore<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            owners: Vec::new(),
            sparse: Vec::new(),
        }
    }

    /// Number of stored components.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no components.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Dense position of `entity`'s component, if this exact handle owns one.
    #[inline]
    pub(crate) fn dense_index(&self, entity: EntityId) -> Option<usize> {
        dense_lookup(&self.sparse, &self.owners, entity)
    }

    /// Whether `entity` has a component in this store.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.dense_index(entity).is_some()
    }

    /// Borrow `entity`'s component.
    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.dense_index(entity).map(|d| &self.values[d])
    }

    /// Mutably borrow `entity`'s component for an in-place update.
    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        self.dense_index(entity).map(|d| &mut self.values[d])
    }

    /// Iterate `(owner, value)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.owners.iter().copied().zip(self.values.iter())
    }

    /// Iterate `(owner, value)` pairs mutably in dense order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.owners.iter().copied().zip(self.values.iter_mut())
    }

    /// The dense value array.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// The owners of the dense values, position for position.
    pub fn owners(&self) -> &[EntityId] {
        &self.owners
    }

    /// Insert or overwrite. Returns the previous value on overwrite, `None`
    /// on first insertion.
    pub(crate) fn insert(&mut self, entity: EntityId, value: T) -> Option<T> {
        let slot = entity.slot();
        if slot >= self.sparse.len() {
            self.sparse.resize(slot + 1, ABSENT);
        }
        let dense = self.sparse[slot];
        if dense != ABSENT {
            let dense = dense as usize;
            // A stale owner here means the slot was recycled without the old
            // component being cleared; the world never lets that happen.
            debug_assert_eq!(self.owners[dense], entity);
            self.owners[dense] = entity;
            return Some(std::mem::replace(&mut self.values[dense], value));
        }
        self.sparse[slot] = self.values.len() as u32;
        self.values.push(value);
        self.owners.push(entity);
        None
    }

    /// Remove whatever component occupies `slot`, regardless of generation.
    pub(crate) fn remove_slot(&mut self, slot: usize) -> Option<T> {
        let dense = *self.sparse.get(slot)?;
        if dense == ABSENT {
            return None;
        }
        let dense = dense as usize;
        self.sparse[slot] = ABSENT;
        let value = self.values.swap_remove(dense);
        self.owners.swap_remove(dense);
        if let Some(moved) = self.owners.get(dense) {
            self.sparse[moved.slot()] = dense as u32;
        }
        Some(value)
    }

    /// Split into the mutable value array and the read-only lookup tables.
    pub(crate) fn split_columns(&mut self) -> (&mut [T], &[u32], &[EntityId]) {
        (&mut self.values, &self.sparse, &self.owners)
    }
}

impl<T> Default for ComponentStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ErasedStore
// ---------------------------------------------------------------------------

/// Object-safe view of a `ComponentStore<T>` for the world's store table.
pub(crate) trait ErasedStore: Send + Sync {
    fn remove_slot_erased(&mut self, slot: usize) -> bool;
    fn contains_slot(&self, slot: usize) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Send + Sync + 'static> ErasedStore for ComponentStore<T> {
    fn remove_slot_erased(&mut self, slot: usize) -> bool {
        self.remove_slot(slot).is_some()
    }

    fn contains_slot(&self, slot: usize) -> bool {
        matches!(self.sparse.get(slot), Some(&d) if d != ABSENT)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    /// Dense positions referenced by the sparse table are exactly `[0, len)`.
    fn assert_permutation<T>(store: &ComponentStore<T>) {
        let mut seen: Vec<u32> = store.sparse.iter().copied().filter(|&d| d != ABSENT).collect();
        seen.sort();
        let expected: Vec<u32> = (0..store.len() as u32).collect();
        assert_eq!(seen, expected);
        for (dense, owner) in store.owners.iter().enumerate() {
            assert_eq!(store.sparse[owner.slot()], dense as u32);
        }
    }

    #[test]
    fn insert_get_overwrite() {
        let mut store = ComponentStore::new();
        assert_eq!(store.insert(e(3), 10), None);
        assert_eq!(store.insert(e(3), 11), Some(10));
        assert_eq!(store.get(e(3)), Some(&11));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_then_get_is_absent() {
        let mut store = ComponentStore::new();
        store.insert(e(0), "a");
        store.insert(e(1), "b");
        assert_eq!(store.remove_slot(0), Some("a"));
        assert_eq!(store.get(e(0)), None);
        assert_eq!(store.remove_slot(0), None, "second removal is a no-op");
        assert_eq!(store.get(e(1)), Some(&"b"));
    }

    #[test]
    fn swap_remove_keeps_mapping_consistent() {
        let mut store = ComponentStore::new();
        for i in 0..6 {
            store.insert(e(i), i * 100);
        }
        store.remove_slot(1);
        store.remove_slot(5);
        store.remove_slot(0);
        assert_permutation(&store);
        assert_eq!(store.get(e(2)), Some(&200));
        assert_eq!(store.get(e(3)), Some(&300));
        assert_eq!(store.get(e(4)), Some(&400));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn stale_handle_does_not_resolve() {
        let mut store = ComponentStore::new();
        store.insert(EntityId::new(2, 1), 5u8);
        assert!(store.get(EntityId::new(2, 0)).is_none());
        assert!(store.contains(EntityId::new(2, 1)));
        assert!(ErasedStore::contains_slot(&store, 2));
    }

    #[test]
    fn remove_out_of_range_slot_is_noop() {
        let mut store: ComponentStore<u8> = ComponentStore::new();
        assert_eq!(store.remove_slot(99), None);
        assert!(store.is_empty());
    }

    #[test]
    fn iter_mut_updates_in_place() {
        let mut store = ComponentStore::new();
        store.insert(e(0), 1);
        store.insert(e(4), 2);
        for (_, v) in store.iter_mut() {
            *v *= 10;
        }
        let mut values: Vec<_> = store.iter().map(|(owner, v)| (owner.index(), *v)).collect();
        values.sort();
        assert_eq!(values, vec![(0, 10), (4, 20)]);
    }
}
