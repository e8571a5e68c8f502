//! Reactive query indices.
//!
//! A [`QueryIndex`] keeps the list of live entities whose component set
//! contains every required type and none of the excluded ones. The
//! [`World`](crate::world::World) updates it synchronously on every
//! structural change, so reading the list never rescans storage.
//!
//! Predicates are described with a [`QueryDesc`] and interned by the world:
//! asking twice for the same required/excluded sets yields the same
//! [`QueryId`] and shares one index.

use std::fmt;
use std::ops::Deref;

use crate::component::{Component, ComponentTypeId, ComponentVtable};
use crate::entity::EntityId;
use crate::storage::ABSENT;

// ---------------------------------------------------------------------------
// QueryDesc
// ---------------------------------------------------------------------------

/// Builder for a type predicate: `with` types required, `without` types excluded.
///
/// ```
/// use kestrel_ecs::prelude::*;
///
/// struct Position;
/// struct Speed;
/// struct Frozen;
///
/// let desc = QueryDesc::new().with::<Position>().with::<Speed>().without::<Frozen>();
/// assert_eq!(desc.required_len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryDesc {
    pub(crate) required: Vec<ComponentVtable>,
    pub(crate) excluded: Vec<ComponentVtable>,
}

impl QueryDesc {
    /// An empty predicate: matches every live entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require component `T`.
    pub fn with<T: Component>(mut self) -> Self {
        self.required.push(ComponentVtable::of::<T>());
        self
    }

    /// Exclude entities carrying component `T`.
    pub fn without<T: Component>(mut self) -> Self {
        self.excluded.push(ComponentVtable::of::<T>());
        self
    }

    /// Number of `with` clauses (duplicates included).
    pub fn required_len(&self) -> usize {
        self.required.len()
    }

    /// Number of `without` clauses (duplicates included).
    pub fn excluded_len(&self) -> usize {
        self.excluded.len()
    }
}

/// Handle to an interned query index owned by a world.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub(crate) u32);

impl fmt::Debug for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityView
// ---------------------------------------------------------------------------

/// Read-only, contiguous view of a query's matched entities.
///
/// Every entity in a view is live and appears exactly once. Parallel writers
/// rely on that uniqueness, which is why a view can only be produced by a
/// query index. Order is unspecified but stable until the next structural
/// change.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EntityView<'a> {
    entities: &'a [EntityId],
}

impl<'a> EntityView<'a> {
    pub(crate) fn new(entities: &'a [EntityId]) -> Self {
        Self { entities }
    }

    /// The matched entities.
    pub fn as_slice(&self) -> &'a [EntityId] {
        self.entities
    }
}

impl Deref for EntityView<'_> {
    type Target = [EntityId];

    fn deref(&self) -> &[EntityId] {
        self.entities
    }
}

impl fmt::Debug for EntityView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entities.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// QueryIndex
// ---------------------------------------------------------------------------

/// Incrementally maintained set of entities matching one predicate.
///
/// `matched` holds the entities; `positions` maps a slot index to the entity's
/// position in `matched` (or `ABSENT`) for O(1) membership and swap-removal.
#[derive(Debug)]
pub struct QueryIndex {
    required: Vec<ComponentTypeId>,
    excluded: Vec<ComponentTypeId>,
    matched: Vec<EntityId>,
    positions: Vec<u32>,
}

impl QueryIndex {
    /// `required` and `excluded` must already be sorted and deduplicated.
    pub(crate) fn new(required: Vec<ComponentTypeId>, excluded: Vec<ComponentTypeId>) -> Self {
        Self {
            required,
            excluded,
            matched: Vec::new(),
            positions: Vec::new(),
        }
    }

    /// Required component types, sorted.
    pub fn required(&self) -> &[ComponentTypeId] {
        &self.required
    }

    /// Excluded component types, sorted.
    pub fn excluded(&self) -> &[ComponentTypeId] {
        &self.excluded
    }

    /// Whether this predicate mentions `id` at all.
    pub(crate) fn tracks(&self, id: ComponentTypeId) -> bool {
        self.required.binary_search(&id).is_ok() || self.excluded.binary_search(&id).is_ok()
    }

    /// The matched entities as a read-only view.
    pub fn view(&self) -> EntityView<'_> {
        EntityView::new(&self.matched)
    }

    /// Number of matched entities.
    pub fn len(&self) -> usize {
        self.matched.len()
    }

    /// Whether nothing matches.
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    /// Whether `entity` is currently matched.
    pub fn contains(&self, entity: EntityId) -> bool {
        match self.positions.get(entity.slot()) {
            Some(&pos) if pos != ABSENT => self.matched[pos as usize] == entity,
            _ => false,
        }
    }

    /// Bring membership of `entity` in line with `matches`.
    pub(crate) fn refresh(&mut self, entity: EntityId, matches: bool) {
        let present = self.contains(entity);
        if matches && !present {
            self.insert(entity);
        } else if !matches && present {
            self.remove_slot(entity.slot());
        }
    }

    fn insert(&mut self, entity: EntityId) {
        let slot = entity.slot();
        if slot >= self.positions.len() {
            self.positions.resize(slot + 1, ABSENT);
        }
        self.positions[slot] = self.matched.len() as u32;
        self.matched.push(entity);
    }

    /// Swap-remove whatever entity occupies `slot`. Returns whether one did.
    pub(crate) fn remove_slot(&mut self, slot: usize) -> bool {
        let pos = match self.positions.get(slot) {
            Some(&pos) if pos != ABSENT => pos as usize,
            _ => return false,
        };
        self.positions[slot] = ABSENT;
        self.matched.swap_remove(pos);
        if let Some(moved) = self.matched.get(pos) {
            self.positions[moved.slot()] = pos as u32;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
