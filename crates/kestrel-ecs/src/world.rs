//! The [`World`] is the top-level container. It owns the slot table, one
//! [`ComponentStore`] per component type, and every interned [`QueryIndex`].
//!
//! Every structural change (entity created or destroyed, component added or
//! removed) is routed synchronously to the query indices that track the
//! affected type before the mutating call returns. Code running between two
//! world calls therefore never observes a stale index.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::component::{Component, ComponentRegistry, ComponentTypeId, ComponentVtable};
use crate::entity::{EntityAllocator, EntityId};
use crate::query::{EntityView, QueryDesc, QueryId, QueryIndex};
use crate::storage::{ComponentStore, ErasedStore};
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Sizing and limits for a [`World`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Slots reserved up front in the slot table.
    pub initial_capacity: usize,
    /// Upper bound on slots. `None` means the addressable maximum (`u32::MAX`).
    pub max_entities: Option<u32>,
}

// ---------------------------------------------------------------------------
// StructuralEvent
// ---------------------------------------------------------------------------

/// A structural change routed to query indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StructuralEvent {
    Created(EntityId),
    Destroyed(EntityId),
    ComponentAdded(EntityId, ComponentTypeId),
    ComponentRemoved(EntityId, ComponentTypeId),
}

type StoreTable = Vec<Box<dyn ErasedStore>>;

fn satisfies(
    stores: &[Box<dyn ErasedStore>],
    index: &QueryIndex,
    slot: usize,
) -> bool {
    index
        .required()
        .iter()
        .all(|t| stores[t.slot()].contains_slot(slot))
        && !index
            .excluded()
            .iter()
            .any(|t| stores[t.slot()].contains_slot(slot))
}

fn downcast<T: Component>(store: &dyn ErasedStore) -> Result<&ComponentStore<T>, EcsError> {
    store
        .as_any()
        .downcast_ref::<ComponentStore<T>>()
        .ok_or_else(|| EcsError::UnregisteredComponent {
            name: std::any::type_name::<T>().to_owned(),
        })
}

fn downcast_mut<T: Component>(
    store: &mut dyn ErasedStore,
) -> Result<&mut ComponentStore<T>, EcsError> {
    store
        .as_any_mut()
        .downcast_mut::<ComponentStore<T>>()
        .ok_or_else(|| EcsError::UnregisteredComponent {
            name: std::any::type_name::<T>().to_owned(),
        })
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level ECS container.
///
/// Structural mutators take `&mut self`; everything that reads (views, stores,
/// component access) takes `&self`. While a view or store borrow is alive the
/// borrow checker therefore rejects structural mutation: changes discovered
/// during iteration go through a [`CommandLog`](crate::command::CommandLog).
pub struct World {
    allocator: EntityAllocator,
    registry: ComponentRegistry,
    /// Indexed by `ComponentTypeId`.
    stores: StoreTable,
    queries: Vec<QueryIndex>,
    query_cache: HashMap<(Vec<ComponentTypeId>, Vec<ComponentTypeId>), QueryId>,
    /// Per component type: the queries whose predicate mentions it.
    subscribers: Vec<Vec<QueryId>>,
    /// Queries with no required type; a fresh entity may match them.
    catch_all: Vec<QueryId>,
    config: WorldConfig,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.allocator.alive_count())
            .field("component_types", &self.registry.len())
            .field("query_count", &self.queries.len())
            .finish()
    }
}

impl World {
    /// Create an empty, unbounded world.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// Create an empty world with explicit sizing and limits.
    pub fn with_config(config: WorldConfig) -> Self {
        let max_slots = config.max_entities.unwrap_or(u32::MAX);
        Self {
            allocator: EntityAllocator::with_limits(config.initial_capacity, max_slots),
            registry: ComponentRegistry::new(),
            stores: Vec::new(),
            queries: Vec::new(),
            query_cache: HashMap::new(),
            subscribers: Vec::new(),
            catch_all: Vec::new(),
            config,
        }
    }

    /// The configuration this world was built with.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    // -- registration -------------------------------------------------------

    /// Register a component type under `name`.
    ///
    /// Components recorded into a command log for this type are stored as
    /// boxed objects. Registering an already-known type returns its id; a type
    /// first used without a name takes `name` now. Fails with
    /// [`EcsError::DuplicateComponentName`] if `name` belongs to another type
    /// or the type was already registered under a different name.
    pub fn register_component<T: Component>(&mut self, name: &str) -> Result<ComponentTypeId, EcsError> {
        self.ensure_registered(Some(name), ComponentVtable::of::<T>())
    }

    /// Register a plain-old-data component type under `name`.
    ///
    /// Its values can be recorded inline as raw bytes in command logs.
    pub fn register_pod_component<T>(&mut self, name: &str) -> Result<ComponentTypeId, EcsError>
    where
        T: Component + bytemuck::Pod,
    {
        self.ensure_registered(Some(name), ComponentVtable::of_pod::<T>())
    }

    fn ensure_registered(
        &mut self,
        name: Option<&str>,
        vtable: ComponentVtable,
    ) -> Result<ComponentTypeId, EcsError> {
        let (id, fresh) = self.registry.register(name, vtable)?;
        if fresh {
            self.stores.push((vtable.new_store)());
            self.subscribers.push(Vec::new());
            debug!(
                component = %self.registry.name_of(id),
                id = id.index(),
                "component type registered"
            );
        }
        Ok(id)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create an entity with no components.
    ///
    /// Recycles the most recently freed slot if one exists. Fails with
    /// [`EcsError::CapacityExhausted`] when the slot table is full.
    pub fn create_entity(&mut self) -> Result<EntityId, EcsError> {
        let entity = self.allocator.allocate()?;
        self.dispatch_event(StructuralEvent::Created(entity));
        Ok(entity)
    }

    /// Destroy an entity and drop all of its components.
    ///
    /// Fails with [`EcsError::StaleHandle`] if the handle is not valid.
    pub fn destroy_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        let slot = entity.slot();
        for store in &mut self.stores {
            store.remove_slot_erased(slot);
        }
        self.allocator.deallocate(entity);
        self.dispatch_event(StructuralEvent::Destroyed(entity));
        Ok(())
    }

    /// Returns `true` if `entity` is a valid handle.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.allocator.alive_count()
    }

    fn ensure_alive(&self, entity: EntityId) -> Result<(), EcsError> {
        if self.allocator.is_alive(entity) {
            Ok(())
        } else {
            Err(EcsError::StaleHandle { entity })
        }
    }

    // -- components ---------------------------------------------------------

    /// Insert or overwrite `entity`'s component of type `T`.
    ///
    /// Unregistered types are registered on first use under their Rust type
    /// name. Only the first insertion is a structural change; overwriting an
    /// existing value does not touch any query index.
    pub fn set_component<T: Component>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        let id = self.ensure_registered(None, ComponentVtable::of::<T>())?;
        let previous = downcast_mut::<T>(self.stores[id.slot()].as_mut())?.insert(entity, value);
        if previous.is_none() {
            self.dispatch_event(StructuralEvent::ComponentAdded(entity, id));
        }
        Ok(())
    }

    /// Remove `entity`'s component of type `T`.
    ///
    /// Returns `Ok(false)` without firing any event when the component is absent.
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> Result<bool, EcsError> {
        self.ensure_alive(entity)?;
        match self.registry.lookup::<T>() {
            Some(id) => self.remove_component_by_id(entity, id),
            None => Ok(false),
        }
    }

    /// Type-erased removal, used by command replay.
    pub(crate) fn remove_component_by_id(
        &mut self,
        entity: EntityId,
        id: ComponentTypeId,
    ) -> Result<bool, EcsError> {
        self.ensure_alive(entity)?;
        let store = self
            .stores
            .get_mut(id.slot())
            .ok_or(EcsError::UnknownComponentIndex { index: id.index() })?;
        let removed = store.remove_slot_erased(entity.slot());
        if removed {
            self.dispatch_event(StructuralEvent::ComponentRemoved(entity, id));
        }
        Ok(removed)
    }

    /// Borrow `entity`'s component of type `T`.
    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<&T, EcsError> {
        self.reader().get_component(entity)
    }

    /// Mutably borrow `entity`'s component of type `T` for an in-place update.
    pub fn get_component_mut<T: Component>(&mut self, entity: EntityId) -> Result<&mut T, EcsError> {
        self.ensure_alive(entity)?;
        let missing = || EcsError::MissingComponent {
            entity,
            component: std::any::type_name::<T>().to_owned(),
        };
        let id = self.registry.lookup::<T>().ok_or_else(missing)?;
        downcast_mut::<T>(self.stores[id.slot()].as_mut())?
            .get_mut(entity)
            .ok_or_else(missing)
    }

    /// Whether `entity` is alive and carries a `T`.
    pub fn has_component<T: Component>(&self, entity: EntityId) -> bool {
        self.get_component::<T>(entity).is_ok()
    }

    /// Borrow the whole store for `T`.
    pub fn store<T: Component>(&self) -> Result<&ComponentStore<T>, EcsError> {
        self.reader().store::<T>()
    }

    /// Mutably borrow the whole store for `T` (values only; no structural change).
    pub fn store_mut<T: Component>(&mut self) -> Result<&mut ComponentStore<T>, EcsError> {
        let id = self.registry.id_of::<T>()?;
        downcast_mut::<T>(self.stores[id.slot()].as_mut())
    }

    /// Read-only access to everything in the world.
    pub fn reader(&self) -> WorldReader<'_> {
        WorldReader {
            allocator: &self.allocator,
            registry: &self.registry,
            queries: &self.queries,
            before: &self.stores,
            after: &[],
            hole: None,
        }
    }

    /// Mutably borrow the store for `T` while keeping read access to every
    /// other store, the queries, and the slot table.
    ///
    /// This is the entry point for parallel in-place writes:
    ///
    /// ```
    /// use kestrel_ecs::prelude::*;
    ///
    /// #[derive(Debug, PartialEq)]
    /// struct Position(f32);
    /// struct Speed(f32);
    ///
    /// let mut world = World::new();
    /// let e = world.create_entity().unwrap();
    /// world.set_component(e, Position(0.0)).unwrap();
    /// world.set_component(e, Speed(2.0)).unwrap();
    /// let movers = world.query(QueryDesc::new().with::<Position>().with::<Speed>()).unwrap();
    ///
    /// let (positions, rest) = world.split_store_mut::<Position>().unwrap();
    /// let speeds = rest.store::<Speed>().unwrap();
    /// let dispatcher = ParallelDispatcher::sequential();
    /// dispatcher.dispatch_mut(rest.view(movers), positions, |mut chunk| {
    ///     for (entity, pos) in chunk.iter_mut() {
    ///         pos.0 += speeds.get(entity).map_or(0.0, |s| s.0);
    ///     }
    /// });
    /// assert_eq!(world.get_component::<Position>(e).unwrap(), &Position(2.0));
    /// ```
    pub fn split_store_mut<T: Component>(
        &mut self,
    ) -> Result<(&mut ComponentStore<T>, WorldReader<'_>), EcsError> {
        let id = self.registry.id_of::<T>()?;
        let (before, rest) = self.stores.split_at_mut(id.slot());
        let (target, after) = rest
            .split_first_mut()
            .ok_or(EcsError::UnknownComponentIndex { index: id.index() })?;
        let store = downcast_mut::<T>(target.as_mut())?;
        let reader = WorldReader {
            allocator: &self.allocator,
            registry: &self.registry,
            queries: &self.queries,
            before,
            after,
            hole: Some(id),
        };
        Ok((store, reader))
    }

    // -- queries ------------------------------------------------------------

    /// Intern a query for `desc` and return its id.
    ///
    /// Idempotent: the same required/excluded sets (in any order, with any
    /// duplicates) always map to the same index. A new index is populated by
    /// one scan of the live entities, then maintained incrementally.
    pub fn query(&mut self, desc: QueryDesc) -> Result<QueryId, EcsError> {
        let mut required = Vec::with_capacity(desc.required.len());
        for vtable in &desc.required {
            required.push(self.ensure_registered(None, *vtable)?);
        }
        let mut excluded = Vec::with_capacity(desc.excluded.len());
        for vtable in &desc.excluded {
            excluded.push(self.ensure_registered(None, *vtable)?);
        }
        required.sort_unstable();
        required.dedup();
        excluded.sort_unstable();
        excluded.dedup();

        let key = (required, excluded);
        if let Some(&id) = self.query_cache.get(&key) {
            return Ok(id);
        }

        let id = QueryId(self.queries.len() as u32);
        let mut index = QueryIndex::new(key.0.clone(), key.1.clone());
        for slot in 0..self.allocator.slot_count() {
            if let Some(entity) = self.allocator.live_handle(slot) {
                let matches = satisfies(&self.stores, &index, slot);
                index.refresh(entity, matches);
            }
        }
        for &t in index.required().iter().chain(index.excluded()) {
            self.subscribers[t.slot()].push(id);
        }
        if index.required().is_empty() {
            self.catch_all.push(id);
        }
        debug!(
            query = ?id,
            required = ?index.required(),
            excluded = ?index.excluded(),
            matched = index.len(),
            "query index created"
        );
        self.queries.push(index);
        self.query_cache.insert(key, id);
        Ok(id)
    }

    /// The current matched entities of `query`.
    ///
    /// # Panics
    ///
    /// Panics if `query` was issued by a different world.
    pub fn view(&self, query: QueryId) -> EntityView<'_> {
        self.queries[query.0 as usize].view()
    }

    /// The index behind `query`.
    ///
    /// # Panics
    ///
    /// Panics if `query` was issued by a different world.
    pub fn query_index(&self, query: QueryId) -> &QueryIndex {
        &self.queries[query.0 as usize]
    }

    /// Like [`view`](Self::view), but `None` for a query this world did not
    /// issue.
    pub fn get_view(&self, query: QueryId) -> Option<EntityView<'_>> {
        self.get_query_index(query).map(|index| index.view())
    }

    /// Like [`query_index`](Self::query_index), but `None` for a query this
    /// world did not issue.
    pub fn get_query_index(&self, query: QueryId) -> Option<&QueryIndex> {
        self.queries.get(query.0 as usize)
    }

    /// Number of entities currently matching `query`.
    pub fn query_len(&self, query: QueryId) -> usize {
        self.query_index(query).len()
    }

    /// Whether `entity` currently matches `query`.
    pub fn query_contains(&self, query: QueryId, entity: EntityId) -> bool {
        self.query_index(query).contains(entity)
    }

    /// Number of interned queries.
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    // -- event routing ------------------------------------------------------

    fn dispatch_event(&mut self, event: StructuralEvent) {
        trace!(?event, "structural event");
        let Self {
            queries,
            stores,
            subscribers,
            catch_all,
            ..
        } = self;

        let (entity, changed, affected) = match event {
            StructuralEvent::Destroyed(entity) => {
                for index in queries.iter_mut() {
                    index.remove_slot(entity.slot());
                }
                return;
            }
            StructuralEvent::Created(entity) => (entity, None, catch_all.as_slice()),
            StructuralEvent::ComponentAdded(entity, id)
            | StructuralEvent::ComponentRemoved(entity, id) => {
                (entity, Some(id), subscribers[id.slot()].as_slice())
            }
        };

        for &query in affected {
            let index = &mut queries[query.0 as usize];
            debug_assert!(changed.map_or(true, |id| index.tracks(id)));
            let matches = satisfies(stores.as_slice(), index, entity.slot());
            index.refresh(entity, matches);
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// WorldReader
// ---------------------------------------------------------------------------

/// Shared, read-only access to a world, possibly minus one store that is
/// currently borrowed mutably (see [`World::split_store_mut`]).
///
/// `WorldReader` is `Copy` and `Sync`, so dispatched operations can capture it.
#[derive(Clone, Copy)]
pub struct WorldReader<'w> {
    allocator: &'w EntityAllocator,
    registry: &'w ComponentRegistry,
    queries: &'w [QueryIndex],
    /// Stores with ids below the hole (all stores when there is no hole).
    before: &'w [Box<dyn ErasedStore>],
    /// Stores with ids above the hole.
    after: &'w [Box<dyn ErasedStore>],
    hole: Option<ComponentTypeId>,
}

impl<'w> WorldReader<'w> {
    /// Returns `true` if `entity` is a valid handle.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    /// The component registry.
    pub fn registry(&self) -> &'w ComponentRegistry {
        self.registry
    }

    /// The current matched entities of `query`.
    ///
    /// # Panics
    ///
    /// Panics if `query` was issued by a different world.
    pub fn view(&self, query: QueryId) -> EntityView<'w> {
        self.queries[query.0 as usize].view()
    }

    /// Like [`view`](Self::view), but `None` for a query the world did not
    /// issue.
    pub fn get_view(&self, query: QueryId) -> Option<EntityView<'w>> {
        self.queries.get(query.0 as usize).map(|index| index.view())
    }

    /// Borrow the store for `T`.
    ///
    /// Fails with [`EcsError::StoreBorrowConflict`] if `T`'s store is the one
    /// currently borrowed mutably.
    pub fn store<T: Component>(&self) -> Result<&'w ComponentStore<T>, EcsError> {
        let id = self.registry.id_of::<T>()?;
        let store = match self.hole {
            Some(hole) if hole == id => {
                return Err(EcsError::StoreBorrowConflict {
                    name: self.registry.name_of(id).to_owned(),
                })
            }
            Some(hole) if id > hole => self.after.get(id.slot() - hole.slot() - 1),
            _ => self.before.get(id.slot()),
        };
        let store = store.ok_or(EcsError::UnknownComponentIndex { index: id.index() })?;
        downcast::<T>(store.as_ref())
    }

    /// Borrow `entity`'s component of type `T`.
    pub fn get_component<T: Component>(&self, entity: EntityId) -> Result<&'w T, EcsError> {
        if !self.allocator.is_alive(entity) {
            return Err(EcsError::StaleHandle { entity });
        }
        let missing = || EcsError::MissingComponent {
            entity,
            component: std::any::type_name::<T>().to_owned(),
        };
        if self.registry.lookup::<T>().is_none() {
            return Err(missing());
        }
        self.store::<T>()?.get(entity).ok_or_else(missing)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Speed {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Frozen;

    fn movers() -> QueryDesc {
        QueryDesc::new().with::<Position>().with::<Speed>()
    }

    // -- lifecycle ----------------------------------------------------------

    #[test]
    fn recycled_slot_gets_higher_generation() {
        let mut world = World::new();
        let h0 = world.create_entity().unwrap();
        let h1 = world.create_entity().unwrap();
        let h2 = world.create_entity().unwrap();
        world.destroy_entity(h1).unwrap();

        let h3 = world.create_entity().unwrap();
        assert_eq!(h3.index(), h1.index());
        assert!(h3.generation() > h1.generation());

        assert!(matches!(
            world.get_component::<Position>(h1),
            Err(EcsError::StaleHandle { entity }) if entity == h1
        ));
        assert!(world.is_alive(h0) && world.is_alive(h2) && world.is_alive(h3));
        assert_eq!(world.entity_count(), 3);
    }

    #[test]
    fn destroy_stale_handle_fails() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        world.destroy_entity(e).unwrap();
        assert!(matches!(world.destroy_entity(e), Err(EcsError::StaleHandle { .. })));
    }

    #[test]
    fn destroy_clears_components() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 1.0, y: 1.0 }).unwrap();
        world.destroy_entity(e).unwrap();
        assert!(world.store::<Position>().unwrap().is_empty());

        // The recycled slot starts without the old component.
        let e2 = world.create_entity().unwrap();
        assert_eq!(e2.index(), e.index());
        assert!(matches!(
            world.get_component::<Position>(e2),
            Err(EcsError::MissingComponent { .. })
        ));
    }

    #[test]
    fn capacity_is_bounded_by_config() {
        let mut world = World::with_config(WorldConfig {
            initial_capacity: 1,
            max_entities: Some(1),
        });
        world.create_entity().unwrap();
        let err = world.create_entity().unwrap_err();
        assert!(matches!(err, EcsError::CapacityExhausted { capacity: 1 }));
        assert!(err.is_fatal());
    }

    // -- components ---------------------------------------------------------

    #[test]
    fn set_get_overwrite() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 1.0, y: 2.0 }).unwrap();
        world.set_component(e, Position { x: 3.0, y: 4.0 }).unwrap();
        assert_eq!(world.get_component::<Position>(e).unwrap(), &Position { x: 3.0, y: 4.0 });

        world.get_component_mut::<Position>(e).unwrap().x = 9.0;
        assert_eq!(world.get_component::<Position>(e).unwrap().x, 9.0);
    }

    #[test]
    fn set_on_stale_handle_fails() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        world.destroy_entity(e).unwrap();
        assert!(matches!(
            world.set_component(e, Frozen),
            Err(EcsError::StaleHandle { .. })
        ));
    }

    #[test]
    fn missing_component_is_reported() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        let err = world.get_component::<Speed>(e).unwrap_err();
        assert!(matches!(err, EcsError::MissingComponent { entity, .. } if entity == e));
        assert!(!err.is_fatal());
        assert!(world.get_component_mut::<Speed>(e).is_err());
        assert!(!world.has_component::<Speed>(e));
    }

    #[test]
    fn remove_absent_component_is_noop() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        assert!(!world.remove_component::<Speed>(e).unwrap());
        world.set_component(e, Speed { x: 0.0, y: 0.0 }).unwrap();
        assert!(world.remove_component::<Speed>(e).unwrap());
        assert!(!world.remove_component::<Speed>(e).unwrap());
        assert!(!world.has_component::<Speed>(e));
    }

    #[test]
    fn registered_name_is_kept() {
        let mut world = World::new();
        let id = world.register_component::<Position>("position").unwrap();
        assert_eq!(world.registry().lookup_by_name("position"), Some(id));
        // Implicit use afterwards maps to the same id.
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        assert_eq!(world.registry().len(), 1);
    }

    #[test]
    fn name_given_after_implicit_use_is_bound() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 1.0, y: 0.0 }).unwrap();
        let _ = world.query(QueryDesc::new().with::<Speed>()).unwrap();

        let id = world.register_component::<Position>("position").unwrap();
        assert_eq!(world.registry().lookup_by_name("position"), Some(id));
        assert_eq!(world.registry().lookup::<Position>(), Some(id));
        assert!(matches!(
            world.register_component::<Speed>("position"),
            Err(EcsError::DuplicateComponentName { .. })
        ));
        let speed = world.register_component::<Speed>("speed").unwrap();
        assert_eq!(world.registry().lookup_by_name("speed"), Some(speed));
        assert_eq!(world.get_component::<Position>(e).unwrap().x, 1.0);
    }

    // -- queries ------------------------------------------------------------

    #[test]
    fn query_from_another_world_is_not_found() {
        let mut issuer = World::new();
        let _ = issuer.query(QueryDesc::new().with::<Position>()).unwrap();
        let foreign = issuer.query(movers()).unwrap();

        let mut other = World::new();
        assert!(other.get_view(foreign).is_none());
        assert!(other.get_query_index(foreign).is_none());
        assert!(other.reader().get_view(foreign).is_none());

        let own = other.query(QueryDesc::new()).unwrap();
        let e = other.create_entity().unwrap();
        assert_eq!(other.get_view(own).unwrap().as_slice(), &[e]);
        assert_eq!(other.get_query_index(own).unwrap().len(), 1);
        assert!(issuer.get_view(foreign).unwrap().is_empty());
    }

    #[test]
    fn query_tracks_incremental_adds() {
        let mut world = World::new();
        let q = world.query(movers()).unwrap();
        let e = world.create_entity().unwrap();

        world.set_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        assert_eq!(world.view(q).len(), 0);

        world.set_component(e, Speed { x: 1.0, y: 1.0 }).unwrap();
        assert_eq!(world.view(q).as_slice(), &[e]);
    }

    #[test]
    fn query_is_interned() {
        let mut world = World::new();
        let a = world.query(movers()).unwrap();
        let b = world
            .query(QueryDesc::new().with::<Speed>().with::<Position>().with::<Speed>())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(world.query_count(), 1);
    }

    #[test]
    fn query_built_late_sees_existing_entities() {
        let mut world = World::new();
        let e1 = world.create_entity().unwrap();
        let e2 = world.create_entity().unwrap();
        world.set_component(e1, Position { x: 0.0, y: 0.0 }).unwrap();
        world.set_component(e1, Speed { x: 0.0, y: 0.0 }).unwrap();
        world.set_component(e2, Position { x: 0.0, y: 0.0 }).unwrap();

        let q = world.query(movers()).unwrap();
        assert_eq!(world.view(q).as_slice(), &[e1]);
    }

    #[test]
    fn exclusion_reacts_to_add_and_remove() {
        let mut world = World::new();
        let q = world
            .query(QueryDesc::new().with::<Position>().without::<Frozen>())
            .unwrap();
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        assert!(world.query_contains(q, e));

        world.set_component(e, Frozen).unwrap();
        assert!(!world.query_contains(q, e));

        world.remove_component::<Frozen>(e).unwrap();
        assert!(world.query_contains(q, e));
    }

    #[test]
    fn empty_predicate_matches_all_live_entities() {
        let mut world = World::new();
        let all = world.query(QueryDesc::new()).unwrap();
        let not_frozen = world.query(QueryDesc::new().without::<Frozen>()).unwrap();
        let a = world.create_entity().unwrap();
        let b = world.create_entity().unwrap();
        world.set_component(b, Frozen).unwrap();
        assert_eq!(world.view(all).len(), 2);
        assert_eq!(world.view(not_frozen).as_slice(), &[a]);

        world.destroy_entity(a).unwrap();
        assert_eq!(world.view(all).as_slice(), &[b]);
        assert!(world.view(not_frozen).is_empty());
    }

    #[test]
    fn overwrite_does_not_duplicate_in_query() {
        let mut world = World::new();
        let q = world.query(QueryDesc::new().with::<Position>()).unwrap();
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        world.set_component(e, Position { x: 1.0, y: 0.0 }).unwrap();
        assert_eq!(world.view(q).len(), 1);
    }

    #[test]
    fn destroy_removes_from_every_query() {
        let mut world = World::new();
        let q1 = world.query(QueryDesc::new().with::<Position>()).unwrap();
        let q2 = world.query(movers()).unwrap();
        let e = world.create_entity().unwrap();
        let keep = world.create_entity().unwrap();
        for entity in [e, keep] {
            world.set_component(entity, Position { x: 0.0, y: 0.0 }).unwrap();
            world.set_component(entity, Speed { x: 0.0, y: 0.0 }).unwrap();
        }
        world.destroy_entity(e).unwrap();
        assert_eq!(world.view(q1).as_slice(), &[keep]);
        assert_eq!(world.view(q2).as_slice(), &[keep]);
    }

    // -- split borrows ------------------------------------------------------

    #[test]
    fn split_store_rejects_reading_the_borrowed_type() {
        let mut world = World::new();
        let e = world.create_entity().unwrap();
        world.set_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
        world.set_component(e, Speed { x: 1.0, y: 0.0 }).unwrap();

        let (positions, rest) = world.split_store_mut::<Position>().unwrap();
        assert!(matches!(
            rest.store::<Position>(),
            Err(EcsError::StoreBorrowConflict { .. })
        ));
        let speed = rest.get_component::<Speed>(e).unwrap();
        positions.get_mut(e).unwrap().x += speed.x;
        assert_eq!(world.get_component::<Position>(e).unwrap().x, 1.0);
    }

    #[test]
    fn split_store_reads_types_on_both_sides() {
        let mut world = World::new();
        world.register_component::<Frozen>("frozen").unwrap();
        world.register_component::<Position>("position").unwrap();
        world.register_component::<Speed>("speed").unwrap();
        let e = world.create_entity().unwrap();
        world.set_component(e, Frozen).unwrap();
        world.set_component(e, Speed { x: 2.0, y: 0.0 }).unwrap();

        let (_, rest) = world.split_store_mut::<Position>().unwrap();
        assert!(rest.store::<Frozen>().unwrap().contains(e));
        assert!(rest.store::<Speed>().unwrap().contains(e));
    }

    #[test]
    fn unregistered_store_is_an_error() {
        let world = World::new();
        assert!(matches!(
            world.store::<Speed>(),
            Err(EcsError::UnregisteredComponent { .. })
        ));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: WorldConfig = serde_json::from_str(r#"{ "max_entities": 64 }"#).unwrap();
        assert_eq!(config.initial_capacity, 0);
        assert_eq!(config.max_entities, Some(64));
    }
}
