//! Component type registration and metadata.
//!
//! Every component type gets a [`ComponentTypeId`] the first time the
//! [`World`] sees it, either through explicit registration or implicitly on
//! first use. The id is a dense `u32`: it indexes the world's store table and
//! is the 4-byte type index written into command records.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::entity::EntityId;
use crate::storage::{ComponentStore, ErasedStore};
use crate::world::World;
use crate::EcsError;

/// Marker for types that can be stored as components.
///
/// Blanket-implemented for every `Send + Sync + 'static` type.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// The dense index of this type, as written into command records.
    pub fn index(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable
// ---------------------------------------------------------------------------

pub(crate) type InlineSetFn = fn(&mut World, EntityId, &[u8]) -> Result<(), EcsError>;
pub(crate) type BoxedSetFn = fn(&mut World, EntityId, Box<dyn Any + Send>) -> Result<(), EcsError>;

/// Type-erased operations for one component type.
///
/// Carries everything the world needs to create the type's store and to apply
/// a replayed command record without knowing `T` statically.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) size: usize,
    pub(crate) new_store: fn() -> Box<dyn ErasedStore>,
    pub(crate) set_boxed: BoxedSetFn,
    pub(crate) set_inline: Option<InlineSetFn>,
}

impl ComponentVtable {
    /// Vtable for a component recorded in command logs as a boxed object.
    pub fn of<T: Component>() -> Self {
        fn new_store<T: Component>() -> Box<dyn ErasedStore> {
            Box::new(ComponentStore::<T>::new())
        }
        fn set_boxed<T: Component>(
            world: &mut World,
            entity: EntityId,
            value: Box<dyn Any + Send>,
        ) -> Result<(), EcsError> {
            match value.downcast::<T>() {
                Ok(value) => world.set_component(entity, *value),
                Err(_) => Err(EcsError::UnregisteredComponent {
                    name: std::any::type_name::<T>().to_owned(),
                }),
            }
        }

        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            new_store: new_store::<T>,
            set_boxed: set_boxed::<T>,
            set_inline: None,
        }
    }

    /// Vtable for a plain-old-data component whose bytes can be written
    /// inline into command records.
    pub fn of_pod<T: Component + bytemuck::Pod>() -> Self {
        fn set_inline<T: Component + bytemuck::Pod>(
            world: &mut World,
            entity: EntityId,
            bytes: &[u8],
        ) -> Result<(), EcsError> {
            let value: T = bytemuck::pod_read_unaligned(bytes);
            world.set_component(entity, value)
        }

        Self {
            set_inline: Some(set_inline::<T>),
            ..Self::of::<T>()
        }
    }
}

impl fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("inline", &self.set_inline.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Human-readable name (caller supplied, or the Rust type name).
    pub name: String,
    /// `std::mem::size_of::<T>()`; the inline payload width in command records.
    pub size: usize,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    /// Whether values can be recorded inline as raw bytes.
    pub inline: bool,
    pub(crate) vtable: ComponentVtable,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// A type is registered at most once; re-registering returns the existing id,
/// upgrading it to inline encoding if the new vtable supports it.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<String, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type. Returns the id and whether it was new.
    ///
    /// A type first seen implicitly (under its Rust type name) takes on the
    /// first explicit name it is registered with. Any other name change is a
    /// [`EcsError::DuplicateComponentName`].
    pub(crate) fn register(
        &mut self,
        name: Option<&str>,
        vtable: ComponentVtable,
    ) -> Result<(ComponentTypeId, bool), EcsError> {
        if let Some(&existing) = self.by_type.get(&vtable.type_id) {
            if let Some(name) = name {
                self.rename(existing, name)?;
            }
            let info = &mut self.infos[existing.slot()];
            if vtable.set_inline.is_some() && !info.inline {
                info.inline = true;
                info.vtable.set_inline = vtable.set_inline;
            }
            return Ok((existing, false));
        }

        let name = name.unwrap_or(vtable.type_name);
        if self.by_name.contains_key(name) {
            return Err(EcsError::DuplicateComponentName {
                name: name.to_owned(),
            });
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            size: vtable.size,
            type_id: vtable.type_id,
            inline: vtable.set_inline.is_some(),
            vtable,
        });
        self.by_type.insert(vtable.type_id, id);
        self.by_name.insert(name.to_owned(), id);
        Ok((id, true))
    }

    fn rename(&mut self, id: ComponentTypeId, name: &str) -> Result<(), EcsError> {
        let info = &self.infos[id.slot()];
        if info.name == name {
            return Ok(());
        }
        if info.name != info.vtable.type_name || self.by_name.contains_key(name) {
            return Err(EcsError::DuplicateComponentName {
                name: name.to_owned(),
            });
        }
        self.by_name.remove(info.vtable.type_name);
        self.by_name.insert(name.to_owned(), id);
        self.infos[id.slot()].name = name.to_owned();
        Ok(())
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Like [`lookup`](Self::lookup), but reports an unregistered type as an error.
    pub fn id_of<T: 'static>(&self) -> Result<ComponentTypeId, EcsError> {
        self.lookup::<T>()
            .ok_or_else(|| EcsError::UnregisteredComponent {
                name: std::any::type_name::<T>().to_owned(),
            })
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered id.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.slot())
    }

    /// Resolve a raw type index read from a command record.
    pub(crate) fn info_by_index(&self, index: u32) -> Result<&ComponentInfo, EcsError> {
        self.infos
            .get(index as usize)
            .ok_or(EcsError::UnknownComponentIndex { index })
    }

    /// Display name for a registered id.
    pub(crate) fn name_of(&self, id: ComponentTypeId) -> &str {
        self.infos
            .get(id.slot())
            .map(|info| info.name.as_str())
            .unwrap_or("<unregistered>")
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
