//! Kestrel ECS -- sparse-set Entity Component System with reactive queries,
//! deferred binary command logs, and parallel dispatch.
//!
//! Entities are generational handles into a slot table. Each component type
//! lives in its own dense [`ComponentStore`](storage::ComponentStore). Queries
//! are interned by the [`World`](world::World) and kept current on every
//! structural change, so reading a query's matched entities never rescans
//! storage. Structural changes discovered while iterating are recorded into a
//! [`CommandLog`](command::CommandLog) and replayed afterwards.
//!
//! # Quick Start
//!
//! ```
//! use kestrel_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
//! #[repr(C)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
//! #[repr(C)]
//! struct Speed { x: f32, y: f32 }
//!
//! let mut world = World::new();
//! world.register_pod_component::<Position>("position").unwrap();
//! world.register_pod_component::<Speed>("speed").unwrap();
//!
//! let movers = world.query(QueryDesc::new().with::<Position>().with::<Speed>()).unwrap();
//! let entity = world.create_entity().unwrap();
//! world.set_component(entity, Position { x: 0.0, y: 0.0 }).unwrap();
//! world.set_component(entity, Speed { x: 1.0, y: 0.5 }).unwrap();
//! assert_eq!(world.view(movers).as_slice(), &[entity]);
//!
//! // Queue a spawn while iterating, apply it afterwards.
//! let mut log = CommandLog::new();
//! for _ in world.view(movers).iter() {
//!     let spawned = log.main().create_entity();
//!     log.main().set(world.registry(), spawned, Position { x: 9.0, y: 9.0 }).unwrap();
//! }
//! log.replay(&mut world).unwrap();
//! assert_eq!(world.entity_count(), 2);
//! ```

#![deny(unsafe_code)]

pub mod command;
pub mod component;
#[allow(unsafe_code)]
pub mod dispatch;
pub mod entity;
pub mod query;
pub mod storage;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The handle's generation no longer matches its slot, or the slot was
    /// never allocated.
    #[error("entity {entity} is stale or was never allocated")]
    StaleHandle { entity: entity::EntityId },

    /// Typed access to a component the entity does not carry.
    #[error("entity {entity} has no `{component}` component")]
    MissingComponent {
        entity: entity::EntityId,
        component: String,
    },

    /// The slot table is at its configured or addressable maximum.
    #[error("slot table exhausted at {capacity} slots")]
    CapacityExhausted { capacity: u32 },

    /// A command record addresses an entity outside the ones defined so far
    /// in its segment.
    #[error(
        "command segment {segment}: entity offset {offset} is outside the {defined} entities defined so far"
    )]
    ReplayOrderingViolation {
        segment: usize,
        offset: i32,
        defined: usize,
    },

    /// A typed call referenced a component type the world has never seen.
    #[error("component type `{name}` is not registered")]
    UnregisteredComponent { name: String },

    /// A component name is already taken, or the type already has a
    /// different explicit name.
    #[error("component name `{name}` conflicts with an existing registration")]
    DuplicateComponentName { name: String },

    /// A command record names a type index the world does not know.
    #[error("unknown component type index {index}")]
    UnknownComponentIndex { index: u32 },

    /// Unknown tag or truncated record found while replaying.
    #[error("malformed command in segment {segment} at byte {position}: {details}")]
    MalformedCommand {
        segment: usize,
        position: usize,
        details: String,
    },

    /// Inline recording of a component not registered as plain-old-data.
    #[error("component `{name}` is not plain-old-data and cannot be recorded inline")]
    NotInlineEncodable { name: String },

    /// An entity or payload reference used with a segment that did not issue
    /// it, or after that segment was cleared.
    #[error("entity record belongs to a different command segment")]
    ForeignEntityRecord,

    /// A store was requested while it is mutably borrowed out of the world.
    #[error("component store `{name}` is already mutably borrowed")]
    StoreBorrowConflict { name: String },

    /// The worker pool could not be created.
    #[error("parallel runner unavailable: {details}")]
    RunnerUnavailable { details: String },
}

impl EcsError {
    /// Whether this error signals corrupted state or exhausted resources
    /// rather than a condition the caller can skip.
    ///
    /// Replay stops at the first fatal error and returns it; non-fatal errors
    /// are logged and counted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EcsError::CapacityExhausted { .. }
                | EcsError::ReplayOrderingViolation { .. }
                | EcsError::UnknownComponentIndex { .. }
                | EcsError::MalformedCommand { .. }
                | EcsError::RunnerUnavailable { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command::{CommandLog, CommandSegment, EntityRecord, PayloadRef, ReplayReport};
    pub use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::dispatch::{
        ChunkMut, DefaultParallelRunner, ParallelDispatcher, ParallelRunner, RunnerConfig,
    };
    pub use crate::entity::EntityId;
    pub use crate::query::{EntityView, QueryDesc, QueryId};
    pub use crate::storage::ComponentStore;
    pub use crate::world::{World, WorldConfig, WorldReader};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
