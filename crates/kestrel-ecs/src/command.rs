//! Deferred structural mutations recorded into a compact binary log.
//!
//! A [`CommandLog`] is a list of [`CommandSegment`]s. Each segment is an
//! append-only byte buffer owned by exactly one writer (typically one dispatch
//! chunk), so recording never locks and never touches the [`World`]. After
//! iteration the log is replayed against the world: segments in index order,
//! records within a segment in emission order.
//!
//! # Record layout
//!
//! Every record starts with a one-byte tag. Multi-byte fields are
//! little-endian and there is no padding, so a segment can be scanned without
//! a side table:
//!
//! | tag | record                   | body                                               |
//! |-----|--------------------------|----------------------------------------------------|
//! | 1   | `CreateEntity`           | none                                               |
//! | 2   | `RecordEntity`           | `u64` handle                                       |
//! | 3   | `DestroyEntity`          | `i32` entity offset                                |
//! | 4   | `SetComponent`           | `u32` type, `i32` offset, inline payload           |
//! | 5   | `SetReferencedComponent` | `u32` type, `i32` offset, `u32` back-offset        |
//! | 6   | `SetBoxedComponent`      | `u32` type, `i32` offset, `u32` object index       |
//! | 7   | `RemoveComponent`        | `u32` type, `i32` offset                           |
//!
//! `CreateEntity` and `RecordEntity` each define the next *entity slot* of the
//! segment. Later records address entities by a negative offset from the
//! number of slots defined so far, so create-then-mutate chains work without
//! knowing the handle the world will hand out at replay time.
//!
//! # Example
//!
//! ```
//! use kestrel_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
//! #[repr(C)]
//! struct Health(u32);
//!
//! let mut world = World::new();
//! world.register_pod_component::<Health>("health").unwrap();
//!
//! let mut log = CommandLog::new();
//! let segment = log.main();
//! let spawned = segment.create_entity();
//! segment.set(world.registry(), spawned, Health(100)).unwrap();
//!
//! let report = log.replay(&mut world).unwrap();
//! assert_eq!(report.created, 1);
//! assert_eq!(world.entity_count(), 1);
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::world::World;
use crate::EcsError;

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(0);

fn next_segment_id() -> u64 {
    NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    CreateEntity = 1,
    RecordEntity = 2,
    DestroyEntity = 3,
    SetComponent = 4,
    SetReferencedComponent = 5,
    SetBoxedComponent = 6,
    RemoveComponent = 7,
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Ok(match byte {
            1 => Tag::CreateEntity,
            2 => Tag::RecordEntity,
            3 => Tag::DestroyEntity,
            4 => Tag::SetComponent,
            5 => Tag::SetReferencedComponent,
            6 => Tag::SetBoxedComponent,
            7 => Tag::RemoveComponent,
            other => return Err(other),
        })
    }
}

// ---------------------------------------------------------------------------
// EntityRecord / PayloadRef
// ---------------------------------------------------------------------------

/// A segment-local reference to an entity defined by `create_entity` or
/// `record`. Only valid for the segment (and the tick) that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecord {
    segment: u64,
    ordinal: u32,
}

/// A reference to an inline `SetComponent` payload recorded earlier in the
/// same segment, reusable through [`CommandSegment::set_same_as`].
pub struct PayloadRef<T> {
    segment: u64,
    position: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PayloadRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PayloadRef<T> {}

impl<T> fmt::Debug for PayloadRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadRef")
            .field("segment", &self.segment)
            .field("position", &self.position)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ReplayReport
// ---------------------------------------------------------------------------

/// Summary of one [`CommandLog::replay`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Records applied successfully.
    pub applied: usize,
    /// Records skipped because of a recoverable error (stale handle, missing component).
    pub failed: usize,
    /// Entities created by `CreateEntity` records.
    pub created: usize,
}

// ---------------------------------------------------------------------------
// CommandSegment
// ---------------------------------------------------------------------------

/// A single-writer, append-only run of binary command records.
pub struct CommandSegment {
    id: u64,
    bytes: Vec<u8>,
    /// Arena for boxed payloads, consumed in FIFO order during replay.
    objects: Vec<Box<dyn Any + Send>>,
    /// Entity slots defined so far (`CreateEntity` + `RecordEntity`).
    defined: u32,
    records: usize,
}

impl fmt::Debug for CommandSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSegment")
            .field("records", &self.records)
            .field("bytes", &self.bytes.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl CommandSegment {
    fn new() -> Self {
        Self {
            id: next_segment_id(),
            bytes: Vec::new(),
            objects: Vec::new(),
            defined: 0,
            records: 0,
        }
    }

    /// Number of records appended since the last replay.
    pub fn len(&self) -> usize {
        self.records
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// The encoded records.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Queue creation of a new entity.
    ///
    /// The handle is only known at replay time; use the returned record to
    /// attach components to it or destroy it later in this segment.
    pub fn create_entity(&mut self) -> EntityRecord {
        self.bytes.push(Tag::CreateEntity as u8);
        self.define()
    }

    /// Make an existing entity addressable by later records in this segment.
    pub fn record(&mut self, entity: EntityId) -> EntityRecord {
        self.bytes.push(Tag::RecordEntity as u8);
        self.bytes.extend_from_slice(&entity.to_raw().to_le_bytes());
        self.define()
    }

    /// Queue destruction of `target`.
    pub fn destroy(&mut self, target: EntityRecord) -> Result<(), EcsError> {
        let offset = self.offset_of(target)?;
        self.bytes.push(Tag::DestroyEntity as u8);
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        self.records += 1;
        Ok(())
    }

    /// Queue an insert-or-overwrite of `value` on `target`, with the value's
    /// bytes stored inline. `T` must be registered as plain-old-data.
    pub fn set<T>(
        &mut self,
        registry: &ComponentRegistry,
        target: EntityRecord,
        value: T,
    ) -> Result<PayloadRef<T>, EcsError>
    where
        T: Component + bytemuck::Pod,
    {
        let component = inline_type::<T>(registry)?;
        let offset = self.offset_of(target)?;
        let position = self.bytes.len();
        self.put_header(Tag::SetComponent, component, offset);
        self.bytes.extend_from_slice(bytemuck::bytes_of(&value));
        self.records += 1;
        Ok(PayloadRef {
            segment: self.id,
            position,
            _marker: PhantomData,
        })
    }

    /// Queue an insert-or-overwrite on `target` reusing the payload of an
    /// earlier [`set`](Self::set) in this segment instead of copying it again.
    pub fn set_same_as<T>(
        &mut self,
        registry: &ComponentRegistry,
        target: EntityRecord,
        payload: PayloadRef<T>,
    ) -> Result<(), EcsError>
    where
        T: Component + bytemuck::Pod,
    {
        if payload.segment != self.id {
            return Err(EcsError::ForeignEntityRecord);
        }
        let component = inline_type::<T>(registry)?;
        let offset = self.offset_of(target)?;
        let back = u32::try_from(self.bytes.len() - payload.position).map_err(|_| {
            EcsError::CapacityExhausted { capacity: u32::MAX }
        })?;
        self.put_header(Tag::SetReferencedComponent, component, offset);
        self.bytes.extend_from_slice(&back.to_le_bytes());
        self.records += 1;
        Ok(())
    }

    /// Queue an insert-or-overwrite of any component type; the value is moved
    /// into the segment's object arena.
    pub fn set_boxed<T: Component>(
        &mut self,
        registry: &ComponentRegistry,
        target: EntityRecord,
        value: T,
    ) -> Result<(), EcsError> {
        let component = registry.id_of::<T>()?;
        let offset = self.offset_of(target)?;
        let object = u32::try_from(self.objects.len()).map_err(|_| {
            EcsError::CapacityExhausted { capacity: u32::MAX }
        })?;
        self.put_header(Tag::SetBoxedComponent, component, offset);
        self.bytes.extend_from_slice(&object.to_le_bytes());
        self.objects.push(Box::new(value));
        self.records += 1;
        Ok(())
    }

    /// Queue removal of `target`'s `T` component.
    pub fn remove<T: Component>(
        &mut self,
        registry: &ComponentRegistry,
        target: EntityRecord,
    ) -> Result<(), EcsError> {
        let component = registry.id_of::<T>()?;
        let offset = self.offset_of(target)?;
        self.put_header(Tag::RemoveComponent, component, offset);
        self.records += 1;
        Ok(())
    }

    /// Drop everything recorded, keeping the allocations. Records issued
    /// before the clear become foreign.
    pub fn clear(&mut self) {
        self.id = next_segment_id();
        self.bytes.clear();
        self.objects.clear();
        self.defined = 0;
        self.records = 0;
    }

    // -- internal helpers ---------------------------------------------------

    fn define(&mut self) -> EntityRecord {
        let record = EntityRecord {
            segment: self.id,
            ordinal: self.defined,
        };
        self.defined += 1;
        self.records += 1;
        record
    }

    fn offset_of(&self, target: EntityRecord) -> Result<i32, EcsError> {
        if target.segment != self.id || target.ordinal >= self.defined {
            return Err(EcsError::ForeignEntityRecord);
        }
        let offset = i64::from(target.ordinal) - i64::from(self.defined);
        i32::try_from(offset).map_err(|_| EcsError::CapacityExhausted {
            capacity: i32::MAX as u32,
        })
    }

    fn put_header(&mut self, tag: Tag, component: ComponentTypeId, offset: i32) {
        self.bytes.push(tag as u8);
        self.bytes.extend_from_slice(&component.index().to_le_bytes());
        self.bytes.extend_from_slice(&offset.to_le_bytes());
    }

    /// Apply every record of this segment to `world`.
    ///
    /// `entities` is scratch space for the slots defined during this pass.
    fn replay_into(
        &mut self,
        segment: usize,
        world: &mut World,
        entities: &mut Vec<EntityId>,
        report: &mut ReplayReport,
    ) -> Result<(), EcsError> {
        entities.clear();
        let mut objects = std::mem::take(&mut self.objects).into_iter().enumerate();
        let mut reader = ByteReader::new(&self.bytes, segment);

        while !reader.is_done() {
            let start = reader.pos;
            let record = reader.record(world.registry())?;
            trace!(segment, position = start, ?record, "replaying command");

            let outcome = match record {
                Record::CreateEntity => {
                    entities.push(world.create_entity()?);
                    report.created += 1;
                    Ok(())
                }
                Record::RecordEntity(entity) => {
                    entities.push(entity);
                    Ok(())
                }
                Record::DestroyEntity { offset } => {
                    let entity = resolve_entity(entities, offset, segment)?;
                    world.destroy_entity(entity)
                }
                Record::SetComponent { component, offset, payload } => {
                    let entity = resolve_entity(entities, offset, segment)?;
                    apply_inline(world, component, entity, payload, segment, start)
                }
                Record::SetReferencedComponent { component, offset, back } => {
                    let entity = resolve_entity(entities, offset, segment)?;
                    let size = world.registry().info_by_index(component)?.size;
                    let payload =
                        resolve_reference(&self.bytes, start, back, component, size, segment)?;
                    apply_inline(world, component, entity, payload, segment, start)
                }
                Record::SetBoxedComponent { component, offset, object } => {
                    let entity = resolve_entity(entities, offset, segment)?;
                    let value = match objects.next() {
                        Some((index, value)) if index == object as usize => value,
                        _ => {
                            return Err(EcsError::MalformedCommand {
                                segment,
                                position: start,
                                details: format!("boxed payload {object} out of order"),
                            })
                        }
                    };
                    let set = world.registry().info_by_index(component)?.vtable.set_boxed;
                    set(world, entity, value)
                }
                Record::RemoveComponent { component, offset } => {
                    let entity = resolve_entity(entities, offset, segment)?;
                    let id = world.registry().info_by_index(component)?.id;
                    world.remove_component_by_id(entity, id).map(|_| ())
                }
            };

            match outcome {
                Ok(()) => report.applied += 1,
                Err(e) if !e.is_fatal() => {
                    report.failed += 1;
                    warn!(
                        segment,
                        position = start,
                        error = %e,
                        "command replay failed, record skipped"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn inline_type<T: Component>(registry: &ComponentRegistry) -> Result<ComponentTypeId, EcsError> {
    let id = registry.id_of::<T>()?;
    match registry.get_info(id) {
        Some(info) if info.inline => Ok(id),
        Some(info) => Err(EcsError::NotInlineEncodable {
            name: info.name.clone(),
        }),
        None => Err(EcsError::UnknownComponentIndex { index: id.index() }),
    }
}

/// Turn an entity offset into the handle it names, relative to the number of
/// entity slots defined so far in this replay pass.
fn resolve_entity(entities: &[EntityId], offset: i32, segment: usize) -> Result<EntityId, EcsError> {
    let defined = entities.len();
    let target = defined as i64 + i64::from(offset);
    if offset >= 0 || target < 0 {
        return Err(EcsError::ReplayOrderingViolation {
            segment,
            offset,
            defined,
        });
    }
    Ok(entities[target as usize])
}

/// Locate the inline payload a `SetReferencedComponent` record points at.
///
/// `back` is the distance in bytes from the start of the referencing record to
/// the start of an earlier `SetComponent` record of the same type.
fn resolve_reference(
    bytes: &[u8],
    record_start: usize,
    back: u32,
    component: u32,
    size: usize,
    segment: usize,
) -> Result<&[u8], EcsError> {
    let malformed = |details: String| EcsError::MalformedCommand {
        segment,
        position: record_start,
        details,
    };
    let start = match record_start.checked_sub(back as usize) {
        Some(start) if back > 0 => start,
        _ => return Err(malformed(format!("back-offset {back} is out of range"))),
    };

    let mut reader = ByteReader::new(&bytes[..record_start], segment);
    reader.pos = start;
    if reader.u8()? != Tag::SetComponent as u8 {
        return Err(malformed(format!("back-offset {back} does not name a SetComponent record")));
    }
    if reader.u32()? != component {
        return Err(malformed(format!("back-offset {back} names a different component type")));
    }
    reader.i32()?;
    reader.take(size)
}

fn apply_inline(
    world: &mut World,
    component: u32,
    entity: EntityId,
    payload: &[u8],
    segment: usize,
    position: usize,
) -> Result<(), EcsError> {
    let info = world.registry().info_by_index(component)?;
    let Some(set) = info.vtable.set_inline else {
        return Err(EcsError::MalformedCommand {
            segment,
            position,
            details: format!("component `{}` has no inline encoding", info.name),
        });
    };
    set(world, entity, payload)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Record<'a> {
    CreateEntity,
    RecordEntity(EntityId),
    DestroyEntity { offset: i32 },
    SetComponent { component: u32, offset: i32, payload: &'a [u8] },
    SetReferencedComponent { component: u32, offset: i32, back: u32 },
    SetBoxedComponent { component: u32, offset: i32, object: u32 },
    RemoveComponent { component: u32, offset: i32 },
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    segment: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8], segment: usize) -> Self {
        Self { bytes, pos: 0, segment }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EcsError> {
        let end = match self.pos.checked_add(n) {
            Some(end) if end <= self.bytes.len() => end,
            _ => {
                return Err(EcsError::MalformedCommand {
                    segment: self.segment,
                    position: self.pos,
                    details: format!("truncated record: wanted {n} more bytes"),
                })
            }
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EcsError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EcsError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, EcsError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, EcsError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, EcsError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn record(&mut self, registry: &ComponentRegistry) -> Result<Record<'a>, EcsError> {
        let position = self.pos;
        let tag = Tag::try_from(self.u8()?).map_err(|byte| EcsError::MalformedCommand {
            segment: self.segment,
            position,
            details: format!("unknown tag {byte:#04x}"),
        })?;

        Ok(match tag {
            Tag::CreateEntity => Record::CreateEntity,
            Tag::RecordEntity => Record::RecordEntity(EntityId::from_raw(self.u64()?)),
            Tag::DestroyEntity => Record::DestroyEntity { offset: self.i32()? },
            Tag::SetComponent => {
                let component = self.u32()?;
                let offset = self.i32()?;
                let size = registry.info_by_index(component)?.size;
                Record::SetComponent {
                    component,
                    offset,
                    payload: self.take(size)?,
                }
            }
            Tag::SetReferencedComponent => Record::SetReferencedComponent {
                component: self.u32()?,
                offset: self.i32()?,
                back: self.u32()?,
            },
            Tag::SetBoxedComponent => Record::SetBoxedComponent {
                component: self.u32()?,
                offset: self.i32()?,
                object: self.u32()?,
            },
            Tag::RemoveComponent => Record::RemoveComponent {
                component: self.u32()?,
                offset: self.i32()?,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// CommandLog
// ---------------------------------------------------------------------------

/// An ordered set of command segments replayed as one unit.
///
/// Replay walks segments in index order, so the result is the same no matter
/// which thread filled which segment or when it finished.
#[derive(Debug)]
pub struct CommandLog {
    segments: Vec<CommandSegment>,
    scratch: Vec<EntityId>,
}

impl CommandLog {
    /// A log with one segment.
    pub fn new() -> Self {
        Self::with_segments(1)
    }

    /// A log with `count` segments (at least one).
    pub fn with_segments(count: usize) -> Self {
        Self {
            segments: (0..count.max(1)).map(|_| CommandSegment::new()).collect(),
            scratch: Vec::new(),
        }
    }

    /// The first segment, for single-threaded recording.
    pub fn main(&mut self) -> &mut CommandSegment {
        &mut self.segments[0]
    }

    /// The first `count` segments, adding empty ones as needed.
    pub fn segments_mut(&mut self, count: usize) -> &mut [CommandSegment] {
        while self.segments.len() < count {
            self.segments.push(CommandSegment::new());
        }
        &mut self.segments[..count]
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total records across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(CommandSegment::len).sum()
    }

    /// Whether every segment is empty.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(CommandSegment::is_empty)
    }

    /// Drop every recorded command without applying it.
    pub fn clear(&mut self) {
        for segment in &mut self.segments {
            segment.clear();
        }
    }

    /// Apply every recorded command to `world`, then clear the log.
    ///
    /// Records that fail with a recoverable error (stale handle, missing
    /// component) are logged, counted in [`ReplayReport::failed`], and
    /// skipped. A fatal error stops replay and is returned; commands applied
    /// before it stay applied and the rest are dropped.
    pub fn replay(&mut self, world: &mut World) -> Result<ReplayReport, EcsError> {
        let mut report = ReplayReport::default();
        let mut result = Ok(());
        for (index, segment) in self.segments.iter_mut().enumerate() {
            result = segment.replay_into(index, world, &mut self.scratch, &mut report);
            if result.is_err() {
                break;
            }
        }
        self.clear();
        result?;

        if report.applied + report.failed > 0 {
            debug!(
                applied = report.applied,
                failed = report.failed,
                created = report.created,
                "command log replayed"
            );
        }
        Ok(report)
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
