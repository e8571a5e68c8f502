//! Entity handles and the slot table.
//!
//! An [`EntityId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and a slot *index* in the low 32 bits. The generation is bumped
//! every time a slot is released, so a handle issued for an earlier occupant of
//! the slot can never resolve again.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`. Two handles are equal iff both
/// halves match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct an `EntityId` from a slot index and generation.
    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The slot index (low 32 bits). Diagnostic only: all access goes through
    /// the full handle.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub(crate) fn slot(self) -> usize {
        self.index() as usize
    }

    /// Raw `u64` representation, as written into command records.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64` read back from a command record.
    #[inline]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// The slot table: per-slot generation counters and liveness bits.
///
/// Released slots go onto a LIFO free list so the table stays as small as the
/// peak live population. A slot whose generation counter is exhausted is
/// retired instead of recycled, which keeps old handles invalid forever.
#[derive(Debug)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_slots: Vec<u32>,
    live: usize,
    max_slots: u32,
}

impl EntityAllocator {
    /// Create an empty slot table addressing up to `u32::MAX` slots.
    pub fn new() -> Self {
        Self::with_limits(0, u32::MAX)
    }

    /// Create a slot table with pre-reserved capacity and an upper bound on
    /// the number of slots.
    pub fn with_limits(initial_capacity: usize, max_slots: u32) -> Self {
        let reserve = initial_capacity.min(max_slots as usize);
        Self {
            generations: Vec::with_capacity(reserve),
            alive: Vec::with_capacity(reserve),
            free_slots: Vec::new(),
            live: 0,
            max_slots,
        }
    }

    /// Allocate a handle, recycling the most recently freed slot if any.
    ///
    /// Fails with [`EcsError::CapacityExhausted`] when every slot is in use and
    /// the table is at its bound.
    pub fn allocate(&mut self) -> Result<EntityId, EcsError> {
        if let Some(index) = self.free_slots.pop() {
            // Generation was already bumped on release.
            self.alive[index as usize] = true;
            self.live += 1;
            return Ok(EntityId::new(index, self.generations[index as usize]));
        }

        let index = self.generations.len();
        if index >= self.max_slots as usize {
            return Err(EcsError::CapacityExhausted {
                capacity: self.max_slots,
            });
        }
        if index == self.generations.capacity() {
            debug!(slots = index, "slot table growing");
        }
        self.generations.push(0);
        self.alive.push(true);
        self.live += 1;
        Ok(EntityId::new(index as u32, 0))
    }

    /// Release a live handle. Returns `false` if the handle was not valid.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let idx = id.slot();
        self.alive[idx] = false;
        self.live -= 1;
        match self.generations[idx].checked_add(1) {
            Some(next) => {
                self.generations[idx] = next;
                self.free_slots.push(id.index());
            }
            None => debug!(slot = idx, "slot generation exhausted, retiring slot"),
        }
        true
    }

    /// Returns `true` if `id` names the current occupant of a live slot.
    #[inline]
    pub fn is_alive(&self, id: EntityId) -> bool {
        let idx = id.slot();
        idx < self.generations.len() && self.alive[idx] && self.generations[idx] == id.generation()
    }

    /// Number of live entities.
    pub fn alive_count(&self) -> usize {
        self.live
    }

    /// Number of slots ever handed out (live, free, or retired).
    pub fn slot_count(&self) -> usize {
        self.generations.len()
    }

    /// The current handle for a live slot, if any.
    pub(crate) fn live_handle(&self, slot: usize) -> Option<EntityId> {
        match self.alive.get(slot) {
            Some(true) => Some(EntityId::new(slot as u32, self.generations[slot])),
            _ => None,
        }
    }

    #[cfg(test)]
    fn force_generation(&mut self, slot: usize, generation: u32) {
        self.generations[slot] = generation;
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
