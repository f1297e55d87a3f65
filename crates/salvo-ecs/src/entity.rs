//! Entity handles and slot allocation.
//!
//! An [`EntityHandle`] is a 64-bit value that packs a *generation* counter in
//! the high 32 bits and a slot *index* in the low 32 bits. The generation is
//! bumped every time a slot is released, so any handle that outlived its
//! entity is detected the moment it is presented to the store.
//!
//! [`EntitySlots`] also records where each live entity's row lives, which
//! makes "is this handle valid" and "where is its data" a single lookup.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;

// ---------------------------------------------------------------------------
// EntityHandle
// ---------------------------------------------------------------------------

/// An opaque, generational entity handle.
///
/// Layout: `[generation: u32 | index: u32]`. Handles are `Copy`, comparable
/// and carry no ownership; holding one never keeps an entity alive.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityHandle(u64);

impl EntityHandle {
    /// Construct a handle from a slot index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The slot index (low 32 bits).
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
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where a live entity's fragments are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

// ---------------------------------------------------------------------------
// EntitySlots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    /// `None` while the slot sits on the free list.
    location: Option<EntityLocation>,
}

/// Allocates and recycles entity slots with generational tracking.
///
/// Free indices are kept in a FIFO queue so that generations are spread out
/// over time rather than concentrated on a hot index.
#[derive(Debug, Default)]
pub struct EntitySlots {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    alive: usize,
}

impl EntitySlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle for an entity stored at `location`.
    ///
    /// Recycled slots come back with the generation bumped on release;
    /// otherwise a brand-new slot is appended.
    pub fn allocate(&mut self, location: EntityLocation) -> EntityHandle {
        self.alive += 1;
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.location = Some(location);
            EntityHandle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                location: Some(location),
            });
            EntityHandle::new(index, 0)
        }
    }

    /// Release a live handle, returning where its row was stored.
    ///
    /// Returns `None` (and changes nothing) for stale or unknown handles.
    pub fn release(&mut self, handle: EntityHandle) -> Option<EntityLocation> {
        let slot = self.live_slot_mut(handle)?;
        let location = slot.location.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(handle.index());
        self.alive -= 1;
        location
    }

    /// Location of a live handle, or `None` if it is stale.
    #[inline]
    pub fn location(&self, handle: EntityHandle) -> Option<EntityLocation> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.location
    }

    /// Update the recorded row of a live entity (after a swap-remove or a
    /// migration between archetypes). Stale handles are ignored.
    pub fn relocate(&mut self, handle: EntityHandle, location: EntityLocation) {
        if let Some(slot) = self.live_slot_mut(handle) {
            slot.location = Some(location);
        }
    }

    #[inline]
    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        self.location(handle).is_some()
    }

    /// Number of live entities.
    pub fn alive_count(&self) -> usize {
        self.alive
    }

    fn live_slot_mut(&mut self, handle: EntityHandle) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        (slot.generation == handle.generation() && slot.location.is_some()).then_some(slot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
