//! Weakly referenced actors and their collision primitives.
//!
//! Projectiles never own the actors they mention (instigator, owner, hit
//! target, ignore lists). They hold [`ActorHandle`] / [`PrimitiveHandle`]
//! values, which are generational indices into an [`ActorRegistry`]. A handle
//! whose actor was destroyed simply fails to resolve; callers treat that as
//! "no target", never as an error.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Registry shared between the simulation's services and its processors.
pub type SharedActors = Arc<RwLock<ActorRegistry>>;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Weak reference to an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorHandle {
    index: u32,
    generation: u32,
}

/// Weak reference to a collision primitive belonging to an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimitiveHandle {
    index: u32,
    generation: u32,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slot storage with FIFO index reuse.
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: VecDeque<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
        }
    }
}

impl<T> Arena<T> {
    fn insert(&mut self, value: T) -> (u32, u32) {
        if let Some(index) = self.free.pop_front() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return (index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        (index, 0)
    }

    fn get(&self, index: u32, generation: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    fn get_mut(&mut self, index: u32, generation: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_mut())
    }

    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|s| s.generation == generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push_back(index);
        Some(value)
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

// ---------------------------------------------------------------------------
// ActorRegistry
// ---------------------------------------------------------------------------

/// A live actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorRecord {
    pub name: String,
    pub primitives: Vec<PrimitiveHandle>,
}

/// Generational arena of actors and the primitives they own.
#[derive(Default)]
pub struct ActorRegistry {
    actors: Arena<ActorRecord>,
    primitives: Arena<ActorHandle>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a new registry for sharing.
    pub fn shared() -> SharedActors {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn spawn_actor(&mut self, name: &str) -> ActorHandle {
        let (index, generation) = self.actors.insert(ActorRecord {
            name: name.to_owned(),
            primitives: Vec::new(),
        });
        ActorHandle { index, generation }
    }

    /// Attach a new primitive to `actor`. `None` if the actor is gone.
    pub fn add_primitive(&mut self, actor: ActorHandle) -> Option<PrimitiveHandle> {
        self.actors.get(actor.index, actor.generation)?;
        let (index, generation) = self.primitives.insert(actor);
        let primitive = PrimitiveHandle { index, generation };
        if let Some(record) = self.actors.get_mut(actor.index, actor.generation) {
            record.primitives.push(primitive);
        }
        Some(primitive)
    }

    /// Destroy an actor and every primitive it owns. Returns false if the
    /// handle was already stale.
    pub fn destroy_actor(&mut self, actor: ActorHandle) -> bool {
        let Some(record) = self.actors.remove(actor.index, actor.generation) else {
            return false;
        };
        for p in record.primitives {
            self.primitives.remove(p.index, p.generation);
        }
        true
    }

    pub fn resolve(&self, actor: ActorHandle) -> Option<&ActorRecord> {
        self.actors.get(actor.index, actor.generation)
    }

    /// The owning actor of a live primitive.
    pub fn resolve_primitive(&self, primitive: PrimitiveHandle) -> Option<ActorHandle> {
        self.primitives
            .get(primitive.index, primitive.generation)
            .copied()
    }

    pub fn is_alive(&self, actor: ActorHandle) -> bool {
        self.resolve(actor).is_some()
    }

    pub fn is_primitive_alive(&self, primitive: PrimitiveHandle) -> bool {
        self.resolve_primitive(primitive).is_some()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }
}

impl std::fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRegistry")
            .field("actors", &self.actors.len())
            .field("primitives", &self.primitives.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
