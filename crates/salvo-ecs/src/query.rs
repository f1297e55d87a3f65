//! Chunked queries over archetype storage.
//!
//! An [`EntityQuery`] lists the per-entity fragments it reads or writes and
//! the shared fragments it needs. It matches every archetype that has all of
//! them. Iteration comes in two shapes:
//!
//! - [`EntityQuery::for_each_chunk`] splits each matching archetype into
//!   contiguous row ranges of at most `chunk_size` rows and hands each range
//!   to the callback as a [`ChunkView`]. Chunks run on the rayon pool when the
//!   processor is parallel;
//! - [`EntityQuery::for_each_entity`] visits an explicit list of handles (for
//!   example the entities named by a signal), read-only, skipping handles
//!   that are stale or whose archetype does not match.
//!
//! # Safety
//!
//! Writable chunk views are built from raw column pointers while the world
//! is only borrowed shared. This is sound because:
//!
//! 1. the scheduler never runs two processors with conflicting access in the
//!    same stage, so a column written by this query is touched by nobody
//!    else, and no structural change can happen while a stage runs;
//! 2. a processor can only run a query whose access it declared, and only
//!    one iteration at a time ([`ExecutionContext::begin_iteration`]);
//! 3. chunks of one archetype cover disjoint row ranges;
//! 4. inside a chunk, a runtime borrow flag per column prevents handing out a
//!    mutable slice alongside any other slice of the same column.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::any::{Any, TypeId};
use std::cell::Cell;

use rayon::prelude::*;
use tracing::trace;

use crate::access::AccessSet;
use crate::archetype::{Archetype, ArchetypeId};
use crate::entity::EntityHandle;
use crate::fragment::{Fragment, FragmentTypeId, SharedFragment};
use crate::processor::ExecutionContext;
use crate::world::World;

// ---------------------------------------------------------------------------
// EntityQuery
// ---------------------------------------------------------------------------

/// Declarative description of the fragments a pass needs.
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    /// Per-entity requirements in declaration order.
    fragments: Vec<(TypeId, &'static str)>,
    shared: Vec<(TypeId, &'static str)>,
    access: AccessSet,
}

/// Requirements resolved to registered ids for one world.
struct Resolved {
    fragments: Vec<FragmentTypeId>,
    shared: Vec<FragmentTypeId>,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<T: Fragment>(mut self) -> Self {
        self.require(TypeId::of::<T>(), std::any::type_name::<T>());
        self.access
            .add_read(TypeId::of::<T>(), std::any::type_name::<T>());
        self
    }

    pub fn write<T: Fragment>(mut self) -> Self {
        self.require(TypeId::of::<T>(), std::any::type_name::<T>());
        self.access
            .add_write(TypeId::of::<T>(), std::any::type_name::<T>());
        self
    }

    pub fn shared<T: SharedFragment>(mut self) -> Self {
        let entry = (TypeId::of::<T>(), std::any::type_name::<T>());
        if !self.shared.contains(&entry) {
            self.shared.push(entry);
        }
        self.access.add_shared(entry.0, entry.1);
        self
    }

    fn require(&mut self, type_id: TypeId, name: &'static str) {
        if !self.fragments.iter().any(|(t, _)| *t == type_id) {
            self.fragments.push((type_id, name));
        }
    }

    pub fn access(&self) -> &AccessSet {
        &self.access
    }

    /// Number of live entities the query matches.
    pub fn count(&self, world: &World) -> usize {
        match self.resolve(world) {
            Some(resolved) => world
                .archetypes()
                .iter()
                .filter(|a| matches(a, &resolved))
                .map(Archetype::len)
                .sum(),
            None => 0,
        }
    }

    /// Whether `entity` is live and has everything this query requires.
    pub fn matches_entity(&self, world: &World, entity: EntityHandle) -> bool {
        match (self.resolve(world), world.location(entity)) {
            (Some(resolved), Some(loc)) => matches(world.archetype(loc.archetype), &resolved),
            _ => false,
        }
    }

    fn resolve(&self, world: &World) -> Option<Resolved> {
        let registry = world.registry();
        let fragments = self
            .fragments
            .iter()
            .map(|(t, _)| registry.lookup_type(*t))
            .collect::<Option<Vec<_>>>()?;
        let shared = self
            .shared
            .iter()
            .map(|(t, _)| registry.lookup_type(*t))
            .collect::<Option<Vec<_>>>()?;
        Some(Resolved { fragments, shared })
    }

    /// Run `f` over every matching chunk.
    ///
    /// # Panics
    ///
    /// Panics if the query needs access the processor did not declare, or if
    /// the processor is already inside another iteration.
    pub fn for_each_chunk<F>(&self, ctx: &ExecutionContext<'_>, f: F)
    where
        F: Fn(&ChunkView<'_>) + Send + Sync,
    {
        ctx.check_access(self);
        let _guard = ctx.begin_iteration();
        let plans = self.plan_chunks(ctx.world(), ctx.chunk_size());
        trace!(
            processor = ctx.processor_name(),
            chunks = plans.len(),
            "iterating chunks"
        );
        if ctx.is_parallel() && plans.len() > 1 {
            plans
                .into_par_iter()
                .for_each(|plan| f(&ChunkView::new(plan)));
        } else {
            for plan in plans {
                f(&ChunkView::new(plan));
            }
        }
    }

    /// Visit `entities` in order with read-only views. Stale handles and
    /// entities whose archetype does not match are skipped.
    ///
    /// # Panics
    ///
    /// Panics if the query declares write access, if it needs access the
    /// processor did not declare, or if the processor is already iterating.
    pub fn for_each_entity<F>(&self, ctx: &ExecutionContext<'_>, entities: &[EntityHandle], mut f: F)
    where
        F: FnMut(EntityHandle, &EntityView<'_>),
    {
        assert!(
            !self.fragments.iter().any(|(t, _)| self.access.can_write(*t)),
            "for_each_entity requires a read-only query, got {:?}",
            self.access
        );
        ctx.check_access(self);
        let _guard = ctx.begin_iteration();
        let world = ctx.world();
        let Some(resolved) = self.resolve(world) else {
            return;
        };
        for &entity in entities {
            let Some(loc) = world.location(entity) else {
                trace!(?entity, "stale handle skipped");
                continue;
            };
            let archetype = world.archetype(loc.archetype);
            if !matches(archetype, &resolved) {
                trace!(?entity, "entity does not match query, skipped");
                continue;
            }
            let view = EntityView {
                world,
                archetype,
                row: loc.row,
                query: self,
            };
            f(entity, &view);
        }
    }

    fn plan_chunks<'w>(&self, world: &'w World, chunk_size: usize) -> Vec<ChunkPlan<'w>> {
        let Some(resolved) = self.resolve(world) else {
            return Vec::new();
        };
        let store = world.shared_store();
        let mut plans = Vec::new();

        for archetype in world.archetypes() {
            if archetype.is_empty() || !matches(archetype, &resolved) {
                continue;
            }
            let mut columns = Vec::with_capacity(self.fragments.len());
            for &(type_id, name) in &self.fragments {
                let Some(slot) = archetype.column_by_type(type_id) else {
                    continue;
                };
                let writable = self.access.can_write(type_id);
                let ptr = if writable {
                    // SAFETY: this query holds the only write access to the
                    // column for the duration of the stage (module docs, 1-2).
                    unsafe { slot.column.base_ptr_mut() }
                } else {
                    slot.column.base_ptr() as *mut u8
                };
                columns.push(ColumnRef {
                    type_id,
                    name,
                    ptr,
                    writable,
                });
            }
            let shared: Vec<(TypeId, &'w (dyn Any + Send + Sync))> = self
                .shared
                .iter()
                .filter_map(|&(type_id, _)| {
                    let handle = archetype
                        .shared()
                        .iter()
                        .find(|h| store.type_of(**h) == Some(type_id))?;
                    Some((type_id, store.get_erased(*handle)?))
                })
                .collect();

            let len = archetype.len();
            let step = chunk_size.max(1);
            for start in (0..len).step_by(step) {
                let end = (start + step).min(len);
                plans.push(ChunkPlan {
                    archetype: archetype.id(),
                    entities: &archetype.entities()[start..end],
                    start,
                    columns: columns.clone(),
                    shared: shared.clone(),
                });
            }
        }
        plans
    }
}

fn matches(archetype: &Archetype, resolved: &Resolved) -> bool {
    resolved.fragments.iter().all(|f| archetype.has_fragment(*f))
        && resolved
            .shared
            .iter()
            .all(|f| archetype.shared().iter().any(|h| h.fragment() == *f))
}

// ---------------------------------------------------------------------------
// ChunkPlan / ChunkView
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct ColumnRef {
    type_id: TypeId,
    name: &'static str,
    /// First element of the column (not of the chunk).
    ptr: *mut u8,
    writable: bool,
}

/// A chunk's row range and column pointers, ready to ship to a worker.
struct ChunkPlan<'w> {
    archetype: ArchetypeId,
    entities: &'w [EntityHandle],
    start: usize,
    columns: Vec<ColumnRef>,
    shared: Vec<(TypeId, &'w (dyn Any + Send + Sync))>,
}

// SAFETY: the raw pointers refer to columns of `Send + Sync` fragment types;
// which rows a plan may touch is fixed at planning time and disjoint across
// plans (module docs).
unsafe impl Send for ChunkPlan<'_> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Borrow {
    Free,
    Read,
    Write,
}

/// One contiguous slice of an archetype, as seen by a chunk callback.
///
/// Slices returned by [`fragments`](Self::fragments) and
/// [`fragments_mut`](Self::fragments_mut) are index-aligned with
/// [`entities`](Self::entities).
pub struct ChunkView<'c> {
    plan: ChunkPlan<'c>,
    borrows: Vec<Cell<Borrow>>,
}

impl<'c> ChunkView<'c> {
    fn new(plan: ChunkPlan<'c>) -> Self {
        let borrows = plan.columns.iter().map(|_| Cell::new(Borrow::Free)).collect();
        Self { plan, borrows }
    }

    pub fn len(&self) -> usize {
        self.plan.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plan.entities.is_empty()
    }

    pub fn entities(&self) -> &[EntityHandle] {
        self.plan.entities
    }

    pub fn archetype(&self) -> ArchetypeId {
        self.plan.archetype
    }

    fn column<T: 'static>(&self) -> (usize, ColumnRef) {
        let type_id = TypeId::of::<T>();
        match self.plan.columns.iter().position(|c| c.type_id == type_id) {
            Some(idx) => (idx, self.plan.columns[idx]),
            None => panic!(
                "fragment {} is not part of this query",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Read-only rows of fragment `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not in the query or is currently borrowed mutably.
    pub fn fragments<T: Fragment>(&self) -> &[T] {
        let (idx, column) = self.column::<T>();
        assert!(
            self.borrows[idx].get() != Borrow::Write,
            "fragment {} is already borrowed mutably in this chunk",
            column.name
        );
        self.borrows[idx].set(Borrow::Read);
        // SAFETY: `column.ptr` points at a live `Vec<T>` buffer (type checked
        // by `TypeId`) of at least `start + len` elements, and no mutable
        // slice of these rows exists (borrow flag above, module docs).
        unsafe { std::slice::from_raw_parts((column.ptr as *const T).add(self.plan.start), self.len()) }
    }

    /// Mutable rows of fragment `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not declared writable in the query or is already
    /// borrowed in this chunk.
    #[allow(clippy::mut_from_ref)]
    pub fn fragments_mut<T: Fragment>(&self) -> &mut [T] {
        let (idx, column) = self.column::<T>();
        assert!(
            column.writable,
            "fragment {} is declared read-only in this query",
            column.name
        );
        assert!(
            self.borrows[idx].get() == Borrow::Free,
            "fragment {} is already borrowed in this chunk",
            column.name
        );
        self.borrows[idx].set(Borrow::Write);
        // SAFETY: as for `fragments`, plus: the rows belong to this chunk
        // only and the borrow flag guarantees this is the only slice of them.
        unsafe {
            std::slice::from_raw_parts_mut((column.ptr as *mut T).add(self.plan.start), self.len())
        }
    }

    /// The archetype's shared instance of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not a shared requirement of the query.
    pub fn shared<T: SharedFragment>(&self) -> &T {
        let type_id = TypeId::of::<T>();
        self.plan
            .shared
            .iter()
            .find(|(t, _)| *t == type_id)
            .and_then(|(_, value)| value.downcast_ref::<T>())
            .unwrap_or_else(|| {
                panic!(
                    "shared fragment {} is not part of this query",
                    std::any::type_name::<T>()
                )
            })
    }
}

// ---------------------------------------------------------------------------
// EntityView
// ---------------------------------------------------------------------------

/// Read-only access to one entity's fragments during
/// [`EntityQuery::for_each_entity`].
pub struct EntityView<'w> {
    world: &'w World,
    archetype: &'w Archetype,
    row: usize,
    query: &'w EntityQuery,
}

impl<'w> EntityView<'w> {
    /// # Panics
    ///
    /// Panics if `T` is not a requirement of the query.
    pub fn get<T: Fragment>(&self) -> Option<&'w T> {
        let type_id = TypeId::of::<T>();
        assert!(
            self.query.fragments.iter().any(|(t, _)| *t == type_id),
            "fragment {} is not part of this query",
            std::any::type_name::<T>()
        );
        let id = self.world.registry().lookup_type(type_id)?;
        self.archetype.get::<T>(self.archetype.column_index(id)?, self.row)
    }

    /// # Panics
    ///
    /// Panics if `T` is not a shared requirement of the query.
    pub fn shared<T: SharedFragment>(&self) -> Option<&'w T> {
        let type_id = TypeId::of::<T>();
        assert!(
            self.query.shared.iter().any(|(t, _)| *t == type_id),
            "shared fragment {} is not part of this query",
            std::any::type_name::<T>()
        );
        let store = self.world.shared_store();
        let handle = self
            .archetype
            .shared()
            .iter()
            .find(|h| store.type_of(**h) == Some(type_id))?;
        store.get::<T>(*handle)
    }
}
