//! The component store.
//!
//! [`World`] owns every entity, fragment column, archetype and shared
//! fragment instance. Structural changes (spawn, destroy, adding or removing
//! a fragment) require `&mut World`; during a scheduled tick processors only
//! ever see `&World` and queue structural changes on the
//! [`CommandBuffer`](crate::command::CommandBuffer) instead.
//!
//! Every accessor that accepts an [`EntityHandle`] checks its generation
//! first and answers "not found" for stale handles.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::archetype::{Archetype, ArchetypeId, ArchetypeKey, ColumnSlot};
use crate::entity::{EntityHandle, EntityLocation, EntitySlots};
use crate::fragment::{
    BoxedFragment, Fragment, FragmentKind, FragmentRegistry, FragmentTypeId, SharedFragment,
};
use crate::shared::{SharedFragmentHandle, SharedFragmentStore};
use crate::EcsError;

// ---------------------------------------------------------------------------
// FragmentBundle
// ---------------------------------------------------------------------------

/// The initial fragments of an entity, assembled before spawning.
///
/// Adding a fragment type twice keeps the last value. Shared fragments are
/// added by handle (see [`World::get_or_create_shared`]).
#[derive(Default)]
pub struct FragmentBundle {
    values: Vec<(TypeId, &'static str, BoxedFragment)>,
    shared: Vec<SharedFragmentHandle>,
}

impl FragmentBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Fragment>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    pub fn with_shared(mut self, handle: SharedFragmentHandle) -> Self {
        self.add_shared(handle);
        self
    }

    pub fn add<T: Fragment>(&mut self, value: T) -> &mut Self {
        let type_id = TypeId::of::<T>();
        self.values.retain(|(t, _, _)| *t != type_id);
        self.values
            .push((type_id, std::any::type_name::<T>(), Box::new(value)));
        self
    }

    /// Reference a shared instance. A handle of the same fragment type
    /// replaces the previous one.
    pub fn add_shared(&mut self, handle: SharedFragmentHandle) -> &mut Self {
        self.shared.retain(|h| h.fragment() != handle.fragment());
        self.shared.push(handle);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.shared.is_empty()
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Archetype-based columnar entity store.
#[derive(Default)]
pub struct World {
    slots: EntitySlots,
    registry: FragmentRegistry,
    shared: SharedFragmentStore,
    archetypes: Vec<Archetype>,
    archetype_index: HashMap<ArchetypeKey, ArchetypeId>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    // -- registration -------------------------------------------------------

    /// Register a per-entity fragment type. See [`FragmentRegistry::register`].
    pub fn register_fragment<T: Fragment>(&mut self, name: &str) -> FragmentTypeId {
        self.registry.register::<T>(name)
    }

    /// Register a shared fragment type. See
    /// [`FragmentRegistry::register_shared`].
    pub fn register_shared_fragment<T: SharedFragment>(&mut self, name: &str) -> FragmentTypeId {
        self.registry.register_shared::<T>(name)
    }

    pub fn registry(&self) -> &FragmentRegistry {
        &self.registry
    }

    pub fn shared_store(&self) -> &SharedFragmentStore {
        &self.shared
    }

    /// Deduplicating constructor for shared fragment instances.
    ///
    /// Equal values (by encoded content) always return the same handle.
    pub fn get_or_create_shared<T: SharedFragment>(
        &mut self,
        value: T,
    ) -> Result<SharedFragmentHandle, EcsError> {
        let id = self.shared_fragment_id::<T>()?;
        self.shared.get_or_create(id, value)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Create an entity from a bundle.
    ///
    /// Fails if the bundle names an unregistered fragment type, a shared type
    /// as a per-entity value (or vice versa), or an unknown shared handle.
    pub fn spawn(&mut self, bundle: FragmentBundle) -> Result<EntityHandle, EcsError> {
        let mut typed: Vec<(FragmentTypeId, BoxedFragment)> = Vec::with_capacity(bundle.len());
        for (type_id, type_name, value) in bundle.values {
            let id = self
                .registry
                .lookup_type(type_id)
                .filter(|id| self.kind_of(*id) == Some(FragmentKind::PerEntity))
                .ok_or_else(|| self.unknown_fragment(type_name))?;
            typed.push((id, value));
        }
        for handle in &bundle.shared {
            if self.shared.type_of(*handle).is_none() {
                return Err(self.unknown_fragment(&format!("{handle:?}")));
            }
        }
        typed.sort_unstable_by_key(|(id, _)| *id);

        let key = ArchetypeKey::new(typed.iter().map(|(id, _)| *id).collect(), bundle.shared);
        let archetype = self.archetype_for(key)?;
        let row = self.archetypes[archetype.0 as usize].len();
        let entity = self.slots.allocate(EntityLocation { archetype, row });

        let values = typed.into_iter().map(|(_, v)| v).collect();
        if let Err(e) = self.archetypes[archetype.0 as usize].push_row(entity, values) {
            self.slots.release(entity);
            return Err(e);
        }
        Ok(entity)
    }

    /// Destroy an entity, swap-removing its row.
    ///
    /// Returns [`EcsError::StaleEntity`] if the handle is no longer valid; the
    /// store is unchanged in that case.
    pub fn destroy(&mut self, entity: EntityHandle) -> Result<(), EcsError> {
        let loc = self
            .slots
            .release(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let moved = self.archetypes[loc.archetype.0 as usize].swap_remove(loc.row);
        if let Some(moved) = moved {
            self.slots.relocate(moved, loc);
        }
        Ok(())
    }

    pub fn is_alive(&self, entity: EntityHandle) -> bool {
        self.slots.is_alive(entity)
    }

    pub fn location(&self, entity: EntityHandle) -> Option<EntityLocation> {
        self.slots.location(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.slots.alive_count()
    }

    /// All live entities, grouped by archetype.
    pub fn entities(&self) -> impl Iterator<Item = EntityHandle> + '_ {
        self.archetypes
            .iter()
            .flat_map(|a| a.entities().iter().copied())
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    // -- per-entity fragments -----------------------------------------------

    pub fn get<T: Fragment>(&self, entity: EntityHandle) -> Option<&T> {
        let loc = self.slots.location(entity)?;
        let id = self.registry.lookup::<T>()?;
        let archetype = &self.archetypes[loc.archetype.0 as usize];
        archetype.get::<T>(archetype.column_index(id)?, loc.row)
    }

    pub fn get_mut<T: Fragment>(&mut self, entity: EntityHandle) -> Option<&mut T> {
        let loc = self.slots.location(entity)?;
        let id = self.registry.lookup::<T>()?;
        let archetype = &mut self.archetypes[loc.archetype.0 as usize];
        let column = archetype.column_index(id)?;
        archetype.get_mut::<T>(column, loc.row)
    }

    pub fn has<T: 'static>(&self, entity: EntityHandle) -> bool {
        match (self.slots.location(entity), self.registry.lookup::<T>()) {
            (Some(loc), Some(id)) => self.archetypes[loc.archetype.0 as usize].has_fragment(id),
            _ => false,
        }
    }

    /// Insert or overwrite a fragment. Adding a new fragment type moves the
    /// entity to another archetype.
    pub fn insert<T: Fragment>(&mut self, entity: EntityHandle, value: T) -> Result<(), EcsError> {
        let id = self.per_entity_id(TypeId::of::<T>(), std::any::type_name::<T>())?;
        self.insert_boxed(entity, id, Box::new(value))
    }

    /// Remove a fragment. Removing a fragment the entity does not have is a
    /// no-op.
    pub fn remove<T: Fragment>(&mut self, entity: EntityHandle) -> Result<(), EcsError> {
        let id = self.per_entity_id(TypeId::of::<T>(), std::any::type_name::<T>())?;
        self.remove_by_id(entity, id)
    }

    /// Insert or overwrite a fragment addressed by registered name, decoding
    /// `value` with the type's deserializer.
    pub fn set_fragment_by_name(
        &mut self,
        entity: EntityHandle,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), EcsError> {
        let id = self
            .registry
            .lookup_by_name(name)
            .ok_or_else(|| self.unknown_fragment(name))?;
        let boxed = self
            .registry
            .decode(id, value)
            .ok_or_else(|| self.unknown_fragment(name))?
            .map_err(|e| EcsError::FragmentDeserialization {
                fragment: name.to_owned(),
                details: e.to_string(),
            })?;
        self.insert_boxed(entity, id, boxed)
    }

    pub fn remove_fragment_by_name(&mut self, entity: EntityHandle, name: &str) -> Result<(), EcsError> {
        let id = self
            .registry
            .lookup_by_name(name)
            .filter(|id| self.kind_of(*id) == Some(FragmentKind::PerEntity))
            .ok_or_else(|| self.unknown_fragment(name))?;
        self.remove_by_id(entity, id)
    }

    // -- shared fragments ---------------------------------------------------

    /// The shared instance of type `T` referenced by `entity`.
    pub fn shared<T: SharedFragment>(&self, entity: EntityHandle) -> Option<&T> {
        self.shared.get::<T>(self.shared_handle::<T>(entity)?)
    }

    /// Like [`shared`](Self::shared) but returns the instance's `Arc`.
    pub fn shared_arc<T: SharedFragment>(&self, entity: EntityHandle) -> Option<Arc<T>> {
        self.shared.get_arc::<T>(self.shared_handle::<T>(entity)?)
    }

    pub fn shared_handle<T: SharedFragment>(&self, entity: EntityHandle) -> Option<SharedFragmentHandle> {
        let loc = self.slots.location(entity)?;
        let id = self.registry.lookup::<T>()?;
        self.archetypes[loc.archetype.0 as usize]
            .shared()
            .iter()
            .copied()
            .find(|h| h.fragment() == id)
    }

    // -- internals ----------------------------------------------------------

    pub(crate) fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.0 as usize]
    }

    fn kind_of(&self, id: FragmentTypeId) -> Option<FragmentKind> {
        self.registry.info(id).map(|info| info.kind)
    }

    fn unknown_fragment(&self, name: &str) -> EcsError {
        EcsError::UnknownFragment {
            name: name.to_owned(),
            registered: self.registry.registered_names(),
        }
    }

    fn per_entity_id(&self, type_id: TypeId, type_name: &str) -> Result<FragmentTypeId, EcsError> {
        self.registry
            .lookup_type(type_id)
            .filter(|id| self.kind_of(*id) == Some(FragmentKind::PerEntity))
            .ok_or_else(|| self.unknown_fragment(type_name))
    }

    fn shared_fragment_id<T: 'static>(&self) -> Result<FragmentTypeId, EcsError> {
        self.registry
            .lookup::<T>()
            .filter(|id| self.kind_of(*id) == Some(FragmentKind::Shared))
            .ok_or_else(|| self.unknown_fragment(std::any::type_name::<T>()))
    }

    /// Find or create the archetype for `key`.
    fn archetype_for(&mut self, key: ArchetypeKey) -> Result<ArchetypeId, EcsError> {
        if let Some(&id) = self.archetype_index.get(&key) {
            return Ok(id);
        }
        let mut columns = Vec::with_capacity(key.fragments.len());
        for &fragment in &key.fragments {
            let info = self
                .registry
                .info(fragment)
                .ok_or_else(|| self.unknown_fragment(&format!("{fragment:?}")))?;
            let column = self
                .registry
                .new_column(fragment)
                .ok_or_else(|| self.unknown_fragment(&info.name))?;
            columns.push(ColumnSlot {
                fragment,
                type_id: info.type_id,
                column,
            });
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        debug!(archetype = ?id, fragments = ?key.fragments, shared = key.shared.len(), "new archetype");
        self.archetypes.push(Archetype::new(id, key.clone(), columns));
        self.archetype_index.insert(key, id);
        Ok(id)
    }

    fn insert_boxed(
        &mut self,
        entity: EntityHandle,
        fragment: FragmentTypeId,
        value: BoxedFragment,
    ) -> Result<(), EcsError> {
        let loc = self
            .slots
            .location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        let archetype = &mut self.archetypes[loc.archetype.0 as usize];
        if let Some(column) = archetype.column_index(fragment) {
            return archetype.replace(column, loc.row, value);
        }
        self.migrate(entity, loc, Some((fragment, value)), None)
    }

    fn remove_by_id(&mut self, entity: EntityHandle, fragment: FragmentTypeId) -> Result<(), EcsError> {
        let loc = self
            .slots
            .location(entity)
            .ok_or(EcsError::StaleEntity { entity })?;
        if !self.archetypes[loc.archetype.0 as usize].has_fragment(fragment) {
            return Ok(());
        }
        self.migrate(entity, loc, None, Some(fragment))
    }

    /// Move an entity to the archetype obtained by adding and/or removing one
    /// fragment type. Shared references are carried over unchanged.
    fn migrate(
        &mut self,
        entity: EntityHandle,
        loc: EntityLocation,
        add: Option<(FragmentTypeId, BoxedFragment)>,
        remove: Option<FragmentTypeId>,
    ) -> Result<(), EcsError> {
        let old_key = self.archetypes[loc.archetype.0 as usize].key().clone();
        let mut fragments: Vec<FragmentTypeId> = old_key
            .fragments
            .iter()
            .copied()
            .filter(|f| Some(*f) != remove)
            .collect();
        if let Some((id, _)) = &add {
            fragments.push(*id);
        }
        let target = self.archetype_for(ArchetypeKey::new(fragments, old_key.shared))?;

        let (mut values, moved) = self.archetypes[loc.archetype.0 as usize].take_row(loc.row);
        if let Some(moved) = moved {
            self.slots.relocate(moved, loc);
        }
        values.retain(|(id, _)| Some(*id) != remove);
        values.extend(add);
        values.sort_unstable_by_key(|(id, _)| *id);

        let destination = &mut self.archetypes[target.0 as usize];
        let row = destination.len();
        match destination.push_row(entity, values.into_iter().map(|(_, v)| v).collect()) {
            Ok(_) => {
                self.slots.relocate(
                    entity,
                    EntityLocation {
                        archetype: target,
                        row,
                    },
                );
                Ok(())
            }
            Err(e) => {
                // The row is gone from its old archetype; drop the entity
                // rather than leave a dangling location behind.
                self.slots.release(entity);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.slots.alive_count())
            .field("archetypes", &self.archetypes.len())
            .field("shared_instances", &self.shared.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
