//! Archetype storage.
//!
//! An [`Archetype`] stores every entity that has exactly the same set of
//! per-entity fragment types *and* references the same shared fragment
//! instances. Storage is Structure-of-Arrays: one typed column per fragment
//! plus a parallel `Vec<EntityHandle>` mapping row to entity. All columns and
//! the entity vector always have the same length.
//!
//! # Safety
//!
//! Columns keep their `Vec<T>` inside an [`UnsafeCell`] so that a scheduled
//! processor can write fragment rows while only holding `&World`. The
//! invariant that makes this sound is upheld by the scheduler and the query
//! layer: while a processor holds write access to fragment `T`, no other
//! processor in the same stage reads or writes `T`, and each row is handed to
//! exactly one chunk. Every other path mutates columns through `&mut self`.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::any::{Any, TypeId};
use std::cell::UnsafeCell;

use crate::entity::EntityHandle;
use crate::fragment::{BoxedFragment, Fragment, FragmentTypeId};
use crate::shared::SharedFragmentHandle;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId / ArchetypeKey
// ---------------------------------------------------------------------------

/// Identifies an archetype within the world. Indices into `World::archetypes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

/// The identity of an archetype: sorted fragment ids plus sorted shared
/// fragment handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ArchetypeKey {
    pub fragments: Vec<FragmentTypeId>,
    pub shared: Vec<SharedFragmentHandle>,
}

impl ArchetypeKey {
    pub fn new(mut fragments: Vec<FragmentTypeId>, mut shared: Vec<SharedFragmentHandle>) -> Self {
        fragments.sort_unstable();
        fragments.dedup();
        shared.sort_unstable();
        shared.dedup();
        Self { fragments, shared }
    }
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

/// Type-erased operations on one fragment column.
pub(crate) trait ErasedColumn: Send + Sync {
    fn len(&self) -> usize;

    fn push_boxed(&mut self, value: BoxedFragment) -> Result<(), BoxedFragment>;

    fn replace_boxed(&mut self, row: usize, value: BoxedFragment) -> Result<(), BoxedFragment>;

    /// Swap-remove `row`, dropping the value.
    fn swap_remove(&mut self, row: usize);

    /// Swap-remove `row`, handing the value back for migration.
    fn swap_remove_boxed(&mut self, row: usize) -> BoxedFragment;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Pointer to the first element, for read-only chunk views.
    fn base_ptr(&self) -> *const u8;

    /// Pointer to the first element, for writable chunk views.
    ///
    /// # Safety
    ///
    /// The caller must hold exclusive access to this column for as long as
    /// the pointer (or anything derived from it) is used: no other reference
    /// to the column's contents may exist concurrently.
    unsafe fn base_ptr_mut(&self) -> *mut u8;
}

/// Densely packed storage for one fragment type.
pub(crate) struct TypedColumn<T> {
    data: UnsafeCell<Vec<T>>,
}

// SAFETY: shared access to the cell's contents from several threads only
// happens through chunk views planned by the query layer, which never hands
// the same rows of a written column to two threads and never mixes a writer
// with readers (see the module docs).
unsafe impl<T: Send + Sync> Sync for TypedColumn<T> {}

impl<T: Fragment> TypedColumn<T> {
    pub(crate) fn new() -> Self {
        Self {
            data: UnsafeCell::new(Vec::new()),
        }
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: writers reach the cell only through `&mut self` or through
        // scheduled chunk views, neither of which can coexist with `&self`
        // readers of the same column (see the module docs).
        unsafe { &*self.data.get() }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        self.data.get_mut()
    }
}

impl<T: Fragment> ErasedColumn for TypedColumn<T> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn push_boxed(&mut self, value: BoxedFragment) -> Result<(), BoxedFragment> {
        let value = value.downcast::<T>()?;
        self.data.get_mut().push(*value);
        Ok(())
    }

    fn replace_boxed(&mut self, row: usize, value: BoxedFragment) -> Result<(), BoxedFragment> {
        let value = value.downcast::<T>()?;
        match self.data.get_mut().get_mut(row) {
            Some(slot) => {
                *slot = *value;
                Ok(())
            }
            None => Err(value as BoxedFragment),
        }
    }

    fn swap_remove(&mut self, row: usize) {
        self.data.get_mut().swap_remove(row);
    }

    fn swap_remove_boxed(&mut self, row: usize) -> BoxedFragment {
        Box::new(self.data.get_mut().swap_remove(row))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn base_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr() as *const u8
    }

    unsafe fn base_ptr_mut(&self) -> *mut u8 {
        // SAFETY: exclusivity is the caller's contract.
        (*self.data.get()).as_mut_ptr() as *mut u8
    }
}

pub(crate) struct ColumnSlot {
    pub(crate) fragment: FragmentTypeId,
    pub(crate) type_id: TypeId,
    pub(crate) column: Box<dyn ErasedColumn>,
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All entities sharing one [`ArchetypeKey`].
pub struct Archetype {
    id: ArchetypeId,
    key: ArchetypeKey,
    /// Sorted by fragment id, matching `key.fragments`.
    columns: Vec<ColumnSlot>,
    entities: Vec<EntityHandle>,
}

impl Archetype {
    /// `columns` must be in `key.fragments` order.
    pub(crate) fn new(id: ArchetypeId, key: ArchetypeKey, columns: Vec<ColumnSlot>) -> Self {
        debug_assert!(columns
            .iter()
            .map(|c| c.fragment)
            .eq(key.fragments.iter().copied()));
        Self {
            id,
            key,
            columns,
            entities: Vec::new(),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn key(&self) -> &ArchetypeKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entity handles in row order.
    pub fn entities(&self) -> &[EntityHandle] {
        &self.entities
    }

    pub fn shared(&self) -> &[SharedFragmentHandle] {
        &self.key.shared
    }

    pub fn has_fragment(&self, fragment: FragmentTypeId) -> bool {
        self.column_index(fragment).is_some()
    }

    pub(crate) fn column_index(&self, fragment: FragmentTypeId) -> Option<usize> {
        self.columns
            .binary_search_by_key(&fragment, |c| c.fragment)
            .ok()
    }

    pub(crate) fn column_by_type(&self, type_id: TypeId) -> Option<&ColumnSlot> {
        self.columns.iter().find(|c| c.type_id == type_id)
    }

    /// Typed read of one row.
    pub(crate) fn get<T: Fragment>(&self, column: usize, row: usize) -> Option<&T> {
        self.columns
            .get(column)?
            .column
            .as_any()
            .downcast_ref::<TypedColumn<T>>()?
            .as_slice()
            .get(row)
    }

    pub(crate) fn get_mut<T: Fragment>(&mut self, column: usize, row: usize) -> Option<&mut T> {
        self.columns
            .get_mut(column)?
            .column
            .as_any_mut()
            .downcast_mut::<TypedColumn<T>>()?
            .as_mut_slice()
            .get_mut(row)
    }

    /// Append a row. `values` must be aligned with the column order.
    ///
    /// Types are checked before anything is pushed, so a mismatch leaves the
    /// archetype untouched.
    pub(crate) fn push_row(
        &mut self,
        entity: EntityHandle,
        values: Vec<BoxedFragment>,
    ) -> Result<usize, EcsError> {
        if values.len() != self.columns.len() {
            return Err(EcsError::FragmentTypeMismatch {
                archetype: self.id,
                details: format!(
                    "expected {} fragment values, got {}",
                    self.columns.len(),
                    values.len()
                ),
            });
        }
        for (slot, value) in self.columns.iter().zip(&values) {
            if Any::type_id(&**value) != slot.type_id {
                return Err(EcsError::FragmentTypeMismatch {
                    archetype: self.id,
                    details: format!("value for {:?} has the wrong type", slot.fragment),
                });
            }
        }
        for (slot, value) in self.columns.iter_mut().zip(values) {
            if slot.column.push_boxed(value).is_err() {
                return Err(EcsError::FragmentTypeMismatch {
                    archetype: self.id,
                    details: format!("column {:?} rejected its value", slot.fragment),
                });
            }
        }
        self.entities.push(entity);
        Ok(self.entities.len() - 1)
    }

    /// Overwrite one fragment of a row with a boxed value.
    pub(crate) fn replace(
        &mut self,
        column: usize,
        row: usize,
        value: BoxedFragment,
    ) -> Result<(), EcsError> {
        let id = self.id;
        let slot = self
            .columns
            .get_mut(column)
            .ok_or_else(|| EcsError::FragmentTypeMismatch {
                archetype: id,
                details: format!("no column at index {column}"),
            })?;
        slot.column
            .replace_boxed(row, value)
            .map_err(|_| EcsError::FragmentTypeMismatch {
                archetype: id,
                details: format!("could not replace {:?} at row {row}", slot.fragment),
            })
    }

    /// Swap-remove a row, dropping its values.
    ///
    /// Returns the entity that was moved into `row`, if any, so the caller can
    /// fix up its recorded location.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<EntityHandle> {
        for slot in &mut self.columns {
            slot.column.swap_remove(row);
        }
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    /// Swap-remove a row and hand back its values (column order) for
    /// migration into another archetype.
    pub(crate) fn take_row(
        &mut self,
        row: usize,
    ) -> (Vec<(FragmentTypeId, BoxedFragment)>, Option<EntityHandle>) {
        let values = self
            .columns
            .iter_mut()
            .map(|slot| (slot.fragment, slot.column.swap_remove_boxed(row)))
            .collect();
        self.entities.swap_remove(row);
        (values, self.entities.get(row).copied())
    }

    /// Debug check that every column is as long as the entity list.
    pub fn is_consistent(&self) -> bool {
        self.columns
            .iter()
            .all(|slot| slot.column.len() == self.entities.len())
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("len", &self.entities.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
