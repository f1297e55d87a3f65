//! Value-deduplicated shared fragments.
//!
//! Shared fragments hold archetype-wide configuration (collision settings,
//! damage effect, gravity scale). They are immutable once created and
//! deduplicated by value: asking for a value that is already stored returns
//! the existing [`SharedFragmentHandle`], so identically configured entities
//! end up in the same archetype and reference the same instance.
//!
//! Values are compared by the BLAKE3 digest of their JSON encoding, keyed
//! together with the fragment type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::fragment::{FragmentTypeId, SharedFragment};
use crate::EcsError;

// ---------------------------------------------------------------------------
// SharedFragmentHandle
// ---------------------------------------------------------------------------

/// Identity of one stored shared fragment instance.
///
/// Two handles are equal exactly when they name the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedFragmentHandle {
    fragment: FragmentTypeId,
    index: u32,
}

impl SharedFragmentHandle {
    /// The fragment type this instance belongs to.
    pub fn fragment(self) -> FragmentTypeId {
        self.fragment
    }
}

// ---------------------------------------------------------------------------
// SharedFragmentStore
// ---------------------------------------------------------------------------

struct SharedEntry {
    type_id: TypeId,
    digest: blake3::Hash,
    value: Arc<dyn Any + Send + Sync>,
}

/// Append-only store of shared fragment instances.
#[derive(Default)]
pub struct SharedFragmentStore {
    entries: Vec<SharedEntry>,
    index: HashMap<(FragmentTypeId, blake3::Hash), u32>,
}

impl SharedFragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle of an instance equal to `value`, storing it first if
    /// no such instance exists yet.
    ///
    /// The caller is responsible for passing the id registered for `T`.
    pub fn get_or_create<T: SharedFragment>(
        &mut self,
        fragment: FragmentTypeId,
        value: T,
    ) -> Result<SharedFragmentHandle, EcsError> {
        let encoded =
            serde_json::to_vec(&value).map_err(|e| EcsError::SharedFragmentEncoding {
                fragment: std::any::type_name::<T>().to_owned(),
                details: e.to_string(),
            })?;
        let digest = blake3::hash(&encoded);

        if let Some(&index) = self.index.get(&(fragment, digest)) {
            return Ok(SharedFragmentHandle { fragment, index });
        }

        let index = self.entries.len() as u32;
        self.entries.push(SharedEntry {
            type_id: TypeId::of::<T>(),
            digest,
            value: Arc::new(value),
        });
        self.index.insert((fragment, digest), index);
        trace!(?fragment, index, "created shared fragment instance");
        Ok(SharedFragmentHandle { fragment, index })
    }

    /// Borrow a stored instance as `T`. `None` if the handle is unknown or
    /// stores a different type.
    pub fn get<T: 'static>(&self, handle: SharedFragmentHandle) -> Option<&T> {
        self.entries
            .get(handle.index as usize)?
            .value
            .downcast_ref::<T>()
    }

    /// Clone the `Arc` of a stored instance, for identity comparisons with
    /// [`Arc::ptr_eq`] or for holding the value past the borrow of the world.
    pub fn get_arc<T: Send + Sync + 'static>(&self, handle: SharedFragmentHandle) -> Option<Arc<T>> {
        let value = Arc::clone(&self.entries.get(handle.index as usize)?.value);
        value.downcast::<T>().ok()
    }

    pub(crate) fn get_erased(&self, handle: SharedFragmentHandle) -> Option<&(dyn Any + Send + Sync)> {
        self.entries
            .get(handle.index as usize)
            .map(|entry| &*entry.value)
    }

    /// Rust type stored behind `handle`.
    pub fn type_of(&self, handle: SharedFragmentHandle) -> Option<TypeId> {
        self.entries.get(handle.index as usize).map(|e| e.type_id)
    }

    /// Content digest of the stored value.
    pub fn digest(&self, handle: SharedFragmentHandle) -> Option<blake3::Hash> {
        self.entries.get(handle.index as usize).map(|e| e.digest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SharedFragmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFragmentStore")
            .field("instances", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
