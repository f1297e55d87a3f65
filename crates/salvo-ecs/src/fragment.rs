//! Fragment type registration and metadata.
//!
//! Every fragment type must be registered with a [`FragmentRegistry`] before
//! it can be stored. Registration assigns a dense [`FragmentTypeId`] (used to
//! key archetype columns) and records how to build an empty column and how
//! to decode a JSON value for the command buffer's by-name mutations.
//!
//! Fragments come in two kinds:
//!
//! - **per-entity** fragments live in one column per archetype, one value
//!   per row;
//! - **shared** fragments are stored once in the
//!   [`SharedFragmentStore`](crate::shared::SharedFragmentStore) and
//!   referenced by every entity of an archetype.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::archetype::{ErasedColumn, TypedColumn};

// ---------------------------------------------------------------------------
// Fragment traits
// ---------------------------------------------------------------------------

/// A per-entity data record.
///
/// Blanket-implemented for every type that meets the bounds; there is nothing
/// to derive.
pub trait Fragment: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Fragment for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// An archetype-wide, immutable data record.
///
/// `Serialize` is required because deduplication hashes the encoded value.
pub trait SharedFragment: Send + Sync + Serialize + 'static {}

impl<T> SharedFragment for T where T: Send + Sync + Serialize + 'static {}

/// A type-erased fragment value in flight between columns.
pub(crate) type BoxedFragment = Box<dyn Any + Send>;

// ---------------------------------------------------------------------------
// FragmentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered fragment type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentTypeId(pub(crate) u32);

impl fmt::Debug for FragmentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FragmentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// FragmentInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    PerEntity,
    Shared,
}

/// Metadata about a registered fragment type.
#[derive(Debug, Clone)]
pub struct FragmentInfo {
    pub id: FragmentTypeId,
    /// Name supplied at registration; the command buffer addresses fragments
    /// by this name.
    pub name: String,
    pub kind: FragmentKind,
    pub type_id: TypeId,
    pub type_name: &'static str,
}

/// Monomorphised column operations for a per-entity fragment type.
#[derive(Clone, Copy)]
struct ColumnOps {
    new_column: fn() -> Box<dyn ErasedColumn>,
    decode: fn(&serde_json::Value) -> Result<BoxedFragment, serde_json::Error>,
}

fn new_column<T: Fragment>() -> Box<dyn ErasedColumn> {
    Box::new(TypedColumn::<T>::new())
}

fn decode<T: Fragment>(value: &serde_json::Value) -> Result<BoxedFragment, serde_json::Error> {
    T::deserialize(value).map(|v| Box::new(v) as BoxedFragment)
}

struct Registration {
    info: FragmentInfo,
    ops: Option<ColumnOps>,
}

// ---------------------------------------------------------------------------
// FragmentRegistry
// ---------------------------------------------------------------------------

/// Maps Rust types and names to [`FragmentTypeId`]s.
///
/// A type is registered at most once; registering it again returns the
/// existing id and ignores the new name.
#[derive(Default)]
pub struct FragmentRegistry {
    by_type: HashMap<TypeId, FragmentTypeId>,
    by_name: HashMap<String, FragmentTypeId>,
    /// Indexed by `FragmentTypeId.0`.
    entries: Vec<Registration>,
}

impl FragmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-entity fragment type under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already used by a different type.
    pub fn register<T: Fragment>(&mut self, name: &str) -> FragmentTypeId {
        self.insert::<T>(
            name,
            FragmentKind::PerEntity,
            Some(ColumnOps {
                new_column: new_column::<T>,
                decode: decode::<T>,
            }),
        )
    }

    /// Register a shared fragment type under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already used by a different type.
    pub fn register_shared<T: SharedFragment>(&mut self, name: &str) -> FragmentTypeId {
        self.insert::<T>(name, FragmentKind::Shared, None)
    }

    fn insert<T: 'static>(
        &mut self,
        name: &str,
        kind: FragmentKind,
        ops: Option<ColumnOps>,
    ) -> FragmentTypeId {
        let type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&type_id) {
            return existing;
        }
        assert!(
            !self.by_name.contains_key(name),
            "fragment name '{name}' is already registered for a different type"
        );

        let id = FragmentTypeId(self.entries.len() as u32);
        self.entries.push(Registration {
            info: FragmentInfo {
                id,
                name: name.to_owned(),
                kind,
                type_id,
                type_name: std::any::type_name::<T>(),
            },
            ops,
        });
        self.by_type.insert(type_id, id);
        self.by_name.insert(name.to_owned(), id);
        id
    }

    /// Id of a registered Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<FragmentTypeId> {
        self.lookup_type(TypeId::of::<T>())
    }

    pub fn lookup_type(&self, type_id: TypeId) -> Option<FragmentTypeId> {
        self.by_type.get(&type_id).copied()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<FragmentTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn info(&self, id: FragmentTypeId) -> Option<&FragmentInfo> {
        self.entries.get(id.0 as usize).map(|r| &r.info)
    }

    /// Sorted, comma-separated list of registered names (for error messages).
    pub fn registered_names(&self) -> String {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build an empty column for a per-entity fragment type.
    pub(crate) fn new_column(&self, id: FragmentTypeId) -> Option<Box<dyn ErasedColumn>> {
        let ops = self.entries.get(id.0 as usize)?.ops?;
        Some((ops.new_column)())
    }

    /// Decode a JSON value into a boxed per-entity fragment.
    ///
    /// Returns `None` for shared or unknown fragment types.
    pub(crate) fn decode(
        &self,
        id: FragmentTypeId,
        value: &serde_json::Value,
    ) -> Option<Result<BoxedFragment, serde_json::Error>> {
        let ops = self.entries.get(id.0 as usize)?.ops?;
        Some((ops.decode)(value))
    }
}

impl fmt::Debug for FragmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentRegistry")
            .field("registered", &self.registered_names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Speed(f32);

    #[derive(Debug, serde::Serialize)]
    struct Tuning {
        radius: f32,
    }

    #[test]
    fn register_is_idempotent_per_type() {
        let mut reg = FragmentRegistry::new();
        let a = reg.register::<Speed>("speed");
        let b = reg.register::<Speed>("speed_again");
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup_by_name("speed"), Some(a));
        assert_eq!(reg.lookup_by_name("speed_again"), None);
    }

    #[test]
    fn shared_fragments_have_no_column_ops() {
        let mut reg = FragmentRegistry::new();
        let id = reg.register_shared::<Tuning>("tuning");
        assert_eq!(reg.info(id).map(|i| i.kind), Some(FragmentKind::Shared));
        assert!(reg.new_column(id).is_none());
        assert!(reg.decode(id, &serde_json::json!({"radius": 1.0})).is_none());
    }

    #[test]
    fn decode_produces_typed_value() {
        let mut reg = FragmentRegistry::new();
        let id = reg.register::<Speed>("speed");
        let boxed = reg
            .decode(id, &serde_json::json!(3.5))
            .expect("per-entity fragment")
            .expect("valid json");
        assert_eq!(boxed.downcast_ref::<Speed>(), Some(&Speed(3.5)));

        let bad = reg.decode(id, &serde_json::json!("fast")).expect("registered");
        assert!(bad.is_err());
    }

    #[test]
    #[should_panic(expected = "already registered for a different type")]
    fn name_collision_panics() {
        let mut reg = FragmentRegistry::new();
        reg.register::<Speed>("value");
        reg.register::<u32>("value");
    }

    #[test]
    fn registered_names_are_sorted() {
        let mut reg = FragmentRegistry::new();
        reg.register::<u32>("zeta");
        reg.register::<Speed>("alpha");
        assert_eq!(reg.registered_names(), "alpha, zeta");
        assert_eq!(reg.lookup::<u64>(), None);
    }
}
