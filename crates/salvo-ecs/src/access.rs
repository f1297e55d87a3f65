//! Declared fragment access.
//!
//! Every processor states up front which per-entity fragment types it reads
//! and which it writes. Two access sets conflict when one writes a type the
//! other reads or writes; the scheduler never places conflicting processors
//! in the same stage. Shared fragments are immutable during a tick and are
//! tracked only for diagnostics, never for conflicts.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;

use crate::fragment::{Fragment, SharedFragment};

/// How a processor may be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// May share a stage with non-conflicting processors; chunks run on the
    /// worker pool.
    #[default]
    Parallel,
    /// Runs alone in its stage, on the thread driving the pipeline, with
    /// chunks iterated sequentially.
    Exclusive,
}

/// Read/write sets over fragment types.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    reads: BTreeMap<TypeId, &'static str>,
    writes: BTreeMap<TypeId, &'static str>,
    shared: BTreeMap<TypeId, &'static str>,
}

impl AccessSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare read access to `T`. A type already declared writable stays
    /// writable.
    pub fn read<T: Fragment>(mut self) -> Self {
        self.add_read(TypeId::of::<T>(), std::any::type_name::<T>());
        self
    }

    /// Declare write access to `T` (implies read).
    pub fn write<T: Fragment>(mut self) -> Self {
        self.add_write(TypeId::of::<T>(), std::any::type_name::<T>());
        self
    }

    /// Declare use of the shared fragment `T`.
    pub fn shared<T: SharedFragment>(mut self) -> Self {
        self.shared
            .insert(TypeId::of::<T>(), std::any::type_name::<T>());
        self
    }

    pub(crate) fn add_read(&mut self, type_id: TypeId, name: &'static str) {
        if !self.writes.contains_key(&type_id) {
            self.reads.insert(type_id, name);
        }
    }

    pub(crate) fn add_write(&mut self, type_id: TypeId, name: &'static str) {
        self.reads.remove(&type_id);
        self.writes.insert(type_id, name);
    }

    pub(crate) fn add_shared(&mut self, type_id: TypeId, name: &'static str) {
        self.shared.insert(type_id, name);
    }

    /// Union of two access sets; write wins over read.
    pub fn merge(mut self, other: &AccessSet) -> Self {
        for (&t, &n) in &other.writes {
            self.add_write(t, n);
        }
        for (&t, &n) in &other.reads {
            self.add_read(t, n);
        }
        for (&t, &n) in &other.shared {
            self.shared.insert(t, n);
        }
        self
    }

    pub fn can_read(&self, type_id: TypeId) -> bool {
        self.reads.contains_key(&type_id) || self.writes.contains_key(&type_id)
    }

    pub fn can_write(&self, type_id: TypeId) -> bool {
        self.writes.contains_key(&type_id)
    }

    pub fn uses_shared(&self, type_id: TypeId) -> bool {
        self.shared.contains_key(&type_id)
    }

    /// Whether every access in `other` is granted by `self`.
    pub fn covers(&self, other: &AccessSet) -> bool {
        other.writes.keys().all(|t| self.can_write(*t))
            && other.reads.keys().all(|t| self.can_read(*t))
            && other.shared.keys().all(|t| self.uses_shared(*t))
    }

    /// W∩W, W∩R or R∩W on any per-entity fragment type.
    pub fn conflicts_with(&self, other: &AccessSet) -> bool {
        self.writes
            .keys()
            .any(|t| other.writes.contains_key(t) || other.reads.contains_key(t))
            || self.reads.keys().any(|t| other.writes.contains_key(t))
    }

    /// Names of the fragment types on which `self` and `other` conflict.
    pub fn conflicting_types(&self, other: &AccessSet) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .writes
            .iter()
            .filter(|(t, _)| other.writes.contains_key(*t) || other.reads.contains_key(*t))
            .chain(self.reads.iter().filter(|(t, _)| other.writes.contains_key(*t)))
            .map(|(_, n)| *n)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty() && self.shared.is_empty()
    }
}

impl fmt::Debug for AccessSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessSet")
            .field("reads", &self.reads.values().collect::<Vec<_>>())
            .field("writes", &self.writes.values().collect::<Vec<_>>())
            .field("shared", &self.shared.values().collect::<Vec<_>>())
            .finish()
    }
}
