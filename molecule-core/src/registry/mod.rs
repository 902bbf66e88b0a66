//! Key Registry
//!
//! Maps qualified keys to canonical values, with separate tables for atoms
//! and filters. The registry is deliberately dumb: it stores, it never
//! evicts, and it never notifies. Notification belongs to the channels and
//! ordering belongs to the engines.
//!
//! Alongside the value tables it keeps:
//!
//! - which keys were seeded by a scope before any consumer mounted, and
//! - how many asynchronous default resolutions are in flight per key.
//!
//! Every accessor clones out of the map before returning, so no shard lock
//! is ever held while engine or user code runs.

mod key;
mod value;

pub use key::QualifiedKey;
pub use value::{ErasedValue, StateType};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

#[derive(Default)]
pub struct Registry {
    atoms: DashMap<QualifiedKey, ErasedValue>,
    filters: DashMap<QualifiedKey, ErasedValue>,
    seeded_atoms: DashSet<QualifiedKey>,
    seeded_filters: DashSet<QualifiedKey>,
    pending: DashMap<QualifiedKey, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Atoms
    // ------------------------------------------------------------------

    pub fn atom(&self, key: &QualifiedKey) -> Option<ErasedValue> {
        self.atoms.get(key).map(|entry| entry.value().clone())
    }

    pub fn has_atom(&self, key: &QualifiedKey) -> bool {
        self.atoms.contains_key(key)
    }

    pub fn set_atom(&self, key: QualifiedKey, value: ErasedValue) {
        self.atoms.insert(key, value);
    }

    /// Store `value` only if the key has no canonical value yet.
    ///
    /// Returns whether the value was stored.
    pub fn set_atom_if_absent(&self, key: QualifiedKey, value: ErasedValue) -> bool {
        insert_if_absent(&self.atoms, key, value)
    }

    /// Seed an atom from a scope. Never overwrites an existing value.
    pub fn seed_atom(&self, key: QualifiedKey, value: ErasedValue) -> bool {
        let stored = insert_if_absent(&self.atoms, key.clone(), value);
        if stored {
            self.seeded_atoms.insert(key);
        }
        stored
    }

    pub fn is_seeded_atom(&self, key: &QualifiedKey) -> bool {
        self.seeded_atoms.contains(key)
    }

    pub fn atom_entries(&self) -> Vec<(QualifiedKey, ErasedValue)> {
        self.atoms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    pub fn filter(&self, key: &QualifiedKey) -> Option<ErasedValue> {
        self.filters.get(key).map(|entry| entry.value().clone())
    }

    pub fn has_filter(&self, key: &QualifiedKey) -> bool {
        self.filters.contains_key(key)
    }

    /// Replace a filter's cached value. `None` marks it pending.
    pub fn set_filter(&self, key: QualifiedKey, value: Option<ErasedValue>) {
        match value {
            Some(value) => {
                self.filters.insert(key, value);
            }
            None => {
                self.filters.remove(&key);
            }
        }
    }

    pub fn seed_filter(&self, key: QualifiedKey, value: ErasedValue) -> bool {
        let stored = insert_if_absent(&self.filters, key.clone(), value);
        if stored {
            self.seeded_filters.insert(key);
        }
        stored
    }

    pub fn is_seeded_filter(&self, key: &QualifiedKey) -> bool {
        self.seeded_filters.contains(key)
    }

    pub fn filter_entries(&self) -> Vec<(QualifiedKey, ErasedValue)> {
        self.filters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Pending async resolutions
    // ------------------------------------------------------------------

    /// Register an async resolution for `key`.
    ///
    /// Returns `true` only for the first caller while nothing is pending;
    /// later callers must reuse the value that resolution publishes.
    pub fn begin_pending(&self, key: &QualifiedKey) -> bool {
        let mut count = self.pending.entry(key.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn finish_pending(&self, key: &QualifiedKey) {
        if let Some(mut count) = self.pending.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn pending_count(&self, key: &QualifiedKey) -> usize {
        self.pending.get(key).map(|count| *count).unwrap_or(0)
    }
}

fn insert_if_absent(
    map: &DashMap<QualifiedKey, ErasedValue>,
    key: QualifiedKey,
    value: ErasedValue,
) -> bool {
    match map.entry(key) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(value);
            true
        }
    }
}
