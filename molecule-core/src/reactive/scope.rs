//! Scoping
//!
//! A [`Scope`] is a store name plus the persistence provider its consumers
//! use. The name prefixes every short name resolved through the scope, so
//! the same declaration mounted under two scopes yields two independent
//! canonical values.

use std::fmt;
use std::sync::Arc;

use super::atom::{drive_storage_op, Actions, Atom, Writer};
use super::filter::Filter;
use super::handle::{AtomHandle, FilterHandle};
use super::runtime::Store;
use super::subscriber::OriginTag;
use crate::persist::StorageProvider;
use crate::registry::{ErasedValue, QualifiedKey, StateType};

#[derive(Clone)]
pub struct Scope {
    store: Store,
    name: Option<Arc<str>>,
    storage: StorageProvider,
}

impl Scope {
    pub(crate) fn new(store: Store, name: Option<&str>, storage: StorageProvider) -> Self {
        Self {
            store,
            name: name.filter(|name| !name.is_empty()).map(Arc::from),
            storage,
        }
    }

    pub(crate) fn from_parts(
        store: Store,
        name: Option<Arc<str>>,
        storage: StorageProvider,
    ) -> Self {
        Self {
            store,
            name,
            storage,
        }
    }

    /// Everything but the store, for listeners that hold the store weakly.
    pub(crate) fn parts(&self) -> (Option<Arc<str>>, StorageProvider) {
        (self.name.clone(), self.storage.clone())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn storage(&self) -> &StorageProvider {
        &self.storage
    }

    /// Same scope, different persistence provider.
    pub fn with_storage(mut self, storage: StorageProvider) -> Self {
        self.storage = storage;
        self
    }

    pub fn qualify(&self, name: &str) -> QualifiedKey {
        QualifiedKey::from_parts(self.name.clone(), name)
    }

    /// Provide an initial value for `name` before anything mounts it.
    ///
    /// Never replaces an existing canonical value. Returns whether the seed
    /// was applied.
    pub fn seed_atom<T: StateType>(&self, name: &str, value: T) -> bool {
        self.store
            .registry()
            .seed_atom(self.qualify(name), ErasedValue::new(value))
    }

    pub fn seed_filter<T: StateType>(&self, name: &str, value: T) -> bool {
        self.store
            .registry()
            .seed_filter(self.qualify(name), ErasedValue::new(value))
    }

    /// Seed several atoms of one type at once.
    pub fn seed_atoms<T, I, K>(&self, values: I) -> usize
    where
        T: StateType,
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
    {
        values
            .into_iter()
            .filter(|(name, value)| self.seed_atom(name.as_ref(), value.clone()))
            .count()
    }

    pub fn use_atom<T: StateType>(&self, atom: &Atom<T>) -> AtomHandle<T> {
        AtomHandle::mount(self, atom)
    }

    pub fn use_filter<T: StateType>(&self, filter: &Filter<T>) -> FilterHandle<T> {
        FilterHandle::mount(self, filter)
    }

    /// A writer not attached to any consumer.
    pub fn writer<T: StateType>(&self, atom: &Atom<T>) -> Writer<T> {
        Writer::new(self, atom, OriginTag::new(), None)
    }

    pub fn actions<T: StateType>(&self, atom: &Atom<T>) -> Actions<T> {
        Actions::new(self.writer(atom))
    }

    /// Canonical value of `atom` in this scope, without mounting it.
    pub fn atom_value<T: StateType>(&self, atom: &Atom<T>) -> Option<T> {
        self.store
            .registry()
            .atom(&self.qualify(atom.key()))
            .and_then(|value| value.downcast())
    }

    /// Cached value of `filter` in this scope, without evaluating it.
    pub fn filter_value<T: StateType>(&self, filter: &Filter<T>) -> Option<T> {
        self.store
            .registry()
            .filter(&self.qualify(filter.key()))
            .and_then(|value| value.downcast())
    }

    /// Delete the persisted copy of `atom`; the in-memory value is kept.
    pub fn remove_persisted<T: StateType>(&self, atom: &Atom<T>) {
        let key = self.qualify(atom.key());
        let op = self.storage.remove_item(&key.storage_key());
        drive_storage_op(&self.store, &key, op);
    }

    /// Deferred effect vetoes that arrived after their write had committed.
    /// Zero for an atom never used in this scope.
    pub fn late_vetoes<T: StateType>(&self, atom: &Atom<T>) -> usize {
        self.store
            .inner
            .atom_cells
            .get(&self.qualify(atom.key()))
            .map_or(0, |cell| cell.late_vetoes())
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_short_name_is_independent_per_scope() {
        let store = Store::new();
        let count = Atom::new("count", 0);
        let a = store.scope("A");
        let b = store.scope("B");

        a.writer(&count).set(7);
        b.use_atom(&count);
        assert_eq!(a.atom_value(&count), Some(7));
        assert_eq!(b.atom_value(&count), Some(0));
        assert_eq!(a.qualify("count").to_string(), "A-count");
    }

    #[test]
    fn seeds_apply_only_to_absent_keys() {
        let store = Store::new();
        let scope = store.scope("page");
        let title = Atom::new("title", String::from("untitled"));

        assert!(scope.seed_atom("title", String::from("from server")));
        assert_eq!(scope.use_atom(&title).get().as_deref(), Some("from server"));
        assert!(!scope.seed_atom("title", String::from("too late")));
        assert_eq!(scope.atom_value(&title).as_deref(), Some("from server"));
    }

    #[test]
    fn bulk_seeding_counts_applied_entries() {
        let store = Store::new();
        let scope = store.root();
        scope.seed_atom("a", 1);
        assert_eq!(scope.seed_atoms([("a", 10), ("b", 20)]), 1);
    }

    #[test]
    fn diagnostics_do_not_create_atoms() {
        let store = Store::new();
        let scope = store.root();
        let count = Atom::new("count", 4);

        assert_eq!(scope.late_vetoes(&count), 0);
        assert_eq!(scope.atom_value(&count), None);
        assert!(store.inner.atom_cells.get(&scope.qualify("count")).is_none());
    }

    #[test]
    fn empty_scope_names_are_unscoped() {
        let store = Store::new();
        assert_eq!(store.scope("").name(), None);
        assert_eq!(store.scope("").qualify("x"), QualifiedKey::new(None, "x"));
    }
}
