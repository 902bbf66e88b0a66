//! Ready-made storage shapes.
//!
//! `MemoryStorage` is a plain synchronous in-memory store. `FnStorage` and
//! `AsyncFnStorage` adapt closures, which is how providers whose methods are
//! named differently (`get`/`set`/`delete`, `getItemAsync`, ...) are brought
//! into the canonical get/set/remove trio.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use super::{AsyncStorage, SyncStorage};
use crate::error::Result;

/// Synchronous in-memory storage. Clones share the same items.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    items: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing items.
    pub fn with_items<I, K, V>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let items = items
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            items: Arc::new(RwLock::new(items)),
        }
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }
}

impl SyncStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.peek(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.write().remove(key);
        Ok(())
    }
}

type GetFn = Arc<dyn Fn(&str) -> Result<Option<String>> + Send + Sync>;
type SetFn = Arc<dyn Fn(&str, &str) -> Result<()> + Send + Sync>;
type RemoveFn = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Synchronous provider assembled from three closures.
pub struct FnStorage {
    get: GetFn,
    set: SetFn,
    remove: RemoveFn,
}

impl FnStorage {
    pub fn new<G, S, R>(get: G, set: S, remove: R) -> Self
    where
        G: Fn(&str) -> Result<Option<String>> + Send + Sync + 'static,
        S: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
        R: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
            remove: Arc::new(remove),
        }
    }
}

impl SyncStorage for FnStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        (self.get)(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        (self.set)(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        (self.remove)(key)
    }
}

type AsyncGetFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;
type AsyncSetFn = Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type AsyncRemoveFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Asynchronous provider assembled from three future-returning closures.
pub struct AsyncFnStorage {
    get: AsyncGetFn,
    set: AsyncSetFn,
    remove: AsyncRemoveFn,
}

impl AsyncFnStorage {
    pub fn new<G, S, R>(get: G, set: S, remove: R) -> Self
    where
        G: Fn(String) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync + 'static,
        S: Fn(String, String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
        R: Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
            remove: Arc::new(remove),
        }
    }
}

impl AsyncStorage for AsyncFnStorage {
    fn get_item(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>> {
        (self.get)(key.to_string())
    }

    fn set_item(&self, key: &str, value: String) -> BoxFuture<'static, Result<()>> {
        (self.set)(key.to_string(), value)
    }

    fn remove_item(&self, key: &str) -> BoxFuture<'static, Result<()>> {
        (self.remove)(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;

    #[test]
    fn memory_storage_round_trips_text() {
        let storage = MemoryStorage::new();
        storage.set_item("k", "{\"x\":1}").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("{\"x\":1}"));

        storage.remove_item("k").unwrap();
        assert_eq!(storage.get_item("k").unwrap(), None);
    }

    #[test]
    fn clones_share_items() {
        let storage = MemoryStorage::with_items([("a", "1")]);
        let clone = storage.clone();
        clone.set_item("b", "2").unwrap();
        assert_eq!(storage.peek("a").as_deref(), Some("1"));
        assert_eq!(storage.peek("b").as_deref(), Some("2"));
    }

    #[test]
    fn fn_storage_forwards_to_closures() {
        let backing = MemoryStorage::new();
        let (get_backing, set_backing) = (backing.clone(), backing.clone());
        let storage = FnStorage::new(
            move |key| Ok(get_backing.peek(key)),
            move |key, value| set_backing.set_item(key, value),
            |_| Err(StateError::storage("read-only")),
        );

        storage.set_item("k", "v").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("v"));
        assert!(storage.remove_item("k").is_err());
    }
}
