//! Host storage
//!
//! Models the host environment's durable per-origin key-value store, shared
//! by every tab (every `Store`) of the same origin. Each tab talks to it
//! through its own `HostTab` handle.
//!
//! Writes made through one tab dispatch a `StorageEvent` to the listeners of
//! every *other* tab, and only when the stored text actually changed. The
//! writing tab never hears about its own writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::reactive::ListenerId;

/// A change made by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

type EventListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

#[derive(Default)]
struct HostInner {
    items: RwLock<HashMap<String, String>>,
    listeners: Mutex<Vec<(ListenerId, u64, EventListener)>>,
    next_tab: AtomicU64,
}

/// The shared host store. Cloning shares the same underlying items.
#[derive(Clone, Default)]
pub struct HostStorage {
    inner: Arc<HostInner>,
}

impl HostStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new tab onto this store.
    pub fn tab(&self) -> HostTab {
        HostTab {
            host: self.clone(),
            tab: self.inner.next_tab.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Read an item without going through a tab.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.inner.items.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dispatch(&self, from_tab: u64, event: StorageEvent) {
        let snapshot: SmallVec<[EventListener; 4]> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|(_, tab, _)| *tab != from_tab)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();

        tracing::trace!(key = %event.key, tabs = snapshot.len(), "dispatching storage event");
        for listener in snapshot {
            listener(&event);
        }
    }
}

/// One tab's view of the host store.
#[derive(Clone)]
pub struct HostTab {
    host: HostStorage,
    tab: u64,
}

impl HostTab {
    pub fn host(&self) -> &HostStorage {
        &self.host
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.host.peek(key)
    }

    pub fn set_item(&self, key: &str, value: &str) {
        let old_value = self
            .host
            .inner
            .items
            .write()
            .insert(key.to_string(), value.to_string());

        if old_value.as_deref() != Some(value) {
            self.host.dispatch(
                self.tab,
                StorageEvent {
                    key: key.to_string(),
                    old_value,
                    new_value: Some(value.to_string()),
                },
            );
        }
    }

    pub fn remove_item(&self, key: &str) {
        let old_value = self.host.inner.items.write().remove(key);
        if old_value.is_some() {
            self.host.dispatch(
                self.tab,
                StorageEvent {
                    key: key.to_string(),
                    old_value,
                    new_value: None,
                },
            );
        }
    }

    /// Listen for changes made by other tabs.
    ///
    /// The listener stays registered until the returned guard is dropped.
    pub fn on_storage<F>(&self, listener: F) -> StorageListener
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.host
            .inner
            .listeners
            .lock()
            .push((id, self.tab, Arc::new(listener)));
        StorageListener {
            host: self.host.clone(),
            id,
        }
    }

    /// Whether two handles belong to the same tab of the same host.
    pub fn same_tab(&self, other: &HostTab) -> bool {
        Arc::ptr_eq(&self.host.inner, &other.host.inner) && self.tab == other.tab
    }
}

/// Unregisters a storage listener when dropped.
pub struct StorageListener {
    host: HostStorage,
    id: ListenerId,
}

impl Drop for StorageListener {
    fn drop(&mut self) {
        self.host
            .inner
            .listeners
            .lock()
            .retain(|(id, _, _)| *id != self.id);
    }
}
