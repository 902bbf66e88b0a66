//! Store Runtime
//!
//! The store is the central owner that connects atoms, filters and their
//! consumers. It holds:
//!
//! - the key registry (canonical atom and filter values),
//! - one channel table for atoms and one for filters,
//! - the per-key engine state of every atom and filter that was used,
//! - the tasks spawned for deferred work.
//!
//! # Lifetime
//!
//! There is no global store. A `Store` is constructed explicitly and every
//! accessor goes through it (usually through a [`Scope`] obtained from it).
//! Two stores share nothing unless they are given the same `HostStorage`,
//! which is how two browser tabs are modelled.
//!
//! Listeners that outlive a call (filter dependency listeners and cross-tab
//! storage listeners) hold the store weakly, so dropping the last `Store`
//! handle tears everything down.
//!
//! # Deferred Work
//!
//! Async defaults, hydration, async storage writes, deferred effect
//! outcomes and async filters run as tokio tasks on the ambient runtime.
//! [`Store::settled`] waits until no such task is left. Outside a tokio
//! runtime deferred work is dropped with a warning; synchronous atoms and
//! filters are unaffected.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::atom::{Atom, AtomCell};
use super::channel::Channels;
use super::filter::Filter;
use super::handle::{AtomHandle, FilterHandle};
use super::scope::Scope;
use crate::config::StoreConfig;
use crate::persist::{HostStorage, StorageProvider};
use crate::registry::{ErasedValue, QualifiedKey, Registry, StateType};

pub(crate) struct StoreInner {
    config: StoreConfig,
    registry: Registry,
    pub(crate) atom_channels: Channels,
    pub(crate) filter_channels: Channels,
    pub(crate) atom_cells: DashMap<QualifiedKey, Arc<AtomCell>>,
    /// Values are `FilterNode<T>` for the filter's value type.
    pub(crate) filter_nodes: DashMap<QualifiedKey, Arc<dyn Any + Send + Sync>>,
    default_storage: StorageProvider,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one state container. Clones share everything.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

/// Point-in-time dump of one scope, keyed by short name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub atoms: BTreeMap<String, serde_json::Value>,
    pub filters: BTreeMap<String, serde_json::Value>,
}

impl Store {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self::with_storage(config, StorageProvider::Noop)
    }

    /// Scopes default to this tab of the host's durable store.
    pub fn with_host(config: StoreConfig, host: &HostStorage) -> Self {
        Self::with_storage(config, StorageProvider::Host(host.tab()))
    }

    pub fn with_storage(config: StoreConfig, default_storage: StorageProvider) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                registry: Registry::new(),
                atom_channels: Channels::new(),
                filter_channels: Channels::new(),
                atom_cells: DashMap::new(),
                filter_nodes: DashMap::new(),
                default_storage,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<StoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn default_storage(&self) -> &StorageProvider {
        &self.inner.default_storage
    }

    /// The scope named by `StoreConfig::default_scope`.
    pub fn root(&self) -> Scope {
        Scope::new(
            self.clone(),
            self.inner.config.default_scope.as_deref(),
            self.inner.default_storage.clone(),
        )
    }

    pub fn scope(&self, name: &str) -> Scope {
        Scope::new(self.clone(), Some(name), self.inner.default_storage.clone())
    }

    pub fn use_atom<T: StateType>(&self, atom: &Atom<T>) -> AtomHandle<T> {
        self.root().use_atom(atom)
    }

    pub fn use_filter<T: StateType>(&self, filter: &Filter<T>) -> FilterHandle<T> {
        self.root().use_filter(filter)
    }

    /// Dump every atom and filter value of one scope (`None` = unscoped).
    pub fn snapshot(&self, scope: Option<&str>) -> Snapshot {
        let registry = self.registry();
        Snapshot {
            atoms: collect_scope(registry.atom_entries(), scope),
            filters: collect_scope(registry.filter_entries(), scope),
        }
    }

    pub fn read_atom_value(&self, key: &str, scope: Option<&str>) -> Option<serde_json::Value> {
        let key = QualifiedKey::new(scope, key);
        to_json(&key, self.registry().atom(&key)?)
    }

    pub fn read_filter_value(&self, key: &str, scope: Option<&str>) -> Option<serde_json::Value> {
        let key = QualifiedKey::new(scope, key);
        to_json(&key, self.registry().filter(&key)?)
    }

    pub fn atom_listener_count(&self, key: &QualifiedKey) -> usize {
        self.inner.atom_channels.listener_count(key)
    }

    pub fn filter_listener_count(&self, key: &QualifiedKey) -> usize {
        self.inner.filter_channels.listener_count(key)
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            warn!("no tokio runtime; deferred state work dropped");
            return;
        };
        let task = handle.spawn(future);

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Wait until all deferred work, including work spawned while waiting,
    /// has finished.
    pub async fn settled(&self) {
        loop {
            let pending = mem::take(&mut *self.inner.tasks.lock());
            if pending.is_empty() {
                return;
            }
            trace!(tasks = pending.len(), "waiting for deferred work");
            for task in pending {
                if let Err(err) = task.await {
                    warn!(error = %err, "deferred state task failed");
                }
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .field("atoms", &self.inner.atom_cells.len())
            .field("filters", &self.inner.filter_nodes.len())
            .field("storage", &self.inner.default_storage)
            .finish()
    }
}

fn collect_scope(
    entries: Vec<(QualifiedKey, ErasedValue)>,
    scope: Option<&str>,
) -> BTreeMap<String, serde_json::Value> {
    entries
        .into_iter()
        .filter(|(key, _)| key.in_scope(scope))
        .filter_map(|(key, value)| Some((key.name().to_string(), to_json(&key, value)?)))
        .collect()
}

fn to_json(key: &QualifiedKey, value: ErasedValue) -> Option<serde_json::Value> {
    match value.to_json() {
        Ok(json) => Some(json),
        Err(err) => {
            warn!(key = %key, error = %err, "value cannot be serialized for a snapshot");
            None
        }
    }
}
