//! Persistence Bridge
//!
//! The engine never talks to a concrete store. It talks to a
//! `StorageProvider`, the normalized capability every provider shape is
//! folded into:
//!
//! - `Host` - the host's own per-origin store (see [`HostStorage`]). Only
//!   this variant receives cross-tab storage events.
//! - `Sync` - anything implementing [`SyncStorage`].
//! - `Async` - anything implementing [`AsyncStorage`].
//! - `Noop` - the stub used when nothing durable is available.
//!
//! Reads are always awaited (hydration runs as deferred work anyway).
//! Writes complete in place for synchronous providers and come back as a
//! future for asynchronous ones, so the caller decides where to drive it.

mod host;
mod memory;

pub use host::{HostStorage, HostTab, StorageEvent, StorageListener};
pub use memory::{AsyncFnStorage, FnStorage, MemoryStorage};

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::Result;

/// A provider whose operations complete immediately.
pub trait SyncStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// A provider whose operations complete later.
pub trait AsyncStorage: Send + Sync {
    fn get_item(&self, key: &str) -> BoxFuture<'static, Result<Option<String>>>;
    fn set_item(&self, key: &str, value: String) -> BoxFuture<'static, Result<()>>;
    fn remove_item(&self, key: &str) -> BoxFuture<'static, Result<()>>;
}

/// Result of a write or remove.
pub enum StorageOp {
    Done(Result<()>),
    Pending(BoxFuture<'static, Result<()>>),
}

#[derive(Clone, Default)]
pub enum StorageProvider {
    Host(HostTab),
    Sync(Arc<dyn SyncStorage>),
    Async(Arc<dyn AsyncStorage>),
    #[default]
    Noop,
}

impl StorageProvider {
    pub fn sync(storage: impl SyncStorage + 'static) -> Self {
        Self::Sync(Arc::new(storage))
    }

    pub fn from_async(storage: impl AsyncStorage + 'static) -> Self {
        Self::Async(Arc::new(storage))
    }

    /// Normalize a closure-shaped synchronous provider.
    pub fn from_fns<G, S, R>(get: G, set: S, remove: R) -> Self
    where
        G: Fn(&str) -> Result<Option<String>> + Send + Sync + 'static,
        S: Fn(&str, &str) -> Result<()> + Send + Sync + 'static,
        R: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        Self::sync(FnStorage::new(get, set, remove))
    }

    /// Normalize a closure-shaped asynchronous provider.
    pub fn from_async_fns<G, S, R>(get: G, set: S, remove: R) -> Self
    where
        G: Fn(String) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync + 'static,
        S: Fn(String, String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
        R: Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self::from_async(AsyncFnStorage::new(get, set, remove))
    }

    pub fn host_tab(&self) -> Option<&HostTab> {
        match self {
            Self::Host(tab) => Some(tab),
            _ => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }

    pub async fn get_item(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Host(tab) => Ok(tab.get_item(key)),
            Self::Sync(storage) => storage.get_item(key),
            Self::Async(storage) => storage.get_item(key).await,
            Self::Noop => Ok(None),
        }
    }

    pub fn set_item(&self, key: &str, value: String) -> StorageOp {
        match self {
            Self::Host(tab) => {
                tab.set_item(key, &value);
                StorageOp::Done(Ok(()))
            }
            Self::Sync(storage) => StorageOp::Done(storage.set_item(key, &value)),
            Self::Async(storage) => StorageOp::Pending(storage.set_item(key, value)),
            Self::Noop => StorageOp::Done(Ok(())),
        }
    }

    pub fn remove_item(&self, key: &str) -> StorageOp {
        match self {
            Self::Host(tab) => {
                tab.remove_item(key);
                StorageOp::Done(Ok(()))
            }
            Self::Sync(storage) => StorageOp::Done(storage.remove_item(key)),
            Self::Async(storage) => StorageOp::Pending(storage.remove_item(key)),
            Self::Noop => StorageOp::Done(Ok(())),
        }
    }
}

impl fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Host(_) => "StorageProvider::Host",
            Self::Sync(_) => "StorageProvider::Sync",
            Self::Async(_) => "StorageProvider::Async",
            Self::Noop => "StorageProvider::Noop",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn noop_provider_stores_nothing() {
        let provider = StorageProvider::Noop;
        assert!(matches!(provider.set_item("k", "1".into()), StorageOp::Done(Ok(()))));
        assert_eq!(provider.get_item("k").await.unwrap(), None);
        assert!(provider.is_noop());
    }

    #[tokio::test]
    async fn sync_providers_complete_in_place() {
        let memory = MemoryStorage::new();
        let provider = StorageProvider::sync(memory.clone());

        assert!(matches!(provider.set_item("k", "1".into()), StorageOp::Done(Ok(()))));
        assert_eq!(memory.peek("k").as_deref(), Some("1"));
        assert_eq!(provider.get_item("k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn async_providers_return_pending_writes() {
        let memory = MemoryStorage::new();
        let (m_get, m_set, m_remove) = (memory.clone(), memory.clone(), memory.clone());
        let provider = StorageProvider::from_async_fns(
            move |key| {
                let m = m_get.clone();
                async move { Ok::<_, crate::error::StateError>(m.peek(&key)) }.boxed()
            },
            move |key, value| {
                let m = m_set.clone();
                async move { m.set_item(&key, &value) }.boxed()
            },
            move |key| {
                let m = m_remove.clone();
                async move { m.remove_item(&key) }.boxed()
            },
        );

        match provider.set_item("k", "2".into()) {
            StorageOp::Pending(write) => write.await.unwrap(),
            StorageOp::Done(_) => panic!("async provider completed synchronously"),
        }
        assert_eq!(provider.get_item("k").await.unwrap().as_deref(), Some("2"));

        if let StorageOp::Pending(remove) = provider.remove_item("k") {
            remove.await.unwrap();
        }
        assert_eq!(memory.peek("k"), None);
    }

    #[test]
    fn only_host_providers_expose_a_tab() {
        let host = HostStorage::new();
        assert!(StorageProvider::Host(host.tab()).host_tab().is_some());
        assert!(StorageProvider::sync(MemoryStorage::new()).host_tab().is_none());
    }
}
