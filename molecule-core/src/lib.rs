//! Molecule Core
//!
//! This crate provides a reactive state container for component-based
//! front ends. It implements:
//!
//! - Atoms: named state cells with one canonical value per qualified key
//! - Filters: derived values with dynamic dependency tracking
//! - Scopes that namespace keys per subtree of consumers
//! - Persistence to a pluggable key-value store, with cross-tab sync
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: atoms, filters, channels, consumer handles and the store
//! - `registry`: qualified keys and the canonical value maps
//! - `persist`: storage providers and the host store model
//! - `config`: store settings
//! - `error`: the crate error type
//!
//! # Example
//!
//! ```rust,ignore
//! use molecule_core::reactive::{Atom, Filter, Store};
//!
//! let store = Store::new();
//! let clicks = Atom::new("clicks", 0);
//! let doubled = {
//!     let clicks = clicks.clone();
//!     Filter::new("doubled", move |get| Ok(get.get(&clicks)? * 2))
//! };
//!
//! let counter = store.use_atom(&clicks);
//! let view = store.use_filter(&doubled);
//!
//! counter.update(|v| v + 1);
//! assert_eq!(view.get(), Some(2));
//! ```

pub mod config;
pub mod error;
pub mod persist;
pub mod reactive;
pub mod registry;

pub use config::StoreConfig;
pub use error::{Result, StateError};
pub use persist::{HostStorage, MemoryStorage, StorageProvider};
pub use reactive::{Atom, Filter, Scope, Store, WriteOutcome};
