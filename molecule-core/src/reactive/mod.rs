//! Reactive State
//!
//! This module implements the state engine: atoms, filters, the channels
//! that connect them to consumers, and the store that owns it all.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An atom is a named, independently declared mutable cell. Any number of
//! declarations and consumers may use the same qualified key; they all read
//! and write one canonical value. Writes go through a [`Writer`], which
//! runs the atom's effect hooks, commits, persists and notifies.
//!
//! ## Filters
//!
//! A filter is a derived value. Its compute function reads atoms and other
//! filters through a tracking [`Getter`], and the filter recomputes when
//! one of the dependencies it read changes.
//!
//! ## Scopes
//!
//! A scope prefixes short names with a store name, so the same declaration
//! can be instantiated once per scope.
//!
//! # Implementation Notes
//!
//! Propagation is push-based. Every qualified key has a channel; writers
//! emit on it synchronously and every listener, whether a consumer handle
//! or a dependent filter, runs before the write returns. No lock is held
//! while a listener, effect or compute function runs, so those may write
//! re-entrantly.

mod atom;
mod channel;
mod context;
mod effect;
mod filter;
mod handle;
mod runtime;
mod scope;
mod subscriber;

pub use atom::{ActionContext, ActionFn, Actions, Atom, AtomBuilder, SyncCallback, WriteOutcome, Writer};
pub use channel::{Channel, Channels, Envelope, Listener};
pub use context::ComputeContext;
pub use effect::{Cleanup, CancelToken, DeferredOutcome, EffectContext, EffectHook, EffectOutcome};
pub use filter::{AsStateRef, ComputeFn, Derivation, Filter, FilterBuilder, Getter, StateRef};
pub use handle::{AtomHandle, FilterHandle, RenderCallback};
pub use runtime::{Snapshot, Store};
pub use scope::Scope;
pub use subscriber::{DeclarationId, ListenerId, OriginTag};
