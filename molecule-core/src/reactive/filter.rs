//! Filter Engine
//!
//! A [`Filter`] is a derived, read-only value computed from atoms and other
//! filters. Its compute function receives a [`Getter`]; every `get`/`read`
//! made through it records a dependency together with a snapshot of the
//! value it saw.
//!
//! # Evaluation
//!
//! The first mount of a qualified filter key evaluates the filter. Later
//! mounts reuse the cached value. After every evaluation the filter listens
//! on exactly the channels of the dependencies that evaluation read, so the
//! dependency set can change from one evaluation to the next.
//!
//! When a dependency's channel emits, the filter:
//!
//! 1. if it is already being evaluated (single-flight), marks itself dirty
//!    and returns; the running evaluation evaluates once more after its own
//!    emission, up to the configured depth limit,
//! 2. skips if the emitted value equals the snapshot it last saw,
//! 3. otherwise evaluates again and, if the result differs from the cached
//!    value, commits it and emits on its own channel.
//!
//! Filters reading filters therefore propagate in dependency order: a
//! filter only re-emits once it has the new value, so downstream filters
//! never observe a stale upstream value.
//!
//! # Failures
//!
//! A compute that returns `Err` falls back to the declared default (or to
//! pending if there is none). The dependencies read before the failure are
//! kept, so the filter retries on their next change. Reading a filter that
//! is already being computed on this thread is a cycle and fails the same
//! way, as does a chain deeper than the configured limit.
//!
//! # Async filters
//!
//! A deferred compute publishes pending (`None`) right away and commits the
//! resolved value later. Results of evaluations superseded by a newer one
//! are discarded.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use super::atom::{atom_cell, Atom};
use super::channel::{Channels, Envelope};
use super::context::ComputeContext;
use super::runtime::{Store, StoreInner};
use super::scope::Scope;
use super::subscriber::{DeclarationId, ListenerId, OriginTag};
use crate::error::{Result, StateError};
use crate::persist::StorageProvider;
use crate::registry::{ErasedValue, QualifiedKey, StateType};

/// What a compute function produced.
pub enum Derivation<T> {
    Ready(T),
    Deferred(BoxFuture<'static, Result<T>>),
}

pub type ComputeFn<T> = Arc<dyn Fn(&Getter<'_>) -> Result<Derivation<T>> + Send + Sync>;

pub(crate) struct FilterDecl<T> {
    id: DeclarationId,
    key: String,
    default: Option<T>,
    compute: ComputeFn<T>,
}

/// Handle to a filter declaration.
pub struct Filter<T>(Arc<FilterDecl<T>>);

impl<T> Clone for Filter<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: StateType> Filter<T> {
    /// Declare a filter without a default.
    pub fn new<F>(key: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&Getter<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self::builder(key).compute(compute)
    }

    /// Start a declaration; finish it with [`FilterBuilder::compute`] or
    /// [`FilterBuilder::compute_async`].
    pub fn builder(key: impl Into<String>) -> FilterBuilder<T> {
        FilterBuilder {
            key: key.into(),
            default: None,
        }
    }

    /// The short name, before any scope prefix.
    pub fn key(&self) -> &str {
        &self.0.key
    }

    /// Identity of this declaration. Clones share it.
    pub fn id(&self) -> DeclarationId {
        self.0.id
    }

    /// Value used while pending and after a failed compute.
    pub fn default_value(&self) -> Option<&T> {
        self.0.default.as_ref()
    }

    fn fallback(&self) -> Option<ErasedValue> {
        self.0.default.clone().map(ErasedValue::new)
    }
}

impl<T> fmt::Debug for Filter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("key", &self.0.key)
            .field("id", &self.0.id)
            .finish()
    }
}

/// Builder for a [`Filter`] declaration.
pub struct FilterBuilder<T> {
    key: String,
    default: Option<T>,
}

impl<T: StateType> FilterBuilder<T> {
    /// Fallback for pending dependencies and failed computes.
    pub fn default(mut self, value: T) -> Self {
        self.default = Some(value);
        self
    }

    /// Finish with a synchronous compute function.
    pub fn compute<F>(self, compute: F) -> Filter<T>
    where
        F: Fn(&Getter<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.finish(Arc::new(move |getter: &Getter<'_>| {
            compute(getter).map(Derivation::Ready)
        }))
    }

    /// Dependencies are read synchronously; the returned future finishes the
    /// computation from the values it captured.
    pub fn compute_async<F, Fut>(self, compute: F) -> Filter<T>
    where
        F: Fn(&Getter<'_>) -> Result<Fut> + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.finish(Arc::new(move |getter: &Getter<'_>| {
            compute(getter).map(|future| Derivation::Deferred(future.boxed()))
        }))
    }

    fn finish(self, compute: ComputeFn<T>) -> Filter<T> {
        Filter(Arc::new(FilterDecl {
            id: DeclarationId::new(),
            key: self.key,
            default: self.default,
            compute,
        }))
    }
}

/// An atom or a filter, resolved once at the call site.
pub enum StateRef<'a, T> {
    Atom(&'a Atom<T>),
    Filter(&'a Filter<T>),
}

impl<'a, T> From<&'a Atom<T>> for StateRef<'a, T> {
    fn from(atom: &'a Atom<T>) -> Self {
        Self::Atom(atom)
    }
}

impl<'a, T> From<&'a Filter<T>> for StateRef<'a, T> {
    fn from(filter: &'a Filter<T>) -> Self {
        Self::Filter(filter)
    }
}

/// Anything [`Getter::get`] accepts.
pub trait AsStateRef {
    type Value: StateType;

    fn state_ref(&self) -> StateRef<'_, Self::Value>;
}

impl<T: StateType> AsStateRef for Atom<T> {
    type Value = T;

    fn state_ref(&self) -> StateRef<'_, T> {
        StateRef::Atom(self)
    }
}

impl<T: StateType> AsStateRef for Filter<T> {
    type Value = T;

    fn state_ref(&self) -> StateRef<'_, T> {
        StateRef::Filter(self)
    }
}

impl<T: StateType> AsStateRef for StateRef<'_, T> {
    type Value = T;

    fn state_ref(&self) -> StateRef<'_, T> {
        match *self {
            Self::Atom(atom) => StateRef::Atom(atom),
            Self::Filter(filter) => StateRef::Filter(filter),
        }
    }
}

// ----------------------------------------------------------------------------
// Dependency tracking
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DepKey {
    Atom(QualifiedKey),
    Filter(QualifiedKey),
}

impl DepKey {
    fn key(&self) -> &QualifiedKey {
        match self {
            Self::Atom(key) | Self::Filter(key) => key,
        }
    }

    fn channels<'s>(&self, store: &'s Store) -> &'s Channels {
        match self {
            Self::Atom(_) => &store.inner.atom_channels,
            Self::Filter(_) => &store.inner.filter_channels,
        }
    }
}

/// Snapshot of a dependency's value, compared by serialized form.
#[derive(Debug, Clone)]
pub(crate) enum Seen {
    Missing,
    Json(serde_json::Value),
    /// Could not be serialized; never considered unchanged.
    Opaque,
}

impl Seen {
    fn of(value: Option<&ErasedValue>) -> Self {
        match value {
            None => Self::Missing,
            Some(value) => value.to_json().map(Self::Json).unwrap_or(Self::Opaque),
        }
    }
}

impl PartialEq for Seen {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Missing, Self::Missing) => true,
            (Self::Json(a), Self::Json(b)) => a == b,
            _ => false,
        }
    }
}

/// Tracking accessor handed to compute functions.
pub struct Getter<'a> {
    scope: &'a Scope,
    owner: &'a QualifiedKey,
    deps: RefCell<IndexMap<DepKey, Seen>>,
}

impl<'a> Getter<'a> {
    fn new(scope: &'a Scope, owner: &'a QualifiedKey) -> Self {
        Self {
            scope,
            owner,
            deps: RefCell::new(IndexMap::new()),
        }
    }

    /// Read an atom, or a filter through [`read`](Self::read).
    pub fn get<S: AsStateRef + ?Sized>(&self, state: &S) -> Result<S::Value> {
        match state.state_ref() {
            StateRef::Atom(atom) => self.atom(atom),
            StateRef::Filter(filter) => self.read(filter),
        }
    }

    /// Read another filter, evaluating it first if it was never mounted.
    pub fn read<T: StateType>(&self, filter: &Filter<T>) -> Result<T> {
        let key = self.scope.qualify(filter.key());
        if ComputeContext::is_computing(&key) {
            self.track(DepKey::Filter(key.clone()), Seen::Missing);
            return Err(StateError::Cycle { key });
        }

        ensure_filter(self.scope, filter);
        let value = self.scope.store().registry().filter(&key);
        self.track(DepKey::Filter(key.clone()), Seen::of(value.as_ref()));
        typed(key, value)
    }

    /// The filter being computed.
    pub fn owner(&self) -> &QualifiedKey {
        self.owner
    }

    pub fn scope(&self) -> &Scope {
        self.scope
    }

    fn atom<T: StateType>(&self, atom: &Atom<T>) -> Result<T> {
        atom_cell(self.scope, atom);
        let key = self.scope.qualify(atom.key());
        let value = self.scope.store().registry().atom(&key);
        self.track(DepKey::Atom(key.clone()), Seen::of(value.as_ref()));
        typed(key, value)
    }

    fn track(&self, dep: DepKey, seen: Seen) {
        self.deps.borrow_mut().entry(dep).or_insert(seen);
    }

    fn into_dependencies(self) -> IndexMap<DepKey, Seen> {
        self.deps.into_inner()
    }
}

fn typed<T: StateType>(key: QualifiedKey, value: Option<ErasedValue>) -> Result<T> {
    match value {
        None => Err(StateError::Pending { key }),
        Some(value) => value.downcast().ok_or(StateError::TypeMismatch { key }),
    }
}

// ----------------------------------------------------------------------------
// Per-key engine state
// ----------------------------------------------------------------------------

struct Dependency {
    listener: ListenerId,
    seen: Seen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Mount,
    Dependency,
}

pub(crate) struct FilterNode<T: StateType> {
    key: QualifiedKey,
    store: Weak<StoreInner>,
    scope_name: Option<Arc<str>>,
    storage: StorageProvider,
    origin: OriginTag,
    decl: RwLock<Filter<T>>,
    deps: Mutex<IndexMap<DepKey, Dependency>>,
    in_flight: AtomicBool,
    /// A dependency changed while `in_flight` was set.
    dirty: AtomicBool,
    generation: AtomicU64,
}

/// Find or create the engine state for `filter` in `scope`, evaluating it
/// on creation.
///
/// Returns `None` when the key is already used by a filter of another
/// value type.
pub(crate) fn ensure_filter<T: StateType>(
    scope: &Scope,
    filter: &Filter<T>,
) -> Option<Arc<FilterNode<T>>> {
    let store = scope.store();
    let key = scope.qualify(filter.key());

    let existing = store
        .inner
        .filter_nodes
        .get(&key)
        .map(|node| Arc::clone(node.value()));
    if let Some(node) = existing {
        let node = downcast_node(&key, node)?;
        node.note_declaration(filter, store.config().warn_on_redeclare);
        return Some(node);
    }

    let (scope_name, storage) = scope.parts();
    let node = Arc::new(FilterNode {
        key: key.clone(),
        store: store.downgrade(),
        scope_name,
        storage,
        origin: OriginTag::new(),
        decl: RwLock::new(filter.clone()),
        deps: Mutex::new(IndexMap::new()),
        in_flight: AtomicBool::new(false),
        dirty: AtomicBool::new(false),
        generation: AtomicU64::new(0),
    });

    let erased: Arc<dyn Any + Send + Sync> = node.clone();
    match store.inner.filter_nodes.entry(key.clone()) {
        Entry::Occupied(entry) => return downcast_node(&key, Arc::clone(entry.get())),
        Entry::Vacant(slot) => {
            slot.insert(erased);
        }
    }

    node.evaluate(scope, Trigger::Mount);
    Some(node)
}

fn downcast_node<T: StateType>(
    key: &QualifiedKey,
    node: Arc<dyn Any + Send + Sync>,
) -> Option<Arc<FilterNode<T>>> {
    match node.downcast::<FilterNode<T>>() {
        Ok(node) => Some(node),
        Err(_) => {
            warn!(key = %key, "filter key already declared with a different value type");
            None
        }
    }
}

impl<T: StateType> FilterNode<T> {
    fn note_declaration(&self, filter: &Filter<T>, warn_on_redeclare: bool) {
        let mut decl = self.decl.write();
        if decl.id() != filter.id() {
            if warn_on_redeclare {
                warn!(key = %self.key, "filter re-declared with a different descriptor; cached value kept");
            }
            *decl = filter.clone();
        }
    }

    fn evaluate(self: &Arc<Self>, scope: &Scope, trigger: Trigger) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            trace!(key = %self.key, "evaluation already in flight; marked dirty");
            self.dirty.store(true, Ordering::SeqCst);
            return;
        }

        let limit = scope.store().config().max_filter_depth;
        let mut trigger = trigger;
        let mut reruns = 0;
        loop {
            self.dirty.store(false, Ordering::SeqCst);
            self.evaluate_once(scope, trigger);
            if !self.dirty.swap(false, Ordering::SeqCst) {
                break;
            }
            reruns += 1;
            if reruns > limit {
                error!(key = %self.key, reruns, "filter keeps changing its own dependencies; giving up");
                break;
            }
            trigger = Trigger::Dependency;
        }

        self.settle(scope);
    }

    /// Lower the single-flight flag, then pick up a change that raced it.
    fn settle(self: &Arc<Self>, scope: &Scope) {
        self.in_flight.store(false, Ordering::SeqCst);
        if self.dirty.swap(false, Ordering::SeqCst) {
            self.evaluate(scope, Trigger::Dependency);
        }
    }

    fn evaluate_once(self: &Arc<Self>, scope: &Scope, trigger: Trigger) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let store = scope.store();
        let registry = store.registry();
        let keep_seed = trigger == Trigger::Mount
            && registry.is_seeded_filter(&self.key)
            && registry.has_filter(&self.key);

        let decl = self.decl.read().clone();
        let result = match ComputeContext::enter(&self.key, store.config().max_filter_depth) {
            Ok(_ctx) => {
                let getter = Getter::new(scope, &self.key);
                let result = (decl.0.compute)(&getter);
                self.rewire(store, getter.into_dependencies());
                result
            }
            Err(err) => Err(err),
        };
        trace!(key = %self.key, ?trigger, generation, "evaluated");

        match result {
            Ok(Derivation::Ready(value)) if !keep_seed => {
                self.commit(scope, Some(ErasedValue::new(value)));
            }
            Ok(Derivation::Deferred(future)) if !keep_seed => {
                self.defer(scope, generation, decl.fallback(), future);
            }
            Ok(_) => debug!(key = %self.key, "keeping seeded value"),
            Err(err) => {
                match &err {
                    StateError::Cycle { .. } | StateError::DepthExceeded { .. } => {
                        error!(key = %self.key, error = %err, "filter dependency cycle; using default")
                    }
                    StateError::Pending { .. } => {
                        debug!(key = %self.key, error = %err, "dependency pending; using default")
                    }
                    _ => warn!(key = %self.key, error = %err, "filter compute failed; using default"),
                }
                if !keep_seed {
                    self.commit(scope, decl.fallback());
                }
            }
        }
    }

    fn commit(&self, scope: &Scope, value: Option<ErasedValue>) {
        let store = scope.store();
        let registry = store.registry();
        if registry.filter(&self.key) == value {
            trace!(key = %self.key, "filter value unchanged");
            return;
        }
        registry.set_filter(self.key.clone(), value.clone());
        store
            .inner
            .filter_channels
            .emit(&self.key, self.origin, value);
    }

    fn defer(
        self: &Arc<Self>,
        scope: &Scope,
        generation: u64,
        fallback: Option<ErasedValue>,
        future: BoxFuture<'static, Result<T>>,
    ) {
        self.commit(scope, None);

        let node = Arc::clone(self);
        let task_scope = scope.clone();
        scope.store().spawn(async move {
            let result = future.await;
            if node.generation.load(Ordering::SeqCst) != generation {
                debug!(key = %node.key, generation, "discarding superseded async filter result");
                return;
            }
            let value = match result {
                Ok(value) => Some(ErasedValue::new(value)),
                Err(err) => {
                    warn!(key = %node.key, error = %err, "async filter failed; using default");
                    fallback
                }
            };

            let was_in_flight = node.in_flight.swap(true, Ordering::SeqCst);
            node.commit(&task_scope, value);
            if !was_in_flight {
                node.settle(&task_scope);
            }
        });
    }

    /// Listen on exactly the dependencies of the latest evaluation.
    fn rewire(self: &Arc<Self>, store: &Store, discovered: IndexMap<DepKey, Seen>) {
        let mut previous = mem::take(&mut *self.deps.lock());
        let mut next = IndexMap::with_capacity(discovered.len());

        for (dep, seen) in discovered {
            let listener = match previous.swap_remove(&dep) {
                Some(existing) => existing.listener,
                None => self.listen(store, &dep),
            };
            next.insert(dep, Dependency { listener, seen });
        }
        for (dep, stale) in previous {
            dep.channels(store).remove_listener(dep.key(), stale.listener);
        }

        *self.deps.lock() = next;
    }

    fn listen(self: &Arc<Self>, store: &Store, dep: &DepKey) -> ListenerId {
        let node = Arc::downgrade(self);
        let source = dep.clone();
        dep.channels(store).add_listener(dep.key(), move |envelope| {
            if let Some(node) = node.upgrade() {
                node.on_dependency_change(&source, envelope);
            }
        })
    }

    fn on_dependency_change(self: &Arc<Self>, dep: &DepKey, envelope: &Envelope) {
        if self.in_flight.load(Ordering::SeqCst) {
            trace!(key = %self.key, dependency = %dep.key(), "evaluation in flight; marked dirty");
            self.dirty.store(true, Ordering::SeqCst);
            return;
        }

        let seen = Seen::of(envelope.payload.as_ref());
        let unchanged = self
            .deps
            .lock()
            .get(dep)
            .is_some_and(|known| known.seen == seen);
        if unchanged {
            trace!(key = %self.key, dependency = %dep.key(), "skipped: dependency unchanged");
            return;
        }

        let Some(store) = Store::upgrade(&self.store) else {
            return;
        };
        let scope = Scope::from_parts(store, self.scope_name.clone(), self.storage.clone());
        self.evaluate(&scope, Trigger::Dependency);
    }

    #[cfg(test)]
    fn dependency_keys(&self) -> Vec<QualifiedKey> {
        self.deps.lock().keys().map(|dep| dep.key().clone()).collect()
    }
}
