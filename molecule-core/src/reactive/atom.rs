//! Atom Engine
//!
//! An [`Atom`] is an immutable descriptor: key, default, persistence and
//! sync flags, effect hooks and named actions. Declaring one does nothing
//! by itself. The first read or write through any scope creates the
//! per-key engine state ([`AtomCell`]) and the canonical value in the
//! registry; every later declaration of the same qualified key shares that
//! one value.
//!
//! The cell also remembers the most recently mounted declaration. Writes,
//! actions and cross-tab callbacks use that descriptor's effects, actions,
//! persistence flag and `on_sync`, whichever declaration the writer was
//! created from.
//!
//! # Update path
//!
//! A write through a [`Writer`] always runs, in order:
//!
//! 1. compute the candidate (literal or updater of the canonical value),
//! 2. run the previous cycle's cleanups,
//! 3. run effect hooks (a synchronous cancel stops here),
//! 4. commit to the registry,
//! 5. persist, if the atom is persistent,
//! 6. emit on the atom's channel, unless the value did not change,
//! 7. update the writing consumer's local view.
//!
//! Step 6 is skipped for a structurally equal value, except the first time
//! the atom's declared default is written: that emission is what unblocks
//! filters waiting on an initial resolved value. Equality is checked against
//! the canonical value at commit time, since an effect hook may already have
//! dispatched a nested write.
//!
//! # Defaults
//!
//! Plain and lazy defaults are stored synchronously when the cell is
//! created. Future-valued defaults leave the atom unresolved (`None`) and
//! are resolved exactly once per key as deferred work; the result is
//! published unless a write or hydration already resolved the atom.
//!
//! # Persistence
//!
//! Persistent atoms hydrate from the scope's storage provider after a
//! zero-delay deferral, committing the stored value through a writer only
//! if nothing has committed in the meantime. Atoms declared with `sync`
//! additionally follow storage events from other tabs when the provider is
//! the host store.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::effect::{self, Cleanup, DeferredOutcome, EffectContext, EffectHook, EffectOutcome};
use super::handle::ConsumerState;
use super::runtime::Store;
use super::scope::Scope;
use super::subscriber::{DeclarationId, OriginTag};
use crate::error::{Result, StateError};
use crate::persist::{StorageEvent, StorageListener, StorageOp};
use crate::registry::{ErasedValue, QualifiedKey, StateType};

pub type ActionFn<T> = Arc<dyn Fn(ActionContext<T>) + Send + Sync>;
pub type SyncCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) enum AtomDefault<T> {
    Undefined,
    Value(T),
    Lazy(Arc<dyn Fn() -> T + Send + Sync>),
    /// A single future; only the first scope to create the atom gets it.
    Future(Mutex<Option<BoxFuture<'static, T>>>),
    AsyncFn(Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>),
}

pub(crate) struct AtomDecl<T> {
    id: DeclarationId,
    key: String,
    default: AtomDefault<T>,
    persist: bool,
    sync: bool,
    on_sync: Option<SyncCallback<T>>,
    effects: Vec<EffectHook<T>>,
    actions: IndexMap<String, ActionFn<T>>,
}

/// Handle to an atom declaration.
///
/// Cloning is cheap and keeps the declaration identity; building a new
/// atom with the same key creates a different declaration.
pub struct Atom<T>(Arc<AtomDecl<T>>);

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: StateType> Atom<T> {
    /// Declare an atom with a plain default value.
    pub fn new(key: impl Into<String>, default: T) -> Self {
        Self::builder(key).default(default).build()
    }

    /// Start a declaration with no default; see [`AtomBuilder`].
    pub fn builder(key: impl Into<String>) -> AtomBuilder<T> {
        AtomBuilder {
            key: key.into(),
            default: AtomDefault::Undefined,
            persist: false,
            sync: false,
            on_sync: None,
            effects: Vec::new(),
            actions: IndexMap::new(),
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

    /// Whether writes are mirrored to the scope's storage provider.
    pub fn is_persistent(&self) -> bool {
        self.0.persist
    }

    /// Names of the declared actions, in declaration order.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.0.actions.keys().map(String::as_str)
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("key", &self.0.key)
            .field("id", &self.0.id)
            .field("persist", &self.0.persist)
            .field("sync", &self.0.sync)
            .field("effects", &self.0.effects.len())
            .field("actions", &self.0.actions.len())
            .finish()
    }
}

/// Builder for an [`Atom`] declaration.
pub struct AtomBuilder<T> {
    key: String,
    default: AtomDefault<T>,
    persist: bool,
    sync: bool,
    on_sync: Option<SyncCallback<T>>,
    effects: Vec<EffectHook<T>>,
    actions: IndexMap<String, ActionFn<T>>,
}

impl<T: StateType> AtomBuilder<T> {
    /// Use a plain value as the default.
    pub fn default(mut self, value: T) -> Self {
        self.default = AtomDefault::Value(value);
        self
    }

    /// Compute the default on first use.
    pub fn default_with<F>(mut self, make: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.default = AtomDefault::Lazy(Arc::new(make));
        self
    }

    /// Resolve the default from an already-running future.
    pub fn default_future<F>(mut self, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.default = AtomDefault::Future(Mutex::new(Some(future.boxed())));
        self
    }

    /// Resolve the default by calling an async function, at most once per key.
    pub fn default_async<F, Fut>(mut self, make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.default = AtomDefault::AsyncFn(Arc::new(move || make().boxed()));
        self
    }

    /// Mirror writes to storage and hydrate from it on creation.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Follow writes made by other tabs. Implies `persist`.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self.persist |= sync;
        self
    }

    /// Called after a value from another tab has been committed.
    pub fn on_sync<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_sync = Some(Arc::new(callback));
        self
    }

    /// Add an effect hook. Hooks run in the order they were added.
    pub fn effect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EffectContext<T>) -> Result<EffectOutcome> + Send + Sync + 'static,
    {
        self.effects.push(Arc::new(hook));
        self
    }

    /// Add a named action. A later action with the same name replaces it.
    pub fn action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(ActionContext<T>) + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    pub fn build(self) -> Atom<T> {
        Atom(Arc::new(AtomDecl {
            id: DeclarationId::new(),
            key: self.key,
            default: self.default,
            persist: self.persist,
            sync: self.sync,
            on_sync: self.on_sync,
            effects: self.effects,
            actions: self.actions,
        }))
    }
}

// ----------------------------------------------------------------------------
// Per-key engine state
// ----------------------------------------------------------------------------

struct Declared {
    id: DeclarationId,
    /// The `Atom<T>` itself.
    atom: Arc<dyn Any + Send + Sync>,
}

pub(crate) struct AtomCell {
    pub(crate) key: QualifiedKey,
    declaration: Mutex<Declared>,
    default_value: Mutex<Option<ErasedValue>>,
    /// Set by the first writer or hydration commit.
    resolved: AtomicBool,
    default_announced: AtomicBool,
    cleanups: Mutex<Vec<Cleanup>>,
    late_vetoes: AtomicUsize,
    storage_listener: Mutex<Option<StorageListener>>,
}

impl AtomCell {
    fn new<T: StateType>(key: QualifiedKey, atom: &Atom<T>) -> Self {
        Self {
            key,
            declaration: Mutex::new(Declared {
                id: atom.id(),
                atom: Arc::new(atom.clone()),
            }),
            default_value: Mutex::new(None),
            resolved: AtomicBool::new(false),
            default_announced: AtomicBool::new(false),
            cleanups: Mutex::new(Vec::new()),
            late_vetoes: AtomicUsize::new(0),
            storage_listener: Mutex::new(None),
        }
    }

    fn note_declaration<T: StateType>(&self, atom: &Atom<T>, warn_on_redeclare: bool) {
        let mut current = self.declaration.lock();
        if current.id != atom.id() {
            if warn_on_redeclare {
                warn!(key = %self.key, "atom re-declared with a different descriptor; canonical value kept");
            }
            *current = Declared {
                id: atom.id(),
                atom: Arc::new(atom.clone()),
            };
        }
    }

    /// The latest declaration, if it has value type `T`.
    fn declaration<T: StateType>(&self) -> Option<Atom<T>> {
        self.declaration.lock().atom.downcast_ref::<Atom<T>>().cloned()
    }

    fn set_default(&self, value: ErasedValue) {
        *self.default_value.lock() = Some(value);
    }

    fn is_default(&self, value: &ErasedValue) -> bool {
        self.default_value.lock().as_ref() == Some(value)
    }

    fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    fn run_cleanups(&self) {
        let cleanups = mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            cleanup();
        }
    }

    fn push_cleanups(&self, cleanups: Vec<Cleanup>) {
        if !cleanups.is_empty() {
            self.cleanups.lock().extend(cleanups);
        }
    }

    pub(crate) fn late_vetoes(&self) -> usize {
        self.late_vetoes.load(Ordering::SeqCst)
    }
}

/// Declare `atom` in `scope`: find or create its engine state and make it
/// the key's current descriptor.
///
/// Creation stores the default, schedules hydration for persistent atoms
/// and installs the cross-tab listener for synced ones. The map entry is
/// released before any of that runs, since lazy defaults may read other
/// atoms.
pub(crate) fn ensure_atom<T: StateType>(scope: &Scope, atom: &Atom<T>) -> Arc<AtomCell> {
    let store = scope.store();
    let key = scope.qualify(atom.key());

    let existing = store
        .inner
        .atom_cells
        .get(&key)
        .map(|cell| Arc::clone(cell.value()));
    if let Some(cell) = existing {
        cell.note_declaration(atom, store.config().warn_on_redeclare);
        return cell;
    }

    let cell = Arc::new(AtomCell::new(key.clone(), atom));
    match store.inner.atom_cells.entry(key) {
        Entry::Occupied(entry) => return Arc::clone(entry.get()),
        Entry::Vacant(slot) => {
            slot.insert(Arc::clone(&cell));
        }
    }

    initialize(scope, atom, &cell);
    if atom.0.persist {
        schedule_hydration(scope, atom, &cell);
    }
    if atom.0.sync {
        install_sync_listener(scope, atom, &cell);
    }
    cell
}

/// Find the engine state for `atom` without replacing the key's descriptor,
/// creating it from `atom` if the key was never used.
pub(crate) fn atom_cell<T: StateType>(scope: &Scope, atom: &Atom<T>) -> Arc<AtomCell> {
    let existing = scope
        .store()
        .inner
        .atom_cells
        .get(&scope.qualify(atom.key()))
        .map(|cell| Arc::clone(cell.value()));
    existing.unwrap_or_else(|| ensure_atom(scope, atom))
}

/// The key's current descriptor, or `fallback` if the key has none of type `T`.
fn latest_declaration<T: StateType>(store: &Store, key: &QualifiedKey, fallback: &Atom<T>) -> Atom<T> {
    let cell = store
        .inner
        .atom_cells
        .get(key)
        .map(|cell| Arc::clone(cell.value()));
    cell.and_then(|cell| cell.declaration::<T>())
        .unwrap_or_else(|| fallback.clone())
}

fn initialize<T: StateType>(scope: &Scope, atom: &Atom<T>, cell: &Arc<AtomCell>) {
    let registry = scope.store().registry();
    let key = &cell.key;

    match &atom.0.default {
        AtomDefault::Undefined => {}
        AtomDefault::Value(value) => {
            let value = ErasedValue::new(value.clone());
            cell.set_default(value.clone());
            registry.set_atom_if_absent(key.clone(), value);
        }
        AtomDefault::Lazy(make) => {
            if !registry.has_atom(key) {
                let value = ErasedValue::new(make());
                cell.set_default(value.clone());
                registry.set_atom_if_absent(key.clone(), value);
            }
        }
        AtomDefault::Future(slot) => {
            let future = slot.lock().take();
            match future {
                Some(future) if registry.begin_pending(key) => resolve_default(scope, cell, future),
                Some(_) => registry.finish_pending(key),
                None => {
                    warn!(key = %key, "default future already consumed by another scope; atom stays unresolved")
                }
            }
        }
        AtomDefault::AsyncFn(make) => {
            if registry.begin_pending(key) {
                resolve_default(scope, cell, make());
            } else {
                // Someone is already resolving; they will publish the value.
                registry.finish_pending(key);
                trace!(key = %key, "async default already pending");
            }
        }
    }
}

fn resolve_default<T: StateType>(scope: &Scope, cell: &Arc<AtomCell>, future: BoxFuture<'static, T>) {
    let store = scope.store().clone();
    let cell = Arc::clone(cell);

    scope.store().spawn(async move {
        let value = future.await;
        let registry = store.registry();
        registry.finish_pending(&cell.key);

        if cell.is_resolved() {
            debug!(key = %cell.key, "async default resolved after a commit; keeping the committed value");
            return;
        }

        let value = ErasedValue::new(value);
        cell.set_default(value.clone());
        cell.default_announced.store(true, Ordering::SeqCst);
        registry.set_atom(cell.key.clone(), value.clone());
        debug!(key = %cell.key, "async default resolved");
        store
            .inner
            .atom_channels
            .emit(&cell.key, OriginTag::new(), Some(value));
    });
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Committed and emitted.
    Committed,
    /// Committed, but equal to the previous value, so nothing was emitted.
    Unchanged,
    /// Vetoed synchronously by an effect hook; nothing was committed.
    Cancelled,
    /// An updater was given but the atom has no resolved value to update.
    Skipped,
}

/// Writes to one atom's canonical value.
///
/// Every writer obtained for the same qualified key targets the same
/// canonical value, whichever declaration it was created from.
pub struct Writer<T> {
    scope: Scope,
    atom: Atom<T>,
    key: QualifiedKey,
    origin: OriginTag,
    consumer: Option<Arc<ConsumerState<T>>>,
}

impl<T: StateType> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            atom: self.atom.clone(),
            key: self.key.clone(),
            origin: self.origin,
            consumer: self.consumer.clone(),
        }
    }
}

impl<T: StateType> Writer<T> {
    pub(crate) fn new(
        scope: &Scope,
        atom: &Atom<T>,
        origin: OriginTag,
        consumer: Option<Arc<ConsumerState<T>>>,
    ) -> Self {
        Self {
            scope: scope.clone(),
            atom: atom.clone(),
            key: scope.qualify(atom.key()),
            origin,
            consumer,
        }
    }

    pub fn key(&self) -> &QualifiedKey {
        &self.key
    }

    /// Tag carried by this writer's emissions.
    pub fn origin(&self) -> OriginTag {
        self.origin
    }

    fn declaration(&self) -> Atom<T> {
        latest_declaration(self.scope.store(), &self.key, &self.atom)
    }

    /// The canonical value right now.
    pub fn current(&self) -> Option<T> {
        self.scope
            .store()
            .registry()
            .atom(&self.key)
            .and_then(|value| downcast_or_warn(&self.key, &value))
    }

    pub fn set(&self, value: T) -> WriteOutcome {
        self.apply(move |_| Some(value))
    }

    /// Replace the value with a function of the canonical value.
    ///
    /// Skipped while the atom is unresolved; use [`update_with`](Self::update_with)
    /// to handle that case.
    pub fn update<F>(&self, f: F) -> WriteOutcome
    where
        F: FnOnce(&T) -> T,
    {
        self.apply(move |previous| previous.map(f))
    }

    pub fn update_with<F>(&self, f: F) -> WriteOutcome
    where
        F: FnOnce(Option<&T>) -> T,
    {
        self.apply(move |previous| Some(f(previous)))
    }

    fn apply<F>(&self, next: F) -> WriteOutcome
    where
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let cell = atom_cell(&self.scope, &self.atom);
        let atom = cell.declaration::<T>().unwrap_or_else(|| self.atom.clone());
        let store = self.scope.store();
        let registry = store.registry();

        let previous = registry
            .atom(&self.key)
            .and_then(|value| downcast_or_warn::<T>(&self.key, &value));

        let Some(candidate) = next(previous.as_ref()) else {
            debug!(key = %self.key, "updater skipped: atom has no resolved value");
            return WriteOutcome::Skipped;
        };

        cell.run_cleanups();

        let run = effect::run_effects(
            &self.key,
            &atom.0.effects,
            previous,
            candidate.clone(),
            self,
        );
        if run.failed {
            self.flag_rerun();
        }
        self.spawn_deferred(&cell, run.deferred);
        cell.push_cleanups(run.cleanups);
        if run.cancelled {
            debug!(key = %self.key, "write cancelled by an effect hook");
            return WriteOutcome::Cancelled;
        }

        // Effects may have written re-entrantly; compare with what is there now.
        let next_value = ErasedValue::new(candidate.clone());
        let unchanged = registry.atom(&self.key).as_ref() == Some(&next_value);
        let announces_default =
            !cell.default_announced.load(Ordering::SeqCst) && cell.is_default(&next_value);

        registry.set_atom(self.key.clone(), next_value.clone());
        cell.resolved.store(true, Ordering::SeqCst);
        if announces_default {
            cell.default_announced.store(true, Ordering::SeqCst);
        }

        if atom.0.persist {
            persist(&self.scope, &self.key, &candidate);
        }

        if unchanged && !announces_default {
            trace!(key = %self.key, "value unchanged; not notifying");
            return WriteOutcome::Unchanged;
        }

        store
            .inner
            .atom_channels
            .emit(&self.key, self.origin, Some(next_value));
        if let Some(consumer) = &self.consumer {
            // A listener may have written again during the emission.
            let latest = self.current().unwrap_or(candidate);
            consumer.apply_local(Some(latest));
        }
        WriteOutcome::Committed
    }

    fn flag_rerun(&self) {
        if let Some(consumer) = &self.consumer {
            consumer.flag_rerun();
        }
    }

    fn spawn_deferred(&self, cell: &Arc<AtomCell>, deferred: Vec<BoxFuture<'static, DeferredOutcome>>) {
        for outcome in deferred {
            let cell = Arc::clone(cell);
            let consumer = self.consumer.clone();
            self.scope.store().spawn(async move {
                match outcome.await {
                    DeferredOutcome::Continue => {}
                    DeferredOutcome::Cleanup(cleanup) => cell.push_cleanups(vec![cleanup]),
                    DeferredOutcome::Cancel => {
                        // The value is already committed and emitted.
                        cell.late_vetoes.fetch_add(1, Ordering::SeqCst);
                        warn!(key = %cell.key, "effect veto arrived after the value was committed");
                        if let Some(consumer) = consumer {
                            consumer.flag_rerun();
                        }
                    }
                }
            });
        }
    }
}

impl<T: StateType> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("key", &self.key)
            .field("origin", &self.origin)
            .finish()
    }
}

fn downcast_or_warn<T: StateType>(key: &QualifiedKey, value: &ErasedValue) -> Option<T> {
    let typed = value.downcast::<T>();
    if typed.is_none() {
        warn!(key = %key, "stored value has a different type than this declaration");
    }
    typed
}

// ----------------------------------------------------------------------------
// Actions
// ----------------------------------------------------------------------------

/// What a named action receives.
pub struct ActionContext<T> {
    pub args: serde_json::Value,
    /// Canonical value at call time.
    pub state: Option<T>,
    pub dispatch: Writer<T>,
}

/// The named actions of one atom, bound to a writer.
pub struct Actions<T> {
    writer: Writer<T>,
}

impl<T: StateType> Clone for Actions<T> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<T: StateType> Actions<T> {
    pub(crate) fn new(writer: Writer<T>) -> Self {
        Self { writer }
    }

    pub fn call(&self, name: &str, args: serde_json::Value) -> Result<()> {
        let action = self
            .writer
            .declaration()
            .0
            .actions
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::UnknownAction {
                key: self.writer.key.clone(),
                action: name.to_string(),
            })?;

        action(ActionContext {
            args,
            state: self.writer.current(),
            dispatch: self.writer.clone(),
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.writer.declaration().0.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.writer.declaration().action_names().map(String::from).collect()
    }
}

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

fn persist<T: StateType>(scope: &Scope, key: &QualifiedKey, value: &T) {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(err) => {
            let err = StateError::serialization(key, &err);
            warn!(key = %key, error = %err, "keeping value in memory only");
            return;
        }
    };
    let op = scope.storage().set_item(&key.storage_key(), text);
    drive_storage_op(scope.store(), key, op);
}

pub(crate) fn drive_storage_op(store: &Store, key: &QualifiedKey, op: StorageOp) {
    match op {
        StorageOp::Done(Ok(())) => {}
        StorageOp::Done(Err(err)) => {
            warn!(key = %key, error = %err, "storage write failed");
        }
        StorageOp::Pending(write) => {
            let key = key.clone();
            store.spawn(async move {
                if let Err(err) = write.await {
                    warn!(key = %key, error = %err, "storage write failed");
                }
            });
        }
    }
}

fn schedule_hydration<T: StateType>(scope: &Scope, atom: &Atom<T>, cell: &Arc<AtomCell>) {
    if scope.storage().is_noop() {
        return;
    }
    let task_scope = scope.clone();
    let atom = atom.clone();
    let cell = Arc::clone(cell);

    scope.store().spawn(async move {
        // Zero-delay deferral: the mount that created the atom finishes with
        // the default before a stored value may replace it.
        tokio::task::yield_now().await;
        hydrate(&task_scope, &atom, &cell).await;
    });
}

async fn hydrate<T: StateType>(scope: &Scope, atom: &Atom<T>, cell: &AtomCell) {
    let key = &cell.key;
    let text = match scope.storage().get_item(&key.storage_key()).await {
        Ok(Some(text)) => text,
        Ok(None) => {
            trace!(key = %key, "nothing stored; keeping the default");
            return;
        }
        Err(err) => {
            warn!(key = %key, error = %err, "storage read failed; keeping the default");
            return;
        }
    };

    let stored: T = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(err) => {
            let err = StateError::serialization(key, &err);
            warn!(key = %key, error = %err, "stored value unreadable; keeping the default");
            return;
        }
    };

    if cell.is_resolved() {
        debug!(key = %key, "atom written before hydration finished; stored value ignored");
        return;
    }

    let current = scope.store().registry().atom(key);
    if current.as_ref() == Some(&ErasedValue::new(stored.clone())) {
        cell.resolved.store(true, Ordering::SeqCst);
        return;
    }

    let outcome = Writer::new(scope, atom, OriginTag::new(), None).set(stored);
    debug!(key = %key, ?outcome, "hydrated from storage");
}

fn install_sync_listener<T: StateType>(scope: &Scope, atom: &Atom<T>, cell: &Arc<AtomCell>) {
    let Some(tab) = scope.storage().host_tab() else {
        debug!(key = %cell.key, "cross-tab sync needs the host store; not listening");
        return;
    };

    let weak = scope.store().downgrade();
    let (scope_name, storage) = scope.parts();
    let atom = atom.clone();
    let storage_key = cell.key.storage_key();

    let listener = tab.on_storage(move |event| {
        if event.key != storage_key {
            return;
        }
        let Some(store) = Store::upgrade(&weak) else {
            return;
        };
        let scope = Scope::from_parts(store, scope_name.clone(), storage.clone());
        apply_external_change(&scope, &atom, event);
    });
    *cell.storage_listener.lock() = Some(listener);
}

fn apply_external_change<T: StateType>(scope: &Scope, atom: &Atom<T>, event: &StorageEvent) {
    let key = scope.qualify(atom.key());
    let atom = &latest_declaration(scope.store(), &key, atom);
    let Some(text) = event.new_value.as_deref() else {
        debug!(key = %key, "removed by another tab; keeping the in-memory value");
        return;
    };

    let value: T = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            let err = StateError::serialization(&key, &err);
            warn!(key = %key, error = %err, "ignoring unreadable value from another tab");
            return;
        }
    };

    let current = scope
        .store()
        .registry()
        .atom(&key)
        .and_then(|value| value.downcast::<T>());
    if current.as_ref() == Some(&value) {
        return;
    }

    let outcome = Writer::new(scope, atom, OriginTag::new(), None).set(value.clone());
    debug!(key = %key, ?outcome, "synced from another tab");
    if outcome != WriteOutcome::Cancelled {
        if let Some(on_sync) = &atom.0.on_sync {
            on_sync(&value);
        }
    }
}
