//! Consumer handles.
//!
//! A handle is one mounted consumer: it holds a local copy of the value,
//! stays subscribed to the key's channel while it lives, and unsubscribes
//! when dropped. The local copy is what a rendering layer would display;
//! `render_count` counts how many times it was replaced.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::atom::{ensure_atom, Actions, Atom, WriteOutcome, Writer};
use super::channel::{Channel, Envelope};
use super::filter::{ensure_filter, Filter};
use super::scope::Scope;
use super::subscriber::{ListenerId, OriginTag};
use crate::registry::{QualifiedKey, StateType};

pub type RenderCallback<T> = Arc<dyn Fn(Option<&T>) + Send + Sync>;

pub(crate) struct ConsumerState<T> {
    origin: OriginTag,
    local: Mutex<Option<T>>,
    renders: AtomicUsize,
    needs_rerun: AtomicBool,
    on_render: Mutex<Option<RenderCallback<T>>>,
}

impl<T: StateType> ConsumerState<T> {
    fn new(origin: OriginTag, initial: Option<T>) -> Self {
        Self {
            origin,
            local: Mutex::new(initial),
            renders: AtomicUsize::new(0),
            needs_rerun: AtomicBool::new(false),
            on_render: Mutex::new(None),
        }
    }

    fn receive(&self, envelope: &Envelope) {
        // The writer already applied its own value locally.
        if envelope.origin == self.origin {
            return;
        }
        let value = envelope
            .payload
            .as_ref()
            .and_then(|payload| payload.downcast::<T>());
        self.apply_local(value);
    }

    pub(crate) fn apply_local(&self, value: Option<T>) {
        *self.local.lock() = value.clone();
        self.renders.fetch_add(1, Ordering::SeqCst);

        let callback = self.on_render.lock().clone();
        if let Some(callback) = callback {
            callback(value.as_ref());
        }
    }

    pub(crate) fn flag_rerun(&self) {
        self.needs_rerun.store(true, Ordering::SeqCst);
    }

    fn get(&self) -> Option<T> {
        self.local.lock().clone()
    }
}

/// A mounted atom consumer: value, writer and actions.
pub struct AtomHandle<T: StateType> {
    state: Arc<ConsumerState<T>>,
    writer: Writer<T>,
    channel: Arc<Channel>,
    listener: ListenerId,
}

impl<T: StateType> AtomHandle<T> {
    pub(crate) fn mount(scope: &Scope, atom: &Atom<T>) -> Self {
        ensure_atom(scope, atom);
        let key = scope.qualify(atom.key());
        let origin = OriginTag::new();
        let state = Arc::new(ConsumerState::new(origin, None));

        let channel = scope.store().inner.atom_channels.channel(&key);
        let receiver = Arc::clone(&state);
        let listener = channel.add_listener(move |envelope| receiver.receive(envelope));

        // Read after subscribing so a value published in between is not lost.
        *state.local.lock() = scope
            .store()
            .registry()
            .atom(&key)
            .and_then(|value| value.downcast::<T>());

        let writer = Writer::new(scope, atom, origin, Some(Arc::clone(&state)));
        Self {
            state,
            writer,
            channel,
            listener,
        }
    }

    /// This consumer's current view of the value.
    pub fn get(&self) -> Option<T> {
        self.state.get()
    }

    pub fn key(&self) -> &QualifiedKey {
        self.writer.key()
    }

    pub fn writer(&self) -> Writer<T> {
        self.writer.clone()
    }

    pub fn set(&self, value: T) -> WriteOutcome {
        self.writer.set(value)
    }

    pub fn update<F>(&self, f: F) -> WriteOutcome
    where
        F: FnOnce(&T) -> T,
    {
        self.writer.update(f)
    }

    pub fn actions(&self) -> Actions<T> {
        Actions::new(self.writer.clone())
    }

    pub fn render_count(&self) -> usize {
        self.state.renders.load(Ordering::SeqCst)
    }

    /// Set when an effect hook failed or vetoed too late.
    pub fn needs_rerun(&self) -> bool {
        self.state.needs_rerun.load(Ordering::SeqCst)
    }

    pub fn clear_rerun(&self) {
        self.state.needs_rerun.store(false, Ordering::SeqCst);
    }

    /// Called with the new local value every time it is replaced.
    pub fn on_render<F>(&self, callback: F)
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        *self.state.on_render.lock() = Some(Arc::new(callback));
    }
}

impl<T: StateType> Drop for AtomHandle<T> {
    fn drop(&mut self) {
        self.channel.remove_listener(self.listener);
    }
}

impl<T: StateType> fmt::Debug for AtomHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomHandle")
            .field("key", self.key())
            .field("value", &self.get())
            .field("renders", &self.render_count())
            .finish()
    }
}

/// A mounted filter consumer.
pub struct FilterHandle<T: StateType> {
    key: QualifiedKey,
    state: Arc<ConsumerState<T>>,
    channel: Arc<Channel>,
    listener: ListenerId,
}

impl<T: StateType> FilterHandle<T> {
    pub(crate) fn mount(scope: &Scope, filter: &Filter<T>) -> Self {
        ensure_filter(scope, filter);
        let key = scope.qualify(filter.key());
        let state = Arc::new(ConsumerState::new(OriginTag::new(), None));

        let channel = scope.store().inner.filter_channels.channel(&key);
        let receiver = Arc::clone(&state);
        let listener = channel.add_listener(move |envelope| receiver.receive(envelope));

        *state.local.lock() = scope
            .store()
            .registry()
            .filter(&key)
            .and_then(|value| value.downcast::<T>());

        Self {
            key,
            state,
            channel,
            listener,
        }
    }

    /// The derived value; `None` while pending.
    pub fn get(&self) -> Option<T> {
        self.state.get()
    }

    pub fn key(&self) -> &QualifiedKey {
        &self.key
    }

    pub fn render_count(&self) -> usize {
        self.state.renders.load(Ordering::SeqCst)
    }

    pub fn on_render<F>(&self, callback: F)
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        *self.state.on_render.lock() = Some(Arc::new(callback));
    }
}

impl<T: StateType> Drop for FilterHandle<T> {
    fn drop(&mut self) {
        self.channel.remove_listener(self.listener);
    }
}

impl<T: StateType> fmt::Debug for FilterHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHandle")
            .field("key", &self.key)
            .field("value", &self.get())
            .finish()
    }
}
