//! Observable Channel
//!
//! One channel per canonical key. A channel is a list of listeners and an
//! `emit` that calls each of them, in registration order, synchronously.
//!
//! # Snapshot semantics
//!
//! `emit` copies the listener list before calling anything. A listener
//! added during an emission is not called by that emission, and a listener
//! removed during an emission is still called by it. The copy is also what
//! allows listeners to write (and therefore emit) re-entrantly: the list
//! lock is never held while a listener runs.
//!
//! A nested emission on the same channel supersedes the one in progress.
//! The nested one reaches every current listener with the newer payload, so
//! the outer one stops instead of handing the older payload to the
//! listeners it had not reached yet.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::subscriber::{ListenerId, OriginTag};
use crate::registry::{ErasedValue, QualifiedKey};

pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// What a listener receives.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub key: QualifiedKey,
    pub origin: OriginTag,
    /// The new canonical value; `None` while the key is pending.
    pub payload: Option<ErasedValue>,
}

pub struct Channel {
    key: QualifiedKey,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    /// Number of emissions started.
    sequence: AtomicU64,
}

impl Channel {
    pub fn new(key: QualifiedKey) -> Self {
        Self {
            key,
            listeners: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &QualifiedKey {
        &self.key
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn emit(&self, origin: OriginTag, payload: Option<ErasedValue>) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot: SmallVec<[Listener; 4]> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        tracing::trace!(key = %self.key, listeners = snapshot.len(), "emit");

        let envelope = Envelope {
            key: self.key.clone(),
            origin,
            payload,
        };
        for listener in snapshot {
            if self.sequence.load(Ordering::SeqCst) != sequence {
                tracing::trace!(key = %self.key, "emit superseded by a nested emit");
                break;
            }
            listener(&envelope);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// The lazily-populated set of channels for one kind of key.
#[derive(Default)]
pub struct Channels {
    channels: DashMap<QualifiedKey, Arc<Channel>>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel for `key`, creating it on first use.
    pub fn channel(&self, key: &QualifiedKey) -> Arc<Channel> {
        if let Some(channel) = self.channels.get(key) {
            return Arc::clone(channel.value());
        }
        Arc::clone(
            self.channels
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Channel::new(key.clone())))
                .value(),
        )
    }

    pub fn get(&self, key: &QualifiedKey) -> Option<Arc<Channel>> {
        self.channels.get(key).map(|channel| Arc::clone(channel.value()))
    }

    pub fn add_listener<F>(&self, key: &QualifiedKey, listener: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.channel(key).add_listener(listener)
    }

    pub fn remove_listener(&self, key: &QualifiedKey, id: ListenerId) -> bool {
        self.get(key)
            .map(|channel| channel.remove_listener(id))
            .unwrap_or(false)
    }

    /// Emit on `key`'s channel. A key nobody listens to has no channel and
    /// the emission is dropped.
    pub fn emit(&self, key: &QualifiedKey, origin: OriginTag, payload: Option<ErasedValue>) {
        if let Some(channel) = self.get(key) {
            channel.emit(origin, payload);
        }
    }

    pub fn listener_count(&self, key: &QualifiedKey) -> usize {
        self.get(key)
            .map(|channel| channel.listener_count())
            .unwrap_or(0)
    }
}
