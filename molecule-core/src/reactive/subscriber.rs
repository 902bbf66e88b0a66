//! Identity tokens for the reactive system.
//!
//! - `OriginTag` marks who caused an emission, so a consumer can ignore
//!   envelopes its own writer produced.
//! - `ListenerId` identifies one registration on a channel.
//! - `DeclarationId` identifies one `Atom`/`Filter` declaration, so the
//!   engine can notice when a key is re-declared with a different descriptor.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Generate a new unique ID.
            ///
            /// Uses an atomic counter to ensure uniqueness across threads.
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(1);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

counter_id! {
    /// Per-consumer-instance token attached to every envelope it causes.
    OriginTag
}

counter_id! {
    /// Handle for removing a listener from a channel.
    ListenerId
}

counter_id! {
    /// Identity of one atom or filter declaration.
    DeclarationId
}
