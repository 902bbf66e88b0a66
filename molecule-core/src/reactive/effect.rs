//! Effect Hooks
//!
//! An atom can declare an ordered list of effect hooks. Every write runs
//! them after the previous cycle's cleanups and before the commit:
//!
//! 1. Cleanups returned during the previous update cycle run first.
//! 2. Hooks run in declaration order, each seeing `{previous, state,
//!    dispatch, cancel}`.
//! 3. If any hook cancels synchronously (through the token or by returning
//!    [`EffectOutcome::Cancel`]) the remaining hooks are skipped and the
//!    write does not commit.
//!
//! # Deferred outcomes
//!
//! A hook may hand back a future instead of deciding right away. The commit
//! does not wait for it. When the future resolves:
//!
//! - `Cleanup` is queued for the next update cycle;
//! - `Cancel` cannot undo the commit that already happened. It is counted
//!   as a late veto, logged, and the originating consumer is flagged for
//!   re-run.
//!
//! A hook that returns `Err` flags the consumer for re-run as well; the
//! commit still proceeds.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::atom::Writer;
use crate::error::Result;
use crate::registry::{QualifiedKey, StateType};

pub type Cleanup = Box<dyn FnOnce() + Send>;

pub type EffectHook<T> = Arc<dyn Fn(&EffectContext<T>) -> Result<EffectOutcome> + Send + Sync>;

/// Synchronous veto for the write in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an effect hook sees.
pub struct EffectContext<T> {
    /// Canonical value before this write; `None` if it was unresolved.
    pub previous: Option<T>,
    /// The value about to be committed.
    pub state: T,
    /// Writer for the same atom. Calls made here are nested writes.
    pub dispatch: Writer<T>,
    pub cancel: CancelToken,
}

pub enum EffectOutcome {
    Continue,
    Cancel,
    Cleanup(Cleanup),
    Deferred(BoxFuture<'static, DeferredOutcome>),
}

impl EffectOutcome {
    pub fn cleanup<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Cleanup(Box::new(cleanup))
    }

    pub fn deferred<F>(outcome: F) -> Self
    where
        F: Future<Output = DeferredOutcome> + Send + 'static,
    {
        Self::Deferred(outcome.boxed())
    }
}

pub enum DeferredOutcome {
    Continue,
    Cancel,
    Cleanup(Cleanup),
}

impl DeferredOutcome {
    pub fn cleanup<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Cleanup(Box::new(cleanup))
    }
}

#[derive(Default)]
pub(crate) struct EffectRun {
    pub(crate) cancelled: bool,
    pub(crate) failed: bool,
    pub(crate) cleanups: Vec<Cleanup>,
    pub(crate) deferred: Vec<BoxFuture<'static, DeferredOutcome>>,
}

pub(crate) fn run_effects<T: StateType>(
    key: &QualifiedKey,
    hooks: &[EffectHook<T>],
    previous: Option<T>,
    state: T,
    dispatch: &Writer<T>,
) -> EffectRun {
    let mut run = EffectRun::default();
    if hooks.is_empty() {
        return run;
    }

    let cancel = CancelToken::default();
    let ctx = EffectContext {
        previous,
        state,
        dispatch: dispatch.clone(),
        cancel: cancel.clone(),
    };

    for hook in hooks {
        match hook(&ctx) {
            Ok(EffectOutcome::Continue) => {}
            Ok(EffectOutcome::Cancel) => cancel.cancel(),
            Ok(EffectOutcome::Cleanup(cleanup)) => run.cleanups.push(cleanup),
            Ok(EffectOutcome::Deferred(outcome)) => run.deferred.push(outcome),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "effect hook failed");
                run.failed = true;
            }
        }
        if cancel.is_cancelled() {
            run.cancelled = true;
            break;
        }
    }
    run
}
