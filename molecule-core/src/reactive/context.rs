//! Compute Context
//!
//! Tracks which filters are currently being computed on this thread. A
//! filter whose compute function reads another filter pushes a new entry,
//! so the stack mirrors the dependency chain being walked.
//!
//! The stack is what lets the engine refuse dependency cycles: reading a
//! filter that is already on the stack can never terminate, and a chain
//! longer than the configured depth is treated the same way. Both surface
//! as errors from the compute, which the filter engine turns into a
//! fallback to the filter's default.

use std::cell::RefCell;

use crate::error::{Result, StateError};
use crate::registry::QualifiedKey;

thread_local! {
    static COMPUTE_STACK: RefCell<Vec<QualifiedKey>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the stack entry when dropped.
///
/// This keeps the stack balanced even if a compute function panics.
pub struct ComputeContext {
    key: QualifiedKey,
}

impl ComputeContext {
    /// Enter the compute context of `key`.
    ///
    /// Fails if `key` is already being computed further down the stack, or
    /// if the stack is already `max_depth` entries deep.
    pub fn enter(key: &QualifiedKey, max_depth: usize) -> Result<Self> {
        COMPUTE_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(key) {
                return Err(StateError::Cycle { key: key.clone() });
            }
            if stack.len() >= max_depth {
                return Err(StateError::DepthExceeded {
                    key: key.clone(),
                    limit: max_depth,
                });
            }
            stack.push(key.clone());
            Ok(Self { key: key.clone() })
        })
    }

    /// Whether `key` is somewhere on the current stack.
    pub fn is_computing(key: &QualifiedKey) -> bool {
        COMPUTE_STACK.with(|stack| stack.borrow().contains(key))
    }

    /// Number of nested computes in progress.
    pub fn depth() -> usize {
        COMPUTE_STACK.with(|stack| stack.borrow().len())
    }

    /// The innermost filter being computed, if any.
    pub fn current() -> Option<QualifiedKey> {
        COMPUTE_STACK.with(|stack| stack.borrow().last().cloned())
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        COMPUTE_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(key) = popped {
                debug_assert_eq!(
                    key, self.key,
                    "ComputeContext mismatch: expected {}, got {}",
                    self.key, key
                );
            }
        });
    }
}
