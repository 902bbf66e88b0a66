//! Error types for the state engine.
//!
//! Most engine-internal faults never reach a consumer: they are logged and
//! the engine falls back to a default or previous value. `StateError` is what
//! user callbacks (filter computes, effect hooks, storage providers) return,
//! and what the few misuse-prone operations report.

use std::fmt::Display;

use thiserror::Error;

use crate::registry::QualifiedKey;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The key exists but has no resolved value yet (async default,
    /// pending filter, or a filter whose compute never succeeded).
    #[error("`{key}` has no resolved value yet")]
    Pending { key: QualifiedKey },

    /// A declaration was used with a value type that differs from the one
    /// already stored under the same qualified key.
    #[error("`{key}` holds a value of a different type than requested")]
    TypeMismatch { key: QualifiedKey },

    #[error("could not serialize `{key}`: {message}")]
    Serialization { key: String, message: String },

    #[error("storage provider failed: {0}")]
    Storage(String),

    #[error("dependency cycle detected while computing `{key}`")]
    Cycle { key: QualifiedKey },

    #[error("filter `{key}` exceeded the maximum dependency depth of {limit}")]
    DepthExceeded { key: QualifiedKey, limit: usize },

    #[error("atom `{key}` has no action named `{action}`")]
    UnknownAction { key: QualifiedKey, action: String },

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Custom(String),
}

impl StateError {
    /// Build an error from any displayable message.
    ///
    /// Intended for filter computes and effect hooks that need to bail out.
    pub fn custom(message: impl Display) -> Self {
        Self::Custom(message.to_string())
    }

    pub fn storage(message: impl Display) -> Self {
        Self::Storage(message.to_string())
    }

    pub(crate) fn serialization(key: impl Display, err: &serde_json::Error) -> Self {
        Self::Serialization {
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    /// Whether this error only means "not resolved yet".
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}
