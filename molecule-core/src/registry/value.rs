//! Type-erased state values.
//!
//! Atoms and filters are typed at the API boundary, but the registry and
//! the channels carry values of every key side by side. `ErasedValue` keeps
//! the original value behind an `Arc` and remembers how to compare and
//! serialize it.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bound shared by every value an atom or filter can hold.
pub trait StateType:
    Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> StateType for T where
    T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

trait ValueObject: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn to_json(&self) -> serde_json::Result<serde_json::Value>;
    fn eq_dyn(&self, other: &dyn ValueObject) -> bool;
    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T: StateType> ValueObject for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    fn eq_dyn(&self, other: &dyn ValueObject) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            // Different Rust types: fall back to serialized equality.
            None => match (self.to_json(), other.to_json()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }

    fn fmt_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A shared, type-erased state value.
#[derive(Clone)]
pub struct ErasedValue(Arc<dyn ValueObject>);

impl ErasedValue {
    pub fn new<T: StateType>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Clone the value out if it has type `T`.
    pub fn downcast<T: StateType>(&self) -> Option<T> {
        self.0.as_any().downcast_ref::<T>().cloned()
    }

    pub fn is<T: StateType>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        self.0.to_json()
    }
}

impl PartialEq for ErasedValue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.eq_dyn(&*other.0)
    }
}

impl Debug for ErasedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_debug(f)
    }
}
