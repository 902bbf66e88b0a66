//! Qualified keys.
//!
//! A qualified key is the unit of canonical-value identity: an optional
//! scope name plus the short name an atom or filter was declared with.

use std::fmt;
use std::sync::Arc;

/// Scope name + short name.
///
/// Equality and hashing use the pair, so `("a", "b-c")` and `("a-b", "c")`
/// are distinct keys even though they share the same storage form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedKey {
    scope: Option<Arc<str>>,
    name: Arc<str>,
}

impl QualifiedKey {
    /// Build a key. An empty scope name is treated as no scope.
    pub fn new(scope: Option<&str>, name: &str) -> Self {
        Self {
            scope: scope.filter(|s| !s.is_empty()).map(Arc::from),
            name: Arc::from(name),
        }
    }

    pub(crate) fn from_parts(scope: Option<Arc<str>>, name: &str) -> Self {
        Self {
            scope: scope.filter(|s| !s.is_empty()),
            name: Arc::from(name),
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this key lives in the given scope (`None` = unscoped).
    pub fn in_scope(&self, scope: Option<&str>) -> bool {
        self.scope() == scope.filter(|s| !s.is_empty())
    }

    /// The key under which values are written to a persistence provider.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}-{}", scope, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_keys_use_the_short_name() {
        let key = QualifiedKey::new(None, "clicks");
        assert_eq!(key.storage_key(), "clicks");
        assert!(key.in_scope(None));
    }

    #[test]
    fn empty_scope_is_no_scope() {
        assert_eq!(
            QualifiedKey::new(Some(""), "clicks"),
            QualifiedKey::new(None, "clicks")
        );
    }

    #[test]
    fn same_name_different_scope_is_a_different_key() {
        let a = QualifiedKey::new(Some("A"), "count");
        let b = QualifiedKey::new(Some("B"), "count");
        assert_ne!(a, b);
        assert_eq!(a.storage_key(), "A-count");
        assert!(a.in_scope(Some("A")));
        assert!(!a.in_scope(Some("B")));
    }
}
