//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Settings for one `Store`.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust,ignore
/// let config = StoreConfig::from_json(r#"{ "default_scope": "app" }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Scope name used by `Store::root()`. `None` produces unprefixed keys.
    pub default_scope: Option<String>,

    /// Longest chain of filters reading filters allowed during one compute.
    pub max_filter_depth: usize,

    /// Log a warning when a key is re-declared with a different descriptor.
    pub warn_on_redeclare: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_scope: None,
            max_filter_depth: 64,
            warn_on_redeclare: true,
        }
    }
}

impl StoreConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| StateError::Config(e.to_string()))?;
        if config.max_filter_depth == 0 {
            return Err(StateError::Config(
                "max_filter_depth must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn with_default_scope(mut self, scope: impl Into<String>) -> Self {
        self.default_scope = Some(scope.into());
        self
    }

    pub fn with_max_filter_depth(mut self, depth: usize) -> Self {
        self.max_filter_depth = depth.max(1);
        self
    }
}
