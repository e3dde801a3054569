//! Factory-wide settings.
//!
//! Settings deserialize from JSON with every field optional:
//!
//! ```ignore
//! let settings = Settings::from_json_str(r#"{ "max_fetch_depth": 2, "show_sql": true }"#)?;
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};

/// Tunables shared by every session of a factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Maximum outer-join depth for single-ended associations (`None` = unbounded).
    pub max_fetch_depth: Option<usize>,
    /// Batch size used for persisters and collections without their own.
    pub default_batch_fetch_size: usize,
    /// Sort inserts so referenced rows are written first.
    pub order_inserts: bool,
    /// Consult and populate second-level cache regions.
    pub use_second_level_cache: bool,
    /// Log every statement at `info` instead of `debug`.
    pub show_sql: bool,
    /// Load entities read-only unless a query says otherwise.
    pub default_read_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_fetch_depth: Some(3),
            default_batch_fetch_size: 1,
            order_inserts: false,
            use_second_level_cache: false,
            show_sql: false,
            default_read_only: false,
        }
    }
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid settings: {}", e),
                source: Some(Box::new(e)),
            })
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    #[must_use]
    pub fn max_fetch_depth(mut self, depth: Option<usize>) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    #[must_use]
    pub fn default_batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    #[must_use]
    pub fn use_second_level_cache(mut self, enabled: bool) -> Self {
        self.use_second_level_cache = enabled;
        self
    }

    #[must_use]
    pub fn show_sql(mut self, enabled: bool) -> Self {
        self.show_sql = enabled;
        self
    }

    #[must_use]
    pub fn default_read_only(mut self, enabled: bool) -> Self {
        self.default_read_only = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = Settings::from_json_str(r#"{ "show_sql": true }"#).unwrap();
        assert!(settings.show_sql);
        assert_eq!(settings.max_fetch_depth, Some(3));
        assert_eq!(settings.default_batch_fetch_size, 1);
    }

    #[test]
    fn test_unbounded_depth() {
        let settings = Settings::from_json_str(r#"{ "max_fetch_depth": null }"#).unwrap();
        assert_eq!(settings.max_fetch_depth, None);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Settings::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings::default().order_inserts(true).default_batch_fetch_size(8);
        std::fs::write(&path, serde_json::to_string(&settings).unwrap()).unwrap();
        assert_eq!(Settings::from_json_file(&path).unwrap(), settings);
    }
}
