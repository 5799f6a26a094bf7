//! Runtime configuration.
//!
//! Loaded from TOML; every field has a default so partial files work.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Deliver trace events to registered observers.
    pub emit_trace_events: bool,

    /// Maximum nesting of dispatches made from inside implementations.
    pub max_dispatch_depth: usize,

    /// Read and write an object's own fields when no layer provides a
    /// property accessor.
    pub property_field_fallback: bool,

    /// Log mixin conflicts at `warn` level (they are always returned and traced).
    pub log_mixin_conflicts: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            emit_trace_events: true,
            max_dispatch_depth: 256,
            property_field_fallback: true,
            log_mixin_conflicts: true,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_dispatch_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_dispatch_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str("max_dispatch_depth = 8\n").unwrap();
        assert_eq!(config.max_dispatch_depth, 8);
        assert!(config.emit_trace_events);
        assert!(config.property_field_fallback);
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = RuntimeConfig::from_toml_str("max_dispatch_depth = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_toml() {
        let err = RuntimeConfig::from_toml_str("max_dispatch_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "emit_trace_events = false").unwrap();
        writeln!(file, "log_mixin_conflicts = false").unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert!(!config.emit_trace_events);
        assert!(!config.log_mixin_conflicts);
        assert_eq!(config.max_dispatch_depth, 256);
    }

    #[test]
    fn test_missing_file() {
        let err = RuntimeConfig::load("/nonexistent/mop.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
