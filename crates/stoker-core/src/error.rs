//! Error types for Stoker

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using StokerError
pub type Result<T> = std::result::Result<T, StokerError>;

/// Main error type for Stoker operations
#[derive(Debug, Error)]
pub enum StokerError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Persistent cache errors
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent (disk) cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored entry does not match the requested fingerprint
    #[error("Corrupt cache entry at {0}")]
    Corrupt(PathBuf),
}

impl StokerError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_transparent() {
        let err: StokerError = ConfigError::InvalidValue {
            field: "engine.disk_threads".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: engine.disk_threads - must be at least 1"
        );
    }

    #[test]
    fn test_other_error() {
        let err = StokerError::other("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
