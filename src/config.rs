//! Coordinator configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::IsolationLevel;
use crate::transaction::DEFAULT_SAVEPOINT_PREFIX;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("savepoint prefix {0:?} is not a valid SQL identifier")]
    InvalidSavepointPrefix(String),
}

/// Coordinator configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Prefix of generated savepoint names.
    pub savepoint_prefix: String,
    /// Log every statement the coordinator issues at debug level.
    pub log_statements: bool,
    /// Isolation level for root transactions that do not request one.
    pub default_isolation: Option<IsolationLevel>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            savepoint_prefix: DEFAULT_SAVEPOINT_PREFIX.to_string(),
            log_statements: false,
            default_isolation: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Set the savepoint prefix.
    pub fn savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.savepoint_prefix = prefix.into();
        self
    }

    /// Set log_statements flag.
    pub fn log_statements(mut self, value: bool) -> Self {
        self.log_statements = value;
        self
    }

    /// Set the default isolation level.
    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = Some(level);
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !crate::transaction::is_identifier(&self.savepoint_prefix) {
            return Err(ConfigError::InvalidSavepointPrefix(
                self.savepoint_prefix.clone(),
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
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.savepoint_prefix, "sp");
        assert!(!config.log_statements);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CoordinatorConfig::from_json_str(
            r#"{ "log_statements": true, "default_isolation": "serializable" }"#,
        )
        .unwrap();
        assert_eq!(config.savepoint_prefix, "sp");
        assert!(config.log_statements);
        assert_eq!(config.default_isolation, Some(IsolationLevel::Serializable));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let err = CoordinatorConfig::from_json_str(r#"{ "savepoint_prefix": "sp-1" }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSavepointPrefix(_)));
        assert!(CoordinatorConfig::new().savepoint_prefix("").validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "savepoint_prefix": "txnest" }}"#).unwrap();
        let config = CoordinatorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.savepoint_prefix, "txnest");

        let missing = CoordinatorConfig::from_file(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
