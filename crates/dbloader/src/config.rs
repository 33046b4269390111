//! Loader configuration.

use dbloader_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Loader configuration.
///
/// Deserializable so it can live alongside other service settings; absent
/// fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Most keys a single batch round may carry (`None` = unbounded)
    pub max_batch_size: Option<usize>,
    /// Log every generated statement at debug level
    pub log_statements: bool,
    /// Warn once an index has run this many single-key rounds (`None` = never)
    pub single_key_round_warn_threshold: Option<usize>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: None,
            log_statements: false,
            single_key_round_warn_threshold: Some(10),
        }
    }
}

impl LoaderConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Cap the number of keys per batch round.
    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.max_batch_size = Some(n);
        self
    }

    /// Let one batch round take every pending key.
    pub fn unbounded_batches(mut self) -> Self {
        self.max_batch_size = None;
        self
    }

    /// Enable/disable statement logging.
    pub fn log_statements(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    /// Set or disable the single-key round warning.
    pub fn single_key_round_warn_threshold(mut self, threshold: Option<usize>) -> Self {
        self.single_key_round_warn_threshold = threshold;
        self
    }

    /// Reject settings the loader cannot run with.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == Some(0) {
            return Err(Error::config("max_batch_size must be at least 1"));
        }
        if self.single_key_round_warn_threshold == Some(0) {
            return Err(Error::config(
                "single_key_round_warn_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.max_batch_size, None);
        assert!(!config.log_statements);
        assert_eq!(config.single_key_round_warn_threshold, Some(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LoaderConfig::new()
            .max_batch_size(500)
            .log_statements(true)
            .single_key_round_warn_threshold(None);
        assert_eq!(config.max_batch_size, Some(500));
        assert!(config.log_statements);
        assert_eq!(config.single_key_round_warn_threshold, None);
        assert_eq!(config.unbounded_batches().max_batch_size, None);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = LoaderConfig::from_json(r#"{"max_batch_size": 100}"#).unwrap();
        assert_eq!(config.max_batch_size, Some(100));
        assert_eq!(config.single_key_round_warn_threshold, Some(10));
    }

    #[test]
    fn test_from_json_rejects_zero_batch() {
        let err = LoaderConfig::from_json(r#"{"max_batch_size": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(LoaderConfig::from_json("not json").is_err());
    }
}
