//! KTA runtime configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default capacity of the command queue
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 32;

/// Upper bound of commands handed to KA in a single poll
pub const MAX_POLL_BATCH: usize = 32;

/// Hard ceiling for a configured queue depth
const QUEUE_DEPTH_CEILING: usize = 1024;

/// Configuration for a Key Trust Agent instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KtaConfig {
    /// Directory holding sealed records
    pub storage_dir: String,
    /// Root secret of the simulated hardware sealing key
    pub device_secret: String,
    /// Capacity of the command queue
    pub max_queue_depth: usize,
    /// Commands drained per GET_REQUEST
    pub max_batch: usize,
    /// Fail shipped commands left unanswered for this many polls (None = never)
    pub reply_timeout_polls: Option<u32>,
}

impl Default for KtaConfig {
    fn default() -> Self {
        Self {
            storage_dir: "kta-sealed".to_string(),
            device_secret: "kta-simulated-device-secret".to_string(),
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_batch: MAX_POLL_BATCH,
            reply_timeout_polls: None,
        }
    }
}

impl KtaConfig {
    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        let config: KtaConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_depth == 0 || self.max_queue_depth > QUEUE_DEPTH_CEILING {
            return Err(ConfigError::Invalid(format!(
                "max_queue_depth must be in 1..={}, got {}",
                QUEUE_DEPTH_CEILING, self.max_queue_depth
            )));
        }
        if self.max_batch == 0 || self.max_batch > MAX_POLL_BATCH {
            return Err(ConfigError::Invalid(format!(
                "max_batch must be in 1..={}, got {}",
                MAX_POLL_BATCH, self.max_batch
            )));
        }
        if self.reply_timeout_polls == Some(0) {
            return Err(ConfigError::Invalid(
                "reply_timeout_polls must be at least 1 when set".into(),
            ));
        }
        if self.device_secret.is_empty() {
            return Err(ConfigError::Invalid("device_secret must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Read(String),

    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = KtaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_queue_depth, DEFAULT_MAX_QUEUE_DEPTH);
        assert!(config.reply_timeout_polls.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("kta-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{ "max_queue_depth": 4, "reply_timeout_polls": 3 }"#).unwrap();

        let config = KtaConfig::load(&path).unwrap();
        assert_eq!(config.max_queue_depth, 4);
        assert_eq!(config.reply_timeout_polls, Some(3));
        assert_eq!(config.max_batch, MAX_POLL_BATCH);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let mut config = KtaConfig::default();
        config.max_batch = 33;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = KtaConfig::default();
        config.max_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = KtaConfig::default();
        config.reply_timeout_polls = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = KtaConfig::load_or_default("/nonexistent/kta-config.json").unwrap();
        assert_eq!(config.storage_dir, "kta-sealed");
    }
}
