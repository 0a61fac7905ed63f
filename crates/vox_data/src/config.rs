//! Data model configuration
//!
//! ```toml
//! coordinator_thread_name = "vox-coordinator"
//! verbose_containers = false
//! warn_on_aborted_updates = true
//! notification_capacity = 256
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Configuration shared by all objects of a [`crate::DataContext`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataModelConfig {
    /// Name of the coordinator thread
    pub coordinator_thread_name: String,
    /// Log every container link change at debug level
    pub verbose_containers: bool,
    /// Log a warning when a dropped update has to be auto-finished
    pub warn_on_aborted_updates: bool,
    /// Capacity of channel subscriptions (`None` = unbounded)
    pub notification_capacity: Option<usize>,
}

impl Default for DataModelConfig {
    fn default() -> Self {
        Self {
            coordinator_thread_name: "vox-coordinator".to_string(),
            verbose_containers: false,
            warn_on_aborted_updates: true,
            notification_capacity: None,
        }
    }
}

impl DataModelConfig {
    /// Parse a configuration from TOML
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator_thread_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "coordinator_thread_name must not be empty".to_string(),
            ));
        }
        if self.notification_capacity == Some(0) {
            return Err(ConfigError::Validation(
                "notification_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = DataModelConfig::from_toml_str("").unwrap();
        assert_eq!(config, DataModelConfig::default());
    }

    #[test]
    fn test_parse_overrides() {
        let config = DataModelConfig::from_toml_str(
            r#"
            coordinator_thread_name = "main"
            verbose_containers = true
            notification_capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.coordinator_thread_name, "main");
        assert!(config.verbose_containers);
        assert!(config.warn_on_aborted_updates);
        assert_eq!(config.notification_capacity, Some(16));
    }

    #[test]
    fn test_rejects_unknown_and_invalid() {
        assert!(matches!(
            DataModelConfig::from_toml_str("threads = 4"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            DataModelConfig::from_toml_str("notification_capacity = 0"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = DataModelConfig::load("/nonexistent/vox.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
