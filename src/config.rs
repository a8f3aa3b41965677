//! Registry configuration
//!
//! Loaded from YAML or built from defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum number of simultaneously registered devices
pub const MAX_DEVICES: usize = 32;

/// Default depth of the registry event channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Device registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Upper bound on registered devices
    pub capacity: usize,
    /// Buffered events per subscriber before lagging
    pub event_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_DEVICES,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Parse a configuration from YAML text
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Reject values the registry cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Configuration("capacity must be at least 1".into()));
        }
        if self.capacity >= u32::MAX as usize {
            return Err(Error::Configuration(format!(
                "capacity {} exceeds the device id range",
                self.capacity
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration(
                "event_channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.capacity, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = RegistryConfig::from_yaml_str("capacity: 4\n").unwrap();
        assert_eq!(config.capacity, 4);
        assert_eq!(config.event_channel_capacity, DEFAULT_EVENT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_matches!(
            RegistryConfig::from_yaml_str("capacity: 0\n"),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_malformed_yaml() {
        assert_matches!(
            RegistryConfig::from_yaml_str("capacity: [1, 2"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "capacity: 8").unwrap();
        writeln!(file, "event_channel_capacity: 16").unwrap();

        let config = RegistryConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(
            config,
            RegistryConfig {
                capacity: 8,
                event_channel_capacity: 16,
            }
        );
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            RegistryConfig::from_yaml_file("/nonexistent/devmgr.yaml"),
            Err(Error::Io(_))
        );
    }
}
