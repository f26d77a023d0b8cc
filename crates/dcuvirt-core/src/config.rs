//! Configuration management for dcuvirt
//!
//! Configuration is layered: built-in defaults, then a YAML file, then
//! `DCUVIRT__*` environment variables.

use crate::types::{MigMode, DEFAULT_MEMORY_SLICES, MAX_SLICES};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Driver backend selection
    pub driver: DriverConfig,

    /// Partition manager policy
    pub partition: PartitionConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("DCUVIRT_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./dcuvirt.yaml", "/etc/dcuvirt/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        // DCUVIRT__LOGGING__LEVEL=debug
        builder = builder.add_source(
            config::Environment::with_prefix("DCUVIRT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        self.partition.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Serialize the configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parse a configuration from YAML text and validate it
    pub fn from_yaml(text: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(text)?;
        parsed.validate()?;
        Ok(parsed)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            partition: PartitionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Which driver implementation backs the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverBackend {
    /// In-memory driver
    Mock,
    /// Kernel module character device.
    ///
    /// Reserved: no kernel driver ships yet, so selecting it makes
    /// driver creation fail with an unsupported-backend error.
    Kernel,
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub backend: DriverBackend,

    /// Character device for the kernel backend. Reserved alongside
    /// [`DriverBackend::Kernel`]; the mock backend ignores it.
    pub device_node: PathBuf,

    /// Devices exposed by the mock backend
    pub mock_devices: Vec<MockDeviceConfig>,
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        let mut uuids = HashSet::new();
        for (i, device) in self.mock_devices.iter().enumerate() {
            device.validate(i)?;
            if let Some(uuid) = &device.uuid {
                if !uuids.insert(uuid.as_str()) {
                    return Err(crate::Error::config(format!(
                        "Duplicate mock device UUID: {}",
                        uuid
                    )));
                }
            }
        }

        if self.backend == DriverBackend::Mock && self.mock_devices.is_empty() {
            return Err(crate::Error::config(
                "Mock backend requires at least one mock device",
            ));
        }

        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: DriverBackend::Mock,
            device_node: PathBuf::from("/dev/mkfd"),
            mock_devices: vec![MockDeviceConfig::default(), MockDeviceConfig::default()],
        }
    }
}

/// Shape of one device served by the mock backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockDeviceConfig {
    pub name: String,

    /// Generated when absent
    pub uuid: Option<String>,

    pub compute_units: u32,

    /// Total memory in MiB
    pub memory_mb: u64,

    pub memory_slices: u32,

    pub mig_capable: bool,

    pub virtualization_capable: bool,
}

impl MockDeviceConfig {
    fn validate(&self, position: usize) -> Result<()> {
        if self.memory_slices == 0 || self.memory_slices > MAX_SLICES {
            return Err(crate::Error::config(format!(
                "Mock device {} memory_slices must be within 1..={}",
                position, MAX_SLICES
            )));
        }

        if self.compute_units == 0 {
            return Err(crate::Error::config(format!(
                "Mock device {} must have compute units",
                position
            )));
        }

        if self.memory_mb == 0 {
            return Err(crate::Error::config(format!(
                "Mock device {} must have memory",
                position
            )));
        }

        Ok(())
    }
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            name: "DCU Z100".to_string(),
            uuid: None,
            compute_units: 64,
            memory_mb: 32768,
            memory_slices: DEFAULT_MEMORY_SLICES,
            mig_capable: true,
            virtualization_capable: true,
        }
    }
}

/// Partition manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Maximum number of virtual devices per physical device
    pub max_vdevices_per_device: u32,

    /// System-wide MIG mode applied when the manager starts
    pub system_mig_mode: MigMode,
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_vdevices_per_device == 0 {
            return Err(crate::Error::config(
                "max_vdevices_per_device must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            max_vdevices_per_device: 8,
            system_mig_mode: MigMode::Enabled,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Show thread IDs in logs
    pub show_thread_ids: bool,

    /// Show line numbers in logs
    pub show_line_numbers: bool,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(crate::Error::config(format!("Unknown log level: {}", other)));
            }
        }

        match self.format.to_lowercase().as_str() {
            "text" | "json" => Ok(()),
            other => Err(crate::Error::config(format!("Unknown log format: {}", other))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver.backend, DriverBackend::Mock);
        assert_eq!(config.driver.mock_devices.len(), 2);
        assert_eq!(config.partition.max_vdevices_per_device, 8);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config, parsed);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_invalid_slices_rejected() {
        let mut config = Config::default();
        config.driver.mock_devices[0].memory_slices = 65;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfiguration(_)));

        config.driver.mock_devices[0].memory_slices = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let mut config = Config::default();
        config.driver.mock_devices[0].uuid = Some("GPU-1".to_string());
        config.driver.mock_devices[1].uuid = Some("GPU-1".to_string());
        assert!(config.validate().is_err());

        config.driver.mock_devices[1].uuid = Some("GPU-2".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partition_and_logging_validation() {
        let mut config = Config::default();
        config.partition.max_vdevices_per_device = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_mock_backend_rejected() {
        let mut config = Config::default();
        config.driver.mock_devices.clear();
        assert!(config.validate().is_err());

        config.driver.backend = DriverBackend::Kernel;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "partition:\n  max_vdevices_per_device: 4\n  system_mig_mode: disabled\nlogging:\n  level: debug\n  format: json"
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.partition.max_vdevices_per_device, 4);
        assert_eq!(config.partition.system_mig_mode, MigMode::Disabled);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.driver.backend, DriverBackend::Mock);
    }

    #[test]
    fn test_load_from_invalid_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "partition:\n  max_vdevices_per_device: 0").unwrap();

        assert!(Config::load_from_file(file.path()).is_err());
    }
}
