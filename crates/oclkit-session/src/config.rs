//! Session configuration.
//!
//! Loads [`SessionConfig`] from a TOML file (`oclkit.toml`) with environment
//! variable overrides via `OCLKIT_*` prefixed variables.

use crate::driver::DriverKind;
use crate::platform::DeviceType;
use crate::program::signature;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Session configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Driver to open (`reference` or `opencl`).
    /// Override: `OCLKIT_DRIVER`
    pub driver: DriverKind,

    /// Device type filter, e.g. `"gpu"` or `"cpu,accelerator"`.
    /// Override: `OCLKIT_DEVICE_TYPE`
    #[serde(with = "device_type_str")]
    pub device_type: DeviceType,

    /// Restrict device selection to one platform (zero-based).
    /// Override: `OCLKIT_PLATFORM_INDEX`
    pub platform_index: Option<usize>,

    /// Options handed to the program build, e.g. `-D WIDTH=6`.
    /// Override: `OCLKIT_BUILD_OPTIONS`
    pub build_options: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Reference,
            device_type: DeviceType::GPU,
            platform_index: None,
            build_options: String::new(),
        }
    }
}

mod device_type_str {
    use crate::platform::DeviceType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DeviceType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string().to_lowercase().replace(' ', ","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DeviceType, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when loading or validating a [`SessionConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl SessionConfig {
    /// Default configuration as a TOML document.
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: SessionConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_type.is_empty() {
            return Err(ConfigError::Validation("device_type must name at least one type".into()));
        }
        signature::validate_options(&self.build_options)
            .map_err(|reason| ConfigError::Validation(format!("build_options: {reason}")))?;
        Ok(())
    }

    /// Apply `OCLKIT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("OCLKIT_DRIVER") {
            self.driver = val.parse::<DriverKind>().map_err(|reason| ConfigError::EnvOverride {
                key: "OCLKIT_DRIVER".into(),
                value: val.clone(),
                reason,
            })?;
        }

        if let Ok(val) = std::env::var("OCLKIT_DEVICE_TYPE") {
            self.device_type = val.parse::<DeviceType>().map_err(|reason| ConfigError::EnvOverride {
                key: "OCLKIT_DEVICE_TYPE".into(),
                value: val.clone(),
                reason,
            })?;
        }

        if let Ok(val) = std::env::var("OCLKIT_PLATFORM_INDEX") {
            self.platform_index = match val.trim() {
                "" | "any" => None,
                idx => Some(idx.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
                    key: "OCLKIT_PLATFORM_INDEX".into(),
                    value: val.clone(),
                    reason: e.to_string(),
                })?),
            };
        }

        if let Ok(val) = std::env::var("OCLKIT_BUILD_OPTIONS") {
            self.build_options = val;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = ["OCLKIT_DRIVER", "OCLKIT_DEVICE_TYPE", "OCLKIT_PLATFORM_INDEX", "OCLKIT_BUILD_OPTIONS"];

    fn clean_env<R>(f: impl FnOnce() -> R) -> R {
        temp_env::with_vars(VARS.map(|k| (k, None::<&str>)), f)
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let toml_str = SessionConfig::default_toml().unwrap();
        let cfg: SessionConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, SessionConfig::default());
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_from_toml_full() {
        let toml_str = r#"
driver = "reference"
device_type = "cpu,accelerator"
platform_index = 1
build_options = "-D WIDTH=6"
"#;
        let cfg = clean_env(|| SessionConfig::from_toml(toml_str)).unwrap();
        assert_eq!(cfg.driver, DriverKind::Reference);
        assert_eq!(cfg.device_type, DeviceType::CPU | DeviceType::ACCELERATOR);
        assert_eq!(cfg.platform_index, Some(1));
        assert_eq!(cfg.build_options, "-D WIDTH=6");
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_missing_fields_take_defaults() {
        let cfg = clean_env(|| SessionConfig::from_toml("device_type = \"all\"")).unwrap();
        assert_eq!(cfg.device_type, DeviceType::ALL);
        assert_eq!(cfg.driver, DriverKind::Reference);
        assert_eq!(cfg.platform_index, None);
    }

    #[test]
    fn test_validation_rejects_unknown_build_option() {
        let cfg = SessionConfig { build_options: "--fast-math-please".into(), ..SessionConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("build_options"), "{err}");
    }

    #[test]
    fn test_validation_rejects_empty_device_type() {
        let cfg = SessionConfig { device_type: DeviceType::empty(), ..SessionConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_bad_device_type_in_toml() {
        let err = SessionConfig::from_toml("device_type = \"fpga\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("OCLKIT_DRIVER", Some("ref")),
                ("OCLKIT_DEVICE_TYPE", Some("cpu")),
                ("OCLKIT_PLATFORM_INDEX", Some("2")),
                ("OCLKIT_BUILD_OPTIONS", Some("-DN=4")),
            ],
            || {
                let cfg = SessionConfig::from_env().unwrap();
                assert_eq!(cfg.driver, DriverKind::Reference);
                assert_eq!(cfg.device_type, DeviceType::CPU);
                assert_eq!(cfg.platform_index, Some(2));
                assert_eq!(cfg.build_options, "-DN=4");
            },
        );
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_env_override_beats_file() {
        temp_env::with_vars(
            [
                ("OCLKIT_DRIVER", None),
                ("OCLKIT_DEVICE_TYPE", Some("gpu")),
                ("OCLKIT_PLATFORM_INDEX", None),
                ("OCLKIT_BUILD_OPTIONS", None),
            ],
            || {
                let cfg = SessionConfig::from_toml("device_type = \"cpu\"").unwrap();
                assert_eq!(cfg.device_type, DeviceType::GPU);
            },
        );
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_invalid_env_override() {
        temp_env::with_vars(
            [
                ("OCLKIT_DRIVER", None),
                ("OCLKIT_DEVICE_TYPE", None),
                ("OCLKIT_PLATFORM_INDEX", Some("first")),
                ("OCLKIT_BUILD_OPTIONS", None),
            ],
            || {
                let err = SessionConfig::from_env().unwrap_err();
                match err {
                    ConfigError::EnvOverride { key, value, .. } => {
                        assert_eq!(key, "OCLKIT_PLATFORM_INDEX");
                        assert_eq!(value, "first");
                    }
                    other => panic!("unexpected error: {other}"),
                }
            },
        );
    }

    #[test]
    #[serial(oclkit_env)]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oclkit.toml");
        std::fs::write(&path, "driver = \"reference\"\ndevice_type = \"default\"\n").unwrap();
        let cfg = clean_env(|| SessionConfig::load(&path)).unwrap();
        assert_eq!(cfg.device_type, DeviceType::DEFAULT);
    }

    #[test]
    fn test_load_missing_file() {
        let err = SessionConfig::load(Path::new("/nonexistent/oclkit.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
