//! Configuration using Figment
//!
//! Settings are layered from:
//! 1. built-in defaults
//! 2. a TOML file (`config/megatron.toml` unless another path is given)
//! 3. environment variables prefixed with `MEGATRON_`, nested keys separated
//!    by a double underscore
//!
//! ```text
//! MEGATRON_APPLICATION__LOG_LEVEL=debug
//! MEGATRON_LOGGER__FILE=/data/run42.csv
//! MEGATRON_LOGGER__PERIOD_SECS=0.5
//! ```
//!
//! The device table is replaced as a whole by a `[[devices]]` array in the
//! TOML file.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::error::DaqError;
use crate::script::{DeviceTable, MotionTiming};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/megatron.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for DaqError {
    fn from(e: ConfigError) -> Self {
        DaqError::Configuration(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub logger: LoggerConfig,
    pub motion: MotionConfig,
    pub devices: DeviceTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "megatron".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// CSV file the periodic logger appends to.
    pub file: PathBuf,
    pub period_secs: f64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("logs/megatron.csv"),
            period_secs: 1.0,
        }
    }
}

impl LoggerConfig {
    const MAX_PERIOD_SECS: f64 = 86_400.0;

    /// Sampling period. Only meaningful after [`Settings::validate`].
    pub fn period(&self) -> Duration {
        Duration::try_from_secs_f64(self.period_secs).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub settle_ms: u64,
    pub home_settle_ms: u64,
    pub stop_confirm_timeout_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        let timing = MotionTiming::default();
        Self {
            settle_ms: timing.settle.as_millis() as u64,
            home_settle_ms: timing.home_settle.as_millis() as u64,
            stop_confirm_timeout_ms: timing.stop_confirm_timeout.as_millis() as u64,
        }
    }
}

impl MotionConfig {
    pub fn timing(&self) -> MotionTiming {
        MotionTiming {
            settle: Duration::from_millis(self.settle_ms),
            home_settle: Duration::from_millis(self.home_settle_ms),
            stop_confirm_timeout: Duration::from_millis(self.stop_confirm_timeout_ms),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MEGATRON_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Checks:
    /// - log level is one of trace, debug, info, warn, error
    /// - logger period is positive and at most one day
    /// - the device table is not empty, names are unique and paths non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let period = self.logger.period_secs;
        if !(period > 0.0 && period <= LoggerConfig::MAX_PERIOD_SECS) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid logger period_secs {}. Must be in (0, {}]",
                period,
                LoggerConfig::MAX_PERIOD_SECS
            )));
        }

        if self.devices.is_empty() {
            return Err(ConfigError::ValidationError(
                "Device table is empty".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for entry in self.devices.entries() {
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device name '{}'",
                    entry.name
                )));
            }
            if entry.path.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' has an empty path",
                    entry.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::DeviceEntry;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.logger.period(), Duration::from_secs(1));
        assert_eq!(settings.motion.timing(), MotionTiming::default());
        assert_eq!(settings.devices.path("ION Power"), Some("ION_Pump_PS.Pwr_I"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_invalid_period() {
        for period in [0.0, -1.0, f64::NAN, 1e9] {
            let mut settings = Settings::default();
            settings.logger.period_secs = period;
            assert!(settings.validate().is_err(), "{period} accepted");
        }
    }

    #[test]
    fn test_duplicate_device_names() {
        let mut settings = Settings::default();
        settings.devices = DeviceTable::new(vec![
            DeviceEntry::new("Stage", "galil_rbv"),
            DeviceEntry::new("Stage", "galil_val"),
        ]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(msg)) if msg.contains("Duplicate")
        ));
    }

    #[test]
    fn test_load_from_toml_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "megatron.toml",
                r#"
                [application]
                log_level = "debug"

                [logger]
                file = "out/run.csv"

                [motion]
                settle_ms = 50

                [[devices]]
                name = "Stage"
                path = "galil_rbv"
                "#,
            )?;
            jail.set_env("MEGATRON_LOGGER__PERIOD_SECS", "0.25");

            let settings = Settings::load_from("megatron.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.application.log_level, "debug");
            assert_eq!(settings.application.name, "megatron");
            assert_eq!(settings.logger.file, PathBuf::from("out/run.csv"));
            assert_eq!(settings.logger.period(), Duration::from_millis(250));
            assert_eq!(settings.motion.settle_ms, 50);
            assert_eq!(settings.motion.home_settle_ms, 1000);
            assert_eq!(settings.devices.entries().len(), 1);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("absent.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_validation_error_converts_to_daq_error() {
        let err: DaqError = ConfigError::ValidationError("bad".to_string()).into();
        assert!(matches!(err, DaqError::Configuration(msg) if msg.contains("bad")));
    }
}
