//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/shock_logger.toml`)
//! 2. environment variables prefixed with `SHOCK_LOGGER_`, nested keys
//!    separated by a double underscore
//!    (e.g. `SHOCK_LOGGER_STORAGE__OUTPUT_DIR=/home/pi/runs`)
//!
//! The configuration is read once before acquisition and never reloaded.
//! Channel-level checks (missing calibration profile, degenerate voltage
//! domain) belong to [`crate::registry::ChannelRegistry::build`]; the
//! [`LoggerConfig::validate`] pass here covers the scalar settings.
//!
//! # Example
//! ```no_run
//! use shock_logger::config::LoggerConfig;
//!
//! let config = LoggerConfig::load()?;
//! config.validate()?;
//! println!("Writing to {}", config.storage.output_dir.display());
//! # Ok::<(), shock_logger::error::LoggerError>(())
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumptionPolicy;
use crate::error::{AppResult, LoggerError};
use crate::hardware::{HardwareRange, InputMode};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/shock_logger.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SHOCK_LOGGER_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Scan settings and channel list
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Calibration profiles by name
    #[serde(default)]
    pub calibration: BTreeMap<String, CalibrationProfile>,
    /// Output settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Device backend ("simulated" is the only software backend)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Circular buffer depth per channel
    #[serde(default = "default_samples_per_channel")]
    pub samples_per_channel: usize,
    /// Requested scan rate in Hz
    #[serde(default = "default_rate")]
    pub rate_hz: f64,
    /// Idle wait between cursor polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How many new cycles to consume per poll
    #[serde(default)]
    pub consumption: ConsumptionPolicy,
    /// Channels in buffer order
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Settings for the simulated backend
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// One scanned channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Hardware channel number
    pub id: u32,
    /// Name of the calibration profile
    pub profile: String,
    /// Input wiring mode
    #[serde(default)]
    pub input_mode: InputMode,
    /// Hardware input range
    #[serde(default)]
    pub range: HardwareRange,
    /// Display name for raw voltages
    pub name_raw: Option<String>,
    /// Display name for calibrated values
    pub name_mapped: Option<String>,
}

/// Linear calibration shared by every channel of one sensor type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub min_voltage: f64,
    pub max_voltage: f64,
    pub min_value: f64,
    pub max_value: f64,
    /// Engineering unit label
    #[serde(default)]
    pub unit: String,
}

/// Simulated producer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Peak uniform noise added to every sample, in volts
    #[serde(default = "default_noise")]
    pub noise_volts: f64,
    /// Report a scan fault after this many cycles
    #[serde(default)]
    pub fault_after_cycles: Option<u64>,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving the CSV files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Pointer file name, relative to `output_dir` unless absolute
    #[serde(default = "default_pointer_file")]
    pub pointer_file: PathBuf,
    /// File name stem after the timestamp
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Decimal places written for every value
    #[serde(default = "default_precision")]
    pub precision: usize,
    /// Copy the configuration file next to the outputs
    #[serde(default = "default_archive_config")]
    pub archive_config: bool,
}

// Default value functions
fn default_name() -> String {
    "shock_logger".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_backend() -> String {
    "simulated".to_string()
}

fn default_samples_per_channel() -> usize {
    1000
}

fn default_rate() -> f64 {
    1000.0
}

fn default_poll_interval() -> u64 {
    1
}

fn default_noise() -> f64 {
    0.01
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_pointer_file() -> PathBuf {
    PathBuf::from("latest_csv_path.txt")
}

fn default_file_prefix() -> String {
    "MCC_DAQ_DATA".to_string()
}

fn default_precision() -> usize {
    6
}

fn default_archive_config() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            samples_per_channel: default_samples_per_channel(),
            rate_hz: default_rate(),
            poll_interval_ms: default_poll_interval(),
            consumption: ConsumptionPolicy::default(),
            channels: Vec::new(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            noise_volts: default_noise(),
            fault_after_cycles: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            pointer_file: default_pointer_file(),
            file_prefix: default_file_prefix(),
            precision: default_precision(),
            archive_config: default_archive_config(),
        }
    }
}

impl AcquisitionConfig {
    /// Idle wait between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl StorageConfig {
    /// Resolved pointer file location.
    pub fn pointer_path(&self) -> PathBuf {
        if self.pointer_file.is_absolute() {
            self.pointer_file.clone()
        } else {
            self.output_dir.join(&self.pointer_file)
        }
    }
}

impl LoggerConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is an error; environment variables are layered on top.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(LoggerError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        Ok(Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse configuration from a TOML string (no environment layer).
    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        Ok(Figment::new().merge(Toml::string(source)).extract()?)
    }

    /// Validate scalar settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(LoggerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(LoggerError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        // A one-slot-deep buffer makes every cycle the final cycle, so a
        // wrap could never be told apart from a repeated read.
        if self.acquisition.samples_per_channel < 2 {
            return Err(LoggerError::Configuration(format!(
                "samples_per_channel must be at least 2, got {}",
                self.acquisition.samples_per_channel
            )));
        }

        if !self.acquisition.rate_hz.is_finite() || self.acquisition.rate_hz <= 0.0 {
            return Err(LoggerError::Configuration(format!(
                "Invalid rate_hz {}",
                self.acquisition.rate_hz
            )));
        }

        if self.acquisition.channels.is_empty() {
            return Err(LoggerError::Configuration(
                "At least one channel is required".to_string(),
            ));
        }

        if self.storage.precision > 17 {
            return Err(LoggerError::Configuration(format!(
                "Invalid precision {}. Must be 0-17",
                self.storage.precision
            )));
        }

        if self.storage.pointer_file.as_os_str().is_empty() {
            return Err(LoggerError::Configuration(
                "pointer_file must not be empty".to_string(),
            ));
        }

        let noise = self.acquisition.simulation.noise_volts;
        if !noise.is_finite() || noise < 0.0 {
            return Err(LoggerError::Configuration(format!(
                "Invalid simulation noise_volts {noise}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        log_level = "debug"

        [acquisition]
        samples_per_channel = 500
        rate_hz = 250.0
        consumption = "drain_backlog"

        [[acquisition.channels]]
        id = 5
        profile = "long"
        name_mapped = "Front right shock pot (inches)"

        [[acquisition.channels]]
        id = 4
        profile = "front_brake"
        range = "bip2_volts"

        [calibration.long]
        min_voltage = 0.5
        max_voltage = 4.5
        min_value = 2.0
        max_value = 8.0
        unit = "in"

        [calibration.front_brake]
        min_voltage = 0.2
        max_voltage = 1.8
        min_value = 0.0
        max_value = 1000.0
        unit = "psi"

        [storage]
        output_dir = "/tmp/runs"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = LoggerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.acquisition.samples_per_channel, 500);
        assert_eq!(config.acquisition.consumption, ConsumptionPolicy::DrainBacklog);
        assert_eq!(config.acquisition.channels.len(), 2);
        assert_eq!(config.acquisition.channels[1].range, HardwareRange::Bip2Volts);
        assert_eq!(config.acquisition.channels[0].input_mode, InputMode::SingleEnded);
        assert_eq!(config.calibration["long"].max_value, 8.0);
        assert_eq!(
            config.storage.pointer_path(),
            PathBuf::from("/tmp/runs/latest_csv_path.txt")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_applied() {
        let config = LoggerConfig::from_toml_str(
            r#"
            [[acquisition.channels]]
            id = 1
            profile = "p"
            "#,
        )
        .unwrap();
        assert_eq!(config.acquisition.backend, "simulated");
        assert_eq!(config.acquisition.samples_per_channel, 1000);
        assert_eq!(config.acquisition.consumption, ConsumptionPolicy::LatestCycle);
        assert_eq!(config.storage.precision, 6);
        assert_eq!(config.storage.file_prefix, "MCC_DAQ_DATA");
        assert!(config.storage.archive_config);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = LoggerConfig::from_toml_str(SAMPLE).unwrap();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_slot_buffer_rejected() {
        let mut config = LoggerConfig::from_toml_str(SAMPLE).unwrap();
        config.acquisition.samples_per_channel = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_rate_rejected() {
        let mut config = LoggerConfig::from_toml_str(SAMPLE).unwrap();
        config.acquisition.rate_hz = 0.0;
        assert!(config.validate().is_err());
        config.acquisition.rate_hz = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_channel_list_rejected() {
        let mut config = LoggerConfig::from_toml_str(SAMPLE).unwrap();
        config.acquisition.channels.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let err = LoggerConfig::from_toml_str("[acquisition]\nrate_hz = \"fast\"").unwrap_err();
        assert!(matches!(err, LoggerError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = LoggerConfig::load_from("does/not/exist.toml").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("logger.toml", SAMPLE)?;
            jail.set_env("SHOCK_LOGGER_STORAGE__PRECISION", "3");
            jail.set_env("SHOCK_LOGGER_ACQUISITION__RATE_HZ", "500.0");

            let config = LoggerConfig::load_from("logger.toml")
                .map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(config.storage.precision, 3);
            assert_eq!(config.acquisition.rate_hz, 500.0);
            assert_eq!(config.acquisition.samples_per_channel, 500);
            Ok(())
        });
    }
}
