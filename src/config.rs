//! Configuration System using Figment
//!
//! Strongly-typed configuration for the experiment engine. Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `RUST_SCOPE_` (nested keys split on `__`)
//!
//! Durations are written in humantime form (`"250ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use rust_scope::config::ScopeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScopeConfig::load_from("config/scope.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Widest digital output word the executor client can address.
pub const MAX_DIGITAL_LINES: u8 = 32;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Experiment engine (coordination thread) settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Timing executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Data intake settings
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Output file settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_scope".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Experiment engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between executor status polls while a run is active
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// How long a device may take to acknowledge `arm`
    #[serde(with = "humantime_serde", default = "default_arm_timeout")]
    pub arm_timeout: Duration,
    /// Grace period for a device to acknowledge `disarm` before it is force-disconnected
    #[serde(with = "humantime_serde", default = "default_abort_grace")]
    pub abort_grace: Duration,
    /// Write a JSON run record to the storage directory when a run finishes
    #[serde(default = "default_true")]
    pub archive_runs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            arm_timeout: default_arm_timeout(),
            abort_grace: default_abort_grace(),
            archive_runs: true,
        }
    }
}

/// Timing executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Executor clock rate
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u64,
    /// Number of digital output lines
    #[serde(default = "default_digital_lines")]
    pub digital_lines: u8,
    /// Number of analog output lines
    #[serde(default = "default_analog_lines")]
    pub analog_lines: u8,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: default_ticks_per_second(),
            digital_lines: default_digital_lines(),
            analog_lines: default_analog_lines(),
        }
    }
}

/// Data intake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// How long after its trigger time a slot may stay empty before it is marked missing
    #[serde(with = "humantime_serde", default = "default_frame_timeout")]
    pub frame_timeout: Duration,
    /// Capacity of the frame queue between camera adapters and the intake
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            frame_timeout: default_frame_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Output file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data files and run records
    pub output_dir: PathBuf,
    /// Planes the writer thread may fall behind before pixels are dropped
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            write_queue: default_write_queue(),
        }
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Driver type (e.g., "mock_camera", "mock_stage")
    pub r#type: String,
    /// Whether this device is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Driver-specific configuration
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

// Default value functions
fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_arm_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_abort_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_ticks_per_second() -> u64 {
    100_000
}

fn default_digital_lines() -> u8 {
    16
}

fn default_analog_lines() -> u8 {
    4
}

fn default_frame_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

fn default_write_queue() -> usize {
    crate::data::writer::DEFAULT_WRITE_QUEUE
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl ScopeConfig {
    /// Load configuration from a specific file path, with `RUST_SCOPE_` environment overrides.
    ///
    /// Example override: `RUST_SCOPE_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_SCOPE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(ScopeConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.executor.ticks_per_second == 0 {
            return Err(DaqError::Configuration(
                "executor.ticks_per_second must be positive".to_string(),
            ));
        }

        if self.executor.digital_lines == 0 || self.executor.digital_lines > MAX_DIGITAL_LINES {
            return Err(DaqError::Configuration(format!(
                "executor.digital_lines {} must be 1-{}",
                self.executor.digital_lines, MAX_DIGITAL_LINES
            )));
        }

        if self.intake.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "intake.queue_capacity must be positive".to_string(),
            ));
        }

        if self.storage.write_queue == 0 {
            return Err(DaqError::Configuration(
                "storage.write_queue must be positive".to_string(),
            ));
        }

        if self.engine.poll_interval.is_zero() {
            return Err(DaqError::Configuration(
                "engine.poll_interval must be positive (no busy polling)".to_string(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
        }

        for device in self.enabled_devices() {
            self.check_device_lines(device)?;
        }

        Ok(())
    }

    /// Reject output lines the executor does not have.
    fn check_device_lines(&self, device: &DeviceDefinition) -> AppResult<()> {
        let (keys, available, kind): (&[&str], u8, &str) = match device.r#type.as_str() {
            "mock_camera" | "mock_light" => (
                &["line", "shutter_line"],
                self.executor.digital_lines,
                "digital",
            ),
            "mock_stage" => (&["line"], self.executor.analog_lines, "analog"),
            _ => return Ok(()),
        };
        for key in keys {
            let Some(value) = device.config.get(*key) else {
                continue;
            };
            let line = value.as_integer().ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Device '{}': {} must be an integer",
                    device.id, key
                ))
            })?;
            if line < 0 || line >= i64::from(available) {
                return Err(DaqError::Configuration(format!(
                    "Device '{}': {} {} outside executor {} lines (0-{})",
                    device.id,
                    key,
                    line,
                    kind,
                    available.saturating_sub(1)
                )));
            }
        }
        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceDefinition> {
        self.devices.iter().filter(|dev| dev.enabled).collect()
    }
}
