//! Daemon configuration.
//!
//! Settings come from built-in defaults, optionally overridden by a TOML
//! file. The file is looked up in this order:
//! 1. an explicit path (`microbeamd start --config <path>`)
//! 2. the `MICROBEAM_CONFIG` environment variable
//! 3. `<config_dir>/microbeam/config.toml`
//!
//! A missing file at the default location is not an error. Every field has
//! a default, so a file only needs the values that differ.
//!
//! ```toml
//! run_dir = "/data/microbeam"
//! wait_for_client_ack = true
//! latch_fifo = "/tmp/latch_fifo"
//!
//! [hardware]
//! backend = "pigpio"
//! trigger_edge = "falling"
//! hits_per_batch = 1
//!
//! [simulation]
//! mean_interval_us = 100.0
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use microbeam_hw::{GpioLayout, Level, PigpioConfig, SimulationConfig, TriggerConfig, TriggerEdge};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::ControllerSettings;
use crate::latch::LatchSource;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "MICROBEAM_CONFIG";

/// Default pub/sub listen address.
pub const DEFAULT_SUBSCRIBER_ADDR: &str = "127.0.0.1:8188";

/// Default control surface listen address.
pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:8088";

/// Errors loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Daemon Settings
// ============================================================================

/// Top-level daemon settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Holds `run.id`, `cal.json` and the `run_NNN` directories
    pub run_dir: PathBuf,
    pub subscriber_addr: String,
    pub control_addr: String,
    /// Require an `ack` from the primary subscriber for every scan point
    pub wait_for_client_ack: bool,
    pub swap_xy_every_second_repetition: bool,
    /// Named pipe fed by the latch-up detector
    pub latch_fifo: Option<PathBuf>,
    pub latch_recovery_secs: f64,
    pub hardware: HardwareConfig,
    pub simulation: SimulationConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            run_dir: dirs::data_dir()
                .map(|d| d.join("microbeam"))
                .unwrap_or_else(|| PathBuf::from(".")),
            subscriber_addr: DEFAULT_SUBSCRIBER_ADDR.to_string(),
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            wait_for_client_ack: false,
            swap_xy_every_second_repetition: true,
            latch_fifo: None,
            latch_recovery_secs: 5.0,
            hardware: HardwareConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration following the lookup order above.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Reads and validates one file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.latch_recovery_secs.is_finite() || self.latch_recovery_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "latch_recovery_secs must be >= 0, got {}",
                self.latch_recovery_secs
            )));
        }
        self.hardware.validate()
    }

    /// Settings handed to the run controller.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            run_dir: self.run_dir.clone(),
            wait_for_client_ack: self.wait_for_client_ack,
            swap_xy_every_second_repetition: self.swap_xy_every_second_repetition,
            hits_per_batch: self.hardware.hits_per_batch,
            latch: self.latch_fifo.clone().map(LatchSource::Fifo),
            latch_recovery: Duration::from_secs_f64(self.latch_recovery_secs),
            simulated: self.hardware.backend == BackendKind::Simulated,
        }
    }
}

/// `<config_dir>/microbeam/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("microbeam").join("config.toml"))
}

// ============================================================================
// Hardware Settings
// ============================================================================

/// Which trigger backend drives the beam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Pigpio,
    Simulated,
}

/// `[hardware]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub backend: BackendKind,
    /// `host:port` of pigpiod
    pub pigpio_addr: String,
    pub gpio: GpioLayout,
    pub spi_channel: u32,
    pub spi_baud: u32,
    pub trigger_edge: TriggerEdge,
    pub shutter_open_level: Level,
    /// Hits counted by one edge program run
    pub hits_per_batch: u32,
    pub min_hit_delay_ms: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let pigpio = PigpioConfig::default();
        Self {
            backend: BackendKind::default(),
            pigpio_addr: pigpio.addr,
            gpio: GpioLayout::default(),
            spi_channel: pigpio.spi_channel,
            spi_baud: pigpio.spi_baud,
            trigger_edge: TriggerEdge::default(),
            shutter_open_level: Level::Low,
            hits_per_batch: 1,
            min_hit_delay_ms: 1.0,
        }
    }
}

impl HardwareConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.hits_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "hardware.hits_per_batch must be >= 1".to_string(),
            ));
        }
        if !self.min_hit_delay_ms.is_finite() || self.min_hit_delay_ms <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "hardware.min_hit_delay_ms must be > 0, got {}",
                self.min_hit_delay_ms
            )));
        }
        Ok(())
    }

    pub fn trigger(&self) -> TriggerConfig {
        TriggerConfig {
            gpio: self.gpio,
            edge: self.trigger_edge,
            shutter_open_level: self.shutter_open_level,
            min_hit_delay: Duration::from_secs_f64(self.min_hit_delay_ms / 1000.0),
        }
    }

    pub fn pigpio(&self) -> PigpioConfig {
        PigpioConfig {
            addr: self.pigpio_addr.clone(),
            spi_channel: self.spi_channel,
            spi_baud: self.spi_baud,
            trigger: self.trigger(),
            ..PigpioConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.subscriber_addr, "127.0.0.1:8188");
        assert_eq!(config.control_addr, "0.0.0.0:8088");
        assert!(!config.wait_for_client_ack);
        assert!(config.swap_xy_every_second_repetition);
        assert_eq!(config.hardware.backend, BackendKind::Pigpio);
        assert_eq!(config.hardware.gpio.trigger, 27);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            wait_for_client_ack = true
            latch_fifo = "/tmp/latch_fifo"

            [hardware]
            backend = "simulated"
            trigger_edge = "rising"
            hits_per_batch = 4

            [hardware.gpio]
            shutter = 22

            [simulation]
            seed = 7
            grid = { period_lsb = 100, window_lsb = 10 }
            "#,
        )
        .unwrap();

        assert!(config.wait_for_client_ack);
        assert_eq!(config.hardware.backend, BackendKind::Simulated);
        assert_eq!(config.hardware.trigger_edge, TriggerEdge::Rising);
        assert_eq!(config.hardware.gpio.shutter, 22);
        assert_eq!(config.hardware.gpio.trigger, 27);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.simulation.mean_interval_us, 100.0);

        let settings = config.controller_settings();
        assert!(settings.simulated);
        assert_eq!(settings.hits_per_batch, 4);
        assert!(matches!(settings.latch, Some(LatchSource::Fifo(_))));
        assert_eq!(settings.latch_recovery, Duration::from_secs(5));
    }

    #[test]
    fn test_trigger_settings() {
        let hardware = HardwareConfig {
            min_hit_delay_ms: 2.5,
            ..HardwareConfig::default()
        };
        let trigger = hardware.trigger();
        assert_eq!(trigger.min_hit_delay, Duration::from_micros(2500));
        assert_eq!(trigger.edge, TriggerEdge::Falling);
        assert_eq!(hardware.pigpio().addr, "127.0.0.1:8888");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DaemonConfig::default();
        config.hardware.hits_per_batch = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = DaemonConfig::default();
        config.hardware.min_hit_delay_ms = 0.0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.latch_recovery_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            DaemonConfig::from_file(&missing),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.toml");
        let mut file = std::fs::File::create(&bad).unwrap();
        writeln!(file, "wait_for_client_ack = \"maybe\"").unwrap();
        assert!(matches!(
            DaemonConfig::from_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
