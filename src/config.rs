//! Configuration for the master board, loaded with Figment.
//!
//! Configuration is layered:
//! 1. `config/roti_master.toml` (or the path given to [`MasterConfig::load_from`])
//! 2. Environment variables prefixed with `ROTI_`, nested with `__`
//!
//! Every section and field has a default, so a missing file yields a working
//! configuration for the mock link.
//!
//! ```text
//! ROTI_APPLICATION__LOG_LEVEL=debug
//! ROTI_TRANSPORT__PORT=/dev/ttyACM0
//! ROTI_SEQUENCER__SLEEP_ENABLED=false
//! ```
//!
//! # Example
//!
//! ```no_run
//! use roti_master::config::MasterConfig;
//!
//! let config = MasterConfig::load().unwrap();
//! println!("port: {}", config.transport.port);
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::MasterError;
use crate::modules::{dispenser, heater, kicker, kneader, vertical_tray, wedge_press, CommandPoller};
use crate::sequencer::ModuleTag;
use crate::transport::ResendPolicy;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/roti_master.toml";

/// Upper bound on configured resends.
pub const MAX_RESENDS: u32 = 10;

/// Failure to load or validate a [`MasterConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or environment could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values parsed but are out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for MasterError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::LoadError(e) => MasterError::Config(e),
            ConfigError::ValidationError(msg) => MasterError::Configuration(msg),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Process name and logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link and resend policy.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Per-module poller timing.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Step sequencer settings.
    #[serde(default)]
    pub sequencer: SequencerConfig,
    /// Module availability.
    #[serde(default)]
    pub gate: GateConfig,
}

/// Process identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name used in the startup log line.
    #[serde(default = "default_name")]
    pub name: String,
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub json_logs: bool,
}

/// Serial link to the slave board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Serial device path.
    #[serde(default = "default_port")]
    pub port: String,
    /// Line speed.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-attempt response timeout.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Extra attempts after an unanswered request.
    #[serde(default = "default_resends")]
    pub resends: u32,
}

/// Execution timeout and status check period of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTiming {
    /// How long a started action may take before the wait times out.
    pub exe_timeout_ms: u64,
    /// Spacing between status checks.
    pub check_period_ms: u64,
}

/// Per-module polling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Dispenser (DS).
    #[serde(default = "default_dispenser_timing")]
    pub dispenser: ModuleTiming,
    /// Kneader (KN).
    #[serde(default = "default_kneader_timing")]
    pub kneader: ModuleTiming,
    /// Heater (HT). Only the check period is used.
    #[serde(default = "default_heater_timing")]
    pub heater: ModuleTiming,
    /// Vertical tray (VT).
    #[serde(default = "default_vertical_tray_timing")]
    pub vertical_tray: ModuleTiming,
    /// Wedge press (WP).
    #[serde(default = "default_wedge_press_timing")]
    pub wedge_press: ModuleTiming,
    /// Kicker (KR).
    #[serde(default = "default_kicker_timing")]
    pub kicker: ModuleTiming,
}

/// Step sequencer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Vertical-tray top limit used when no limit has been measured.
    #[serde(default = "default_vt_top_limit")]
    pub vt_top_limit: f64,
    /// When false, sleep steps complete immediately.
    #[serde(default = "default_sleep_enabled")]
    pub sleep_enabled: bool,
}

/// Modules whose steps are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Tags as written in recipes, e.g. `"vt"`.
    #[serde(default)]
    pub disabled: Vec<ModuleTag>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "roti-master".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_command_timeout() -> u64 {
    500
}

fn default_resends() -> u32 {
    3
}

fn default_vt_top_limit() -> f64 {
    47.0
}

fn default_sleep_enabled() -> bool {
    true
}

fn timing(exe_timeout: Duration, check_period: Duration) -> ModuleTiming {
    ModuleTiming {
        exe_timeout_ms: exe_timeout.as_millis() as u64,
        check_period_ms: check_period.as_millis() as u64,
    }
}

fn default_dispenser_timing() -> ModuleTiming {
    timing(dispenser::EXE_TIMEOUT, dispenser::CHECK_PERIOD)
}

fn default_kneader_timing() -> ModuleTiming {
    timing(kneader::EXE_TIMEOUT, kneader::CHECK_PERIOD)
}

fn default_heater_timing() -> ModuleTiming {
    timing(Duration::ZERO, heater::CHECK_PERIOD)
}

fn default_vertical_tray_timing() -> ModuleTiming {
    timing(vertical_tray::EXE_TIMEOUT, vertical_tray::CHECK_PERIOD)
}

fn default_wedge_press_timing() -> ModuleTiming {
    timing(wedge_press::EXE_TIMEOUT, wedge_press::CHECK_PERIOD)
}

fn default_kicker_timing() -> ModuleTiming {
    timing(kicker::EXE_TIMEOUT, kicker::CHECK_PERIOD)
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            command_timeout_ms: default_command_timeout(),
            resends: default_resends(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dispenser: default_dispenser_timing(),
            kneader: default_kneader_timing(),
            heater: default_heater_timing(),
            vertical_tray: default_vertical_tray_timing(),
            wedge_press: default_wedge_press_timing(),
            kicker: default_kicker_timing(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            vt_top_limit: default_vt_top_limit(),
            sleep_enabled: default_sleep_enabled(),
        }
    }
}

impl ModuleTiming {
    /// Execution timeout as a [`Duration`].
    pub fn exe_timeout(&self) -> Duration {
        Duration::from_millis(self.exe_timeout_ms)
    }

    /// Check period as a [`Duration`].
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }

    /// Poller configured with this timing.
    pub fn poller(&self) -> CommandPoller {
        CommandPoller::new(self.exe_timeout(), self.check_period())
    }
}

impl TimingConfig {
    fn entries(&self) -> [(&'static str, &ModuleTiming); 6] {
        [
            ("dispenser", &self.dispenser),
            ("kneader", &self.kneader),
            ("heater", &self.heater),
            ("vertical_tray", &self.vertical_tray),
            ("wedge_press", &self.wedge_press),
            ("kicker", &self.kicker),
        ]
    }
}

impl TransportConfig {
    /// Per-attempt response timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Resend policy for the configured resend count.
    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            resends: self.resends,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl MasterConfig {
    /// Loads `config/roti_master.toml` plus `ROTI_` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from `path` plus environment overrides, then validates it.
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ROTI_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks values the type system cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.transport.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid baud_rate 0. Must be > 0".to_string(),
            ));
        }

        if self.transport.command_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid command_timeout_ms 0. Must be > 0".to_string(),
            ));
        }

        if self.transport.resends > MAX_RESENDS {
            return Err(ConfigError::ValidationError(format!(
                "Invalid resends {}. Must be 0-{}",
                self.transport.resends, MAX_RESENDS
            )));
        }

        for (module, timing) in self.timing.entries() {
            if timing.check_period_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid check_period_ms 0 for module '{}'. Must be > 0",
                    module
                )));
            }
        }

        if !(0.0..=100.0).contains(&self.sequencer.vt_top_limit) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid vt_top_limit {}. Must be 0-100",
                self.sequencer.vt_top_limit
            )));
        }

        Ok(())
    }
}
