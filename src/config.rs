//! Configuration system using Figment
//!
//! Strongly-typed settings for a spectrometer session. Configuration is layered:
//! 1. Built-in defaults (every section is optional)
//! 2. A TOML file (`config/pas_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `PAS_DAQ_`, using `__` between levels
//!
//! # Example
//! ```no_run
//! use pas_daq::config::Settings;
//!
//! // PAS_DAQ_SCAN__AVERAGES=10 overrides `[scan] averages`
//! let settings = Settings::load_from("config/pas_daq.toml")?;
//! settings.validate()?;
//! println!("Averages per point: {}", settings.scan.averages);
//! # Ok::<(), pas_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::frequency::{Frequency, FrequencyUnit};
use crate::hardware::transport::{ResourceAddress, SerialSettings};
use crate::procedures::{LockParams, TuningParams};

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/pas_daq.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PAS_DAQ_";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// GPIB bus access
    pub gpib: GpibConfig,
    /// Instrument connections, by role
    pub instruments: InstrumentsConfig,
    /// Grating motor limits and motion timing
    pub motor: MotorConfig,
    /// Measurement lock parameters
    pub lock: LockParams,
    /// Coarse tuning (go-to-frequency) parameters
    pub tuning: TuningParams,
    /// Acquisition cycle
    pub scan: ScanConfig,
    /// Retry policy for transient instrument errors
    pub retry: RetryPolicy,
    /// Output location
    pub storage: StorageConfig,
    /// Simulated rig parameters (used with `--simulate`)
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "pas_daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// GPIB access through a Prologix GPIB-ETHERNET controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpibConfig {
    /// `host:port` of the controller. GPIB resources are unusable without it.
    pub gateway: Option<String>,
    /// Socket timeout for the controller connection
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for GpibConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            timeout: Duration::from_secs(3),
        }
    }
}

/// Connection settings for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA-style resource string, e.g. `GPIB0::12::INSTR`
    pub resource: ResourceAddress,
    /// Response timeout
    #[serde(with = "humantime_serde", default = "default_instrument_timeout")]
    pub timeout: Duration,
    /// Override of the driver's command terminator
    #[serde(default)]
    pub write_terminator: Option<String>,
    /// Override of the driver's response terminator
    #[serde(default)]
    pub read_terminator: Option<String>,
    /// Line settings for `ASRL` resources
    #[serde(default)]
    pub serial: Option<SerialSettings>,
}

impl InstrumentConfig {
    /// Connection with default timeout and terminators.
    pub fn new(resource: ResourceAddress) -> Self {
        Self {
            resource,
            timeout: default_instrument_timeout(),
            write_terminator: None,
            read_terminator: None,
            serial: None,
        }
    }
}

/// Wavelength meter connection plus its query dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavemeterConfig {
    /// Transport settings
    #[serde(flatten)]
    pub connection: InstrumentConfig,
    /// Query returning the current frequency or wavelength
    #[serde(default = "default_wavemeter_query")]
    pub query: String,
    /// Unit of the value returned by `query`
    #[serde(default = "default_wavemeter_unit")]
    pub unit: FrequencyUnit,
}

/// Instruments by role. Absent roles are simply not connected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentsConfig {
    /// Sacher Lion tunable diode laser
    pub laser: Option<InstrumentConfig>,
    /// SRS DS335 acoustic function generator
    pub function_generator: Option<InstrumentConfig>,
    /// SRS SR830 lock-in amplifier (microphone)
    pub lockin: Option<InstrumentConfig>,
    /// Wavelength meter
    pub wavemeter: Option<WavemeterConfig>,
    /// Newport 1830-C power meter
    pub power_meter: Option<InstrumentConfig>,
    /// Lake Shore 211 temperature monitor
    pub thermometer: Option<InstrumentConfig>,
}

/// Grating motor (EPOS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Lowest wavelength the grating may be driven to
    pub min_wavelength_nm: f64,
    /// Highest wavelength the grating may be driven to
    pub max_wavelength_nm: f64,
    /// Overshoot used to approach every target from below
    pub hysteresis_steps: i64,
    /// Interval between "target reached" polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Longest a single relative move may take
    #[serde(with = "humantime_serde")]
    pub move_timeout: Duration,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            min_wavelength_nm: 756.5,
            max_wavelength_nm: 781.1,
            hysteresis_steps: 10_000,
            poll_interval: Duration::from_millis(250),
            move_timeout: Duration::from_secs(60),
        }
    }
}

/// Acquisition cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Acoustic modulation frequency programmed into the function generator
    pub acoustic_frequency_hz: Option<f64>,
    /// Samples taken at each locked setpoint
    pub averages: u32,
    /// Flush buffered samples to disk every N setpoints
    pub save_every: usize,
    /// Longest to wait for the measurement lock at each setpoint
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
    /// Pause between samples
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Scan start (in `unit`)
    pub start: Option<f64>,
    /// Scan stop (in `unit`)
    pub stop: Option<f64>,
    /// Scan step (in `unit`)
    pub step: Option<f64>,
    /// Unit for start/stop/step
    pub unit: FrequencyUnit,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            acoustic_frequency_hz: None,
            averages: 5,
            save_every: 5,
            lock_wait: Duration::from_secs(30),
            sample_interval: Duration::from_millis(200),
            start: None,
            stop: None,
            step: None,
            unit: FrequencyUnit::Wavenumber,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory relative output paths are resolved against
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl StorageConfig {
    /// Resolve `file` against `output_dir` unless it is already absolute.
    pub fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.output_dir.join(file)
        }
    }
}

/// Physics of the simulated rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Centre of the simulated absorption line
    pub line_center: Frequency,
    /// Full width at half maximum of the line
    pub line_width: Frequency,
    /// Lock-in X amplitude at line centre per watt of laser power
    pub line_strength_v_per_w: f64,
    /// Laser frequency error left by the grating calibration
    pub calibration_offset: Frequency,
    /// Peak wavemeter noise
    pub frequency_noise: Frequency,
    /// Peak lock-in noise in volts
    pub signal_noise_v: f64,
    /// Laser output power
    pub laser_power_w: f64,
    /// Cell temperature
    pub temperature_c: f64,
    /// Cell pressure (mbar)
    pub pressure_mbar: f64,
    /// Grating wavelength at start-up
    pub initial_wavelength_nm: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            line_center: Frequency::from_nm(760.01),
            line_width: Frequency::from_ghz(2.0),
            line_strength_v_per_w: 0.5,
            calibration_offset: Frequency::from_ghz(0.3),
            frequency_noise: Frequency::from_mhz(0.5),
            signal_noise_v: 1e-5,
            laser_power_w: 0.02,
            temperature_c: 22.5,
            pressure_mbar: 1013.25,
            initial_wavelength_nm: 765.0,
        }
    }
}

fn default_instrument_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_wavemeter_query() -> String {
    ":MEAS:FREQ?".to_string()
}

fn default_wavemeter_unit() -> FrequencyUnit {
    FrequencyUnit::THz
}

impl Settings {
    /// Load settings from [`DEFAULT_CONFIG_PATH`] if it exists, otherwise from
    /// defaults and the environment alone.
    pub fn load() -> AppResult<Self> {
        let path = Path::new(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::figment(None).extract()?)
        }
    }

    /// Load settings from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::Configuration(format!(
                "Configuration file {} does not exist",
                path.display()
            )));
        }
        Ok(Self::figment(Some(path)).extract()?)
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.scan.averages == 0 {
            return Err(DaqError::Configuration(
                "scan.averages must be at least 1".to_string(),
            ));
        }
        if self.scan.save_every == 0 {
            return Err(DaqError::Configuration(
                "scan.save_every must be at least 1".to_string(),
            ));
        }
        if let Some(hz) = self.scan.acoustic_frequency_hz {
            if !(hz.is_finite() && hz > 0.0) {
                return Err(DaqError::Configuration(format!(
                    "scan.acoustic_frequency_hz must be positive, got {}",
                    hz
                )));
            }
        }

        self.lock.validate("lock")?;
        self.tuning.validate()?;

        if self.motor.min_wavelength_nm >= self.motor.max_wavelength_nm {
            return Err(DaqError::Configuration(format!(
                "motor wavelength range is empty: [{}, {}] nm",
                self.motor.min_wavelength_nm, self.motor.max_wavelength_nm
            )));
        }
        if self.motor.hysteresis_steps < 0 {
            return Err(DaqError::Configuration(
                "motor.hysteresis_steps must not be negative".to_string(),
            ));
        }

        Ok(())
    }
}
