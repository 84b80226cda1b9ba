//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits implemented by the spectrometer's instruments.
//! Devices implement only what they support:
//!
//! - The Sacher laser implements: `Identifiable + PiezoActuator + LaserDiagnostics`
//! - The SR830 implements: `Identifiable + LockInAmplifier`
//! - A power meter or thermometer implements: `Readable`
//! - The grating motor implements: `WavelengthTuner`
//!
//! Procedures take trait objects (`Arc<dyn PiezoActuator>`, ...) so real drivers and
//! the simulated rig in [`crate::hardware::mock`] are interchangeable.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns [`AppResult`] so callers can tell transient failures apart
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use pas_daq::error::AppResult;
//! use pas_daq::hardware::capabilities::Readable;
//!
//! struct FixedGauge(f64);
//!
//! #[async_trait]
//! impl Readable for FixedGauge {
//!     async fn read(&self) -> AppResult<f64> {
//!         Ok(self.0)
//!     }
//! }
//!
//! async fn average<R: Readable + ?Sized>(sensor: &R, n: usize) -> AppResult<f64> {
//!     let mut sum = 0.0;
//!     for _ in 0..n {
//!         sum += sensor.read().await?;
//!     }
//!     Ok(sum / n as f64)
//! }
//!
//! # tokio_test::block_on(async {
//! assert_eq!(average(&FixedGauge(2.0), 4).await.unwrap(), 2.0);
//! # })
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, DaqError};
use crate::frequency::Frequency;

/// Capability: Identification
///
/// Devices that answer an identification query (`*IDN?` or equivalent).
#[async_trait]
pub trait Identifiable: Send + Sync {
    /// Identification string as reported by the device.
    async fn identify(&self) -> AppResult<String>;
}

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (power meters, temperature sensors,
/// pressure gauges).
///
/// # Contract
/// - `read()` performs measurement and returns value
/// - Units are device-specific (document in implementation)
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read current value
    ///
    /// # Returns
    /// - Ok(value) on successful read
    /// - Err on hardware error or timeout
    async fn read(&self) -> AppResult<f64>;
}

/// Capability: Optical Frequency Measurement
///
/// Wavelength meters.
#[async_trait]
pub trait FrequencyMeter: Send + Sync {
    /// Current laser frequency.
    async fn read_frequency(&self) -> AppResult<Frequency>;
}

/// Capability: Lock-in Detection
///
/// Dual-phase lock-in amplifiers. Values are in volts.
#[async_trait]
pub trait LockInAmplifier: Send + Sync {
    /// In-phase and quadrature outputs, sampled at the same instant.
    async fn read_xy(&self) -> AppResult<(f64, f64)>;

    /// In-phase output.
    async fn read_x(&self) -> AppResult<f64> {
        Ok(self.read_xy().await?.0)
    }

    /// Quadrature output.
    async fn read_y(&self) -> AppResult<f64> {
        Ok(self.read_xy().await?.1)
    }
}

/// Output amplitude of a function generator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amplitude {
    /// Volts peak-to-peak
    PeakToPeak(f64),
    /// Volts RMS
    Rms(f64),
}

impl Amplitude {
    /// Numeric value in the amplitude's own unit.
    pub fn value(&self) -> f64 {
        match self {
            Amplitude::PeakToPeak(v) | Amplitude::Rms(v) => *v,
        }
    }
}

/// Function generator output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    /// Sine
    Sine,
    /// Square
    Square,
    /// Triangle
    Triangle,
    /// Ramp
    Ramp,
    /// Noise
    Noise,
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Waveform::Sine => "sine",
            Waveform::Square => "square",
            Waveform::Triangle => "triangle",
            Waveform::Ramp => "ramp",
            Waveform::Noise => "noise",
        };
        f.write_str(name)
    }
}

impl FromStr for Waveform {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sine" | "sin" => Ok(Waveform::Sine),
            "square" => Ok(Waveform::Square),
            "triangle" => Ok(Waveform::Triangle),
            "ramp" => Ok(Waveform::Ramp),
            "noise" => Ok(Waveform::Noise),
            other => Err(DaqError::Configuration(format!(
                "Unknown waveform '{}'. Must be one of: sine, square, triangle, ramp, noise",
                other
            ))),
        }
    }
}

/// Capability: Function Generation
///
/// Drives the acoustic modulation.
#[async_trait]
pub trait FunctionGenerator: Send + Sync {
    /// Set the output frequency in Hz.
    async fn set_frequency(&self, hz: f64) -> AppResult<()>;

    /// Current output frequency in Hz.
    async fn frequency(&self) -> AppResult<f64>;

    /// Set the output amplitude.
    async fn set_amplitude(&self, amplitude: Amplitude) -> AppResult<()>;

    /// Current output amplitude in volts peak-to-peak.
    async fn amplitude_vpp(&self) -> AppResult<f64>;

    /// Select the output waveform.
    async fn set_waveform(&self, waveform: Waveform) -> AppResult<()>;

    /// Current output waveform.
    async fn waveform(&self) -> AppResult<Waveform>;
}

/// Capability: Piezo Fine Tuning
///
/// The laser's piezo offset, the actuator of the frequency lock.
///
/// # Contract
/// - `set_piezo_voltage` rejects values outside `piezo_range()` with
///   [`DaqError::OutOfRange`] without touching the hardware
#[async_trait]
pub trait PiezoActuator: Send + Sync {
    /// Apply a piezo offset voltage.
    async fn set_piezo_voltage(&self, volts: f64) -> AppResult<()>;

    /// Current piezo offset voltage.
    async fn piezo_voltage(&self) -> AppResult<f64>;

    /// Allowed voltage range `(min, max)`.
    fn piezo_range(&self) -> (f64, f64);
}

/// Capability: Coarse Wavelength Tuning
///
/// Motorised gratings and similar slow, wide-range tuning elements.
#[async_trait]
pub trait WavelengthTuner: Send + Sync {
    /// Drive to a vacuum wavelength in nm and wait for the motion to finish.
    async fn go_to(&self, wavelength_nm: f64) -> AppResult<()>;

    /// Wavelength the tuner currently sits at.
    async fn wavelength_nm(&self) -> AppResult<f64>;

    /// Reachable wavelength range `(min, max)` in nm.
    fn range_nm(&self) -> (f64, f64);
}

/// Decoded laser controller status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserStatus {
    /// Raw status code
    pub code: u32,
    /// Active fault descriptions, empty when healthy
    pub faults: Vec<String>,
}

impl LaserStatus {
    /// No faults reported.
    pub fn is_ok(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Capability: Laser Health
#[async_trait]
pub trait LaserDiagnostics: Send + Sync {
    /// Controller status with decoded faults.
    async fn system_status(&self) -> AppResult<LaserStatus>;

    /// Diode current in mA.
    async fn current_ma(&self) -> AppResult<f64>;

    /// Accumulated operating hours.
    async fn working_hours(&self) -> AppResult<String>;
}
