//! One acquisition sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::frequency::Frequency;

/// A single sample taken while the laser was locked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
    /// Frequency the laser was locked to
    pub setpoint: Frequency,
    /// Frequency reported by the wavemeter
    pub laser_frequency: Frequency,
    /// Lock-in X (in-phase) of the microphone signal, volts
    pub mic_x: f64,
    /// Lock-in Y (quadrature) of the microphone signal, volts
    pub mic_y: f64,
    /// Laser power, watts
    pub laser_power: f64,
    /// Cell temperature, if a thermometer is connected
    pub temperature_c: Option<f64>,
    /// Cell pressure, if a gauge is connected
    pub pressure: Option<f64>,
}

impl Measurement {
    /// |measured − setpoint|.
    pub fn lock_error(&self) -> Frequency {
        self.laser_frequency.abs_diff(self.setpoint)
    }

    /// Lock-in magnitude `sqrt(X² + Y²)`.
    pub fn mic_magnitude(&self) -> f64 {
        self.mic_x.hypot(self.mic_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_quantities() {
        let m = Measurement {
            timestamp: Utc::now(),
            setpoint: Frequency::from_ghz(394_460.0),
            laser_frequency: Frequency::from_ghz(394_460.002),
            mic_x: 3e-3,
            mic_y: 4e-3,
            laser_power: 0.02,
            temperature_c: None,
            pressure: None,
        };
        assert!((m.lock_error().mhz() - 2.0).abs() < 1e-3);
        assert!((m.mic_magnitude() - 5e-3).abs() < 1e-12);
    }
}
