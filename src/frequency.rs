//! Optical frequency value type.
//!
//! Every instrument in the spectrometer speaks a different unit: the wavemeter reports
//! THz or GHz, the grating calibration is in vacuum nanometres and spectroscopists
//! plan scans in wavenumbers. [`Frequency`] stores GHz internally and converts on the
//! way in and out.
//!
//! ```
//! use pas_daq::frequency::Frequency;
//!
//! let f: Frequency = "760.01 nm".parse().unwrap();
//! assert!((f.nm() - 760.01).abs() < 1e-9);
//! assert!((f.wavenumber() - 13157.72).abs() < 0.01);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::error::DaqError;

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Units a [`Frequency`] can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FrequencyUnit {
    /// Gigahertz.
    GHz,
    /// Megahertz.
    MHz,
    /// Terahertz.
    THz,
    /// Vacuum wavelength in nanometres.
    Nm,
    /// Wavenumber in inverse centimetres.
    Wavenumber,
}

impl FrequencyUnit {
    /// Canonical label, as accepted by [`FromStr`].
    pub fn label(&self) -> &'static str {
        match self {
            FrequencyUnit::GHz => "GHz",
            FrequencyUnit::MHz => "MHz",
            FrequencyUnit::THz => "THz",
            FrequencyUnit::Nm => "nm",
            FrequencyUnit::Wavenumber => "cm-1",
        }
    }
}

impl fmt::Display for FrequencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for FrequencyUnit {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ghz" => Ok(FrequencyUnit::GHz),
            "mhz" => Ok(FrequencyUnit::MHz),
            "thz" => Ok(FrequencyUnit::THz),
            "nm" => Ok(FrequencyUnit::Nm),
            "cm-1" | "cm^-1" | "1/cm" => Ok(FrequencyUnit::Wavenumber),
            other => Err(DaqError::Configuration(format!(
                "Unknown frequency unit '{}'. Must be one of: GHz, MHz, THz, nm, cm-1",
                other
            ))),
        }
    }
}

impl TryFrom<String> for FrequencyUnit {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FrequencyUnit> for String {
    fn from(value: FrequencyUnit) -> Self {
        value.label().to_string()
    }
}

/// An optical frequency.
///
/// Stored in GHz. Wavelength conversions use the vacuum speed of light, so
/// `ghz = c / nm` (the 10⁹ factors of nm and GHz cancel) and
/// `ghz = wavenumber · c · 10⁻⁷`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Frequency {
    ghz: f64,
}

impl Frequency {
    /// Frequency from a value in GHz.
    pub const fn from_ghz(ghz: f64) -> Self {
        Self { ghz }
    }

    /// Frequency from a value in MHz.
    pub fn from_mhz(mhz: f64) -> Self {
        Self { ghz: mhz * 1e-3 }
    }

    /// Frequency from a value in THz.
    pub fn from_thz(thz: f64) -> Self {
        Self { ghz: thz * 1e3 }
    }

    /// Frequency equivalent to a vacuum wavelength in nm.
    pub fn from_nm(nm: f64) -> Self {
        Self {
            ghz: SPEED_OF_LIGHT / nm,
        }
    }

    /// Frequency equivalent to a wavenumber in cm⁻¹.
    pub fn from_wavenumber(per_cm: f64) -> Self {
        Self {
            ghz: per_cm * SPEED_OF_LIGHT * 1e-7,
        }
    }

    /// Build a frequency from a value in an arbitrary unit.
    ///
    /// Wavelengths must be strictly positive.
    pub fn new(value: f64, unit: FrequencyUnit) -> Result<Self, DaqError> {
        if !value.is_finite() {
            return Err(DaqError::Configuration(format!(
                "Frequency value must be finite, got {}",
                value
            )));
        }
        if unit == FrequencyUnit::Nm && value <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Wavelength must be positive, got {} nm",
                value
            )));
        }
        Ok(match unit {
            FrequencyUnit::GHz => Self::from_ghz(value),
            FrequencyUnit::MHz => Self::from_mhz(value),
            FrequencyUnit::THz => Self::from_thz(value),
            FrequencyUnit::Nm => Self::from_nm(value),
            FrequencyUnit::Wavenumber => Self::from_wavenumber(value),
        })
    }

    /// Value in GHz.
    pub fn ghz(&self) -> f64 {
        self.ghz
    }

    /// Value in MHz.
    pub fn mhz(&self) -> f64 {
        self.ghz * 1e3
    }

    /// Value in THz.
    pub fn thz(&self) -> f64 {
        self.ghz * 1e-3
    }

    /// Equivalent vacuum wavelength in nm.
    pub fn nm(&self) -> f64 {
        SPEED_OF_LIGHT / self.ghz
    }

    /// Equivalent wavenumber in cm⁻¹.
    pub fn wavenumber(&self) -> f64 {
        self.ghz / (SPEED_OF_LIGHT * 1e-7)
    }

    /// Value expressed in `unit`.
    pub fn value_in(&self, unit: FrequencyUnit) -> f64 {
        match unit {
            FrequencyUnit::GHz => self.ghz(),
            FrequencyUnit::MHz => self.mhz(),
            FrequencyUnit::THz => self.thz(),
            FrequencyUnit::Nm => self.nm(),
            FrequencyUnit::Wavenumber => self.wavenumber(),
        }
    }

    /// Absolute distance to `other`.
    pub fn abs_diff(&self, other: Frequency) -> Frequency {
        Frequency::from_ghz((self.ghz - other.ghz).abs())
    }
}

impl Add for Frequency {
    type Output = Frequency;

    fn add(self, rhs: Frequency) -> Frequency {
        Frequency::from_ghz(self.ghz + rhs.ghz)
    }
}

impl Sub for Frequency {
    type Output = Frequency;

    fn sub(self, rhs: Frequency) -> Frequency {
        Frequency::from_ghz(self.ghz - rhs.ghz)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} GHz", self.ghz)
    }
}

impl FromStr for Frequency {
    type Err = DaqError;

    /// Parses `"<value><unit>"` with optional whitespace, e.g. `"13150 cm-1"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Longest numeric prefix, so exponents like "1e-3 GHz" survive.
        let split = s
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(s.len()))
            .filter(|&i| s[..i].trim().parse::<f64>().is_ok())
            .last()
            .ok_or_else(|| {
                DaqError::Configuration(format!("Invalid frequency value in '{}'", s))
            })?;
        let (value, unit) = s.split_at(split);
        if unit.trim().is_empty() {
            return Err(DaqError::Configuration(format!(
                "Frequency '{}' is missing a unit",
                s
            )));
        }
        let value: f64 = value.trim().parse().map_err(|_| {
            DaqError::Configuration(format!("Invalid frequency value in '{}'", s))
        })?;
        Frequency::new(value, unit.parse()?)
    }
}

impl TryFrom<String> for Frequency {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Frequency> for String {
    fn from(value: Frequency) -> Self {
        format!("{} GHz", value.ghz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn wavelength_round_trip() {
        let f = Frequency::from_nm(500.0);
        assert!(close(f.ghz(), 599_584.916, 1e-3));
        assert!(close(f.nm(), 500.0, 1e-9));
        assert!(close(f.wavenumber(), 20_000.0, 1e-6));
    }

    #[test]
    fn wavenumber_matches_wavelength() {
        let a = Frequency::from_wavenumber(20_000.0);
        let b = Frequency::from_nm(500.0);
        assert!(close(a.ghz(), b.ghz(), 1e-6));
    }

    #[test]
    fn parses_units_case_insensitively() {
        let f: Frequency = "3 MHz".parse().unwrap();
        assert!(close(f.ghz(), 3e-3, 1e-15));

        let f: Frequency = "13150cm-1".parse().unwrap();
        assert!(close(f.wavenumber(), 13150.0, 1e-9));

        let f: Frequency = "394.2 thz".parse().unwrap();
        assert!(close(f.ghz(), 394_200.0, 1e-6));

        let f: Frequency = "760.01NM".parse().unwrap();
        assert!(close(f.nm(), 760.01, 1e-9));

        let f: Frequency = "1e-3 GHz".parse().unwrap();
        assert!(close(f.mhz(), 1.0, 1e-12));
    }

    #[test]
    fn rejects_bad_input() {
        assert!("760.01".parse::<Frequency>().is_err());
        assert!("abc nm".parse::<Frequency>().is_err());
        assert!("760 furlongs".parse::<Frequency>().is_err());
        assert!(Frequency::new(0.0, FrequencyUnit::Nm).is_err());
        assert!(Frequency::new(f64::NAN, FrequencyUnit::GHz).is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        #[derive(Deserialize)]
        struct Wrapper {
            f: Frequency,
            unit: FrequencyUnit,
        }
        let w: Wrapper = toml::from_str("f = \"10 MHz\"\nunit = \"cm-1\"").unwrap();
        assert!(close(w.f.mhz(), 10.0, 1e-9));
        assert_eq!(w.unit, FrequencyUnit::Wavenumber);

        let json = serde_json::to_string(&Frequency::from_ghz(1.5)).unwrap();
        assert_eq!(json, "\"1.5 GHz\"");
    }

    #[test]
    fn arithmetic() {
        let a = Frequency::from_ghz(10.0);
        let b = Frequency::from_ghz(12.5);
        assert!(close((a - b).ghz(), -2.5, 1e-12));
        assert!(close(a.abs_diff(b).ghz(), 2.5, 1e-12));
        assert!(close((a + b).ghz(), 22.5, 1e-12));
    }
}
