//! Sacher Lion Tunable Diode Laser Driver
//!
//! Protocol Overview:
//! - Interface: GPIB (default address 12)
//! - Format: SCPI-like, colon separated; responses terminated by CR LF
//! - Piezo offset: `:PIEZO:OFFSET <v>V`, `:PIEZO:OFFSET?` (±13 V)
//! - Diode current: `:LASER:CURRENT <i>mA` (130 to 150 mA), `:LASER:CURRENT?` (A)
//! - Status: `:SYSTEM:STATUS?`, a decimal fault code (see [`decode_status`])
//!
//! The piezo offset is the actuator of the frequency lock in
//! [`crate::procedures::frequency_lock`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Identifiable, LaserDiagnostics, LaserStatus, PiezoActuator};
use crate::hardware::connector::ConnectionDefaults;
use crate::hardware::parse_number;
use crate::hardware::transport::{InstrumentTransport, TransportOptions};

/// Piezo offset limit, volts (symmetric).
pub const PIEZO_LIMIT_V: f64 = 13.0;

/// Allowed diode current range, mA.
pub const CURRENT_RANGE_MA: (f64, f64) = (130.0, 150.0);

/// Largest status code the controller can report.
pub const MAX_STATUS_CODE: u32 = 77_777;

/// Fault texts by status digit (least significant first) and bit.
const FAULT_GROUPS: [(&str, [&str; 3]); 5] = [
    (
        "laser",
        [
            "I-Limit reached",
            "Laser Open Load / Compliance Voltage too low",
            "Error Laser requires TEC enabled",
        ],
    ),
    (
        "tec",
        [
            "Temperature Watch Out of Window",
            "Temperature Out of Range",
            "Temperature Not Reached",
        ],
    ),
    (
        "range",
        [
            "Modulation Voltage Out of Range",
            "Photodiode Out of Range",
            "Piezo Voltage Out of Range",
        ],
    ),
    (
        "loop",
        [
            "Laser Head Loop Open",
            "Extern Interlock Loop Open",
            "TEC Loop Open",
        ],
    ),
    (
        "device",
        [
            "Remote Control Command Error",
            "Temperature Coupling Out of Range",
            "Device Over Temperature",
        ],
    ),
];

/// Decode a `:SYSTEM:STATUS?` response.
///
/// Each decimal digit, least significant first, is a bit mask over the three
/// faults of one group (laser, TEC, range, loop, device).
///
/// ```
/// use pas_daq::hardware::sacher_lion::decode_status;
///
/// let status = decode_status("10").unwrap();
/// assert_eq!(status.faults, vec!["Temperature Watch Out of Window"]);
/// assert!(decode_status("0").unwrap().is_ok());
/// ```
pub fn decode_status(raw: &str) -> AppResult<LaserStatus> {
    let trimmed = raw.trim();
    let code: u32 = trimmed
        .parse()
        .map_err(|_| DaqError::parse(":SYSTEM:STATUS?", raw))?;
    if code > MAX_STATUS_CODE {
        return Err(DaqError::parse(":SYSTEM:STATUS?", raw));
    }

    let mut faults = Vec::new();
    let mut rest = code;
    for (_, texts) in FAULT_GROUPS.iter() {
        let digit = rest % 10;
        rest /= 10;
        if digit > 7 {
            return Err(DaqError::parse(":SYSTEM:STATUS?", raw));
        }
        for (bit, text) in texts.iter().enumerate() {
            if digit & (1 << bit) != 0 {
                faults.push((*text).to_string());
            }
        }
    }

    Ok(LaserStatus { code, faults })
}

/// Laser operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaserMode {
    /// Constant current
    Current,
    /// Constant power
    Power,
}

/// Driver for the Sacher Lion laser controller.
pub struct SacherLion {
    transport: Arc<dyn InstrumentTransport>,
}

impl SacherLion {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn InstrumentTransport>) -> Self {
        Self { transport }
    }

    /// Framing used when the configuration does not override it.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults {
            options: TransportOptions {
                write_terminator: "\n".to_string(),
                read_terminator: "\r\n".to_string(),
                ..TransportOptions::default()
            },
            ..ConnectionDefaults::default()
        }
    }

    /// Controller serial number.
    pub async fn serial_number(&self) -> AppResult<String> {
        self.transport.query(":SYSTEM:SERIALNUMBER?").await
    }

    /// Diode current limit in mA.
    pub async fn current_limit_ma(&self) -> AppResult<f64> {
        let response = self.transport.query(":LASER:ILIMIT?").await?;
        Ok(parse_number(":LASER:ILIMIT?", &response)? * 1000.0)
    }

    /// Set the diode current in mA.
    pub async fn set_current_ma(&self, milliamps: f64) -> AppResult<()> {
        let (min, max) = CURRENT_RANGE_MA;
        if !(min..=max).contains(&milliamps) {
            return Err(DaqError::OutOfRange {
                parameter: "laser current (mA)",
                value: milliamps,
                min,
                max,
            });
        }
        self.transport
            .write(&format!(":LASER:CURRENT {:.1}mA", milliamps))
            .await
    }

    /// Current operating mode.
    pub async fn mode(&self) -> AppResult<LaserMode> {
        let response = self.transport.query(":LASER:MODE?").await?;
        match response.trim().to_ascii_uppercase().as_str() {
            "IMODE" => Ok(LaserMode::Current),
            "PMODE" => Ok(LaserMode::Power),
            _ => Err(DaqError::parse(":LASER:MODE?", response)),
        }
    }

    /// Switch the diode on or off.
    pub async fn set_emission(&self, on: bool) -> AppResult<()> {
        let state = if on { 1 } else { 0 };
        tracing::info!(on, "Switching laser emission");
        self.transport
            .write(&format!(":LASER:STATUS {}", state))
            .await
    }
}

#[async_trait]
impl Identifiable for SacherLion {
    async fn identify(&self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }
}

#[async_trait]
impl PiezoActuator for SacherLion {
    async fn set_piezo_voltage(&self, volts: f64) -> AppResult<()> {
        if !(volts.is_finite() && volts.abs() <= PIEZO_LIMIT_V) {
            return Err(DaqError::OutOfRange {
                parameter: "piezo voltage",
                value: volts,
                min: -PIEZO_LIMIT_V,
                max: PIEZO_LIMIT_V,
            });
        }
        self.transport
            .write(&format!(":PIEZO:OFFSET {}V", volts))
            .await
    }

    async fn piezo_voltage(&self) -> AppResult<f64> {
        let response = self.transport.query(":PIEZO:OFFSET?").await?;
        parse_number(":PIEZO:OFFSET?", response.trim().trim_end_matches('V'))
    }

    fn piezo_range(&self) -> (f64, f64) {
        (-PIEZO_LIMIT_V, PIEZO_LIMIT_V)
    }
}

#[async_trait]
impl LaserDiagnostics for SacherLion {
    async fn system_status(&self) -> AppResult<LaserStatus> {
        let response = self.transport.query(":SYSTEM:STATUS?").await?;
        let status = decode_status(&response)?;
        if !status.is_ok() {
            tracing::warn!(code = status.code, faults = ?status.faults, "Laser reports faults");
        }
        Ok(status)
    }

    async fn current_ma(&self) -> AppResult<f64> {
        let response = self.transport.query(":LASER:CURRENT?").await?;
        Ok(parse_number(":LASER:CURRENT?", &response)? * 1000.0)
    }

    async fn working_hours(&self) -> AppResult<String> {
        self.transport.query(":SYSTEM:Laser:Hours?").await
    }
}
