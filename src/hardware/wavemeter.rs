//! Wavelength meter over a text protocol.
//!
//! Many wavelength meters (and the LAN bridges sold for vendor-DLL meters) answer a
//! single query with the current reading. [`ScpiWavemeter`] sends a configurable
//! query and interprets the number in a configurable unit.
//!
//! Meters report exposure problems as non-positive readings (`0`, `-3` for low
//! signal, `-4` for overexposure, ...); those become [`DaqError::Instrument`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::frequency::{Frequency, FrequencyUnit};
use crate::hardware::capabilities::{FrequencyMeter, Identifiable};
use crate::hardware::connector::ConnectionDefaults;
use crate::hardware::parse_number;
use crate::hardware::transport::InstrumentTransport;

/// Query used when none is configured.
pub const DEFAULT_QUERY: &str = ":MEAS:FREQ?";

/// Text-protocol wavelength meter.
pub struct ScpiWavemeter {
    transport: Arc<dyn InstrumentTransport>,
    query: String,
    unit: FrequencyUnit,
}

impl ScpiWavemeter {
    /// Meter answering [`DEFAULT_QUERY`] in THz.
    pub fn new(transport: Arc<dyn InstrumentTransport>) -> Self {
        Self::with_query(transport, DEFAULT_QUERY, FrequencyUnit::THz)
    }

    /// Meter answering `query` with a value in `unit`.
    pub fn with_query(
        transport: Arc<dyn InstrumentTransport>,
        query: impl Into<String>,
        unit: FrequencyUnit,
    ) -> Self {
        Self {
            transport,
            query: query.into(),
            unit,
        }
    }

    /// Framing used when the configuration does not override it.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::terminated("\n")
    }
}

#[async_trait]
impl Identifiable for ScpiWavemeter {
    async fn identify(&self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }
}

#[async_trait]
impl FrequencyMeter for ScpiWavemeter {
    async fn read_frequency(&self) -> AppResult<Frequency> {
        let response = self.transport.query(&self.query).await?;
        // Tolerate a trailing unit label, e.g. "394.2031 THz".
        let number = response.split_whitespace().next().unwrap_or_default();
        let value = parse_number(&self.query, number)?;
        if value <= 0.0 {
            return Err(DaqError::Instrument(format!(
                "Wavemeter reported error code {} (no usable signal)",
                value
            )));
        }
        Frequency::new(value, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_transport::ScriptedTransport;

    #[tokio::test]
    async fn converts_configured_unit() {
        let transport = Arc::new(ScriptedTransport::new().respond(":MEAS:FREQ?", "394.4590 THz"));
        let meter = ScpiWavemeter::new(transport);
        let f = meter.read_frequency().await.unwrap();
        assert!((f.ghz() - 394_459.0).abs() < 1e-6);

        let transport = Arc::new(ScriptedTransport::new().respond("WAVE?", "760.01"));
        let meter = ScpiWavemeter::with_query(transport, "WAVE?", FrequencyUnit::Nm);
        let f = meter.read_frequency().await.unwrap();
        assert!((f.nm() - 760.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exposure_error_codes_are_errors() {
        let transport = Arc::new(ScriptedTransport::new().respond(":MEAS:FREQ?", "-4"));
        let meter = ScpiWavemeter::new(transport);
        assert!(matches!(
            meter.read_frequency().await.unwrap_err(),
            DaqError::Instrument(_)
        ));
    }
}
