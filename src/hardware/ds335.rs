//! Stanford Research Systems DS335 Function Generator Driver
//!
//! Generates the acoustic modulation of the photoacoustic cell.
//!
//! Protocol Overview:
//! - Interface: GPIB (default address 22)
//! - Format: SRS ASCII commands, LF terminated
//! - `FREQ <hz>` / `FREQ?`: output frequency
//! - `AMPL <v>VP` / `AMPL <v>VR`: amplitude peak-to-peak or RMS
//! - `AMPL? VP`: amplitude, answered as e.g. `1.00VP`
//! - `FUNC <n>` / `FUNC?`: waveform index (0 sine, 1 square, 2 triangle, 3 ramp, 4 noise)
//!
//! # Example Usage
//!
//! ```no_run
//! use pas_daq::hardware::capabilities::FunctionGenerator;
//! use pas_daq::hardware::ds335::Ds335;
//! # use std::sync::Arc;
//! # async fn demo(transport: Arc<dyn pas_daq::hardware::transport::InstrumentTransport>) -> pas_daq::error::AppResult<()> {
//! let generator = Ds335::new(transport);
//! generator.set_frequency(1540.0).await?;
//! println!("{} Hz", generator.frequency().await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Amplitude, FunctionGenerator, Identifiable, Waveform};
use crate::hardware::connector::ConnectionDefaults;
use crate::hardware::parse_number;
use crate::hardware::transport::InstrumentTransport;

const WAVEFORMS: [Waveform; 5] = [
    Waveform::Sine,
    Waveform::Square,
    Waveform::Triangle,
    Waveform::Ramp,
    Waveform::Noise,
];

/// Driver for the SRS DS335 synthesized function generator.
pub struct Ds335 {
    transport: Arc<dyn InstrumentTransport>,
}

impl Ds335 {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn InstrumentTransport>) -> Self {
        Self { transport }
    }

    /// Framing used when the configuration does not override it.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::terminated("\n")
    }

    fn waveform_index(waveform: Waveform) -> usize {
        WAVEFORMS
            .iter()
            .position(|w| *w == waveform)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Identifiable for Ds335 {
    async fn identify(&self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }
}

#[async_trait]
impl FunctionGenerator for Ds335 {
    async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        if !(hz.is_finite() && hz > 0.0) {
            return Err(DaqError::OutOfRange {
                parameter: "function generator frequency",
                value: hz,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        self.transport.write(&format!("FREQ {}", hz)).await
    }

    async fn frequency(&self) -> AppResult<f64> {
        let response = self.transport.query("FREQ?").await?;
        parse_number("FREQ?", &response)
    }

    async fn set_amplitude(&self, amplitude: Amplitude) -> AppResult<()> {
        let command = match amplitude {
            Amplitude::PeakToPeak(v) => format!("AMPL {}VP", v),
            Amplitude::Rms(v) => format!("AMPL {}VR", v),
        };
        self.transport.write(&command).await
    }

    async fn amplitude_vpp(&self) -> AppResult<f64> {
        let response = self.transport.query("AMPL? VP").await?;
        let value = response.trim().trim_end_matches("VP").trim_end_matches("vp");
        parse_number("AMPL? VP", value)
    }

    async fn set_waveform(&self, waveform: Waveform) -> AppResult<()> {
        self.transport
            .write(&format!("FUNC {}", Self::waveform_index(waveform)))
            .await
    }

    async fn waveform(&self) -> AppResult<Waveform> {
        let response = self.transport.query("FUNC?").await?;
        response
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|i| WAVEFORMS.get(i).copied())
            .ok_or_else(|| DaqError::parse("FUNC?", response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_transport::ScriptedTransport;

    fn driver() -> (Arc<ScriptedTransport>, Ds335) {
        let transport = Arc::new(
            ScriptedTransport::new()
                .respond("FREQ?", "1540.0")
                .respond("AMPL? VP", "1.25VP")
                .respond("FUNC?", "2"),
        );
        (transport.clone(), Ds335::new(transport))
    }

    #[tokio::test]
    async fn formats_set_commands() {
        let (transport, generator) = driver();
        generator.set_frequency(1540.0).await.unwrap();
        generator.set_amplitude(Amplitude::PeakToPeak(1.5)).await.unwrap();
        generator.set_amplitude(Amplitude::Rms(0.5)).await.unwrap();
        generator.set_waveform(Waveform::Ramp).await.unwrap();
        assert_eq!(
            transport.call_log(),
            vec!["FREQ 1540", "AMPL 1.5VP", "AMPL 0.5VR", "FUNC 3"]
        );
    }

    #[tokio::test]
    async fn parses_queries() {
        let (_, generator) = driver();
        assert_eq!(generator.frequency().await.unwrap(), 1540.0);
        assert_eq!(generator.amplitude_vpp().await.unwrap(), 1.25);
        assert_eq!(generator.waveform().await.unwrap(), Waveform::Triangle);
    }

    #[tokio::test]
    async fn rejects_non_positive_frequency() {
        let (transport, generator) = driver();
        assert!(generator.set_frequency(0.0).await.is_err());
        assert!(generator.set_frequency(f64::NAN).await.is_err());
        assert!(transport.call_log().is_empty());
    }

    #[tokio::test]
    async fn unknown_waveform_index_is_a_parse_error() {
        let transport = Arc::new(ScriptedTransport::new().respond("FUNC?", "7"));
        let generator = Ds335::new(transport);
        assert!(matches!(
            generator.waveform().await.unwrap_err(),
            DaqError::Parse { .. }
        ));
    }
}
