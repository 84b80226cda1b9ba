//! Lake Shore 211 Temperature Monitor Driver
//!
//! Protocol Overview:
//! - Interface: RS-232, 9600 baud, 7 data bits, odd parity, 1 stop bit, XON/XOFF
//! - Terminator: CR LF both ways; responses without the full CR LF are rejected
//! - `CRDG?`: temperature in °C, `KRDG?`: temperature in K

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::AppResult;
use crate::hardware::capabilities::{Identifiable, Readable};
use crate::hardware::connector::ConnectionDefaults;
use crate::hardware::parse_number;
use crate::hardware::transport::{
    FlowControl, InstrumentTransport, Parity, SerialSettings, TransportOptions,
};

/// Driver for the Lake Shore Model 211 temperature monitor.
///
/// Implements [`Readable`] in degrees Celsius.
pub struct LakeShore211 {
    transport: Arc<dyn InstrumentTransport>,
}

impl LakeShore211 {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn InstrumentTransport>) -> Self {
        Self { transport }
    }

    /// Serial framing of the Model 211.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults {
            options: TransportOptions::default().with_terminator("\r\n").strict(),
            serial: SerialSettings {
                baud_rate: 9600,
                data_bits: 7,
                parity: Parity::Odd,
                stop_bits: 1,
                flow_control: FlowControl::Software,
            },
        }
    }

    /// Temperature in °C.
    pub async fn temperature_celsius(&self) -> AppResult<f64> {
        let response = self.transport.query("CRDG?").await?;
        parse_number("CRDG?", &response)
    }

    /// Temperature in K.
    pub async fn temperature_kelvin(&self) -> AppResult<f64> {
        let response = self.transport.query("KRDG?").await?;
        parse_number("KRDG?", &response)
    }
}

#[async_trait]
impl Identifiable for LakeShore211 {
    async fn identify(&self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }
}

#[async_trait]
impl Readable for LakeShore211 {
    async fn read(&self) -> AppResult<f64> {
        self.temperature_celsius().await
    }
}
