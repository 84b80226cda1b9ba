//! Stanford Research Systems SR830 Lock-in Amplifier Driver
//!
//! Demodulates the microphone signal at the acoustic frequency.
//!
//! Protocol Overview:
//! - Interface: GPIB (default address 8)
//! - `OUTP? 1` / `OUTP? 2`: X / Y output in volts
//! - `SNAP? 1,2`: X and Y latched at the same instant, comma separated
//! - `SNAP? 3,4`: R (V) and θ (degrees)

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Identifiable, LockInAmplifier};
use crate::hardware::connector::ConnectionDefaults;
use crate::hardware::parse_number;
use crate::hardware::transport::InstrumentTransport;

/// Driver for the SRS SR830 DSP lock-in amplifier.
pub struct Sr830 {
    transport: Arc<dyn InstrumentTransport>,
}

impl Sr830 {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn InstrumentTransport>) -> Self {
        Self { transport }
    }

    /// Framing used when the configuration does not override it.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::terminated("\n")
    }

    async fn snap(&self, command: &str) -> AppResult<(f64, f64)> {
        let response = self.transport.query(command).await?;
        let mut values = response.split(',');
        match (values.next(), values.next(), values.next()) {
            (Some(a), Some(b), None) => Ok((parse_number(command, a)?, parse_number(command, b)?)),
            _ => Err(DaqError::parse(command, response)),
        }
    }

    /// Magnitude (V) and phase (degrees).
    pub async fn read_r_theta(&self) -> AppResult<(f64, f64)> {
        self.snap("SNAP? 3,4").await
    }
}

#[async_trait]
impl Identifiable for Sr830 {
    async fn identify(&self) -> AppResult<String> {
        self.transport.query("*IDN?").await
    }
}

#[async_trait]
impl LockInAmplifier for Sr830 {
    async fn read_xy(&self) -> AppResult<(f64, f64)> {
        self.snap("SNAP? 1,2").await
    }

    async fn read_x(&self) -> AppResult<f64> {
        let response = self.transport.query("OUTP? 1").await?;
        parse_number("OUTP? 1", &response)
    }

    async fn read_y(&self) -> AppResult<f64> {
        let response = self.transport.query("OUTP? 2").await?;
        parse_number("OUTP? 2", &response)
    }
}
