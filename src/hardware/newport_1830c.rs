//! Newport 1830-C Optical Power Meter Driver
//!
//! Reference: Newport 1830-C User's Manual
//!
//! Protocol Overview:
//! - Format: Simple ASCII commands (NOT SCPI)
//! - Serial: 9600, 8N1, no flow control (GPIB also available)
//! - Terminator: LF (\n)
//! - Commands: A0/A1 (attenuator), F1/F2/F3 (filter), CS (clear status)
//! - Query: D? (power measurement)
//!
//! # Important Notes
//!
//! - The meter does NOT respond to configuration commands
//! - Responses use scientific notation (e.g., "5E-9")
//!
//! # Example Usage
//!
//! ```no_run
//! use pas_daq::hardware::capabilities::Readable;
//! use pas_daq::hardware::newport_1830c::Newport1830C;
//! # use std::sync::Arc;
//! # async fn demo(transport: Arc<dyn pas_daq::hardware::transport::InstrumentTransport>) -> pas_daq::error::AppResult<()> {
//! let meter = Newport1830C::new(transport);
//!
//! // Configure attenuator and filter
//! meter.set_attenuator(false).await?;
//! meter.set_filter(2).await?;  // 1=Slow, 2=Medium, 3=Fast
//!
//! let power_watts = meter.read().await?;
//! println!("Power: {:.3e} W", power_watts);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::Readable;
use crate::hardware::connector::ConnectionDefaults;
use crate::hardware::parse_number;
use crate::hardware::transport::InstrumentTransport;

/// Settling pause after a configuration command.
const CONFIG_SETTLE: Duration = Duration::from_millis(50);

/// Driver for Newport 1830-C optical power meter
///
/// Implements Readable capability trait for power measurement in watts.
pub struct Newport1830C {
    transport: Arc<dyn InstrumentTransport>,
}

/// Parse power measurement response
///
/// Handles scientific notation like "5E-9", "+.75E-9"
pub fn parse_power_response(response: &str) -> AppResult<f64> {
    let trimmed = response.trim();

    if trimmed.is_empty() {
        return Err(DaqError::Instrument("Empty power response".to_string()));
    }
    if trimmed.contains("ERR") || trimmed.contains("OVER") || trimmed.contains("UNDER") {
        return Err(DaqError::Instrument(format!(
            "Meter error response: {}",
            trimmed
        )));
    }

    parse_number("D?", trimmed)
}

impl Newport1830C {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn InstrumentTransport>) -> Self {
        Self { transport }
    }

    /// Framing used when the configuration does not override it.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::terminated("\n")
    }

    /// Set attenuator state
    ///
    /// # Arguments
    /// * `enabled` - true to enable attenuator (A1), false to disable (A0)
    pub async fn set_attenuator(&self, enabled: bool) -> AppResult<()> {
        let cmd = if enabled { "A1" } else { "A0" };
        self.send_config_command(cmd).await
    }

    /// Set filter (integration time)
    ///
    /// # Arguments
    /// * `filter` - Filter setting: 1=Slow, 2=Medium, 3=Fast
    ///
    /// # Errors
    /// Returns error if filter value is not 1, 2, or 3
    pub async fn set_filter(&self, filter: u8) -> AppResult<()> {
        if !(1..=3).contains(&filter) {
            return Err(DaqError::OutOfRange {
                parameter: "power meter filter",
                value: f64::from(filter),
                min: 1.0,
                max: 3.0,
            });
        }

        self.send_config_command(&format!("F{}", filter)).await
    }

    /// Clear status (zero power reading)
    pub async fn clear_status(&self) -> AppResult<()> {
        self.send_config_command("CS").await
    }

    async fn send_config_command(&self, command: &str) -> AppResult<()> {
        self.transport.write(command).await?;
        // Small delay to allow meter to process command
        tokio::time::sleep(CONFIG_SETTLE).await;
        Ok(())
    }
}

#[async_trait]
impl Readable for Newport1830C {
    async fn read(&self) -> AppResult<f64> {
        let response = self.transport.query("D?").await?;
        parse_power_response(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock_transport::ScriptedTransport;

    #[test]
    fn test_parse_power_response() {
        // Test scientific notation
        assert_eq!(parse_power_response("5E-9").unwrap(), 5e-9);
        assert_eq!(parse_power_response("+.75E-9").unwrap(), 0.75e-9);
        assert_eq!(parse_power_response("1.234E-6").unwrap(), 1.234e-6);

        // Test error responses
        assert!(parse_power_response("ERR").is_err());
        assert!(parse_power_response("OVER").is_err());
        assert!(parse_power_response("UNDER").is_err());
        assert!(parse_power_response("").is_err());
        assert!(parse_power_response("NaN").is_err());
        assert!(parse_power_response("inf").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_commands() {
        let transport = Arc::new(ScriptedTransport::new().respond("D?", "2.0E-2"));
        let meter = Newport1830C::new(transport.clone());

        meter.set_attenuator(true).await.unwrap();
        meter.set_filter(3).await.unwrap();
        meter.clear_status().await.unwrap();
        assert!(meter.set_filter(4).await.is_err());
        assert_eq!(meter.read().await.unwrap(), 0.02);

        assert_eq!(transport.call_log(), vec!["A1", "F3", "CS", "D?"]);
    }
}
