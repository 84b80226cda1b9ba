//! Hardware layer
//!
//! - [`transport`], [`prologix`], [`connector`]: byte-level I/O to instruments
//! - [`capabilities`]: the traits procedures are written against
//! - Drivers: [`ds335`], [`sr830`], [`sacher_lion`], [`lakeshore_211`],
//!   [`newport_1830c`], [`wavemeter`], [`epos`]
//! - [`mock`]: simulated rig, [`mock_transport`]: scripted transport for driver tests

pub mod capabilities;
pub mod connector;
pub mod ds335;
pub mod epos;
pub mod lakeshore_211;
pub mod mock;
pub mod mock_transport;
pub mod newport_1830c;
pub mod prologix;
pub mod sacher_lion;
pub mod sr830;
pub mod transport;
pub mod wavemeter;

pub use connector::{ConnectionDefaults, Connector};
pub use transport::{InstrumentTransport, ResourceAddress, TransportOptions};

use crate::error::{AppResult, DaqError};

/// Parse a numeric instrument response such as `"+1.234E-06"`. `inf` and `NaN` are
/// rejected.
pub(crate) fn parse_number(command: &str, response: &str) -> AppResult<f64> {
    let trimmed = response.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DaqError::parse(command, trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instrument_numbers() {
        assert_eq!(parse_number("FREQ?", " 1540.0\r").unwrap(), 1540.0);
        assert_eq!(parse_number("OUTP? 1", "+1.5E-06").unwrap(), 1.5e-6);
        assert!(matches!(
            parse_number("FREQ?", "ERR 3"),
            Err(DaqError::Parse { .. })
        ));
        for non_finite in ["inf", "-inf", "NaN", "+INF"] {
            assert!(
                matches!(parse_number("D?", non_finite), Err(DaqError::Parse { .. })),
                "{non_finite} should be rejected"
            );
        }
    }
}
