//! Scan planning and execution.
//!
//! - [`plan`]: the setpoints of a scan ([`ScanPlan`])
//! - [`sequencer`]: tune, lock, sample and record each setpoint ([`AcquisitionSequencer`])

pub mod plan;
pub mod sequencer;

pub use plan::ScanPlan;
pub use sequencer::{AcquisitionSequencer, ScanEvent, ScanSummary};
