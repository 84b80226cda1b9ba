//! # PAS DAQ Core Library
//!
//! Data acquisition and laser control for a photoacoustic spectrometer. A tunable
//! diode laser is stepped across a list of optical frequencies; at each point it is
//! coarse-tuned by its grating, fine-locked to a wavelength meter through its piezo,
//! and the microphone lock-in, power meter and cell sensors are sampled while the
//! lock holds.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered settings (defaults, TOML, `PAS_DAQ_*` environment) loaded with
//!   `figment`. See `config::Settings`.
//! - **`error`**: The `DaqError` enum and `AppResult` alias used across the crate.
//! - **`error_recovery`**: Retry policy for transient instrument failures.
//! - **`frequency`**: The `Frequency` value type and its unit conversions.
//! - **`hardware`**: Transports (TCP, Prologix GPIB-ETHERNET, serial), capability traits,
//!   instrument drivers and the simulated rig.
//! - **`procedures`**: The piezo frequency lock and coarse tuning.
//! - **`experiment`**: Scan plans and the acquisition sequencer.
//! - **`data`**: Session recorders (CSV plus JSON metadata).
//! - **`measurement`**: One acquisition sample.
//! - **`session`**: The instruments of one run and their metadata.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod frequency;
pub mod hardware;
pub mod measurement;
pub mod procedures;
pub mod session;
pub mod tracing_setup;
