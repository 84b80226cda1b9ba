//! Data storage modules.
pub mod storage;

pub use storage::{CsvRecorder, MemoryRecorder, SessionRecorder};
