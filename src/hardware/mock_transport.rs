//! Scripted transport for driver tests.
//!
//! [`ScriptedTransport`] answers queries from a table of canned responses and logs
//! every command it receives, so driver tests can assert on the exact wire traffic.
//!
//! ```
//! use pas_daq::hardware::mock_transport::ScriptedTransport;
//! use pas_daq::hardware::transport::InstrumentTransport;
//!
//! # tokio_test::block_on(async {
//! let transport = ScriptedTransport::new().respond("FREQ?", "1540.0");
//! assert_eq!(transport.query("FREQ?").await.unwrap(), "1540.0");
//! transport.write("FUNC 0").await.unwrap();
//! assert_eq!(transport.call_log(), vec!["FREQ?", "FUNC 0"]);
//! # })
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::error_recovery::timeout_error;
use crate::hardware::transport::InstrumentTransport;

/// In-memory [`InstrumentTransport`] with canned responses.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
    sticky: Mutex<HashMap<String, String>>,
    call_log: Mutex<Vec<String>>,
    timeout_next: AtomicBool,
}

impl ScriptedTransport {
    /// Empty script: every query fails until responses are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `response` every time it is queried.
    pub fn respond(self, command: &str, response: &str) -> Self {
        lock(&self.sticky).insert(command.to_string(), response.to_string());
        self
    }

    /// Answer the next query of `command` with `response`, ahead of any sticky
    /// response. Queued responses are consumed in order.
    pub fn respond_once(self, command: &str, response: &str) -> Self {
        self.push_response(command, response);
        self
    }

    /// Queue a one-shot response on a shared transport.
    pub fn push_response(&self, command: &str, response: &str) {
        lock(&self.responses)
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
    }

    /// Make the next exchange fail with [`DaqError::Timeout`].
    pub fn trigger_timeout(&self) {
        self.timeout_next.store(true, Ordering::SeqCst);
    }

    /// Every command received so far, in order.
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Forget the call log.
    pub fn clear_call_log(&self) {
        lock(&self.call_log).clear();
    }

    fn record(&self, command: &str) -> AppResult<()> {
        lock(&self.call_log).push(command.to_string());
        if self.timeout_next.swap(false, Ordering::SeqCst) {
            return Err(timeout_error(
                format!("'{}' on scripted transport", command),
                Duration::ZERO,
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl InstrumentTransport for ScriptedTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        self.record(command)
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        self.record(command)?;
        if let Some(response) = lock(&self.responses)
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(response);
        }
        lock(&self.sticky)
            .get(command)
            .cloned()
            .ok_or_else(|| DaqError::Instrument(format!("No scripted response for '{}'", command)))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
