//! Laser Control Procedures
//!
//! Closed-loop routines that run on top of the capability traits:
//!
//! - **Frequency lock**: PI loop from wavemeter reading to piezo voltage
//!   ([`spawn_lock`], [`LockHandle`])
//! - **Coarse tuning**: grating move followed by a short confirmation lock
//!   ([`LaserController::go_to_frequency`])
//!
//! # Lock lifecycle
//!
//! ```text
//!   spawn_lock ──▶ Acquiring ──(stable_after samples in tolerance)──▶ Locked
//!                      ▲  │                                              │
//!                      │  └──(acquire_timeout)──▶ Failed                 │
//!                      └─────────────(left tolerance)────────────────────┘
//!
//!   stop() from any state ──▶ Stopped
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use pas_daq::procedures::{LaserController, LockParams};
//!
//! let controller = LaserController::new(laser, wavemeter, Some(tuner));
//! let lock = controller.lock(setpoint, &LockParams::default()).await?;
//! if lock.wait_locked(Duration::from_secs(30)).await {
//!     // sample while lock.is_locked()
//! }
//! controller.stop_locking().await?;
//! ```

pub mod frequency_lock;

// Re-exports
pub use frequency_lock::{
    spawn_lock, LaserController, LockHandle, LockParams, LockState, LockWatch, TuningParams,
};
