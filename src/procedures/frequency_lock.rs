//! Piezo frequency lock.
//!
//! A PI loop reads the wavemeter and nudges the laser piezo until the measured
//! frequency sits within tolerance of the setpoint. The loop runs as a tokio task
//! ([`spawn_lock`]) and publishes its [`LockState`] through a `watch` channel, so
//! the acquisition sequencer can keep sampling while the lock holds.
//!
//! The piezo moves the laser by roughly −1.5 GHz/V; the proportional gain is scaled
//! to that (`Kp = P · 1.5 · 0.5`). Piezo steps larger than 0.1 V are shrunk by
//! decades, and steps below 1 mV are not applied at all.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AppResult, DaqError};
use crate::frequency::Frequency;
use crate::hardware::capabilities::{FrequencyMeter, PiezoActuator, WavelengthTuner};

/// Largest piezo step applied in one iteration, volts.
const MAX_STEP_V: f64 = 0.1;
/// Smallest piezo step worth applying, volts.
const MIN_STEP_V: f64 = 0.001;
/// Decades the response may be shrunk by before the step is abandoned.
const STEP_SCALES: i32 = 6;

/// PI lock parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockParams {
    /// Largest |measured − setpoint| considered in lock
    pub tolerance: Frequency,
    /// Proportional gain (dimensionless, scaled by the piezo response)
    pub p_gain: f64,
    /// Integral gain
    pub i_gain: f64,
    /// Error samples averaged by the integral term
    pub integration_samples: usize,
    /// Consecutive in-tolerance samples required before declaring lock
    pub stable_after: u32,
    /// Give up if not locked within this time
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Pause between iterations
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LockParams {
    fn default() -> Self {
        Self {
            tolerance: Frequency::from_mhz(3.0),
            p_gain: 1.0,
            i_gain: 1.0,
            integration_samples: 10,
            stable_after: 10,
            acquire_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl LockParams {
    /// Check the parameters; `section` names them in error messages.
    pub fn validate(&self, section: &str) -> AppResult<()> {
        if !(self.tolerance.ghz().is_finite() && self.tolerance.ghz() > 0.0) {
            return Err(DaqError::Configuration(format!(
                "{}.tolerance must be positive, got {}",
                section, self.tolerance
            )));
        }
        if !(self.p_gain.is_finite() && self.i_gain.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "{}.p_gain and {}.i_gain must be finite",
                section, section
            )));
        }
        if self.integration_samples == 0 {
            return Err(DaqError::Configuration(format!(
                "{}.integration_samples must be at least 1",
                section
            )));
        }
        if self.poll_interval.is_zero() || self.acquire_timeout.is_zero() {
            return Err(DaqError::Configuration(format!(
                "{}.poll_interval and {}.acquire_timeout must be non-zero",
                section, section
            )));
        }
        Ok(())
    }
}

/// Coarse tuning parameters used by [`LaserController::go_to_frequency`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// Lock tolerance while tuning
    pub tolerance: Frequency,
    /// Consecutive in-tolerance samples while tuning
    pub stable_after: u32,
    /// Longest to wait for the tuning lock
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            tolerance: Frequency::from_mhz(10.0),
            stable_after: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TuningParams {
    /// Check the parameters.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.tolerance.ghz().is_finite() && self.tolerance.ghz() > 0.0) {
            return Err(DaqError::Configuration(format!(
                "tuning.tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.timeout.is_zero() {
            return Err(DaqError::Configuration(
                "tuning.timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// `base` with the tuning tolerance and stability count.
    pub fn lock_params(&self, base: &LockParams) -> LockParams {
        LockParams {
            tolerance: self.tolerance,
            stable_after: self.stable_after,
            ..base.clone()
        }
    }
}

/// Lifecycle of one lock task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Converging on the setpoint
    Acquiring,
    /// Within tolerance for long enough
    Locked,
    /// Gave up or hit a fatal instrument error
    Failed,
    /// Stopped on request
    Stopped,
}

impl LockState {
    /// The task has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LockState::Failed | LockState::Stopped)
    }
}

/// Read-only view of a running lock.
#[derive(Debug, Clone)]
pub struct LockWatch {
    setpoint: Frequency,
    state: watch::Receiver<LockState>,
}

impl LockWatch {
    /// Target frequency.
    pub fn setpoint(&self) -> Frequency {
        self.setpoint
    }

    /// Latest state.
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// Currently locked.
    pub fn is_locked(&self) -> bool {
        self.state() == LockState::Locked
    }

    /// Wait until locked, returning `false` if the lock fails, stops or `timeout`
    /// elapses first.
    pub async fn wait_locked(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let outcome = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == LockState::Locked || s.is_terminal()),
        )
        .await;
        match outcome {
            Ok(Ok(reached)) => *reached == LockState::Locked,
            _ => false,
        }
    }

    /// Receiver of every state change.
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state.clone()
    }
}

/// Owner of a running lock task.
pub struct LockHandle {
    watch: LockWatch,
    stop: watch::Sender<bool>,
    task: JoinHandle<AppResult<()>>,
}

impl LockHandle {
    /// View that outlives the handle.
    pub fn watch(&self) -> LockWatch {
        self.watch.clone()
    }

    /// Latest state.
    pub fn state(&self) -> LockState {
        self.watch.state()
    }

    /// Currently locked.
    pub fn is_locked(&self) -> bool {
        self.watch.is_locked()
    }

    /// See [`LockWatch::wait_locked`].
    pub async fn wait_locked(&self, timeout: Duration) -> bool {
        self.watch.wait_locked(timeout).await
    }

    /// Receiver of every state change.
    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.watch.subscribe()
    }

    /// Signal the task to stop and wait for it.
    ///
    /// Returns the task's outcome: `Ok` when it was stopped (or had not failed),
    /// [`DaqError::LockFailed`] or the fatal instrument error otherwise.
    pub async fn stop(self) -> AppResult<()> {
        // The task may already be gone; the send error is irrelevant then.
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DaqError::Instrument(format!("Lock task terminated abnormally: {}", e))),
        }
    }
}

/// Start a lock on `setpoint`.
pub fn spawn_lock(
    piezo: Arc<dyn PiezoActuator>,
    meter: Arc<dyn FrequencyMeter>,
    setpoint: Frequency,
    params: LockParams,
) -> LockHandle {
    let (state_tx, state_rx) = watch::channel(LockState::Acquiring);
    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_lock(piezo, meter, setpoint, params, state_tx, stop_rx));
    LockHandle {
        watch: LockWatch {
            setpoint,
            state: state_rx,
        },
        stop: stop_tx,
        task,
    }
}

/// Candidate piezo steps for a `response` in volts, largest first.
fn scaled_steps(response: f64) -> impl Iterator<Item = f64> {
    (0..STEP_SCALES)
        .map(move |scale| response * 10f64.powi(-scale))
        .skip_while(|step| step.abs() > MAX_STEP_V)
        .take_while(|step| step.abs() >= MIN_STEP_V)
}

async fn run_lock(
    piezo: Arc<dyn PiezoActuator>,
    meter: Arc<dyn FrequencyMeter>,
    setpoint: Frequency,
    params: LockParams,
    state: watch::Sender<LockState>,
    mut stop: watch::Receiver<bool>,
) -> AppResult<()> {
    let kp = params.p_gain * 1.5 * 0.5;
    let tau = params.integration_samples.max(1);
    let mut history: VecDeque<f64> = VecDeque::with_capacity(tau);
    let mut counter: u32 = 0;
    let mut locked = false;

    let mut piezo_v = match piezo.piezo_voltage().await {
        Ok(v) => v,
        Err(e) => {
            state.send_replace(LockState::Failed);
            return Err(e);
        }
    };
    let mut acquire_start = Instant::now();
    tracing::info!(setpoint = %setpoint, piezo_v, "Locking laser");

    loop {
        if *stop.borrow() {
            return Ok(stopped(&state, setpoint));
        }

        if !locked && acquire_start.elapsed() > params.acquire_timeout {
            state.send_replace(LockState::Failed);
            tracing::warn!(setpoint = %setpoint, "Failed to lock laser");
            return Err(DaqError::LockFailed {
                setpoint_ghz: setpoint.ghz(),
                elapsed: acquire_start.elapsed(),
            });
        }

        let measured = match meter.read_frequency().await {
            Ok(f) => f,
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Wavemeter read failed, retrying");
                if pause(&mut stop, params.poll_interval).await {
                    return Ok(stopped(&state, setpoint));
                }
                continue;
            }
            Err(e) => {
                state.send_replace(LockState::Failed);
                tracing::error!(error = %e, "Lock aborted by wavemeter error");
                return Err(e);
            }
        };

        let err = (measured - setpoint).ghz();
        if err.abs() < params.tolerance.ghz() {
            if !locked {
                counter += 1;
            }
        } else {
            counter = 0;
            if locked {
                locked = false;
                acquire_start = Instant::now();
                state.send_replace(LockState::Acquiring);
                tracing::info!(setpoint = %setpoint, err_ghz = err, "Lock lost, reacquiring");
            }
        }
        if counter > params.stable_after && !locked {
            locked = true;
            state.send_replace(LockState::Locked);
            tracing::info!(setpoint = %setpoint, err_ghz = err, "Laser locked");
        }

        if history.len() == tau {
            history.pop_front();
        }
        history.push_back(err);
        let mean = history.iter().sum::<f64>() / history.len() as f64;
        let response = kp * (err + params.i_gain * mean);
        tracing::debug!(
            setpoint_ghz = setpoint.ghz(),
            measured_ghz = measured.ghz(),
            err_ghz = err,
            response_v = response,
            "lock iteration"
        );

        for step in scaled_steps(response) {
            match piezo.set_piezo_voltage(piezo_v + step).await {
                Ok(()) => {
                    piezo_v += step;
                    break;
                }
                Err(DaqError::OutOfRange { .. }) => {
                    tracing::debug!(step, "Piezo step out of range, trying smaller step");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Piezo write failed");
                    break;
                }
            }
        }

        if pause(&mut stop, params.poll_interval).await {
            return Ok(stopped(&state, setpoint));
        }
    }
}

fn stopped(state: &watch::Sender<LockState>, setpoint: Frequency) {
    state.send_replace(LockState::Stopped);
    tracing::info!(setpoint = %setpoint, "Lock stopped");
}

/// Sleep for `interval`, waking early on a stop request.
///
/// Returns `true` when the lock should stop, including when its handle was dropped.
async fn pause(stop: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

/// Laser piezo, wavemeter and optional grating tuner, with at most one active lock.
pub struct LaserController {
    piezo: Arc<dyn PiezoActuator>,
    meter: Arc<dyn FrequencyMeter>,
    tuner: Option<Arc<dyn WavelengthTuner>>,
    active: Mutex<Option<LockHandle>>,
}

impl LaserController {
    /// Controller over the given instruments.
    pub fn new(
        piezo: Arc<dyn PiezoActuator>,
        meter: Arc<dyn FrequencyMeter>,
        tuner: Option<Arc<dyn WavelengthTuner>>,
    ) -> Self {
        Self {
            piezo,
            meter,
            tuner,
            active: Mutex::new(None),
        }
    }

    /// Wavemeter the lock reads.
    pub fn wavemeter(&self) -> &Arc<dyn FrequencyMeter> {
        &self.meter
    }

    /// Whether coarse tuning is available.
    pub fn has_tuner(&self) -> bool {
        self.tuner.is_some()
    }

    /// Lock to `setpoint`, replacing any running lock.
    pub async fn lock(&self, setpoint: Frequency, params: &LockParams) -> AppResult<LockWatch> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if let Err(e) = previous.stop().await {
                tracing::warn!(error = %e, "Previous lock ended with an error");
            }
        }
        let handle = spawn_lock(self.piezo.clone(), self.meter.clone(), setpoint, params.clone());
        let watch = handle.watch();
        *active = Some(handle);
        Ok(watch)
    }

    /// Stop the running lock, if any, and report how it ended.
    pub async fn stop_locking(&self) -> AppResult<()> {
        let handle = self.active.lock().await.take();
        match handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    /// State of the running lock.
    pub async fn lock_state(&self) -> Option<LockState> {
        self.active.lock().await.as_ref().map(LockHandle::state)
    }

    /// Coarse-tune to `target` and confirm with a short lock.
    ///
    /// Returns whether the laser reached `target` within the tuning tolerance. The
    /// tuning lock is stopped before returning.
    pub async fn go_to_frequency(
        &self,
        target: Frequency,
        tuning: &TuningParams,
        base: &LockParams,
    ) -> AppResult<bool> {
        match &self.tuner {
            Some(tuner) => tuner.go_to(target.nm()).await?,
            None => tracing::warn!(target = %target, "No wavelength tuner, relying on the piezo alone"),
        }

        let watch = self.lock(target, &tuning.lock_params(base)).await?;
        let reached = watch.wait_locked(tuning.timeout).await;
        match self.stop_locking().await {
            Ok(()) | Err(DaqError::LockFailed { .. }) => {}
            Err(e) => return Err(e),
        }
        if !reached {
            tracing::warn!(target = %target, "Tuning lock not reached");
        }
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MotorConfig, SimulationConfig};
    use crate::hardware::mock::SimulatedRig;
    use tracing_test::traced_test;

    async fn rig() -> SimulatedRig {
        SimulatedRig::new(&SimulationConfig::default(), &MotorConfig::default())
            .await
            .unwrap()
            .without_noise()
    }

    #[test]
    fn step_scaling() {
        let steps: Vec<f64> = scaled_steps(0.05).collect();
        assert_eq!(steps.first().copied(), Some(0.05));

        let first = scaled_steps(2.5).next().unwrap();
        assert!((first - 0.025).abs() < 1e-12);

        assert_eq!(scaled_steps(0.0005).count(), 0);
        // Out-of-range retries continue one decade down.
        let steps: Vec<f64> = scaled_steps(-0.08).collect();
        assert_eq!(steps.len(), 2);
        assert!((steps[1] + 0.008).abs() < 1e-12);
    }

    #[test]
    fn tuning_overrides_tolerance_and_stability() {
        let base = LockParams::default();
        let params = TuningParams::default().lock_params(&base);
        assert!((params.tolerance.mhz() - 10.0).abs() < 1e-9);
        assert_eq!(params.stable_after, 3);
        assert_eq!(params.integration_samples, base.integration_samples);
    }

    #[test]
    fn validation() {
        assert!(LockParams::default().validate("lock").is_ok());
        let params = LockParams {
            integration_samples: 0,
            ..LockParams::default()
        };
        assert!(params.validate("lock").is_err());
        let params = LockParams {
            tolerance: Frequency::from_ghz(0.0),
            ..LockParams::default()
        };
        assert!(params.validate("lock").is_err());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn locks_onto_nearby_setpoint() {
        let rig = rig().await;
        let start = rig.wavemeter.read_frequency().await.unwrap();
        let setpoint = start + Frequency::from_ghz(0.5);

        let handle = spawn_lock(rig.laser.clone(), rig.wavemeter.clone(), setpoint, LockParams::default());
        assert!(handle.wait_locked(Duration::from_secs(30)).await);
        assert!(handle.is_locked());

        let measured = rig.wavemeter.read_frequency().await.unwrap();
        assert!(measured.abs_diff(setpoint).mhz() < 5.0);
        handle.stop().await.unwrap();
        assert!(logs_contain("Laser locked"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_setpoint_fails_after_timeout() {
        let rig = rig().await;
        let start = rig.wavemeter.read_frequency().await.unwrap();
        // Beyond the ±13 V piezo range.
        let setpoint = start + Frequency::from_ghz(40.0);

        let handle = spawn_lock(rig.laser.clone(), rig.wavemeter.clone(), setpoint, LockParams::default());
        let mut states = handle.subscribe();
        assert!(!handle.wait_locked(Duration::from_secs(60)).await);
        assert_eq!(*states.borrow_and_update(), LockState::Failed);

        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, DaqError::LockFailed { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_wavemeter_errors_do_not_break_the_lock() {
        let rig = rig().await;
        let setpoint = rig.wavemeter.read_frequency().await.unwrap() + Frequency::from_ghz(0.2);
        rig.wavemeter.inject_timeouts(3);

        let handle = spawn_lock(rig.laser.clone(), rig.wavemeter.clone(), setpoint, LockParams::default());
        assert!(handle.wait_locked(Duration::from_secs(30)).await);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn controller_replaces_running_lock() {
        let rig = rig().await;
        let controller = LaserController::new(rig.laser.clone(), rig.wavemeter.clone(), None);
        let here = rig.wavemeter.read_frequency().await.unwrap();

        let first = controller.lock(here + Frequency::from_ghz(0.3), &LockParams::default()).await.unwrap();
        let second = controller.lock(here - Frequency::from_ghz(0.3), &LockParams::default()).await.unwrap();
        assert_eq!(first.state(), LockState::Stopped);
        assert!(second.wait_locked(Duration::from_secs(30)).await);

        controller.stop_locking().await.unwrap();
        assert_eq!(second.state(), LockState::Stopped);
        assert_eq!(controller.lock_state().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn go_to_frequency_tunes_grating_then_locks() {
        let rig = rig().await;
        let controller = LaserController::new(
            rig.laser.clone(),
            rig.wavemeter.clone(),
            Some(rig.tuner.clone()),
        );
        let target = Frequency::from_nm(770.0);

        let reached = controller
            .go_to_frequency(target, &TuningParams::default(), &LockParams::default())
            .await
            .unwrap();
        assert!(reached);
        let measured = rig.wavemeter.read_frequency().await.unwrap();
        assert!(measured.abs_diff(target).mhz() < 50.0);
        assert_eq!(controller.lock_state().await, None);
    }
}
