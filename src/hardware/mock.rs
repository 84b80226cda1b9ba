//! Simulated Spectrometer Rig
//!
//! Provides simulated instruments for testing and for `--simulate` runs without
//! physical hardware. All devices share one physics model ([`RigPhysics`]):
//!
//! - laser frequency = grating wavelength (from the simulated EPOS position and its
//!   calibration) + calibration offset − 1.5 GHz/V × piezo voltage + noise
//! - a Lorentzian absorption line produces the lock-in signal, scaled by laser power
//!
//! # Available Mocks
//!
//! - `SimulatedLaser` - piezo actuator and diagnostics
//! - `SimulatedWavemeter` - reads the model frequency, with timeout injection
//! - `SimulatedLockIn`, `SimulatedPowerMeter`, `SimulatedThermometer`,
//!   `SimulatedPressureGauge`, `SimulatedFunctionGenerator`
//! - `SimulatedEpos` - EPOS object dictionary with a motor that takes a few polls
//!   to reach its target
//!
//! # Example
//!
//! ```
//! use pas_daq::config::{MotorConfig, SimulationConfig};
//! use pas_daq::hardware::capabilities::{FrequencyMeter, WavelengthTuner};
//! use pas_daq::hardware::mock::SimulatedRig;
//!
//! # tokio_test::block_on(async {
//! let rig = SimulatedRig::new(&SimulationConfig::default(), &MotorConfig::default())
//!     .await
//!     .unwrap()
//!     .without_noise();
//! let f = rig.wavemeter.read_frequency().await.unwrap();
//! let grating = rig.tuner.wavelength_nm().await.unwrap();
//! assert!((f.nm() - grating).abs() < 0.01);
//! # })
//! ```

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{MotorConfig, SimulationConfig};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::timeout_error;
use crate::frequency::Frequency;
use crate::hardware::capabilities::{
    Amplitude, FrequencyMeter, FunctionGenerator, Identifiable, LaserDiagnostics, LaserStatus,
    LockInAmplifier, PiezoActuator, Readable, Waveform,
};
use crate::hardware::epos::{
    decode_sacher_float, encode_sacher_float, EposDevice, EposTuner, GratingCalibration,
    PositionProfile, CALIBRATION_OBJECT, STORED_POSITION_OBJECT,
};
use crate::hardware::sacher_lion::PIEZO_LIMIT_V;

/// Laser frequency change per volt of piezo offset.
pub const PIEZO_GHZ_PER_VOLT: f64 = -1.5;

/// Calibration of the simulated grating.
pub const SIMULATED_CALIBRATION: GratingCalibration = GratingCalibration {
    a: 1e-11,
    b: 1e-4,
    c: 750.0,
    min_nm: 756.5,
    max_nm: 781.1,
};

/// Polls of `target_reached` before a simulated move completes.
const MOVE_POLLS: u32 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn noise(peak: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(-peak..=peak)
}

// =============================================================================
// SimulatedEpos - EPOS object dictionary and motor
// =============================================================================

struct EposState {
    objects: HashMap<(u16, u8), u32>,
    encoder: i32,
    absolute: i64,
    enabled: bool,
    pending_polls: u32,
    operation_mode: i8,
    profile: PositionProfile,
    moves: Vec<i32>,
    fail_on_move: Option<u32>,
    move_count: u32,
}

/// Simulated EPOS controller. Clones share the same motor.
#[derive(Clone)]
pub struct SimulatedEpos {
    state: Arc<Mutex<EposState>>,
    calibration: GratingCalibration,
}

impl SimulatedEpos {
    /// Controller whose EPROM holds `calibration` and whose grating sits at
    /// `initial_nm`.
    pub fn new(calibration: GratingCalibration, initial_nm: f64) -> Self {
        let encoded = [
            encode_sacher_float(calibration.a),
            encode_sacher_float(calibration.b),
            encode_sacher_float(calibration.c),
        ];
        // The motor follows the constants as stored, not as requested.
        let calibration = GratingCalibration {
            a: decode_sacher_float(encoded[0]),
            b: decode_sacher_float(encoded[1]),
            c: decode_sacher_float(encoded[2]),
            ..calibration
        };
        let absolute = calibration.wavelength_to_position(initial_nm).unwrap_or(0);

        let mut objects = HashMap::new();
        for (subindex, value) in (1u8..).zip(encoded) {
            objects.insert((CALIBRATION_OBJECT, subindex), value);
        }
        objects.insert(STORED_POSITION_OBJECT, absolute as i32 as u32);

        Self {
            state: Arc::new(Mutex::new(EposState {
                objects,
                encoder: 0,
                absolute,
                enabled: false,
                pending_polls: 0,
                operation_mode: 0,
                profile: PositionProfile {
                    velocity: 12_000,
                    acceleration: 20_000,
                    deceleration: 20_000,
                },
                moves: Vec::new(),
                fail_on_move: None,
                move_count: 0,
            })),
            calibration,
        }
    }

    /// True grating wavelength, independent of the stored position.
    pub fn grating_wavelength_nm(&self) -> f64 {
        let absolute = lock(&self.state).absolute;
        self.calibration.position_to_wavelength(absolute)
    }

    /// Relative moves performed so far.
    pub fn move_log(&self) -> Vec<i32> {
        lock(&self.state).moves.clone()
    }

    /// Make the `n`-th move from now (1-based) fail without moving.
    pub fn fail_move(&self, n: u32) {
        let mut state = lock(&self.state);
        let count = state.move_count;
        state.fail_on_move = Some(count + n);
    }
}

#[async_trait]
impl EposDevice for SimulatedEpos {
    async fn read_object(&self, index: u16, subindex: u8) -> AppResult<u32> {
        lock(&self.state)
            .objects
            .get(&(index, subindex))
            .copied()
            .ok_or_else(|| DaqError::Instrument(format!("No EPOS object {:#06x}/{}", index, subindex)))
    }

    async fn write_object(&self, index: u16, subindex: u8, value: u32) -> AppResult<()> {
        lock(&self.state).objects.insert((index, subindex), value);
        Ok(())
    }

    async fn position_is(&self) -> AppResult<i32> {
        Ok(lock(&self.state).encoder)
    }

    async fn move_relative(&self, steps: i32) -> AppResult<()> {
        let mut state = lock(&self.state);
        if !state.enabled {
            return Err(DaqError::Instrument("EPOS move while disabled".to_string()));
        }
        state.move_count += 1;
        if state.fail_on_move == Some(state.move_count) {
            state.fail_on_move = None;
            return Err(DaqError::Instrument("EPOS motion fault".to_string()));
        }
        state.encoder += steps;
        state.absolute += i64::from(steps);
        state.pending_polls = MOVE_POLLS;
        state.moves.push(steps);
        Ok(())
    }

    async fn target_reached(&self) -> AppResult<bool> {
        let mut state = lock(&self.state);
        if state.pending_polls == 0 {
            return Ok(true);
        }
        state.pending_polls -= 1;
        Ok(false)
    }

    async fn set_enabled(&self, enabled: bool) -> AppResult<()> {
        lock(&self.state).enabled = enabled;
        Ok(())
    }

    async fn is_enabled(&self) -> AppResult<bool> {
        Ok(lock(&self.state).enabled)
    }

    async fn clear_fault(&self) -> AppResult<()> {
        Ok(())
    }

    async fn operation_mode(&self) -> AppResult<i8> {
        Ok(lock(&self.state).operation_mode)
    }

    async fn set_operation_mode(&self, mode: i8) -> AppResult<()> {
        lock(&self.state).operation_mode = mode;
        Ok(())
    }

    async fn position_profile(&self) -> AppResult<PositionProfile> {
        Ok(lock(&self.state).profile)
    }

    async fn set_position_profile(&self, profile: PositionProfile) -> AppResult<()> {
        lock(&self.state).profile = profile;
        Ok(())
    }
}

// =============================================================================
// RigPhysics - shared model
// =============================================================================

/// Physics shared by all simulated instruments.
pub struct RigPhysics {
    config: SimulationConfig,
    epos: SimulatedEpos,
    piezo_v: Mutex<f64>,
    noise_enabled: AtomicBool,
}

impl RigPhysics {
    /// Current laser frequency.
    pub fn laser_frequency(&self) -> Frequency {
        let grating = Frequency::from_nm(self.epos.grating_wavelength_nm());
        let piezo = *lock(&self.piezo_v);
        let jitter = if self.noise_enabled() {
            noise(self.config.frequency_noise.ghz())
        } else {
            0.0
        };
        grating
            + self.config.calibration_offset
            + Frequency::from_ghz(PIEZO_GHZ_PER_VOLT * piezo + jitter)
    }

    /// Lock-in X/Y for the current laser frequency.
    pub fn lockin_signal(&self) -> (f64, f64) {
        let detuning = (self.laser_frequency() - self.config.line_center).ghz();
        let half_width = self.config.line_width.ghz() / 2.0;
        let profile = half_width * half_width / (detuning * detuning + half_width * half_width);
        let amplitude = self.config.line_strength_v_per_w * self.config.laser_power_w * profile;
        let (nx, ny) = if self.noise_enabled() {
            (noise(self.config.signal_noise_v), noise(self.config.signal_noise_v))
        } else {
            (0.0, 0.0)
        };
        (amplitude + nx, 0.05 * amplitude + ny)
    }

    fn noise_enabled(&self) -> bool {
        self.noise_enabled.load(Ordering::SeqCst)
    }

    fn noisy(&self, value: f64, relative: f64) -> f64 {
        if self.noise_enabled() {
            value * (1.0 + noise(relative))
        } else {
            value
        }
    }
}

// =============================================================================
// Instruments
// =============================================================================

/// Simulated Sacher laser.
pub struct SimulatedLaser {
    physics: Arc<RigPhysics>,
    piezo_writes: AtomicU32,
}

impl SimulatedLaser {
    /// Number of accepted piezo writes.
    pub fn piezo_writes(&self) -> u32 {
        self.piezo_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Identifiable for SimulatedLaser {
    async fn identify(&self) -> AppResult<String> {
        Ok("Sacher Lasertechnik,Lion (simulated),SIM-0001,1.0".to_string())
    }
}

#[async_trait]
impl PiezoActuator for SimulatedLaser {
    async fn set_piezo_voltage(&self, volts: f64) -> AppResult<()> {
        if !(volts.is_finite() && volts.abs() <= PIEZO_LIMIT_V) {
            return Err(DaqError::OutOfRange {
                parameter: "piezo voltage",
                value: volts,
                min: -PIEZO_LIMIT_V,
                max: PIEZO_LIMIT_V,
            });
        }
        *lock(&self.physics.piezo_v) = volts;
        self.piezo_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn piezo_voltage(&self) -> AppResult<f64> {
        Ok(*lock(&self.physics.piezo_v))
    }

    fn piezo_range(&self) -> (f64, f64) {
        (-PIEZO_LIMIT_V, PIEZO_LIMIT_V)
    }
}

#[async_trait]
impl LaserDiagnostics for SimulatedLaser {
    async fn system_status(&self) -> AppResult<LaserStatus> {
        Ok(LaserStatus {
            code: 0,
            faults: Vec::new(),
        })
    }

    async fn current_ma(&self) -> AppResult<f64> {
        Ok(140.0)
    }

    async fn working_hours(&self) -> AppResult<String> {
        Ok("0123:45:00".to_string())
    }
}

/// Simulated wavelength meter.
pub struct SimulatedWavemeter {
    physics: Arc<RigPhysics>,
    timeouts_pending: AtomicU32,
    reads: AtomicU32,
}

impl SimulatedWavemeter {
    /// Make the next `n` reads fail with [`DaqError::Timeout`].
    pub fn inject_timeouts(&self, n: u32) {
        self.timeouts_pending.store(n, Ordering::SeqCst);
    }

    /// Reads attempted so far, including failed ones.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Identifiable for SimulatedWavemeter {
    async fn identify(&self) -> AppResult<String> {
        Ok("HighFinesse,WS Ultimate 2 (simulated),1543,1.0".to_string())
    }
}

#[async_trait]
impl FrequencyMeter for SimulatedWavemeter {
    async fn read_frequency(&self) -> AppResult<Frequency> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let pending = self.timeouts_pending.load(Ordering::SeqCst);
        if pending > 0 {
            self.timeouts_pending.store(pending - 1, Ordering::SeqCst);
            return Err(timeout_error(
                "simulated wavemeter read",
                Duration::from_millis(100),
            ));
        }
        Ok(self.physics.laser_frequency())
    }
}

/// Simulated SR830.
pub struct SimulatedLockIn {
    physics: Arc<RigPhysics>,
}

#[async_trait]
impl Identifiable for SimulatedLockIn {
    async fn identify(&self) -> AppResult<String> {
        Ok("Stanford_Research_Systems,SR830 (simulated),s/n00001,ver1.07".to_string())
    }
}

#[async_trait]
impl LockInAmplifier for SimulatedLockIn {
    async fn read_xy(&self) -> AppResult<(f64, f64)> {
        Ok(self.physics.lockin_signal())
    }
}

/// Simulated Newport 1830-C.
pub struct SimulatedPowerMeter {
    physics: Arc<RigPhysics>,
}

#[async_trait]
impl Readable for SimulatedPowerMeter {
    async fn read(&self) -> AppResult<f64> {
        Ok(self.physics.noisy(self.physics.config.laser_power_w, 1e-3))
    }
}

/// Simulated Lake Shore 211 (°C).
pub struct SimulatedThermometer {
    physics: Arc<RigPhysics>,
}

#[async_trait]
impl Identifiable for SimulatedThermometer {
    async fn identify(&self) -> AppResult<String> {
        Ok("LSCI,MODEL211 (simulated),0,1.0".to_string())
    }
}

#[async_trait]
impl Readable for SimulatedThermometer {
    async fn read(&self) -> AppResult<f64> {
        Ok(self.physics.noisy(self.physics.config.temperature_c, 1e-4))
    }
}

/// Simulated cell pressure gauge (mbar).
pub struct SimulatedPressureGauge {
    physics: Arc<RigPhysics>,
}

#[async_trait]
impl Readable for SimulatedPressureGauge {
    async fn read(&self) -> AppResult<f64> {
        Ok(self.physics.noisy(self.physics.config.pressure_mbar, 1e-4))
    }
}

struct GeneratorState {
    frequency_hz: f64,
    amplitude_vpp: f64,
    waveform: Waveform,
}

/// Simulated DS335.
pub struct SimulatedFunctionGenerator {
    state: Mutex<GeneratorState>,
}

impl Default for SimulatedFunctionGenerator {
    fn default() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                frequency_hz: 1000.0,
                amplitude_vpp: 1.0,
                waveform: Waveform::Sine,
            }),
        }
    }
}

#[async_trait]
impl Identifiable for SimulatedFunctionGenerator {
    async fn identify(&self) -> AppResult<String> {
        Ok("StanfordResearchSystems,DS335 (simulated),00001,1.0".to_string())
    }
}

#[async_trait]
impl FunctionGenerator for SimulatedFunctionGenerator {
    async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        if !(hz.is_finite() && hz > 0.0) {
            return Err(DaqError::OutOfRange {
                parameter: "function generator frequency",
                value: hz,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        lock(&self.state).frequency_hz = hz;
        Ok(())
    }

    async fn frequency(&self) -> AppResult<f64> {
        Ok(lock(&self.state).frequency_hz)
    }

    async fn set_amplitude(&self, amplitude: Amplitude) -> AppResult<()> {
        let vpp = match amplitude {
            Amplitude::PeakToPeak(v) => v,
            Amplitude::Rms(v) => v * 2.0 * std::f64::consts::SQRT_2,
        };
        lock(&self.state).amplitude_vpp = vpp;
        Ok(())
    }

    async fn amplitude_vpp(&self) -> AppResult<f64> {
        Ok(lock(&self.state).amplitude_vpp)
    }

    async fn set_waveform(&self, waveform: Waveform) -> AppResult<()> {
        lock(&self.state).waveform = waveform;
        Ok(())
    }

    async fn waveform(&self) -> AppResult<Waveform> {
        Ok(lock(&self.state).waveform)
    }
}

// =============================================================================
// SimulatedRig - everything wired together
// =============================================================================

/// A complete simulated spectrometer.
pub struct SimulatedRig {
    /// Shared model
    pub physics: Arc<RigPhysics>,
    /// Laser (piezo + diagnostics)
    pub laser: Arc<SimulatedLaser>,
    /// Wavelength meter
    pub wavemeter: Arc<SimulatedWavemeter>,
    /// Lock-in amplifier
    pub lockin: Arc<SimulatedLockIn>,
    /// Power meter
    pub power_meter: Arc<SimulatedPowerMeter>,
    /// Temperature monitor
    pub thermometer: Arc<SimulatedThermometer>,
    /// Pressure gauge
    pub pressure_gauge: Arc<SimulatedPressureGauge>,
    /// Acoustic function generator
    pub function_generator: Arc<SimulatedFunctionGenerator>,
    /// Grating motor
    pub tuner: Arc<EposTuner<SimulatedEpos>>,
}

impl SimulatedRig {
    /// Build a rig with the grating at `sim.initial_wavelength_nm`.
    pub async fn new(sim: &SimulationConfig, motor: &MotorConfig) -> AppResult<Self> {
        let epos = SimulatedEpos::new(SIMULATED_CALIBRATION, sim.initial_wavelength_nm);
        let physics = Arc::new(RigPhysics {
            config: sim.clone(),
            epos: epos.clone(),
            piezo_v: Mutex::new(0.0),
            noise_enabled: AtomicBool::new(true),
        });
        let tuner = Arc::new(EposTuner::connect(epos, motor.clone()).await?);

        tracing::info!(
            wavelength_nm = sim.initial_wavelength_nm,
            line = %sim.line_center,
            "Simulated rig ready"
        );

        Ok(Self {
            laser: Arc::new(SimulatedLaser {
                physics: physics.clone(),
                piezo_writes: AtomicU32::new(0),
            }),
            wavemeter: Arc::new(SimulatedWavemeter {
                physics: physics.clone(),
                timeouts_pending: AtomicU32::new(0),
                reads: AtomicU32::new(0),
            }),
            lockin: Arc::new(SimulatedLockIn {
                physics: physics.clone(),
            }),
            power_meter: Arc::new(SimulatedPowerMeter {
                physics: physics.clone(),
            }),
            thermometer: Arc::new(SimulatedThermometer {
                physics: physics.clone(),
            }),
            pressure_gauge: Arc::new(SimulatedPressureGauge {
                physics: physics.clone(),
            }),
            function_generator: Arc::new(SimulatedFunctionGenerator::default()),
            tuner,
            physics,
        })
    }

    /// Disable all simulated noise.
    pub fn without_noise(self) -> Self {
        self.physics.noise_enabled.store(false, Ordering::SeqCst);
        self
    }
}
