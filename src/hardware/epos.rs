//! Maxon EPOS grating motor.
//!
//! The laser's grating is driven by a Maxon EPOS positioning controller. The
//! controller itself is only reachable through the vendor SDK, so it is abstracted as
//! the object-dictionary level [`EposDevice`] trait; [`EposTuner`] implements the
//! wavelength logic on top of it.
//!
//! Two pieces of state live in the controller's object dictionary:
//!
//! - `0x2081/0`: the *stored position* (i32), the absolute grating position the
//!   calibration refers to. The motor encoder is relative and resets on power-up,
//!   so every move rewrites the stored position from the encoder delta.
//! - `0x200C/1..3`: the calibration constants `a`, `b`, `c` written by Sacher,
//!   encoded with [`decode_sacher_float`].

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::MotorConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::timeout_error;
use crate::hardware::capabilities::WavelengthTuner;

/// Object holding the stored absolute position.
pub const STORED_POSITION_OBJECT: (u16, u8) = (0x2081, 0);

/// Object index of the calibration constants (subindices 1..=3).
pub const CALIBRATION_OBJECT: u16 = 0x200C;

/// Profile position mode.
pub const PROFILE_POSITION_MODE: i8 = 1;

/// Motion profile limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionProfile {
    /// Profile velocity (rpm)
    pub velocity: u32,
    /// Profile acceleration (rpm/s)
    pub acceleration: u32,
    /// Profile deceleration (rpm/s)
    pub deceleration: u32,
}

impl PositionProfile {
    /// Profile applied when the controller's is outside the safe limits.
    pub const SAFE_DEFAULT: PositionProfile = PositionProfile {
        velocity: 3000,
        acceleration: 20_000,
        deceleration: 20_000,
    };

    /// Whether the profile stays within what the grating mount tolerates.
    pub fn is_safe(&self) -> bool {
        self.velocity <= 11_400 && self.acceleration <= 20_000 && self.deceleration <= 20_000
    }
}

/// Object-dictionary access to an EPOS controller.
#[async_trait]
pub trait EposDevice: Send + Sync {
    /// Read a 32-bit object.
    async fn read_object(&self, index: u16, subindex: u8) -> AppResult<u32>;

    /// Write a 32-bit object.
    async fn write_object(&self, index: u16, subindex: u8, value: u32) -> AppResult<()>;

    /// Encoder position ("position is").
    async fn position_is(&self) -> AppResult<i32>;

    /// Start a relative move.
    async fn move_relative(&self, steps: i32) -> AppResult<()>;

    /// Whether the last move has finished.
    async fn target_reached(&self) -> AppResult<bool>;

    /// Enable or disable the power stage.
    async fn set_enabled(&self, enabled: bool) -> AppResult<()>;

    /// Whether the power stage is enabled.
    async fn is_enabled(&self) -> AppResult<bool>;

    /// Clear a latched fault.
    async fn clear_fault(&self) -> AppResult<()>;

    /// Current operation mode.
    async fn operation_mode(&self) -> AppResult<i8>;

    /// Select an operation mode.
    async fn set_operation_mode(&self, mode: i8) -> AppResult<()>;

    /// Current motion profile.
    async fn position_profile(&self) -> AppResult<PositionProfile>;

    /// Replace the motion profile.
    async fn set_position_profile(&self, profile: PositionProfile) -> AppResult<()>;
}

/// Decode Sacher's 32-bit float encoding.
///
/// Bit 31 is the mantissa sign, bits 30..8 the mantissa in millionths, bit 7 the
/// exponent sign and bits 6..0 the base-2 exponent.
///
/// ```
/// use pas_daq::hardware::epos::decode_sacher_float;
///
/// // mantissa 1.5 (1_500_000), exponent +3
/// assert_eq!(decode_sacher_float((1_500_000 << 8) | 3), 12.0);
/// ```
pub fn decode_sacher_float(bits: u32) -> f64 {
    let mantissa_sign = if bits & 0x8000_0000 != 0 { -1.0 } else { 1.0 };
    let mantissa = f64::from((bits >> 8) & 0x007F_FFFF) / 1e6;
    let exponent_sign = if bits & 0x80 != 0 { -1 } else { 1 };
    let exponent = (bits & 0x7F) as i32;
    mantissa_sign * mantissa * 2f64.powi(exponent_sign * exponent)
}

/// Encode a value in Sacher's float format, keeping as many mantissa digits as fit.
pub fn encode_sacher_float(value: f64) -> u32 {
    const MANTISSA_MAX: f64 = 8_388_607.0 / 1e6;
    if value == 0.0 || !value.is_finite() {
        return 0;
    }

    let magnitude = value.abs();
    let mut exponent: i32 = 0;
    while magnitude / 2f64.powi(exponent) > MANTISSA_MAX && exponent < 127 {
        exponent += 1;
    }
    while magnitude / 2f64.powi(exponent) < MANTISSA_MAX / 2.0 && exponent > -127 {
        exponent -= 1;
    }

    let mantissa = (magnitude / 2f64.powi(exponent) * 1e6).round().min(8_388_607.0) as u32;
    let mut bits = mantissa << 8;
    if value < 0.0 {
        bits |= 0x8000_0000;
    }
    if exponent < 0 {
        bits |= 0x80;
    }
    bits | exponent.unsigned_abs()
}

/// Quadratic grating calibration `λ = a·p² + b·p + c` (nm, position in steps).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GratingCalibration {
    /// Quadratic term
    pub a: f64,
    /// Linear term
    pub b: f64,
    /// Offset
    pub c: f64,
    /// Lowest wavelength allowed
    pub min_nm: f64,
    /// Highest wavelength allowed
    pub max_nm: f64,
}

impl GratingCalibration {
    /// Read the constants from the controller; the range comes from `motor`.
    pub async fn from_device<D: EposDevice + ?Sized>(device: &D, motor: &MotorConfig) -> AppResult<Self> {
        let a = decode_sacher_float(device.read_object(CALIBRATION_OBJECT, 1).await?);
        let b = decode_sacher_float(device.read_object(CALIBRATION_OBJECT, 2).await?);
        let c = decode_sacher_float(device.read_object(CALIBRATION_OBJECT, 3).await?);
        Ok(Self {
            a,
            b,
            c,
            min_nm: motor.min_wavelength_nm,
            max_nm: motor.max_wavelength_nm,
        })
    }

    /// Wavelength at an absolute position.
    pub fn position_to_wavelength(&self, position: i64) -> f64 {
        let p = position as f64;
        self.a * p * p + self.b * p + self.c
    }

    /// Absolute position for a wavelength, truncated towards zero.
    pub fn wavelength_to_position(&self, wavelength_nm: f64) -> AppResult<i64> {
        let not_reachable = || {
            DaqError::Instrument(format!(
                "Wavelength {} nm is not reachable with grating calibration a={:e} b={:e} c={}",
                wavelength_nm, self.a, self.b, self.c
            ))
        };

        if self.a == 0.0 {
            if self.b == 0.0 {
                return Err(not_reachable());
            }
            return Ok(((wavelength_nm - self.c) / self.b).trunc() as i64);
        }

        let ascending = self.position_to_wavelength(5000) > self.position_to_wavelength(0);
        let vertex = -self.b / (2.0 * self.a);
        let discriminant = self.b * self.b / (4.0 * self.a * self.a) - (self.c - wavelength_nm) / self.a;
        if discriminant < 0.0 {
            return Err(not_reachable());
        }
        let offset = discriminant.sqrt();
        let position = if (self.a > 0.0) == ascending {
            vertex + offset
        } else {
            vertex - offset
        };
        Ok(position.trunc() as i64)
    }
}

/// [`WavelengthTuner`] driving the grating through an [`EposDevice`].
pub struct EposTuner<D> {
    device: D,
    calibration: GratingCalibration,
    motor: MotorConfig,
    motion: Mutex<()>,
}

impl<D: EposDevice> EposTuner<D> {
    /// Bring the controller into a known state and read its calibration.
    ///
    /// Clears faults, disables the power stage, selects profile position mode and
    /// replaces an unsafe motion profile.
    pub async fn connect(device: D, motor: MotorConfig) -> AppResult<Self> {
        device.clear_fault().await?;
        if device.is_enabled().await? {
            device.set_enabled(false).await?;
        }
        if device.operation_mode().await? != PROFILE_POSITION_MODE {
            device.set_operation_mode(PROFILE_POSITION_MODE).await?;
        }
        let profile = device.position_profile().await?;
        if !profile.is_safe() {
            tracing::warn!(?profile, "Replacing unsafe grating motion profile");
            device.set_position_profile(PositionProfile::SAFE_DEFAULT).await?;
        }

        let calibration = GratingCalibration::from_device(&device, &motor).await?;
        let tuner = Self {
            device,
            calibration,
            motor,
            motion: Mutex::new(()),
        };
        let stored = tuner.stored_position().await?;
        let encoder = tuner.device.position_is().await?;
        tracing::info!(stored, encoder, ?calibration, "Grating motor ready");
        Ok(tuner)
    }

    /// Calibration in use.
    pub fn calibration(&self) -> &GratingCalibration {
        &self.calibration
    }

    /// Underlying controller.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Absolute position stored in the controller.
    pub async fn stored_position(&self) -> AppResult<i32> {
        let (index, subindex) = STORED_POSITION_OBJECT;
        Ok(self.device.read_object(index, subindex).await? as i32)
    }

    async fn write_stored_position(&self, position: i32) -> AppResult<()> {
        let (index, subindex) = STORED_POSITION_OBJECT;
        self.device.write_object(index, subindex, position as u32).await
    }

    /// One relative move: enable, move, wait for the target, disable.
    async fn step(&self, steps: i32) -> AppResult<()> {
        self.device.set_enabled(true).await?;
        let motion = self.move_and_wait(steps).await;
        let disabled = self.device.set_enabled(false).await;
        if let (Err(_), Err(e)) = (&motion, &disabled) {
            tracing::error!(error = %e, "Failed to disable grating motor after failed move");
        }
        motion?;
        disabled
    }

    async fn move_and_wait(&self, steps: i32) -> AppResult<()> {
        tracing::debug!(steps, "Moving grating");
        self.device.move_relative(steps).await?;
        let deadline = tokio::time::Instant::now() + self.motor.move_timeout;
        loop {
            if self.device.target_reached().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(timeout_error(
                    format!("grating move of {} steps", steps),
                    self.motor.move_timeout,
                ));
            }
            tokio::time::sleep(self.motor.poll_interval).await;
        }
    }

    async fn run_moves(&self, diff: i32) -> AppResult<()> {
        if diff < 0 {
            let hysteresis = i32::try_from(self.motor.hysteresis_steps).map_err(|_| {
                DaqError::Configuration("motor.hysteresis_steps does not fit in i32".to_string())
            })?;
            // Overshoot, then approach from below.
            self.step(diff - hysteresis).await?;
            self.step(hysteresis).await
        } else if diff > 0 {
            self.step(diff).await
        } else {
            Ok(())
        }
    }

    async fn record_shift(&self, stored: i32, encoder_before: i32) -> AppResult<i32> {
        let encoder_now = self.device.position_is().await?;
        let final_position = stored + (encoder_now - encoder_before);
        self.write_stored_position(final_position).await?;
        Ok(final_position)
    }
}

#[async_trait]
impl<D: EposDevice> WavelengthTuner for EposTuner<D> {
    async fn go_to(&self, wavelength_nm: f64) -> AppResult<()> {
        let (min, max) = self.range_nm();
        if !(min..=max).contains(&wavelength_nm) {
            return Err(DaqError::OutOfRange {
                parameter: "grating wavelength (nm)",
                value: wavelength_nm,
                min,
                max,
            });
        }

        let _motion = self.motion.lock().await;
        let encoder_before = self.device.position_is().await?;
        let stored = self.stored_position().await?;
        let target = self.calibration.wavelength_to_position(wavelength_nm)?;
        let diff = i32::try_from(target - i64::from(stored)).map_err(|_| {
            DaqError::Instrument(format!("Grating target {} is out of reach from {}", target, stored))
        })?;
        tracing::info!(wavelength_nm, stored, target, diff, "Tuning grating");

        let motion = self.run_moves(diff).await;
        let recorded = self.record_shift(stored, encoder_before).await;
        match &recorded {
            Ok(position) => tracing::debug!(position, "Stored grating position updated"),
            Err(e) => tracing::error!(
                error = %e,
                "Failed to update stored grating position; controller may be in an undefined state"
            ),
        }
        motion?;
        recorded.map(|_| ())
    }

    async fn wavelength_nm(&self) -> AppResult<f64> {
        let stored = self.stored_position().await?;
        Ok(self.calibration.position_to_wavelength(i64::from(stored)))
    }

    fn range_nm(&self) -> (f64, f64) {
        (self.calibration.min_nm, self.calibration.max_nm)
    }
}
