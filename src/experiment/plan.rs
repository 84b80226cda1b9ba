//! Scan plans: the ordered setpoints of one acquisition run.
//!
//! Plans are built from a start/stop/step triple, an evenly spaced count, an explicit
//! list, or a text file with one setpoint per line:
//!
//! ```text
//! # O2 A-band, R-branch
//! 13150.0
//! 13150.5 cm-1
//! 760.40 nm
//! ```
//!
//! Lines without a unit use the default unit passed to [`ScanPlan::from_file`].

use serde::Serialize;
use std::path::Path;

use crate::config::ScanConfig;
use crate::error::{AppResult, DaqError};
use crate::frequency::{Frequency, FrequencyUnit};

/// Largest plan accepted, to catch a mistyped step before allocating.
pub const MAX_POINTS: usize = 1_000_000;

/// Ordered list of setpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    points: Vec<Frequency>,
}

impl ScanPlan {
    /// `start, start + step, ...` up to and including `stop`.
    ///
    /// `stop` is included when it lies on the grid within a relative tolerance of
    /// 1e-9 steps. Scans may run in either direction, but `step` must point from
    /// `start` towards `stop`.
    pub fn stepped(start: f64, stop: f64, step: f64, unit: FrequencyUnit) -> AppResult<Self> {
        if !(step.is_finite() && step != 0.0) {
            return Err(DaqError::Configuration(format!(
                "Scan step must be finite and non-zero, got {}",
                step
            )));
        }
        if !(start.is_finite() && stop.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "Scan bounds must be finite, got {} to {}",
                start, stop
            )));
        }

        let steps = (stop - start) / step;
        if steps < -1e-9 {
            return Err(DaqError::Configuration(format!(
                "Scan step {} moves away from stop ({} to {})",
                step, start, stop
            )));
        }
        let steps = (steps + 1e-9 * steps.abs().max(1.0)).floor();
        if steps >= MAX_POINTS as f64 {
            return Err(DaqError::Configuration(format!(
                "Scan of {} points exceeds the limit of {}",
                steps, MAX_POINTS
            )));
        }

        let points = (0..=steps as usize)
            .map(|i| Frequency::new(start + i as f64 * step, unit))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { points })
    }

    /// `n` evenly spaced setpoints from `start` to `stop` inclusive.
    pub fn linspace(start: f64, stop: f64, n: usize, unit: FrequencyUnit) -> AppResult<Self> {
        if n == 0 || n > MAX_POINTS {
            return Err(DaqError::Configuration(format!(
                "linspace needs between 1 and {} points, got {}",
                MAX_POINTS, n
            )));
        }
        if n == 1 {
            return Ok(Self {
                points: vec![Frequency::new(start, unit)?],
            });
        }
        let step = (stop - start) / (n - 1) as f64;
        let points = (0..n)
            .map(|i| {
                let value = if i == n - 1 { stop } else { start + i as f64 * step };
                Frequency::new(value, unit)
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { points })
    }

    /// Plan from explicit setpoints.
    pub fn from_points(points: Vec<Frequency>) -> Self {
        Self { points }
    }

    /// Read a plan file, one setpoint per line.
    pub fn from_file(path: impl AsRef<Path>, default_unit: FrequencyUnit) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Configuration(format!("Cannot read plan file {}: {}", path.display(), e))
        })?;
        Self::parse(&text, default_unit)
    }

    /// Parse plan text, one setpoint per line. `#` starts a comment.
    pub fn parse(text: &str, default_unit: FrequencyUnit) -> AppResult<Self> {
        let mut points = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let point = match line.parse::<f64>() {
                Ok(value) => Frequency::new(value, default_unit),
                Err(_) => line.parse::<Frequency>(),
            }
            .map_err(|e| DaqError::Configuration(format!("Plan line {}: {}", index + 1, e)))?;
            points.push(point);
        }
        Ok(Self { points })
    }

    /// Plan from `[scan] start/stop/step/unit`, if all three are set.
    pub fn from_config(scan: &ScanConfig) -> AppResult<Option<Self>> {
        match (scan.start, scan.stop, scan.step) {
            (Some(start), Some(stop), Some(step)) => {
                Self::stepped(start, stop, step, scan.unit).map(Some)
            }
            (None, None, None) => Ok(None),
            _ => Err(DaqError::Configuration(
                "scan.start, scan.stop and scan.step must be given together".to_string(),
            )),
        }
    }

    /// Setpoints in scan order.
    pub fn points(&self) -> &[Frequency] {
        &self.points
    }

    /// Number of setpoints.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// No setpoints.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
