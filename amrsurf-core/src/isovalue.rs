//! Isovalue schedules

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// The field value at which the isosurface is extracted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Isovalue {
    /// Same value for every snapshot
    Fixed(f64),
    /// Linear ramp from `v0` at `t0` to `v1` at `t1`, clamped outside
    Ramp { t0: f64, v0: f64, t1: f64, v1: f64 },
}

impl Isovalue {
    /// Build a ramp from `[start_time, start_value, end_time, end_value]`
    pub fn from_breakpoints(values: &[f64]) -> Result<Self> {
        let [t0, v0, t1, v1] = values else {
            return Err(Error::Config(format!(
                "Isovalue function needs 4 values (start time, start value, end time, end value), got {}",
                values.len()
            )));
        };
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Config(format!(
                "Isovalue function breakpoints must be finite: {:?}",
                values
            )));
        }
        if t1 <= t0 {
            return Err(Error::Config(format!(
                "Isovalue function end time {} must be after start time {}",
                t1, t0
            )));
        }
        Ok(Isovalue::Ramp {
            t0: *t0,
            v0: *v0,
            t1: *t1,
            v1: *v1,
        })
    }

    /// Isovalue at simulation time `time`
    pub fn value_at(&self, time: f64) -> f64 {
        match *self {
            Isovalue::Fixed(v) => v,
            Isovalue::Ramp { t0, v0, t1, v1 } => {
                if time <= t0 {
                    v0
                } else if time >= t1 {
                    v1
                } else {
                    v0 + (v1 - v0) * (time - t0) / (t1 - t0)
                }
            }
        }
    }
}
