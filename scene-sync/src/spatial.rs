//! Spatial primitives and the scene's coordinate bound.
//!
//! Every coordinate that enters the store passes through
//! [`Bounds::check`]. The bound is closed: `±B` itself is accepted,
//! anything beyond (or non-finite) is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SyncError};

/// Half-extent of the scene on every axis in the deployed configuration.
pub const COORDINATE_BOUND: f64 = 12.0;

/// Axis name, carried in coordinate errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Point in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn components(&self) -> [(Axis, f64); 3] {
        [(Axis::X, self.x), (Axis::Y, self.y), (Axis::Z, self.z)]
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Closed per-axis bound `[-limit, +limit]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    limit: f64,
}

impl Bounds {
    pub fn new(limit: f64) -> Self {
        Self { limit: limit.abs() }
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Whether a single component lies inside the bound. NaN never does.
    pub fn contains(&self, value: f64) -> bool {
        value >= -self.limit && value <= self.limit
    }

    /// Validate every component of `point`, reporting the first offending axis.
    pub fn check(&self, point: &Vec3) -> Result<()> {
        for (axis, value) in point.components() {
            if !self.contains(value) {
                return Err(SyncError::CoordinateOutOfBounds {
                    axis,
                    value,
                    bound: self.limit,
                });
            }
        }
        Ok(())
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::new(COORDINATE_BOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_is_closed() {
        let bounds = Bounds::default();
        assert!(bounds.check(&Vec3::new(12.0, -12.0, 0.0)).is_ok());
        assert!(bounds.check(&Vec3::new(12.0001, 0.0, 0.0)).is_err());
    }

    #[test]
    fn test_reports_offending_axis() {
        let bounds = Bounds::default();
        match bounds.check(&Vec3::new(0.0, 20.0, 0.0)) {
            Err(SyncError::CoordinateOutOfBounds { axis, value, bound }) => {
                assert_eq!(axis, Axis::Y);
                assert_eq!(value, 20.0);
                assert_eq!(bound, 12.0);
            }
            other => panic!("expected coordinate error, got {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        let bounds = Bounds::default();
        assert!(bounds.check(&Vec3::new(f64::NAN, 0.0, 0.0)).is_err());
        assert!(bounds.check(&Vec3::new(0.0, 0.0, f64::INFINITY)).is_err());
        assert!(bounds.check(&Vec3::new(0.0, f64::NEG_INFINITY, 0.0)).is_err());
    }

    #[test]
    fn test_negative_limit_normalized() {
        let bounds = Bounds::new(-5.0);
        assert_eq!(bounds.limit(), 5.0);
        assert!(bounds.contains(-5.0));
    }
}
