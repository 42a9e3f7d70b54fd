//! mesowall - wall boundaries and time integration for mesoscale particle simulation
//!
//! Core modules:
//! - `sim`: Geometry, sampled fields, walls, boundary enforcement, frozen wall
//!   particles and the integrator family
//! - `config`: JSON-driven simulation setup
//! - `error`: Crate error type

pub mod config;
pub mod error;
pub mod sim;

pub use config::SimulationConfig;
pub use error::{Result, SimError};

use glam::{DQuat, DVec3};

/// Simulation constants and defaults
pub mod consts {
    /// Spacing used when resampling a file-provided SDF onto a finer grid
    pub const DEFAULT_SDF_SPACING: f64 = 0.25;
    /// Equilibration steps for frozen wall particle generation
    pub const DEFAULT_EQUILIBRATION_STEPS: usize = 1000;

    /// Distance a bounced particle is placed inside the domain, away from the surface
    pub const BOUNCE_OFFSET: f64 = 1e-5;
    /// Regula-falsi iterations used to locate the wall crossing point
    pub const CROSSING_ITERATIONS: usize = 4;
    /// Projection iterations for particles found inside a wall
    pub const RESCUE_ITERATIONS: usize = 4;

    /// Relative tolerance for orthogonality / parallelism checks on wall motion
    pub const DIRECTION_TOLERANCE: f64 = 1e-6;
    /// Step used by central-difference gradients of analytic shapes
    pub const GRADIENT_EPS: f64 = 1e-6;
}

/// Rotate `point` about `center` by the rotation vector `omega * t`
#[inline]
pub fn rotate_about(point: DVec3, center: DVec3, omega: DVec3, t: f64) -> DVec3 {
    center + DQuat::from_scaled_axis(omega * t) * (point - center)
}

/// True when every component is finite
#[inline]
pub fn is_finite_vec(v: DVec3) -> bool {
    v.x.is_finite() && v.y.is_finite() && v.z.is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_rotate_about_quarter_turn() {
        let p = rotate_about(DVec3::new(2.0, 1.0, 0.0), DVec3::new(1.0, 1.0, 0.0), DVec3::Z, FRAC_PI_2);
        assert_relative_eq!(p.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.y, 2.0, epsilon = 1e-12);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_is_finite_vec() {
        assert!(is_finite_vec(DVec3::ONE));
        assert!(!is_finite_vec(DVec3::new(0.0, f64::NAN, 0.0)));
        assert!(!is_finite_vec(DVec3::new(f64::INFINITY, 0.0, 0.0)));
    }
}
