//! Soft repulsion keeping particles off a wall surface
//!
//! Within `h` of the surface a particle is pushed back into the domain with
//! a force growing linearly with depth, capped at `max_force`:
//! `F = -n * min(max_force, c * (sd + h))`.

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::particles::ParticleSet;
use super::wall::Wall;
use crate::error::{Result, config_err};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WallRepulsion {
    /// Force per unit depth
    pub c: f64,
    /// Range of the repulsion on the domain side
    pub h: f64,
    pub max_force: f64,
}

impl WallRepulsion {
    pub fn new(c: f64, h: f64, max_force: f64) -> Result<Self> {
        if !(c.is_finite() && c >= 0.0 && h.is_finite() && h >= 0.0 && max_force >= 0.0) {
            return config_err(format!(
                "wall repulsion: c, h and max_force must not be negative (got {c}, {h}, {max_force})"
            ));
        }
        Ok(Self { c, h, max_force })
    }

    /// Force on a particle at signed distance `sd`; `normal` points into the wall
    #[inline]
    pub fn force(&self, sd: f64, normal: DVec3) -> DVec3 {
        if sd < -self.h {
            return DVec3::ZERO;
        }
        -normal * self.max_force.min(self.c * (sd + self.h))
    }

    /// Add the repulsion from `wall` to the forces of the mobile particles of `set`
    pub fn apply(&self, forces: &mut [DVec3], set: &ParticleSet, wall: &Wall, t: f64) -> Result<()> {
        if forces.len() != set.len() {
            return config_err(format!(
                "wall repulsion '{}': {} forces for {} particles",
                wall.name(),
                forces.len(),
                set.len()
            ));
        }
        forces
            .par_iter_mut()
            .zip(set.particles.par_iter())
            .filter(|(_, p)| p.is_mobile())
            .for_each(|(f, p)| {
                let sd = wall.signed_distance(p.position, t);
                if sd >= -self.h {
                    *f += self.force(sd, wall.normal(p.position, t));
                }
            });
        Ok(())
    }
}
