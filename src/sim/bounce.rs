//! Boundary enforcement: no particle ends a step inside a wall
//!
//! After every integration step each mobile particle's old and new positions
//! are tested against every wall. A particle that crossed the surface is put
//! back just inside the domain at the crossing point and its velocity is
//! reflected (bounce-back gives no-slip, specular gives free-slip). Particles
//! that somehow started the step inside a wall are projected out and flagged.

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::particles::ParticleSet;
use super::wall::Surface;
use crate::consts::{BOUNCE_OFFSET, CROSSING_ITERATIONS, RESCUE_ITERATIONS};
use crate::error::{Result, config_err};

/// Velocity response at a wall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceMode {
    /// `v' = 2 u_wall - v`: no-slip in the mean
    #[default]
    BounceBack,
    /// Mirror the normal component of the velocity relative to the wall
    Specular,
}

/// Result of enforcing the walls on one particle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BounceOutcome {
    pub position: DVec3,
    pub velocity: DVec3,
    /// Crossed at least one wall surface this step
    pub crossed: bool,
    /// Started the step inside a wall and had to be projected out
    pub rescued: bool,
}

impl BounceOutcome {
    pub fn untouched(position: DVec3, velocity: DVec3) -> Self {
        Self {
            position,
            velocity,
            crossed: false,
            rescued: false,
        }
    }
}

/// Per-step counters from `BoundaryEnforcer::apply`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BounceStats {
    pub bounced: usize,
    /// Indices of rescued particles
    pub rescued: Vec<usize>,
}

/// Reflect velocity off a surface: v' = v - 2(v·n)n
#[inline]
pub fn reflect_velocity(velocity: DVec3, normal: DVec3) -> DVec3 {
    velocity - 2.0 * velocity.dot(normal) * normal
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEnforcer {
    #[serde(default)]
    pub mode: BounceMode,
    /// Distance a bounced particle is placed away from the surface
    #[serde(default = "default_offset")]
    pub offset: f64,
}

fn default_offset() -> f64 {
    BOUNCE_OFFSET
}

impl Default for BoundaryEnforcer {
    fn default() -> Self {
        Self {
            mode: BounceMode::default(),
            offset: BOUNCE_OFFSET,
        }
    }
}

impl BoundaryEnforcer {
    pub fn new(mode: BounceMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Enforce every wall, in order, on a single particle moving `prev -> new`
    pub fn enforce<S: Surface>(&self, prev: DVec3, new: DVec3, velocity: DVec3, walls: &[S], t: f64) -> BounceOutcome {
        let mut out = BounceOutcome::untouched(new, velocity);
        for wall in walls {
            let d_new = wall.signed_distance(out.position, t);
            if d_new <= 0.0 {
                continue;
            }
            let d_prev = wall.signed_distance(prev, t);
            if d_prev <= 0.0 {
                let x = find_crossing(wall, prev, d_prev, out.position, d_new, t);
                let n = wall.normal(x, t);
                let mut position = x - n * (wall.signed_distance(x, t).max(0.0) + self.offset);
                if wall.signed_distance(position, t) > 0.0 {
                    position = prev;
                }
                out.position = position;
                out.velocity = self.respond(out.velocity, wall.surface_velocity(x, t), n);
                out.crossed = true;
            } else {
                let (position, n) = self.project_out(wall, out.position, t);
                let u = wall.surface_velocity(position, t);
                if (out.velocity - u).dot(n) > 0.0 {
                    out.velocity = self.respond(out.velocity, u, n);
                }
                out.position = position;
                out.rescued = true;
            }
        }
        out
    }

    /// Enforce `walls` on every mobile particle of `set`.
    ///
    /// `prev` holds the positions before the integration step.
    pub fn apply<S: Surface>(&self, set: &mut ParticleSet, prev: &[DVec3], walls: &[S], t: f64) -> Result<BounceStats> {
        if prev.len() != set.len() {
            return config_err(format!(
                "'{}': {} previous positions for {} particles",
                set.name,
                prev.len(),
                set.len()
            ));
        }
        if walls.is_empty() {
            return Ok(BounceStats::default());
        }

        let flags: Vec<(bool, bool)> = set
            .particles
            .par_iter_mut()
            .zip(prev.par_iter())
            .map(|(p, &x0)| {
                if !p.is_mobile() {
                    return (false, false);
                }
                let out = self.enforce(x0, p.position, p.velocity, walls, t);
                p.position = out.position;
                p.velocity = out.velocity;
                if out.rescued {
                    p.flags.rescued = true;
                }
                (out.crossed, out.rescued)
            })
            .collect();

        let mut stats = BounceStats::default();
        for (i, &(crossed, rescued)) in flags.iter().enumerate() {
            if crossed {
                stats.bounced += 1;
            }
            if rescued {
                stats.rescued.push(i);
            }
        }
        if !stats.rescued.is_empty() {
            log::warn!(
                "{} particle(s) of '{}' started the step inside a wall",
                stats.rescued.len(),
                set.name
            );
        }
        Ok(stats)
    }

    fn respond(&self, velocity: DVec3, wall_velocity: DVec3, normal: DVec3) -> DVec3 {
        match self.mode {
            BounceMode::BounceBack => 2.0 * wall_velocity - velocity,
            BounceMode::Specular => {
                let relative = velocity - wall_velocity;
                if relative.dot(normal) > 0.0 {
                    wall_velocity + reflect_velocity(relative, normal)
                } else {
                    velocity
                }
            }
        }
    }

    /// Walk down the gradient to the surface, then step `offset` into the domain
    fn project_out<S: Surface>(&self, wall: &S, start: DVec3, t: f64) -> (DVec3, DVec3) {
        let mut x = start;
        let mut n = wall.normal(x, t);
        for _ in 0..RESCUE_ITERATIONS {
            let d = wall.signed_distance(x, t);
            if d <= 0.0 || n == DVec3::ZERO {
                break;
            }
            x -= n * d;
            n = wall.normal(x, t);
        }
        let d = wall.signed_distance(x, t);
        (x - n * (d.max(0.0) + self.offset), n)
    }
}

/// Point where the segment `a -> b` meets the surface, with `da <= 0 < db`.
/// Linear interpolation refined by regula falsi, keeping the bracket.
fn find_crossing<S: Surface>(wall: &S, a: DVec3, da: f64, b: DVec3, db: f64, t: f64) -> DVec3 {
    let (mut lo, mut d_lo) = (0.0, da);
    let (mut hi, mut d_hi) = (1.0, db);
    let mut s = lo - d_lo * (hi - lo) / (d_hi - d_lo);
    for _ in 0..CROSSING_ITERATIONS {
        let d = wall.signed_distance(a + (b - a) * s, t);
        if d.abs() < 1e-14 {
            break;
        }
        if d > 0.0 {
            hi = s;
            d_hi = d;
        } else {
            lo = s;
            d_lo = d;
        }
        s = lo - d_lo * (hi - lo) / (d_hi - d_lo);
    }
    a + (b - a) * s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::particles::Particle;
    use crate::sim::wall::Wall;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn floor() -> Wall {
        // Wall occupies z > 0
        Wall::plane("top", DVec3::Z, DVec3::ZERO).unwrap()
    }

    #[test]
    fn test_crossing_static_plane_bounce_back() {
        let walls = [floor()];
        let v = DVec3::new(0.3, -0.2, 1.0);
        let out = BoundaryEnforcer::default().enforce(
            DVec3::new(1.0, 1.0, -1e-3),
            DVec3::new(1.0, 1.0, 1e-3),
            v,
            &walls,
            0.0,
        );
        assert!(out.crossed);
        assert!(walls[0].signed_distance(out.position, 0.0) <= 0.0);
        assert_eq!(out.velocity, -v);
    }

    #[test]
    fn test_crossing_static_plane_specular() {
        let walls = [floor()];
        let v = DVec3::new(0.3, -0.2, 1.0);
        let out = BoundaryEnforcer::new(BounceMode::Specular).enforce(
            DVec3::new(0.0, 0.0, -1e-3),
            DVec3::new(0.0, 0.0, 1e-3),
            v,
            &walls,
            0.0,
        );
        assert!(out.position.z <= 0.0);
        assert_relative_eq!(out.velocity.x, 0.3);
        assert_relative_eq!(out.velocity.y, -0.2);
        assert_relative_eq!(out.velocity.z, -1.0);
    }

    #[test]
    fn test_moving_wall_bounce_back() {
        let u = DVec3::new(1.0, 0.0, 0.0);
        let walls = [Wall::moving_plane("lid", DVec3::Z, DVec3::new(0.0, 0.0, 2.0), u).unwrap()];
        let v = DVec3::new(0.1, 0.0, 0.5);
        let out = BoundaryEnforcer::default().enforce(
            DVec3::new(0.0, 0.0, 1.99),
            DVec3::new(0.0, 0.0, 2.01),
            v,
            &walls,
            3.0,
        );
        assert!(out.position.z <= 2.0);
        assert!((out.velocity - (2.0 * u - v)).length() < 1e-12);
    }

    #[test]
    fn test_crossing_point_on_curved_wall() {
        let obstacle = [Wall::sphere("ball", DVec3::ZERO, 1.0, false).unwrap()];
        let out = BoundaryEnforcer::default().enforce(
            DVec3::new(2.0, 0.0, 0.0),
            DVec3::new(0.5, 0.0, 0.0),
            DVec3::new(-1.0, 0.0, 0.0),
            &obstacle,
            0.0,
        );
        assert!(out.crossed);
        assert_relative_eq!(out.position.x, 1.0 + BOUNCE_OFFSET, epsilon = 1e-9);
        assert_relative_eq!(out.velocity.x, 1.0);
    }

    #[test]
    fn test_started_inside_is_rescued() {
        let walls = [floor()];
        let out = BoundaryEnforcer::default().enforce(
            DVec3::new(0.0, 0.0, 0.5),
            DVec3::new(0.0, 0.0, 0.6),
            DVec3::new(0.0, 0.0, 1.0),
            &walls,
            0.0,
        );
        assert!(out.rescued);
        assert!(!out.crossed);
        assert!(out.position.z <= 0.0);
        assert!(out.velocity.z < 0.0);
    }

    #[test]
    fn test_apply_skips_frozen_and_counts() {
        let walls = [floor()];
        let mut set = ParticleSet::new("pv");
        set.push(Particle::new(DVec3::new(0.0, 0.0, 0.2), DVec3::Z, 1.0));
        set.push(Particle::new(DVec3::new(0.0, 0.0, -1.0), DVec3::Z, 1.0));
        set.push(Particle::new(DVec3::new(0.0, 0.0, 0.2), DVec3::Z, 1.0));
        set.push(Particle::new(DVec3::new(0.0, 0.0, 0.7), DVec3::Z, 1.0));
        set.particles[2].flags.frozen = true;
        let prev = vec![
            DVec3::new(0.0, 0.0, -0.2),
            DVec3::new(0.0, 0.0, -1.2),
            DVec3::new(0.0, 0.0, -0.2),
            DVec3::new(0.0, 0.0, 0.5),
        ];

        let stats = BoundaryEnforcer::default().apply(&mut set, &prev, &walls, 0.0).unwrap();
        assert_eq!(stats.bounced, 1);
        assert_eq!(stats.rescued, vec![3]);
        assert!(set.particles[0].position.z <= 0.0);
        assert_eq!(set.particles[2].position.z, 0.2);
        assert!(set.particles[3].flags.rescued);

        assert!(BoundaryEnforcer::default().apply(&mut set, &prev[..2], &walls, 0.0).is_err());
    }

    proptest! {
        #[test]
        fn prop_plane_crossings_end_in_domain(
            x in -5.0f64..5.0, z0 in -2.0f64..0.0, dx in -1.0f64..1.0, z1 in 1e-9f64..2.0
        ) {
            let walls = [floor()];
            let out = BoundaryEnforcer::default().enforce(
                DVec3::new(x, 0.0, z0),
                DVec3::new(x + dx, 0.0, z1),
                DVec3::Z,
                &walls,
                0.0,
            );
            prop_assert!(out.position.z <= 0.0);
            prop_assert!(out.velocity.z < 0.0);
        }

        #[test]
        fn prop_container_sphere_keeps_particles(
            theta in 0.0f64..std::f64::consts::PI, phi in 0.0f64..std::f64::consts::TAU,
            r0 in 0.0f64..2.99, r1 in 3.001f64..4.0
        ) {
            let walls = [Wall::sphere("shell", DVec3::ZERO, 3.0, true).unwrap()];
            let dir = DVec3::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos());
            let prev = dir * r0;
            let new = (dir + DVec3::new(0.1, -0.05, 0.02)).normalize() * r1;
            let out = BoundaryEnforcer::default().enforce(prev, new, dir, &walls, 0.0);
            prop_assert!(walls[0].signed_distance(out.position, 0.0) <= 0.0);
        }
    }
}
