//! Walls: geometry plus kinematics
//!
//! A wall is immutable once built. Time enters only through its kinematics:
//! queries map the point back into the wall's reference frame, evaluate the
//! geometry there and map directions forward again.

use std::f64::consts::TAU;
use std::path::Path;

use glam::{DQuat, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use super::field::SampledField;
use super::geometry::{Axis, Geometry, Shape};
use super::particles::ParticleSet;
use crate::consts::DIRECTION_TOLERANCE;
use crate::error::{Result, config_err};
use crate::rotate_about;

/// Rigid motion of a wall as a function of simulation time
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Kinematics {
    #[default]
    Static,
    Translating {
        velocity: DVec3,
    },
    /// Surface velocity `velocity * cos(2 pi t / period)`, period in time units (not steps)
    Oscillating {
        velocity: DVec3,
        period: f64,
    },
    /// Constant angular velocity `omega` about an axis through `center`
    Rotating {
        center: DVec3,
        omega: DVec3,
    },
}

impl Kinematics {
    pub fn is_static(&self) -> bool {
        matches!(self, Kinematics::Static)
    }

    /// Map a world point into the wall's reference frame at time `t`
    pub fn to_reference(&self, p: DVec3, t: f64) -> DVec3 {
        match *self {
            Kinematics::Static => p,
            Kinematics::Translating { velocity } => p - velocity * t,
            Kinematics::Oscillating { velocity, period } => {
                // Displacement is the integral of the surface velocity
                p - velocity * (period / TAU) * (TAU * t / period).sin()
            }
            Kinematics::Rotating { center, omega } => rotate_about(p, center, omega, -t),
        }
    }

    /// Map a reference-frame direction to the world frame at time `t`
    pub fn to_world_direction(&self, n: DVec3, t: f64) -> DVec3 {
        match *self {
            Kinematics::Rotating { omega, .. } => DQuat::from_scaled_axis(omega * t) * n,
            _ => n,
        }
    }

    /// Velocity of the wall material at world point `p`
    pub fn surface_velocity(&self, p: DVec3, t: f64) -> DVec3 {
        match *self {
            Kinematics::Static => DVec3::ZERO,
            Kinematics::Translating { velocity } => velocity,
            Kinematics::Oscillating { velocity, period } => velocity * (TAU * t / period).cos(),
            Kinematics::Rotating { center, omega } => omega.cross(p - center),
        }
    }
}

/// Anything particles can be bounced against
pub trait Surface: Sync {
    /// Positive inside the wall body, negative in the domain
    fn signed_distance(&self, p: DVec3, t: f64) -> f64;
    /// Unit normal pointing into the wall
    fn normal(&self, p: DVec3, t: f64) -> DVec3;
    fn surface_velocity(&self, p: DVec3, t: f64) -> DVec3;
}

/// A named wall
#[derive(Debug, Clone)]
pub struct Wall {
    name: String,
    geometry: Geometry,
    kinematics: Kinematics,
}

impl Wall {
    /// Build a wall, rejecting motions that would deform its shape
    pub fn new(name: impl Into<String>, geometry: Geometry, kinematics: Kinematics) -> Result<Self> {
        let name = name.into();
        validate_motion(&name, &geometry, &kinematics)?;
        log::debug!("Wall '{}': {} {:?}", name, shape_name(geometry.shape()), kinematics);
        Ok(Self {
            name,
            geometry,
            kinematics,
        })
    }

    /// Planar wall; `normal` points into the wall
    pub fn plane(name: impl Into<String>, normal: DVec3, point: DVec3) -> Result<Self> {
        Self::new(name, Geometry::plane(normal, point)?, Kinematics::Static)
    }

    /// Plane sliding along itself with constant velocity (Couette flows)
    pub fn moving_plane(name: impl Into<String>, normal: DVec3, point: DVec3, velocity: DVec3) -> Result<Self> {
        Self::new(name, Geometry::plane(normal, point)?, Kinematics::Translating { velocity })
    }

    pub fn oscillating_plane(
        name: impl Into<String>,
        normal: DVec3,
        point: DVec3,
        velocity: DVec3,
        period: f64,
    ) -> Result<Self> {
        Self::new(
            name,
            Geometry::plane(normal, point)?,
            Kinematics::Oscillating { velocity, period },
        )
    }

    pub fn box_wall(name: impl Into<String>, low: DVec3, high: DVec3, inside: bool) -> Result<Self> {
        Self::new(name, Geometry::cuboid(low, high, inside)?, Kinematics::Static)
    }

    pub fn cylinder(name: impl Into<String>, center: DVec2, radius: f64, axis: Axis, inside: bool) -> Result<Self> {
        Self::new(name, Geometry::cylinder(center, radius, axis, inside)?, Kinematics::Static)
    }

    /// Cylinder spinning about its own axis with angular speed `omega`
    pub fn rotating_cylinder(
        name: impl Into<String>,
        center: DVec2,
        radius: f64,
        axis: Axis,
        omega: f64,
        inside: bool,
    ) -> Result<Self> {
        let (u, v) = axis.perpendicular();
        let mut axis_point = DVec3::ZERO;
        axis_point[u] = center.x;
        axis_point[v] = center.y;
        Self::new(
            name,
            Geometry::cylinder(center, radius, axis, inside)?,
            Kinematics::Rotating {
                center: axis_point,
                omega: axis.unit() * omega,
            },
        )
    }

    pub fn sphere(name: impl Into<String>, center: DVec3, radius: f64, inside: bool) -> Result<Self> {
        Self::new(name, Geometry::sphere(center, radius, inside)?, Kinematics::Static)
    }

    /// Wall from an SDF file, resampled to `spacing`
    pub fn sdf(name: impl Into<String>, path: impl AsRef<Path>, spacing: DVec3) -> Result<Self> {
        let field = SampledField::load(path, spacing)?;
        Self::from_field(name, &field)
    }

    pub fn from_field(name: impl Into<String>, field: &SampledField) -> Result<Self> {
        Self::new(name, Geometry::sampled(field.grid().clone()), Kinematics::Static)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kinematics
    }

    #[inline]
    pub fn signed_distance(&self, p: DVec3, t: f64) -> f64 {
        self.geometry.distance(self.kinematics.to_reference(p, t))
    }

    #[inline]
    pub fn normal(&self, p: DVec3, t: f64) -> DVec3 {
        let n = self.geometry.gradient(self.kinematics.to_reference(p, t));
        self.kinematics.to_world_direction(n, t)
    }

    #[inline]
    pub fn surface_velocity(&self, p: DVec3, t: f64) -> DVec3 {
        self.kinematics.surface_velocity(p, t)
    }

    pub fn is_inside(&self, p: DVec3, t: f64) -> bool {
        self.signed_distance(p, t) > 0.0
    }
}

impl Surface for Wall {
    fn signed_distance(&self, p: DVec3, t: f64) -> f64 {
        Wall::signed_distance(self, p, t)
    }

    fn normal(&self, p: DVec3, t: f64) -> DVec3 {
        Wall::normal(self, p, t)
    }

    fn surface_velocity(&self, p: DVec3, t: f64) -> DVec3 {
        Wall::surface_velocity(self, p, t)
    }
}

impl<S: Surface + ?Sized> Surface for &S {
    fn signed_distance(&self, p: DVec3, t: f64) -> f64 {
        (**self).signed_distance(p, t)
    }

    fn normal(&self, p: DVec3, t: f64) -> DVec3 {
        (**self).normal(p, t)
    }

    fn surface_velocity(&self, p: DVec3, t: f64) -> DVec3 {
        (**self).surface_velocity(p, t)
    }
}

fn shape_name(shape: &Shape) -> &'static str {
    match shape {
        Shape::Plane { .. } => "plane",
        Shape::Box { .. } => "box",
        Shape::Cylinder { .. } => "cylinder",
        Shape::Sphere { .. } => "sphere",
        Shape::Sampled(_) => "sdf",
    }
}

#[inline]
fn is_parallel(a: DVec3, dir: DVec3) -> bool {
    a.cross(dir).length() <= DIRECTION_TOLERANCE * a.length() * dir.length()
}

#[inline]
fn is_orthogonal(a: DVec3, dir: DVec3) -> bool {
    a.dot(dir).abs() <= DIRECTION_TOLERANCE * a.length() * dir.length()
}

/// Only shape-preserving motions are accepted
fn validate_motion(name: &str, geometry: &Geometry, kinematics: &Kinematics) -> Result<()> {
    let shape = geometry.shape();
    match *kinematics {
        Kinematics::Static => Ok(()),
        Kinematics::Translating { velocity } | Kinematics::Oscillating { velocity, .. } => {
            if let Kinematics::Oscillating { period, .. } = *kinematics {
                if !(period.is_finite() && period > 0.0) {
                    return config_err(format!("wall '{name}': oscillation period must be positive, got {period}"));
                }
            }
            if !crate::is_finite_vec(velocity) {
                return config_err(format!("wall '{name}': velocity must be finite"));
            }
            match shape {
                Shape::Plane { normal, .. } if is_orthogonal(velocity, *normal) => Ok(()),
                Shape::Plane { .. } => config_err(format!(
                    "wall '{name}': velocity {velocity} must be orthogonal to the plane normal"
                )),
                Shape::Cylinder { axis, .. } if is_parallel(velocity, axis.unit()) => Ok(()),
                Shape::Cylinder { .. } => config_err(format!(
                    "wall '{name}': velocity {velocity} must be parallel to the cylinder axis"
                )),
                other => config_err(format!("wall '{name}': a {} wall cannot translate", shape_name(other))),
            }
        }
        Kinematics::Rotating { center, omega } => {
            if !crate::is_finite_vec(center) || !crate::is_finite_vec(omega) {
                return config_err(format!("wall '{name}': rotation parameters must be finite"));
            }
            let tol = DIRECTION_TOLERANCE * center.length().max(1.0);
            let ok = match shape {
                Shape::Plane { normal, point } => {
                    is_parallel(omega, *normal) && (center - *point).dot(*normal).abs() <= tol
                }
                Shape::Cylinder { center: c, axis, .. } => {
                    let (u, v) = axis.perpendicular();
                    is_parallel(omega, axis.unit())
                        && (center[u] - c.x).abs() <= tol
                        && (center[v] - c.y).abs() <= tol
                }
                Shape::Sphere { center: c, .. } => (center - *c).length() <= tol,
                _ => false,
            };
            if ok {
                Ok(())
            } else {
                config_err(format!(
                    "wall '{name}': rotation about {center} with omega {omega} deforms the {}",
                    shape_name(shape)
                ))
            }
        }
    }
}

/// Drop every particle lying strictly inside any wall; returns how many were removed
pub fn remove_particles_inside(set: &mut ParticleSet, walls: &[Wall], t: f64) -> usize {
    let before = set.len();
    set.particles
        .retain(|p| walls.iter().all(|w| w.signed_distance(p.position, t) <= 0.0));
    let removed = before - set.len();
    if removed > 0 {
        log::info!("Removed {} particles of '{}' inside walls", removed, set.name);
    }
    removed
}

/// Number of particles lying strictly inside any wall
pub fn count_particles_inside(set: &ParticleSet, walls: &[Wall], t: f64) -> usize {
    set.particles
        .iter()
        .filter(|p| walls.iter().any(|w| w.is_inside(p.position, t)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::field::Grid;
    use crate::sim::particles::Particle;
    use approx::assert_relative_eq;

    #[test]
    fn test_moving_plane_must_slide_along_itself() {
        let ok = Wall::moving_plane("top", DVec3::Z, DVec3::new(0.0, 0.0, 5.0), DVec3::new(1.0, 0.0, 0.0));
        assert!(ok.is_ok());
        let bad = Wall::moving_plane("top", DVec3::Z, DVec3::new(0.0, 0.0, 5.0), DVec3::new(1.0, 0.0, 0.1));
        assert!(bad.is_err());
        let bad = Wall::oscillating_plane("osc", DVec3::Z, DVec3::ZERO, DVec3::X, 0.0);
        assert!(bad.is_err());
    }

    #[test]
    fn test_invalid_motions_rejected() {
        let sphere = Geometry::sphere(DVec3::ONE, 1.0, false).unwrap();
        let moving = Kinematics::Translating { velocity: DVec3::X };
        assert!(Wall::new("s", sphere.clone(), moving).is_err());
        let off_center = Kinematics::Rotating {
            center: DVec3::ZERO,
            omega: DVec3::Z,
        };
        assert!(Wall::new("s", sphere.clone(), off_center).is_err());
        let spinning = Kinematics::Rotating {
            center: DVec3::ONE,
            omega: DVec3::new(0.3, -1.0, 2.0),
        };
        assert!(Wall::new("s", sphere, spinning).is_ok());

        let cyl = Geometry::cylinder(DVec2::new(1.0, 2.0), 1.0, Axis::Z, true).unwrap();
        let sideways = Kinematics::Translating { velocity: DVec3::X };
        assert!(Wall::new("c", cyl.clone(), sideways).is_err());
        let along = Kinematics::Translating { velocity: DVec3::Z * 3.0 };
        assert!(Wall::new("c", cyl, along).is_ok());

        let bx = Geometry::cuboid(DVec3::ZERO, DVec3::ONE, true).unwrap();
        assert!(Wall::new("b", bx, Kinematics::Translating { velocity: DVec3::ZERO }).is_err());
    }

    #[test]
    fn test_oscillating_surface_velocity() {
        let w = Wall::oscillating_plane("osc", DVec3::Z, DVec3::ZERO, DVec3::new(2.0, 0.0, 0.0), 4.0).unwrap();
        let p = DVec3::new(1.0, 1.0, 0.0);
        assert_relative_eq!(w.surface_velocity(p, 0.0).x, 2.0);
        assert_relative_eq!(w.surface_velocity(p, 1.0).x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(w.surface_velocity(p, 2.0).x, -2.0);
        // Sliding along itself never changes the distance field
        assert_relative_eq!(w.signed_distance(DVec3::new(0.3, 0.0, 0.7), 1.3), 0.7, epsilon = 1e-12);
    }

    #[test]
    fn test_rotating_cylinder() {
        let w = Wall::rotating_cylinder("rot", DVec2::new(1.0, 1.0), 2.0, Axis::Z, 0.5, true).unwrap();
        let p = DVec3::new(3.0, 1.0, 4.0);
        assert_relative_eq!(w.signed_distance(p, 0.0), 0.0, epsilon = 1e-12);
        assert_relative_eq!(w.signed_distance(p, 3.7), 0.0, epsilon = 1e-12);
        let u = w.surface_velocity(p, 1.0);
        assert!((u - DVec3::new(0.0, 1.0, 0.0)).length() < 1e-12);
        let n = w.normal(p, 2.5);
        assert!((n - DVec3::X).length() < 1e-9);
    }

    #[test]
    fn test_kinematic_inverse_transform() {
        let k = Kinematics::Translating { velocity: DVec3::new(1.0, 0.0, 0.0) };
        assert_eq!(k.to_reference(DVec3::new(3.0, 0.0, 0.0), 2.0), DVec3::new(1.0, 0.0, 0.0));

        let k = Kinematics::Oscillating {
            velocity: DVec3::X,
            period: 4.0,
        };
        // Quarter period: displacement = v T / 2pi
        let r = k.to_reference(DVec3::ZERO, 1.0);
        assert_relative_eq!(r.x, -4.0 / TAU, epsilon = 1e-12);

        let k = Kinematics::Rotating {
            center: DVec3::ZERO,
            omega: DVec3::Z,
        };
        let r = k.to_reference(DVec3::X, std::f64::consts::FRAC_PI_2);
        assert!((r - DVec3::new(0.0, -1.0, 0.0)).length() < 1e-12);
    }

    #[test]
    fn test_sdf_wall_from_file() {
        let grid = Grid::from_fn(DVec3::ZERO, DVec3::splat(4.0), [8, 8, 8], |p| 1.0 - p.z).unwrap();
        let path = std::env::temp_dir().join(format!("mesowall_wall_test_{}.sdf", std::process::id()));
        grid.save(&path).unwrap();
        let w = Wall::sdf("file", &path, DVec3::splat(0.25)).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(w.is_inside(DVec3::new(2.0, 2.0, 0.5), 0.0));
        assert!(!w.is_inside(DVec3::new(2.0, 2.0, 2.0), 0.0));
        assert_relative_eq!(w.signed_distance(DVec3::new(1.0, 3.0, 2.5), 0.0), -1.5, epsilon = 1e-5);
        let n = w.normal(DVec3::new(2.0, 2.0, 2.0), 0.0);
        assert!((n + DVec3::Z).length() < 1e-5);
    }

    #[test]
    fn test_remove_and_count_inside() {
        let walls = vec![
            Wall::plane("lo", -DVec3::Z, DVec3::new(0.0, 0.0, 1.0)).unwrap(),
            Wall::plane("hi", DVec3::Z, DVec3::new(0.0, 0.0, 3.0)).unwrap(),
        ];
        let mut set = ParticleSet::new("pv");
        for z in [0.5, 1.5, 2.0, 2.5, 3.5] {
            set.push(Particle::new(DVec3::new(0.0, 0.0, z), DVec3::ZERO, 1.0));
        }
        assert_eq!(count_particles_inside(&set, &walls, 0.0), 2);
        assert_eq!(remove_particles_inside(&mut set, &walls, 0.0), 2);
        assert_eq!(set.len(), 3);
        assert_eq!(count_particles_inside(&set, &walls, 0.0), 0);
    }
}
