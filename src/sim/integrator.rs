//! Time integrators
//!
//! An integrator advances one particle set by one time step given the
//! forces accumulated for it. Frozen particles are never moved. All kinds
//! share the leapfrog form of velocity Verlet with the velocity staggered by
//! half a step: `v += F/m dt; x += v dt`.

use std::f64::consts::TAU;
use std::sync::Arc;

use glam::{DMat3, DQuat, DVec3};
use rayon::prelude::*;

use super::domain::Domain;
use super::geometry::Axis;
use super::interaction::{Interaction, InteractionKind};
use super::particles::ParticleSet;
use super::rigid::RigidGroup;
use crate::error::{Result, SimError, config_err};
use crate::rotate_about;

#[derive(Debug, Clone)]
pub enum IntegratorKind {
    VelocityVerlet,
    /// Velocity Verlet with a constant extra force on every particle
    ConstForce { force: DVec3 },
    /// Extra force along `direction` whose sign flips halfway across the next
    /// axis (x -> y, y -> z, z -> x): double Poiseuille flow
    PeriodicForce { force: f64, direction: Axis },
    /// Prescribed constant velocity, forces ignored
    Translate { velocity: DVec3 },
    /// Prescribed rotation about `center`, forces ignored
    Rotate { center: DVec3, omega: DVec3 },
    /// Prescribed velocity `velocity * cos(2 pi t / period)`, forces ignored
    Oscillate { velocity: DVec3, period: f64 },
    /// Rigid-body velocity Verlet, only through `Integrator::step_rigid`
    RigidVelocityVerlet,
    /// Slow forces held fixed over `substeps` inner steps of `dt / substeps`
    /// that re-evaluate only the `fast` membrane forces
    SubStepMembrane { substeps: u32, fast: Arc<dyn Interaction> },
}

#[derive(Debug, Clone)]
pub struct Integrator {
    name: String,
    dt: f64,
    kind: IntegratorKind,
}

impl Integrator {
    pub fn new(name: impl Into<String>, dt: f64, kind: IntegratorKind) -> Result<Self> {
        let name = name.into();
        if !(dt.is_finite() && dt > 0.0) {
            return config_err(format!("integrator '{name}': dt must be positive, got {dt}"));
        }
        match &kind {
            IntegratorKind::Oscillate { period, .. } if !(period.is_finite() && *period > 0.0) => {
                return config_err(format!("integrator '{name}': period must be positive, got {period}"));
            }
            IntegratorKind::SubStepMembrane { substeps, fast } => {
                if fast.kind() != InteractionKind::Membrane {
                    return Err(SimError::InteractionType {
                        name: fast.name().to_string(),
                    });
                }
                if *substeps == 0 {
                    return config_err(format!("integrator '{name}': substeps must be at least 1"));
                }
            }
            _ => {}
        }
        log::debug!("Integrator '{}': {:?}, dt = {}", name, kind, dt);
        Ok(Self { name, dt, kind })
    }

    pub fn velocity_verlet(name: impl Into<String>, dt: f64) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::VelocityVerlet)
    }

    pub fn const_force(name: impl Into<String>, dt: f64, force: DVec3) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::ConstForce { force })
    }

    pub fn periodic_force(name: impl Into<String>, dt: f64, force: f64, direction: Axis) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::PeriodicForce { force, direction })
    }

    pub fn translate(name: impl Into<String>, dt: f64, velocity: DVec3) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::Translate { velocity })
    }

    pub fn rotate(name: impl Into<String>, dt: f64, center: DVec3, omega: DVec3) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::Rotate { center, omega })
    }

    pub fn oscillate(name: impl Into<String>, dt: f64, velocity: DVec3, period: f64) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::Oscillate { velocity, period })
    }

    pub fn rigid_velocity_verlet(name: impl Into<String>, dt: f64) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::RigidVelocityVerlet)
    }

    pub fn sub_step_membrane(
        name: impl Into<String>,
        dt: f64,
        substeps: u32,
        fast: Arc<dyn Interaction>,
    ) -> Result<Self> {
        Self::new(name, dt, IntegratorKind::SubStepMembrane { substeps, fast })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn kind(&self) -> &IntegratorKind {
        &self.kind
    }

    pub fn is_rigid(&self) -> bool {
        matches!(self.kind, IntegratorKind::RigidVelocityVerlet)
    }

    /// Interaction evaluated inside the step rather than by the caller
    pub fn fast_interaction(&self) -> Option<&Arc<dyn Interaction>> {
        match &self.kind {
            IntegratorKind::SubStepMembrane { fast, .. } => Some(fast),
            _ => None,
        }
    }

    /// Advance `set` from `t` to `t + dt`
    pub fn step(&self, set: &mut ParticleSet, forces: &[DVec3], t: f64, domain: &Domain) -> Result<()> {
        if forces.len() != set.len() {
            return config_err(format!(
                "integrator '{}': {} forces for {} particles of '{}'",
                self.name,
                forces.len(),
                set.len(),
                set.name
            ));
        }
        let dt = self.dt;
        match &self.kind {
            IntegratorKind::VelocityVerlet => velocity_verlet(set, forces, dt, |_| DVec3::ZERO),
            IntegratorKind::ConstForce { force } => velocity_verlet(set, forces, dt, |_| *force),
            IntegratorKind::PeriodicForce { force, direction } => {
                let k = direction.next().index();
                let half = 0.5 * domain.extents[k];
                let lo = domain.lo[k];
                let base = direction.unit() * *force;
                velocity_verlet(set, forces, dt, |x| if x[k] - lo < half { base } else { -base })
            }
            IntegratorKind::Translate { velocity } => {
                let u = *velocity;
                prescribe(set, |p| (p + u * dt, u));
            }
            IntegratorKind::Rotate { center, omega } => {
                let (c, w) = (*center, *omega);
                prescribe(set, |p| {
                    let x = rotate_about(p, c, w, dt);
                    (x, w.cross(x - c))
                });
            }
            IntegratorKind::Oscillate { velocity, period } => {
                let v = *velocity * (TAU * t / *period).cos();
                prescribe(set, |p| (p + v * dt, v));
            }
            IntegratorKind::RigidVelocityVerlet => {
                return config_err(format!(
                    "integrator '{}' advances rigid groups; '{}' is a plain particle set",
                    self.name, set.name
                ));
            }
            IntegratorKind::SubStepMembrane { substeps, fast } => {
                let h = dt / *substeps as f64;
                for _ in 0..*substeps {
                    let fast_forces = fast.compute_forces(set, domain);
                    let total: Vec<DVec3> = forces.iter().zip(&fast_forces).map(|(&s, &f)| s + f).collect();
                    velocity_verlet(set, &total, h, |_| DVec3::ZERO);
                }
            }
        }
        Ok(())
    }

    /// Advance every body of `group`; `forces` are per member particle
    pub fn step_rigid(&self, group: &mut RigidGroup, forces: &[DVec3], _t: f64) -> Result<()> {
        if !self.is_rigid() {
            return config_err(format!("integrator '{}' cannot advance rigid group '{}'", self.name, group.name));
        }
        let dt = self.dt;
        let loads = group.body_force_torque(forces)?;
        group.bodies.par_iter_mut().zip(loads.par_iter()).for_each(|(body, &(force, torque))| {
            body.velocity += force / body.mass * dt;
            body.com += body.velocity * dt;

            let inertia: DMat3 = body.inertia_world();
            if inertia.determinant().abs() > 1e-12 {
                let gyro = body.omega.cross(inertia * body.omega);
                body.omega += inertia.inverse() * (torque - gyro) * dt;
            }

            let w = body.omega;
            let dq = DQuat::from_xyzw(w.x, w.y, w.z, 0.0) * body.orientation;
            body.orientation = (body.orientation + dq * (0.5 * dt)).normalize();
        });
        group.sync_particles();
        Ok(())
    }
}

/// Leapfrog update of the mobile particles with an extra position-dependent force
fn velocity_verlet<F>(set: &mut ParticleSet, forces: &[DVec3], dt: f64, extra: F)
where
    F: Fn(DVec3) -> DVec3 + Sync,
{
    set.particles
        .par_iter_mut()
        .zip(forces.par_iter())
        .filter(|(p, _)| p.is_mobile())
        .for_each(|(p, &f)| {
            p.velocity += (f + extra(p.position)) / p.mass * dt;
            p.position += p.velocity * dt;
        });
}

/// Kinematic update: `motion(x) -> (x', v')` on every mobile particle
fn prescribe<F>(set: &mut ParticleSet, motion: F)
where
    F: Fn(DVec3) -> (DVec3, DVec3) + Sync,
{
    set.particles.par_iter_mut().filter(|p| p.is_mobile()).for_each(|p| {
        let (x, v) = motion(p.position);
        p.position = x;
        p.velocity = v;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::interaction::{Dpd, DpdParams, MembraneSprings};
    use crate::sim::particles::Particle;
    use approx::assert_relative_eq;

    fn domain() -> Domain {
        Domain::new(DVec3::ZERO, DVec3::splat(10.0))
    }

    fn line_of_particles(n: usize) -> ParticleSet {
        let mut set = ParticleSet::new("pv");
        for i in 0..n {
            set.push(Particle::new(DVec3::new(1.0 + i as f64, 2.0, 3.0), DVec3::ZERO, 1.0));
        }
        set
    }

    #[test]
    fn test_zero_force_zero_velocity_is_stationary() {
        let vv = Integrator::velocity_verlet("vv", 0.01).unwrap();
        let mut set = line_of_particles(4);
        let before = set.positions();
        let forces = vec![DVec3::ZERO; 4];
        for s in 0..10 {
            vv.step(&mut set, &forces, s as f64 * 0.01, &domain()).unwrap();
        }
        assert_eq!(set.positions(), before);
    }

    #[test]
    fn test_leapfrog_update_order() {
        let vv = Integrator::velocity_verlet("vv", 0.1).unwrap();
        let mut set = line_of_particles(1);
        set.particles[0].mass = 2.0;
        vv.step(&mut set, &[DVec3::new(4.0, 0.0, 0.0)], 0.0, &domain()).unwrap();
        // v = F/m dt = 0.2, then x += v dt
        assert_relative_eq!(set.particles[0].velocity.x, 0.2);
        assert_relative_eq!(set.particles[0].position.x, 1.02);
    }

    #[test]
    fn test_frozen_particles_do_not_move() {
        let cf = Integrator::const_force("cf", 0.1, DVec3::X).unwrap();
        let mut set = line_of_particles(2);
        set.particles[1].flags.frozen = true;
        cf.step(&mut set, &[DVec3::ZERO; 2], 0.0, &domain()).unwrap();
        assert!(set.particles[0].position.x > 1.0);
        assert_eq!(set.particles[1].position.x, 2.0);
        assert_eq!(set.particles[1].velocity, DVec3::ZERO);
    }

    #[test]
    fn test_force_count_mismatch_rejected() {
        let vv = Integrator::velocity_verlet("vv", 0.1).unwrap();
        let mut set = line_of_particles(3);
        assert!(vv.step(&mut set, &[DVec3::ZERO; 2], 0.0, &domain()).is_err());
    }

    #[test]
    fn test_invalid_dt_rejected() {
        assert!(Integrator::velocity_verlet("vv", 0.0).is_err());
        assert!(Integrator::velocity_verlet("vv", f64::NAN).is_err());
        assert!(Integrator::oscillate("osc", 0.1, DVec3::X, -1.0).is_err());
    }

    #[test]
    fn test_translate_offset() {
        let u = DVec3::new(0.5, -1.0, 2.0);
        let tr = Integrator::translate("tr", 0.01, u).unwrap();
        let mut set = line_of_particles(3);
        let before = set.positions();
        let forces = vec![DVec3::new(100.0, 0.0, 0.0); 3];
        for s in 0..50 {
            tr.step(&mut set, &forces, s as f64 * 0.01, &domain()).unwrap();
        }
        for (p, x0) in set.particles.iter().zip(before) {
            assert!((p.position - x0 - 50.0 * 0.01 * u).length() < 1e-12);
            assert_eq!(p.velocity, u);
        }
    }

    #[test]
    fn test_rotate_full_period_returns() {
        let n = 1000;
        let dt = TAU / n as f64;
        let center = DVec3::new(5.0, 5.0, 0.0);
        let rot = Integrator::rotate("rot", dt, center, DVec3::Z).unwrap();
        let mut set = line_of_particles(3);
        let before = set.positions();
        let forces = vec![DVec3::ZERO; 3];
        for s in 0..n {
            rot.step(&mut set, &forces, s as f64 * dt, &domain()).unwrap();
        }
        for (p, x0) in set.particles.iter().zip(before) {
            assert!((p.position - x0).length() < 1e-9);
            assert!((p.velocity - DVec3::Z.cross(p.position - center)).length() < 1e-12);
        }
    }

    #[test]
    fn test_oscillate_velocity() {
        let osc = Integrator::oscillate("osc", 0.1, DVec3::new(2.0, 0.0, 0.0), 4.0).unwrap();
        let mut set = line_of_particles(1);
        osc.step(&mut set, &[DVec3::ZERO], 2.0, &domain()).unwrap();
        assert_relative_eq!(set.particles[0].velocity.x, -2.0);
        assert_relative_eq!(set.particles[0].position.x, 0.8);
    }

    #[test]
    fn test_periodic_force_sign() {
        let pf = Integrator::periodic_force("pf", 1.0, 3.0, Axis::X).unwrap();
        let mut set = ParticleSet::new("pv");
        set.push(Particle::new(DVec3::new(1.0, 2.0, 1.0), DVec3::ZERO, 1.0));
        set.push(Particle::new(DVec3::new(1.0, 7.0, 1.0), DVec3::ZERO, 1.0));
        pf.step(&mut set, &[DVec3::ZERO; 2], 0.0, &domain()).unwrap();
        assert_relative_eq!(set.particles[0].velocity.x, 3.0);
        assert_relative_eq!(set.particles[1].velocity.x, -3.0);

        // z flips along x
        let pf = Integrator::periodic_force("pf", 1.0, 1.0, Axis::Z).unwrap();
        let mut set = ParticleSet::new("pv");
        set.push(Particle::new(DVec3::new(8.0, 2.0, 1.0), DVec3::ZERO, 1.0));
        pf.step(&mut set, &[DVec3::ZERO], 0.0, &domain()).unwrap();
        assert_relative_eq!(set.particles[0].velocity.z, -1.0);
    }

    #[test]
    fn test_single_substep_matches_velocity_verlet() {
        let springs: Arc<dyn Interaction> = Arc::new(MembraneSprings::new("mem", vec![(0, 1), (1, 2)], 5.0, 0.8).unwrap());
        let sub = Integrator::sub_step_membrane("sub", 0.01, 1, springs.clone()).unwrap();
        let vv = Integrator::velocity_verlet("vv", 0.01).unwrap();

        let mut a = line_of_particles(3);
        a.particles[1].velocity = DVec3::new(0.0, 0.3, 0.0);
        let mut b = a.clone();
        let slow = vec![DVec3::new(0.1, 0.0, 0.0), DVec3::new(0.0, -0.2, 0.0), DVec3::new(0.0, 0.0, 0.4)];

        sub.step(&mut a, &slow, 0.0, &domain()).unwrap();
        let fast = springs.compute_forces(&b, &domain());
        let combined: Vec<DVec3> = slow.iter().zip(&fast).map(|(&s, &f)| s + f).collect();
        vv.step(&mut b, &combined, 0.0, &domain()).unwrap();

        for (pa, pb) in a.particles.iter().zip(&b.particles) {
            assert!((pa.position - pb.position).length() < 1e-14);
            assert!((pa.velocity - pb.velocity).length() < 1e-14);
        }
    }

    #[test]
    fn test_substeps_refine_stiff_springs() {
        let springs: Arc<dyn Interaction> = Arc::new(MembraneSprings::new("mem", vec![(0, 1)], 50.0, 1.0).unwrap());
        let mut set = line_of_particles(2);
        set.particles[1].position.x = 2.5;
        let energy = |s: &ParticleSet| {
            let r = (s.particles[1].position - s.particles[0].position).length();
            s.kinetic_energy() + 0.5 * 50.0 * (r - 1.0).powi(2)
        };
        let e0 = energy(&set);
        let sub = Integrator::sub_step_membrane("sub", 0.02, 20, springs).unwrap();
        for s in 0..100 {
            sub.step(&mut set, &[DVec3::ZERO; 2], s as f64 * 0.02, &domain()).unwrap();
        }
        assert!((energy(&set) - e0).abs() / e0 < 0.05);
    }

    #[test]
    fn test_substep_construction_errors() {
        let dpd: Arc<dyn Interaction> = Arc::new(Dpd::new("dpd", DpdParams::default(), 0.01, 1).unwrap());
        let err = Integrator::sub_step_membrane("sub", 0.01, 5, dpd).unwrap_err();
        assert!(matches!(err, SimError::InteractionType { .. }));

        let springs: Arc<dyn Interaction> = Arc::new(MembraneSprings::new("mem", vec![], 1.0, 1.0).unwrap());
        let err = Integrator::sub_step_membrane("sub", 0.01, 0, springs).unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
    }

    #[test]
    fn test_rigid_integrator_rejects_plain_sets() {
        let rigid = Integrator::rigid_velocity_verlet("rvv", 0.01).unwrap();
        let mut set = line_of_particles(1);
        assert!(rigid.step(&mut set, &[DVec3::ZERO], 0.0, &domain()).is_err());
    }

    fn octahedron() -> RigidGroup {
        let template = vec![DVec3::X, -DVec3::X, DVec3::Y, -DVec3::Y, DVec3::Z, -DVec3::Z];
        RigidGroup::new("oct", template, 1.0).unwrap()
    }

    #[test]
    fn test_torque_free_rotation() {
        let dt = 1e-3;
        let rigid = Integrator::rigid_velocity_verlet("rvv", dt).unwrap();
        let mut group = octahedron();
        group.add_body(DVec3::splat(5.0), DQuat::IDENTITY, DVec3::ZERO, DVec3::Z);
        let start = group.particles.positions();
        let forces = vec![DVec3::ZERO; 6];

        let n = (TAU / dt).round() as usize;
        for s in 0..n {
            rigid.step_rigid(&mut group, &forces, s as f64 * dt).unwrap();
            assert_relative_eq!(group.bodies[0].orientation.length(), 1.0, epsilon = 1e-12);
        }
        assert!((group.bodies[0].omega - DVec3::Z).length() < 1e-12);
        for (p, x0) in group.particles.positions().iter().zip(start) {
            assert!((*p - x0).length() < 1e-3);
        }
    }

    #[test]
    fn test_rigid_body_responds_to_force_and_torque() {
        let rigid = Integrator::rigid_velocity_verlet("rvv", 0.1).unwrap();
        let mut group = octahedron();
        group.add_body(DVec3::splat(5.0), DQuat::IDENTITY, DVec3::ZERO, DVec3::ZERO);
        let mut forces = vec![DVec3::ZERO; 6];
        // Couple about z plus a net push along x
        forces[0] = DVec3::new(0.0, 1.0, 0.0);
        forces[1] = DVec3::new(0.0, -1.0, 0.0);
        forces[4] = DVec3::new(6.0, 0.0, 0.0);
        rigid.step_rigid(&mut group, &forces, 0.0).unwrap();

        let body = &group.bodies[0];
        // F/M dt = 6/6 * 0.1
        assert_relative_eq!(body.velocity.x, 0.1, epsilon = 1e-12);
        // Torque from the couple (2 about z) and the push at +z (6 about y)
        assert!(body.omega.z > 0.0);
        assert!(body.omega.y > 0.0);
        assert!(rigid.step_rigid(&mut group, &forces[..3], 0.1).is_err());
    }
}
