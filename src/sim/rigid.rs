//! Rigid bodies made of particles
//!
//! Every body in a group shares one template of body-frame offsets. The
//! member particles are rebuilt from the body state after each step, so they
//! only ever carry forces to the body and positions back to the solvent.

use glam::{DMat3, DQuat, DVec3};
use serde::{Deserialize, Serialize};

use super::domain::Domain;
use super::particles::{Particle, ParticleSet};
use crate::error::{Result, config_err};

/// State of one rigid body
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidBodyState {
    pub com: DVec3,
    pub velocity: DVec3,
    /// Body to world rotation, unit length
    pub orientation: DQuat,
    /// Angular velocity, world frame
    pub omega: DVec3,
    pub mass: f64,
    /// Inertia tensor, body frame
    pub inertia: DMat3,
}

impl RigidBodyState {
    /// Inertia tensor in the world frame: `R I R^T`
    pub fn inertia_world(&self) -> DMat3 {
        let r = DMat3::from_quat(self.orientation);
        r * self.inertia * r.transpose()
    }

    pub fn angular_momentum(&self) -> DVec3 {
        self.inertia_world() * self.omega
    }

    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.velocity.length_squared() + 0.5 * self.omega.dot(self.angular_momentum())
    }
}

/// Inertia tensor of point masses about the origin: `sum m (r^2 I - r r^T)`
pub fn inertia_tensor(offsets: &[DVec3], mass: f64) -> DMat3 {
    offsets.iter().fold(DMat3::ZERO, |acc, &r| {
        let outer = DMat3::from_cols(r * r.x, r * r.y, r * r.z);
        acc + (DMat3::IDENTITY * r.length_squared() - outer) * mass
    })
}

/// Cross product matrix: `skew(r) * a == r x a`
fn skew(r: DVec3) -> DMat3 {
    DMat3::from_cols(
        DVec3::new(0.0, r.z, -r.y),
        DVec3::new(-r.z, 0.0, r.x),
        DVec3::new(r.y, -r.x, 0.0),
    )
}

/// Impulse at `offset` from the centre that changes the velocity there by `dv`
fn apply_contact_impulse(body: &mut RigidBodyState, offset: DVec3, dv: DVec3) {
    let inertia = body.inertia_world();
    if inertia.determinant().abs() <= 1e-12 {
        body.velocity += dv;
        return;
    }
    let inv = inertia.inverse();
    let s = skew(offset);
    // K J = dv with K = I / M - S I^-1 S
    let k = DMat3::IDENTITY * (1.0 / body.mass) - s * inv * s;
    if k.determinant().abs() <= 1e-12 {
        body.velocity += dv;
        return;
    }
    let impulse = k.inverse() * dv;
    body.velocity += impulse / body.mass;
    body.omega += inv * offset.cross(impulse);
}

/// A set of identical rigid bodies and their member particles
#[derive(Debug, Clone)]
pub struct RigidGroup {
    pub name: String,
    template: Vec<DVec3>,
    particle_mass: f64,
    pub bodies: Vec<RigidBodyState>,
    /// Body `b` owns particles `b * n .. (b + 1) * n`, `n` the template size
    pub particles: ParticleSet,
}

impl RigidGroup {
    /// The template is re-centred on its centroid
    pub fn new(name: impl Into<String>, template: Vec<DVec3>, particle_mass: f64) -> Result<Self> {
        let name = name.into();
        if template.is_empty() {
            return config_err(format!("rigid group '{name}': empty template"));
        }
        if !(particle_mass.is_finite() && particle_mass > 0.0) {
            return config_err(format!("rigid group '{name}': particle mass must be positive"));
        }
        let centroid = template.iter().copied().sum::<DVec3>() / template.len() as f64;
        let template = template.into_iter().map(|r| r - centroid).collect();
        Ok(Self {
            particles: ParticleSet::new(name.clone()),
            name,
            template,
            particle_mass,
            bodies: Vec::new(),
        })
    }

    pub fn template(&self) -> &[DVec3] {
        &self.template
    }

    pub fn body_mass(&self) -> f64 {
        self.particle_mass * self.template.len() as f64
    }

    /// Add a body and its particles; returns the body index
    pub fn add_body(&mut self, com: DVec3, orientation: DQuat, velocity: DVec3, omega: DVec3) -> usize {
        let body = RigidBodyState {
            com,
            velocity,
            orientation: orientation.normalize(),
            omega,
            mass: self.body_mass(),
            inertia: inertia_tensor(&self.template, self.particle_mass),
        };
        for &r in &self.template {
            let offset = body.orientation * r;
            self.particles.push(Particle::new(
                com + offset,
                velocity + omega.cross(offset),
                self.particle_mass,
            ));
        }
        self.bodies.push(body);
        self.bodies.len() - 1
    }

    /// Rebuild member positions and velocities from the body states
    pub fn sync_particles(&mut self) {
        let n = self.template.len();
        for (b, body) in self.bodies.iter().enumerate() {
            for (k, &r) in self.template.iter().enumerate() {
                let offset = body.orientation * r;
                let p = &mut self.particles.particles[b * n + k];
                p.position = body.com + offset;
                p.velocity = body.velocity + body.omega.cross(offset);
            }
        }
    }

    /// Drop every body with a member rejected by `keep`; returns the number of removed particles
    pub fn retain_bodies<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&Particle) -> bool,
    {
        let n = self.template.len();
        let before = self.particles.len();
        let kept: Vec<bool> = self.particles.particles.chunks(n).map(|c| c.iter().all(&keep)).collect();
        let mut flags = kept.iter().copied();
        self.bodies.retain(|_| flags.next().unwrap_or(true));
        let mut idx = 0;
        self.particles.particles.retain(|_| {
            let k = kept[idx / n];
            idx += 1;
            k
        });
        before - self.particles.len()
    }

    /// Fold corrections made to member particles back into the bodies.
    ///
    /// `before` holds the members as they were before the correction. Every
    /// changed member asks for its corrected velocity at its contact point;
    /// the body gets the impulse that delivers it. The body is also shifted by
    /// its largest member displacement, then members are rebuilt. Returns the
    /// number of bodies that changed.
    pub fn absorb_member_changes(&mut self, before: &[Particle]) -> Result<usize> {
        if before.len() != self.particles.len() {
            return config_err(format!(
                "rigid group '{}': {} reference particles for {} members",
                self.name,
                before.len(),
                self.particles.len()
            ));
        }
        let n = self.template.len();
        let mut changed = 0;
        for (b, body) in self.bodies.iter_mut().enumerate() {
            let members = &self.particles.particles[b * n..(b + 1) * n];
            let mut shift = DVec3::ZERO;
            let mut touched = false;
            for ((old, new), &r) in before[b * n..(b + 1) * n].iter().zip(members).zip(&self.template) {
                if old.position == new.position && old.velocity == new.velocity {
                    continue;
                }
                touched = true;
                let dx = new.position - old.position;
                if dx.length_squared() > shift.length_squared() {
                    shift = dx;
                }
                let offset = body.orientation * r;
                let dv = new.velocity - (body.velocity + body.omega.cross(offset));
                apply_contact_impulse(body, offset, dv);
            }
            if touched {
                changed += 1;
                body.com += shift;
            }
        }
        self.sync_particles();
        Ok(changed)
    }

    /// Wrap body centres into the box, then member positions
    pub fn wrap(&mut self, domain: &Domain) {
        for body in self.bodies.iter_mut() {
            body.com = domain.wrap(body.com);
        }
        self.sync_particles();
        domain.wrap_particles(&mut self.particles);
    }

    /// Net force and torque about the centre of mass for every body
    pub fn body_force_torque(&self, forces: &[DVec3]) -> Result<Vec<(DVec3, DVec3)>> {
        if forces.len() != self.particles.len() {
            return config_err(format!(
                "rigid group '{}': {} forces for {} particles",
                self.name,
                forces.len(),
                self.particles.len()
            ));
        }
        let n = self.template.len();
        Ok(self
            .bodies
            .iter()
            .enumerate()
            .map(|(b, body)| {
                self.template
                    .iter()
                    .zip(&forces[b * n..(b + 1) * n])
                    .fold((DVec3::ZERO, DVec3::ZERO), |(f, tau), (&r, &fk)| {
                        (f + fk, tau + (body.orientation * r).cross(fk))
                    })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn dumbbell() -> RigidGroup {
        RigidGroup::new("rod", vec![DVec3::new(-1.0, 0.0, 0.0), DVec3::new(1.0, 0.0, 0.0)], 1.0).unwrap()
    }

    #[test]
    fn test_inertia_of_dumbbell() {
        let i = inertia_tensor(&[DVec3::new(-1.0, 0.0, 0.0), DVec3::new(1.0, 0.0, 0.0)], 2.0);
        assert_relative_eq!(i.x_axis.x, 0.0);
        assert_relative_eq!(i.y_axis.y, 4.0);
        assert_relative_eq!(i.z_axis.z, 4.0);
    }

    #[test]
    fn test_template_is_recentred() {
        let g = RigidGroup::new("g", vec![DVec3::new(1.0, 1.0, 1.0), DVec3::new(3.0, 1.0, 1.0)], 1.0).unwrap();
        assert_eq!(g.template()[0], DVec3::new(-1.0, 0.0, 0.0));
        assert!(RigidGroup::new("e", Vec::new(), 1.0).is_err());
    }

    #[test]
    fn test_add_body_places_particles() {
        let mut g = dumbbell();
        let q = DQuat::from_rotation_z(FRAC_PI_2);
        g.add_body(DVec3::splat(5.0), q, DVec3::X, DVec3::Z);
        assert_eq!(g.particles.len(), 2);
        let p = g.particles.particles[1].position;
        assert!((p - DVec3::new(5.0, 6.0, 5.0)).length() < 1e-12);
        // v + omega x r = (1, 0, 0) + z x (0, 1, 0)
        let v = g.particles.particles[1].velocity;
        assert!((v - DVec3::new(0.0, 0.0, 0.0)).length() < 1e-12);
    }

    #[test]
    fn test_force_and_torque() {
        let mut g = dumbbell();
        g.add_body(DVec3::ZERO, DQuat::IDENTITY, DVec3::ZERO, DVec3::ZERO);
        let forces = [DVec3::new(0.0, -1.0, 0.0), DVec3::new(0.0, 1.0, 0.0)];
        let ft = g.body_force_torque(&forces).unwrap();
        assert_eq!(ft[0].0, DVec3::ZERO);
        assert!((ft[0].1 - DVec3::new(0.0, 0.0, 2.0)).length() < 1e-12);
        assert!(g.body_force_torque(&forces[..1]).is_err());
    }

    #[test]
    fn test_retain_bodies_drops_whole_bodies() {
        let mut g = dumbbell();
        g.add_body(DVec3::new(5.0, 0.0, 0.0), DQuat::IDENTITY, DVec3::ZERO, DVec3::ZERO);
        g.add_body(DVec3::new(0.5, 0.0, 0.0), DQuat::IDENTITY, DVec3::ZERO, DVec3::ZERO);
        // Second body has a member at x = -0.5
        let removed = g.retain_bodies(|p| p.position.x >= 0.0);
        assert_eq!(removed, 2);
        assert_eq!(g.bodies.len(), 1);
        assert_eq!(g.particles.len(), 2);
        assert_eq!(g.bodies[0].com, DVec3::new(5.0, 0.0, 0.0));
    }

    #[test]
    fn test_member_bounce_moves_body() {
        let mut g = RigidGroup::new(
            "tri",
            vec![DVec3::new(1.0, 0.0, 0.0), DVec3::new(-0.5, 0.8, 0.0), DVec3::new(-0.5, -0.8, 0.0)],
            1.0,
        )
        .unwrap();
        g.add_body(DVec3::ZERO, DQuat::IDENTITY, DVec3::new(-1.0, 0.0, 0.0), DVec3::ZERO);
        let before = g.particles.particles.clone();

        // Reverse the velocity of every member and push them all by 0.1 along +x
        for p in g.particles.particles.iter_mut() {
            p.velocity = -p.velocity;
            p.position.x += 0.1;
        }
        assert_eq!(g.absorb_member_changes(&before).unwrap(), 1);
        let body = g.bodies[0];
        assert_relative_eq!(body.velocity.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(body.com.x, 0.1, epsilon = 1e-12);
        assert!(body.omega.length() < 1e-12);
        // Members follow the body again
        assert_relative_eq!(g.particles.particles[0].position.x, 1.1, epsilon = 1e-12);

        let settled = g.particles.particles.clone();
        assert_eq!(g.absorb_member_changes(&settled).unwrap(), 0);
        assert!(g.absorb_member_changes(&before[..1]).is_err());
    }

    #[test]
    fn test_off_centre_contact_spins_body() {
        let mut g = RigidGroup::new(
            "tri",
            vec![DVec3::new(1.0, 0.0, 0.0), DVec3::new(-0.5, 0.8, 0.0), DVec3::new(-0.5, -0.8, 0.0)],
            1.0,
        )
        .unwrap();
        g.add_body(DVec3::ZERO, DQuat::IDENTITY, DVec3::ZERO, DVec3::ZERO);
        let before = g.particles.particles.clone();
        g.particles.particles[0].velocity = DVec3::Y;
        g.absorb_member_changes(&before).unwrap();

        let body = g.bodies[0];
        // The contact point moves as requested
        let v0 = body.velocity + body.omega.cross(DVec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(v0.y, 1.0, epsilon = 1e-9);
        assert!(body.omega.z > 0.0);
        // Linear and angular parts come from one impulse
        let impulse = body.velocity * body.mass;
        let l = body.angular_momentum();
        assert_relative_eq!(l.z, DVec3::new(1.0, 0.0, 0.0).cross(impulse).z, epsilon = 1e-9);
    }

    #[test]
    fn test_wrap_moves_body_centres() {
        let domain = Domain::new(DVec3::ZERO, DVec3::splat(4.0));
        let mut g = dumbbell();
        g.add_body(DVec3::new(4.5, 2.0, 2.0), DQuat::IDENTITY, DVec3::ZERO, DVec3::ZERO);
        g.wrap(&domain);
        assert_relative_eq!(g.bodies[0].com.x, 0.5, epsilon = 1e-12);
        assert!(g.particles.particles.iter().all(|p| domain.contains(p.position)));
    }

    #[test]
    fn test_world_inertia_follows_orientation() {
        let mut g = dumbbell();
        g.add_body(DVec3::ZERO, DQuat::from_rotation_z(FRAC_PI_2), DVec3::ZERO, DVec3::ZERO);
        let iw = g.bodies[0].inertia_world();
        // Rod now lies along y
        assert_relative_eq!(iw.y_axis.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(iw.x_axis.x, 2.0, epsilon = 1e-12);
    }
}
