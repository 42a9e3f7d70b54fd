//! Particle records and particle sets
//!
//! Particle order is stable within a step: integrators and the boundary
//! enforcer address particles by index into `ParticleSet::particles`.

use glam::DVec3;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use super::domain::Domain;

/// Per-particle state flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleFlags {
    /// Excluded from integration; acts only as a static force source
    pub frozen: bool,
    /// Was found inside a wall and projected back to its surface
    #[serde(default)]
    pub rescued: bool,
}

/// A single particle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub position: DVec3,
    pub velocity: DVec3,
    pub mass: f64,
    #[serde(default)]
    pub flags: ParticleFlags,
}

impl Particle {
    pub fn new(position: DVec3, velocity: DVec3, mass: f64) -> Self {
        Self {
            position,
            velocity,
            mass,
            flags: ParticleFlags::default(),
        }
    }

    #[inline]
    pub fn is_mobile(&self) -> bool {
        !self.flags.frozen
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        crate::is_finite_vec(self.position) && crate::is_finite_vec(self.velocity)
    }

    /// Kinetic energy: 0.5 * m * v^2
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.velocity.length_squared()
    }
}

/// Named, ordered collection of particles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticleSet {
    pub name: String,
    pub particles: Vec<Particle>,
}

impl ParticleSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            particles: Vec::new(),
        }
    }

    /// Uniform random initial condition: `round(density * volume)` candidates
    /// spread over the domain, of which those accepted by `keep` are retained.
    pub fn uniform<F>(name: impl Into<String>, density: f64, mass: f64, domain: &Domain, seed: u64, keep: F) -> Self
    where
        F: Fn(DVec3) -> bool,
    {
        let mut rng = Pcg32::seed_from_u64(seed);
        let count = (density * domain.volume()).round().max(0.0) as usize;

        let mut set = Self::new(name);
        set.particles.reserve(count);
        for _ in 0..count {
            let r = DVec3::new(rng.random::<f64>(), rng.random::<f64>(), rng.random::<f64>());
            let p = domain.lo + r * domain.extents;
            if keep(p) {
                set.particles.push(Particle::new(p, DVec3::ZERO, mass));
            }
        }
        set
    }

    pub fn push(&mut self, particle: Particle) {
        self.particles.push(particle);
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn positions(&self) -> Vec<DVec3> {
        self.particles.iter().map(|p| p.position).collect()
    }

    pub fn mobile_count(&self) -> usize {
        self.particles.iter().filter(|p| p.is_mobile()).count()
    }

    pub fn frozen_count(&self) -> usize {
        self.particles.len() - self.mobile_count()
    }

    /// Zero every velocity and mark every particle frozen
    pub fn freeze(&mut self) {
        for p in self.particles.iter_mut() {
            p.velocity = DVec3::ZERO;
            p.flags.frozen = true;
        }
    }

    /// Indices of particles whose position or velocity is not finite
    pub fn non_finite(&self) -> Vec<usize> {
        self.particles
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_finite())
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of particles inside the axis-aligned region `[lo, hi)`
    pub fn count_in(&self, lo: DVec3, hi: DVec3) -> usize {
        self.particles
            .iter()
            .filter(|p| p.position.cmpge(lo).all() && p.position.cmplt(hi).all())
            .count()
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.particles.iter().map(|p| p.kinetic_energy()).sum()
    }

    /// Mass-weighted mean velocity of the mobile particles
    pub fn mean_velocity(&self) -> DVec3 {
        let (momentum, mass) = self
            .particles
            .iter()
            .filter(|p| p.is_mobile())
            .fold((DVec3::ZERO, 0.0), |(m, total), p| (m + p.mass * p.velocity, total + p.mass));
        if mass > 0.0 { momentum / mass } else { DVec3::ZERO }
    }
}
