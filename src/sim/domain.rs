//! Simulation box and the domain decomposition seam
//!
//! The core never decides how space is split between ranks. It only needs
//! the global box (for periodic wrapping and the minimum image) and the two
//! services a decomposition provides: the rank-local subset of a particle
//! set and the halo of ghost particles around it.

use glam::DVec3;
use serde::{Deserialize, Serialize};

use super::particles::ParticleSet;
use crate::error::{Result, config_err};

fn all_periodic() -> [bool; 3] {
    [true; 3]
}

/// Global simulation box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    /// Lower corner
    #[serde(default)]
    pub lo: DVec3,
    pub extents: DVec3,
    /// Periodicity per axis
    #[serde(default = "all_periodic")]
    pub periodic: [bool; 3],
}

impl Domain {
    /// Fully periodic box
    pub fn new(lo: DVec3, extents: DVec3) -> Self {
        Self {
            lo,
            extents,
            periodic: all_periodic(),
        }
    }

    pub fn with_periodic(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !crate::is_finite_vec(self.lo) || !crate::is_finite_vec(self.extents) || !self.extents.cmpgt(DVec3::ZERO).all() {
            return config_err(format!("domain extents must be positive, got {}", self.extents));
        }
        Ok(())
    }

    #[inline]
    pub fn hi(&self) -> DVec3 {
        self.lo + self.extents
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.extents.x * self.extents.y * self.extents.z
    }

    /// Half-open containment test, `lo <= p < hi`
    pub fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.lo).all() && p.cmplt(self.hi()).all()
    }

    /// Map a position back into the box along periodic axes
    pub fn wrap(&self, mut p: DVec3) -> DVec3 {
        for a in 0..3 {
            if !self.periodic[a] {
                continue;
            }
            let len = self.extents[a];
            let mut r = (p[a] - self.lo[a]).rem_euclid(len);
            if r >= len {
                r = 0.0;
            }
            p[a] = self.lo[a] + r;
        }
        p
    }

    /// Apply minimum image convention along periodic axes
    pub fn minimum_image(&self, mut dr: DVec3) -> DVec3 {
        for a in 0..3 {
            if !self.periodic[a] {
                continue;
            }
            let len = self.extents[a];
            if dr[a] > 0.5 * len {
                dr[a] -= len;
            } else if dr[a] < -0.5 * len {
                dr[a] += len;
            }
        }
        dr
    }

    pub fn wrap_particles(&self, set: &mut ParticleSet) {
        for p in set.particles.iter_mut() {
            p.position = self.wrap(p.position);
        }
    }
}

/// Services provided by the (external) domain decomposition
pub trait Decomposition: Send + Sync {
    /// Particles owned by this rank
    fn local_subset(&self, set: &ParticleSet) -> ParticleSet;

    /// Ghost copies of particles within `width` of this rank's subdomain.
    ///
    /// Needed by multi-rank decompositions only. On a single rank the halo
    /// holds periodic images, which interactions already reach through the
    /// minimum image; the driver and the frozen generator never add it as a
    /// force source.
    fn exchange_halo(&self, set: &ParticleSet, width: f64) -> ParticleSet;
}

/// Decomposition for a single rank owning the whole box
#[derive(Debug, Clone)]
pub struct SingleRank {
    domain: Domain,
}

impl SingleRank {
    pub fn new(domain: Domain) -> Self {
        Self { domain }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }
}

impl Decomposition for SingleRank {
    fn local_subset(&self, set: &ParticleSet) -> ParticleSet {
        let mut local = ParticleSet::new(set.name.clone());
        local.particles = set
            .particles
            .iter()
            .filter(|p| self.domain.contains(p.position))
            .cloned()
            .collect();
        local
    }

    /// The only halo a single rank has is its own periodic images
    fn exchange_halo(&self, set: &ParticleSet, width: f64) -> ParticleSet {
        let d = &self.domain;
        let lo = d.lo - DVec3::splat(width);
        let hi = d.hi() + DVec3::splat(width);
        let shifts = |a: usize| -> &'static [i32] { if d.periodic[a] { &[-1, 0, 1] } else { &[0] } };

        let mut halo = ParticleSet::new(format!("{}_halo", set.name));
        for p in &set.particles {
            for &sx in shifts(0) {
                for &sy in shifts(1) {
                    for &sz in shifts(2) {
                        if sx == 0 && sy == 0 && sz == 0 {
                            continue;
                        }
                        let shift = DVec3::new(sx as f64, sy as f64, sz as f64) * d.extents;
                        let image = p.position + shift;
                        if image.cmpge(lo).all() && image.cmplt(hi).all() {
                            let mut ghost = p.clone();
                            ghost.position = image;
                            halo.particles.push(ghost);
                        }
                    }
                }
            }
        }
        halo
    }
}
