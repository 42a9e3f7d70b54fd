//! Frozen wall particles
//!
//! Walls exert no forces of their own. To give the solvent something to
//! interact with, bulk fluid is equilibrated over the whole box and the layer
//! on the domain side of the walls, `-thickness <= sd <= 0`, is cut out of it
//! and frozen in place.

use glam::DVec3;
use serde::{Deserialize, Serialize};

use super::bounce::BoundaryEnforcer;
use super::domain::{Decomposition, Domain};
use super::integrator::Integrator;
use super::interaction::Interaction;
use super::particles::ParticleSet;
use super::wall::{Surface, Wall};
use crate::consts::DEFAULT_EQUILIBRATION_STEPS;
use crate::error::{Result, config_err};

fn default_equilibration_steps() -> usize {
    DEFAULT_EQUILIBRATION_STEPS
}

fn default_mass() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrozenParams {
    /// Number density of the generated layer
    pub density: f64,
    /// Layer thickness; the interaction cutoff when unset
    #[serde(default)]
    pub thickness: Option<f64>,
    #[serde(default = "default_equilibration_steps")]
    pub equilibration_steps: usize,
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default)]
    pub seed: u64,
}

impl Default for FrozenParams {
    fn default() -> Self {
        Self {
            density: 4.0,
            thickness: None,
            equilibration_steps: DEFAULT_EQUILIBRATION_STEPS,
            mass: 1.0,
            seed: 0,
        }
    }
}

/// Distance to the union of the walls: `max_w sd_w(p, t)`
pub fn combined_distance(walls: &[Wall], p: DVec3, t: f64) -> f64 {
    walls
        .iter()
        .map(|w| w.signed_distance(p, t))
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Faces of the non-periodic domain axes, seen as walls from inside the box
struct DomainFaces {
    domain: Domain,
}

impl DomainFaces {
    /// Largest outward overshoot and the axis direction it happens along
    fn overshoot(&self, p: DVec3) -> (f64, DVec3) {
        let (lo, hi) = (self.domain.lo, self.domain.hi());
        let mut best = (f64::NEG_INFINITY, DVec3::ZERO);
        for a in 0..3 {
            if self.domain.periodic[a] {
                continue;
            }
            let mut axis = DVec3::ZERO;
            axis[a] = 1.0;
            if lo[a] - p[a] > best.0 {
                best = (lo[a] - p[a], -axis);
            }
            if p[a] - hi[a] > best.0 {
                best = (p[a] - hi[a], axis);
            }
        }
        best
    }
}

impl Surface for DomainFaces {
    fn signed_distance(&self, p: DVec3, _t: f64) -> f64 {
        self.overshoot(p).0
    }

    fn normal(&self, p: DVec3, _t: f64) -> DVec3 {
        self.overshoot(p).1
    }

    fn surface_velocity(&self, _p: DVec3, _t: f64) -> DVec3 {
        DVec3::ZERO
    }
}

/// Produces a frozen particle layer for a set of walls
pub struct FrozenGenerator<'a> {
    walls: &'a [Wall],
    interaction: &'a dyn Interaction,
    integrator: &'a Integrator,
    domain: Domain,
    params: FrozenParams,
}

impl<'a> FrozenGenerator<'a> {
    pub fn new(
        walls: &'a [Wall],
        interaction: &'a dyn Interaction,
        integrator: &'a Integrator,
        domain: Domain,
        params: FrozenParams,
    ) -> Result<Self> {
        if !(params.density.is_finite() && params.density > 0.0) {
            return config_err(format!("frozen particles: density must be positive, got {}", params.density));
        }
        if walls.is_empty() {
            return config_err("frozen particles: no walls given");
        }
        if integrator.is_rigid() {
            return config_err(format!(
                "frozen particles: integrator '{}' is for rigid bodies",
                integrator.name()
            ));
        }
        if !(params.mass.is_finite() && params.mass > 0.0) {
            return config_err(format!("frozen particles: mass must be positive, got {}", params.mass));
        }
        let generator = Self {
            walls,
            interaction,
            integrator,
            domain,
            params,
        };
        let thickness = generator.thickness();
        if !(thickness.is_finite() && thickness > 0.0) {
            return config_err(format!("frozen particles: thickness must be positive, got {thickness}"));
        }
        Ok(generator)
    }

    pub fn thickness(&self) -> f64 {
        self.params.thickness.unwrap_or_else(|| self.interaction.cutoff())
    }

    /// Seed, equilibrate, cut and freeze; returns the rank-local layer.
    ///
    /// The whole box is equilibrated as bulk fluid, ignoring the walls, so the
    /// layer cut out of it carries bulk structure right up to the surface.
    pub fn generate(&self, name: &str, decomposition: &dyn Decomposition) -> Result<ParticleSet> {
        let thickness = self.thickness();
        let walls = self.walls;

        let mut set = ParticleSet::uniform(
            name,
            self.params.density,
            self.params.mass,
            &self.domain,
            self.params.seed,
            |_| true,
        );
        log::info!(
            "Frozen '{}': {} bulk particles, equilibrating for {} steps",
            name,
            set.len(),
            self.params.equilibration_steps
        );

        let faces = [DomainFaces { domain: self.domain }];
        let confined = !self.domain.periodic.iter().all(|&p| p);
        let enforcer = BoundaryEnforcer::default();
        let dt = self.integrator.dt();
        for step in 0..self.params.equilibration_steps {
            let prev = set.positions();
            let forces = self.interaction.compute_forces(&set, &self.domain);
            self.integrator.step(&mut set, &forces, step as f64 * dt, &self.domain)?;
            if confined {
                enforcer.apply(&mut set, &prev, &faces, 0.0)?;
            }
            self.domain.wrap_particles(&mut set);
        }

        // Walls are cut at their t = 0 configuration
        set.particles.retain(|p| {
            let d = combined_distance(walls, p.position, 0.0);
            (-thickness..=0.0).contains(&d)
        });
        set.freeze();
        let local = decomposition.local_subset(&set);
        log::info!("Frozen '{}': kept {} particles ({} local)", name, set.len(), local.len());
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::domain::SingleRank;
    use crate::sim::interaction::{Dpd, DpdParams};
    use crate::sim::wall::count_particles_inside;

    fn plates(domain: &Domain) -> Vec<Wall> {
        vec![
            Wall::plane("bottom", -DVec3::Z, DVec3::new(0.0, 0.0, 1.0)).unwrap(),
            Wall::plane("top", DVec3::Z, DVec3::new(0.0, 0.0, domain.extents.z - 1.0)).unwrap(),
        ]
    }

    /// Number density of frozen particles with `lo <= sd <= hi` on two plates of area `area`
    fn band_density(frozen: &ParticleSet, walls: &[Wall], lo: f64, hi: f64, area: f64) -> f64 {
        let n = frozen
            .particles
            .iter()
            .filter(|p| (lo..=hi).contains(&combined_distance(walls, p.position, 0.0)))
            .count();
        n as f64 / (2.0 * area * (hi - lo))
    }

    fn plate_layer(extent: f64, steps: usize) -> (Vec<Wall>, ParticleSet) {
        let domain = Domain::new(DVec3::ZERO, DVec3::new(extent, extent, 6.0));
        let walls = plates(&domain);
        let dt = 0.005;
        let dpd = Dpd::new("dpd", DpdParams::default(), dt, 3).unwrap();
        let vv = Integrator::velocity_verlet("vv", dt).unwrap();
        let params = FrozenParams {
            density: 4.0,
            thickness: Some(1.0),
            equilibration_steps: steps,
            seed: 17,
            ..FrozenParams::default()
        };
        let frozen = FrozenGenerator::new(&walls, &dpd, &vv, domain, params)
            .unwrap()
            .generate("wall_particles", &SingleRank::new(domain))
            .unwrap();
        (walls, frozen)
    }

    #[test]
    fn test_plate_layer_density() {
        let (walls, frozen) = plate_layer(16.0, 100);

        let rho = band_density(&frozen, &walls, -1.0, 0.0, 256.0);
        assert!((rho - 4.0).abs() / 4.0 < 0.06, "layer density {rho}");
        assert_eq!(count_particles_inside(&frozen, &walls, 0.0), 0);
        assert_eq!(frozen.frozen_count(), frozen.len());
        assert!(frozen.particles.iter().all(|p| p.velocity == DVec3::ZERO));
        for p in &frozen.particles {
            let d = combined_distance(&walls, p.position, 0.0);
            assert!((-1.0..=0.0).contains(&d));
        }
    }

    #[test]
    fn test_layer_density_holds_with_longer_equilibration() {
        for steps in [0, 100, 300] {
            let (walls, frozen) = plate_layer(12.0, steps);
            let layer = band_density(&frozen, &walls, -1.0, 0.0, 144.0);
            let surface = band_density(&frozen, &walls, -0.5, 0.0, 144.0);
            assert!((layer - 4.0).abs() / 4.0 < 0.07, "{steps} steps: layer density {layer}");
            assert!((surface - 4.0).abs() / 4.0 < 0.1, "{steps} steps: density next to the surface {surface}");
        }
    }

    #[test]
    fn test_non_periodic_axis_confines_bulk() {
        let domain = Domain::new(DVec3::ZERO, DVec3::new(4.0, 4.0, 6.0)).with_periodic([true, true, false]);
        let walls = plates(&domain);
        let dpd = Dpd::new("dpd", DpdParams::default(), 0.005, 1).unwrap();
        let vv = Integrator::velocity_verlet("vv", 0.005).unwrap();
        let params = FrozenParams {
            density: 4.0,
            thickness: Some(1.0),
            equilibration_steps: 50,
            ..FrozenParams::default()
        };
        let frozen = FrozenGenerator::new(&walls, &dpd, &vv, domain, params)
            .unwrap()
            .generate("wall_particles", &SingleRank::new(domain))
            .unwrap();
        // Two layers of 4 x 4 x 1; particles escaping along z would thin them out
        let expected = 4.0 * 16.0 * 2.0;
        let got = frozen.len() as f64;
        assert!((got - expected).abs() / expected < 0.25, "{got} frozen particles");
        assert!(frozen.particles.iter().all(|p| domain.contains(p.position)));
    }

    #[test]
    fn test_sphere_shell_without_equilibration() {
        let domain = Domain::new(DVec3::ZERO, DVec3::splat(4.0));
        let walls = vec![Wall::sphere("ball", DVec3::splat(2.0), 1.0, false).unwrap()];
        let dpd = Dpd::new("dpd", DpdParams::default(), 0.01, 0).unwrap();
        let vv = Integrator::velocity_verlet("vv", 0.01).unwrap();
        let params = FrozenParams {
            density: 8.0,
            thickness: Some(0.5),
            equilibration_steps: 0,
            seed: 5,
            ..FrozenParams::default()
        };
        let frozen = FrozenGenerator::new(&walls, &dpd, &vv, domain, params)
            .unwrap()
            .generate("shell", &SingleRank::new(domain))
            .unwrap();

        let volume = 4.0 / 3.0 * std::f64::consts::PI * (1.5f64.powi(3) - 1.0);
        let expected = 8.0 * volume;
        let got = frozen.len() as f64;
        assert!((got - expected).abs() / expected < 0.3, "{got} vs {expected}");
        for p in &frozen.particles {
            let r = (p.position - DVec3::splat(2.0)).length();
            assert!((1.0..=1.5).contains(&r));
        }
    }

    #[test]
    fn test_default_thickness_is_cutoff() {
        let domain = Domain::new(DVec3::ZERO, DVec3::splat(4.0));
        let walls = plates(&domain);
        let dpd = Dpd::new("dpd", DpdParams { rc: 0.8, ..DpdParams::default() }, 0.01, 0).unwrap();
        let vv = Integrator::velocity_verlet("vv", 0.01).unwrap();
        let g = FrozenGenerator::new(&walls, &dpd, &vv, domain, FrozenParams::default()).unwrap();
        assert_eq!(g.thickness(), 0.8);
    }

    #[test]
    fn test_invalid_setups_rejected() {
        let domain = Domain::new(DVec3::ZERO, DVec3::splat(4.0));
        let walls = plates(&domain);
        let dpd = Dpd::new("dpd", DpdParams::default(), 0.01, 0).unwrap();
        let vv = Integrator::velocity_verlet("vv", 0.01).unwrap();
        let rigid = Integrator::rigid_velocity_verlet("rvv", 0.01).unwrap();

        let bad_density = FrozenParams {
            density: 0.0,
            ..FrozenParams::default()
        };
        assert!(FrozenGenerator::new(&walls, &dpd, &vv, domain, bad_density).is_err());
        assert!(FrozenGenerator::new(&[], &dpd, &vv, domain, FrozenParams::default()).is_err());
        assert!(FrozenGenerator::new(&walls, &dpd, &rigid, domain, FrozenParams::default()).is_err());
        let bad_thickness = FrozenParams {
            thickness: Some(-1.0),
            ..FrozenParams::default()
        };
        assert!(FrozenGenerator::new(&walls, &dpd, &vv, domain, bad_thickness).is_err());
    }

    #[test]
    fn test_params_from_json_defaults() {
        let params: FrozenParams = serde_json::from_str(r#"{"density": 6.0}"#).unwrap();
        assert_eq!(params.density, 6.0);
        assert_eq!(params.thickness, None);
        assert_eq!(params.equilibration_steps, DEFAULT_EQUILIBRATION_STEPS);
        assert_eq!(params.mass, 1.0);
    }
}
