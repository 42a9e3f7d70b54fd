//! JSON simulation setup
//!
//! A `SimulationConfig` names walls, interactions and integrators, then
//! wires them to particle vectors by name. `build` turns it into a ready
//! `Simulation`; the default is a two-plate Poiseuille channel.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{DQuat, DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_SDF_SPACING;
use crate::error::{Result, config_err};
use crate::sim::{
    Axis, BounceMode, BoundaryEnforcer, Domain, Dpd, DpdParams, FrozenParams, Integrator, Interaction,
    JsonLinesSink, MembraneSprings, ParticleSet, RigidGroup, Simulation, Wall, WallRepulsion,
};

fn default_sdf_spacing() -> f64 {
    DEFAULT_SDF_SPACING
}

fn default_mass() -> f64 {
    1.0
}

fn default_power() -> f64 {
    1.0
}

fn default_dump_every() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WallConfig {
    Plane {
        name: String,
        normal: DVec3,
        point: DVec3,
    },
    MovingPlane {
        name: String,
        normal: DVec3,
        point: DVec3,
        velocity: DVec3,
    },
    OscillatingPlane {
        name: String,
        normal: DVec3,
        point: DVec3,
        velocity: DVec3,
        /// In time units, not steps: `n` steps is `n * dt`
        period: f64,
    },
    Box {
        name: String,
        low: DVec3,
        high: DVec3,
        #[serde(default)]
        inside: bool,
    },
    Cylinder {
        name: String,
        center: DVec2,
        radius: f64,
        axis: Axis,
        #[serde(default)]
        inside: bool,
    },
    RotatingCylinder {
        name: String,
        center: DVec2,
        radius: f64,
        axis: Axis,
        omega: f64,
        #[serde(default)]
        inside: bool,
    },
    Sphere {
        name: String,
        center: DVec3,
        radius: f64,
        #[serde(default)]
        inside: bool,
    },
    Sdf {
        name: String,
        path: PathBuf,
        #[serde(default = "default_sdf_spacing")]
        spacing: f64,
    },
}

impl WallConfig {
    pub fn name(&self) -> &str {
        match self {
            WallConfig::Plane { name, .. }
            | WallConfig::MovingPlane { name, .. }
            | WallConfig::OscillatingPlane { name, .. }
            | WallConfig::Box { name, .. }
            | WallConfig::Cylinder { name, .. }
            | WallConfig::RotatingCylinder { name, .. }
            | WallConfig::Sphere { name, .. }
            | WallConfig::Sdf { name, .. } => name,
        }
    }

    pub fn build(&self) -> Result<Wall> {
        match self {
            WallConfig::Plane { name, normal, point } => Wall::plane(name.as_str(), *normal, *point),
            WallConfig::MovingPlane {
                name,
                normal,
                point,
                velocity,
            } => Wall::moving_plane(name.as_str(), *normal, *point, *velocity),
            WallConfig::OscillatingPlane {
                name,
                normal,
                point,
                velocity,
                period,
            } => Wall::oscillating_plane(name.as_str(), *normal, *point, *velocity, *period),
            WallConfig::Box { name, low, high, inside } => Wall::box_wall(name.as_str(), *low, *high, *inside),
            WallConfig::Cylinder {
                name,
                center,
                radius,
                axis,
                inside,
            } => Wall::cylinder(name.as_str(), *center, *radius, *axis, *inside),
            WallConfig::RotatingCylinder {
                name,
                center,
                radius,
                axis,
                omega,
                inside,
            } => Wall::rotating_cylinder(name.as_str(), *center, *radius, *axis, *omega, *inside),
            WallConfig::Sphere {
                name,
                center,
                radius,
                inside,
            } => Wall::sphere(name.as_str(), *center, *radius, *inside),
            WallConfig::Sdf { name, path, spacing } => Wall::sdf(name.as_str(), path, DVec3::splat(*spacing)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionConfig {
    Dpd {
        name: String,
        rc: f64,
        a: f64,
        gamma: f64,
        kbt: f64,
        #[serde(default = "default_power")]
        power: f64,
    },
    MembraneSprings {
        name: String,
        bonds: Vec<(usize, usize)>,
        k: f64,
        r0: f64,
    },
}

impl InteractionConfig {
    pub fn name(&self) -> &str {
        match self {
            InteractionConfig::Dpd { name, .. } | InteractionConfig::MembraneSprings { name, .. } => name,
        }
    }

    pub fn build(&self, dt: f64, seed: u64) -> Result<Arc<dyn Interaction>> {
        let interaction: Arc<dyn Interaction> = match self {
            InteractionConfig::Dpd {
                name,
                rc,
                a,
                gamma,
                kbt,
                power,
            } => {
                let params = DpdParams {
                    rc: *rc,
                    a: *a,
                    gamma: *gamma,
                    kbt: *kbt,
                    power: *power,
                };
                Arc::new(Dpd::new(name.as_str(), params, dt, seed)?)
            }
            InteractionConfig::MembraneSprings { name, bonds, k, r0 } => {
                Arc::new(MembraneSprings::new(name.as_str(), bonds.clone(), *k, *r0)?)
            }
        };
        Ok(interaction)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegratorConfig {
    VelocityVerlet { name: String },
    ConstForce { name: String, force: DVec3 },
    PeriodicForce { name: String, force: f64, direction: Axis },
    Translate { name: String, velocity: DVec3 },
    Rotate { name: String, center: DVec3, omega: DVec3 },
    /// Period in time units
    Oscillate { name: String, velocity: DVec3, period: f64 },
    /// `fast` names a registered membrane interaction
    SubStepMembrane { name: String, substeps: u32, fast: String },
    /// For rigid groups only
    RigidVelocityVerlet { name: String },
}

impl IntegratorConfig {
    pub fn name(&self) -> &str {
        match self {
            IntegratorConfig::VelocityVerlet { name }
            | IntegratorConfig::ConstForce { name, .. }
            | IntegratorConfig::PeriodicForce { name, .. }
            | IntegratorConfig::Translate { name, .. }
            | IntegratorConfig::Rotate { name, .. }
            | IntegratorConfig::Oscillate { name, .. }
            | IntegratorConfig::SubStepMembrane { name, .. }
            | IntegratorConfig::RigidVelocityVerlet { name } => name,
        }
    }

    pub fn build(&self, dt: f64, interactions: &HashMap<String, Arc<dyn Interaction>>) -> Result<Integrator> {
        let name = self.name();
        match self {
            IntegratorConfig::VelocityVerlet { .. } => Integrator::velocity_verlet(name, dt),
            IntegratorConfig::ConstForce { force, .. } => Integrator::const_force(name, dt, *force),
            IntegratorConfig::PeriodicForce { force, direction, .. } => {
                Integrator::periodic_force(name, dt, *force, *direction)
            }
            IntegratorConfig::Translate { velocity, .. } => Integrator::translate(name, dt, *velocity),
            IntegratorConfig::Rotate { center, omega, .. } => Integrator::rotate(name, dt, *center, *omega),
            IntegratorConfig::Oscillate { velocity, period, .. } => Integrator::oscillate(name, dt, *velocity, *period),
            IntegratorConfig::SubStepMembrane { substeps, fast, .. } => match interactions.get(fast) {
                Some(fast) => Integrator::sub_step_membrane(name, dt, *substeps, fast.clone()),
                None => config_err(format!("integrator '{name}': no interaction named '{fast}'")),
            },
            IntegratorConfig::RigidVelocityVerlet { .. } => Integrator::rigid_velocity_verlet(name, dt),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub interaction: String,
    /// Source vector; the vector itself when absent
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepulsionConfig {
    pub wall: String,
    pub c: f64,
    pub h: f64,
    pub max_force: f64,
}

/// A particle vector filled uniformly at `density`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    pub name: String,
    pub density: f64,
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default)]
    pub integrator: Option<String>,
    #[serde(default)]
    pub walls: Vec<String>,
    #[serde(default)]
    pub interactions: Vec<BindingConfig>,
    #[serde(default)]
    pub repulsion: Vec<RepulsionConfig>,
}

fn identity() -> DQuat {
    DQuat::IDENTITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidBodyConfig {
    pub com: DVec3,
    #[serde(default)]
    pub velocity: DVec3,
    /// `[x, y, z, w]`
    #[serde(default = "identity")]
    pub orientation: DQuat,
    #[serde(default)]
    pub omega: DVec3,
}

/// Identical rigid bodies sharing one particle template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidConfig {
    pub name: String,
    /// Body-frame member offsets, re-centred on their centroid
    pub template: Vec<DVec3>,
    #[serde(default = "default_mass")]
    pub mass: f64,
    pub bodies: Vec<RigidBodyConfig>,
    #[serde(default)]
    pub integrator: Option<String>,
    #[serde(default)]
    pub walls: Vec<String>,
    #[serde(default)]
    pub interactions: Vec<BindingConfig>,
    #[serde(default)]
    pub repulsion: Vec<RepulsionConfig>,
}

impl RigidConfig {
    pub fn build(&self) -> Result<RigidGroup> {
        let mut group = RigidGroup::new(self.name.as_str(), self.template.clone(), self.mass)?;
        for body in &self.bodies {
            group.add_body(body.com, body.orientation, body.velocity, body.omega);
        }
        Ok(group)
    }
}

/// Frozen wall particles generated before the vectors are filled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenConfig {
    pub name: String,
    pub walls: Vec<String>,
    pub interaction: String,
    #[serde(flatten)]
    pub params: FrozenParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpConfig {
    pub path: PathBuf,
    #[serde(default = "default_dump_every")]
    pub every: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub domain: Domain,
    pub dt: f64,
    pub steps: u64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub bounce: BounceMode,
    #[serde(default)]
    pub walls: Vec<WallConfig>,
    #[serde(default)]
    pub interactions: Vec<InteractionConfig>,
    #[serde(default)]
    pub integrators: Vec<IntegratorConfig>,
    #[serde(default)]
    pub frozen: Vec<FrozenConfig>,
    #[serde(default)]
    pub vectors: Vec<VectorConfig>,
    #[serde(default)]
    pub rigid: Vec<RigidConfig>,
    #[serde(default)]
    pub dump: Option<DumpConfig>,
}

impl Default for SimulationConfig {
    /// Pressure-driven flow between two plates at z = 1 and z = Lz - 1
    fn default() -> Self {
        let domain = Domain::new(DVec3::ZERO, DVec3::new(8.0, 16.0, 8.0));
        let plates = vec!["bottom".to_string(), "top".to_string()];
        Self {
            domain,
            dt: 0.001,
            steps: 1000,
            seed: 0,
            bounce: BounceMode::BounceBack,
            walls: vec![
                WallConfig::Plane {
                    name: "bottom".into(),
                    normal: -DVec3::Z,
                    point: DVec3::new(0.0, 0.0, 1.0),
                },
                WallConfig::Plane {
                    name: "top".into(),
                    normal: DVec3::Z,
                    point: DVec3::new(0.0, 0.0, domain.extents.z - 1.0),
                },
            ],
            interactions: vec![InteractionConfig::Dpd {
                name: "dpd".into(),
                rc: 1.0,
                a: 10.0,
                gamma: 50.0,
                kbt: 1.0,
                power: 0.5,
            }],
            integrators: vec![IntegratorConfig::ConstForce {
                name: "push".into(),
                force: DVec3::new(1.0, 0.0, 0.0),
            }],
            frozen: vec![FrozenConfig {
                name: "wall_particles".into(),
                walls: plates.clone(),
                interaction: "dpd".into(),
                params: FrozenParams {
                    density: 4.0,
                    ..FrozenParams::default()
                },
            }],
            vectors: vec![VectorConfig {
                name: "fluid".into(),
                density: 4.0,
                mass: 1.0,
                integrator: Some("push".into()),
                walls: plates,
                interactions: vec![
                    BindingConfig {
                        interaction: "dpd".into(),
                        source: None,
                    },
                    BindingConfig {
                        interaction: "dpd".into(),
                        source: Some("wall_particles".into()),
                    },
                ],
                repulsion: Vec::new(),
            }],
            rigid: Vec::new(),
            dump: None,
        }
    }
}

/// Per-vector bindings shared by particle vectors and rigid groups
struct Wiring<'a> {
    integrator: Option<&'a str>,
    walls: &'a [String],
    interactions: &'a [BindingConfig],
    repulsion: &'a [RepulsionConfig],
}

impl Wiring<'_> {
    fn apply(&self, sim: &mut Simulation, vector: &str, integrators: &HashMap<String, Integrator>) -> Result<()> {
        for wall in self.walls {
            let removed = sim.set_wall(wall, vector)?;
            if removed > 0 {
                log::info!("'{vector}': removed {removed} particles inside wall '{wall}'");
            }
        }
        if let Some(name) = self.integrator {
            match integrators.get(name) {
                Some(integrator) => sim.set_integrator(vector, integrator.clone())?,
                None => return config_err(format!("vector '{vector}': no integrator named '{name}'")),
            }
        }
        for binding in self.interactions {
            sim.set_interaction(&binding.interaction, vector, binding.source.as_deref())?;
        }
        for r in self.repulsion {
            sim.set_wall_repulsion(&r.wall, vector, WallRepulsion::new(r.c, r.h, r.max_force)?)?;
        }
        Ok(())
    }
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Assemble the simulation: walls, interactions, frozen layers, then vectors
    pub fn build(&self) -> Result<Simulation> {
        let mut sim = Simulation::new(self.domain, self.dt)?.with_enforcer(BoundaryEnforcer::new(self.bounce));

        for wall in &self.walls {
            sim.register_wall(wall.build()?)?;
        }

        let mut interactions = HashMap::new();
        for (i, config) in self.interactions.iter().enumerate() {
            let interaction = config.build(self.dt, self.seed.wrapping_add(i as u64))?;
            interactions.insert(config.name().to_string(), interaction.clone());
            sim.register_interaction(interaction)?;
        }

        let mut integrators = HashMap::new();
        for config in &self.integrators {
            integrators.insert(config.name().to_string(), config.build(self.dt, &interactions)?);
        }

        for frozen in &self.frozen {
            let equilibration = Integrator::velocity_verlet(format!("{}_equilibration", frozen.name), self.dt)?;
            let walls: Vec<&str> = frozen.walls.iter().map(String::as_str).collect();
            sim.make_frozen_wall_particles(&frozen.name, &walls, &frozen.interaction, &equilibration, frozen.params)?;
        }

        for (i, vector) in self.vectors.iter().enumerate() {
            let seed = self.seed.wrapping_mul(31).wrapping_add(i as u64 + 1);
            let set = ParticleSet::uniform(vector.name.clone(), vector.density, vector.mass, &self.domain, seed, |_| true);
            sim.add_vector(set)?;
            let wiring = Wiring {
                integrator: vector.integrator.as_deref(),
                walls: &vector.walls,
                interactions: &vector.interactions,
                repulsion: &vector.repulsion,
            };
            wiring.apply(&mut sim, &vector.name, &integrators)?;
        }

        for rigid in &self.rigid {
            sim.add_rigid_group(rigid.build()?)?;
            let wiring = Wiring {
                integrator: rigid.integrator.as_deref(),
                walls: &rigid.walls,
                interactions: &rigid.interactions,
                repulsion: &rigid.repulsion,
            };
            wiring.apply(&mut sim, &rigid.name, &integrators)?;
        }

        if let Some(dump) = &self.dump {
            let file = File::create(&dump.path)?;
            log::info!("Dumping snapshots to {} every {} steps", dump.path.display(), dump.every);
            sim.add_sink(Box::new(JsonLinesSink::new(BufWriter::new(file), dump.every)));
        }
        Ok(sim)
    }
}
