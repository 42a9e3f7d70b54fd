//! Fixed timestep simulation driver
//!
//! Owns the registered walls, interactions and particle sets ("vectors")
//! and advances them deterministically. A vector is either free particles or
//! a rigid group whose members follow their bodies. One step:
//! 1. Forces for every integrated vector (interactions, then wall repulsion)
//! 2. Integrate each vector
//! 3. Bounce against the vector's walls; rigid bodies absorb their members' bounces
//! 4. Wrap periodic axes and look for diverged particles
//! 5. Feed the snapshot sinks

use std::io::Write;
use std::sync::Arc;

use glam::DVec3;
use serde::Serialize;

use super::bounce::BoundaryEnforcer;
use super::domain::{Decomposition, Domain, SingleRank};
use super::frozen::{FrozenGenerator, FrozenParams};
use super::integrator::Integrator;
use super::interaction::{ForceField, Interaction};
use super::particles::{Particle, ParticleSet};
use super::repulsion::WallRepulsion;
use super::rigid::RigidGroup;
use super::wall::{Wall, remove_particles_inside};
use crate::error::{Result, SimError, config_err};

/// Receives particle snapshots during a run
pub trait SnapshotSink {
    fn consume(&mut self, step: u64, time: f64, set: &ParticleSet) -> Result<()>;
}

#[derive(Serialize)]
struct Snapshot<'a> {
    step: u64,
    time: f64,
    vector: &'a str,
    particles: &'a [Particle],
}

/// Writes one JSON object per vector every `every` steps
pub struct JsonLinesSink<W: Write> {
    writer: W,
    every: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W, every: u64) -> Self {
        Self {
            writer,
            every: every.max(1),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> SnapshotSink for JsonLinesSink<W> {
    fn consume(&mut self, step: u64, time: f64, set: &ParticleSet) -> Result<()> {
        if step % self.every != 0 {
            return Ok(());
        }
        let snapshot = Snapshot {
            step,
            time,
            vector: &set.name,
            particles: &set.particles,
        };
        serde_json::to_writer(&mut self.writer, &snapshot)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Outcome of one or more steps
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    pub step: u64,
    pub time: f64,
    /// Particles that crossed a wall and were bounced
    pub bounced: usize,
    /// Particles found inside a wall at the start of a step
    pub rescued: usize,
    /// Vector name and indices of particles with non-finite state
    pub diverged: Vec<(String, Vec<usize>)>,
}

impl StepReport {
    pub fn is_diverged(&self) -> bool {
        !self.diverged.is_empty()
    }

    /// Turn a diverged report into an error
    pub fn check(self) -> Result<Self> {
        match self.diverged.first() {
            Some((vector, indices)) => Err(SimError::NumericalDivergence {
                vector: vector.clone(),
                step: self.step,
                count: indices.len(),
                first: indices.first().copied().unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InteractionBinding {
    interaction: usize,
    /// Vector providing the source particles; `None` for self-interaction
    source: Option<usize>,
}

enum Body {
    Particles(ParticleSet),
    Rigid(RigidGroup),
}

struct Vector {
    body: Body,
    integrator: Option<Integrator>,
    interactions: Vec<InteractionBinding>,
    walls: Vec<usize>,
    repulsions: Vec<(usize, WallRepulsion)>,
}

impl Vector {
    fn new(body: Body) -> Self {
        Self {
            body,
            integrator: None,
            interactions: Vec::new(),
            walls: Vec::new(),
            repulsions: Vec::new(),
        }
    }

    fn set(&self) -> &ParticleSet {
        match &self.body {
            Body::Particles(set) => set,
            Body::Rigid(group) => &group.particles,
        }
    }

    fn set_mut(&mut self) -> &mut ParticleSet {
        match &mut self.body {
            Body::Particles(set) => set,
            Body::Rigid(group) => &mut group.particles,
        }
    }
}

pub struct Simulation {
    domain: Domain,
    dt: f64,
    time: f64,
    step: u64,
    enforcer: BoundaryEnforcer,
    decomposition: Box<dyn Decomposition>,
    walls: Vec<Wall>,
    interactions: Vec<Arc<dyn Interaction>>,
    vectors: Vec<Vector>,
    sinks: Vec<Box<dyn SnapshotSink>>,
}

impl Simulation {
    pub fn new(domain: Domain, dt: f64) -> Result<Self> {
        domain.validate()?;
        if !(dt.is_finite() && dt > 0.0) {
            return config_err(format!("simulation dt must be positive, got {dt}"));
        }
        log::info!("Simulation: box {} at {}, dt = {}", domain.extents, domain.lo, dt);
        Ok(Self {
            domain,
            dt,
            time: 0.0,
            step: 0,
            enforcer: BoundaryEnforcer::default(),
            decomposition: Box::new(SingleRank::new(domain)),
            walls: Vec::new(),
            interactions: Vec::new(),
            vectors: Vec::new(),
            sinks: Vec::new(),
        })
    }

    pub fn with_enforcer(mut self, enforcer: BoundaryEnforcer) -> Self {
        self.enforcer = enforcer;
        self
    }

    pub fn with_decomposition(mut self, decomposition: Box<dyn Decomposition>) -> Self {
        self.decomposition = decomposition;
        self
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step_index(&self) -> u64 {
        self.step
    }

    pub fn walls(&self) -> &[Wall] {
        &self.walls
    }

    /// Particles of a vector; the member particles for a rigid group
    pub fn vector(&self, name: &str) -> Option<&ParticleSet> {
        self.vectors.iter().map(Vector::set).find(|set| set.name == name)
    }

    pub fn vector_mut(&mut self, name: &str) -> Option<&mut ParticleSet> {
        self.vectors.iter_mut().map(Vector::set_mut).find(|set| set.name == name)
    }

    pub fn rigid_group(&self, name: &str) -> Option<&RigidGroup> {
        self.vectors.iter().find_map(|v| match &v.body {
            Body::Rigid(group) if group.name == name => Some(group),
            _ => None,
        })
    }

    pub fn vector_names(&self) -> Vec<&str> {
        self.vectors.iter().map(|v| v.set().name.as_str()).collect()
    }

    fn wall_index(&self, name: &str) -> Result<usize> {
        match self.walls.iter().position(|w| w.name() == name) {
            Some(i) => Ok(i),
            None => config_err(format!("no wall named '{name}'")),
        }
    }

    fn interaction_index(&self, name: &str) -> Result<usize> {
        match self.interactions.iter().position(|i| i.name() == name) {
            Some(i) => Ok(i),
            None => config_err(format!("no interaction named '{name}'")),
        }
    }

    fn vector_index(&self, name: &str) -> Result<usize> {
        match self.vectors.iter().position(|v| v.set().name == name) {
            Some(i) => Ok(i),
            None => config_err(format!("no particle vector named '{name}'")),
        }
    }

    pub fn register_wall(&mut self, wall: Wall) -> Result<()> {
        if self.wall_index(wall.name()).is_ok() {
            return config_err(format!("wall '{}' registered twice", wall.name()));
        }
        log::info!("Registered wall '{}'", wall.name());
        self.walls.push(wall);
        Ok(())
    }

    pub fn register_interaction(&mut self, interaction: Arc<dyn Interaction>) -> Result<()> {
        if self.interaction_index(interaction.name()).is_ok() {
            return config_err(format!("interaction '{}' registered twice", interaction.name()));
        }
        log::info!("Registered interaction '{}' ({:?})", interaction.name(), interaction.kind());
        self.interactions.push(interaction);
        Ok(())
    }

    pub fn add_vector(&mut self, mut set: ParticleSet) -> Result<()> {
        if self.vector_index(&set.name).is_ok() {
            return config_err(format!("particle vector '{}' added twice", set.name));
        }
        self.domain.wrap_particles(&mut set);
        log::info!("Added vector '{}' with {} particles", set.name, set.len());
        self.vectors.push(Vector::new(Body::Particles(set)));
        Ok(())
    }

    /// Add a rigid group as a vector named after the group
    pub fn add_rigid_group(&mut self, mut group: RigidGroup) -> Result<()> {
        if self.vector_index(&group.name).is_ok() {
            return config_err(format!("particle vector '{}' added twice", group.name));
        }
        group.wrap(&self.domain);
        log::info!(
            "Added rigid group '{}' with {} bodies of {} particles",
            group.name,
            group.bodies.len(),
            group.template().len()
        );
        self.vectors.push(Vector::new(Body::Rigid(group)));
        Ok(())
    }

    pub fn set_integrator(&mut self, vector: &str, integrator: Integrator) -> Result<()> {
        if (integrator.dt() - self.dt).abs() > 1e-12 * self.dt {
            return config_err(format!(
                "integrator '{}' has dt {} but the simulation runs with {}",
                integrator.name(),
                integrator.dt(),
                self.dt
            ));
        }
        let v = self.vector_index(vector)?;
        match (&self.vectors[v].body, integrator.is_rigid()) {
            (Body::Particles(_), true) => {
                return config_err(format!(
                    "integrator '{}' advances rigid groups, '{vector}' is a particle vector",
                    integrator.name()
                ));
            }
            (Body::Rigid(_), false) => {
                return config_err(format!(
                    "'{vector}' is a rigid group, integrator '{}' advances free particles",
                    integrator.name()
                ));
            }
            _ => {}
        }
        self.vectors[v].integrator = Some(integrator);
        Ok(())
    }

    /// Forces from `interaction` on `vector`, exerted by `source` (itself when `None`)
    pub fn set_interaction(&mut self, interaction: &str, vector: &str, source: Option<&str>) -> Result<()> {
        let interaction = self.interaction_index(interaction)?;
        let v = self.vector_index(vector)?;
        let source = match source {
            Some(name) => {
                let s = self.vector_index(name)?;
                (s != v).then_some(s)
            }
            None => None,
        };
        self.vectors[v].interactions.push(InteractionBinding { interaction, source });
        Ok(())
    }

    /// Confine `vector` by `wall`; particles already inside the wall are removed.
    ///
    /// A rigid body with any member inside loses all its members.
    pub fn set_wall(&mut self, wall: &str, vector: &str) -> Result<usize> {
        let w = self.wall_index(wall)?;
        let v = self.vector_index(vector)?;
        let (wall, t) = (&self.walls[w], self.time);
        let removed = match &mut self.vectors[v].body {
            Body::Particles(set) => remove_particles_inside(set, std::slice::from_ref(wall), t),
            Body::Rigid(group) => group.retain_bodies(|p| wall.signed_distance(p.position, t) <= 0.0),
        };
        if !self.vectors[v].walls.contains(&w) {
            self.vectors[v].walls.push(w);
        }
        Ok(removed)
    }

    pub fn set_wall_repulsion(&mut self, wall: &str, vector: &str, repulsion: WallRepulsion) -> Result<()> {
        let w = self.wall_index(wall)?;
        let v = self.vector_index(vector)?;
        self.vectors[v].repulsions.push((w, repulsion));
        Ok(())
    }

    /// Generate a frozen layer against `walls` and add it as vector `name`
    pub fn make_frozen_wall_particles(
        &mut self,
        name: &str,
        walls: &[&str],
        interaction: &str,
        integrator: &Integrator,
        params: FrozenParams,
    ) -> Result<usize> {
        let selected = walls
            .iter()
            .map(|w| self.wall_index(w).map(|i| self.walls[i].clone()))
            .collect::<Result<Vec<_>>>()?;
        let interaction = self.interactions[self.interaction_index(interaction)?].clone();
        let generator = FrozenGenerator::new(&selected, interaction.as_ref(), integrator, self.domain, params)?;
        let frozen = generator.generate(name, self.decomposition.as_ref())?;
        let count = frozen.len();
        self.add_vector(frozen)?;
        Ok(count)
    }

    pub fn add_sink(&mut self, sink: Box<dyn SnapshotSink>) {
        self.sinks.push(sink);
    }

    /// Forces on vector `v` at the current state
    fn compute_forces(&self, v: usize) -> Result<ForceField> {
        let vector = &self.vectors[v];
        let set = vector.set();
        let fast = vector.integrator.as_ref().and_then(|i| i.fast_interaction());
        let mut forces = vec![DVec3::ZERO; set.len()];
        for binding in &vector.interactions {
            let interaction = &self.interactions[binding.interaction];
            match binding.source {
                None => {
                    // Sub-stepping integrators evaluate their fast forces themselves
                    if fast.is_some_and(|f| Arc::ptr_eq(f, interaction)) {
                        continue;
                    }
                    let own = interaction.compute_forces(set, &self.domain);
                    for (f, g) in forces.iter_mut().zip(own) {
                        *f += g;
                    }
                }
                Some(s) => interaction.add_cross_forces(&mut forces, set, self.vectors[s].set(), &self.domain),
            }
        }
        for (w, repulsion) in &vector.repulsions {
            repulsion.apply(&mut forces, set, &self.walls[*w], self.time)?;
        }
        Ok(forces)
    }

    /// Advance every integrated vector by one time step
    pub fn step(&mut self) -> Result<StepReport> {
        let t = self.time;
        let forces = (0..self.vectors.len())
            .map(|v| match self.vectors[v].integrator {
                Some(_) => self.compute_forces(v).map(Some),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut report = StepReport::default();
        let t_end = t + self.dt;
        for (vector, forces) in self.vectors.iter_mut().zip(forces) {
            let (Some(integrator), Some(forces)) = (&vector.integrator, forces) else {
                continue;
            };
            let walls: Vec<&Wall> = vector.walls.iter().map(|&w| &self.walls[w]).collect();
            let stats = match &mut vector.body {
                Body::Particles(set) => {
                    let prev = set.positions();
                    integrator.step(set, &forces, t, &self.domain)?;
                    let stats = self.enforcer.apply(set, &prev, &walls, t_end)?;
                    self.domain.wrap_particles(set);
                    stats
                }
                Body::Rigid(group) => {
                    // Members unwrapped around their body centres, so paths stay continuous
                    group.sync_particles();
                    let prev = group.particles.positions();
                    integrator.step_rigid(group, &forces, t)?;
                    let moved = group.particles.particles.clone();
                    let stats = self.enforcer.apply(&mut group.particles, &prev, &walls, t_end)?;
                    if stats.bounced > 0 || !stats.rescued.is_empty() {
                        group.absorb_member_changes(&moved)?;
                    }
                    group.wrap(&self.domain);
                    stats
                }
            };
            report.bounced += stats.bounced;
            report.rescued += stats.rescued.len();

            let set = vector.set();
            let bad = set.non_finite();
            if !bad.is_empty() {
                log::warn!("{} particle(s) of '{}' diverged at step {}", bad.len(), set.name, self.step);
                report.diverged.push((set.name.clone(), bad));
            }
        }

        self.time = t_end;
        self.step += 1;
        report.step = self.step;
        report.time = self.time;

        for sink in self.sinks.iter_mut() {
            for vector in &self.vectors {
                sink.consume(self.step, self.time, vector.set())?;
            }
        }
        Ok(report)
    }

    /// Run `steps` steps, stopping early on divergence; returns the summed report
    pub fn run(&mut self, steps: u64) -> Result<StepReport> {
        let mut total = StepReport {
            step: self.step,
            time: self.time,
            ..StepReport::default()
        };
        for _ in 0..steps {
            let report = self.step()?;
            total.step = report.step;
            total.time = report.time;
            total.bounced += report.bounced;
            total.rescued += report.rescued;
            if report.is_diverged() {
                total.diverged = report.diverged;
                break;
            }
        }
        log::debug!(
            "Ran to step {} (t = {:.4}): {} bounced, {} rescued",
            total.step,
            total.time,
            total.bounced,
            total.rescued
        );
        Ok(total)
    }
}
