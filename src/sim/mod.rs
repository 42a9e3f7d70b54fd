//! Deterministic particle simulation core
//!
//! Everything here is pure and reproducible:
//! - Fixed timestep only
//! - Seeded RNG only
//! - Stable particle order within a step
//! - Walls are immutable once built and shared by reference

pub mod bounce;
pub mod domain;
pub mod field;
pub mod frozen;
pub mod geometry;
pub mod integrator;
pub mod interaction;
pub mod particles;
pub mod repulsion;
pub mod rigid;
pub mod simulation;
pub mod wall;

pub use bounce::{BounceMode, BounceOutcome, BounceStats, BoundaryEnforcer};
pub use domain::{Decomposition, Domain, SingleRank};
pub use field::{Grid, OutOfGridPolicy, SampledField};
pub use frozen::{FrozenGenerator, FrozenParams, combined_distance};
pub use geometry::{Axis, Geometry, Shape, sd_box, sd_cylinder, sd_plane, sd_sphere};
pub use integrator::{Integrator, IntegratorKind};
pub use interaction::{CellList, Dpd, DpdParams, ForceField, Interaction, InteractionKind, MembraneSprings};
pub use particles::{Particle, ParticleFlags, ParticleSet};
pub use repulsion::WallRepulsion;
pub use rigid::{RigidBodyState, RigidGroup};
pub use simulation::{JsonLinesSink, Simulation, SnapshotSink, StepReport};
pub use wall::{Kinematics, Surface, Wall, count_particles_inside, remove_particles_inside};
