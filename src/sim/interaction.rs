//! Particle interactions
//!
//! The integrators only need a force per particle; how those forces come
//! about is behind the `Interaction` trait. Two reference implementations
//! are provided: dissipative particle dynamics (the usual solvent and wall
//! interaction) and harmonic membrane springs (the fast forces sub-stepped
//! by `SubStepMembrane`).

use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;
use rand::Rng;
use rand_pcg::Pcg32;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::domain::Domain;
use super::particles::ParticleSet;
use crate::error::{Result, config_err};

/// One force per particle, same order as the particle set
pub type ForceField = Vec<DVec3>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Short-ranged pair forces found through a cell list
    Pairwise,
    /// Bonded forces within a membrane
    Membrane,
}

pub trait Interaction: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> InteractionKind;

    /// Interaction range; zero for bonded interactions
    fn cutoff(&self) -> f64;

    /// Forces among the particles of `set`
    fn compute_forces(&self, set: &ParticleSet, domain: &Domain) -> ForceField;

    /// Add forces exerted on `dst` by the particles of `src`
    fn add_cross_forces(&self, _forces: &mut ForceField, _dst: &ParticleSet, _src: &ParticleSet, _domain: &Domain) {}
}

impl std::fmt::Debug for dyn Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interaction")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Uniform grid of cells no smaller than the cutoff
#[derive(Debug, Clone)]
pub struct CellList {
    dims: [usize; 3],
    lo: DVec3,
    cell_size: DVec3,
    periodic: [bool; 3],
    cells: Vec<Vec<usize>>,
}

impl CellList {
    pub fn build(positions: &[DVec3], domain: &Domain, cutoff: f64) -> Self {
        let mut dims = [1usize; 3];
        for (a, dim) in dims.iter_mut().enumerate() {
            *dim = ((domain.extents[a] / cutoff).floor() as usize).max(1);
        }
        let cell_size = domain.extents / DVec3::new(dims[0] as f64, dims[1] as f64, dims[2] as f64);
        let mut list = Self {
            dims,
            lo: domain.lo,
            cell_size,
            periodic: domain.periodic,
            cells: vec![Vec::new(); dims[0] * dims[1] * dims[2]],
        };
        for (i, &p) in positions.iter().enumerate() {
            let c = list.flat(list.cell_of(p));
            list.cells[c].push(i);
        }
        list
    }

    /// Cell coordinates, clamped to the grid
    fn cell_of(&self, p: DVec3) -> [usize; 3] {
        let mut c = [0usize; 3];
        for a in 0..3 {
            let f = ((p[a] - self.lo[a]) / self.cell_size[a]).floor();
            c[a] = f.clamp(0.0, (self.dims[a] - 1) as f64) as usize;
        }
        c
    }

    #[inline]
    fn flat(&self, c: [usize; 3]) -> usize {
        (c[2] * self.dims[1] + c[1]) * self.dims[0] + c[0]
    }

    /// Flat indices of the distinct cells adjacent to `c`, `c` included
    fn neighbors(&self, c: [usize; 3]) -> Vec<usize> {
        let mut axis_cells: [Vec<usize>; 3] = Default::default();
        for a in 0..3 {
            let n = self.dims[a] as i64;
            for d in -1i64..=1 {
                let mut k = c[a] as i64 + d;
                if k < 0 || k >= n {
                    if !self.periodic[a] {
                        continue;
                    }
                    k = k.rem_euclid(n);
                }
                if !axis_cells[a].contains(&(k as usize)) {
                    axis_cells[a].push(k as usize);
                }
            }
        }
        let mut out = Vec::with_capacity(27);
        for &k in &axis_cells[2] {
            for &j in &axis_cells[1] {
                for &i in &axis_cells[0] {
                    out.push(self.flat([i, j, k]));
                }
            }
        }
        out
    }

    /// Unordered pairs `(i, j, x_i - x_j)` with `i < j` closer than `cutoff`
    pub fn pairs(&self, positions: &[DVec3], domain: &Domain, cutoff: f64) -> Vec<(usize, usize, DVec3)> {
        let rc2 = cutoff * cutoff;
        let mut out = Vec::new();
        for (i, &xi) in positions.iter().enumerate() {
            for cell in self.neighbors(self.cell_of(xi)) {
                for &j in &self.cells[cell] {
                    if j <= i {
                        continue;
                    }
                    let dr = domain.minimum_image(xi - positions[j]);
                    if dr.length_squared() < rc2 {
                        out.push((i, j, dr));
                    }
                }
            }
        }
        out
    }

    /// Pairs between `dst` points and the points this list was built from
    pub fn cross_pairs(
        &self,
        dst: &[DVec3],
        src: &[DVec3],
        domain: &Domain,
        cutoff: f64,
    ) -> Vec<(usize, usize, DVec3)> {
        let rc2 = cutoff * cutoff;
        let mut out = Vec::new();
        for (i, &xi) in dst.iter().enumerate() {
            for cell in self.neighbors(self.cell_of(xi)) {
                for &j in &self.cells[cell] {
                    let dr = domain.minimum_image(xi - src[j]);
                    if dr.length_squared() < rc2 {
                        out.push((i, j, dr));
                    }
                }
            }
        }
        out
    }
}

/// DPD parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DpdParams {
    pub rc: f64,
    pub a: f64,
    pub gamma: f64,
    pub kbt: f64,
    /// Exponent of the dissipative/random weight
    #[serde(default = "default_power")]
    pub power: f64,
}

fn default_power() -> f64 {
    1.0
}

impl Default for DpdParams {
    fn default() -> Self {
        Self {
            rc: 1.0,
            a: 10.0,
            gamma: 50.0,
            kbt: 1.0,
            power: 0.5,
        }
    }
}

/// Dissipative particle dynamics
///
/// With `w = 1 - r/rc` and `e` the unit vector from j to i:
/// `F_ij = (a w - gamma w^(2p) (e . v_ij) + sqrt(2 gamma kbt) w^p xi / sqrt(dt)) e`.
/// `xi` is uniform with unit variance, drawn from a generator keyed on the
/// pair and the evaluation count, so runs are reproducible and Newton's
/// third law holds exactly.
#[derive(Debug)]
pub struct Dpd {
    name: String,
    params: DpdParams,
    dt: f64,
    seed: u64,
    calls: AtomicU64,
}

impl Dpd {
    pub fn new(name: impl Into<String>, params: DpdParams, dt: f64, seed: u64) -> Result<Self> {
        let name = name.into();
        if !(params.rc.is_finite() && params.rc > 0.0) {
            return config_err(format!("dpd '{name}': cutoff must be positive, got {}", params.rc));
        }
        if !(dt.is_finite() && dt > 0.0) {
            return config_err(format!("dpd '{name}': dt must be positive, got {dt}"));
        }
        if params.gamma < 0.0 || params.kbt < 0.0 || params.power <= 0.0 {
            return config_err(format!("dpd '{name}': gamma, kbt and power must not be negative"));
        }
        Ok(Self {
            name,
            params,
            dt,
            seed,
            calls: AtomicU64::new(0),
        })
    }

    pub fn params(&self) -> &DpdParams {
        &self.params
    }

    /// Force on i from j; `dr = x_i - x_j`, `dv = v_i - v_j`
    fn pair_force(&self, dr: DVec3, dv: DVec3, xi: f64) -> DVec3 {
        let p = &self.params;
        let r = dr.length();
        if r < 1e-12 || r >= p.rc {
            return DVec3::ZERO;
        }
        let e = dr / r;
        let w = 1.0 - r / p.rc;
        let wr = w.powf(p.power);
        let sigma = (2.0 * p.gamma * p.kbt).sqrt();
        let magnitude = p.a * w - p.gamma * wr * wr * e.dot(dv) + sigma * wr * xi / self.dt.sqrt();
        magnitude * e
    }

    fn noise(&self, call: u64, stream: u64) -> f64 {
        let mut rng = Pcg32::new(self.seed ^ call.wrapping_mul(0x9E37_79B9_7F4A_7C15), stream);
        (2.0 * rng.random::<f64>() - 1.0) * 3.0_f64.sqrt()
    }
}

#[inline]
fn pair_stream(i: usize, j: usize, cross: bool) -> u64 {
    let (a, b) = if i < j { (i, j) } else { (j, i) };
    let key = ((a as u64) << 32) | (b as u64 & 0xFFFF_FFFF);
    if cross { !key } else { key }
}

impl Interaction for Dpd {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InteractionKind {
        InteractionKind::Pairwise
    }

    fn cutoff(&self) -> f64 {
        self.params.rc
    }

    fn compute_forces(&self, set: &ParticleSet, domain: &Domain) -> ForceField {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let positions = set.positions();
        let cells = CellList::build(&positions, domain, self.params.rc);
        let pairs = cells.pairs(&positions, domain, self.params.rc);

        let pair_forces: Vec<DVec3> = pairs
            .par_iter()
            .map(|&(i, j, dr)| {
                let dv = set.particles[i].velocity - set.particles[j].velocity;
                self.pair_force(dr, dv, self.noise(call, pair_stream(i, j, false)))
            })
            .collect();

        let mut forces = vec![DVec3::ZERO; set.len()];
        for (&(i, j, _), f) in pairs.iter().zip(pair_forces) {
            forces[i] += f;
            forces[j] -= f;
        }
        forces
    }

    fn add_cross_forces(&self, forces: &mut ForceField, dst: &ParticleSet, src: &ParticleSet, domain: &Domain) {
        if src.is_empty() || forces.len() != dst.len() {
            return;
        }
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let src_positions = src.positions();
        let cells = CellList::build(&src_positions, domain, self.params.rc);
        let pairs = cells.cross_pairs(&dst.positions(), &src_positions, domain, self.params.rc);
        for (i, j, dr) in pairs {
            let dv = dst.particles[i].velocity - src.particles[j].velocity;
            forces[i] += self.pair_force(dr, dv, self.noise(call, pair_stream(i, j, true)));
        }
    }
}

/// Harmonic bonds `F_i = -k (r - r0) e_ij` within a membrane
#[derive(Debug, Clone)]
pub struct MembraneSprings {
    name: String,
    bonds: Vec<(usize, usize)>,
    k: f64,
    r0: f64,
}

impl MembraneSprings {
    pub fn new(name: impl Into<String>, bonds: Vec<(usize, usize)>, k: f64, r0: f64) -> Result<Self> {
        let name = name.into();
        if !(k.is_finite() && k >= 0.0 && r0.is_finite() && r0 >= 0.0) {
            return config_err(format!("membrane '{name}': stiffness and rest length must not be negative"));
        }
        if let Some(&(i, j)) = bonds.iter().find(|(i, j)| i == j) {
            return config_err(format!("membrane '{name}': bond ({i}, {j}) links a particle to itself"));
        }
        Ok(Self { name, bonds, k, r0 })
    }

    pub fn bonds(&self) -> &[(usize, usize)] {
        &self.bonds
    }
}

impl Interaction for MembraneSprings {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> InteractionKind {
        InteractionKind::Membrane
    }

    fn cutoff(&self) -> f64 {
        0.0
    }

    fn compute_forces(&self, set: &ParticleSet, domain: &Domain) -> ForceField {
        let mut forces = vec![DVec3::ZERO; set.len()];
        for &(i, j) in &self.bonds {
            let (Some(pi), Some(pj)) = (set.particles.get(i), set.particles.get(j)) else {
                continue;
            };
            let dr = domain.minimum_image(pi.position - pj.position);
            let r = dr.length();
            if r < 1e-12 {
                continue;
            }
            let f = -self.k * (r - self.r0) * (dr / r);
            forces[i] += f;
            forces[j] -= f;
        }
        forces
    }
}
