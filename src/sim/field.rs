//! Sampled signed distance fields
//!
//! A regular grid of single-precision samples with trilinear value and
//! gradient queries. Samples are cell-centred: node `(i, j, k)` sits at
//! `origin + (i + 0.5, j + 0.5, k + 0.5) * h` with `h = extents / resolution`,
//! and the flat layout is x-fastest: `index = (k * ny + j) * nx + i`.
//!
//! File format: two text header lines (`Lx Ly Lz`, then `Nx Ny Nz`) followed
//! by `Nx * Ny * Nz` native-endian `f32` values.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::ops::{Add, Mul};
use std::path::Path;
use std::sync::Arc;

use glam::DVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::domain::Domain;
use super::geometry::Geometry;
use crate::error::{Result, SimError, config_err};

/// Regular 3-D grid of scalar samples
#[derive(Debug, Clone)]
pub struct Grid {
    origin: DVec3,
    extents: DVec3,
    resolution: [usize; 3],
    values: Vec<f32>,
}

impl Grid {
    /// Build a grid from raw samples; the sample count must match the resolution
    pub fn new(origin: DVec3, extents: DVec3, resolution: [usize; 3], values: Vec<f32>) -> Result<Self> {
        check_layout(origin, extents, resolution)?;
        let expected = sample_count(resolution)?;
        if values.len() != expected {
            return Err(SimError::Format(format!(
                "grid {}x{}x{} needs {} samples, got {}",
                resolution[0],
                resolution[1],
                resolution[2],
                expected,
                values.len()
            )));
        }
        Ok(Self {
            origin,
            extents,
            resolution,
            values,
        })
    }

    /// Rasterize a function by evaluating it at every node
    pub fn from_fn<F>(origin: DVec3, extents: DVec3, resolution: [usize; 3], f: F) -> Result<Self>
    where
        F: Fn(DVec3) -> f64 + Sync,
    {
        check_layout(origin, extents, resolution)?;
        let count = sample_count(resolution)?;
        let [nx, ny, nz] = resolution;
        let h = extents / DVec3::new(nx as f64, ny as f64, nz as f64);
        let values = (0..count)
            .into_par_iter()
            .map(|idx| {
                let i = idx % nx;
                let j = (idx / nx) % ny;
                let k = idx / (nx * ny);
                let p = origin + (DVec3::new(i as f64, j as f64, k as f64) + 0.5) * h;
                f(p) as f32
            })
            .collect();
        Ok(Self {
            origin,
            extents,
            resolution,
            values,
        })
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn extents(&self) -> DVec3 {
        self.extents
    }

    pub fn resolution(&self) -> [usize; 3] {
        self.resolution
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Distance between neighbouring nodes along each axis
    pub fn spacing(&self) -> DVec3 {
        let [nx, ny, nz] = self.resolution;
        self.extents / DVec3::new(nx as f64, ny as f64, nz as f64)
    }

    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        let [nx, ny, _] = self.resolution;
        (k * ny + j) * nx + i
    }

    #[inline]
    pub fn value(&self, i: usize, j: usize, k: usize) -> f32 {
        self.values[self.index(i, j, k)]
    }

    pub fn node_position(&self, i: usize, j: usize, k: usize) -> DVec3 {
        self.origin + (DVec3::new(i as f64, j as f64, k as f64) + 0.5) * self.spacing()
    }

    /// Whether `p` lies within the physical extent of the grid
    pub fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.origin).all() && p.cmple(self.origin + self.extents).all()
    }

    /// Enclosing node pair and interpolation weight per axis, clamped to the node hull
    fn locate(&self, p: DVec3) -> ([usize; 3], [usize; 3], [f64; 3]) {
        let h = self.spacing();
        let mut lo = [0; 3];
        let mut hi = [0; 3];
        let mut t = [0.0; 3];
        for a in 0..3 {
            let n = self.resolution[a];
            let f = ((p[a] - self.origin[a]) / h[a] - 0.5).clamp(0.0, (n - 1) as f64);
            let i0 = (f.floor() as usize).min(n.saturating_sub(2));
            let i1 = (i0 + 1).min(n - 1);
            lo[a] = i0;
            hi[a] = i1;
            t[a] = if i1 == i0 { 0.0 } else { f - i0 as f64 };
        }
        (lo, hi, t)
    }

    /// Trilinear blend of a per-node quantity
    fn trilinear<T, F>(&self, p: DVec3, corner: F) -> T
    where
        T: Copy + Add<Output = T> + Mul<f64, Output = T>,
        F: Fn(usize, usize, usize) -> T,
    {
        let (lo, hi, [tx, ty, tz]) = self.locate(p);

        let c000 = corner(lo[0], lo[1], lo[2]);
        let c100 = corner(hi[0], lo[1], lo[2]);
        let c010 = corner(lo[0], hi[1], lo[2]);
        let c110 = corner(hi[0], hi[1], lo[2]);
        let c001 = corner(lo[0], lo[1], hi[2]);
        let c101 = corner(hi[0], lo[1], hi[2]);
        let c011 = corner(lo[0], hi[1], hi[2]);
        let c111 = corner(hi[0], hi[1], hi[2]);

        let c00 = c000 * (1.0 - tx) + c100 * tx;
        let c10 = c010 * (1.0 - tx) + c110 * tx;
        let c01 = c001 * (1.0 - tx) + c101 * tx;
        let c11 = c011 * (1.0 - tx) + c111 * tx;

        let c0 = c00 * (1.0 - ty) + c10 * ty;
        let c1 = c01 * (1.0 - ty) + c11 * ty;

        c0 * (1.0 - tz) + c1 * tz
    }

    /// Trilinearly interpolated value; queries outside the node hull are clamped
    pub fn sample(&self, p: DVec3) -> f64 {
        self.trilinear(p, |i, j, k| self.value(i, j, k) as f64)
    }

    /// Central-difference gradient at a node (one-sided on the grid boundary)
    fn node_gradient(&self, i: usize, j: usize, k: usize) -> DVec3 {
        let h = self.spacing();
        let idx = [i, j, k];
        let mut g = DVec3::ZERO;
        for a in 0..3 {
            let n = self.resolution[a];
            let lo = idx[a].saturating_sub(1);
            let hi = (idx[a] + 1).min(n - 1);
            if hi == lo {
                continue;
            }
            let mut at_lo = idx;
            let mut at_hi = idx;
            at_lo[a] = lo;
            at_hi[a] = hi;
            let dv = self.value(at_hi[0], at_hi[1], at_hi[2]) - self.value(at_lo[0], at_lo[1], at_lo[2]);
            g[a] = dv as f64 / ((hi - lo) as f64 * h[a]);
        }
        g
    }

    /// Trilinear interpolation of the nodal central-difference gradients
    pub fn sample_gradient(&self, p: DVec3) -> DVec3 {
        self.trilinear(p, |i, j, k| self.node_gradient(i, j, k))
    }

    /// Evaluate this grid on a new grid with the requested spacing over the same extent.
    /// The resolution is rounded, so the actual spacing may differ slightly.
    pub fn resample(&self, spacing: DVec3) -> Result<Grid> {
        if !(spacing.cmpgt(DVec3::ZERO).all() && crate::is_finite_vec(spacing)) {
            return config_err(format!("resample spacing must be positive, got {spacing}"));
        }
        let n = (self.extents / spacing).round().max(DVec3::ONE);
        let resolution = [n.x as usize, n.y as usize, n.z as usize];
        log::debug!(
            "Resampling grid {:?} -> {:?}",
            self.resolution,
            resolution
        );
        Grid::from_fn(self.origin, self.extents, resolution, |p| self.sample(p))
    }

    /// Read a grid (origin at zero) from the SDF file format
    pub fn read<R: BufRead>(mut reader: R) -> Result<Self> {
        let mut tokens = Vec::new();
        for _ in 0..2 {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(SimError::Format("truncated header".into()));
            }
            tokens.extend(line.split_whitespace().map(str::to_owned));
        }
        if tokens.len() != 6 {
            return Err(SimError::Format(format!(
                "header needs 3 extents and 3 resolutions, found {} tokens",
                tokens.len()
            )));
        }

        let mut extents = DVec3::ZERO;
        for a in 0..3 {
            extents[a] = tokens[a]
                .parse::<f64>()
                .map_err(|_| SimError::Format(format!("bad extent '{}'", tokens[a])))?;
        }
        let mut resolution = [0usize; 3];
        for a in 0..3 {
            resolution[a] = tokens[3 + a]
                .parse::<usize>()
                .map_err(|_| SimError::Format(format!("bad resolution '{}'", tokens[3 + a])))?;
        }
        check_layout(DVec3::ZERO, extents, resolution).map_err(|e| SimError::Format(e.to_string()))?;

        let count = sample_count(resolution)?;
        let expected_bytes = count
            .checked_mul(size_of::<f32>())
            .ok_or_else(|| SimError::Format(format!("{count} samples overflow the addressable size")))?;

        // At most one byte past the payload; extra bytes mean trailing data.
        let mut bytes = Vec::new();
        reader
            .by_ref()
            .take((expected_bytes as u64).saturating_add(1))
            .read_to_end(&mut bytes)?;
        if bytes.len() != expected_bytes {
            let mut rest = Vec::new();
            let trailing = if bytes.len() > expected_bytes {
                reader.read_to_end(&mut rest)? + bytes.len() - expected_bytes
            } else {
                0
            };
            return Err(SimError::Format(if trailing > 0 {
                format!("expected {count} samples, found {trailing} trailing bytes")
            } else {
                format!("expected {count} samples, file holds {} bytes of data", bytes.len())
            }));
        }
        let values = bytes
            .chunks_exact(size_of::<f32>())
            .map(bytemuck::pod_read_unaligned::<f32>)
            .collect();

        Grid::new(DVec3::ZERO, extents, resolution, values)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        let [nx, ny, nz] = self.resolution;
        writeln!(writer, "{} {} {}", self.extents.x, self.extents.y, self.extents.z)?;
        writeln!(writer, "{nx} {ny} {nz}")?;
        writer.write_all(bytemuck::cast_slice(&self.values))?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::read(BufReader::new(file))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        self.write(BufWriter::new(file))
    }
}

fn sample_count(resolution: [usize; 3]) -> Result<usize> {
    resolution
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| SimError::Format(format!("grid resolution {resolution:?} overflows the sample count")))
}

fn check_layout(origin: DVec3, extents: DVec3, resolution: [usize; 3]) -> Result<()> {
    if !crate::is_finite_vec(origin) || !crate::is_finite_vec(extents) || !extents.cmpgt(DVec3::ZERO).all() {
        return config_err(format!("grid extents must be positive and finite, got {extents}"));
    }
    if resolution.contains(&0) {
        return config_err(format!("grid resolution must be non-zero, got {resolution:?}"));
    }
    Ok(())
}

/// What a field query does outside the physical extent of its grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutOfGridPolicy {
    /// Use the nearest boundary layer of the grid
    #[default]
    Clamp,
    /// Report `SimError::OutOfDomain`
    Error,
}

/// Shared, immutable sampled field
#[derive(Debug, Clone)]
pub struct SampledField {
    grid: Arc<Grid>,
    policy: OutOfGridPolicy,
}

impl SampledField {
    pub fn new(grid: Grid) -> Self {
        Self {
            grid: Arc::new(grid),
            policy: OutOfGridPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: OutOfGridPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Load an SDF file and resample it onto a grid with the given spacing
    pub fn load(path: impl AsRef<Path>, spacing: DVec3) -> Result<Self> {
        let path = path.as_ref();
        let coarse = Grid::load(path)?;
        log::info!(
            "Loaded SDF '{}': extents {}, resolution {:?}",
            path.display(),
            coarse.extents(),
            coarse.resolution()
        );
        Ok(Self::new(coarse.resample(spacing)?))
    }

    /// Rasterize analytic geometry over the domain
    pub fn rasterize(geometry: &Geometry, domain: &Domain, spacing: DVec3) -> Result<Self> {
        if !spacing.cmpgt(DVec3::ZERO).all() {
            return config_err(format!("rasterize spacing must be positive, got {spacing}"));
        }
        let n = (domain.extents / spacing).round().max(DVec3::ONE);
        let resolution = [n.x as usize, n.y as usize, n.z as usize];
        let grid = Grid::from_fn(domain.lo, domain.extents, resolution, |p| geometry.distance(p))?;
        Ok(Self::new(grid))
    }

    pub fn resample(&self, spacing: DVec3) -> Result<Self> {
        Ok(Self {
            grid: Arc::new(self.grid.resample(spacing)?),
            policy: self.policy,
        })
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    pub fn policy(&self) -> OutOfGridPolicy {
        self.policy
    }

    fn check(&self, p: DVec3) -> Result<()> {
        if self.policy == OutOfGridPolicy::Error && !self.grid.contains(p) {
            return Err(SimError::OutOfDomain { point: p });
        }
        Ok(())
    }

    pub fn value_at(&self, p: DVec3) -> Result<f64> {
        self.check(p)?;
        Ok(self.grid.sample(p))
    }

    pub fn gradient_at(&self, p: DVec3) -> Result<DVec3> {
        self.check(p)?;
        Ok(self.grid.sample_gradient(p))
    }
}
