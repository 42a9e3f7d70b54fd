//! Implicit wall geometry
//!
//! Signed distance functions for the analytic wall shapes and the sampled-field
//! variant. Consumers always see the wall convention: the distance is positive
//! inside the wall body and negative in the domain.

use std::sync::Arc;

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use super::field::Grid;
use crate::consts::GRADIENT_EPS;
use crate::error::{Result, config_err};

/// Coordinate axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn unit(self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }

    /// Indices of the two axes perpendicular to this one, ascending
    pub fn perpendicular(self) -> (usize, usize) {
        match self {
            Axis::X => (1, 2),
            Axis::Y => (0, 2),
            Axis::Z => (0, 1),
        }
    }

    /// Cyclic successor: x -> y -> z -> x
    pub fn next(self) -> Axis {
        match self {
            Axis::X => Axis::Y,
            Axis::Y => Axis::Z,
            Axis::Z => Axis::X,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "x" => Some(Axis::X),
            "y" => Some(Axis::Y),
            "z" => Some(Axis::Z),
            _ => None,
        }
    }
}

/// Signed distance to a plane (positive on the side the unit normal points to)
#[inline]
pub fn sd_plane(p: DVec3, normal: DVec3, point: DVec3) -> f64 {
    (p - point).dot(normal)
}

/// Exact signed distance to an axis-aligned box, negative inside
pub fn sd_box(p: DVec3, low: DVec3, high: DVec3) -> f64 {
    let center = 0.5 * (low + high);
    let half = 0.5 * (high - low);
    let q = (p - center).abs() - half;
    q.max(DVec3::ZERO).length() + q.max_element().min(0.0)
}

/// Signed distance to the lateral surface of an infinite axis-aligned cylinder
#[inline]
pub fn sd_cylinder(p: DVec3, center: DVec2, radius: f64, axis: Axis) -> f64 {
    let (u, v) = axis.perpendicular();
    DVec2::new(p[u] - center.x, p[v] - center.y).length() - radius
}

/// Signed distance to a sphere
#[inline]
pub fn sd_sphere(p: DVec3, center: DVec3, radius: f64) -> f64 {
    (p - center).length() - radius
}

/// Compute SDF gradient (surface normal) using central differences
pub fn sdf_gradient<F>(p: DVec3, sdf: F) -> DVec3
where
    F: Fn(DVec3) -> f64,
{
    let eps = GRADIENT_EPS;
    let dx = sdf(p + DVec3::new(eps, 0.0, 0.0)) - sdf(p - DVec3::new(eps, 0.0, 0.0));
    let dy = sdf(p + DVec3::new(0.0, eps, 0.0)) - sdf(p - DVec3::new(0.0, eps, 0.0));
    let dz = sdf(p + DVec3::new(0.0, 0.0, eps)) - sdf(p - DVec3::new(0.0, 0.0, eps));
    DVec3::new(dx, dy, dz).normalize_or_zero()
}

/// Underlying shape of a wall
#[derive(Debug, Clone)]
pub enum Shape {
    /// Half-space; `normal` is unit length and points into the wall
    Plane { normal: DVec3, point: DVec3 },
    Box { low: DVec3, high: DVec3 },
    /// `center` holds the coordinates along the two axes perpendicular to `axis`
    Cylinder { center: DVec2, radius: f64, axis: Axis },
    Sphere { center: DVec3, radius: f64 },
    /// Grid values already follow the wall convention
    Sampled(Arc<Grid>),
}

impl Shape {
    /// Shape function before orientation is applied
    fn raw_distance(&self, p: DVec3) -> f64 {
        match self {
            Shape::Plane { normal, point } => sd_plane(p, *normal, *point),
            Shape::Box { low, high } => sd_box(p, *low, *high),
            Shape::Cylinder {
                center,
                radius,
                axis,
            } => sd_cylinder(p, *center, *radius, *axis),
            Shape::Sphere { center, radius } => sd_sphere(p, *center, *radius),
            Shape::Sampled(grid) => grid.sample(p),
        }
    }

    fn raw_gradient(&self, p: DVec3) -> DVec3 {
        match self {
            Shape::Plane { normal, .. } => *normal,
            Shape::Box { low, high } => box_gradient(p, *low, *high),
            Shape::Cylinder { center, axis, .. } => {
                let (u, v) = axis.perpendicular();
                let mut g = DVec3::ZERO;
                g[u] = p[u] - center.x;
                g[v] = p[v] - center.y;
                g.normalize_or_zero()
            }
            Shape::Sphere { center, .. } => (p - *center).normalize_or_zero(),
            Shape::Sampled(grid) => grid.sample_gradient(p).normalize_or_zero(),
        }
    }
}

/// Analytic gradient of `sd_box`
fn box_gradient(p: DVec3, low: DVec3, high: DVec3) -> DVec3 {
    let center = 0.5 * (low + high);
    let d = p - center;
    let q = d.abs() - 0.5 * (high - low);
    let sign = DVec3::new(d.x.signum(), d.y.signum(), d.z.signum());

    if q.max_element() > 0.0 {
        (q.max(DVec3::ZERO) * sign).normalize_or_zero()
    } else {
        // Inside: the nearest face wins
        let mut g = DVec3::ZERO;
        let k = if q.x >= q.y && q.x >= q.z {
            0
        } else if q.y >= q.z {
            1
        } else {
            2
        };
        g[k] = sign[k];
        g
    }
}

/// A wall shape together with its orientation
#[derive(Debug, Clone)]
pub struct Geometry {
    shape: Shape,
    /// The domain lies where the raw shape function is negative
    inside_is_domain: bool,
}

impl Geometry {
    /// Half-space wall; `normal` points into the wall
    pub fn plane(normal: DVec3, point: DVec3) -> Result<Self> {
        check_finite(normal, "plane normal")?;
        check_finite(point, "plane point")?;
        if normal.length_squared() < 1e-24 {
            return config_err("plane normal must be non-zero");
        }
        Ok(Self {
            shape: Shape::Plane {
                normal: normal.normalize(),
                point,
            },
            inside_is_domain: true,
        })
    }

    /// Axis-aligned box; `inside` places the domain inside the box
    pub fn cuboid(low: DVec3, high: DVec3, inside: bool) -> Result<Self> {
        check_finite(low, "box low corner")?;
        check_finite(high, "box high corner")?;
        if !low.cmplt(high).all() {
            return config_err(format!("box low corner {low} must be below high corner {high}"));
        }
        Ok(Self {
            shape: Shape::Box { low, high },
            inside_is_domain: inside,
        })
    }

    pub fn cylinder(center: DVec2, radius: f64, axis: Axis, inside: bool) -> Result<Self> {
        if !(center.x.is_finite() && center.y.is_finite()) {
            return config_err("cylinder center must be finite");
        }
        check_radius(radius, "cylinder")?;
        Ok(Self {
            shape: Shape::Cylinder {
                center,
                radius,
                axis,
            },
            inside_is_domain: inside,
        })
    }

    pub fn sphere(center: DVec3, radius: f64, inside: bool) -> Result<Self> {
        check_finite(center, "sphere center")?;
        check_radius(radius, "sphere")?;
        Ok(Self {
            shape: Shape::Sphere { center, radius },
            inside_is_domain: inside,
        })
    }

    /// Wall described by a sampled signed distance field
    pub fn sampled(grid: Arc<Grid>) -> Self {
        Self {
            shape: Shape::Sampled(grid),
            inside_is_domain: true,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn inside_is_domain(&self) -> bool {
        self.inside_is_domain
    }

    #[inline]
    fn orientation(&self) -> f64 {
        if self.inside_is_domain { 1.0 } else { -1.0 }
    }

    /// Signed distance, positive inside the wall
    #[inline]
    pub fn distance(&self, p: DVec3) -> f64 {
        self.orientation() * self.shape.raw_distance(p)
    }

    /// Unit gradient of `distance`, pointing into the wall.
    /// At degenerate points (sphere center, cylinder axis) falls back to
    /// central differences, which may still be zero.
    #[inline]
    pub fn gradient(&self, p: DVec3) -> DVec3 {
        let g = self.orientation() * self.shape.raw_gradient(p);
        if g == DVec3::ZERO {
            sdf_gradient(p, |q| self.distance(q))
        } else {
            g
        }
    }
}

fn check_finite(v: DVec3, what: &str) -> Result<()> {
    if crate::is_finite_vec(v) {
        Ok(())
    } else {
        config_err(format!("{what} must be finite, got {v}"))
    }
}

fn check_radius(radius: f64, what: &str) -> Result<()> {
    if radius.is_finite() && radius > 0.0 {
        Ok(())
    } else {
        config_err(format!("{what} radius must be positive, got {radius}"))
    }
}
