//! S² - points on the unit sphere in R³
//!
//! Used for direction-valued variables (bearings, normals). The tangent space
//! at `p` is the plane orthogonal to `p`, parameterized by two coefficients
//! that scale an orthonormal basis `B = [b1 b2]` of that plane.

use crate::manifold::{Manifold, ManifoldError, ManifoldResult};
use nalgebra::{DVector, Matrix3x2, Vector2, Vector3};
use std::fmt;

/// Distance from the antipode below which local coordinates are undefined
const ANTIPODAL_THRESHOLD: f64 = 1e-10;

/// Point on the unit sphere.
///
/// Always stored normalized; the default is `(1, 0, 0)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Sphere2 {
    p: Vector3<f64>,
}

impl Default for Sphere2 {
    fn default() -> Self {
        Sphere2 { p: Vector3::x() }
    }
}

impl fmt::Display for Sphere2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sphere2(x: {:.3}, y: {:.3}, z: {:.3})",
            self.p.x, self.p.y, self.p.z
        )
    }
}

impl Sphere2 {
    /// Project `p` onto the sphere.
    ///
    /// # Errors
    /// [`ManifoldError::InvalidElement`] for a zero or non-finite vector.
    pub fn new(p: Vector3<f64>) -> ManifoldResult<Self> {
        let norm = p.norm();
        if !norm.is_finite() || norm == 0.0 {
            return Err(ManifoldError::InvalidElement(format!(
                "cannot normalize [{}, {}, {}] onto the unit sphere",
                p.x, p.y, p.z
            )));
        }
        Ok(Sphere2 { p: p / norm })
    }

    pub fn from_xyz(x: f64, y: f64, z: f64) -> ManifoldResult<Self> {
        Self::new(Vector3::new(x, y, z))
    }

    /// Unit vector of this point
    pub fn point(&self) -> &Vector3<f64> {
        &self.p
    }

    /// Orthonormal basis of the tangent plane.
    ///
    /// Built from the coordinate axis along which `p` has the smallest
    /// magnitude (first such axis on ties): `b1 = normalize(p × axis)`,
    /// `b2 = p × b1`.
    pub fn basis(&self) -> Matrix3x2<f64> {
        let a = self.p.abs();
        let axis = if a.x <= a.y && a.x <= a.z {
            Vector3::x()
        } else if a.y <= a.z {
            Vector3::y()
        } else {
            Vector3::z()
        };

        let b1 = self.p.cross(&axis).normalize();
        let b2 = self.p.cross(&b1);
        Matrix3x2::from_columns(&[b1, b2])
    }

    /// Component-wise comparison of the unit vectors
    pub fn equals(&self, other: &Self, tol: f64) -> bool {
        (self.p - other.p).iter().all(|d| d.abs() <= tol)
    }

    /// Retraction with a fixed-size tangent vector
    pub fn retract_vec(&self, v: &Vector2<f64>) -> Self {
        let xi = self.basis() * v;
        let theta = xi.norm();
        if theta == 0.0 {
            return self.clone();
        }
        let q = self.p * theta.cos() + xi * (theta.sin() / theta);
        Sphere2 { p: q.normalize() }
    }
}

impl Manifold for Sphere2 {
    const DIM: usize = 2;

    fn retract(&self, v: &DVector<f64>) -> ManifoldResult<Self> {
        if v.len() != Self::DIM {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: Self::DIM,
                actual: v.len(),
            });
        }
        Ok(self.retract_vec(&Vector2::new(v[0], v[1])))
    }

    fn local_coordinates(&self, other: &Self) -> ManifoldResult<DVector<f64>> {
        let cos_theta = self.p.dot(&other.p).clamp(-1.0, 1.0);
        let theta = cos_theta.acos();
        if theta == 0.0 {
            return Ok(DVector::zeros(Self::DIM));
        }

        let sin_theta = theta.sin();
        if sin_theta.abs() < ANTIPODAL_THRESHOLD {
            return Err(ManifoldError::NumericalInstability(format!(
                "local coordinates between antipodal points {self} and {other}"
            )));
        }

        let tangent = (other.p - self.p * cos_theta) * (theta / sin_theta);
        let coords = self.basis().transpose() * tangent;
        Ok(DVector::from_column_slice(coords.as_slice()))
    }
}
