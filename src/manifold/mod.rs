//! Lie-group machinery for pose-graph variables.
//!
//! The back end optimizes over rigid-body poses, so only the two manifolds it
//! actually needs are implemented here: SO(3) (unit-quaternion rotations) and
//! SE(3) (rotation + translation). Tangent vectors follow the `[rho, theta]`
//! ordering and the right-perturbation convention `x ⊞ δ = x ∘ exp(δ)`; all
//! factor Jacobians in this crate are expressed with respect to that
//! perturbation.
//!
//! The analytic Jacobian formulas (left/right Jacobians and their inverses,
//! the SE(3) Q-block) follow the conventions of the manif library.

use nalgebra::{Matrix3, Vector3};

pub mod se3;
pub mod so3;

pub use se3::SE3;
pub use so3::SO3;

/// Skew-symmetric (hat) matrix of a 3-vector: `skew(v) * w == v × w`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}
