//! SO(3) rotations backed by unit quaternions.
//!
//! Exponential/logarithmic maps and the left/right Jacobians used by the
//! SE(3) maps and the factor linearizations.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::manifold::skew;

/// Rotation in 3D, stored as a unit quaternion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SO3 {
    quaternion: UnitQuaternion<f64>,
}

impl SO3 {
    /// Degrees of freedom of the tangent space.
    pub const DOF: usize = 3;

    pub fn identity() -> Self {
        SO3 {
            quaternion: UnitQuaternion::identity(),
        }
    }

    pub fn from_quaternion(quaternion: UnitQuaternion<f64>) -> Self {
        SO3 { quaternion }
    }

    /// Build from raw quaternion coefficients `(w, x, y, z)`, normalizing.
    pub fn from_wxyz(w: f64, x: f64, y: f64, z: f64) -> Self {
        SO3 {
            quaternion: UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
        }
    }

    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        SO3 {
            quaternion: self.quaternion.inverse(),
        }
    }

    pub fn compose(&self, other: &SO3) -> Self {
        SO3 {
            quaternion: self.quaternion * other.quaternion,
        }
    }

    /// Rotate a vector.
    pub fn act(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * v
    }

    /// Exponential map: axis-angle tangent to rotation.
    pub fn exp(theta: &Vector3<f64>) -> Self {
        let quaternion = if theta.norm_squared() > f64::EPSILON {
            UnitQuaternion::from_scaled_axis(*theta)
        } else {
            // First-order quaternion for very small angles
            UnitQuaternion::from_quaternion(Quaternion::new(
                1.0,
                theta.x / 2.0,
                theta.y / 2.0,
                theta.z / 2.0,
            ))
        };
        SO3 { quaternion }
    }

    /// Logarithmic map: rotation to axis-angle tangent.
    pub fn log(&self) -> Vector3<f64> {
        let q = self.quaternion.quaternion();
        let sin_angle_squared = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_angle_squared > f64::EPSILON {
            let sin_angle = sin_angle_squared.sqrt();
            let cos_angle = q.w;

            // Keep the angle in (-pi, pi] when the scalar part is negative
            let two_angle = 2.0
                * if cos_angle < 0.0 {
                    f64::atan2(-sin_angle, -cos_angle)
                } else {
                    f64::atan2(sin_angle, cos_angle)
                };

            two_angle / sin_angle
        } else {
            2.0
        };

        Vector3::new(q.i * log_coeff, q.j * log_coeff, q.k * log_coeff)
    }

    /// Left Jacobian of the exponential map at `theta`.
    pub fn left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
        let angle_squared = theta.norm_squared();
        let theta_skew = skew(theta);

        if angle_squared <= f64::EPSILON {
            Matrix3::identity() + 0.5 * theta_skew
        } else {
            let angle = angle_squared.sqrt();
            let sin_angle = angle.sin();
            let cos_angle = angle.cos();

            Matrix3::identity()
                + (1.0 - cos_angle) / angle_squared * theta_skew
                + (angle - sin_angle) / (angle_squared * angle) * theta_skew * theta_skew
        }
    }

    /// Inverse of the left Jacobian at `theta`.
    pub fn left_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
        let angle_squared = theta.norm_squared();
        let theta_skew = skew(theta);

        if angle_squared <= f64::EPSILON {
            Matrix3::identity() - 0.5 * theta_skew
        } else {
            let angle = angle_squared.sqrt();
            let sin_angle = angle.sin();
            let cos_angle = angle.cos();

            Matrix3::identity() - 0.5 * theta_skew
                + (1.0 / angle_squared - (1.0 + cos_angle) / (2.0 * angle * sin_angle))
                    * theta_skew
                    * theta_skew
        }
    }

    /// Right Jacobian: `Jr(theta) = Jl(-theta)`.
    pub fn right_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
        Self::left_jacobian(&-theta)
    }

    /// Inverse of the right Jacobian.
    pub fn right_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
        Self::left_jacobian_inv(&-theta)
    }
}

impl Default for SO3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-10;

    #[test]
    fn test_exp_log_roundtrip() {
        let theta = Vector3::new(0.3, -0.2, 0.5);
        let rot = SO3::exp(&theta);
        let recovered = rot.log();
        assert!((theta - recovered).norm() < TOLERANCE);
    }

    #[test]
    fn test_exp_small_angle() {
        let theta = Vector3::new(1e-12, 0.0, 0.0);
        let rot = SO3::exp(&theta);
        assert!((rot.log() - theta).norm() < TOLERANCE);
    }

    #[test]
    fn test_compose_inverse() {
        let a = SO3::exp(&Vector3::new(0.1, 0.2, -0.3));
        let b = a.compose(&a.inverse());
        assert!(b.log().norm() < TOLERANCE);
    }

    #[test]
    fn test_jacobian_inverse_consistency() {
        let theta = Vector3::new(0.4, -0.1, 0.2);
        let jl = SO3::left_jacobian(&theta);
        let jl_inv = SO3::left_jacobian_inv(&theta);
        let product = jl * jl_inv;
        assert!((product - Matrix3::identity()).norm() < 1e-8);
    }

    #[test]
    fn test_act_matches_matrix() {
        let rot = SO3::exp(&Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        let v = Vector3::new(1.0, 0.0, 0.0);
        let rotated = rot.act(&v);
        assert!((rotated - Vector3::new(0.0, 1.0, 0.0)).norm() < TOLERANCE);
        assert!((rot.matrix() * v - rotated).norm() < TOLERANCE);
    }
}
