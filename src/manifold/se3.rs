//! SE(3) rigid-body transforms.
//!
//! The pose type every submap origin, IMU endpoint, and relative measurement
//! in this crate is expressed in. Tangent vectors are `[rho, theta]`
//! (translation first), matching the residual ordering of the pose factors.

use nalgebra::{
    Isometry3, Matrix3, Matrix4, Matrix6, Translation3, UnitQuaternion, Vector3, Vector4, Vector6,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Mul;

use crate::manifold::{skew, SO3};

/// Rigid transform in 3D: rotation + translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    rotation: SO3,
    translation: Vector3<f64>,
}

impl SE3 {
    /// Degrees of freedom of the tangent space.
    pub const DOF: usize = 6;

    pub fn identity() -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(translation: Vector3<f64>, rotation: SO3) -> Self {
        SE3 {
            rotation,
            translation,
        }
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::new(x, y, z),
        }
    }

    pub fn from_translation_quaternion(
        translation: Vector3<f64>,
        quaternion: UnitQuaternion<f64>,
    ) -> Self {
        SE3 {
            rotation: SO3::from_quaternion(quaternion),
            translation,
        }
    }

    pub fn from_isometry(isometry: &Isometry3<f64>) -> Self {
        SE3 {
            rotation: SO3::from_quaternion(isometry.rotation),
            translation: isometry.translation.vector,
        }
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    pub fn rotation(&self) -> &SO3 {
        &self.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.matrix()
    }

    pub fn isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            self.rotation.quaternion(),
        )
    }

    /// Homogeneous 4x4 transformation matrix.
    pub fn matrix(&self) -> Matrix4<f64> {
        self.isometry().to_homogeneous()
    }

    /// Coefficients as `[tx, ty, tz, qw, qx, qy, qz]`.
    pub fn coeffs(&self) -> [f64; 7] {
        let q = self.rotation.quaternion();
        [
            self.translation.x,
            self.translation.y,
            self.translation.z,
            q.w,
            q.i,
            q.j,
            q.k,
        ]
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let trans_inv = -rot_inv.act(&self.translation);
        SE3 {
            rotation: rot_inv,
            translation: trans_inv,
        }
    }

    pub fn compose(&self, other: &SE3) -> Self {
        SE3 {
            rotation: self.rotation.compose(&other.rotation),
            translation: self.rotation.act(&other.translation) + self.translation,
        }
    }

    /// Transform a 3D point: `R p + t`.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.act(p) + self.translation
    }

    /// Transform a homogeneous point, preserving its `w` component.
    pub fn transform_hpoint(&self, p: &Vector4<f64>) -> Vector4<f64> {
        let xyz = self.transform_point(&p.xyz());
        Vector4::new(xyz.x, xyz.y, xyz.z, p.w)
    }

    /// Exponential map from a `[rho, theta]` tangent.
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let rho = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let theta = Vector3::new(tangent[3], tangent[4], tangent[5]);

        let rotation = SO3::exp(&theta);
        let translation = SO3::left_jacobian(&theta) * rho;
        SE3 {
            rotation,
            translation,
        }
    }

    /// Logarithmic map to a `[rho, theta]` tangent.
    pub fn log(&self) -> Vector6<f64> {
        let theta = self.rotation.log();
        let rho = SO3::left_jacobian_inv(&theta) * self.translation;

        let mut tangent = Vector6::zeros();
        tangent.fixed_rows_mut::<3>(0).copy_from(&rho);
        tangent.fixed_rows_mut::<3>(3).copy_from(&theta);
        tangent
    }

    /// Adjoint matrix: `Ad(T) = [[R, [t]x R], [0, R]]`.
    pub fn adjoint(&self) -> Matrix6<f64> {
        let rot = self.rotation.matrix();
        let mut adj = Matrix6::zeros();
        adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&rot);
        adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&rot);
        adj.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(skew(&self.translation) * rot));
        adj
    }

    /// Right perturbation: `T ∘ exp(delta)`.
    pub fn retract(&self, delta: &Vector6<f64>) -> Self {
        self.compose(&SE3::exp(delta))
    }

    /// Inverse right Jacobian of the log map, evaluated at the tangent `xi`.
    ///
    /// Used to chain residual Jacobians through `log`; exact closed form via
    /// the SO(3) blocks and the Q-block coupling term.
    pub fn inv_right_jacobian(xi: &Vector6<f64>) -> Matrix6<f64> {
        let rho = Vector3::new(xi[0], xi[1], xi[2]);
        let theta = Vector3::new(xi[3], xi[4], xi[5]);

        let jl_inv = SO3::left_jacobian_inv(&-theta);
        let q = Self::q_block(&-rho, &-theta);

        let mut jac = Matrix6::zeros();
        jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&jl_inv);
        jac.fixed_view_mut::<3, 3>(3, 3).copy_from(&jl_inv);
        jac.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-jl_inv * q * jl_inv));
        jac
    }

    /// Q-block of the SE(3) left Jacobian (translation/rotation coupling).
    fn q_block(rho: &Vector3<f64>, theta: &Vector3<f64>) -> Matrix3<f64> {
        let rho_skew = skew(rho);
        let theta_skew = skew(theta);
        let theta_squared = theta.norm_squared();

        let a = 0.5;
        let mut b = 1.0 / 6.0 + theta_squared / 120.0;
        let mut c = -1.0 / 24.0 + theta_squared / 720.0;
        let mut d = -1.0 / 60.0;

        if theta_squared > f64::EPSILON {
            let angle = theta_squared.sqrt();
            let angle_3 = angle * theta_squared;
            let angle_4 = theta_squared * theta_squared;
            let angle_5 = angle_3 * theta_squared;
            let sin_angle = angle.sin();
            let cos_angle = angle.cos();

            b = (angle - sin_angle) / angle_3;
            c = (1.0 - theta_squared / 2.0 - cos_angle) / angle_4;
            d = (c - 3.0) * (angle - sin_angle - angle_3 / 6.0) / angle_5;
        }

        let ts_rs = theta_skew * rho_skew;
        let rs_ts = rho_skew * theta_skew;
        let ts_rs_ts = theta_skew * rho_skew * theta_skew;
        let rs_ts_sq = rho_skew * theta_skew * theta_skew;

        let m1 = rho_skew;
        let m2 = ts_rs + rs_ts + ts_rs_ts;
        let m3 = rs_ts_sq - rs_ts_sq.transpose() - 3.0 * ts_rs_ts;
        let m4 = ts_rs_ts * theta_skew;

        m1 * a + m2 * b - m3 * c - m4 * d
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

impl fmt::Display for SE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.translation;
        let q = self.rotation.quaternion();
        write!(
            f,
            "SE3(t: [{:.4}, {:.4}, {:.4}], q: [{:.4}, {:.4}, {:.4}, {:.4}])",
            t.x, t.y, t.z, q.w, q.i, q.j, q.k
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    #[test]
    fn test_exp_log_roundtrip() {
        let xi = Vector6::new(0.5, -0.2, 0.1, 0.3, -0.1, 0.2);
        let pose = SE3::exp(&xi);
        assert!((pose.log() - xi).norm() < TOLERANCE);
    }

    #[test]
    fn test_compose_inverse() {
        let a = SE3::exp(&Vector6::new(1.0, 2.0, 3.0, 0.1, 0.2, 0.3));
        let identity = a.compose(&a.inverse());
        assert!(identity.log().norm() < TOLERANCE);
    }

    #[test]
    fn test_transform_point() {
        let pose = SE3::from_translation(1.0, 0.0, 0.0);
        let p = Vector3::new(0.0, 1.0, 0.0);
        assert!((pose.transform_point(&p) - Vector3::new(1.0, 1.0, 0.0)).norm() < TOLERANCE);
    }

    #[test]
    fn test_transform_hpoint_preserves_w() {
        let pose = SE3::exp(&Vector6::new(0.1, 0.2, 0.3, 0.0, 0.1, 0.0));
        let p = Vector4::new(1.0, 2.0, 3.0, 1.0);
        let q = pose.transform_hpoint(&p);
        assert!((q.w - 1.0).abs() < TOLERANCE);
        assert!((q.xyz() - pose.transform_point(&p.xyz())).norm() < TOLERANCE);
    }

    #[test]
    fn test_adjoint_relation() {
        // Ad(T) * xi == log(T * exp(xi) * T^-1)
        let pose = SE3::exp(&Vector6::new(0.3, -0.4, 0.5, 0.2, -0.1, 0.15));
        let xi = Vector6::new(0.01, 0.02, -0.01, 0.005, -0.002, 0.003);
        let lhs = pose.adjoint() * xi;
        let rhs = pose
            .compose(&SE3::exp(&xi))
            .compose(&pose.inverse())
            .log();
        assert!((lhs - rhs).norm() < 1e-5);
    }

    #[test]
    fn test_inv_right_jacobian_at_zero() {
        let jac = SE3::inv_right_jacobian(&Vector6::zeros());
        assert!((jac - Matrix6::identity()).norm() < TOLERANCE);
    }

    #[test]
    fn test_retract_matches_compose_exp() {
        let pose = SE3::from_translation(1.0, 2.0, 3.0);
        let delta = Vector6::new(0.1, 0.0, 0.0, 0.0, 0.0, 0.1);
        let a = pose.retract(&delta);
        let b = pose.compose(&SE3::exp(&delta));
        assert!((a.log() - b.log()).norm() < TOLERANCE);
    }
}
