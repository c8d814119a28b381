//! IMU sample buffering and preintegration.
//!
//! The back end receives high-rate IMU samples through `insert_imu` and, when
//! a new submap arrives, asks for the preintegrated motion between the last
//! and current submap endpoints. Integration uses midpoint quadrature and
//! propagates the 9x9 covariance of `[dtheta, dv, dp]` together with the
//! first-order bias-correction Jacobians.
//!
//! Bias vectors are ordered `[accel, gyro]`.

use nalgebra::{Matrix3, SMatrix, Vector3, Vector6};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::manifold::{skew, SO3};

/// 9x9 covariance of the preintegrated state `[dtheta, dv, dp]`.
pub type Matrix9 = SMatrix<f64, 9, 9>;

/// Gravity along -z in the world frame.
pub const GRAVITY: f64 = 9.80665;

// Continuous-time noise densities; conservative MEMS-grade defaults.
const ACC_NOISE: f64 = 1e-2;
const GYRO_NOISE: f64 = 1e-3;

/// A single IMU measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub stamp: f64,
    pub linear_acc: Vector3<f64>,
    pub angular_vel: Vector3<f64>,
}

/// Preintegrated motion between two endpoint stamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreintegratedImu {
    pub delta_rot: SO3,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
    /// Covariance of `[dtheta, dv, dp]`.
    pub cov: Matrix9,
    /// Bias linearization point `[accel, gyro]`.
    pub bias: Vector6<f64>,
    // First-order bias correction Jacobians
    pub j_r_bg: Matrix3<f64>,
    pub j_v_bg: Matrix3<f64>,
    pub j_v_ba: Matrix3<f64>,
    pub j_p_bg: Matrix3<f64>,
    pub j_p_ba: Matrix3<f64>,
}

impl PreintegratedImu {
    pub fn identity(bias: Vector6<f64>) -> Self {
        PreintegratedImu {
            delta_rot: SO3::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
            cov: Matrix9::zeros(),
            bias,
            j_r_bg: Matrix3::zeros(),
            j_v_bg: Matrix3::zeros(),
            j_v_ba: Matrix3::zeros(),
            j_p_bg: Matrix3::zeros(),
            j_p_ba: Matrix3::zeros(),
        }
    }

    fn accel_bias(&self) -> Vector3<f64> {
        self.bias.fixed_rows::<3>(0).into()
    }

    fn gyro_bias(&self) -> Vector3<f64> {
        self.bias.fixed_rows::<3>(3).into()
    }

    /// Integrate one midpoint step between two samples.
    fn integrate(&mut self, prev: &ImuSample, curr: &ImuSample) {
        let dt = curr.stamp - prev.stamp;
        if dt <= 0.0 {
            return;
        }

        let omega = 0.5 * (prev.angular_vel + curr.angular_vel) - self.gyro_bias();
        let accel = 0.5 * (prev.linear_acc + curr.linear_acc) - self.accel_bias();

        let rot = self.delta_rot.matrix();
        let accel_skew = skew(&accel);
        let theta_step = omega * dt;
        let step_rot = SO3::exp(&theta_step);
        let step_rot_mat = step_rot.matrix();
        let jr_step = SO3::right_jacobian(&theta_step);

        // Covariance propagation: cov <- A cov A^T + B Sigma B^T
        let mut a = Matrix9::identity();
        a.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&step_rot_mat.transpose());
        a.fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-rot * accel_skew * dt));
        a.fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * rot * accel_skew * dt * dt));
        a.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));

        let mut b = SMatrix::<f64, 9, 6>::zeros();
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr_step * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(rot * dt));
        b.fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * rot * dt * dt));

        let mut sigma = SMatrix::<f64, 6, 6>::zeros();
        let gyro_var = GYRO_NOISE * GYRO_NOISE * dt;
        let acc_var = ACC_NOISE * ACC_NOISE * dt;
        for i in 0..3 {
            sigma[(i, i)] = gyro_var;
            sigma[(i + 3, i + 3)] = acc_var;
        }

        self.cov = a * self.cov * a.transpose() + b * sigma * b.transpose();

        // Bias-correction Jacobians (first order)
        self.j_p_ba += self.j_v_ba * dt - 0.5 * rot * dt * dt;
        self.j_p_bg += self.j_v_bg * dt - 0.5 * rot * accel_skew * self.j_r_bg * dt * dt;
        self.j_v_ba -= rot * dt;
        self.j_v_bg -= rot * accel_skew * self.j_r_bg * dt;
        self.j_r_bg = step_rot_mat.transpose() * self.j_r_bg - jr_step * dt;

        // State propagation
        self.delta_pos += self.delta_vel * dt + 0.5 * rot * accel * dt * dt;
        self.delta_vel += rot * accel * dt;
        self.delta_rot = self.delta_rot.compose(&step_rot);
        self.dt += dt;
    }
}

/// Buffered IMU stream with an integrate/erase cursor interface.
#[derive(Debug, Default)]
pub struct ImuIntegration {
    samples: Vec<ImuSample>,
}

impl ImuIntegration {
    pub fn new() -> Self {
        ImuIntegration {
            samples: Vec::new(),
        }
    }

    pub fn insert_imu(&mut self, stamp: f64, linear_acc: Vector3<f64>, angular_vel: Vector3<f64>) {
        if let Some(last) = self.samples.last() {
            if stamp < last.stamp {
                warn!(
                    "IMU stamp regression: {:.6} after {:.6}, sample dropped",
                    stamp, last.stamp
                );
                return;
            }
        }
        self.samples.push(ImuSample {
            stamp,
            linear_acc,
            angular_vel,
        });
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Preintegrate all samples with stamps in `[t0, t1]` under the given
    /// bias. Returns the preintegrated motion, the number of samples used,
    /// and the read cursor up to which the buffer may be erased.
    pub fn integrate(
        &self,
        t0: f64,
        t1: f64,
        bias: &Vector6<f64>,
    ) -> (PreintegratedImu, usize, usize) {
        let mut preint = PreintegratedImu::identity(*bias);

        let begin = self.samples.partition_point(|s| s.stamp < t0);
        let end = self.samples.partition_point(|s| s.stamp <= t1);
        let window = &self.samples[begin..end];

        for pair in window.windows(2) {
            preint.integrate(&pair[0], &pair[1]);
        }

        (preint, window.len(), end)
    }

    /// Drop all samples before the read cursor.
    pub fn erase_imu_data(&mut self, cursor: usize) {
        let cursor = cursor.min(self.samples.len());
        self.samples.drain(..cursor);
    }
}
