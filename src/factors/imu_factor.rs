//! Preintegrated IMU factor over two endpoint states.
//!
//! Connects `[E_i, V_i, E_j, V_j, B_i]` through the preintegrated motion,
//! with first-order bias correction at the stored linearization bias. The
//! residual ordering is `[r_theta, r_v, r_p]`, whitened by the square-root
//! information of the propagated preintegration covariance.

use nalgebra::{DMatrix, DVector, Matrix3, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::graph::{Factor, Variable};
use crate::imu::{Matrix9, PreintegratedImu, GRAVITY};
use crate::manifold::{skew, SO3};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuFactor {
    pub preint: PreintegratedImu,
    sqrt_info: Matrix9,
}

impl ImuFactor {
    pub fn new(preint: PreintegratedImu) -> Self {
        // Whiten by the propagated covariance; the ridge keeps a short or
        // noise-free integration window invertible.
        let info = (preint.cov + Matrix9::identity() * 1e-10)
            .try_inverse()
            .unwrap_or_else(Matrix9::identity);
        let sqrt_info = match nalgebra::Cholesky::new(info) {
            Some(chol) => chol.l().transpose(),
            None => Matrix9::identity(),
        };
        ImuFactor { preint, sqrt_info }
    }

    fn gravity() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -GRAVITY)
    }
}

impl Factor for ImuFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose_i = params[0].as_pose().expect("imu factor expects pose i");
        let vel_i = params[1].as_velocity().expect("imu factor expects vel i");
        let pose_j = params[2].as_pose().expect("imu factor expects pose j");
        let vel_j = params[3].as_velocity().expect("imu factor expects vel j");
        let bias_i = params[4].as_bias().expect("imu factor expects bias i");

        let dt = self.preint.dt;
        let gravity = Self::gravity();

        let rot_i = pose_i.rotation_matrix();
        let rot_i_t = rot_i.transpose();
        let p_i = pose_i.translation();
        let p_j = pose_j.translation();

        // First-order bias correction around the stored linearization bias
        let delta_bias = bias_i - self.preint.bias;
        let delta_ba: Vector3<f64> = delta_bias.fixed_rows::<3>(0).into();
        let delta_bg: Vector3<f64> = delta_bias.fixed_rows::<3>(3).into();

        let corrected_rot = self
            .preint
            .delta_rot
            .compose(&SO3::exp(&(self.preint.j_r_bg * delta_bg)));
        let corrected_vel =
            self.preint.delta_vel + self.preint.j_v_bg * delta_bg + self.preint.j_v_ba * delta_ba;
        let corrected_pos =
            self.preint.delta_pos + self.preint.j_p_bg * delta_bg + self.preint.j_p_ba * delta_ba;

        // r_theta = Log(dR'^T R_i^T R_j)
        let rot_err = corrected_rot
            .inverse()
            .compose(&pose_i.rotation().inverse())
            .compose(pose_j.rotation());
        let r_theta = rot_err.log();
        let r_v = rot_i_t * (vel_j - vel_i - gravity * dt) - corrected_vel;
        let r_p =
            rot_i_t * (p_j - p_i - vel_i * dt - 0.5 * gravity * dt * dt) - corrected_pos;

        let mut raw = SVector::<f64, 9>::zeros();
        raw.fixed_rows_mut::<3>(0).copy_from(&r_theta);
        raw.fixed_rows_mut::<3>(3).copy_from(&r_v);
        raw.fixed_rows_mut::<3>(6).copy_from(&r_p);
        let weighted = self.sqrt_info * raw;
        let residual = DVector::from_column_slice(weighted.as_slice());

        let jacobian = if compute_jacobian {
            let jr_inv = SO3::right_jacobian_inv(&r_theta);
            let rot_j_t_rot_i = pose_j.rotation_matrix().transpose() * rot_i;

            // Raw Jacobian over [xi_i(6), v_i(3), xi_j(6), v_j(3), b_i(6)]
            let mut jac = DMatrix::zeros(9, 24);

            // r_theta
            jac.view_mut((0, 3), (3, 3))
                .copy_from(&(-jr_inv * rot_j_t_rot_i));
            jac.view_mut((0, 12), (3, 3)).copy_from(&jr_inv);
            jac.view_mut((0, 21), (3, 3))
                .copy_from(&(-jr_inv * self.preint.j_r_bg));

            // r_v
            jac.view_mut((3, 3), (3, 3))
                .copy_from(&skew(&(rot_i_t * (vel_j - vel_i - gravity * dt))));
            jac.view_mut((3, 6), (3, 3)).copy_from(&(-rot_i_t));
            jac.view_mut((3, 15), (3, 3)).copy_from(&rot_i_t);
            jac.view_mut((3, 18), (3, 3))
                .copy_from(&(-self.preint.j_v_ba));
            jac.view_mut((3, 21), (3, 3))
                .copy_from(&(-self.preint.j_v_bg));

            // r_p; translation perturbations are body-frame under the right
            // perturbation convention, so d(p_i)/d(rho_i) = R_i
            jac.view_mut((6, 0), (3, 3))
                .copy_from(&(-Matrix3::identity()));
            jac.view_mut((6, 3), (3, 3)).copy_from(&skew(
                &(rot_i_t * (p_j - p_i - vel_i * dt - 0.5 * gravity * dt * dt)),
            ));
            jac.view_mut((6, 6), (3, 3))
                .copy_from(&(-rot_i_t * dt));
            jac.view_mut((6, 12), (3, 3)).copy_from(&rot_j_t_rot_i.transpose());
            jac.view_mut((6, 18), (3, 3))
                .copy_from(&(-self.preint.j_p_ba));
            jac.view_mut((6, 21), (3, 3))
                .copy_from(&(-self.preint.j_p_bg));

            // Whiten all blocks
            let mut weighted_jac = DMatrix::zeros(9, 24);
            for col in 0..24 {
                let column: SVector<f64, 9> =
                    SVector::from_iterator((0..9).map(|row| jac[(row, col)]));
                let whitened = self.sqrt_info * column;
                for row in 0..9 {
                    weighted_jac[(row, col)] = whitened[row];
                }
            }
            Some(weighted_jac)
        } else {
            None
        };

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::ImuIntegration;
    use crate::manifold::SE3;
    use nalgebra::Vector6;

    #[test]
    fn test_zero_residual_for_consistent_states() {
        // Constant forward acceleration while gravity is compensated
        let mut integration = ImuIntegration::new();
        for i in 0..101 {
            integration.insert_imu(
                i as f64 * 0.01,
                Vector3::new(1.0, 0.0, GRAVITY),
                Vector3::zeros(),
            );
        }
        let (preint, _, _) = integration.integrate(0.0, 1.0, &Vector6::zeros());
        let factor = ImuFactor::new(preint);

        let pose_i = Variable::Pose(SE3::identity());
        let vel_i = Variable::Velocity(Vector3::zeros());
        // After 1 s: v = (1, 0, 0), p = (0.5, 0, 0)
        let pose_j = Variable::Pose(SE3::from_translation(0.5, 0.0, 0.0));
        let vel_j = Variable::Velocity(Vector3::new(1.0, 0.0, 0.0));
        let bias = Variable::Bias(Vector6::zeros());

        let (residual, _) =
            factor.linearize(&[&pose_i, &vel_i, &pose_j, &vel_j, &bias], false);
        // The residual is whitened, so compare against a loose bound scaled
        // by the integration noise.
        let raw_norm = residual.norm() * factor.preint.cov.trace().sqrt().max(1e-6);
        assert!(raw_norm < 1e-2, "raw-ish residual too large: {raw_norm}");
    }

    #[test]
    fn test_residual_grows_with_velocity_error() {
        let mut integration = ImuIntegration::new();
        for i in 0..11 {
            integration.insert_imu(
                i as f64 * 0.01,
                Vector3::new(0.0, 0.0, GRAVITY),
                Vector3::zeros(),
            );
        }
        let (preint, _, _) = integration.integrate(0.0, 0.1, &Vector6::zeros());
        let factor = ImuFactor::new(preint);

        let pose_i = Variable::Pose(SE3::identity());
        let vel_i = Variable::Velocity(Vector3::zeros());
        let pose_j = Variable::Pose(SE3::identity());
        let bias = Variable::Bias(Vector6::zeros());

        let vel_good = Variable::Velocity(Vector3::zeros());
        let vel_bad = Variable::Velocity(Vector3::new(5.0, 0.0, 0.0));

        let (r_good, _) =
            factor.linearize(&[&pose_i, &vel_i, &pose_j, &vel_good, &bias], false);
        let (r_bad, _) =
            factor.linearize(&[&pose_i, &vel_i, &pose_j, &vel_bad, &bias], false);
        assert!(r_bad.norm() > r_good.norm());
    }

    #[test]
    fn test_jacobian_shape() {
        let preint = PreintegratedImu::identity(Vector6::zeros());
        let factor = ImuFactor::new(preint);
        let pose = Variable::Pose(SE3::identity());
        let vel = Variable::Velocity(Vector3::zeros());
        let bias = Variable::Bias(Vector6::zeros());
        let (_, jacobian) = factor.linearize(&[&pose, &vel, &pose, &vel, &bias], true);
        let jac = jacobian.expect("jacobian requested");
        assert_eq!((jac.nrows(), jac.ncols()), (9, 24));
    }
}
