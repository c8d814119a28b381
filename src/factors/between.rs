//! Binary between-factors on poses, biases, and velocities.

use nalgebra::{DMatrix, DVector, Matrix6};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::graph::{Factor, Variable};
use crate::manifold::SE3;

/// Relative-pose constraint: `r = W log(Z^-1 T_i^-1 T_j)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseBetweenFactor {
    pub delta: SE3,
    pub sqrt_info: Matrix6<f64>,
}

impl PoseBetweenFactor {
    /// Isotropic precision on all 6 DoF.
    pub fn from_precision(delta: SE3, precision: f64) -> Self {
        PoseBetweenFactor {
            delta,
            sqrt_info: Matrix6::identity() * precision.sqrt(),
        }
    }

    /// Full 6x6 information matrix, whitened through its Cholesky factor.
    /// Falls back to the diagonal if the information matrix is not positive
    /// definite.
    pub fn from_information(delta: SE3, information: Matrix6<f64>) -> Self {
        let sqrt_info = match nalgebra::Cholesky::new(information) {
            Some(chol) => chol.l().transpose(),
            None => {
                warn!("between-factor information matrix is not positive definite, using its diagonal");
                Matrix6::from_diagonal(&information.diagonal().map(|v| v.abs().sqrt()))
            }
        };
        PoseBetweenFactor { delta, sqrt_info }
    }
}

impl Factor for PoseBetweenFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose_i = params[0].as_pose().expect("between factor expects poses");
        let pose_j = params[1].as_pose().expect("between factor expects poses");

        let error = self
            .delta
            .inverse()
            .compose(&pose_i.inverse())
            .compose(pose_j)
            .log();
        let weighted = self.sqrt_info * error;
        let residual = DVector::from_column_slice(weighted.as_slice());

        let jacobian = if compute_jacobian {
            let inv_jr = SE3::inv_right_jacobian(&error);
            let jac_j = self.sqrt_info * inv_jr;
            let jac_i = -self.sqrt_info * inv_jr * pose_j.inverse().compose(pose_i).adjoint();

            let mut full = DMatrix::zeros(6, 12);
            full.view_mut((0, 0), (6, 6)).copy_from(&jac_i);
            full.view_mut((0, 6), (6, 6)).copy_from(&jac_j);
            Some(full)
        } else {
            None
        };

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        6
    }
}

/// Bias random-walk constraint between the two endpoints of a submap:
/// `r = w (b_j - b_i)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasBetweenFactor {
    pub weight: f64,
}

impl BiasBetweenFactor {
    pub fn from_precision(precision: f64) -> Self {
        BiasBetweenFactor {
            weight: precision.sqrt(),
        }
    }
}

impl Factor for BiasBetweenFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let bias_i = params[0].as_bias().expect("bias between expects biases");
        let bias_j = params[1].as_bias().expect("bias between expects biases");

        let error = (bias_j - bias_i) * self.weight;
        let residual = DVector::from_column_slice(error.as_slice());

        let jacobian = if compute_jacobian {
            let mut full = DMatrix::zeros(6, 12);
            for i in 0..6 {
                full[(i, i)] = -self.weight;
                full[(i, i + 6)] = self.weight;
            }
            Some(full)
        } else {
            None
        };

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        6
    }
}

/// Zero-difference constraint on two velocities; the fallback when too few
/// IMU samples were available between submaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityBetweenFactor {
    pub weight: f64,
}

impl VelocityBetweenFactor {
    pub fn from_precision(precision: f64) -> Self {
        VelocityBetweenFactor {
            weight: precision.sqrt(),
        }
    }
}

impl Factor for VelocityBetweenFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let v_i = params[0]
            .as_velocity()
            .expect("velocity between expects velocities");
        let v_j = params[1]
            .as_velocity()
            .expect("velocity between expects velocities");

        let error = (v_j - v_i) * self.weight;
        let residual = DVector::from_column_slice(error.as_slice());

        let jacobian = if compute_jacobian {
            let mut full = DMatrix::zeros(3, 6);
            for i in 0..3 {
                full[(i, i)] = -self.weight;
                full[(i, i + 3)] = self.weight;
            }
            Some(full)
        } else {
            None
        };

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Vector3, Vector6};

    #[test]
    fn test_pose_between_zero_at_measurement() {
        let delta = SE3::from_translation(1.0, 0.0, 0.0);
        let factor = PoseBetweenFactor::from_precision(delta.clone(), 1e6);
        let t_i = Variable::Pose(SE3::identity());
        let t_j = Variable::Pose(delta);
        let (residual, _) = factor.linearize(&[&t_i, &t_j], false);
        assert!(residual.norm() < 1e-6);
    }

    #[test]
    fn test_pose_between_jacobian_shape() {
        let factor = PoseBetweenFactor::from_precision(SE3::identity(), 1.0);
        let t_i = Variable::Pose(SE3::identity());
        let t_j = Variable::Pose(SE3::from_translation(0.1, 0.0, 0.0));
        let (residual, jacobian) = factor.linearize(&[&t_i, &t_j], true);
        assert_eq!(residual.len(), 6);
        let jac = jacobian.expect("jacobian requested");
        assert_eq!((jac.nrows(), jac.ncols()), (6, 12));
    }

    #[test]
    fn test_pose_between_jacobian_numeric() {
        // Compare against central differences on both variables
        let delta = SE3::exp(&Vector6::new(0.5, -0.2, 0.1, 0.05, -0.03, 0.08));
        let factor = PoseBetweenFactor::from_precision(delta, 1.0);
        let pose_i = SE3::exp(&Vector6::new(0.1, 0.2, -0.1, 0.02, 0.01, -0.03));
        let pose_j = SE3::exp(&Vector6::new(0.6, 0.0, 0.0, 0.07, -0.02, 0.05));

        let vi = Variable::Pose(pose_i.clone());
        let vj = Variable::Pose(pose_j.clone());
        let (_, jacobian) = factor.linearize(&[&vi, &vj], true);
        let jac = jacobian.expect("jacobian");

        let eps = 1e-6;
        for col in 0..12 {
            let mut step = Vector6::zeros();
            step[col % 6] = eps;

            let (pi_p, pj_p, pi_m, pj_m) = if col < 6 {
                (
                    pose_i.retract(&step),
                    pose_j.clone(),
                    pose_i.retract(&-step),
                    pose_j.clone(),
                )
            } else {
                (
                    pose_i.clone(),
                    pose_j.retract(&step),
                    pose_i.clone(),
                    pose_j.retract(&-step),
                )
            };

            let (r_plus, _) =
                factor.linearize(&[&Variable::Pose(pi_p), &Variable::Pose(pj_p)], false);
            let (r_minus, _) =
                factor.linearize(&[&Variable::Pose(pi_m), &Variable::Pose(pj_m)], false);

            for row in 0..6 {
                let numeric = (r_plus[row] - r_minus[row]) / (2.0 * eps);
                assert!(
                    (jac[(row, col)] - numeric).abs() < 1e-4,
                    "jacobian mismatch at ({row}, {col}): analytic {} vs numeric {}",
                    jac[(row, col)],
                    numeric
                );
            }
        }
    }

    #[test]
    fn test_from_information_roundtrip() {
        let mut info = Matrix6::identity() * 4.0;
        info[(0, 1)] = 0.5;
        info[(1, 0)] = 0.5;
        let factor = PoseBetweenFactor::from_information(SE3::identity(), info);
        let recovered = factor.sqrt_info.transpose() * factor.sqrt_info;
        assert!((recovered - info).norm() < 1e-9);
    }

    #[test]
    fn test_velocity_between_zero_difference() {
        let factor = VelocityBetweenFactor::from_precision(1.0);
        let v_i = Variable::Velocity(Vector3::new(1.0, 2.0, 3.0));
        let v_j = Variable::Velocity(Vector3::new(1.0, 2.0, 3.0));
        let (residual, _) = factor.linearize(&[&v_i, &v_j], false);
        assert!(residual.norm() < 1e-12);
    }

    #[test]
    fn test_bias_between_residual_sign() {
        let factor = BiasBetweenFactor::from_precision(1.0);
        let b_i = Variable::Bias(Vector6::zeros());
        let b_j = Variable::Bias(Vector6::repeat(0.5));
        let (residual, _) = factor.linearize(&[&b_i, &b_j], false);
        assert!((residual[0] - 0.5).abs() < 1e-12);
    }
}
