//! Linear damping on a single pose.
//!
//! Anchors a pose at its value when the factor was created, with an isotropic
//! Hessian contribution of `scale * I`. Used to pin the gauge at `x0` and to
//! stabilize variables named by an indeterminate-system failure.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::graph::{Factor, Variable};
use crate::manifold::SE3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseDampingFactor {
    pub anchor: SE3,
    pub scale: f64,
}

impl PoseDampingFactor {
    pub fn new(anchor: SE3, scale: f64) -> Self {
        PoseDampingFactor { anchor, scale }
    }
}

impl Factor for PoseDampingFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose = params[0].as_pose().expect("damping factor expects a pose");
        let weight = self.scale.sqrt();

        let error = self.anchor.inverse().compose(pose).log();
        let residual = DVector::from_iterator(6, error.iter().map(|v| weight * v));

        let jacobian = if compute_jacobian {
            let jac = weight * SE3::inv_right_jacobian(&error);
            let mut full = DMatrix::zeros(6, 6);
            full.view_mut((0, 0), (6, 6)).copy_from(&jac);
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

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector6;

    #[test]
    fn test_zero_residual_at_anchor() {
        let anchor = SE3::from_translation(1.0, 2.0, 3.0);
        let factor = PoseDampingFactor::new(anchor.clone(), 1e10);
        let var = Variable::Pose(anchor);
        let (residual, _) = factor.linearize(&[&var], false);
        assert!(residual.norm() < 1e-6);
    }

    #[test]
    fn test_hessian_scale_at_anchor() {
        let anchor = SE3::identity();
        let factor = PoseDampingFactor::new(anchor.clone(), 1e4);
        let var = Variable::Pose(anchor);
        let (_, jacobian) = factor.linearize(&[&var], true);
        let jac = jacobian.expect("jacobian requested");
        let hessian = jac.transpose() * &jac;
        for i in 0..6 {
            assert!((hessian[(i, i)] - 1e4).abs() / 1e4 < 1e-9);
        }
    }

    #[test]
    fn test_pulls_toward_anchor() {
        let anchor = SE3::identity();
        let factor = PoseDampingFactor::new(anchor, 100.0);
        let var = Variable::Pose(SE3::exp(&Vector6::new(0.1, 0.0, 0.0, 0.0, 0.0, 0.05)));
        let (residual, _) = factor.linearize(&[&var], false);
        assert!(residual.norm() > 0.1);
    }
}
