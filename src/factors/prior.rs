//! Unary priors on poses and biases.

use nalgebra::{DMatrix, DVector, Matrix6};
use serde::{Deserialize, Serialize};

use crate::graph::{Factor, Variable};
use crate::manifold::SE3;

/// Prior on an SE(3) pose: `r = W log(prior^-1 T)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePriorFactor {
    pub prior: SE3,
    pub sqrt_info: Matrix6<f64>,
}

impl PosePriorFactor {
    pub fn from_precision(prior: SE3, precision: f64) -> Self {
        PosePriorFactor {
            prior,
            sqrt_info: Matrix6::identity() * precision.sqrt(),
        }
    }
}

impl Factor for PosePriorFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose = params[0].as_pose().expect("pose prior expects a pose");

        let error = self.prior.inverse().compose(pose).log();
        let weighted = self.sqrt_info * error;
        let residual = DVector::from_column_slice(weighted.as_slice());

        let jacobian = if compute_jacobian {
            let jac = self.sqrt_info * SE3::inv_right_jacobian(&error);
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

/// Prior on an IMU bias: `r = w (b - prior)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasPriorFactor {
    pub prior: nalgebra::Vector6<f64>,
    pub weight: f64,
}

impl BiasPriorFactor {
    pub fn from_precision(prior: nalgebra::Vector6<f64>, precision: f64) -> Self {
        BiasPriorFactor {
            prior,
            weight: precision.sqrt(),
        }
    }
}

impl Factor for BiasPriorFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let bias = params[0].as_bias().expect("bias prior expects a bias");

        let error = (bias - self.prior) * self.weight;
        let residual = DVector::from_column_slice(error.as_slice());

        let jacobian = if compute_jacobian {
            Some(DMatrix::identity(6, 6) * self.weight)
        } else {
            None
        };

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        6
    }
}
