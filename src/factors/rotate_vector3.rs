//! Rotation of an origin-frame vector into a world-frame velocity variable.
//!
//! Ties an endpoint velocity `v` to a submap pose `T` through the stored
//! origin-frame IMU velocity: `v = R(T) * v_local`.

use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::graph::{Factor, Variable};
use crate::manifold::skew;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateVector3Factor {
    pub v_local: Vector3<f64>,
    pub weight: f64,
}

impl RotateVector3Factor {
    pub fn from_precision(v_local: Vector3<f64>, precision: f64) -> Self {
        RotateVector3Factor {
            v_local,
            weight: precision.sqrt(),
        }
    }
}

impl Factor for RotateVector3Factor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose = params[0].as_pose().expect("rotate-vector3 expects a pose");
        let velocity = params[1]
            .as_velocity()
            .expect("rotate-vector3 expects a velocity");

        let rot = pose.rotation_matrix();
        let error = (rot * self.v_local - velocity) * self.weight;
        let residual = DVector::from_column_slice(error.as_slice());

        let jacobian = if compute_jacobian {
            // Right perturbation on the pose touches only the rotation block:
            // d(R Exp(theta) v)/d(theta) = -R [v]x
            let mut full = DMatrix::zeros(3, 9);
            let jac_theta = -rot * skew(&self.v_local) * self.weight;
            full.view_mut((0, 3), (3, 3)).copy_from(&jac_theta);
            for i in 0..3 {
                full[(i, 6 + i)] = -self.weight;
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
