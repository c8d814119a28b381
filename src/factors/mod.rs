//! Factor implementations for the global mapping graph.
//!
//! Every constraint the assembler can emit lives behind one tagged enum,
//! [`GraphFactor`], dispatching the [`Factor`](crate::graph::Factor) trait.
//! The tag drives two decisions downstream:
//!
//! - the save path partitions factors into a serializable subset
//!   ([`SerializableFactor`]) and the registration factors, which are
//!   reconstructed from submap data on reload;
//! - graph recovery identifies damping priors, IMU factors, and the
//!   per-kind edges it may need to re-add.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

pub mod between;
pub mod damping;
pub mod imu_factor;
pub mod prior;
pub mod registration;
pub mod rotate_vector3;

pub use between::{BiasBetweenFactor, PoseBetweenFactor, VelocityBetweenFactor};
pub use damping::PoseDampingFactor;
pub use imu_factor::ImuFactor;
pub use prior::{BiasPriorFactor, PosePriorFactor};
pub use registration::{IntegratedGicpFactor, IntegratedVgicpFactor};
pub use rotate_vector3::RotateVector3Factor;

use crate::graph::{Factor, Variable};

/// Factor-specific error types.
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Registration factors cannot be serialized; they are rebuilt on load")]
    NotSerializable,
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Discriminant of a factor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorTag {
    Damping,
    PriorPose,
    PriorBias,
    BetweenPose,
    BetweenBias,
    BetweenVelocity,
    RotateVector3,
    Imu,
    Gicp,
    Vgicp,
    VgicpGpu,
}

impl FactorTag {
    /// Type string used in the `graph.txt` matching-cost lines.
    pub fn matching_cost_name(&self) -> Option<&'static str> {
        match self {
            FactorTag::Gicp => Some("gicp"),
            FactorTag::Vgicp => Some("vgicp"),
            FactorTag::VgicpGpu => Some("vgicp_gpu"),
            _ => None,
        }
    }
}

/// All factor kinds the graph can hold.
#[derive(Debug, Clone)]
pub enum GraphFactor {
    Damping(PoseDampingFactor),
    PriorPose(PosePriorFactor),
    PriorBias(BiasPriorFactor),
    BetweenPose(PoseBetweenFactor),
    BetweenBias(BiasBetweenFactor),
    BetweenVelocity(VelocityBetweenFactor),
    RotateVector3(RotateVector3Factor),
    Imu(ImuFactor),
    Gicp(IntegratedGicpFactor),
    Vgicp(IntegratedVgicpFactor),
}

impl GraphFactor {
    pub fn tag(&self) -> FactorTag {
        match self {
            GraphFactor::Damping(_) => FactorTag::Damping,
            GraphFactor::PriorPose(_) => FactorTag::PriorPose,
            GraphFactor::PriorBias(_) => FactorTag::PriorBias,
            GraphFactor::BetweenPose(_) => FactorTag::BetweenPose,
            GraphFactor::BetweenBias(_) => FactorTag::BetweenBias,
            GraphFactor::BetweenVelocity(_) => FactorTag::BetweenVelocity,
            GraphFactor::RotateVector3(_) => FactorTag::RotateVector3,
            GraphFactor::Imu(_) => FactorTag::Imu,
            GraphFactor::Gicp(_) => FactorTag::Gicp,
            GraphFactor::Vgicp(factor) => {
                if factor.gpu_tagged {
                    FactorTag::VgicpGpu
                } else {
                    FactorTag::Vgicp
                }
            }
        }
    }

    /// Whether this factor is a registration (matching-cost) factor.
    pub fn is_matching_cost(&self) -> bool {
        matches!(self, GraphFactor::Gicp(_) | GraphFactor::Vgicp(_))
    }

    fn dispatch(&self) -> &dyn Factor {
        match self {
            GraphFactor::Damping(f) => f,
            GraphFactor::PriorPose(f) => f,
            GraphFactor::PriorBias(f) => f,
            GraphFactor::BetweenPose(f) => f,
            GraphFactor::BetweenBias(f) => f,
            GraphFactor::BetweenVelocity(f) => f,
            GraphFactor::RotateVector3(f) => f,
            GraphFactor::Imu(f) => f,
            GraphFactor::Gicp(f) => f,
            GraphFactor::Vgicp(f) => f,
        }
    }
}

impl Factor for GraphFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        self.dispatch().linearize(params, compute_jacobian)
    }

    fn dimension(&self) -> usize {
        self.dispatch().dimension()
    }
}

/// The serializable subset of [`GraphFactor`]: everything but the
/// registration factors, which hold shared point clouds and voxel maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerializableFactor {
    Damping(PoseDampingFactor),
    PriorPose(PosePriorFactor),
    PriorBias(BiasPriorFactor),
    BetweenPose(PoseBetweenFactor),
    BetweenBias(BiasBetweenFactor),
    BetweenVelocity(VelocityBetweenFactor),
    RotateVector3(RotateVector3Factor),
    Imu(ImuFactor),
}

impl TryFrom<&GraphFactor> for SerializableFactor {
    type Error = FactorError;

    fn try_from(factor: &GraphFactor) -> Result<Self, Self::Error> {
        match factor {
            GraphFactor::Damping(f) => Ok(SerializableFactor::Damping(f.clone())),
            GraphFactor::PriorPose(f) => Ok(SerializableFactor::PriorPose(f.clone())),
            GraphFactor::PriorBias(f) => Ok(SerializableFactor::PriorBias(f.clone())),
            GraphFactor::BetweenPose(f) => Ok(SerializableFactor::BetweenPose(f.clone())),
            GraphFactor::BetweenBias(f) => Ok(SerializableFactor::BetweenBias(f.clone())),
            GraphFactor::BetweenVelocity(f) => Ok(SerializableFactor::BetweenVelocity(f.clone())),
            GraphFactor::RotateVector3(f) => Ok(SerializableFactor::RotateVector3(f.clone())),
            GraphFactor::Imu(f) => Ok(SerializableFactor::Imu(f.clone())),
            GraphFactor::Gicp(_) | GraphFactor::Vgicp(_) => Err(FactorError::NotSerializable),
        }
    }
}

impl From<SerializableFactor> for GraphFactor {
    fn from(factor: SerializableFactor) -> Self {
        match factor {
            SerializableFactor::Damping(f) => GraphFactor::Damping(f),
            SerializableFactor::PriorPose(f) => GraphFactor::PriorPose(f),
            SerializableFactor::PriorBias(f) => GraphFactor::PriorBias(f),
            SerializableFactor::BetweenPose(f) => GraphFactor::BetweenPose(f),
            SerializableFactor::BetweenBias(f) => GraphFactor::BetweenBias(f),
            SerializableFactor::BetweenVelocity(f) => GraphFactor::BetweenVelocity(f),
            SerializableFactor::RotateVector3(f) => GraphFactor::RotateVector3(f),
            SerializableFactor::Imu(f) => GraphFactor::Imu(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::SE3;

    #[test]
    fn test_tag_partition() {
        let between = GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
            SE3::identity(),
            1e6,
        ));
        assert!(!between.is_matching_cost());
        assert!(SerializableFactor::try_from(&between).is_ok());
        assert_eq!(between.tag().matching_cost_name(), None);
    }

    #[test]
    fn test_matching_cost_names() {
        assert_eq!(FactorTag::Vgicp.matching_cost_name(), Some("vgicp"));
        assert_eq!(FactorTag::VgicpGpu.matching_cost_name(), Some("vgicp_gpu"));
        assert_eq!(FactorTag::Gicp.matching_cost_name(), Some("gicp"));
    }

    #[test]
    fn test_serializable_roundtrip() {
        let factor = GraphFactor::Damping(PoseDampingFactor::new(SE3::identity(), 1e10));
        let serializable = SerializableFactor::try_from(&factor).expect("serializable");
        let bytes = bincode::serialize(&serializable).expect("serialize");
        let restored: SerializableFactor = bincode::deserialize(&bytes).expect("deserialize");
        let roundtrip: GraphFactor = restored.into();
        assert_eq!(roundtrip.tag(), FactorTag::Damping);
    }
}
