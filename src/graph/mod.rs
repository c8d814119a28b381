//! Typed factor graph over submap poses and IMU endpoint states.
//!
//! The graph couples four families of variables, keyed by a single letter and
//! an integer index exactly as the smoother exposes them:
//!
//! - `x{i}`: submap-origin pose in the world frame
//! - `e{2i}`, `e{2i+1}`: IMU pose at the left/right endpoint of submap `i`
//! - `v{2i}`, `v{2i+1}`: world-frame IMU velocity at the endpoints
//! - `b{2i}`, `b{2i+1}`: IMU bias at the endpoints
//!
//! Factors connect variables through the [`Factor`](factor::Factor) trait;
//! [`linearizer`] stacks their residual blocks into one sparse system and
//! [`optimizer`] iterates Gauss-Newton / Dogleg over it.

use thiserror::Error;
use tracing::error;

pub mod factor;
pub mod key;
pub mod linearizer;
pub mod optimizer;
pub mod values;

pub use factor::{Factor, FactorEntry, FactorGraph};
pub use key::Key;
pub use values::{Values, Variable};

use crate::linalg::LinAlgError;

/// Errors raised while assembling or solving the factor graph.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// The linear system could not be factorized; `nearby` names the variable
    /// whose Hessian block is the most deficient.
    #[error("Indeterminate linear system near variable {nearby}")]
    IndeterminateLinearSystem { nearby: Key },

    /// A factor references a variable that is not present in the values
    #[error("Factor references missing variable {0}")]
    MissingVariable(Key),

    /// A factor was given a variable of the wrong kind (e.g. a velocity where
    /// a pose was expected)
    #[error("Variable {0} has unexpected kind for this factor")]
    VariableKindMismatch(Key),

    /// Sparse assembly failed
    #[error("Failed to assemble sparse system: {0}")]
    SparseAssembly(String),

    /// Underlying linear algebra failure without an identified variable
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),
}

impl GraphError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
