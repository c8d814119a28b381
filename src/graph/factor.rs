//! The factor abstraction shared by the assembler and the smoother.

use nalgebra::{DMatrix, DVector};

use crate::factors::GraphFactor;
use crate::graph::{Key, Variable};

/// A constraint connecting one or more variables.
///
/// `linearize` evaluates the (already whitened) residual and, on request, its
/// Jacobian with respect to the stacked tangent spaces of the connected
/// variables, in key order. Residual dimension must be constant over the
/// lifetime of the factor; factors with data-dependent correspondences (the
/// registration factors) pad unmatched blocks with zeros.
pub trait Factor: Send + Sync {
    /// Compute residual and optional Jacobian at the given variable values.
    ///
    /// `params` holds one entry per connected variable, ordered like the
    /// entry's key list. The Jacobian is `dimension() x sum(tangent dims)`.
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>);

    /// Residual dimension.
    fn dimension(&self) -> usize;
}

/// A factor together with the keys it connects.
#[derive(Debug, Clone)]
pub struct FactorEntry {
    pub keys: Vec<Key>,
    pub factor: GraphFactor,
}

impl FactorEntry {
    pub fn new(keys: Vec<Key>, factor: GraphFactor) -> Self {
        FactorEntry { keys, factor }
    }

    /// The pair of submap indices for a binary pose-to-pose factor, if this
    /// entry is one.
    pub fn pose_pair(&self) -> Option<(usize, usize)> {
        if self.keys.len() != 2 {
            return None;
        }
        match (self.keys[0], self.keys[1]) {
            (Key::X(i), Key::X(j)) => Some((i, j)),
            _ => None,
        }
    }
}

/// The nonlinear factor graph: a flat list of factor entries.
pub type FactorGraph = Vec<FactorEntry>;
