//! Sparse assembly of the linearized factor graph.
//!
//! Stacks every factor's residual block into one tall system `J dx = -r`,
//! with variable columns laid out over the sorted key order of the values.
//! The sparsity pattern is symbolic-factorized once per solve and reused
//! across iterations.

use faer::sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat};
use faer::{Col, Mat, MatRef};
use std::collections::BTreeMap;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::graph::{Factor, FactorGraph, GraphError, GraphResult, Key, Values, Variable};

/// Symbolic sparsity pattern plus the triplet ordering that fills it.
pub struct SymbolicStructure {
    pub pattern: SymbolicSparseColMat<usize>,
    pub order: Argsort<usize>,
}

/// Column layout and row offsets for one graph/values pairing.
pub struct Linearizer {
    index_map: BTreeMap<Key, usize>,
    total_dof: usize,
    row_offsets: Vec<usize>,
    total_rows: usize,
}

impl Linearizer {
    /// Build the layout, verifying that every factor key has a value.
    pub fn new(graph: &FactorGraph, values: &Values) -> GraphResult<Self> {
        let mut index_map = BTreeMap::new();
        let mut total_dof = 0;
        for (key, variable) in values.iter() {
            index_map.insert(*key, total_dof);
            total_dof += variable.tangent_dim();
        }

        let mut row_offsets = Vec::with_capacity(graph.len());
        let mut total_rows = 0;
        for entry in graph {
            for key in &entry.keys {
                if !values.exists(key) {
                    return Err(GraphError::MissingVariable(*key).log());
                }
            }
            row_offsets.push(total_rows);
            total_rows += entry.factor.dimension();
        }

        Ok(Linearizer {
            index_map,
            total_dof,
            row_offsets,
            total_rows,
        })
    }

    pub fn total_dof(&self) -> usize {
        self.total_dof
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// The variable owning a given column of the linear system.
    pub fn variable_at_column(&self, column: usize) -> Option<Key> {
        let mut owner = None;
        for (key, &start) in &self.index_map {
            if start > column {
                break;
            }
            owner = Some(*key);
        }
        owner
    }

    /// Pre-compute the sparsity pattern of the stacked Jacobian.
    pub fn build_symbolic(&self, graph: &FactorGraph) -> GraphResult<SymbolicStructure> {
        let mut indices = Vec::<Pair<usize, usize>>::new();

        for (entry, &row_start) in graph.iter().zip(&self.row_offsets) {
            let dim = entry.factor.dimension();
            for key in &entry.keys {
                let col_start = self.index_map[key];
                let dof = key_dof(key);
                for row in 0..dim {
                    for col in 0..dof {
                        indices.push(Pair::new(row_start + row, col_start + col));
                    }
                }
            }
        }

        let (pattern, order) =
            SymbolicSparseColMat::try_new_from_indices(self.total_rows, self.total_dof, &indices)
                .map_err(|e| {
                    GraphError::SparseAssembly(format!(
                        "failed to build symbolic sparsity pattern: {e:?}"
                    ))
                    .log()
                })?;

        Ok(SymbolicStructure { pattern, order })
    }

    /// Evaluate all factors, returning the stacked residual and the sparse
    /// Jacobian.
    pub fn linearize(
        &self,
        graph: &FactorGraph,
        values: &Values,
        symbolic: &SymbolicStructure,
    ) -> GraphResult<(Mat<f64>, SparseColMat<usize, f64>)> {
        let blocks = self.evaluate_blocks(graph, values, true)?;

        let mut residual = Col::<f64>::zeros(self.total_rows);
        let total_nnz = symbolic.pattern.compute_nnz();
        let mut jacobian_values = Vec::with_capacity(total_nnz);

        let mut residual_mut = residual.as_mut();
        for (row_start, res, jac) in blocks {
            for (i, v) in res.iter().enumerate() {
                residual_mut[row_start + i] = *v;
            }
            jacobian_values.extend(jac.expect("jacobian requested"));
        }
        drop(residual_mut);

        let jacobian = SparseColMat::new_from_argsort(
            symbolic.pattern.clone(),
            &symbolic.order,
            jacobian_values.as_slice(),
        )
        .map_err(|e| {
            GraphError::SparseAssembly(format!("failed to fill sparse Jacobian: {e:?}")).log()
        })?;

        Ok((residual.as_ref().as_mat().to_owned(), jacobian))
    }

    /// Evaluate residuals only (cost queries during step control).
    pub fn residual_only(&self, graph: &FactorGraph, values: &Values) -> GraphResult<Mat<f64>> {
        let blocks = self.evaluate_blocks(graph, values, false)?;

        let mut residual = Col::<f64>::zeros(self.total_rows);
        let mut residual_mut = residual.as_mut();
        for (row_start, res, _) in blocks {
            for (i, v) in res.iter().enumerate() {
                residual_mut[row_start + i] = *v;
            }
        }
        drop(residual_mut);
        Ok(residual.as_ref().as_mat().to_owned())
    }

    /// Apply a tangent step to all variables; returns the step norm.
    pub fn apply_step(&self, values: &mut Values, step: MatRef<f64>) -> f64 {
        for (key, &col_start) in &self.index_map {
            if let Some(variable) = values.get_mut(key) {
                let dof = variable.tangent_dim();
                let slice: Vec<f64> = (0..dof).map(|i| step[(col_start + i, 0)]).collect();
                variable.retract(&slice);
            }
        }
        step.norm_l2()
    }

    /// Negate and apply a step (rejected-step rollback).
    pub fn revert_step(&self, values: &mut Values, step: MatRef<f64>) {
        let mut negated = Mat::zeros(step.nrows(), 1);
        for i in 0..step.nrows() {
            negated[(i, 0)] = -step[(i, 0)];
        }
        self.apply_step(values, negated.as_ref());
    }

    fn evaluate_blocks(
        &self,
        graph: &FactorGraph,
        values: &Values,
        compute_jacobian: bool,
    ) -> GraphResult<Vec<EvaluatedBlock>> {
        let evaluate = |(entry, &row_start): (&crate::graph::FactorEntry, &usize)| {
            let params: Vec<&Variable> = entry
                .keys
                .iter()
                .map(|key| values.get(key).expect("keys verified at construction"))
                .collect();
            let (res, jac) = entry.factor.linearize(&params, compute_jacobian);

            let jac_values = if compute_jacobian {
                let jac = jac.expect("factor returned no Jacobian");
                let dim = entry.factor.dimension();
                let mut flat = Vec::new();
                let mut local_col = 0;
                for key in &entry.keys {
                    let dof = key_dof(key);
                    for row in 0..dim {
                        for col in 0..dof {
                            flat.push(jac[(row, local_col + col)]);
                        }
                    }
                    local_col += dof;
                }
                Some(flat)
            } else {
                None
            };

            Ok::<EvaluatedBlock, GraphError>((row_start, res, jac_values))
        };

        #[cfg(feature = "parallel")]
        let blocks: Result<Vec<EvaluatedBlock>, GraphError> = graph
            .par_iter()
            .zip(self.row_offsets.par_iter())
            .map(evaluate)
            .collect();

        #[cfg(not(feature = "parallel"))]
        let blocks: Result<Vec<EvaluatedBlock>, GraphError> = graph
            .iter()
            .zip(self.row_offsets.iter())
            .map(evaluate)
            .collect();

        blocks
    }
}

type EvaluatedBlock = (usize, nalgebra::DVector<f64>, Option<Vec<f64>>);

fn key_dof(key: &Key) -> usize {
    match key {
        Key::X(_) | Key::E(_) => 6,
        Key::V(_) => 3,
        Key::B(_) => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{GraphFactor, PoseBetweenFactor, PoseDampingFactor};
    use crate::graph::FactorEntry;
    use crate::manifold::SE3;

    fn simple_graph() -> (FactorGraph, Values) {
        let mut values = Values::new();
        values.insert(Key::X(0), Variable::Pose(SE3::identity()));
        values.insert(
            Key::X(1),
            Variable::Pose(SE3::from_translation(1.0, 0.0, 0.0)),
        );

        let graph = vec![
            FactorEntry::new(
                vec![Key::X(0)],
                GraphFactor::Damping(PoseDampingFactor::new(SE3::identity(), 1e6)),
            ),
            FactorEntry::new(
                vec![Key::X(0), Key::X(1)],
                GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                    SE3::from_translation(1.0, 0.0, 0.0),
                    1e4,
                )),
            ),
        ];
        (graph, values)
    }

    #[test]
    fn test_layout() {
        let (graph, values) = simple_graph();
        let linearizer = Linearizer::new(&graph, &values).expect("layout");
        assert_eq!(linearizer.total_dof(), 12);
        assert_eq!(linearizer.total_rows(), 12);
        assert_eq!(linearizer.variable_at_column(0), Some(Key::X(0)));
        assert_eq!(linearizer.variable_at_column(7), Some(Key::X(1)));
    }

    #[test]
    fn test_missing_variable_is_error() {
        let (graph, mut values) = simple_graph();
        values = {
            let mut v = Values::new();
            for (k, var) in values.iter() {
                if *k != Key::X(1) {
                    v.insert(*k, var.clone());
                }
            }
            v
        };
        assert!(matches!(
            Linearizer::new(&graph, &values),
            Err(GraphError::MissingVariable(Key::X(1)))
        ));
    }

    #[test]
    fn test_linearize_consistent_graph_zero_residual() {
        let (graph, values) = simple_graph();
        let linearizer = Linearizer::new(&graph, &values).expect("layout");
        let symbolic = linearizer.build_symbolic(&graph).expect("symbolic");
        let (residual, jacobian) = linearizer
            .linearize(&graph, &values, &symbolic)
            .expect("linearize");
        assert_eq!(residual.nrows(), 12);
        assert_eq!(jacobian.ncols(), 12);
        assert!(residual.norm_l2() < 1e-6);
    }

    #[test]
    fn test_apply_step_moves_values() {
        let (graph, mut values) = simple_graph();
        let linearizer = Linearizer::new(&graph, &values).expect("layout");

        let mut step = Mat::zeros(12, 1);
        step[(6, 0)] = 0.5; // x-translation of X(1)
        let norm = linearizer.apply_step(&mut values, step.as_ref());
        assert!((norm - 0.5).abs() < 1e-12);

        let pose = values.pose(&Key::X(1)).expect("pose");
        assert!((pose.translation().x - 1.5).abs() < 1e-12);
    }
}
