//! Nonlinear solvers over the factor graph.
//!
//! Gauss-Newton is the workhorse; Dogleg adds trust-region step control when
//! the smoother is configured for it, and Levenberg-Marquardt serves the
//! isolated between-factor refinement. All three share the linearizer and
//! the sparse Cholesky backend.
//!
//! A failed Cholesky factorization is translated into
//! [`GraphError::IndeterminateLinearSystem`] naming the variable whose
//! Hessian diagonal block is the most deficient; the smoother driver decides
//! how to recover.

use faer::Mat;
use tracing::debug;

use crate::graph::linearizer::Linearizer;
use crate::graph::{FactorGraph, GraphError, GraphResult, Values};
use crate::linalg::{LinAlgError, SparseCholeskySolver};

/// Solver selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerMethod {
    GaussNewton,
    LevenbergMarquardt { lambda_init: f64 },
    DogLeg,
}

/// Iteration limits and tolerances.
#[derive(Debug, Clone)]
pub struct OptimizeParams {
    pub method: OptimizerMethod,
    pub max_iterations: usize,
    pub cost_tolerance: f64,
    pub parameter_tolerance: f64,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        OptimizeParams {
            method: OptimizerMethod::GaussNewton,
            max_iterations: 10,
            cost_tolerance: 1e-6,
            parameter_tolerance: 1e-8,
        }
    }
}

/// What a solve did.
#[derive(Debug, Clone, Default)]
pub struct OptimizeSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

fn compute_cost(residual: &Mat<f64>) -> f64 {
    let norm = residual.norm_l2();
    0.5 * norm * norm
}

/// Map a Cholesky failure to the variable with the weakest diagonal.
fn indeterminate_error(solver: &SparseCholeskySolver, linearizer: &Linearizer) -> GraphError {
    let nearby = solver.hessian().and_then(|hessian| {
        // Structurally empty columns never appear in the triplets and read
        // as zero diagonals.
        let mut diag = vec![0.0; hessian.ncols()];
        for t in hessian.triplet_iter() {
            if t.row == t.col {
                diag[t.row] = t.val.abs();
            }
        }
        let min_col = diag
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(c, _)| c)?;
        linearizer.variable_at_column(min_col)
    });

    match nearby {
        Some(nearby) => GraphError::IndeterminateLinearSystem { nearby }.log(),
        None => GraphError::LinAlg(LinAlgError::SingularMatrix),
    }
}

/// Optimize the graph in place.
pub fn optimize(
    graph: &FactorGraph,
    values: &mut Values,
    params: &OptimizeParams,
) -> GraphResult<OptimizeSummary> {
    let linearizer = Linearizer::new(graph, values)?;
    if linearizer.total_rows() == 0 || linearizer.total_dof() == 0 {
        return Ok(OptimizeSummary::default());
    }

    match params.method {
        OptimizerMethod::GaussNewton => gauss_newton(graph, values, params, &linearizer),
        OptimizerMethod::LevenbergMarquardt { lambda_init } => {
            levenberg_marquardt(graph, values, params, &linearizer, lambda_init)
        }
        OptimizerMethod::DogLeg => dog_leg(graph, values, params, &linearizer),
    }
}

fn gauss_newton(
    graph: &FactorGraph,
    values: &mut Values,
    params: &OptimizeParams,
    linearizer: &Linearizer,
) -> GraphResult<OptimizeSummary> {
    let symbolic = linearizer.build_symbolic(graph)?;
    let mut solver = SparseCholeskySolver::new();

    let mut current_cost = compute_cost(&linearizer.residual_only(graph, values)?);
    let initial_cost = current_cost;
    let mut iterations = 0;

    for iteration in 0..params.max_iterations {
        let (residual, jacobian) = linearizer.linearize(graph, values, &symbolic)?;

        let step = match solver.solve_normal_equation(&residual, &jacobian) {
            Ok(step) => step,
            Err(LinAlgError::SingularMatrix) => {
                return Err(indeterminate_error(&solver, linearizer));
            }
            Err(e) => return Err(GraphError::LinAlg(e)),
        };

        let step_norm = linearizer.apply_step(values, step.as_ref());
        let new_cost = compute_cost(&linearizer.residual_only(graph, values)?);
        iterations = iteration + 1;

        debug!(
            "GN iter {iteration}: cost {current_cost:.6e} -> {new_cost:.6e}, |step| {step_norm:.3e}"
        );

        let cost_change = (current_cost - new_cost).abs();
        current_cost = new_cost;

        if step_norm < params.parameter_tolerance
            || cost_change < params.cost_tolerance * current_cost.max(1e-12)
        {
            break;
        }
    }

    Ok(OptimizeSummary {
        iterations,
        initial_cost,
        final_cost: current_cost,
    })
}

fn levenberg_marquardt(
    graph: &FactorGraph,
    values: &mut Values,
    params: &OptimizeParams,
    linearizer: &Linearizer,
    lambda_init: f64,
) -> GraphResult<OptimizeSummary> {
    let symbolic = linearizer.build_symbolic(graph)?;
    let mut solver = SparseCholeskySolver::new();

    let mut current_cost = compute_cost(&linearizer.residual_only(graph, values)?);
    let initial_cost = current_cost;
    let mut lambda = lambda_init;
    let mut iterations = 0;

    for iteration in 0..params.max_iterations {
        let (residual, jacobian) = linearizer.linearize(graph, values, &symbolic)?;

        let step = match solver.solve_augmented_equation(&residual, &jacobian, lambda) {
            Ok(step) => step,
            Err(LinAlgError::SingularMatrix) => {
                return Err(indeterminate_error(&solver, linearizer));
            }
            Err(e) => return Err(GraphError::LinAlg(e)),
        };

        let step_norm = linearizer.apply_step(values, step.as_ref());
        let new_cost = compute_cost(&linearizer.residual_only(graph, values)?);
        iterations = iteration + 1;

        debug!(
            "LM iter {iteration}: cost {current_cost:.6e} -> {new_cost:.6e}, lambda {lambda:.3e}"
        );

        if new_cost <= current_cost {
            let cost_change = current_cost - new_cost;
            current_cost = new_cost;
            lambda = (lambda * 0.1).max(1e-15);

            if step_norm < params.parameter_tolerance
                || cost_change < params.cost_tolerance * current_cost.max(1e-12)
            {
                break;
            }
        } else {
            // Reject: roll the step back and raise damping
            linearizer.revert_step(values, step.as_ref());
            lambda = (lambda * 10.0).min(1e12);
        }
    }

    Ok(OptimizeSummary {
        iterations,
        initial_cost,
        final_cost: current_cost,
    })
}

fn dog_leg(
    graph: &FactorGraph,
    values: &mut Values,
    params: &OptimizeParams,
    linearizer: &Linearizer,
) -> GraphResult<OptimizeSummary> {
    let symbolic = linearizer.build_symbolic(graph)?;
    let mut solver = SparseCholeskySolver::new();

    let mut current_cost = compute_cost(&linearizer.residual_only(graph, values)?);
    let initial_cost = current_cost;
    let mut radius: f64 = 1.0;
    let mut iterations = 0;

    for iteration in 0..params.max_iterations {
        let (residual, jacobian) = linearizer.linearize(graph, values, &symbolic)?;

        let gn_step = match solver.solve_normal_equation(&residual, &jacobian) {
            Ok(step) => step,
            Err(LinAlgError::SingularMatrix) => {
                return Err(indeterminate_error(&solver, linearizer));
            }
            Err(e) => return Err(GraphError::LinAlg(e)),
        };

        let gradient = solver.gradient().expect("gradient cached by solve").to_owned();
        let hessian = solver.hessian().expect("hessian cached by solve");

        // Steepest-descent (Cauchy) step: -alpha g with
        // alpha = g^T g / (g^T H g)
        let g_norm_sq = {
            let n = gradient.norm_l2();
            n * n
        };
        let hg = {
            use std::ops::Mul;
            hessian.as_ref().mul(&gradient)
        };
        let mut ghg = 0.0;
        for i in 0..gradient.nrows() {
            ghg += gradient[(i, 0)] * hg[(i, 0)];
        }
        let alpha = if ghg > 0.0 { g_norm_sq / ghg } else { 1.0 };

        let gn_norm = gn_step.norm_l2();
        let sd_norm = alpha * gradient.norm_l2();

        let step = if gn_norm <= radius {
            gn_step
        } else if sd_norm >= radius {
            let scale = -radius / gradient.norm_l2();
            let mut step = Mat::zeros(gradient.nrows(), 1);
            for i in 0..gradient.nrows() {
                step[(i, 0)] = scale * gradient[(i, 0)];
            }
            step
        } else {
            // Blend along the dogleg path so that |step| == radius
            let mut sd = Mat::zeros(gradient.nrows(), 1);
            for i in 0..gradient.nrows() {
                sd[(i, 0)] = -alpha * gradient[(i, 0)];
            }
            let mut diff = Mat::zeros(gradient.nrows(), 1);
            for i in 0..gradient.nrows() {
                diff[(i, 0)] = gn_step[(i, 0)] - sd[(i, 0)];
            }
            let a = {
                let n = diff.norm_l2();
                n * n
            };
            let mut b = 0.0;
            for i in 0..gradient.nrows() {
                b += sd[(i, 0)] * diff[(i, 0)];
            }
            let c = sd_norm * sd_norm - radius * radius;
            let beta = if a > 0.0 {
                (-b + (b * b - a * c).max(0.0).sqrt()) / a
            } else {
                0.0
            };
            let mut step = sd;
            for i in 0..gradient.nrows() {
                step[(i, 0)] += beta * diff[(i, 0)];
            }
            step
        };

        let step_norm = linearizer.apply_step(values, step.as_ref());
        let new_cost = compute_cost(&linearizer.residual_only(graph, values)?);
        iterations = iteration + 1;

        debug!(
            "Dogleg iter {iteration}: cost {current_cost:.6e} -> {new_cost:.6e}, radius {radius:.3e}"
        );

        if new_cost <= current_cost {
            let cost_change = current_cost - new_cost;
            current_cost = new_cost;
            radius = (radius * 2.0).min(1e6);

            if step_norm < params.parameter_tolerance
                || cost_change < params.cost_tolerance * current_cost.max(1e-12)
            {
                break;
            }
        } else {
            linearizer.revert_step(values, step.as_ref());
            radius = (radius * 0.25).max(1e-8);
        }
    }

    Ok(OptimizeSummary {
        iterations,
        initial_cost,
        final_cost: current_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{GraphFactor, PoseBetweenFactor, PoseDampingFactor};
    use crate::graph::{FactorEntry, Key, Variable};
    use crate::manifold::SE3;
    use nalgebra::Vector3;

    fn chain_graph(initial_x1: SE3) -> (FactorGraph, Values) {
        let mut values = Values::new();
        values.insert(Key::X(0), Variable::Pose(SE3::identity()));
        values.insert(Key::X(1), Variable::Pose(initial_x1));

        let graph = vec![
            FactorEntry::new(
                vec![Key::X(0)],
                GraphFactor::Damping(PoseDampingFactor::new(SE3::identity(), 1e10)),
            ),
            FactorEntry::new(
                vec![Key::X(0), Key::X(1)],
                GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                    SE3::from_translation(1.0, 0.0, 0.0),
                    1e6,
                )),
            ),
        ];
        (graph, values)
    }

    #[test]
    fn test_gauss_newton_converges_to_measurement() {
        let (graph, mut values) = chain_graph(SE3::from_translation(0.7, 0.2, -0.1));
        let summary = optimize(&graph, &mut values, &OptimizeParams::default())
            .expect("well-posed problem");
        assert!(summary.final_cost < summary.initial_cost);

        let pose = values.pose(&Key::X(1)).expect("pose");
        assert!((pose.translation() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn test_dogleg_converges() {
        let (graph, mut values) = chain_graph(SE3::from_translation(0.5, 0.0, 0.0));
        let params = OptimizeParams {
            method: OptimizerMethod::DogLeg,
            max_iterations: 20,
            ..OptimizeParams::default()
        };
        optimize(&graph, &mut values, &params).expect("well-posed problem");
        let pose = values.pose(&Key::X(1)).expect("pose");
        assert!((pose.translation() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-4);
    }

    #[test]
    fn test_levenberg_marquardt_converges() {
        let (graph, mut values) = chain_graph(SE3::from_translation(0.0, 0.0, 0.0));
        let params = OptimizeParams {
            method: OptimizerMethod::LevenbergMarquardt { lambda_init: 1e-12 },
            max_iterations: 10,
            ..OptimizeParams::default()
        };
        optimize(&graph, &mut values, &params).expect("well-posed problem");
        let pose = values.pose(&Key::X(1)).expect("pose");
        assert!((pose.translation() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-4);
    }

    #[test]
    fn test_unconstrained_variable_is_indeterminate() {
        let mut values = Values::new();
        values.insert(Key::X(0), Variable::Pose(SE3::identity()));
        values.insert(Key::X(1), Variable::Pose(SE3::identity()));

        // Only X(0) is constrained
        let graph = vec![FactorEntry::new(
            vec![Key::X(0)],
            GraphFactor::Damping(PoseDampingFactor::new(SE3::identity(), 1e10)),
        )];

        let result = optimize(&graph, &mut values, &OptimizeParams::default());
        match result {
            Err(GraphError::IndeterminateLinearSystem { nearby }) => {
                assert_eq!(nearby, Key::X(1));
            }
            other => panic!("expected indeterminate system, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_graph_is_noop() {
        let mut values = Values::new();
        let summary =
            optimize(&Vec::new(), &mut values, &OptimizeParams::default()).expect("no-op");
        assert_eq!(summary.iterations, 0);
    }
}
