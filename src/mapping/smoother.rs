//! The incremental smoother driver.
//!
//! Wraps the batch solvers of [`crate::graph::optimizer`] behind an
//! iSAM2-style update interface: factors and values accumulate across
//! updates, every update re-solves the full graph, and the relinearization
//! skip/threshold decide whether an update runs a full nonlinear pass or a
//! single iteration. With optimization disabled the driver degrades to a
//! store-only dummy whose estimate is whatever was inserted.
//!
//! Indeterminate linear systems are repaired online: the offending variable
//! is remapped to its submap pose (`v/b/e` keys indexed `n` become `x(n/2)`),
//! the solver is rebuilt from the preserved graph and values with a damping
//! factor appended at that pose, and the update retries. The reaction is a
//! policy switch; deployments that prefer to crash configure
//! [`OnIndeterminate::Abort`].

use std::collections::HashSet;
use tracing::{error, warn};

use crate::factors::{GraphFactor, PoseDampingFactor};
use crate::graph::optimizer::{optimize, OptimizeParams, OptimizerMethod};
use crate::graph::{FactorEntry, FactorGraph, GraphError, Key, Values, Variable};
use crate::manifold::SE3;
use crate::mapping::config::{GlobalMappingConfig, OnIndeterminate};
use crate::mapping::{MappingError, MappingResult};

const RECOVERY_DAMPING_SCALE: f64 = 1e4;
const FULL_PASS_ITERATIONS: usize = 10;

/// Smoother-facing slice of the global mapping configuration.
#[derive(Debug, Clone)]
pub struct SmootherConfig {
    pub use_dogleg: bool,
    pub relinearize_skip: usize,
    pub relinearize_thresh: f64,
    pub enable_optimization: bool,
    pub on_indeterminate: OnIndeterminate,
}

impl From<&GlobalMappingConfig> for SmootherConfig {
    fn from(config: &GlobalMappingConfig) -> Self {
        SmootherConfig {
            use_dogleg: config.use_isam2_dogleg,
            relinearize_skip: config.isam2_relinearize_skip.max(1),
            relinearize_thresh: config.isam2_relinearize_thresh,
            enable_optimization: config.enable_optimization,
            on_indeterminate: config.on_indeterminate,
        }
    }
}

/// Outcome of one smoother update.
#[derive(Debug, Clone, Default)]
pub struct SmootherUpdate {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub num_factors: usize,
    pub num_values: usize,
}

impl SmootherUpdate {
    /// The result reported when an update was swallowed by error handling.
    pub fn empty() -> Self {
        SmootherUpdate::default()
    }
}

/// Factor graph + values + solve policy.
pub struct Smoother {
    config: SmootherConfig,
    graph: FactorGraph,
    values: Values,
    update_count: usize,
    damped_keys: HashSet<Key>,
}

impl Smoother {
    pub fn new(config: SmootherConfig) -> Self {
        Smoother {
            config,
            graph: Vec::new(),
            values: Values::new(),
            update_count: 0,
            damped_keys: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty() && self.values.is_empty()
    }

    pub fn num_factors(&self) -> usize {
        self.graph.len()
    }

    /// The full factor set (the save path and the overlap search walk it).
    pub fn factors(&self) -> &FactorGraph {
        &self.graph
    }

    /// The current estimate over all variables.
    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn value_exists(&self, key: &Key) -> bool {
        self.values.exists(key)
    }

    pub fn calculate_estimate(&self, key: &Key) -> Option<&Variable> {
        self.values.get(key)
    }

    pub fn estimate_pose(&self, key: &Key) -> Option<SE3> {
        self.values.pose(key).cloned()
    }

    /// The variable a damping factor should land on when `key` is named by
    /// an indeterminate-system failure.
    pub(crate) fn indeterminate_target(key: Key) -> Key {
        match key {
            Key::E(n) | Key::V(n) | Key::B(n) => Key::X(n / 2),
            pose @ Key::X(_) => pose,
        }
    }

    /// Fold new factors and values into the graph and re-solve.
    ///
    /// Never fails under [`OnIndeterminate::DampAndRetry`]; non-recoverable
    /// errors are logged and reported as an empty result.
    pub fn update(
        &mut self,
        new_factors: FactorGraph,
        new_values: Values,
    ) -> MappingResult<SmootherUpdate> {
        let num_new_factors = new_factors.len();
        let num_new_values = new_values.len();

        self.graph.extend(new_factors);
        for (key, value) in new_values.iter() {
            self.values.insert(*key, value.clone());
        }

        if !self.config.enable_optimization {
            return Ok(SmootherUpdate {
                num_factors: num_new_factors,
                num_values: num_new_values,
                ..SmootherUpdate::default()
            });
        }

        self.update_count += 1;
        let full_pass = self.update_count % self.config.relinearize_skip == 0;

        let params = OptimizeParams {
            method: if self.config.use_dogleg {
                OptimizerMethod::DogLeg
            } else {
                OptimizerMethod::GaussNewton
            },
            max_iterations: if full_pass { FULL_PASS_ITERATIONS } else { 1 },
            cost_tolerance: 1e-6,
            parameter_tolerance: self.config.relinearize_thresh * 1e-3,
        };

        loop {
            match optimize(&self.graph, &mut self.values, &params) {
                Ok(summary) => {
                    return Ok(SmootherUpdate {
                        iterations: summary.iterations,
                        initial_cost: summary.initial_cost,
                        final_cost: summary.final_cost,
                        num_factors: num_new_factors,
                        num_values: num_new_values,
                    });
                }
                Err(GraphError::IndeterminateLinearSystem { nearby }) => {
                    error!(
                        "an indeterminate linear system was caught during global map optimization (near {nearby})"
                    );
                    match self.config.on_indeterminate {
                        OnIndeterminate::Abort => {
                            error!("indeterminate-system policy is Abort, terminating");
                            std::process::exit(1);
                        }
                        OnIndeterminate::Propagate => {
                            return Err(MappingError::Indeterminate { nearby });
                        }
                        OnIndeterminate::DampAndRetry => {
                            let target = Self::indeterminate_target(nearby);
                            if !self.damped_keys.insert(target) {
                                error!(
                                    "variable {target} was already damped once, giving up on this update"
                                );
                                return Ok(SmootherUpdate::empty());
                            }
                            let anchor = self
                                .values
                                .pose(&target)
                                .cloned()
                                .unwrap_or_else(SE3::identity);
                            warn!("insert a damping factor at {target} to prevent corruption");
                            self.graph.push(FactorEntry::new(
                                vec![target],
                                GraphFactor::Damping(PoseDampingFactor::new(
                                    anchor,
                                    RECOVERY_DAMPING_SCALE,
                                )),
                            ));
                            warn!("rebuild the solver and retry the update");
                        }
                    }
                }
                Err(e) => {
                    error!("an exception was caught during global map optimization: {e}");
                    return Ok(SmootherUpdate::empty());
                }
            }
        }
    }
}
