//! Sparse linear algebra for the smoother's normal equations.
//!
//! One solver lives here: a sparse Cholesky over `H = JᵀJ` built on faer,
//! with the symbolic factorization cached across iterations of a single
//! optimization (the sparsity pattern is constant within one solve). The
//! Hessian and gradient are formed before the numeric factorization is
//! attempted so that a singular system still leaves them inspectable; the
//! smoother driver uses the Hessian diagonal to name the indeterminate
//! variable.

use faer::{
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::SparseColMat,
    Mat, Side,
};
use std::ops::Mul;
use thiserror::Error;
use tracing::error;

/// Linear algebra error types.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (normal equations are not positive definite)")]
    SingularMatrix,

    /// Failed to create a sparse matrix
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the source error from faer.
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations.
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Sparse Cholesky solver for `(JᵀJ) dx = -Jᵀr`.
pub struct SparseCholeskySolver {
    symbolic_factorization: Option<SymbolicLlt<usize>>,
    hessian: Option<SparseColMat<usize, f64>>,
    gradient: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver {
            symbolic_factorization: None,
            hessian: None,
            gradient: None,
        }
    }

    /// Cached `JᵀJ` from the last (possibly failed) solve attempt.
    pub fn hessian(&self) -> Option<&SparseColMat<usize, f64>> {
        self.hessian.as_ref()
    }

    /// Cached `Jᵀr` from the last solve attempt.
    pub fn gradient(&self) -> Option<&Mat<f64>> {
        self.gradient.as_ref()
    }

    /// Solve the normal equations. Returns the step `dx`.
    pub fn solve_normal_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<Mat<f64>> {
        let jt = jacobians.as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobians.as_ref());

        let gradient = jacobians.as_ref().transpose().mul(residuals);

        // Keep H and g around before factorizing: a singular system must
        // still be inspectable by the caller.
        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        let hessian = self.hessian.as_ref().expect("hessian was just stored");
        let gradient = self.gradient.as_ref().expect("gradient was just stored");

        let sym = if let Some(ref cached_sym) = self.symbolic_factorization {
            cached_sym.clone()
        } else {
            let new_sym = SymbolicLlt::try_new(hessian.symbolic(), Side::Lower).map_err(|e| {
                LinAlgError::FactorizationFailed(
                    "Symbolic Cholesky decomposition failed".to_string(),
                )
                .log_with_source(e)
            })?;
            self.symbolic_factorization = Some(new_sym.clone());
            new_sym
        };

        let cholesky = Llt::try_new_with_symbolic(sym, hessian.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        Ok(cholesky.solve(-gradient))
    }

    /// Solve the damped normal equations `(JᵀJ + lambda I) dx = -Jᵀr`.
    pub fn solve_augmented_equation(
        &mut self,
        residuals: &Mat<f64>,
        jacobians: &SparseColMat<usize, f64>,
        lambda: f64,
    ) -> LinAlgResult<Mat<f64>> {
        use faer::sparse::Triplet;

        let n = jacobians.ncols();

        let jt = jacobians.as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jacobians.as_ref());

        let gradient = jacobians.as_ref().transpose().mul(residuals);

        let lambda_triplets: Vec<Triplet<usize, usize, f64>> =
            (0..n).map(|i| Triplet::new(i, i, lambda)).collect();
        let lambda_i = SparseColMat::try_new_from_triplets(n, n, &lambda_triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to create lambda*I matrix".to_string())
                .log_with_source(e)
        })?;

        let augmented = &hessian + lambda_i;

        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        let gradient = self.gradient.as_ref().expect("gradient was just stored");

        // The augmented pattern differs from the plain one; do not reuse the
        // cached symbolic factorization here.
        let sym = SymbolicLlt::try_new(augmented.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed(
                "Symbolic Cholesky decomposition failed for augmented system".to_string(),
            )
            .log_with_source(e)
        })?;

        let cholesky = Llt::try_new_with_symbolic(sym, augmented.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

        Ok(cholesky.solve(-gradient))
    }
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}
