//! Error types for the global-mapper library.
//!
//! Module-level errors (`GraphError`, `LinAlgError`, `FactorError`,
//! `MappingError`) are wrapped by a top-level [`GlobalMapperError`] with
//! `thiserror`, preserving the source chain for inspection.

use std::error::Error as StdError;
use thiserror::Error;

use crate::factors::FactorError;
use crate::graph::GraphError;
use crate::linalg::LinAlgError;
use crate::mapping::MappingError;

/// Main result type used throughout the library.
pub type GlobalMapperResult<T> = Result<T, GlobalMapperError>;

/// Top-level error exposed by public APIs.
#[derive(Debug, Error)]
pub enum GlobalMapperError {
    /// Factor graph assembly and solving
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Sparse linear algebra
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Factor evaluation
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Mapping back end (insertion, persistence, recovery)
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl GlobalMapperError {
    /// The full error chain as a multi-line string.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Single-line error chain with arrow separators.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Key;

    #[test]
    fn test_display_includes_variable() {
        let error = GlobalMapperError::from(GraphError::IndeterminateLinearSystem {
            nearby: Key::V(3),
        });
        assert!(error.to_string().contains("v3"));
    }

    #[test]
    fn test_transparent_conversion() {
        let error: GlobalMapperError = LinAlgError::SingularMatrix.into();
        assert!(matches!(error, GlobalMapperError::LinearAlgebra(_)));
    }

    #[test]
    fn test_chain_compact_single_level() {
        let error = GlobalMapperError::from(GraphError::SparseAssembly("bad pattern".to_string()));
        assert!(error.chain_compact().contains("bad pattern"));
    }
}
