//! The global mapping back end.
//!
//! [`GlobalMapping`](global_mapping::GlobalMapping) maintains a globally
//! consistent pose graph over submaps delivered by the odometry front end:
//! each insertion voxelizes the submap, predicts its world pose from the
//! odometry chain, glues it into the graph with registration and IMU
//! factors, and runs one incremental smoother update. Implicit loop
//! closures are added by re-searching pairwise submap overlaps, and the full
//! estimator state round-trips through `save`/`load` with reconstruction of
//! the unserializable registration factors.

use thiserror::Error;
use tracing::error;

pub mod callbacks;
pub mod config;
pub mod global_mapping;
pub mod smoother;
pub mod submap;

pub use callbacks::MappingObserver;
pub use config::{GlobalMappingConfig, OnIndeterminate};
pub use global_mapping::GlobalMapping;
pub use smoother::{Smoother, SmootherUpdate};
pub use submap::{OdometryFrame, SubMap};

use crate::graph::{GraphError, Key};

/// Errors surfaced by the mapping layer.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The smoother hit an indeterminate system and the configured policy
    /// asked for propagation.
    #[error("Indeterminate linear system near {nearby}")]
    Indeterminate { nearby: Key },

    /// Filesystem failure during save/load
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure during save/load
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed persisted state
    #[error("Malformed dump: {0}")]
    MalformedDump(String),

    /// Graph-level failure
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl MappingError {
    /// Log the error with tracing::error and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for mapping operations.
pub type MappingResult<T> = Result<T, MappingError>;
