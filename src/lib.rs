//! # Global Mapper
//!
//! Global mapping back end for LiDAR-inertial SLAM: maintains a globally
//! consistent pose graph over submaps produced by an upstream odometry front
//! end, by incremental nonlinear optimization.
//!
//! ## Pipeline
//!
//! - **Submap insertion**: adaptive multi-resolution voxelization, pose
//!   prediction along the odometry chain, between/matching-cost/IMU factor
//!   assembly, one incremental smoother update.
//! - **Implicit loop closure**: pairwise overlap search over voxel maps,
//!   deduplicated against existing constraints, VGICP factors per
//!   resolution level.
//! - **Recovery**: indeterminate linear systems are repaired online by
//!   damping the offending variable and rebuilding the solver; reloads
//!   reconstruct registration factors and patch missing variables/edges.
//! - **Persistence**: full graph/values/submap round-trip plus TUM-format
//!   trajectory dumps and world-frame point export.
//!
//! ## Example
//!
//! ```no_run
//! use global_mapper::{GlobalMapping, GlobalMappingConfig};
//!
//! let mut mapping = GlobalMapping::new(GlobalMappingConfig::default());
//! # let submap = unimplemented!();
//! mapping.insert_submap(submap);
//! mapping.find_overlapping_submaps(0.2);
//! let points = mapping.export_points();
//! ```

pub mod error;
pub mod factors;
pub mod graph;
pub mod imu;
pub mod linalg;
pub mod logger;
pub mod manifold;
pub mod mapping;
pub mod points;

// Re-export the façade types
pub use error::{GlobalMapperError, GlobalMapperResult};
pub use graph::{Key, Values, Variable};
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::{SE3, SO3};
pub use mapping::{
    GlobalMapping, GlobalMappingConfig, MappingObserver, OdometryFrame, OnIndeterminate, SubMap,
};
pub use points::{GaussianVoxelMap, PointCloud};
