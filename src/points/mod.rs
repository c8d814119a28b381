//! Point clouds and Gaussian voxel maps.
//!
//! A submap carries one merged, deskewed keyframe cloud plus a pyramid of
//! Gaussian voxel maps at geometrically increasing resolution. The voxel
//! maps serve as registration targets (distribution-to-distribution) and as
//! the overlap test used by the implicit loop search.

pub mod cloud;
pub mod voxelmap;

pub use cloud::{estimate_covariances, median_distance, random_sampling, PointCloud};
pub use voxelmap::{GaussianVoxel, GaussianVoxelMap};
