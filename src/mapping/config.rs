//! Global mapping configuration.

use serde::{Deserialize, Serialize};

/// What to do when the smoother reports an indeterminate linear system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnIndeterminate {
    /// Rebuild the solver with a damping factor at the offending variable
    /// and retry.
    DampAndRetry,
    /// Terminate the process (matches deployments that prefer a crash over
    /// a possibly-corrupted map).
    Abort,
    /// Report the error to the caller.
    Propagate,
}

/// All recognized options of the global mapping back end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalMappingConfig {
    /// Include IMU variables and factors
    pub enable_imu: bool,
    /// Real incremental solver vs. a store-only dummy
    pub enable_optimization: bool,

    /// Add pose between-factors along the submap chain
    pub create_between_factors: bool,
    /// "GICP" or "NONE"
    pub between_registration_type: String,
    /// "VGICP" or "VGICP_GPU"
    pub registration_error_factor_type: String,

    /// Minimum voxel size
    pub submap_voxel_resolution: f64,
    /// Maximum voxel size
    pub submap_voxel_resolution_max: f64,
    /// Lower end of the median-distance band for resolution interpolation
    pub submap_voxel_resolution_dmin: f64,
    /// Upper end of the median-distance band
    pub submap_voxel_resolution_dmax: f64,
    /// Number of voxel-map scales per submap
    pub submap_voxelmap_levels: usize,
    /// Geometric scale between levels
    pub submap_voxelmap_scaling_factor: f64,

    /// Fraction of points retained in the registration source cloud
    pub randomsampling_rate: f64,
    /// Maximum translation distance for implicit loop candidates
    pub max_implicit_loop_distance: f64,
    /// Minimum voxel-map overlap to connect a pair
    pub min_implicit_loop_overlap: f64,

    /// Dogleg instead of Gauss-Newton in the incremental smoother
    pub use_isam2_dogleg: bool,
    /// Updates between full relinearization passes
    pub isam2_relinearize_skip: usize,
    /// Relinearization threshold (parameter tolerance of the re-solve)
    pub isam2_relinearize_thresh: f64,

    /// Strength of the gauge prior on the first submap pose
    pub init_pose_damping_scale: f64,

    /// Policy for indeterminate-system failures
    pub on_indeterminate: OnIndeterminate,
    /// Worker threads available to factor linearization
    pub num_threads: usize,
    /// Seed of the subsampling RNG
    pub random_seed: u64,
}

impl Default for GlobalMappingConfig {
    fn default() -> Self {
        GlobalMappingConfig {
            enable_imu: true,
            enable_optimization: true,
            create_between_factors: false,
            between_registration_type: "GICP".to_string(),
            registration_error_factor_type: "VGICP".to_string(),
            submap_voxel_resolution: 1.0,
            submap_voxel_resolution_max: 1.0,
            submap_voxel_resolution_dmin: 5.0,
            submap_voxel_resolution_dmax: 20.0,
            submap_voxelmap_levels: 2,
            submap_voxelmap_scaling_factor: 2.0,
            randomsampling_rate: 1.0,
            max_implicit_loop_distance: 100.0,
            min_implicit_loop_overlap: 0.1,
            use_isam2_dogleg: false,
            isam2_relinearize_skip: 1,
            isam2_relinearize_thresh: 0.1,
            init_pose_damping_scale: 1e10,
            on_indeterminate: OnIndeterminate::DampAndRetry,
            num_threads: 1,
            random_seed: 0,
        }
    }
}

impl GlobalMappingConfig {
    /// Whether the GPU flavor of the registration factors was requested.
    pub fn gpu_requested(&self) -> bool {
        self.registration_error_factor_type.contains("GPU")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documentation() {
        let config = GlobalMappingConfig::default();
        assert!(config.enable_imu);
        assert!(config.enable_optimization);
        assert!(!config.create_between_factors);
        assert_eq!(config.between_registration_type, "GICP");
        assert_eq!(config.registration_error_factor_type, "VGICP");
        assert_eq!(config.submap_voxelmap_levels, 2);
        assert!((config.submap_voxel_resolution - 1.0).abs() < f64::EPSILON);
        assert!((config.max_implicit_loop_distance - 100.0).abs() < f64::EPSILON);
        assert!((config.min_implicit_loop_overlap - 0.1).abs() < f64::EPSILON);
        assert!((config.init_pose_damping_scale - 1e10).abs() < 1.0);
        assert!(!config.gpu_requested());
    }

    #[test]
    fn test_gpu_detection() {
        let config = GlobalMappingConfig {
            registration_error_factor_type: "VGICP_GPU".to_string(),
            ..Default::default()
        };
        assert!(config.gpu_requested());
    }
}
