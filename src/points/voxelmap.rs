//! Gaussian voxel maps: spatial hash from voxel index to per-voxel mean and
//! covariance.
//!
//! Used as the target side of the distribution-to-distribution registration
//! factors and for the overlap test of the implicit loop search.

use nalgebra::{Matrix3, Vector3};
use std::collections::HashMap;

use crate::manifold::SE3;
use crate::points::cloud::regularize_covariance;
use crate::points::PointCloud;

/// One occupied voxel: Gaussian over the points that fell into it.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianVoxel {
    pub mean: Vector3<f64>,
    pub cov: Matrix3<f64>,
    pub num_points: usize,
}

/// Spatial hash of Gaussian voxels at a fixed resolution.
#[derive(Debug, Clone)]
pub struct GaussianVoxelMap {
    resolution: f64,
    voxels: HashMap<(i32, i32, i32), GaussianVoxel>,
}

impl GaussianVoxelMap {
    pub fn new(resolution: f64) -> Self {
        GaussianVoxelMap {
            resolution,
            voxels: HashMap::new(),
        }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    fn index_of(&self, p: &Vector3<f64>) -> (i32, i32, i32) {
        (
            (p.x / self.resolution).floor() as i32,
            (p.y / self.resolution).floor() as i32,
            (p.z / self.resolution).floor() as i32,
        )
    }

    /// Insert a cloud, accumulating per-voxel Gaussians. Covariances are
    /// plane-regularized once all points are in.
    pub fn insert(&mut self, cloud: &PointCloud) {
        struct Accum {
            sum: Vector3<f64>,
            sum_sq: Matrix3<f64>,
            count: usize,
        }

        let mut accums: HashMap<(i32, i32, i32), Accum> = HashMap::new();
        for point in &cloud.points {
            let p = point.xyz();
            let index = self.index_of(&p);
            let accum = accums.entry(index).or_insert_with(|| Accum {
                sum: Vector3::zeros(),
                sum_sq: Matrix3::zeros(),
                count: 0,
            });
            accum.sum += p;
            accum.sum_sq += p * p.transpose();
            accum.count += 1;
        }

        for (index, accum) in accums {
            let count = accum.count as f64;
            let mean = accum.sum / count;
            let cov = accum.sum_sq / count - mean * mean.transpose();
            let voxel = GaussianVoxel {
                mean,
                cov: regularize_covariance(&cov),
                num_points: accum.count,
            };
            // Re-inserting into an occupied voxel keeps the newer Gaussian;
            // submap voxel maps are built in a single pass so this does not
            // arise in practice.
            self.voxels.insert(index, voxel);
        }
    }

    /// The voxel containing `p`, if occupied.
    pub fn lookup(&self, p: &Vector3<f64>) -> Option<&GaussianVoxel> {
        self.voxels.get(&self.index_of(p))
    }

    /// Fraction of `cloud`'s points that fall into occupied voxels after
    /// being transformed by `delta`.
    pub fn overlap(&self, cloud: &PointCloud, delta: &SE3) -> f64 {
        if cloud.is_empty() {
            return 0.0;
        }

        let inliers = cloud
            .points
            .iter()
            .filter(|p| self.lookup(&delta.transform_point(&p.xyz())).is_some())
            .count();
        inliers as f64 / cloud.len() as f64
    }
}
