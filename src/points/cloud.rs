//! Dense point clouds in homogeneous coordinates.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::{Matrix3, Vector3, Vector4};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A point cloud with optional per-point attributes.
///
/// Points are homogeneous `[x, y, z, 1]`. Attribute vectors, when present,
/// have the same length as `points`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub points: Vec<Vector4<f64>>,
    pub normals: Option<Vec<Vector4<f64>>>,
    pub covs: Option<Vec<Matrix3<f64>>>,
    pub intensities: Option<Vec<f64>>,
    pub times: Option<Vec<f64>>,
}

impl PointCloud {
    pub fn new(points: Vec<Vector4<f64>>) -> Self {
        PointCloud {
            points,
            ..Default::default()
        }
    }

    pub fn from_xyz(points: &[Vector3<f64>]) -> Self {
        PointCloud::new(
            points
                .iter()
                .map(|p| Vector4::new(p.x, p.y, p.z, 1.0))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_covs(&self) -> bool {
        self.covs.is_some()
    }

    /// Per-point covariance, if estimated.
    pub fn cov(&self, index: usize) -> Option<&Matrix3<f64>> {
        self.covs.as_ref().map(|covs| &covs[index])
    }
}

/// Retain roughly `rate * len` points, chosen uniformly without replacement.
/// Attribute vectors follow the selected indices.
pub fn random_sampling(cloud: &PointCloud, rate: f64, rng: &mut StdRng) -> PointCloud {
    let num_samples = ((cloud.len() as f64) * rate.clamp(0.0, 1.0)).floor() as usize;
    let num_samples = num_samples.min(cloud.len());

    let mut indices: Vec<usize> = rand::seq::index::sample(rng, cloud.len(), num_samples).into_vec();
    indices.sort_unstable();

    PointCloud {
        points: indices.iter().map(|&i| cloud.points[i]).collect(),
        normals: cloud
            .normals
            .as_ref()
            .map(|normals| indices.iter().map(|&i| normals[i]).collect()),
        covs: cloud
            .covs
            .as_ref()
            .map(|covs| indices.iter().map(|&i| covs[i]).collect()),
        intensities: cloud
            .intensities
            .as_ref()
            .map(|vals| indices.iter().map(|&i| vals[i]).collect()),
        times: cloud
            .times
            .as_ref()
            .map(|vals| indices.iter().map(|&i| vals[i]).collect()),
    }
}

/// Median distance of points from the sensor origin, evaluated over at most
/// `max_scan_count` evenly-strided points.
pub fn median_distance(cloud: &PointCloud, max_scan_count: usize) -> f64 {
    if cloud.is_empty() {
        return 0.0;
    }

    let stride = (cloud.len() / max_scan_count).max(1);
    let mut dists: Vec<f64> = cloud
        .points
        .iter()
        .step_by(stride)
        .map(|p| p.xyz().norm())
        .collect();

    let mid = dists.len() / 2;
    dists.select_nth_unstable_by(mid, f64::total_cmp);
    dists[mid]
}

/// Estimate per-point covariances by PCA over the `k` nearest neighbours,
/// with plane regularization of the eigenvalues (largest two kept, smallest
/// flattened). No-op for clouds smaller than `k`.
pub fn estimate_covariances(cloud: &mut PointCloud, k: usize) {
    if cloud.len() < k.max(4) {
        cloud.covs = Some(vec![Matrix3::identity() * 1e-3; cloud.len()]);
        return;
    }

    let entries: Vec<[f64; 3]> = cloud.points.iter().map(|p| [p.x, p.y, p.z]).collect();
    let kdtree: ImmutableKdTree<f64, u64, 3, 32> = (&*entries).into();

    let mut covs = Vec::with_capacity(cloud.len());
    for point in &cloud.points {
        let query = [point.x, point.y, point.z];
        let neighbors = kdtree.nearest_n::<SquaredEuclidean>(&query, k);

        let mut mean = Vector3::zeros();
        for nn in &neighbors {
            let p = &cloud.points[nn.item as usize];
            mean += p.xyz();
        }
        mean /= neighbors.len() as f64;

        let mut cov = Matrix3::zeros();
        for nn in &neighbors {
            let d = cloud.points[nn.item as usize].xyz() - mean;
            cov += d * d.transpose();
        }
        cov /= neighbors.len() as f64;

        covs.push(regularize_covariance(&cov));
    }

    cloud.covs = Some(covs);
}

/// Plane-regularize a covariance: eigenvalues replaced by `(1, 1, 1e-3)`
/// in the eigenbasis, the GICP convention for surface-like structure.
pub fn regularize_covariance(cov: &Matrix3<f64>) -> Matrix3<f64> {
    let eigen = nalgebra::SymmetricEigen::new(*cov);
    // Ascending eigenvalue order is not guaranteed; sort explicitly.
    let mut order: Vec<usize> = (0..3).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let values = [1e-3, 1.0, 1.0];
    let mut result = Matrix3::zeros();
    for (rank, &idx) in order.iter().enumerate() {
        let v = eigen.eigenvectors.column(idx);
        result += values[rank] * v * v.transpose();
    }
    result
}
