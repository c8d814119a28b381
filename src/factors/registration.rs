//! Matching-cost (registration) factors.
//!
//! These factors tie two submap poses together through the alignment of one
//! submap's points against the other's geometry: VGICP matches source points
//! against a Gaussian voxel map, GICP against the target cloud's per-point
//! Gaussians via nearest-neighbour correspondence. Both whiten each 3-row
//! residual block by the combined distribution covariance.
//!
//! The residual dimension is fixed at `3 * |source|` so the sparsity pattern
//! survives correspondence changes between iterations; unmatched points
//! contribute zero rows. Neither factor serializes; on reload they are
//! reconstructed from the persisted submap clouds and voxel maps.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use std::sync::Arc;

use crate::graph::{Factor, Variable};
use crate::manifold::{skew, SE3};
use crate::points::{GaussianVoxelMap, PointCloud};

const COV_RIDGE: f64 = 1e-6;

/// Whitening matrix for one correspondence: `W` with `Wᵀ W = (C_t + R C_s Rᵀ)⁻¹`.
fn whitening(
    target_cov: &Matrix3<f64>,
    source_cov: Option<&Matrix3<f64>>,
    rot_delta: &Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let mut combined = *target_cov + Matrix3::identity() * COV_RIDGE;
    if let Some(cov) = source_cov {
        combined += rot_delta * cov * rot_delta.transpose();
    }
    let info = combined.try_inverse()?;
    nalgebra::Cholesky::new(info).map(|chol| chol.l().transpose())
}

/// Fill one correspondence's residual and Jacobian blocks.
///
/// `q = delta * p` is the source point in the target frame; the residual is
/// `W (mu - q)`. Pose Jacobians follow the right-perturbation convention:
/// `dq/dxi_j = R_delta [I | -skew(p)]`, `dq/dxi_i = [-I | skew(q)]`.
#[allow(clippy::too_many_arguments)]
fn fill_blocks(
    row: usize,
    mu: &Vector3<f64>,
    p: &Vector3<f64>,
    q: &Vector3<f64>,
    w: &Matrix3<f64>,
    rot_delta: &Matrix3<f64>,
    residual: &mut DVector<f64>,
    jacobian: Option<&mut DMatrix<f64>>,
) {
    let r = w * (mu - q);
    residual.rows_mut(row, 3).copy_from(&r);

    if let Some(jac) = jacobian {
        let mut dq_dj = nalgebra::Matrix3x6::zeros();
        dq_dj.fixed_view_mut::<3, 3>(0, 0).copy_from(rot_delta);
        dq_dj
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-rot_delta * skew(p)));

        let mut dq_di = nalgebra::Matrix3x6::zeros();
        dq_di
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-Matrix3::identity()));
        dq_di.fixed_view_mut::<3, 3>(0, 3).copy_from(&skew(q));

        let jac_i = -w * dq_di;
        let jac_j = -w * dq_dj;
        jac.view_mut((row, 0), (3, 6)).copy_from(&jac_i);
        jac.view_mut((row, 6), (3, 6)).copy_from(&jac_j);
    }
}

/// VGICP: source points against a Gaussian voxel map, keys `[X(i), X(j)]`
/// with the voxel map expressed in submap `i`'s frame.
#[derive(Clone)]
pub struct IntegratedVgicpFactor {
    pub target: Arc<GaussianVoxelMap>,
    pub source: Arc<PointCloud>,
    /// Whether this factor was requested through the GPU interface; only
    /// affects the persisted type tag, evaluation runs on the CPU.
    pub gpu_tagged: bool,
}

impl IntegratedVgicpFactor {
    pub fn new(target: Arc<GaussianVoxelMap>, source: Arc<PointCloud>) -> Self {
        IntegratedVgicpFactor {
            target,
            source,
            gpu_tagged: false,
        }
    }

    pub fn new_gpu_tagged(target: Arc<GaussianVoxelMap>, source: Arc<PointCloud>) -> Self {
        IntegratedVgicpFactor {
            target,
            source,
            gpu_tagged: true,
        }
    }
}

impl std::fmt::Debug for IntegratedVgicpFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegratedVgicpFactor")
            .field("target_voxels", &self.target.num_voxels())
            .field("source_points", &self.source.len())
            .field("gpu_tagged", &self.gpu_tagged)
            .finish()
    }
}

impl Factor for IntegratedVgicpFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose_i = params[0].as_pose().expect("vgicp expects poses");
        let pose_j = params[1].as_pose().expect("vgicp expects poses");

        let delta = pose_i.inverse().compose(pose_j);
        let rot_delta = delta.rotation_matrix();

        let dim = self.dimension();
        let mut residual = DVector::zeros(dim);
        let mut jacobian = if compute_jacobian {
            Some(DMatrix::zeros(dim, 12))
        } else {
            None
        };

        for (index, point) in self.source.points.iter().enumerate() {
            let p = point.xyz();
            let q = delta.transform_point(&p);
            let voxel = match self.target.lookup(&q) {
                Some(voxel) => voxel,
                None => continue,
            };
            let w = match whitening(&voxel.cov, self.source.cov(index), &rot_delta) {
                Some(w) => w,
                None => continue,
            };
            fill_blocks(
                index * 3,
                &voxel.mean,
                &p,
                &q,
                &w,
                &rot_delta,
                &mut residual,
                jacobian.as_mut(),
            );
        }

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        3 * self.source.len()
    }
}

/// GICP: source points against the target cloud's per-point Gaussians,
/// keys `[X(i), X(j)]` with the target cloud in submap `i`'s frame.
#[derive(Clone)]
pub struct IntegratedGicpFactor {
    pub target: Arc<PointCloud>,
    pub source: Arc<PointCloud>,
    pub max_correspondence_distance: f64,
    kdtree: Arc<ImmutableKdTree<f64, u64, 3, 32>>,
}

impl IntegratedGicpFactor {
    pub fn new(
        target: Arc<PointCloud>,
        source: Arc<PointCloud>,
        max_correspondence_distance: f64,
    ) -> Self {
        let entries: Vec<[f64; 3]> = target.points.iter().map(|p| [p.x, p.y, p.z]).collect();
        let kdtree: ImmutableKdTree<f64, u64, 3, 32> = (&*entries).into();
        IntegratedGicpFactor {
            target,
            source,
            max_correspondence_distance,
            kdtree: Arc::new(kdtree),
        }
    }
}

impl std::fmt::Debug for IntegratedGicpFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegratedGicpFactor")
            .field("target_points", &self.target.len())
            .field("source_points", &self.source.len())
            .field(
                "max_correspondence_distance",
                &self.max_correspondence_distance,
            )
            .finish()
    }
}

impl Factor for IntegratedGicpFactor {
    fn linearize(
        &self,
        params: &[&Variable],
        compute_jacobian: bool,
    ) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let pose_i = params[0].as_pose().expect("gicp expects poses");
        let pose_j = params[1].as_pose().expect("gicp expects poses");

        let delta = pose_i.inverse().compose(pose_j);
        let rot_delta = delta.rotation_matrix();
        let max_dist_sq = self.max_correspondence_distance * self.max_correspondence_distance;

        let dim = self.dimension();
        let mut residual = DVector::zeros(dim);
        let mut jacobian = if compute_jacobian {
            Some(DMatrix::zeros(dim, 12))
        } else {
            None
        };

        for (index, point) in self.source.points.iter().enumerate() {
            let p = point.xyz();
            let q = delta.transform_point(&p);
            let nearest = self.kdtree.nearest_one::<SquaredEuclidean>(&[q.x, q.y, q.z]);
            if nearest.distance > max_dist_sq {
                continue;
            }
            let target_index = nearest.item as usize;
            let mu = self.target.points[target_index].xyz();

            let default_cov = Matrix3::identity() * 1e-2;
            let target_cov = self.target.cov(target_index).unwrap_or(&default_cov);
            let w = match whitening(target_cov, self.source.cov(index), &rot_delta) {
                Some(w) => w,
                None => continue,
            };
            fill_blocks(
                index * 3,
                &mu,
                &p,
                &q,
                &w,
                &rot_delta,
                &mut residual,
                jacobian.as_mut(),
            );
        }

        (residual, jacobian)
    }

    fn dimension(&self) -> usize {
        3 * self.source.len()
    }
}
