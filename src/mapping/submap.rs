//! The per-submap record handed in by the odometry front end.

use nalgebra::{Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use crate::manifold::SE3;
use crate::mapping::{MappingError, MappingResult};
use crate::points::{GaussianVoxelMap, PointCloud};

/// One odometry estimation frame inside a submap.
///
/// Poses come in both the LiDAR and IMU frames; the IMU frame is the
/// estimation frame of the upstream odometry and is what the pose-graph
/// chain is built on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdometryFrame {
    pub stamp: f64,
    pub t_world_lidar: SE3,
    pub t_world_imu: SE3,
    pub t_lidar_imu: SE3,
    /// World-frame IMU velocity
    pub v_world_imu: Vector3<f64>,
    /// IMU bias `[accel, gyro]`
    pub imu_bias: Vector6<f64>,
    /// Per-frame scan, dropped right after submap insertion to bound memory
    #[serde(skip)]
    pub frame: Option<Arc<PointCloud>>,
}

impl OdometryFrame {
    /// Pose in the estimation (IMU) frame.
    pub fn t_world_sensor(&self) -> &SE3 {
        &self.t_world_imu
    }
}

/// A locally-optimized submap: origin pose, endpoint transforms, merged
/// keyframe cloud, odometry trajectories, and multi-resolution voxel maps.
#[derive(Debug, Clone)]
pub struct SubMap {
    /// Dense id; equals the submap's position in the back end's list
    pub id: usize,

    /// Origin pose in the world frame; owned by the optimizer after the
    /// first smoother update
    pub t_world_origin: SE3,
    /// First odometry pose w.r.t. the origin
    pub t_origin_endpoint_l: SE3,
    /// Last odometry pose w.r.t. the origin
    pub t_origin_endpoint_r: SE3,

    /// Merged, deskewed keyframe cloud in the origin frame
    pub merged_keyframe: Arc<PointCloud>,
    /// Timestamps of the scans merged into the keyframe (LAS export only)
    pub stamps_to_merge: Vec<f64>,

    /// Multi-resolution voxel maps, finest first; the last (coarsest) level
    /// is the overlap-check target
    pub voxelmaps: Vec<Arc<GaussianVoxelMap>>,

    /// Optimized odometry frames
    pub optim_odom_frames: Vec<OdometryFrame>,
    /// Original (raw) odometry frames
    pub origin_odom_frames: Vec<OdometryFrame>,
}

/// Serialized form of a submap; the keyframe cloud is written separately.
#[derive(Serialize, Deserialize)]
struct SubMapRecord {
    id: usize,
    t_world_origin: SE3,
    t_origin_endpoint_l: SE3,
    t_origin_endpoint_r: SE3,
    stamps_to_merge: Vec<f64>,
    optim_odom_frames: Vec<OdometryFrame>,
    origin_odom_frames: Vec<OdometryFrame>,
}

impl SubMap {
    /// The frame whose pose defines the submap origin.
    pub fn optim_odom_frame(&self) -> &OdometryFrame {
        &self.optim_odom_frames[self.optim_odom_frames.len() / 2]
    }

    /// The raw-odometry counterpart of the origin frame.
    pub fn origin_odom_frame(&self) -> &OdometryFrame {
        &self.origin_odom_frames[self.optim_odom_frames.len() / 2]
    }

    /// Drop the per-frame scans; the merged keyframe and voxel maps carry
    /// all geometry from here on.
    pub fn drop_frame_points(&mut self) {
        for frame in &mut self.optim_odom_frames {
            frame.frame = None;
        }
        for frame in &mut self.origin_odom_frames {
            frame.frame = None;
        }
    }

    /// Dump this submap into `path` (created if missing): `submap.bin` plus
    /// `keyframe.bin`. Voxel maps are not persisted; they are rebuilt with
    /// the insertion-time policy on load.
    pub fn save(&self, path: &Path) -> MappingResult<()> {
        std::fs::create_dir_all(path)?;

        let record = SubMapRecord {
            id: self.id,
            t_world_origin: self.t_world_origin.clone(),
            t_origin_endpoint_l: self.t_origin_endpoint_l.clone(),
            t_origin_endpoint_r: self.t_origin_endpoint_r.clone(),
            stamps_to_merge: self.stamps_to_merge.clone(),
            optim_odom_frames: self.optim_odom_frames.clone(),
            origin_odom_frames: self.origin_odom_frames.clone(),
        };

        let writer = BufWriter::new(File::create(path.join("submap.bin"))?);
        bincode::serialize_into(writer, &record)
            .map_err(|e| MappingError::Serialization(e.to_string()).log())?;

        let writer = BufWriter::new(File::create(path.join("keyframe.bin"))?);
        bincode::serialize_into(writer, &*self.merged_keyframe)
            .map_err(|e| MappingError::Serialization(e.to_string()).log())?;

        Ok(())
    }

    /// Load a submap dumped by [`SubMap::save`]. Voxel maps come back empty.
    pub fn load(path: &Path) -> MappingResult<SubMap> {
        let reader = BufReader::new(File::open(path.join("submap.bin"))?);
        let record: SubMapRecord = bincode::deserialize_from(reader)
            .map_err(|e| MappingError::Serialization(e.to_string()).log())?;

        let reader = BufReader::new(File::open(path.join("keyframe.bin"))?);
        let keyframe: PointCloud = bincode::deserialize_from(reader)
            .map_err(|e| MappingError::Serialization(e.to_string()).log())?;

        Ok(SubMap {
            id: record.id,
            t_world_origin: record.t_world_origin,
            t_origin_endpoint_l: record.t_origin_endpoint_l,
            t_origin_endpoint_r: record.t_origin_endpoint_r,
            merged_keyframe: Arc::new(keyframe),
            stamps_to_merge: record.stamps_to_merge,
            voxelmaps: Vec::new(),
            optim_odom_frames: record.optim_odom_frames,
            origin_odom_frames: record.origin_odom_frames,
        })
    }
}
