//! The global mapping façade.
//!
//! Owns the submap list, the subsampled registration sources, the IMU
//! buffer, and the incremental smoother. One `insert_submap` call runs the
//! whole pipeline: voxelize, predict the world pose from the odometry chain,
//! assemble between/matching-cost/IMU factors, update the smoother, and
//! propagate optimized poses back into the submaps.

use nalgebra::{Matrix6, Vector3, Vector4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use serde::{Deserialize, Serialize};

use crate::factors::{
    BiasBetweenFactor, BiasPriorFactor, GraphFactor, ImuFactor, IntegratedGicpFactor,
    IntegratedVgicpFactor, PoseBetweenFactor, PoseDampingFactor, PosePriorFactor,
    RotateVector3Factor, SerializableFactor, VelocityBetweenFactor,
};
use crate::graph::optimizer::{optimize, OptimizeParams, OptimizerMethod};
use crate::graph::{FactorEntry, FactorGraph, Key, Values, Variable};
use crate::imu::ImuIntegration;
use crate::manifold::SE3;
use crate::mapping::callbacks::{MappingObserver, ObserverVec};
use crate::mapping::config::GlobalMappingConfig;
use crate::mapping::smoother::{Smoother, SmootherUpdate};
use crate::mapping::submap::SubMap;
use crate::mapping::{MappingError, MappingResult};
use crate::points::{median_distance, random_sampling, GaussianVoxelMap, PointCloud};

const ENDPOINT_PRECISION: f64 = 1e6;
const GICP_MAX_CORRESPONDENCE_DISTANCE: f64 = 0.5;
const MAX_SCAN_COUNT: usize = 256;
/// Stamp increment used when synthesizing per-point times on export.
const STAMP_SYNTHESIS_STEP: f64 = 2e-5;

/// Serialized form of the non-registration factor set (`graph.bin`).
#[derive(Serialize, Deserialize)]
struct SerializedGraph {
    entries: Vec<SerializedEntry>,
}

#[derive(Serialize, Deserialize)]
struct SerializedEntry {
    keys: Vec<Key>,
    factor: SerializableFactor,
}

/// The global mapping back end.
pub struct GlobalMapping {
    config: GlobalMappingConfig,
    rng: StdRng,
    imu_integration: ImuIntegration,

    submaps: Vec<SubMap>,
    subsampled_submaps: Vec<Arc<PointCloud>>,

    smoother: Smoother,
    observers: ObserverVec,

    #[cfg(feature = "parallel")]
    thread_pool: Option<rayon::ThreadPool>,
}

impl GlobalMapping {
    pub fn new(config: GlobalMappingConfig) -> Self {
        if config.gpu_requested() {
            warn!(
                "GPU registration factors were requested but this build has no device backend; they will run on the CPU"
            );
        }

        #[cfg(feature = "parallel")]
        let thread_pool = if config.num_threads > 1 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .build()
                .map_err(|e| warn!("failed to build the smoother thread pool: {e}"))
                .ok()
        } else {
            None
        };

        let smoother = Smoother::new((&config).into());
        let rng = StdRng::seed_from_u64(config.random_seed);

        GlobalMapping {
            config,
            rng,
            imu_integration: ImuIntegration::new(),
            submaps: Vec::new(),
            subsampled_submaps: Vec::new(),
            smoother,
            observers: ObserverVec::new(),
            #[cfg(feature = "parallel")]
            thread_pool,
        }
    }

    pub fn add_observer(&mut self, observer: impl MappingObserver + 'static) {
        self.observers.add(observer);
    }

    pub fn config(&self) -> &GlobalMappingConfig {
        &self.config
    }

    pub fn submaps(&self) -> &[SubMap] {
        &self.submaps
    }

    pub fn num_submaps(&self) -> usize {
        self.submaps.len()
    }

    pub fn smoother(&self) -> &Smoother {
        &self.smoother
    }

    /// Queue an IMU sample. No-op (besides callbacks) when IMU is disabled.
    pub fn insert_imu(&mut self, stamp: f64, linear_acc: Vector3<f64>, angular_vel: Vector3<f64>) {
        self.observers
            .notify_insert_imu(stamp, &linear_acc, &angular_vel);
        if self.config.enable_imu {
            self.imu_integration
                .insert_imu(stamp, linear_acc, angular_vel);
        }
    }

    /// Move a submap into the back end and run one full smoother update.
    pub fn insert_submap(&mut self, mut submap: SubMap) {
        debug!(
            "insert_submap id={} |frame|={}",
            submap.id,
            submap.merged_keyframe.len()
        );

        let current = self.submaps.len();
        if submap.id != current {
            warn!(
                "submap id {} does not match its insertion index {}, reassigning",
                submap.id, current
            );
        }
        submap.id = current;

        let subsampled = self.voxelize_submap(&mut submap);

        let current_t_world_submap = if current == 0 {
            submap.t_world_origin.clone()
        } else {
            let last = current - 1;
            let last_t_world_submap = self
                .smoother
                .estimate_pose(&Key::X(last))
                .unwrap_or_else(|| self.submaps[last].t_world_origin.clone());

            let t_origin0_endpoint_r0 = &self.submaps[last].t_origin_endpoint_r;
            let t_origin1_endpoint_l1 = &submap.t_origin_endpoint_l;
            let t_endpoint_r0_endpoint_l1 = self.submaps[last]
                .origin_odom_frames
                .last()
                .expect("submaps carry odometry frames")
                .t_world_sensor()
                .inverse()
                .compose(
                    submap
                        .origin_odom_frames
                        .first()
                        .expect("submaps carry odometry frames")
                        .t_world_sensor(),
                );
            let t_origin0_origin1 = t_origin0_endpoint_r0
                .compose(&t_endpoint_r0_endpoint_l1)
                .compose(&t_origin1_endpoint_l1.inverse());

            last_t_world_submap.compose(&t_origin0_origin1)
        };

        submap.t_world_origin = current_t_world_submap.clone();

        let mut new_values = Values::new();
        new_values.insert(
            Key::X(current),
            Variable::Pose(current_t_world_submap.clone()),
        );

        self.observers.notify_insert_submap(&submap);
        submap.drop_frame_points();
        self.submaps.push(submap);
        self.subsampled_submaps.push(subsampled);

        let mut new_factors: FactorGraph = Vec::new();
        if current == 0 {
            new_factors.push(FactorEntry::new(
                vec![Key::X(0)],
                GraphFactor::Damping(PoseDampingFactor::new(
                    current_t_world_submap,
                    self.config.init_pose_damping_scale,
                )),
            ));
        } else {
            new_factors.extend(self.create_between_factors(current));
            new_factors.extend(self.create_matching_cost_factors(current));
        }

        if self.config.enable_imu {
            debug!("create IMU factors");
            let (imu_factors, imu_values) = self.create_imu_chain(current);
            new_factors.extend(imu_factors);
            new_values.extend_overwrite(imu_values);
        }

        self.update_smoother(new_factors, new_values);
        self.update_submaps();
        self.observers.notify_update_submaps(&self.submaps);
    }

    /// Search all submap pairs for unconnected overlaps and add VGICP
    /// factors for the eligible ones.
    pub fn find_overlapping_submaps(&mut self, min_overlap: f64) {
        if self.submaps.is_empty() {
            return;
        }

        let mut existing_pairs = HashSet::new();
        for entry in self.smoother.factors() {
            if let Some(pair) = entry.pose_pair() {
                existing_pairs.insert(pair);
            }
        }

        let gpu_tagged = self.config.gpu_requested();
        let mut new_factors: FactorGraph = Vec::new();
        for i in 0..self.submaps.len() {
            for j in (i + 1)..self.submaps.len() {
                if existing_pairs.contains(&(i, j)) {
                    continue;
                }

                let delta = self.submaps[i]
                    .t_world_origin
                    .inverse()
                    .compose(&self.submaps[j].t_world_origin);
                if delta.translation().norm() > self.config.max_implicit_loop_distance {
                    continue;
                }

                let overlap = self.submaps[i]
                    .voxelmaps
                    .last()
                    .expect("voxelmaps are built on insertion")
                    .overlap(&self.subsampled_submaps[j], &delta);
                if overlap < min_overlap {
                    continue;
                }

                for voxelmap in &self.submaps[i].voxelmaps {
                    new_factors.push(make_vgicp_entry(
                        i,
                        j,
                        voxelmap.clone(),
                        self.subsampled_submaps[j].clone(),
                        gpu_tagged,
                    ));
                }
            }
        }

        info!("new overlapping {} submap pairs found", new_factors.len());

        self.update_smoother(new_factors, Values::new());
        self.update_submaps();
        self.observers.notify_update_submaps(&self.submaps);
    }

    /// Run an empty smoother update to consume pending relinearizations.
    pub fn optimize(&mut self) {
        if self.smoother.is_empty() {
            return;
        }

        self.update_smoother(Vec::new(), Values::new());
        self.update_submaps();
        self.observers.notify_update_submaps(&self.submaps);
    }

    /// Repair the live graph: re-add any missing variables and edges.
    pub fn recover_graph(&mut self) {
        let (patch_factors, patch_values) =
            self.build_graph_patch(self.smoother.factors(), self.smoother.values());
        self.update_smoother(patch_factors, patch_values);
    }

    /// Concatenate every submap's keyframe, transformed into the world frame.
    pub fn export_points(&self) -> Vec<Vector4<f64>> {
        let num_all_points: usize = self.submaps.iter().map(|s| s.merged_keyframe.len()).sum();
        let mut all_points = Vec::with_capacity(num_all_points);

        for submap in &self.submaps {
            all_points.extend(
                submap
                    .merged_keyframe
                    .points
                    .iter()
                    .map(|p| submap.t_world_origin.transform_hpoint(p)),
            );
        }
        all_points
    }

    /// World-frame points plus a synthesized per-point timestamp stream,
    /// interpolated across each scan segment with a fixed step. Best-effort:
    /// the stamps are neither sorted nor unique by construction.
    pub fn export_points_with_stamps(&self) -> (Vec<Vector4<f64>>, Vec<f64>) {
        let all_points = self.export_points();
        let mut all_times = Vec::with_capacity(all_points.len());

        for submap in &self.submaps {
            let points_count = submap.merged_keyframe.len();
            let stamps_count = submap.stamps_to_merge.len();
            let mut submap_times = vec![0.0; points_count];

            if stamps_count == 0 && points_count > 0 {
                warn!(
                    "submap {} has no merge stamps, exported times stay zero",
                    submap.id
                );
            } else {
                let points_per_stamp = points_count / stamps_count + 1;
                let mut cursor = 0;
                for &stamp in &submap.stamps_to_merge {
                    let mut point_time = stamp;
                    for _ in 0..points_per_stamp {
                        point_time += STAMP_SYNTHESIS_STEP;
                        if cursor < submap_times.len() {
                            submap_times[cursor] = point_time;
                            cursor += 1;
                        }
                    }
                }
            }

            all_times.extend(submap_times);
        }

        (all_points, all_times)
    }

    /// Persist the whole estimator state into a directory.
    pub fn save(&mut self, path: &Path) -> MappingResult<()> {
        self.optimize();

        std::fs::create_dir_all(path)?;

        let mut serializable = Vec::new();
        let mut matching_cost_pairs: BTreeMap<(usize, usize), &'static str> = BTreeMap::new();

        for entry in self.smoother.factors() {
            if entry.factor.is_matching_cost() {
                let pair = entry
                    .pose_pair()
                    .expect("registration factors connect two pose keys");
                let name = entry
                    .factor
                    .tag()
                    .matching_cost_name()
                    .expect("matching-cost factors have a type name");
                matching_cost_pairs.insert(pair, name);
            } else {
                serializable.push(SerializedEntry {
                    keys: entry.keys.clone(),
                    factor: SerializableFactor::try_from(&entry.factor)
                        .expect("non-registration factors serialize"),
                });
            }
        }

        info!("serializing factor graph to {}/graph.bin", path.display());
        let writer = BufWriter::new(File::create(path.join("graph.bin"))?);
        bincode::serialize_into(
            writer,
            &SerializedGraph {
                entries: serializable,
            },
        )
        .map_err(|e| MappingError::Serialization(e.to_string()).log())?;

        let writer = BufWriter::new(File::create(path.join("values.bin"))?);
        bincode::serialize_into(writer, self.smoother.values())
            .map_err(|e| MappingError::Serialization(e.to_string()).log())?;

        let mut graph_txt = BufWriter::new(File::create(path.join("graph.txt"))?);
        writeln!(graph_txt, "num_submaps: {}", self.submaps.len())?;
        writeln!(
            graph_txt,
            "num_all_frames: {}",
            self.submaps
                .iter()
                .map(|s| s.optim_odom_frames.len())
                .sum::<usize>()
        )?;
        writeln!(
            graph_txt,
            "num_matching_cost_factors: {}",
            matching_cost_pairs.len()
        )?;
        for ((i, j), name) in &matching_cost_pairs {
            writeln!(graph_txt, "matching_cost {name} {i} {j}")?;
        }
        drop(graph_txt);

        self.write_trajectories(path)?;

        for (i, submap) in self.submaps.iter().enumerate() {
            submap.save(&path.join(format!("{i:06}")))?;
        }

        Ok(())
    }

    /// Load a mapping result from a dumped directory. Returns false when the
    /// dump cannot be read; deserialization damage is repaired instead.
    pub fn load(&mut self, path: &Path) -> bool {
        let header = match std::fs::read_to_string(path.join("graph.txt")) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to open {}/graph.txt: {e}", path.display());
                return false;
            }
        };

        let parsed = match parse_graph_txt(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("failed to parse {}/graph.txt: {e}", path.display());
                return false;
            }
        };

        self.submaps.clear();
        self.subsampled_submaps.clear();

        info!("load submaps");
        for i in 0..parsed.num_submaps {
            let mut submap = match SubMap::load(&path.join(format!("{i:06}"))) {
                Ok(submap) => submap,
                Err(e) => {
                    error!("failed to load submap {i}: {e}");
                    return false;
                }
            };
            submap.id = i;

            let subsampled = self.voxelize_submap(&mut submap);
            self.observers.notify_insert_submap(&submap);
            self.submaps.push(submap);
            self.subsampled_submaps.push(subsampled);
        }

        let mut needs_recover = false;

        info!("deserializing factor graph");
        let mut graph: FactorGraph = match File::open(path.join("graph.bin"))
            .map_err(MappingError::from)
            .and_then(|file| {
                bincode::deserialize_from::<_, SerializedGraph>(BufReader::new(file))
                    .map_err(|e| MappingError::Serialization(e.to_string()))
            }) {
            Ok(serialized) => serialized
                .entries
                .into_iter()
                .map(|entry| FactorEntry::new(entry.keys, entry.factor.into()))
                .collect(),
            Err(e) => {
                error!("failed to deserialize factor graph: {e}");
                needs_recover = true;
                Vec::new()
            }
        };

        info!("deserializing values");
        let mut values: Values = match File::open(path.join("values.bin"))
            .map_err(MappingError::from)
            .and_then(|file| {
                bincode::deserialize_from(BufReader::new(file))
                    .map_err(|e| MappingError::Serialization(e.to_string()))
            }) {
            Ok(values) => values,
            Err(e) => {
                error!("failed to deserialize values: {e}");
                needs_recover = true;
                Values::new()
            }
        };

        info!("creating matching cost factors");
        let gpu_tagged = self.config.gpu_requested();
        for (kind, first, second) in &parsed.matching_cost_factors {
            match kind.as_str() {
                "vgicp" | "vgicp_gpu" => {
                    if *first >= self.submaps.len() || *second >= self.submaps.len() {
                        warn!("matching cost factor ({first}, {second}) references a missing submap");
                        needs_recover = true;
                        continue;
                    }
                    for voxelmap in &self.submaps[*first].voxelmaps {
                        graph.push(make_vgicp_entry(
                            *first,
                            *second,
                            voxelmap.clone(),
                            self.subsampled_submaps[*second].clone(),
                            gpu_tagged || kind == "vgicp_gpu",
                        ));
                    }
                }
                other => {
                    warn!("unsupported matching cost factor type ({other})");
                }
            }
        }

        // Drop factors whose keys point outside the loaded submap range
        let num_submaps = self.submaps.len();
        let num_factors_before = graph.len();
        graph.retain(|entry| entry.keys.iter().all(|key| key_in_range(key, num_submaps)));
        if graph.len() != num_factors_before {
            warn!(
                "removed {} invalid factors",
                num_factors_before - graph.len()
            );
            needs_recover = true;
        }

        // Same for values that deserialized but reference unknown submaps
        if values.keys().any(|key| !key_in_range(key, num_submaps)) {
            let mut pruned = Values::new();
            for (key, value) in values.iter() {
                if key_in_range(key, num_submaps) {
                    pruned.insert_or_assign(*key, value.clone());
                }
            }
            warn!("removed {} out-of-range values", values.len() - pruned.len());
            values = pruned;
            needs_recover = true;
        }

        if needs_recover {
            warn!("recovering factor graph");
            let (patch_factors, patch_values) = self.build_graph_patch(&graph, &values);
            graph.extend(patch_factors);
            values.extend_overwrite(patch_values);
        }

        info!("optimize");
        self.smoother = Smoother::new((&self.config).into());
        self.update_smoother(graph, values);

        self.update_submaps();
        self.observers.notify_update_submaps(&self.submaps);

        info!("done");
        true
    }

    // ---- internals ----

    /// Adaptive voxelization of a freshly arrived (or reloaded) submap.
    /// Returns the subsampled registration source.
    fn voxelize_submap(&mut self, submap: &mut SubMap) -> Arc<PointCloud> {
        let dist_median = median_distance(&submap.merged_keyframe, MAX_SCAN_COUNT);
        let band = self.config.submap_voxel_resolution_dmax - self.config.submap_voxel_resolution_dmin;
        let p = if band > 0.0 {
            ((dist_median - self.config.submap_voxel_resolution_dmin) / band).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let base_resolution = self.config.submap_voxel_resolution
            + p * (self.config.submap_voxel_resolution_max - self.config.submap_voxel_resolution);

        // Registration needs per-point covariances; estimate them when the
        // front end did not supply any.
        if !submap.merged_keyframe.has_covs() {
            let mut cloud = (*submap.merged_keyframe).clone();
            crate::points::estimate_covariances(&mut cloud, 10);
            submap.merged_keyframe = Arc::new(cloud);
        }

        let subsampled = if self.config.randomsampling_rate > 0.99 {
            submap.merged_keyframe.clone()
        } else {
            Arc::new(random_sampling(
                &submap.merged_keyframe,
                self.config.randomsampling_rate,
                &mut self.rng,
            ))
        };

        submap.voxelmaps.clear();
        for level in 0..self.config.submap_voxelmap_levels {
            let resolution =
                base_resolution * self.config.submap_voxelmap_scaling_factor.powi(level as i32);
            let mut voxelmap = GaussianVoxelMap::new(resolution);
            voxelmap.insert(&submap.merged_keyframe);
            submap.voxelmaps.push(Arc::new(voxelmap));
        }

        subsampled
    }

    /// Odometry-chain between-factors, optionally refined by GICP.
    fn create_between_factors(&self, current: usize) -> FactorGraph {
        if current == 0 || !self.config.create_between_factors {
            return Vec::new();
        }

        let last = current - 1;
        let init_delta = self.submaps[last]
            .t_world_origin
            .inverse()
            .compose(&self.submaps[current].t_world_origin);

        if self.config.between_registration_type == "NONE" {
            return vec![FactorEntry::new(
                vec![Key::X(last), Key::X(current)],
                GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                    init_delta,
                    ENDPOINT_PRECISION,
                )),
            )];
        }

        if self.config.between_registration_type != "GICP" {
            warn!(
                "unknown between registration type ({}), falling back to GICP",
                self.config.between_registration_type
            );
        }

        // Isolated two-variable refinement: prior on the first pose, GICP
        // between the merged keyframes.
        let gicp = IntegratedGicpFactor::new(
            self.submaps[last].merged_keyframe.clone(),
            self.submaps[current].merged_keyframe.clone(),
            GICP_MAX_CORRESPONDENCE_DISTANCE,
        );

        let mut values = Values::new();
        values.insert(Key::X(0), Variable::Pose(SE3::identity()));
        values.insert(Key::X(1), Variable::Pose(init_delta));

        let graph: FactorGraph = vec![
            FactorEntry::new(
                vec![Key::X(0)],
                GraphFactor::PriorPose(PosePriorFactor::from_precision(
                    SE3::identity(),
                    ENDPOINT_PRECISION,
                )),
            ),
            FactorEntry::new(
                vec![Key::X(0), Key::X(1)],
                GraphFactor::Gicp(gicp.clone()),
            ),
        ];

        debug!("--- LM optimization ---");
        let params = OptimizeParams {
            method: OptimizerMethod::LevenbergMarquardt { lambda_init: 1e-12 },
            max_iterations: 10,
            ..OptimizeParams::default()
        };
        if let Err(e) = optimize(&graph, &mut values, &params) {
            warn!("between-factor refinement failed ({e}), using the odometry delta");
            let init_delta = self.submaps[last]
                .t_world_origin
                .inverse()
                .compose(&self.submaps[current].t_world_origin);
            return vec![FactorEntry::new(
                vec![Key::X(last), Key::X(current)],
                GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                    init_delta,
                    ENDPOINT_PRECISION,
                )),
            )];
        }

        let estimated_delta = values.pose(&Key::X(1)).expect("scratch values").clone();

        // Weight the between-factor by the registration Hessian at the
        // optimum, ridged for stability.
        use crate::graph::Factor;
        let params_at_optimum = [
            values.get(&Key::X(0)).expect("scratch values"),
            values.get(&Key::X(1)).expect("scratch values"),
        ];
        let (_, jacobian) = gicp.linearize(&params_at_optimum, true);
        let jacobian = jacobian.expect("jacobian requested");
        let block = jacobian.columns(6, 6);
        let hessian_block = block.transpose() * block;
        let mut information = Matrix6::zeros();
        for r in 0..6 {
            for c in 0..6 {
                information[(r, c)] = hessian_block[(r, c)];
            }
        }
        information += Matrix6::identity() * ENDPOINT_PRECISION;

        vec![FactorEntry::new(
            vec![Key::X(last), Key::X(current)],
            GraphFactor::BetweenPose(PoseBetweenFactor::from_information(
                estimated_delta,
                information,
            )),
        )]
    }

    /// Multi-resolution matching-cost factors against every overlapping
    /// previous submap, plus the disconnection safety net.
    fn create_matching_cost_factors(&self, current: usize) -> FactorGraph {
        if current == 0 {
            return Vec::new();
        }

        let current_submap = &self.submaps[current];
        let gpu_tagged = self.config.gpu_requested();
        let mut factors: FactorGraph = Vec::new();
        let mut previous_overlap = 0.0;

        for i in 0..current {
            let dist = (self.submaps[i].t_world_origin.translation()
                - current_submap.t_world_origin.translation())
            .norm();
            if dist > self.config.max_implicit_loop_distance {
                continue;
            }

            let delta = self.submaps[i]
                .t_world_origin
                .inverse()
                .compose(&current_submap.t_world_origin);
            let overlap = self.submaps[i]
                .voxelmaps
                .last()
                .expect("voxelmaps are built on insertion")
                .overlap(&current_submap.merged_keyframe, &delta);

            if i == current - 1 {
                previous_overlap = overlap;
            }
            if overlap < self.config.min_implicit_loop_overlap {
                continue;
            }

            match self.config.registration_error_factor_type.as_str() {
                "VGICP" | "VGICP_GPU" => {
                    for voxelmap in &self.submaps[i].voxelmaps {
                        factors.push(make_vgicp_entry(
                            i,
                            current,
                            voxelmap.clone(),
                            self.subsampled_submaps[current].clone(),
                            gpu_tagged,
                        ));
                    }
                }
                other => {
                    warn!("unknown registration error type ({other})");
                }
            }
        }

        if previous_overlap < self.config.min_implicit_loop_overlap.max(0.25) {
            warn!(
                "previous submap has only a small overlap with the current submap ({previous_overlap})"
            );
            warn!("create a between factor to prevent the submap from being isolated");
            let last = current - 1;
            let init_delta = self.submaps[last]
                .t_world_origin
                .inverse()
                .compose(&current_submap.t_world_origin);
            factors.push(FactorEntry::new(
                vec![Key::X(last), Key::X(current)],
                GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                    init_delta,
                    ENDPOINT_PRECISION,
                )),
            ));
        }

        factors
    }

    /// Endpoint variables and factors tying the IMU chain to the submap
    /// poses, plus the preintegrated factor between consecutive submaps.
    fn create_imu_chain(&mut self, current: usize) -> (FactorGraph, Values) {
        let submap = &self.submaps[current];
        let mut factors: FactorGraph = Vec::new();
        let mut values = Values::new();

        let front = submap
            .optim_odom_frames
            .first()
            .expect("submaps carry odometry frames");
        let back = submap
            .optim_odom_frames
            .last()
            .expect("submaps carry odometry frames");

        let imu_bias_l = front.imu_bias;
        let imu_bias_r = back.imu_bias;

        let rot_world_origin_inv = submap.t_world_origin.rotation_matrix().transpose();
        let v_origin_imu_l = rot_world_origin_inv * front.v_world_imu;
        let v_origin_imu_r = rot_world_origin_inv * back.v_world_imu;

        if current > 0 {
            values.insert(
                Key::E(current * 2),
                Variable::Pose(
                    submap
                        .t_world_origin
                        .compose(&submap.t_origin_endpoint_l),
                ),
            );
            values.insert(
                Key::V(current * 2),
                Variable::Velocity(submap.t_world_origin.rotation_matrix() * v_origin_imu_l),
            );
            values.insert(Key::B(current * 2), Variable::Bias(imu_bias_l));

            factors.push(FactorEntry::new(
                vec![Key::X(current), Key::E(current * 2)],
                GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                    submap.t_origin_endpoint_l.clone(),
                    ENDPOINT_PRECISION,
                )),
            ));
            factors.push(FactorEntry::new(
                vec![Key::X(current), Key::V(current * 2)],
                GraphFactor::RotateVector3(RotateVector3Factor::from_precision(
                    v_origin_imu_l,
                    ENDPOINT_PRECISION,
                )),
            ));
            factors.push(FactorEntry::new(
                vec![Key::B(current * 2)],
                GraphFactor::PriorBias(BiasPriorFactor::from_precision(
                    imu_bias_l,
                    ENDPOINT_PRECISION,
                )),
            ));
            factors.push(FactorEntry::new(
                vec![Key::B(current * 2), Key::B(current * 2 + 1)],
                GraphFactor::BetweenBias(BiasBetweenFactor::from_precision(ENDPOINT_PRECISION)),
            ));
        }

        values.insert(
            Key::E(current * 2 + 1),
            Variable::Pose(
                submap
                    .t_world_origin
                    .compose(&submap.t_origin_endpoint_r),
            ),
        );
        values.insert(
            Key::V(current * 2 + 1),
            Variable::Velocity(submap.t_world_origin.rotation_matrix() * v_origin_imu_r),
        );
        values.insert(Key::B(current * 2 + 1), Variable::Bias(imu_bias_r));

        factors.push(FactorEntry::new(
            vec![Key::X(current), Key::E(current * 2 + 1)],
            GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                submap.t_origin_endpoint_r.clone(),
                ENDPOINT_PRECISION,
            )),
        ));
        factors.push(FactorEntry::new(
            vec![Key::X(current), Key::V(current * 2 + 1)],
            GraphFactor::RotateVector3(RotateVector3Factor::from_precision(
                v_origin_imu_r,
                ENDPOINT_PRECISION,
            )),
        ));
        factors.push(FactorEntry::new(
            vec![Key::B(current * 2 + 1)],
            GraphFactor::PriorBias(BiasPriorFactor::from_precision(
                imu_bias_r,
                ENDPOINT_PRECISION,
            )),
        ));

        if current != 0 {
            let last = current - 1;
            let stamp_l = self.submaps[last]
                .optim_odom_frames
                .last()
                .expect("submaps carry odometry frames")
                .stamp;
            let stamp_r = front.stamp;

            let (preint, num_integrated, read_cursor) =
                self.imu_integration.integrate(stamp_l, stamp_r, &imu_bias_l);
            self.imu_integration.erase_imu_data(read_cursor);

            if num_integrated < 2 {
                warn!("insufficient IMU data between submaps");
                factors.push(FactorEntry::new(
                    vec![Key::V(last * 2 + 1), Key::V(current * 2)],
                    GraphFactor::BetweenVelocity(VelocityBetweenFactor::from_precision(1.0)),
                ));
            } else {
                factors.push(FactorEntry::new(
                    vec![
                        Key::E(last * 2 + 1),
                        Key::V(last * 2 + 1),
                        Key::E(current * 2),
                        Key::V(current * 2),
                        Key::B(last * 2 + 1),
                    ],
                    GraphFactor::Imu(ImuFactor::new(preint)),
                ));
            }
        }

        (factors, values)
    }

    fn update_smoother(&mut self, new_factors: FactorGraph, new_values: Values) -> SmootherUpdate {
        self.observers.notify_smoother_update(&new_factors, &new_values);

        #[cfg(feature = "parallel")]
        let result = {
            let smoother = &mut self.smoother;
            match &self.thread_pool {
                Some(pool) => pool.install(move || smoother.update(new_factors, new_values)),
                None => smoother.update(new_factors, new_values),
            }
        };

        #[cfg(not(feature = "parallel"))]
        let result = self.smoother.update(new_factors, new_values);

        let update = match result {
            Ok(update) => update,
            Err(e) => {
                error!("smoother update failed: {e}");
                SmootherUpdate::empty()
            }
        };

        self.observers.notify_smoother_update_result(&update);
        update
    }

    /// Mirror the smoother's current pose estimates into the submaps.
    fn update_submaps(&mut self) {
        for i in 0..self.submaps.len() {
            if let Some(pose) = self.smoother.estimate_pose(&Key::X(i)) {
                self.submaps[i].t_world_origin = pose;
            }
        }
    }

    /// Compute the factors and values needed to make `graph`/`values`
    /// consistent with the submap list.
    fn build_graph_patch(&self, graph: &FactorGraph, values: &Values) -> (FactorGraph, Values) {
        info!("recovering graph");

        let mut enable_imu = values
            .keys()
            .any(|key| matches!(key, Key::E(_) | Key::V(_) | Key::B(_)));
        enable_imu |= graph
            .iter()
            .any(|entry| matches!(entry.factor, GraphFactor::Imu(_)));
        info!("enable_imu={enable_imu}");

        info!("creating connectivity map");
        let mut prior_exists = false;
        let mut connectivity: HashMap<Key, HashSet<Key>> = HashMap::new();
        for entry in graph {
            for key in &entry.keys {
                let connected = connectivity.entry(*key).or_default();
                for key2 in &entry.keys {
                    connected.insert(*key2);
                }
            }
            if entry.keys.len() == 1 && entry.keys[0] == Key::X(0) {
                prior_exists |= matches!(entry.factor, GraphFactor::Damping(_));
            }
        }
        let connected_to = |key: Key, other: Key| -> bool {
            connectivity
                .get(&key)
                .map(|set| set.contains(&other))
                .unwrap_or(false)
        };

        let mut new_factors: FactorGraph = Vec::new();
        let mut new_values = Values::new();

        if !prior_exists && !self.submaps.is_empty() {
            warn!("x0 prior is missing");
            new_factors.push(FactorEntry::new(
                vec![Key::X(0)],
                GraphFactor::Damping(PoseDampingFactor::new(
                    self.submaps[0].t_world_origin.clone(),
                    self.config.init_pose_damping_scale,
                )),
            ));
        }

        info!("fixing missing values and factors");
        for i in 0..self.submaps.len() {
            let submap = &self.submaps[i];

            if !values.exists(&Key::X(i)) {
                warn!("x{i} is missing");
                new_values.insert_or_assign(
                    Key::X(i),
                    Variable::Pose(submap.t_world_origin.clone()),
                );
            }

            if i + 1 < self.submaps.len() && !connected_to(Key::X(i), Key::X(i + 1)) {
                warn!("x{i} -> x{} is missing", i + 1);
                let delta = submap
                    .origin_odom_frame()
                    .t_world_sensor()
                    .inverse()
                    .compose(self.submaps[i + 1].origin_odom_frame().t_world_sensor());
                new_factors.push(FactorEntry::new(
                    vec![Key::X(i), Key::X(i + 1)],
                    GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                        delta,
                        ENDPOINT_PRECISION,
                    )),
                ));
            }

            if !enable_imu {
                continue;
            }

            let front = submap
                .optim_odom_frames
                .first()
                .expect("submaps carry odometry frames");
            let back = submap
                .optim_odom_frames
                .last()
                .expect("submaps carry odometry frames");
            let imu_bias_l = front.imu_bias;
            let imu_bias_r = back.imu_bias;
            let rot_inv = submap.t_world_origin.rotation_matrix().transpose();
            let v_origin_imu_l = rot_inv * front.v_world_imu;
            let v_origin_imu_r = rot_inv * back.v_world_imu;

            if i != 0 {
                if !values.exists(&Key::E(i * 2)) {
                    warn!("e{} is missing", i * 2);
                    new_values.insert_or_assign(
                        Key::E(i * 2),
                        Variable::Pose(submap.t_world_origin.compose(&submap.t_origin_endpoint_l)),
                    );
                }
                if !values.exists(&Key::V(i * 2)) {
                    warn!("v{} is missing", i * 2);
                    new_values.insert_or_assign(
                        Key::V(i * 2),
                        Variable::Velocity(submap.t_world_origin.rotation_matrix() * v_origin_imu_l),
                    );
                }
                if !values.exists(&Key::B(i * 2)) {
                    warn!("b{} is missing", i * 2);
                    new_values.insert_or_assign(Key::B(i * 2), Variable::Bias(imu_bias_l));
                }

                if !connected_to(Key::X(i), Key::E(i * 2)) {
                    warn!("x{i} -> e{} is missing", i * 2);
                    new_factors.push(FactorEntry::new(
                        vec![Key::X(i), Key::E(i * 2)],
                        GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                            submap.t_origin_endpoint_l.clone(),
                            ENDPOINT_PRECISION,
                        )),
                    ));
                }
                if !connected_to(Key::X(i), Key::V(i * 2)) {
                    warn!("x{i} -> v{} is missing", i * 2);
                    new_factors.push(FactorEntry::new(
                        vec![Key::X(i), Key::V(i * 2)],
                        GraphFactor::RotateVector3(RotateVector3Factor::from_precision(
                            v_origin_imu_l,
                            ENDPOINT_PRECISION,
                        )),
                    ));
                }
                if !connected_to(Key::B(i * 2), Key::B(i * 2)) {
                    warn!("b{} prior is missing", i * 2);
                    new_factors.push(FactorEntry::new(
                        vec![Key::B(i * 2)],
                        GraphFactor::PriorBias(BiasPriorFactor::from_precision(
                            imu_bias_l,
                            ENDPOINT_PRECISION,
                        )),
                    ));
                }
                if !connected_to(Key::B(i * 2), Key::B(i * 2 + 1)) {
                    warn!("b{} -> b{} is missing", i * 2, i * 2 + 1);
                    new_factors.push(FactorEntry::new(
                        vec![Key::B(i * 2), Key::B(i * 2 + 1)],
                        GraphFactor::BetweenBias(BiasBetweenFactor::from_precision(
                            ENDPOINT_PRECISION,
                        )),
                    ));
                }
            }

            if !values.exists(&Key::E(i * 2 + 1)) {
                warn!("e{} is missing", i * 2 + 1);
                new_values.insert_or_assign(
                    Key::E(i * 2 + 1),
                    Variable::Pose(submap.t_world_origin.compose(&submap.t_origin_endpoint_r)),
                );
            }
            if !values.exists(&Key::V(i * 2 + 1)) {
                warn!("v{} is missing", i * 2 + 1);
                new_values.insert_or_assign(
                    Key::V(i * 2 + 1),
                    Variable::Velocity(submap.t_world_origin.rotation_matrix() * v_origin_imu_r),
                );
            }
            if !values.exists(&Key::B(i * 2 + 1)) {
                warn!("b{} is missing", i * 2 + 1);
                new_values.insert_or_assign(Key::B(i * 2 + 1), Variable::Bias(imu_bias_r));
            }

            if !connected_to(Key::X(i), Key::E(i * 2 + 1)) {
                warn!("x{i} -> e{} is missing", i * 2 + 1);
                new_factors.push(FactorEntry::new(
                    vec![Key::X(i), Key::E(i * 2 + 1)],
                    GraphFactor::BetweenPose(PoseBetweenFactor::from_precision(
                        submap.t_origin_endpoint_r.clone(),
                        ENDPOINT_PRECISION,
                    )),
                ));
            }
            if !connected_to(Key::X(i), Key::V(i * 2 + 1)) {
                warn!("x{i} -> v{} is missing", i * 2 + 1);
                new_factors.push(FactorEntry::new(
                    vec![Key::X(i), Key::V(i * 2 + 1)],
                    GraphFactor::RotateVector3(RotateVector3Factor::from_precision(
                        v_origin_imu_r,
                        ENDPOINT_PRECISION,
                    )),
                ));
            }
            if !connected_to(Key::B(i * 2 + 1), Key::B(i * 2 + 1)) {
                warn!("b{} prior is missing", i * 2 + 1);
                new_factors.push(FactorEntry::new(
                    vec![Key::B(i * 2 + 1)],
                    GraphFactor::PriorBias(BiasPriorFactor::from_precision(
                        imu_bias_r,
                        ENDPOINT_PRECISION,
                    )),
                ));
            }
        }

        info!("recovering done");
        (new_factors, new_values)
    }

    /// Write the four TUM trajectory dumps.
    fn write_trajectories(&self, path: &Path) -> MappingResult<()> {
        let mut odom_lidar = BufWriter::new(File::create(path.join("odom_lidar.txt"))?);
        let mut traj_lidar = BufWriter::new(File::create(path.join("traj_lidar.txt"))?);
        let mut odom_imu = BufWriter::new(File::create(path.join("odom_imu.txt"))?);
        let mut traj_imu = BufWriter::new(File::create(path.join("traj_imu.txt"))?);

        for submap in &self.submaps {
            for frame in &submap.origin_odom_frames {
                write_tum_frame(&mut odom_lidar, frame.stamp, &frame.t_world_lidar)?;
                write_tum_frame(&mut odom_imu, frame.stamp, &frame.t_world_imu)?;
            }

            let t_world_endpoint_l = submap
                .t_world_origin
                .compose(&submap.t_origin_endpoint_l);
            let t_odom_imu0 = submap
                .optim_odom_frames
                .first()
                .expect("submaps carry odometry frames")
                .t_world_imu
                .clone();

            for frame in &submap.optim_odom_frames {
                let t_world_imu = t_world_endpoint_l
                    .compose(&t_odom_imu0.inverse())
                    .compose(&frame.t_world_imu);
                let t_world_lidar = t_world_imu.compose(&frame.t_lidar_imu.inverse());

                write_tum_frame(&mut traj_imu, frame.stamp, &t_world_imu)?;
                write_tum_frame(&mut traj_lidar, frame.stamp, &t_world_lidar)?;
            }
        }

        Ok(())
    }
}

fn make_vgicp_entry(
    i: usize,
    j: usize,
    voxelmap: Arc<GaussianVoxelMap>,
    source: Arc<PointCloud>,
    gpu_tagged: bool,
) -> FactorEntry {
    let factor = if gpu_tagged {
        IntegratedVgicpFactor::new_gpu_tagged(voxelmap, source)
    } else {
        IntegratedVgicpFactor::new(voxelmap, source)
    };
    FactorEntry::new(vec![Key::X(i), Key::X(j)], GraphFactor::Vgicp(factor))
}

fn key_in_range(key: &Key, num_submaps: usize) -> bool {
    match key {
        Key::X(i) => *i < num_submaps,
        Key::E(i) | Key::V(i) | Key::B(i) => *i < num_submaps * 2,
    }
}

/// One TUM line: `stamp x y z qx qy qz qw`.
fn write_tum_frame<W: Write>(writer: &mut W, stamp: f64, pose: &SE3) -> std::io::Result<()> {
    let t = pose.translation();
    let q = pose.rotation().quaternion();
    writeln!(
        writer,
        "{:.9} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
        stamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
    )
}

struct ParsedGraphTxt {
    num_submaps: usize,
    #[allow(dead_code)]
    num_all_frames: usize,
    matching_cost_factors: Vec<(String, usize, usize)>,
}

fn parse_graph_txt(text: &str) -> Result<ParsedGraphTxt, String> {
    let mut tokens = text.split_whitespace();
    let mut read_labeled = |label: &str| -> Result<usize, String> {
        match tokens.next() {
            Some(token) if token == label => {}
            other => return Err(format!("expected '{label}', found {other:?}")),
        }
        tokens
            .next()
            .ok_or_else(|| format!("missing value after '{label}'"))?
            .parse::<usize>()
            .map_err(|e| format!("invalid value after '{label}': {e}"))
    };

    let num_submaps = read_labeled("num_submaps:")?;
    let num_all_frames = read_labeled("num_all_frames:")?;
    let num_matching_cost_factors = read_labeled("num_matching_cost_factors:")?;

    let mut matching_cost_factors = Vec::with_capacity(num_matching_cost_factors);
    for _ in 0..num_matching_cost_factors {
        match tokens.next() {
            Some("matching_cost") => {}
            other => return Err(format!("expected 'matching_cost', found {other:?}")),
        }
        let kind = tokens
            .next()
            .ok_or_else(|| "missing matching cost type".to_string())?
            .to_string();
        let first = tokens
            .next()
            .ok_or_else(|| "missing first index".to_string())?
            .parse::<usize>()
            .map_err(|e| format!("invalid first index: {e}"))?;
        let second = tokens
            .next()
            .ok_or_else(|| "missing second index".to_string())?
            .parse::<usize>()
            .map_err(|e| format!("invalid second index: {e}"))?;
        matching_cost_factors.push((kind, first, second));
    }

    Ok(ParsedGraphTxt {
        num_submaps,
        num_all_frames,
        matching_cost_factors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_txt() {
        let text = "num_submaps: 3\nnum_all_frames: 9\nnum_matching_cost_factors: 2\nmatching_cost vgicp 0 1\nmatching_cost vgicp_gpu 0 2\n";
        let parsed = parse_graph_txt(text).expect("valid header");
        assert_eq!(parsed.num_submaps, 3);
        assert_eq!(parsed.num_all_frames, 9);
        assert_eq!(parsed.matching_cost_factors.len(), 2);
        assert_eq!(
            parsed.matching_cost_factors[1],
            ("vgicp_gpu".to_string(), 0, 2)
        );
    }

    #[test]
    fn test_parse_graph_txt_rejects_garbage() {
        assert!(parse_graph_txt("").is_err());
        assert!(parse_graph_txt("num_submaps: x").is_err());
        assert!(parse_graph_txt("num_submaps: 1\nnum_all_frames: 3\nnum_matching_cost_factors: 1\n").is_err());
    }

    #[test]
    fn test_tum_line_format() {
        let mut buffer = Vec::new();
        write_tum_frame(
            &mut buffer,
            123.456789123,
            &SE3::from_translation(1.0, -2.0, 3.5),
        )
        .expect("write");
        let line = String::from_utf8(buffer).expect("utf8");
        assert_eq!(
            line,
            "123.456789123 1.000000 -2.000000 3.500000 0.000000 0.000000 0.000000 1.000000\n"
        );
    }

    #[test]
    fn test_key_in_range() {
        assert!(key_in_range(&Key::X(2), 3));
        assert!(!key_in_range(&Key::X(3), 3));
        assert!(key_in_range(&Key::V(5), 3));
        assert!(!key_in_range(&Key::V(6), 3));
    }
}
