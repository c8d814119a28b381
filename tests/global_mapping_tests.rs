//! Integration tests for the global mapping back end.
//!
//! These tests drive the public façade end to end on synthetic submaps:
//! single-submap bootstrap, odometry-chained insertion pulled into place by
//! VGICP factors, overlap-search deduplication, IMU-gap fallback, the
//! low-overlap disconnection guard, and the save/load round-trip.
//!
//! Synthetic clouds are regular voxel-centered grids so that the voxel-map
//! Gaussians coincide with the points and the registration optimum is exact.

use nalgebra::{Vector3, Vector4, Vector6};
use std::sync::Arc;

use global_mapper::factors::GraphFactor;
use global_mapper::mapping::{GlobalMapping, GlobalMappingConfig, OdometryFrame, SubMap};
use global_mapper::points::PointCloud;
use global_mapper::{Key, SE3};

/// A grid of voxel-centered points, optionally shifted.
fn grid_cloud(shift: Vector3<f64>) -> PointCloud {
    let mut points = Vec::new();
    for i in 0..4 {
        for j in 0..4 {
            for k in 0..2 {
                points.push(Vector4::new(
                    i as f64 + 0.5 + shift.x,
                    j as f64 + 0.5 + shift.y,
                    k as f64 + 0.5 + shift.z,
                    1.0,
                ));
            }
        }
    }
    PointCloud::new(points)
}

fn odometry_frame(stamp: f64, t_world: SE3) -> OdometryFrame {
    OdometryFrame {
        stamp,
        t_world_lidar: t_world.clone(),
        t_world_imu: t_world,
        t_lidar_imu: SE3::identity(),
        v_world_imu: Vector3::new(1.0, 0.0, 0.0),
        imu_bias: Vector6::zeros(),
        frame: None,
    }
}

/// A submap whose odometry places it at `t_odom_world` (used for pose
/// prediction) and whose keyframe is `cloud` in the submap origin frame.
fn make_submap(id: usize, t_odom_world: SE3, cloud: PointCloud, stamp: f64) -> SubMap {
    let frames = vec![
        odometry_frame(stamp, t_odom_world.clone()),
        odometry_frame(stamp + 0.5, t_odom_world.clone()),
        odometry_frame(stamp + 1.0, t_odom_world.clone()),
    ];
    SubMap {
        id,
        t_world_origin: t_odom_world,
        t_origin_endpoint_l: SE3::identity(),
        t_origin_endpoint_r: SE3::identity(),
        merged_keyframe: Arc::new(cloud),
        stamps_to_merge: vec![stamp, stamp + 0.5, stamp + 1.0],
        voxelmaps: Vec::new(),
        optim_odom_frames: frames.clone(),
        origin_odom_frames: frames,
    }
}

fn lidar_only_config() -> GlobalMappingConfig {
    GlobalMappingConfig {
        enable_imu: false,
        submap_voxelmap_levels: 1,
        ..GlobalMappingConfig::default()
    }
}

fn count_factors(mapping: &GlobalMapping, predicate: impl Fn(&GraphFactor) -> bool) -> usize {
    mapping
        .smoother()
        .factors()
        .iter()
        .filter(|entry| predicate(&entry.factor))
        .count()
}

#[test]
fn test_single_submap_bootstrap() {
    let mut mapping = GlobalMapping::new(lidar_only_config());
    let cloud = grid_cloud(Vector3::zeros());
    let num_points = cloud.len();

    mapping.insert_submap(make_submap(0, SE3::identity(), cloud, 0.0));

    assert_eq!(mapping.num_submaps(), 1);
    assert_eq!(mapping.submaps()[0].id, 0);

    // The gauge prior pins x0 at identity
    let pose = mapping
        .smoother()
        .estimate_pose(&Key::X(0))
        .expect("x0 exists");
    assert!(pose.translation().norm() < 1e-9);
    assert!(pose.rotation().log().norm() < 1e-9);

    assert_eq!(
        count_factors(&mapping, |f| matches!(f, GraphFactor::Damping(_))),
        1
    );

    // With an identity origin the export equals the keyframe verbatim
    let exported = mapping.export_points();
    assert_eq!(exported.len(), num_points);
    for (exported, original) in exported
        .iter()
        .zip(mapping.submaps()[0].merged_keyframe.points.iter())
    {
        assert!((exported - original).norm() < 1e-12);
    }
}

#[test]
fn test_two_submap_chain_pulled_by_registration() {
    let mut mapping = GlobalMapping::new(lidar_only_config());

    // Submap 0 at the world origin
    mapping.insert_submap(make_submap(
        0,
        SE3::identity(),
        grid_cloud(Vector3::zeros()),
        0.0,
    ));

    // Submap 1 truly sits at (1, 0, 0); its cloud holds the same world
    // points expressed in its own frame. The odometry under-reports the
    // motion so the prediction starts 2 cm short of the truth.
    let submap1 = make_submap(
        1,
        SE3::from_translation(0.98, 0.0, 0.0),
        grid_cloud(Vector3::new(-1.0, 0.0, 0.0)),
        2.0,
    );
    mapping.insert_submap(submap1);

    let pose = mapping
        .smoother()
        .estimate_pose(&Key::X(1))
        .expect("x1 exists");
    assert!(
        (pose.translation() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-3,
        "registration should pull x1 to the true offset, got {}",
        pose.translation()
    );

    // Submap poses mirror the smoother estimate
    assert!(
        (mapping.submaps()[1].t_world_origin.translation() - pose.translation()).norm() < 1e-12
    );

    // One VGICP factor per voxel-map level (one level configured)
    assert_eq!(
        count_factors(&mapping, GraphFactor::is_matching_cost),
        1
    );
}

#[test]
fn test_variable_set_without_imu() {
    let mut mapping = GlobalMapping::new(lidar_only_config());
    for i in 0..3 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-(i as f64), 0.0, 0.0)),
            i as f64 * 2.0,
        ));
    }

    let keys: Vec<Key> = mapping.smoother().values().keys().copied().collect();
    assert_eq!(keys, vec![Key::X(0), Key::X(1), Key::X(2)]);
}

#[test]
fn test_variable_set_with_imu() {
    let config = GlobalMappingConfig {
        submap_voxelmap_levels: 1,
        ..GlobalMappingConfig::default()
    };
    let mut mapping = GlobalMapping::new(config);

    for i in 0..2 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-(i as f64), 0.0, 0.0)),
            i as f64 * 2.0,
        ));
    }

    // {x0, x1} plus e/v/b for 1 <= k < 4; the left endpoint of the first
    // submap (index 0) is intentionally never created
    let values = mapping.smoother().values();
    for i in 0..2 {
        assert!(values.exists(&Key::X(i)));
    }
    for k in 1..4 {
        assert!(values.exists(&Key::E(k)), "e{k} missing");
        assert!(values.exists(&Key::V(k)), "v{k} missing");
        assert!(values.exists(&Key::B(k)), "b{k} missing");
    }
    assert!(!values.exists(&Key::E(0)));
    assert!(!values.exists(&Key::V(0)));
    assert!(!values.exists(&Key::B(0)));
}

#[test]
fn test_imu_gap_fallback() {
    let config = GlobalMappingConfig {
        submap_voxelmap_levels: 1,
        ..GlobalMappingConfig::default()
    };
    let mut mapping = GlobalMapping::new(config);

    // No IMU samples inserted at all: fewer than 2 samples fall between the
    // submap endpoints, so a zero-velocity between-factor substitutes for
    // the preintegrated IMU factor.
    for i in 0..2 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-(i as f64), 0.0, 0.0)),
            i as f64 * 2.0,
        ));
    }

    assert_eq!(
        count_factors(&mapping, |f| matches!(f, GraphFactor::BetweenVelocity(_))),
        1
    );
    assert_eq!(
        count_factors(&mapping, |f| matches!(f, GraphFactor::Imu(_))),
        0
    );

    // The fallback carries unit precision
    let fallback = mapping
        .smoother()
        .factors()
        .iter()
        .find_map(|entry| match &entry.factor {
            GraphFactor::BetweenVelocity(f) => Some((entry.keys.clone(), f.weight)),
            _ => None,
        })
        .expect("fallback exists");
    assert_eq!(fallback.0, vec![Key::V(1), Key::V(2)]);
    assert!((fallback.1 - 1.0).abs() < 1e-12);
}

#[test]
fn test_imu_factor_with_dense_samples() {
    let config = GlobalMappingConfig {
        submap_voxelmap_levels: 1,
        ..GlobalMappingConfig::default()
    };
    let mut mapping = GlobalMapping::new(config);

    mapping.insert_submap(make_submap(
        0,
        SE3::identity(),
        grid_cloud(Vector3::zeros()),
        0.0,
    ));

    // Stationary samples spanning the gap between submap 0's right endpoint
    // (stamp 1.0) and submap 1's left endpoint (stamp 2.0)
    for i in 0..21 {
        mapping.insert_imu(
            1.0 + i as f64 * 0.05,
            Vector3::new(0.0, 0.0, 9.80665),
            Vector3::zeros(),
        );
    }

    mapping.insert_submap(make_submap(
        1,
        SE3::from_translation(1.0, 0.0, 0.0),
        grid_cloud(Vector3::new(-1.0, 0.0, 0.0)),
        2.0,
    ));

    assert_eq!(
        count_factors(&mapping, |f| matches!(f, GraphFactor::Imu(_))),
        1
    );
    assert_eq!(
        count_factors(&mapping, |f| matches!(f, GraphFactor::BetweenVelocity(_))),
        0
    );
}

#[test]
fn test_overlap_search_dedup() {
    let config = GlobalMappingConfig {
        enable_imu: false,
        submap_voxelmap_levels: 2,
        ..GlobalMappingConfig::default()
    };
    let mut mapping = GlobalMapping::new(config);

    // 8 m spacing: consecutive submaps share no voxels, so insertion never
    // adds registration factors and the disconnection guard bridges the
    // chain with plain between-factors instead
    for i in 0..3 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(8.0 * i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-8.0 * i as f64, 0.0, 0.0)),
            i as f64 * 2.0,
        ));
    }
    assert_eq!(count_factors(&mapping, GraphFactor::is_matching_cost), 0);

    // With the overlap requirement lifted, the only unconnected pair in
    // range is (0, 2): one factor per voxel-map level
    let before = mapping.smoother().num_factors();
    mapping.find_overlapping_submaps(0.0);
    let added = mapping.smoother().num_factors() - before;
    assert_eq!(added, 2);

    // A second search finds every pair already connected
    let before = mapping.smoother().num_factors();
    mapping.find_overlapping_submaps(0.0);
    assert_eq!(mapping.smoother().num_factors() - before, 0);
}

#[test]
fn test_low_overlap_guard_adds_between_factor() {
    let mut mapping = GlobalMapping::new(lidar_only_config());

    mapping.insert_submap(make_submap(
        0,
        SE3::identity(),
        grid_cloud(Vector3::zeros()),
        0.0,
    ));

    // The second submap is 50 m away: within the loop-candidate distance but
    // with zero voxel overlap, so no registration factor can constrain it
    mapping.insert_submap(make_submap(
        1,
        SE3::from_translation(0.0, 50.0, 0.0),
        grid_cloud(Vector3::zeros()),
        2.0,
    ));

    assert_eq!(count_factors(&mapping, GraphFactor::is_matching_cost), 0);

    // The disconnection guard bridges x0 -> x1 with a plain between-factor
    let guard = mapping
        .smoother()
        .factors()
        .iter()
        .find(|entry| {
            matches!(entry.factor, GraphFactor::BetweenPose(_))
                && entry.pose_pair() == Some((0, 1))
        })
        .expect("guard factor exists");
    match &guard.factor {
        GraphFactor::BetweenPose(f) => {
            // precision 1e6 -> sqrt-information 1e3 on the diagonal
            assert!((f.sqrt_info[(0, 0)] - 1e3).abs() < 1e-6);
        }
        _ => unreachable!(),
    }

    // And the pose stays where odometry put it
    let pose = mapping
        .smoother()
        .estimate_pose(&Key::X(1))
        .expect("x1 exists");
    assert!((pose.translation() - Vector3::new(0.0, 50.0, 0.0)).norm() < 1e-6);
}

#[test]
fn test_export_points_invariant_under_noop_optimize() {
    let mut mapping = GlobalMapping::new(lidar_only_config());
    for i in 0..2 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-(i as f64), 0.0, 0.0)),
            i as f64 * 2.0,
        ));
    }

    let total: usize = mapping
        .submaps()
        .iter()
        .map(|s| s.merged_keyframe.len())
        .sum();
    let before = mapping.export_points();
    assert_eq!(before.len(), total);

    mapping.optimize();
    let after = mapping.export_points();
    assert_eq!(after.len(), before.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert!((a - b).norm() < 1e-9);
    }
}

#[test]
fn test_export_points_with_stamps() {
    let mut mapping = GlobalMapping::new(lidar_only_config());
    mapping.insert_submap(make_submap(
        0,
        SE3::identity(),
        grid_cloud(Vector3::zeros()),
        100.0,
    ));

    let (points, times) = mapping.export_points_with_stamps();
    assert_eq!(points.len(), times.len());
    // Times interpolate upward from the merge stamps
    assert!(times.iter().all(|&t| t > 100.0));
    assert!(times.iter().all(|&t| t < 102.0));
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump_a = dir.path().join("dump_a");
    let dump_b = dir.path().join("dump_b");

    let mut mapping = GlobalMapping::new(lidar_only_config());
    for i in 0..2 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-(i as f64), 0.0, 0.0)),
            i as f64 * 2.0,
        ));
    }
    mapping.save(&dump_a).expect("save");

    // The dump carries the header, binaries, trajectories and submap dirs
    for name in [
        "graph.bin",
        "values.bin",
        "graph.txt",
        "odom_lidar.txt",
        "traj_lidar.txt",
        "odom_imu.txt",
        "traj_imu.txt",
    ] {
        assert!(dump_a.join(name).exists(), "{name} missing");
    }
    assert!(dump_a.join("000000/submap.bin").exists());
    assert!(dump_a.join("000001/keyframe.bin").exists());

    // Reload into a fresh instance
    let mut restored = GlobalMapping::new(lidar_only_config());
    assert!(restored.load(&dump_a));
    assert_eq!(restored.num_submaps(), 2);

    // Values agree with the first instance up to solver tolerance
    for i in 0..2 {
        let original = mapping
            .smoother()
            .estimate_pose(&Key::X(i))
            .expect("pose in original");
        let reloaded = restored
            .smoother()
            .estimate_pose(&Key::X(i))
            .expect("pose in reload");
        assert!(
            (original.translation() - reloaded.translation()).norm() < 1e-4,
            "x{i} drifted across reload"
        );
    }

    // Save-load-save produces a byte-identical graph.txt
    restored.save(&dump_b).expect("second save");
    let header_a = std::fs::read_to_string(dump_a.join("graph.txt")).expect("header a");
    let header_b = std::fs::read_to_string(dump_b.join("graph.txt")).expect("header b");
    assert_eq!(header_a, header_b);
}

#[test]
fn test_load_missing_directory_returns_false() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut mapping = GlobalMapping::new(lidar_only_config());
    assert!(!mapping.load(&dir.path().join("nothing-here")));
}

#[test]
fn test_tum_trajectory_format() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("dump");

    let mut mapping = GlobalMapping::new(lidar_only_config());
    mapping.insert_submap(make_submap(
        0,
        SE3::identity(),
        grid_cloud(Vector3::zeros()),
        1234.5,
    ));
    mapping.save(&dump).expect("save");

    let odom = std::fs::read_to_string(dump.join("odom_imu.txt")).expect("odom_imu");
    let lines: Vec<&str> = odom.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 8, "TUM line has 8 fields: {line}");
        // 9-decimal stamp, 6-decimal pose fields
        assert_eq!(fields[0].split('.').nth(1).map(str::len), Some(9));
        assert_eq!(fields[1].split('.').nth(1).map(str::len), Some(6));
    }
}

#[test]
fn test_dummy_solver_keeps_inserted_poses() {
    let config = GlobalMappingConfig {
        enable_imu: false,
        enable_optimization: false,
        submap_voxelmap_levels: 1,
        ..GlobalMappingConfig::default()
    };
    let mut mapping = GlobalMapping::new(config);

    for i in 0..2 {
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64 * 0.9, 0.1, 0.0),
            grid_cloud(Vector3::zeros()),
            i as f64 * 2.0,
        ));
    }

    // Without optimization the poses stay exactly where prediction put them
    let pose = mapping
        .smoother()
        .estimate_pose(&Key::X(1))
        .expect("x1 exists");
    assert!((pose.translation() - Vector3::new(0.9, 0.1, 0.0)).norm() < 1e-12);
}

#[test]
fn test_submap_list_grows_by_one() {
    let mut mapping = GlobalMapping::new(lidar_only_config());
    for i in 0..4 {
        let before = mapping.num_submaps();
        mapping.insert_submap(make_submap(
            i,
            SE3::from_translation(i as f64, 0.0, 0.0),
            grid_cloud(Vector3::new(-(i as f64), 0.0, 0.0)),
            i as f64 * 2.0,
        ));
        assert_eq!(mapping.num_submaps(), before + 1);
        assert_eq!(mapping.submaps().last().expect("non-empty").id, i);
    }
}
