//! Variable values: poses, velocities, and biases keyed by [`Key`].

use nalgebra::{Vector3, Vector6};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::graph::Key;
use crate::manifold::SE3;

/// A single variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// SE(3) pose (submap origin or IMU endpoint)
    Pose(SE3),
    /// World-frame velocity
    Velocity(Vector3<f64>),
    /// IMU bias `[accel, gyro]`
    Bias(Vector6<f64>),
}

impl Variable {
    /// Tangent-space dimension of this variable.
    pub fn tangent_dim(&self) -> usize {
        match self {
            Variable::Pose(_) => SE3::DOF,
            Variable::Velocity(_) => 3,
            Variable::Bias(_) => 6,
        }
    }

    /// Apply a tangent-space step: manifold plus for poses, plain addition
    /// for the vector variables.
    pub fn retract(&mut self, step: &[f64]) {
        match self {
            Variable::Pose(pose) => {
                let delta = Vector6::from_row_slice(step);
                *pose = pose.retract(&delta);
            }
            Variable::Velocity(v) => {
                *v += Vector3::from_row_slice(step);
            }
            Variable::Bias(b) => {
                *b += Vector6::from_row_slice(step);
            }
        }
    }

    pub fn as_pose(&self) -> Option<&SE3> {
        match self {
            Variable::Pose(pose) => Some(pose),
            _ => None,
        }
    }

    pub fn as_velocity(&self) -> Option<&Vector3<f64>> {
        match self {
            Variable::Velocity(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bias(&self) -> Option<&Vector6<f64>> {
        match self {
            Variable::Bias(b) => Some(b),
            _ => None,
        }
    }
}

/// Ordered map of variable values.
///
/// The ordering of the underlying map defines the column layout of the
/// linearized system, so iteration order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Values {
    map: BTreeMap<Key, Variable>,
}

impl Values {
    pub fn new() -> Self {
        Values {
            map: BTreeMap::new(),
        }
    }

    /// Insert a value. Overwriting an existing key is reported; new factors
    /// are expected to bring new variables.
    pub fn insert(&mut self, key: Key, value: Variable) {
        if self.map.insert(key, value).is_some() {
            warn!("value for {} was already present and has been replaced", key);
        }
    }

    /// Insert or silently overwrite (used by graph recovery).
    pub fn insert_or_assign(&mut self, key: Key, value: Variable) {
        self.map.insert(key, value);
    }

    /// Merge another set of values, overwriting on collision.
    pub fn extend_overwrite(&mut self, other: Values) {
        for (key, value) in other.map {
            self.map.insert(key, value);
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Variable> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Variable> {
        self.map.get_mut(key)
    }

    pub fn exists(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn pose(&self, key: &Key) -> Option<&SE3> {
        self.map.get(key).and_then(Variable::as_pose)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.map.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Variable)> {
        self.map.iter()
    }

    /// Total tangent-space dimension over all variables.
    pub fn total_dof(&self) -> usize {
        self.map.values().map(Variable::tangent_dim).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retract_pose() {
        let mut var = Variable::Pose(SE3::identity());
        var.retract(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let pose = var.as_pose().expect("pose variant");
        assert!((pose.translation() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_retract_velocity() {
        let mut var = Variable::Velocity(Vector3::new(1.0, 2.0, 3.0));
        var.retract(&[0.5, -0.5, 0.0]);
        let v = var.as_velocity().expect("velocity variant");
        assert!((v - Vector3::new(1.5, 1.5, 3.0)).norm() < 1e-12);
    }

    #[test]
    fn test_values_ordering_is_deterministic() {
        let mut values = Values::new();
        values.insert(Key::X(1), Variable::Pose(SE3::identity()));
        values.insert(Key::V(3), Variable::Velocity(Vector3::zeros()));
        values.insert(Key::X(0), Variable::Pose(SE3::identity()));
        values.insert(Key::B(2), Variable::Bias(Vector6::zeros()));

        let keys: Vec<Key> = values.keys().copied().collect();
        assert_eq!(keys, vec![Key::B(2), Key::V(3), Key::X(0), Key::X(1)]);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut values = Values::new();
        values.insert(
            Key::X(0),
            Variable::Pose(SE3::from_translation(1.0, 2.0, 3.0)),
        );
        values.insert(Key::V(1), Variable::Velocity(Vector3::new(0.1, 0.2, 0.3)));
        values.insert(Key::B(1), Variable::Bias(Vector6::repeat(0.01)));

        let bytes = bincode::serialize(&values).expect("serialize");
        let restored: Values = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(restored, values);
    }

    #[test]
    fn test_total_dof() {
        let mut values = Values::new();
        values.insert(Key::X(0), Variable::Pose(SE3::identity()));
        values.insert(Key::V(1), Variable::Velocity(Vector3::zeros()));
        values.insert(Key::B(1), Variable::Bias(Vector6::zeros()));
        assert_eq!(values.total_dof(), 15);
    }
}
