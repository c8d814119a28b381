//! Observer callbacks fired by the back end.
//!
//! Viewers and loggers subscribe here; every hook has a no-op default and
//! all callbacks are invoked on the worker driving the back end.

use nalgebra::Vector3;

use crate::graph::{FactorGraph, Values};
use crate::mapping::smoother::SmootherUpdate;
use crate::mapping::submap::SubMap;

/// Event sink for global mapping progress.
pub trait MappingObserver: Send {
    fn on_insert_imu(&self, _stamp: f64, _linear_acc: &Vector3<f64>, _angular_vel: &Vector3<f64>) {}

    /// A submap was registered with the back end (pose already predicted).
    fn on_insert_submap(&self, _submap: &SubMap) {}

    /// New factors and values are about to be folded into the smoother.
    fn on_smoother_update(&self, _new_factors: &FactorGraph, _new_values: &Values) {}

    /// Result of the smoother update that just ran.
    fn on_smoother_update_result(&self, _result: &SmootherUpdate) {}

    /// Submap poses were refreshed from the current estimate.
    fn on_update_submaps(&self, _submaps: &[SubMap]) {}
}

/// A list of observers notified in registration order.
#[derive(Default)]
pub struct ObserverVec {
    observers: Vec<Box<dyn MappingObserver>>,
}

impl ObserverVec {
    pub fn new() -> Self {
        ObserverVec {
            observers: Vec::new(),
        }
    }

    pub fn add(&mut self, observer: impl MappingObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn notify_insert_imu(&self, stamp: f64, acc: &Vector3<f64>, gyro: &Vector3<f64>) {
        for observer in &self.observers {
            observer.on_insert_imu(stamp, acc, gyro);
        }
    }

    pub fn notify_insert_submap(&self, submap: &SubMap) {
        for observer in &self.observers {
            observer.on_insert_submap(submap);
        }
    }

    pub fn notify_smoother_update(&self, new_factors: &FactorGraph, new_values: &Values) {
        for observer in &self.observers {
            observer.on_smoother_update(new_factors, new_values);
        }
    }

    pub fn notify_smoother_update_result(&self, result: &SmootherUpdate) {
        for observer in &self.observers {
            observer.on_smoother_update_result(result);
        }
    }

    pub fn notify_update_submaps(&self, submaps: &[SubMap]) {
        for observer in &self.observers {
            observer.on_update_submaps(submaps);
        }
    }
}
