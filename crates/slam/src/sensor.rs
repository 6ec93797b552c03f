//! Sensor port: scan matching and virtual-measurement construction.

use std::sync::Arc;

use thiserror::Error;
use transforms::{Transform, TransformWithCovariance};
use types::{Measurement, MeasurementRef};

use crate::graph::VertexObject;

#[derive(Error, Debug)]
pub enum SensorError {
    /// The measurement originates from a different sensor. Sensors operate
    /// on their own readings only.
    #[error("measurement type does not match sensor type")]
    BadMeasurementType,
    /// Two measurements could not be aligned within the matcher's
    /// tolerances. Harmless once in a while; frequent failures mean the
    /// matching parameters need tuning.
    #[error("measurements could not be matched: {0}")]
    NoMatch(String),
}

/// A scan-matching sensor, identified by a unique name.
///
/// The mapper resolves sensors by the `sensor_name` of each incoming
/// measurement, so registered names must be unique. Sensors are shared as
/// `Arc<dyn Sensor>`: the mapper holds a lookup reference, not exclusive
/// ownership.
pub trait Sensor {
    /// Unique name; measurements carry it to route themselves here.
    fn name(&self) -> &str;

    /// Pose of the sensor in the robot frame (extrinsic calibration).
    fn sensor_pose(&self) -> Transform;

    /// Estimate the rigid transform aligning `source` to `target`, starting
    /// from `guess`. `coarse` requests a wide-basin estimate suitable as the
    /// seed of a second, fine pass.
    fn calculate_transform(
        &self,
        source: &dyn Measurement,
        target: &dyn Measurement,
        guess: Transform,
        coarse: bool,
    ) -> Result<TransformWithCovariance, SensorError>;

    /// Build a virtual measurement aggregating the readings of the given
    /// vertices (all from this sensor), expressed in the frame of `origin`.
    fn create_combined_measurement(
        &self,
        vertices: &[VertexObject],
        origin: &Transform,
    ) -> Result<MeasurementRef, SensorError>;

    /// Admission thresholds: minimum translation (meters) and minimum
    /// rotation (radians) between adjacent vertices.
    fn min_pose_distance(&self) -> (f64, f64);

    /// Whether the relative motion `t` is large enough to admit a new
    /// vertex under this sensor's thresholds.
    fn check_min_distance(&self, t: &Transform) -> bool {
        let (min_translation, min_rotation) = self.min_pose_distance();
        t.translation().norm() >= min_translation || t.rotation_angle() >= min_rotation
    }
}

/// Shared sensor handle.
pub type SensorRef = Arc<dyn Sensor>;
