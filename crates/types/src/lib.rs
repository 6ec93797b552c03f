//! Shared measurement types for the mapping stack.
//!
//! A [`Measurement`] is an immutable sensor reading identified by a UUID.
//! The mapper never looks inside a measurement; sensors downcast through
//! [`Measurement::as_any`] to recover their concrete reading type.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use transforms::Transform;
use uuid::Uuid;

/// Timestamp attached to every measurement.
pub type Timestamp = DateTime<Utc>;

/// An immutable sensor reading.
///
/// Carries the identity attributes the mapper needs for indexing and
/// admission; the actual sensor data lives in the implementing type and is
/// recovered by the owning sensor via [`Measurement::as_any`].
pub trait Measurement {
    /// Globally unique id of this reading, used for cross-robot references.
    fn uuid(&self) -> Uuid;

    /// Time the reading was taken.
    fn timestamp(&self) -> Timestamp;

    /// Name of the robot that recorded this reading.
    fn robot_name(&self) -> &str;

    /// Name of the sensor that recorded this reading.
    fn sensor_name(&self) -> &str;

    /// Pose of the sensor in the robot frame (extrinsic calibration).
    fn sensor_pose(&self) -> Transform;

    /// Downcast hook for sensor implementations.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a measurement; multiple graph vertices may reference the
/// same underlying reading.
pub type MeasurementRef = Arc<dyn Measurement>;

/// Plain measurement carrying only the identity attributes.
///
/// Concrete sensors embed their data in their own measurement types; this
/// one backs virtual (combined) measurements and tests.
#[derive(Debug, Clone)]
pub struct BasicMeasurement {
    uuid: Uuid,
    timestamp: Timestamp,
    robot_name: String,
    sensor_name: String,
    sensor_pose: Transform,
}

impl BasicMeasurement {
    /// Create a measurement with a fresh UUID.
    pub fn new(
        robot_name: impl Into<String>,
        sensor_name: impl Into<String>,
        timestamp: Timestamp,
        sensor_pose: Transform,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            timestamp,
            robot_name: robot_name.into(),
            sensor_name: sensor_name.into(),
            sensor_pose,
        }
    }

    /// Create a measurement with an externally assigned UUID.
    pub fn with_uuid(
        uuid: Uuid,
        robot_name: impl Into<String>,
        sensor_name: impl Into<String>,
        timestamp: Timestamp,
        sensor_pose: Transform,
    ) -> Self {
        Self {
            uuid,
            timestamp,
            robot_name: robot_name.into(),
            sensor_name: sensor_name.into(),
            sensor_pose,
        }
    }
}

impl Measurement for BasicMeasurement {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn robot_name(&self) -> &str {
        &self.robot_name
    }

    fn sensor_name(&self) -> &str {
        &self.sensor_name
    }

    fn sensor_pose(&self) -> Transform {
        self.sensor_pose
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The measurement assigned to the root vertex of the pose graph.
///
/// Its sensor name `"none"` keeps the root out of every sensor's spatial
/// index and marks the root link for graph-distance weighting.
#[derive(Debug, Clone)]
pub struct MapOrigin {
    uuid: Uuid,
    timestamp: Timestamp,
}

impl MapOrigin {
    /// Sensor name reported by the map origin.
    pub const SENSOR_NAME: &'static str = "none";

    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for MapOrigin {
    fn default() -> Self {
        Self::new()
    }
}

impl Measurement for MapOrigin {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn robot_name(&self) -> &str {
        ""
    }

    fn sensor_name(&self) -> &str {
        Self::SENSOR_NAME
    }

    fn sensor_pose(&self) -> Transform {
        Transform::identity()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
