//! Odometry port: dead-reckoning pose source.

use thiserror::Error;
use transforms::{Covariance, Transform};
use types::Timestamp;

#[derive(Error, Debug)]
pub enum OdometryError {
    #[error("no odometry data for timestamp {0}")]
    NoData(Timestamp),
}

/// A dead-reckoning source (wheel encoders, IMU integration, ...).
///
/// Optional: without one the mapper runs odometry-free and admission
/// decisions fall back to the scan-match result.
pub trait Odometry {
    /// Pose of the robot in the odometry frame at the given time.
    fn odometric_pose(&mut self, time: Timestamp) -> Result<Transform, OdometryError>;

    /// Uncertainty of a relative motion, as a 6x6 covariance.
    fn calculate_covariance(&self, relative_motion: &Transform) -> Covariance;
}
