//! 3D rigid-body transforms for pose-graph SLAM.
//!
//! Provides:
//! - `Transform`: rotation + translation over `Isometry3`, with composition,
//!   inverse and orthogonalization
//! - `Covariance`: 6x6 uncertainty over (translation, rotation) error space
//! - `TransformWithCovariance`: the pair, as produced by scan matchers
//!
//! Poses accumulate numerical drift when composed repeatedly; every pose
//! written back to the graph must go through [`Transform::orthogonalized`].

use nalgebra::{Isometry3, Matrix6, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// 6x6 covariance over (translation, rotation) error space.
///
/// Treated as an opaque positive-semidefinite matrix by the mapper and
/// interpreted only by the solver.
pub type Covariance = Matrix6<f64>;

/// A 3D rigid body transform (rotation + translation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    inner: Isometry3<f64>,
}

impl Transform {
    /// Create identity transform.
    pub fn identity() -> Self {
        Self {
            inner: Isometry3::identity(),
        }
    }

    /// Create transform from a translation vector and an axis-angle rotation.
    pub fn new(translation: Vector3<f64>, axisangle: Vector3<f64>) -> Self {
        Self {
            inner: Isometry3::new(translation, axisangle),
        }
    }

    /// Create a pure translation.
    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self {
            inner: Isometry3::translation(x, y, z),
        }
    }

    /// Create from explicit translation and rotation parts.
    pub fn from_parts(translation: Translation3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            inner: Isometry3::from_parts(translation, rotation),
        }
    }

    /// Create from nalgebra Isometry3.
    pub fn from_isometry(iso: Isometry3<f64>) -> Self {
        Self { inner: iso }
    }

    /// Get the underlying nalgebra Isometry3.
    pub fn as_isometry(&self) -> &Isometry3<f64> {
        &self.inner
    }

    /// Get translation component.
    pub fn translation(&self) -> Vector3<f64> {
        self.inner.translation.vector
    }

    /// Get rotation component.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.inner.rotation
    }

    /// Rotation magnitude in radians (angle of the axis-angle form, in [0, pi]).
    pub fn rotation_angle(&self) -> f64 {
        self.inner.rotation.angle()
    }

    /// Compute inverse transform.
    pub fn inverse(&self) -> Self {
        Self {
            inner: self.inner.inverse(),
        }
    }

    /// Compose transforms: self * other.
    /// If self is A->B and other is B->C, result is A->C.
    pub fn compose(&self, other: &Transform) -> Transform {
        Transform {
            inner: self.inner * other.inner,
        }
    }

    /// Compute relative transform from self to other (both in the same frame).
    pub fn relative_to(&self, other: &Transform) -> Transform {
        Transform {
            inner: self.inner.inverse() * other.inner,
        }
    }

    /// Project the rotation part back onto SO(3).
    ///
    /// With a unit-quaternion representation this is renormalization; the
    /// quaternion slowly loses unit length under repeated composition.
    pub fn orthogonalized(&self) -> Transform {
        let rotation = UnitQuaternion::new_normalize(*self.inner.rotation.quaternion());
        Transform {
            inner: Isometry3::from_parts(self.inner.translation, rotation),
        }
    }

    /// Transform a point from child frame to parent frame.
    pub fn transform_point(&self, point: Vector3<f64>) -> Vector3<f64> {
        self.inner.transform_point(&nalgebra::Point3::from(point)).coords
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        self.compose(&rhs)
    }
}

impl std::ops::Mul<&Transform> for Transform {
    type Output = Transform;

    fn mul(self, rhs: &Transform) -> Transform {
        self.compose(rhs)
    }
}

impl std::ops::Mul<Transform> for &Transform {
    type Output = Transform;

    fn mul(self, rhs: Transform) -> Transform {
        self.compose(&rhs)
    }
}

impl std::ops::Mul<&Transform> for &Transform {
    type Output = Transform;

    fn mul(self, rhs: &Transform) -> Transform {
        self.compose(rhs)
    }
}

/// A transform together with its 6x6 covariance, as returned by scan matchers
/// and odometry models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformWithCovariance {
    pub transform: Transform,
    pub covariance: Covariance,
}

impl TransformWithCovariance {
    /// Pair a transform with its covariance.
    pub fn new(transform: Transform, covariance: Covariance) -> Self {
        Self {
            transform,
            covariance,
        }
    }

    /// A transform with unit covariance.
    pub fn from_transform(transform: Transform) -> Self {
        Self {
            transform,
            covariance: Covariance::identity(),
        }
    }
}
