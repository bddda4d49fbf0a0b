//! Similarity transforms for the object hierarchy.

use nalgebra::{UnitQuaternion, Vector3};

/// Translation, rotation and uniform scale.
///
/// Uniform scale keeps composition closed: the product of two transforms is
/// again a transform of this shape, and the inverse exists whenever the scale
/// is non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    #[must_use]
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: 1.0,
        }
    }

    #[must_use]
    pub fn from_translation(translation: Vector3<f32>) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    #[must_use]
    pub fn with_rotation(mut self, rotation: UnitQuaternion<f32>) -> Self {
        self.rotation = rotation;
        self
    }

    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// `self * child`: place `child`, expressed in this transform's space, into
    /// the parent space.
    #[must_use]
    pub fn compose(&self, child: &Self) -> Self {
        Self {
            translation: self.translation + self.rotation * (child.translation * self.scale),
            rotation: self.rotation * child.rotation,
            scale: self.scale * child.scale,
        }
    }

    /// Inverse transform, or `None` for a zero scale.
    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        if self.scale == 0.0 {
            return None;
        }
        let rotation = self.rotation.inverse();
        let scale = 1.0 / self.scale;
        Some(Self {
            translation: rotation * (-self.translation * scale),
            rotation,
            scale,
        })
    }

    /// Transform a point.
    #[must_use]
    pub fn apply(&self, point: &Vector3<f32>) -> Vector3<f32> {
        self.translation + self.rotation * (point * self.scale)
    }

    /// Component-wise comparison within `epsilon`. `q` and `-q` are the same rotation.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, epsilon: f32) -> bool {
        (self.translation - other.translation).norm() <= epsilon
            && ((self.rotation.coords - other.rotation.coords).norm() <= epsilon
                || (self.rotation.coords + other.rotation.coords).norm() <= epsilon)
            && (self.scale - other.scale).abs() <= epsilon
    }
}

impl std::ops::Mul for Transform {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.compose(&rhs)
    }
}
