//! World-Space Vectors
//!
//! Positions and transforms as reported by the engine clients.
//! The server only needs distances on these, never a physics step.

use serde::{Serialize, Deserialize};

/// A point or direction in world space (Y is up).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component.
    pub x: f32,
    /// Y component (height).
    pub y: f32,
    /// Z component.
    pub z: f32,
}

impl Vec3 {
    /// The world origin.
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    /// Create a new vector.
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Component-wise addition.
    #[inline]
    pub fn add(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    /// Component-wise subtraction.
    #[inline]
    pub fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    /// Scale by a scalar.
    #[inline]
    pub fn scale(self, s: f32) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }

    /// Squared length.
    #[inline]
    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Length.
    #[inline]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Squared distance to another point.
    #[inline]
    pub fn distance_squared(self, other: Vec3) -> f32 {
        self.sub(other).length_squared()
    }

    /// Distance to another point.
    #[inline]
    pub fn distance(self, other: Vec3) -> f32 {
        self.sub(other).length()
    }

    /// Drop the vertical component. Dashes and catches happen on the floor plane.
    #[inline]
    pub fn flatten(self) -> Vec3 {
        Vec3::new(self.x, 0.0, self.z)
    }

    /// Unit vector in the same direction, or zero for a (near) zero vector.
    pub fn normalize(self) -> Vec3 {
        let len = self.length();
        if len <= f32::EPSILON {
            Vec3::ZERO
        } else {
            self.scale(1.0 / len)
        }
    }

    /// Linear interpolation, `t` clamped to [0, 1].
    pub fn lerp(self, other: Vec3, t: f32) -> Vec3 {
        let t = t.clamp(0.0, 1.0);
        self.add(other.sub(self).scale(t))
    }

    /// True if every component is finite.
    #[inline]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Position plus facing. Pitch and roll are presentation-only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// World position.
    pub position: Vec3,
    /// Facing around the Y axis, in degrees.
    pub yaw: f32,
}

impl Transform {
    /// Transform at the world origin facing +Z.
    pub const ORIGIN: Transform = Transform { position: Vec3::ZERO, yaw: 0.0 };

    /// Create a transform.
    pub const fn new(position: Vec3, yaw: f32) -> Self {
        Self { position, yaw }
    }

    /// Transform at a position with default facing.
    pub const fn at(position: Vec3) -> Self {
        Self { position, yaw: 0.0 }
    }

    /// True if the transform carries no NaN/inf.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.yaw.is_finite()
    }
}
