//! Core value types shared across the runtime

use glam::{Affine2, Vec2};
use serde::{Deserialize, Serialize};

/// Position, rotation (radians) and scale on the simulation plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub position: Vec2,
    pub rotation: f32,
    pub scale: Vec2,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            rotation: 0.0,
            scale: Vec2::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec2) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Local-to-parent matrix
    pub fn matrix(&self) -> Affine2 {
        Affine2::from_scale_angle_translation(self.scale, self.rotation, self.position)
    }

    /// Unit vector the transform is facing (local +X)
    pub fn forward(&self) -> Vec2 {
        Vec2::from_angle(self.rotation)
    }

    pub fn translate(&mut self, offset: Vec2) {
        self.position += offset;
    }

    pub fn rotate(&mut self, radians: f32) {
        self.rotation = (self.rotation + radians).rem_euclid(std::f32::consts::TAU);
    }

    /// Map a point from this transform's local space to parent space
    pub fn transform_point(&self, point: Vec2) -> Vec2 {
        self.matrix().transform_point2(point)
    }
}
