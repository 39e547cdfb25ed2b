//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! Positions are replayed verbatim from recorded caches, so equality here is
//! plain IEEE equality on every component.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub const fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }

    /// Builds a vector from a slice of exactly three components.
    pub fn from_slice(s: &[f32]) -> Option<Self> {
        match s {
            [x, y, z] => Some(Self::new(*x, *y, *z)),
            _ => None,
        }
    }
}
