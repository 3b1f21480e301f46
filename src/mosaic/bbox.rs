//! World-space bounding box with the session's pixel resolution attached.

use nalgebra::Vector2;

use super::types::TILE_SIZE;

/// Axis-aligned ground-plane rectangle plus the resolution it is rasterised at.
///
/// Pixel coordinates are relative to the top-left (north-west) corner
/// `(min.x, max.y)`; `u` grows east, `v` grows south.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vector2<f64>,
    pub max: Vector2<f64>,
    /// Ground length covered by one pixel.
    pub resolution: f64,
    /// Ground length covered by one tile (`TILE_SIZE · resolution`).
    pub tile_size: f64,
}

impl BoundingBox {
    pub fn new(min: Vector2<f64>, max: Vector2<f64>, resolution: f64) -> Self {
        Self {
            min,
            max,
            resolution,
            tile_size: f64::from(TILE_SIZE) * resolution,
        }
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn width_px(&self) -> u32 {
        (self.width() / self.resolution).round().max(0.0) as u32
    }

    pub fn height_px(&self) -> u32 {
        (self.height() / self.resolution).round().max(0.0) as u32
    }

    pub fn contains_point(&self, p: &Vector2<f64>) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.contains_point(&other.min) && self.contains_point(&other.max)
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
            ..*self
        }
    }

    /// World point → pixel coordinates relative to the north-west corner.
    pub fn world_to_pixel(&self, p: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            (p.x - self.min.x) / self.resolution,
            (self.max.y - p.y) / self.resolution,
        )
    }

    /// Inverse of [`world_to_pixel`](Self::world_to_pixel).
    pub fn world_from_pixel(&self, px: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.min.x + px.x * self.resolution,
            self.max.y - px.y * self.resolution,
        )
    }
}
