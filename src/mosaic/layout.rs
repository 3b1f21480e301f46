//! Session layout: the immutable geometry fixed by `prepare`.

use nalgebra::{Vector2, Vector3};

use crate::geometry::{CameraParameters, SE3};

use super::bbox::BoundingBox;
use super::types::{TILE_SIZE, TileIndex, TileRange};

/// Plane, camera, resolution and tile size of one fusion session.
///
/// Built once by `prepare` and shared read-only afterwards; resolution and
/// tile size never change for the life of a session.
#[derive(Debug, Clone)]
pub struct MapLayout {
    /// Ground plane pose, `T_world_plane`.
    pub plane: SE3,
    /// `T_plane_world`, cached.
    plane_inv: SE3,
    pub camera: CameraParameters,
    /// Ground length per pixel.
    pub resolution: f64,
    /// Ground length per tile.
    pub tile_world_size: f64,
    /// Largest footprint, in tiles along either axis, a single frame may
    /// cover. `None` is unbounded.
    pub max_frame_span: Option<usize>,
}

impl MapLayout {
    pub fn new(plane: SE3, camera: CameraParameters, resolution: f64) -> Self {
        Self {
            plane,
            plane_inv: plane.inverse(),
            camera,
            resolution,
            tile_world_size: f64::from(TILE_SIZE) * resolution,
            max_frame_span: None,
        }
    }

    pub fn with_max_frame_span(mut self, tiles: usize) -> Self {
        self.max_frame_span = Some(tiles);
        self
    }

    /// Convert a world camera pose `T_world_cam` into `T_plane_cam`.
    pub fn to_plane(&self, t_world_cam: &SE3) -> SE3 {
        self.plane_inv.compose(t_world_cam)
    }

    /// Tile containing a ground point.
    pub fn tile_of(&self, p: &Vector2<f64>) -> TileIndex {
        TileIndex::new(
            (p.x / self.tile_world_size).floor() as i64,
            (p.y / self.tile_world_size).floor() as i64,
        )
    }

    /// Tiles touched by the ground rectangle `[min, max]`.
    pub fn tile_range(&self, min: &Vector2<f64>, max: &Vector2<f64>) -> TileRange {
        TileRange::spanning(self.tile_of(min), self.tile_of(max))
    }

    /// Ground bounds of a range of tiles.
    pub fn range_bounds(&self, range: &TileRange) -> BoundingBox {
        let t = self.tile_world_size;
        BoundingBox::new(
            Vector2::new(range.min_ix as f64 * t, range.min_iy as f64 * t),
            Vector2::new((range.max_ix + 1) as f64 * t, (range.max_iy + 1) as f64 * t),
            self.resolution,
        )
    }

    pub fn tile_bounds(&self, index: TileIndex) -> BoundingBox {
        self.range_bounds(&TileRange::single(index))
    }

    /// Map-pixel coordinates `(u, v)` of a tile's top-left corner.
    pub fn tile_origin_px(&self, index: TileIndex) -> (i64, i64) {
        let size = i64::from(TILE_SIZE);
        (index.ix * size, -(index.iy + 1) * size)
    }

    /// World-frame corners of a tile (NW, NE, SE, SW), for display quads.
    pub fn tile_world_corners(&self, index: TileIndex) -> [Vector3<f64>; 4] {
        let b = self.tile_bounds(index);
        [
            Vector3::new(b.min.x, b.max.y, 0.0),
            Vector3::new(b.max.x, b.max.y, 0.0),
            Vector3::new(b.max.x, b.min.y, 0.0),
            Vector3::new(b.min.x, b.min.y, 0.0),
        ]
        .map(|p| self.plane.transform_point(&p))
    }
}
