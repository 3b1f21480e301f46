//! Fusion strategies.
//!
//! Every incremental strategy implements [`Compositor`]: it turns a posed frame
//! into a strategy-specific prepared frame once, then merges that frame into
//! each touched tile and renders tiles to RGBA textures on demand.
//!
//! - [`flat::FlatCompositor`]: per-pixel max-weight-wins.
//! - [`multiband::MultiBandCompositor`]: Laplacian bands, max-weight-wins per band.
//! - [`device::DeviceCompositor`]: band storage behind a [`device::DeviceBackend`].
//!
//! [`seam::SeamBlender`] is the batch strategy and works on whole frame sets.

pub mod device;
pub mod flat;
pub mod multiband;
pub mod pyramid;
pub mod seam;
pub mod warp;
pub mod weight;

use std::sync::Arc;

use anyhow::Result;
use image::{RgbImage, RgbaImage};
use nalgebra::Matrix3;

use crate::geometry::homography::translation;
use crate::geometry::GroundProjection;
use crate::mosaic::{MapLayout, Tile, TileIndex};

pub use device::{DeviceBackend, DeviceCompositor, HostDevice};
pub use flat::FlatCompositor;
pub use multiband::MultiBandCompositor;
pub use seam::SeamBlender;

/// One projected frame, as handed to a compositor.
pub struct FrameInput<'a> {
    pub image: &'a RgbImage,
    pub projection: &'a GroundProjection,
    pub layout: &'a MapLayout,
}

/// A tile to merge into, with its grid index.
pub type TileTarget<D> = (TileIndex, Arc<Tile<D>>);

/// The 8 neighbours of a tile, in [`crate::mosaic::NEIGHBOR_OFFSETS`] order.
pub type Neighbors<D> = [Option<Arc<Tile<D>>>; 8];

pub trait Compositor: Send + Sync + 'static {
    /// Per-tile payload stored in the arena.
    type TileData: Send + 'static;
    /// A frame after strategy-specific preparation.
    type Frame: Send;

    fn name(&self) -> &'static str;

    /// Empty payload for a freshly created tile.
    fn new_tile(&self, index: TileIndex) -> Self::TileData;

    fn prepare_frame(&self, input: &FrameInput<'_>) -> Result<Self::Frame>;

    /// True if the frame may contribute to tile `index`.
    fn touches(&self, frame: &Self::Frame, index: TileIndex) -> bool;

    /// Merge the frame into `targets`. Returns the number of tiles that
    /// changed; changed tiles are flagged for upload.
    fn merge(&self, frame: &Self::Frame, targets: &[TileTarget<Self::TileData>]) -> usize;

    /// RGBA texture of a tile (alpha 0 where nothing was merged), or `None`
    /// if the tile holds no data yet.
    fn render(
        &self,
        tile: &Tile<Self::TileData>,
        neighbors: Option<&Neighbors<Self::TileData>>,
    ) -> Option<RgbaImage>;

    /// Whether `render` uses neighbour tiles.
    fn wants_neighbors(&self) -> bool {
        false
    }
}

/// Tile pixel (sampled at its centre) → image pixel, for a tile whose top-left
/// map pixel is `origin`.
pub fn homography_for_tile(map_to_image: &Matrix3<f64>, origin: (i64, i64)) -> Matrix3<f64> {
    map_to_image * translation(origin.0 as f64 + 0.5, origin.1 as f64 + 0.5)
}
