//! Rendering boundary: per-tile textures and quads for an external renderer,
//! and the flattened raster written by `save`.

pub mod raster;

use std::time::{Duration, Instant};

use image::RgbaImage;
use nalgebra::Vector3;
use tracing::debug;

use crate::fusion::Compositor;
use crate::mosaic::TileIndex;
use crate::system::Session;

pub use raster::{SaveSummary, save_session};

/// External rendering subsystem.
pub trait TileRenderer {
    /// Replace the texture of a tile.
    fn upload_texture(&mut self, tile: TileIndex, texture: &RgbaImage);

    /// Draw a tile's textured quad; corners are world-frame NW, NE, SE, SW.
    fn draw_quad(&mut self, tile: TileIndex, corners: [Vector3<f64>; 4]);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub uploaded: usize,
    /// Changed tiles left for a later call because the budget ran out.
    pub deferred: usize,
    pub quads: usize,
}

/// Display-side texel policy.
#[derive(Debug, Clone, Copy)]
pub struct TexturePolicy {
    pub alpha_test: bool,
    pub background: [u8; 3],
}

impl TexturePolicy {
    /// Make uncovered texels opaque background when alpha testing is off.
    pub fn apply(&self, texture: &mut RgbaImage) {
        if self.alpha_test {
            return;
        }
        let [r, g, b] = self.background;
        for p in texture.pixels_mut() {
            if p.0[3] == 0 {
                p.0 = [r, g, b, 255];
            }
        }
    }
}

/// Upload changed tiles within `budget` (at least one per call) and issue a
/// quad for every tile that has a texture.
pub fn draw_session<C: Compositor>(
    compositor: &C,
    session: &Session<C::TileData>,
    policy: TexturePolicy,
    budget: Duration,
    renderer: &mut dyn TileRenderer,
) -> DrawStats {
    let start = Instant::now();
    let mut stats = DrawStats::default();
    for (index, id) in session.grid.occupied() {
        let Some(tile) = session.arena.get(id) else {
            continue;
        };
        if tile.is_changed() {
            if stats.uploaded == 0 || start.elapsed() < budget {
                tile.take_changed();
                let neighbors = compositor
                    .wants_neighbors()
                    .then(|| session.grid.neighbors(&session.arena, index));
                if let Some(mut texture) = compositor.render(&tile, neighbors.as_ref()) {
                    policy.apply(&mut texture);
                    renderer.upload_texture(index, &texture);
                    tile.set_textured();
                    stats.uploaded += 1;
                }
            } else {
                stats.deferred += 1;
            }
        }
        if tile.is_textured() {
            renderer.draw_quad(index, session.layout.tile_world_corners(index));
            stats.quads += 1;
        }
    }
    if stats.uploaded > 0 || stats.deferred > 0 {
        debug!(
            "Draw: {} uploads, {} deferred, {} quads in {:?}",
            stats.uploaded,
            stats.deferred,
            stats.quads,
            start.elapsed()
        );
    }
    stats
}
