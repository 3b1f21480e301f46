//! Flattened mosaic raster for `save`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use image::{Rgb, RgbImage, RgbaImage};
use nalgebra::Vector2;
use rayon::prelude::*;
use tracing::info;

use crate::fusion::Compositor;
use crate::fusion::warp::tile_offset_in;
use crate::mosaic::{BoundingBox, TILE_SIZE, TileIndex, TileRange};
use crate::system::Session;

/// What `save` wrote.
#[derive(Debug, Clone)]
pub struct SaveSummary {
    pub width: u32,
    pub height: u32,
    /// Tiles holding data.
    pub tiles: usize,
    /// World bounds of the (tile-aligned) raster.
    pub bounds: BoundingBox,
    /// World bounds of the pixels actually observed.
    pub covered: BoundingBox,
}

/// Render every tile holding data and assemble them over the tight tile
/// range, unobserved pixels set to `background`.
pub fn assemble_raster<C: Compositor>(
    compositor: &C,
    session: &Session<C::TileData>,
    background: [u8; 3],
) -> Result<(RgbImage, SaveSummary)> {
    let occupied: Vec<_> = session.grid.occupied().collect();
    let textures: Vec<(TileIndex, RgbaImage)> = occupied
        .par_iter()
        .filter_map(|(index, id)| {
            let tile = session.arena.get(*id)?;
            let neighbors = compositor
                .wants_neighbors()
                .then(|| session.grid.neighbors(&session.arena, *index));
            let texture = compositor.render(&tile, neighbors.as_ref())?;
            texture.pixels().any(|p| p.0[3] > 0).then_some((*index, texture))
        })
        .collect();

    let Some(range) = textures
        .iter()
        .map(|(index, _)| TileRange::single(*index))
        .reduce(|a, b| a.union(&b))
    else {
        bail!("no tile holds data");
    };

    let bounds = session.layout.range_bounds(&range);
    let width = range.cols() as u32 * TILE_SIZE;
    let height = range.rows() as u32 * TILE_SIZE;
    let mut raster = RgbImage::from_pixel(width, height, Rgb(background));

    let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for (index, texture) in &textures {
        let Some((ox, oy)) = tile_offset_in(&range, *index) else {
            continue;
        };
        for (x, y, p) in texture.enumerate_pixels() {
            if p.0[3] == 0 {
                continue;
            }
            let (rx, ry) = (ox + x, oy + y);
            raster.put_pixel(rx, ry, Rgb([p.0[0], p.0[1], p.0[2]]));
            x0 = x0.min(rx);
            y0 = y0.min(ry);
            x1 = x1.max(rx);
            y1 = y1.max(ry);
        }
    }

    let covered = BoundingBox::new(
        bounds.world_from_pixel(&Vector2::new(f64::from(x0), f64::from(y1 + 1))),
        bounds.world_from_pixel(&Vector2::new(f64::from(x1 + 1), f64::from(y0))),
        bounds.resolution,
    );
    let summary = SaveSummary {
        width,
        height,
        tiles: textures.len(),
        bounds,
        covered,
    };
    Ok((raster, summary))
}

/// Assemble the raster and write it to `path` (format from the extension).
/// Nothing is written when no tile holds data.
pub fn save_session<C: Compositor>(
    compositor: &C,
    session: &Session<C::TileData>,
    background: [u8; 3],
    path: &Path,
) -> Result<SaveSummary> {
    let (raster, summary) = assemble_raster(compositor, session, background)?;
    raster
        .save(path)
        .with_context(|| format!("Failed to write mosaic {:?}", path))?;
    info!(
        "Saved {}x{} mosaic from {} tiles to {:?}",
        summary.width, summary.height, summary.tiles, path
    );
    Ok(summary)
}
