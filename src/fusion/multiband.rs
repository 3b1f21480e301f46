//! Multi-band compositing: each tile stores a Laplacian pyramid with a
//! parallel weight pyramid, and every level is merged independently with the
//! max-weight-wins rule.
//!
//! Bands are not forced to come from the same source frame: a tile's coarse
//! residual may be owned by one frame while its fine detail is owned by
//! another.

use anyhow::Result;
use image::{Rgb32FImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::fusion::pyramid::{self, collapse, crop, gaussian_pyramid, laplacian_pyramid, paste};
use crate::fusion::warp::{has_weight_in, tile_offset_in, to_u8, warp_frame};
use crate::fusion::weight::{WeightImage, WeightMaskCache};
use crate::fusion::{Compositor, FrameInput, Neighbors, TileTarget};
use crate::mosaic::{NEIGHBOR_OFFSETS, TILE_SIZE, Tile, TileIndex, TileRange};

/// Border (in level pixels) borrowed from each neighbour for seamless display.
const NEIGHBOR_MARGIN: u32 = 4;

/// Side of a tile at pyramid level `level`.
pub fn level_size(level: usize) -> u32 {
    (TILE_SIZE >> level).max(1)
}

/// One pyramid level of a tile.
#[derive(Debug, Clone)]
pub struct BandLevel {
    pub coeffs: Rgb32FImage,
    pub weight: WeightImage,
}

/// Laplacian pyramid of one tile; level 0 is full resolution.
#[derive(Debug, Clone)]
pub struct PyramidTile {
    pub levels: Vec<BandLevel>,
}

impl PyramidTile {
    pub fn new(band_count: usize) -> Self {
        let levels = (0..band_count.clamp(1, pyramid::MAX_LEVELS))
            .map(|l| {
                let s = level_size(l);
                BandLevel {
                    coeffs: Rgb32FImage::new(s, s),
                    weight: WeightImage::new(s, s),
                }
            })
            .collect();
        Self { levels }
    }

    pub fn band_count(&self) -> usize {
        self.levels.len()
    }

    /// Merge one level from a canvas pyramid level, tile window at `(ox, oy)`
    /// in that level's pixels. Returns the number of adopted coefficients.
    pub fn merge_level(
        &mut self,
        level: usize,
        coeffs: &Rgb32FImage,
        weight: &WeightImage,
        ox: u32,
        oy: u32,
    ) -> usize {
        let Some(dst) = self.levels.get_mut(level) else {
            return 0;
        };
        let s = dst.coeffs.width();
        let mut adopted = 0;
        for y in 0..s {
            for x in 0..s {
                let w_in = weight.get_pixel(ox + x, oy + y).0[0];
                let stored = dst.weight.get_pixel_mut(x, y);
                if w_in > 0.0 && w_in >= stored.0[0] {
                    stored.0[0] = w_in;
                    dst.coeffs.put_pixel(x, y, *coeffs.get_pixel(ox + x, oy + y));
                    adopted += 1;
                }
            }
        }
        adopted
    }

    /// Covered = some frame wrote a full-resolution coefficient here.
    pub fn has_coverage(&self) -> bool {
        self.levels[0].weight.as_raw().iter().any(|w| *w > 0.0)
    }

    /// Collapse with clamped tile borders.
    pub fn reconstruct(&self) -> Rgb32FImage {
        let bands: Vec<Rgb32FImage> = self.levels.iter().map(|l| l.coeffs.clone()).collect();
        collapse(&bands).unwrap_or_else(|| Rgb32FImage::new(TILE_SIZE, TILE_SIZE))
    }

    /// RGBA texture of a reconstruction, transparent where level 0 is uncovered.
    pub fn texture(&self, image: &Rgb32FImage) -> RgbaImage {
        let weight = &self.levels[0].weight;
        RgbaImage::from_fn(TILE_SIZE, TILE_SIZE, |x, y| {
            if weight.get_pixel(x, y).0[0] > 0.0 {
                let p = image.get_pixel(x, y).0;
                Rgba([to_u8(p[0]), to_u8(p[1]), to_u8(p[2]), 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }
}

/// A frame decomposed over its whole tile-aligned canvas.
pub struct BandFrame {
    pub range: TileRange,
    pub bands: Vec<Rgb32FImage>,
    pub weights: Vec<WeightImage>,
}

pub struct MultiBandCompositor {
    band_count: usize,
    high_quality: bool,
    masks: WeightMaskCache,
}

impl MultiBandCompositor {
    pub fn new(band_count: usize, weight_exponent: f64, high_quality: bool) -> Self {
        Self {
            band_count: band_count.clamp(1, pyramid::MAX_LEVELS),
            high_quality,
            masks: WeightMaskCache::new(weight_exponent),
        }
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    /// Merge every level of `frame` into `tile`'s pyramid.
    pub fn merge_tile(&self, frame: &BandFrame, index: TileIndex, tile: &mut PyramidTile) -> usize {
        let Some((ox, oy)) = tile_offset_in(&frame.range, index) else {
            return 0;
        };
        (0..tile.band_count().min(frame.bands.len()))
            .map(|l| tile.merge_level(l, &frame.bands[l], &frame.weights[l], ox >> l, oy >> l))
            .sum()
    }

    /// Reconstruct `tile` with a border of coefficients borrowed from its 8
    /// neighbours. `None` when a neighbour is missing or empty.
    fn reconstruct_with_neighbors(
        &self,
        tile: &Tile<PyramidTile>,
        neighbors: &Neighbors<PyramidTile>,
    ) -> Option<(Rgb32FImage, RgbaImage)> {
        let levels = self.band_count;

        // Copy each neighbour's strips under its own lock, one tile at a time.
        let mut strips = Vec::with_capacity(8);
        for (k, neighbor) in neighbors.iter().enumerate() {
            let neighbor = neighbor.as_ref().filter(|n| n.is_covered())?;
            let data = neighbor.lock();
            if data.band_count() != levels {
                return None;
            }
            let (dx, dy) = NEIGHBOR_OFFSETS[k];
            let per_level: Vec<(Rgb32FImage, i64, i64)> = (0..levels)
                .map(|l| {
                    let s = level_size(l);
                    let m = NEIGHBOR_MARGIN.min(s);
                    let (sx, w, px) = strip_axis(dx, s, m);
                    // Grid +y is north, canvas rows grow southwards.
                    let (sy, h, py) = strip_axis(-dy, s, m);
                    (crop(&data.levels[l].coeffs, sx, sy, w, h), px, py)
                })
                .collect();
            strips.push(per_level);
        }

        let center = tile.lock().clone();

        let canvas: Vec<Rgb32FImage> = (0..levels)
            .map(|l| {
                let s = level_size(l);
                let mut c = Rgb32FImage::new(3 * s, 3 * s);
                paste(&mut c, &center.levels[l].coeffs, i64::from(s), i64::from(s));
                for per_level in &strips {
                    let (strip, x, y) = &per_level[l];
                    paste(&mut c, strip, *x, *y);
                }
                c
            })
            .collect();

        let full = collapse(&canvas)?;
        let image = crop(&full, i64::from(TILE_SIZE), i64::from(TILE_SIZE), TILE_SIZE, TILE_SIZE);
        let texture = center.texture(&image);
        Some((image, texture))
    }
}

/// Source start, extent and canvas position of a neighbour strip along one
/// axis, for a neighbour at offset `d` (−1 before, 0 same, +1 after).
fn strip_axis(d: i64, s: u32, m: u32) -> (i64, u32, i64) {
    let s64 = i64::from(s);
    let m64 = i64::from(m);
    match d {
        -1 => (s64 - m64, m, s64 - m64),
        1 => (0, m, 2 * s64),
        _ => (0, s, s64),
    }
}

impl Compositor for MultiBandCompositor {
    type TileData = PyramidTile;
    type Frame = BandFrame;

    fn name(&self) -> &'static str {
        "multi_band"
    }

    fn new_tile(&self, _index: TileIndex) -> PyramidTile {
        PyramidTile::new(self.band_count)
    }

    fn prepare_frame(&self, input: &FrameInput<'_>) -> Result<BandFrame> {
        let (w, h) = input.image.dimensions();
        let mask = self.masks.get(&input.layout.camera, w, h);
        let warped = warp_frame(input.image, &mask, input.projection, input.layout);
        let (bands, weights) = rayon::join(
            || laplacian_pyramid(&warped.image, self.band_count),
            || gaussian_pyramid(&warped.weight, self.band_count),
        );
        Ok(BandFrame {
            range: warped.range,
            bands,
            weights,
        })
    }

    fn touches(&self, frame: &BandFrame, index: TileIndex) -> bool {
        tile_offset_in(&frame.range, index)
            .is_some_and(|(ox, oy)| has_weight_in(&frame.weights[0], ox, oy, TILE_SIZE))
    }

    fn merge(&self, frame: &BandFrame, targets: &[TileTarget<PyramidTile>]) -> usize {
        targets
            .par_iter()
            .filter(|(index, tile)| {
                let adopted = self.merge_tile(frame, *index, &mut tile.lock());
                if adopted > 0 {
                    tile.mark_changed();
                }
                adopted > 0
            })
            .count()
    }

    fn wants_neighbors(&self) -> bool {
        self.high_quality
    }

    fn render(
        &self,
        tile: &Tile<PyramidTile>,
        neighbors: Option<&Neighbors<PyramidTile>>,
    ) -> Option<RgbaImage> {
        if let Some(neighbors) = neighbors.filter(|_| self.high_quality) {
            if !tile.is_covered() {
                return None;
            }
            if let Some((_, texture)) = self.reconstruct_with_neighbors(tile, neighbors) {
                return Some(texture);
            }
        }
        let data = tile.lock();
        if !data.has_coverage() {
            return None;
        }
        let image = data.reconstruct();
        Some(data.texture(&image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::flat::FlatTile;
    use image::{Luma, Rgb};

    fn gradient_canvas(seed: u32, weight: f32, cols: u32, rows: u32) -> (Rgb32FImage, WeightImage) {
        let w = cols * TILE_SIZE;
        let h = rows * TILE_SIZE;
        (
            Rgb32FImage::from_fn(w, h, |x, y| {
                Rgb([
                    ((x * 3 + seed) % 255) as f32,
                    ((y * 5 + seed) % 255) as f32,
                    ((x + y + seed) % 255) as f32,
                ])
            }),
            WeightImage::from_fn(w, h, |x, _| Luma([if x < 40 { 0.0 } else { weight }])),
        )
    }

    fn band_frame(image: &Rgb32FImage, weight: &WeightImage, levels: usize, range: TileRange) -> BandFrame {
        BandFrame {
            range,
            bands: laplacian_pyramid(image, levels),
            weights: gaussian_pyramid(weight, levels),
        }
    }

    #[test]
    fn test_single_band_matches_flat() {
        let range = TileRange::single(TileIndex::new(0, 0));
        let (a, wa) = gradient_canvas(0, 0.6, 1, 1);
        let (b, wb) = gradient_canvas(90, 0.7, 1, 1);
        let wb = WeightImage::from_fn(256, 256, |x, y| {
            Luma([if (x + y) % 3 == 0 { 0.5 } else { wb.get_pixel(x, y).0[0] }])
        });

        let compositor = MultiBandCompositor::new(1, 1.0, false);
        let mut pyramid = PyramidTile::new(1);
        let mut flat = FlatTile::new();
        for (img, w) in [(&a, &wa), (&b, &wb)] {
            compositor.merge_tile(&band_frame(img, w, 1, range), TileIndex::new(0, 0), &mut pyramid);
            flat.merge_from(img, w, 0, 0);
        }

        let tex = pyramid.texture(&pyramid.reconstruct());
        assert_eq!(tex, flat.to_rgba());
    }

    #[test]
    fn test_lower_weight_frame_changes_nothing() {
        let range = TileRange::single(TileIndex::new(0, 0));
        let (a, wa) = gradient_canvas(7, 0.9, 1, 1);
        let (b, wb) = gradient_canvas(120, 0.4, 1, 1);
        let compositor = MultiBandCompositor::new(6, 1.0, false);

        let mut only_a = PyramidTile::new(6);
        compositor.merge_tile(&band_frame(&a, &wa, 6, range), TileIndex::new(0, 0), &mut only_a);

        let mut both = only_a.clone();
        let adopted =
            compositor.merge_tile(&band_frame(&b, &wb, 6, range), TileIndex::new(0, 0), &mut both);

        // B only wins where A's weight pyramid is zero (outside A's coverage),
        // and both share the same coverage here.
        assert_eq!(adopted, 0);
        for (x, y) in only_a.levels.iter().zip(&both.levels) {
            assert_eq!(x.coeffs, y.coeffs);
        }
    }

    #[test]
    fn test_reconstruct_recovers_single_frame() {
        let range = TileRange::single(TileIndex::new(0, 0));
        let (a, _) = gradient_canvas(3, 1.0, 1, 1);
        let full = WeightImage::from_pixel(256, 256, Luma([1.0]));
        let compositor = MultiBandCompositor::new(5, 1.0, false);
        let mut tile = PyramidTile::new(5);
        compositor.merge_tile(&band_frame(&a, &full, 5, range), TileIndex::new(0, 0), &mut tile);

        let back = tile.reconstruct();
        for (p, q) in back.as_raw().iter().zip(a.as_raw()) {
            assert!((p - q).abs() < 1e-2);
        }
    }

    #[test]
    fn test_neighbor_aware_reconstruction_matches_canvas() {
        use crate::mosaic::{TileArena, TileGrid};

        // One 3×3 canvas decomposed as a whole, split into tiles.
        let range = TileRange::spanning(TileIndex::new(-1, -1), TileIndex::new(1, 1));
        let (img, _) = gradient_canvas(11, 1.0, 3, 3);
        let full = WeightImage::from_pixel(768, 768, Luma([1.0]));
        let frame = band_frame(&img, &full, 4, range);

        let compositor = MultiBandCompositor::new(4, 1.0, true);
        let arena = TileArena::new();
        let grid = TileGrid::new(range);
        for index in range.iter() {
            let (_, tile) = grid.tile_at(&arena, index, || PyramidTile::new(4)).unwrap();
            compositor.merge_tile(&frame, index, &mut tile.lock());
            tile.mark_changed();
        }

        let center = grid.tile(&arena, TileIndex::new(0, 0)).unwrap();
        let neighbors = grid.neighbors(&arena, TileIndex::new(0, 0));
        let (image, texture) = compositor
            .reconstruct_with_neighbors(&center, &neighbors)
            .unwrap();
        assert!(texture.pixels().all(|p| p.0[3] == 255));

        // Interior of the collapsed canvas equals the source exactly; the
        // neighbour-aware tile matches it along its borders too.
        let expected = crop(&img, 256, 256, 256, 256);
        for (p, q) in image.as_raw().iter().zip(expected.as_raw()) {
            assert!((p - q).abs() < 1e-2, "{p} vs {q}");
        }

        // Missing neighbour: falls back to self-only reconstruction.
        let mut partial = neighbors.clone();
        partial[3] = None;
        assert!(compositor.reconstruct_with_neighbors(&center, &partial).is_none());
        assert!(compositor.render(&center, Some(&partial)).is_some());
    }
}
