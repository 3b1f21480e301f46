//! Flat single-band compositing: one RGB buffer and one weight buffer per
//! tile, merged max-weight-wins.

use anyhow::Result;
use image::{Rgb, Rgb32FImage, RgbImage, Rgba, RgbaImage};
use rayon::prelude::*;

use crate::fusion::warp::{WarpedFrame, to_u8, warp_frame};
use crate::fusion::weight::{WeightImage, WeightMaskCache};
use crate::fusion::{Compositor, FrameInput, Neighbors, TileTarget};
use crate::mosaic::{TILE_SIZE, Tile, TileIndex};

/// Pixel + weight buffers of one flat tile.
#[derive(Debug, Clone)]
pub struct FlatTile {
    pub pixels: RgbImage,
    pub weight: WeightImage,
}

impl FlatTile {
    pub fn new() -> Self {
        Self {
            pixels: RgbImage::new(TILE_SIZE, TILE_SIZE),
            weight: WeightImage::new(TILE_SIZE, TILE_SIZE),
        }
    }

    /// Merge the 256×256 window of a warped canvas at `(ox, oy)`.
    ///
    /// A pixel is adopted when its incoming weight is positive and at least
    /// the stored weight. Returns the number of adopted pixels.
    pub fn merge_from(&mut self, image: &Rgb32FImage, weight: &WeightImage, ox: u32, oy: u32) -> usize {
        let mut adopted = 0;
        for y in 0..TILE_SIZE {
            for x in 0..TILE_SIZE {
                let w_in = weight.get_pixel(ox + x, oy + y).0[0];
                let stored = self.weight.get_pixel_mut(x, y);
                if w_in > 0.0 && w_in >= stored.0[0] {
                    stored.0[0] = w_in;
                    let src = image.get_pixel(ox + x, oy + y).0;
                    self.pixels
                        .put_pixel(x, y, Rgb([to_u8(src[0]), to_u8(src[1]), to_u8(src[2])]));
                    adopted += 1;
                }
            }
        }
        adopted
    }

    /// Overwrite one pixel unconditionally.
    pub fn write(&mut self, x: u32, y: u32, rgb: [u8; 3], weight: f32) {
        self.pixels.put_pixel(x, y, Rgb(rgb));
        self.weight.put_pixel(x, y, image::Luma([weight]));
    }

    /// Texture with alpha 255 on covered pixels and transparent black elsewhere.
    pub fn to_rgba(&self) -> RgbaImage {
        RgbaImage::from_fn(TILE_SIZE, TILE_SIZE, |x, y| {
            if self.weight.get_pixel(x, y).0[0] > 0.0 {
                let [r, g, b] = self.pixels.get_pixel(x, y).0;
                Rgba([r, g, b, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        })
    }

    pub fn has_coverage(&self) -> bool {
        self.weight.as_raw().iter().any(|w| *w > 0.0)
    }
}

impl Default for FlatTile {
    fn default() -> Self {
        Self::new()
    }
}

/// Max-weight-wins compositor over [`FlatTile`]s.
pub struct FlatCompositor {
    masks: WeightMaskCache,
}

impl FlatCompositor {
    pub fn new(weight_exponent: f64) -> Self {
        Self {
            masks: WeightMaskCache::new(weight_exponent),
        }
    }
}

impl Compositor for FlatCompositor {
    type TileData = FlatTile;
    type Frame = WarpedFrame;

    fn name(&self) -> &'static str {
        "flat"
    }

    fn new_tile(&self, _index: TileIndex) -> FlatTile {
        FlatTile::new()
    }

    fn prepare_frame(&self, input: &FrameInput<'_>) -> Result<WarpedFrame> {
        let (w, h) = input.image.dimensions();
        let mask = self.masks.get(&input.layout.camera, w, h);
        Ok(warp_frame(input.image, &mask, input.projection, input.layout))
    }

    fn touches(&self, frame: &WarpedFrame, index: TileIndex) -> bool {
        frame.tile_has_coverage(index)
    }

    fn merge(&self, frame: &WarpedFrame, targets: &[TileTarget<FlatTile>]) -> usize {
        targets
            .par_iter()
            .filter(|(index, tile)| {
                let Some((ox, oy)) = frame.tile_offset(*index) else {
                    return false;
                };
                let adopted = tile.lock().merge_from(&frame.image, &frame.weight, ox, oy);
                if adopted > 0 {
                    tile.mark_changed();
                }
                adopted > 0
            })
            .count()
    }

    fn render(&self, tile: &Tile<FlatTile>, _neighbors: Option<&Neighbors<FlatTile>>) -> Option<RgbaImage> {
        let data = tile.lock();
        data.has_coverage().then(|| data.to_rgba())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn canvas(value: f32, weight: f32) -> (Rgb32FImage, WeightImage) {
        (
            Rgb32FImage::from_pixel(TILE_SIZE, TILE_SIZE, Rgb([value; 3])),
            WeightImage::from_pixel(TILE_SIZE, TILE_SIZE, Luma([weight])),
        )
    }

    #[test]
    fn test_max_weight_wins() {
        let mut tile = FlatTile::new();
        let (a, wa) = canvas(100.0, 0.8);
        let (b, wb) = canvas(200.0, 0.5);

        assert_eq!(tile.merge_from(&a, &wa, 0, 0), 65536);
        // Lower weight everywhere: nothing changes.
        assert_eq!(tile.merge_from(&b, &wb, 0, 0), 0);
        assert_eq!(tile.pixels.get_pixel(10, 10).0, [100; 3]);

        // Equal weight adopts the newcomer.
        let (c, wc) = canvas(50.0, 0.8);
        assert_eq!(tile.merge_from(&c, &wc, 0, 0), 65536);
        assert_eq!(tile.pixels.get_pixel(10, 10).0, [50; 3]);
    }

    #[test]
    fn test_zero_weight_never_writes() {
        let mut tile = FlatTile::new();
        let (a, wa) = canvas(100.0, 0.0);
        assert_eq!(tile.merge_from(&a, &wa, 0, 0), 0);
        assert!(!tile.has_coverage());
        assert!(tile.to_rgba().pixels().all(|p| p.0[3] == 0));
    }
}
