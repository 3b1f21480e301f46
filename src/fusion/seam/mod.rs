//! Seam-aware batch blending.
//!
//! A whole batch of frames is warped onto one canvas, composited in arrival
//! order with a minimum-cost seam cut through every overlap, the ownership
//! masks are cleaned up morphologically, and a single normalised multi-band
//! blend produces the final mosaic.

pub mod finder;
pub mod mask;

use image::{Luma, Rgb32FImage, RgbImage};
use rayon::prelude::*;
use tracing::debug;

use crate::fusion::pyramid::{self, collapse, gaussian_pyramid, laplacian_pyramid, paste, push_pull_fill};
use crate::fusion::warp::{WarpedFrame, tile_offset_in, warp_frame};
use crate::fusion::weight::{WeightImage, WeightMaskCache};
use crate::geometry::GroundProjection;
use crate::mosaic::{MapLayout, TILE_SIZE, TileIndex, TileRange};

use finder::{PlacedFrame, SeamComposer};
use mask::smooth_labels;

/// A queued frame already projected onto the ground plane.
pub struct BatchFrame {
    pub image: RgbImage,
    pub projection: GroundProjection,
}

/// Blended batch result on a tile-aligned canvas.
pub struct SeamMosaic {
    pub range: TileRange,
    pub image: Rgb32FImage,
    /// 1 where some frame owns the pixel, 0 elsewhere.
    pub coverage: WeightImage,
}

pub struct SeamBlender {
    band_count: usize,
    smoothing_radius: u8,
    masks: WeightMaskCache,
}

impl SeamBlender {
    pub fn new(band_count: usize, weight_exponent: f64, smoothing_radius: u8) -> Self {
        Self {
            band_count: band_count.clamp(1, pyramid::MAX_LEVELS),
            smoothing_radius,
            masks: WeightMaskCache::new(weight_exponent),
        }
    }

    /// Blend a batch. `None` for an empty batch.
    pub fn blend(&self, frames: &[BatchFrame], layout: &MapLayout) -> Option<SeamMosaic> {
        let warped: Vec<WarpedFrame> = frames
            .par_iter()
            .map(|f| {
                let (w, h) = f.image.dimensions();
                let mask = self.masks.get(&layout.camera, w, h);
                warp_frame(&f.image, &mask, &f.projection, layout)
            })
            .collect();
        let range = warped.iter().map(|w| w.range).reduce(|a, b| a.union(&b))?;
        let width = range.cols() as u32 * TILE_SIZE;
        let height = range.rows() as u32 * TILE_SIZE;

        let placed: Vec<PlacedFrame<'_>> = warped
            .iter()
            .map(|w| PlacedFrame {
                frame: w,
                offset: tile_offset_in(&range, TileIndex::new(w.range.min_ix, w.range.max_iy))
                    .unwrap_or((0, 0)),
            })
            .collect();

        let mut composer = SeamComposer::new(width, height);
        for (i, p) in placed.iter().enumerate() {
            composer.add(i as i32, p);
        }
        let labels = smooth_labels(&composer.into_labels(), width, height, &placed, self.smoothing_radius);
        debug!(
            "Seams cut for {} frames on a {}x{} canvas",
            placed.len(),
            width,
            height
        );

        let image = self.blend_bands(&placed, &labels, width, height);
        let coverage = WeightImage::from_fn(width, height, |x, y| {
            let l = labels[y as usize * width as usize + x as usize];
            Luma([if l >= 0 { 1.0 } else { 0.0 }])
        });
        Some(SeamMosaic {
            range,
            image,
            coverage,
        })
    }

    /// Normalised per-band weighted sum of every frame's Laplacian pyramid,
    /// weighted by the Gaussian pyramid of its ownership mask.
    fn blend_bands(&self, placed: &[PlacedFrame<'_>], labels: &[i32], width: u32, height: u32) -> Rgb32FImage {
        let levels = self.band_count;
        let mut acc: Vec<Rgb32FImage> = Vec::new();
        let mut acc_w: Vec<WeightImage> = Vec::new();

        for (i, p) in placed.iter().enumerate() {
            let owned = WeightImage::from_fn(width, height, |x, y| {
                Luma([if labels[y as usize * width as usize + x as usize] == i as i32 { 1.0 } else { 0.0 }])
            });
            if !owned.as_raw().iter().any(|w| *w > 0.0) {
                continue;
            }

            let mut canvas = Rgb32FImage::new(width, height);
            let mut valid = WeightImage::new(width, height);
            let (ox, oy) = p.offset;
            paste(&mut canvas, &p.frame.image, i64::from(ox), i64::from(oy));
            paste(&mut valid, &p.frame.weight, i64::from(ox), i64::from(oy));
            let filled = push_pull_fill(&canvas, &valid);

            let (bands, weights) = rayon::join(
                || laplacian_pyramid(&filled, levels),
                || gaussian_pyramid(&owned, levels),
            );
            if acc.is_empty() {
                acc = bands.iter().map(|b| Rgb32FImage::new(b.width(), b.height())).collect();
                acc_w = weights.iter().map(|w| WeightImage::new(w.width(), w.height())).collect();
            }
            for l in 0..levels.min(bands.len()) {
                let a: &mut [f32] = &mut acc[l];
                let aw: &mut [f32] = &mut acc_w[l];
                a.par_chunks_mut(3)
                    .zip(aw.par_iter_mut())
                    .zip(bands[l].as_raw().par_chunks(3))
                    .zip(weights[l].as_raw().par_iter())
                    .for_each(|(((a, aw), b), w)| {
                        for c in 0..3 {
                            a[c] += b[c] * w;
                        }
                        *aw += w;
                    });
            }
        }

        for (a, aw) in acc.iter_mut().zip(&acc_w) {
            let a: &mut [f32] = a;
            a.par_chunks_mut(3).zip(aw.as_raw().par_iter()).for_each(|(a, w)| {
                if *w > 1e-6 {
                    a.iter_mut().for_each(|v| *v /= w);
                } else {
                    a.iter_mut().for_each(|v| *v = 0.0);
                }
            });
        }
        collapse(&acc).unwrap_or_else(|| Rgb32FImage::new(width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CameraParameters, SE3, nadir_pose, project_frame};
    use image::Rgb;
    use nalgebra::Vector3;

    #[test]
    fn test_two_frame_batch() {
        let camera = CameraParameters::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let layout = MapLayout::new(SE3::identity(), camera, 0.1);
        let frame = |x: f64, colour: u8| BatchFrame {
            image: RgbImage::from_pixel(640, 480, Rgb([colour, colour, colour])),
            projection: project_frame(&camera, &nadir_pose(Vector3::new(x, 0.0, 50.0))).unwrap(),
        };
        let frames = [frame(0.0, 40), frame(30.0, 200)];

        let blender = SeamBlender::new(6, 1.0, 2);
        let mosaic = blender.blend(&frames, &layout).unwrap();
        assert_eq!(mosaic.range, TileRange::spanning(TileIndex::new(-2, -1), TileIndex::new(2, 0)));

        // Map pixel (u, v) sits at canvas (u + 512, v + 256).
        let at = |wx: f64, wy: f64| {
            let x = ((wx / 0.1).floor() as i64 + 512) as u32;
            let y = ((-wy / 0.1).floor() as i64 + 256) as u32;
            (mosaic.coverage.get_pixel(x, y).0[0], mosaic.image.get_pixel(x, y).0)
        };

        let (cov, left) = at(-30.0, 0.0);
        assert_eq!(cov, 1.0);
        assert!(left.iter().all(|v| (v - 40.0).abs() < 2.0), "{left:?}");
        let (cov, right) = at(60.0, 0.0);
        assert_eq!(cov, 1.0);
        assert!(right.iter().all(|v| (v - 200.0).abs() < 2.0), "{right:?}");

        // Outside both footprints.
        assert_eq!(at(10.0, 25.0).0, 0.0);
        assert_eq!(at(-40.0, 0.0).0, 0.0);
    }
}
