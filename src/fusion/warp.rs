//! Warp a posed frame onto a tile-aligned map canvas.
//!
//! The canvas spans the whole tile range touched by the frame's footprint, so
//! every destination tile is a fixed 256×256 window into it and pyramid levels
//! of the canvas stay tile-aligned down to 1 px.

use image::{Rgb, Rgb32FImage, RgbImage};
use nalgebra::{Matrix3, Vector2, Vector3};
use rayon::prelude::*;

use crate::geometry::homography::translation;
use crate::geometry::GroundProjection;
use crate::mosaic::{MapLayout, TILE_SIZE, TileIndex, TileRange};

use super::weight::WeightImage;

/// A frame resampled into map pixels over a range of tiles.
pub struct WarpedFrame {
    pub range: TileRange,
    pub image: Rgb32FImage,
    pub weight: WeightImage,
}

impl WarpedFrame {
    /// Canvas pixel of a tile's top-left corner.
    pub fn tile_offset(&self, index: TileIndex) -> Option<(u32, u32)> {
        tile_offset_in(&self.range, index)
    }

    /// True if any pixel of tile `index` received a positive weight.
    pub fn tile_has_coverage(&self, index: TileIndex) -> bool {
        self.tile_offset(index)
            .is_some_and(|(ox, oy)| has_weight_in(&self.weight, ox, oy, TILE_SIZE))
    }
}

/// True if any weight in the `size × size` window at `(ox, oy)` is positive.
pub fn has_weight_in(weight: &WeightImage, ox: u32, oy: u32, size: u32) -> bool {
    let stride = weight.width() as usize;
    let raw = weight.as_raw();
    (oy..oy + size).any(|y| {
        let row = y as usize * stride + ox as usize;
        raw[row..row + size as usize].iter().any(|w| *w > 0.0)
    })
}

/// Top-left pixel of tile `index` on a canvas covering `range` (row 0 = north).
pub fn tile_offset_in(range: &TileRange, index: TileIndex) -> Option<(u32, u32)> {
    if !range.contains(index) {
        return None;
    }
    let x = (index.ix - range.min_ix) as u32 * TILE_SIZE;
    let y = (range.max_iy - index.iy) as u32 * TILE_SIZE;
    Some((x, y))
}

/// Tiles touched by a frame's footprint.
pub fn footprint_range(projection: &GroundProjection, layout: &MapLayout) -> TileRange {
    let (min, max) = projection.bounds();
    layout.tile_range(&min, &max)
}

/// Homography from canvas pixel indices (sampled at pixel centres) to image
/// pixels, for a canvas whose top-left is tile `(range.min_ix, range.max_iy)`.
pub fn canvas_to_image(
    projection: &GroundProjection,
    layout: &MapLayout,
    range: &TileRange,
) -> Matrix3<f64> {
    let (u0, v0) = layout.tile_origin_px(TileIndex::new(range.min_ix, range.max_iy));
    projection.map_pixel_to_image(layout.resolution) * translation(u0 as f64 + 0.5, v0 as f64 + 0.5)
}

/// Warp `image` (with its weight `mask`) onto the canvas of its footprint.
pub fn warp_frame(
    image: &RgbImage,
    mask: &WeightImage,
    projection: &GroundProjection,
    layout: &MapLayout,
) -> WarpedFrame {
    let range = footprint_range(projection, layout);
    let h = canvas_to_image(projection, layout, &range);
    let width = range.cols() as u32 * TILE_SIZE;
    let height = range.rows() as u32 * TILE_SIZE;
    let (image, weight) = warp_region(image, mask, &h, width, height);
    WarpedFrame { range, image, weight }
}

/// Inverse-map every destination pixel through `dst_to_src` and sample
/// `image` / `mask` bilinearly. Pixels mapping outside the source get weight 0.
pub fn warp_region(
    image: &RgbImage,
    mask: &WeightImage,
    dst_to_src: &Matrix3<f64>,
    width: u32,
    height: u32,
) -> (Rgb32FImage, WeightImage) {
    let mut out = Rgb32FImage::new(width, height);
    let mut weight = WeightImage::new(width, height);
    let w = width as usize;

    {
        let pixels: &mut [f32] = &mut out;
        let weights: &mut [f32] = &mut weight;
        pixels
            .par_chunks_mut(w * 3)
            .zip(weights.par_chunks_mut(w))
            .enumerate()
            .for_each(|(y, (row, wrow))| {
                for x in 0..w {
                    let p = dst_to_src * Vector3::new(x as f64, y as f64, 1.0);
                    if p.z.abs() < 1e-12 {
                        continue;
                    }
                    let src = Vector2::new(p.x / p.z, p.y / p.z);
                    if let Some((rgb, wt)) = sample(image, mask, &src) {
                        row[x * 3..x * 3 + 3].copy_from_slice(&rgb);
                        wrow[x] = wt;
                    }
                }
            });
    }

    (out, weight)
}

/// Bilinear sample at continuous pixel coordinates (pixel centres at integers).
fn sample(image: &RgbImage, mask: &WeightImage, p: &Vector2<f64>) -> Option<([f32; 3], f32)> {
    let (w, h) = image.dimensions();
    let max_x = f64::from(w) - 1.0;
    let max_y = f64::from(h) - 1.0;
    if !(p.x >= 0.0 && p.y >= 0.0 && p.x <= max_x && p.y <= max_y) {
        return None;
    }
    let x0 = p.x.floor() as u32;
    let y0 = p.y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = (p.x - f64::from(x0)) as f32;
    let fy = (p.y - f64::from(y0)) as f32;

    let taps = [
        (x0, y0, (1.0 - fx) * (1.0 - fy)),
        (x1, y0, fx * (1.0 - fy)),
        (x0, y1, (1.0 - fx) * fy),
        (x1, y1, fx * fy),
    ];
    let mut rgb = [0.0f32; 3];
    let mut wt = 0.0f32;
    for (x, y, k) in taps {
        let Rgb(px) = *image.get_pixel(x, y);
        for c in 0..3 {
            rgb[c] += k * f32::from(px[c]);
        }
        wt += k * mask.get_pixel(x, y).0[0];
    }
    Some((rgb, wt))
}

/// Whether the footprint quad overlaps the tile's ground rectangle
/// (separating-axis test on two convex polygons).
pub fn footprint_touches(projection: &GroundProjection, layout: &MapLayout, index: TileIndex) -> bool {
    let b = layout.tile_bounds(index);
    let rect = [
        Vector2::new(b.min.x, b.min.y),
        Vector2::new(b.max.x, b.min.y),
        Vector2::new(b.max.x, b.max.y),
        Vector2::new(b.min.x, b.max.y),
    ];
    let quad = &projection.corners;

    let mut axes = vec![Vector2::new(1.0, 0.0), Vector2::new(0.0, 1.0)];
    for i in 0..4 {
        let e = quad[(i + 1) % 4] - quad[i];
        if e.norm_squared() > 0.0 {
            axes.push(Vector2::new(-e.y, e.x));
        }
    }

    axes.iter().all(|axis| {
        let (a_min, a_max) = extent(quad, axis);
        let (b_min, b_max) = extent(&rect, axis);
        a_max > b_min && b_max > a_min
    })
}

fn extent(points: &[Vector2<f64>], axis: &Vector2<f64>) -> (f64, f64) {
    points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        let d = p.dot(axis);
        (lo.min(d), hi.max(d))
    })
}

/// Round and clamp a float colour to 8 bits.
#[inline]
pub fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::weight::radial_weight_mask;
    use crate::geometry::{CameraParameters, SE3, nadir_pose, project_frame};
    use approx::assert_relative_eq;

    fn setup() -> (CameraParameters, MapLayout) {
        let camera = CameraParameters::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let layout = MapLayout::new(SE3::identity(), camera, 0.1);
        (camera, layout)
    }

    fn checker(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = if ((x / 32) + (y / 32)) % 2 == 0 { 200 } else { 40 };
            Rgb([v, (x % 256) as u8, (y % 256) as u8])
        })
    }

    #[test]
    fn test_nadir_warp_is_identity_scale() {
        let (camera, layout) = setup();
        let pose = nadir_pose(Vector3::new(0.0, 0.0, 50.0));
        let projection = project_frame(&camera, &pose).unwrap();
        let image = checker(640, 480);
        let mask = radial_weight_mask(640, 480, 320.0, 240.0, 1.0);
        let warped = warp_frame(&image, &mask, &projection, &layout);

        // 50 m / 500 px = 0.1 m/px: the map samples the image 1:1.
        assert_eq!(warped.range, TileRange::spanning(TileIndex::new(-2, -1), TileIndex::new(1, 0)));

        // World (0, 0) is the image centre (320, 240); it sits at map pixel (0, 0),
        // i.e. canvas (512, 256). Canvas pixel centres are offset by half a pixel.
        let px = warped.image.get_pixel(512, 256);
        let src = image.get_pixel(320, 240);
        // Sample at (320.5, 240.5) straddles four source pixels.
        assert!((px.0[1] - (f32::from(src.0[1]) + 0.5)).abs() < 1e-3);
        assert_relative_eq!(warped.weight.get_pixel(512, 256).0[0], 0.998, epsilon = 1e-2);

        // Well outside the footprint: no weight.
        assert_eq!(warped.weight.get_pixel(0, 0).0[0], 0.0);
    }

    #[test]
    fn test_tile_coverage_and_touch_agree() {
        let (camera, layout) = setup();
        let pose = nadir_pose(Vector3::new(3.0, -7.0, 50.0));
        let projection = project_frame(&camera, &pose).unwrap();
        let image = checker(640, 480);
        let mask = radial_weight_mask(640, 480, 320.0, 240.0, 1.0);
        let warped = warp_frame(&image, &mask, &projection, &layout);

        for index in warped.range.iter() {
            assert_eq!(
                warped.tile_has_coverage(index),
                footprint_touches(&projection, &layout, index),
                "tile {index}"
            );
        }
        assert!(!footprint_touches(&projection, &layout, TileIndex::new(10, 10)));
    }

    #[test]
    fn test_tile_offsets() {
        let range = TileRange::spanning(TileIndex::new(-1, -1), TileIndex::new(1, 2));
        assert_eq!(tile_offset_in(&range, TileIndex::new(-1, 2)), Some((0, 0)));
        assert_eq!(tile_offset_in(&range, TileIndex::new(1, -1)), Some((512, 768)));
        assert_eq!(tile_offset_in(&range, TileIndex::new(2, 0)), None);
    }
}
