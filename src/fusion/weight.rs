//! Radial weight mask ranking a source pixel by its distance from the
//! optical centre.

use std::sync::Arc;

use image::{ImageBuffer, Luma};
use parking_lot::Mutex;
use tracing::debug;

use crate::geometry::CameraParameters;

/// Single-channel `f32` weight image.
pub type WeightImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Keeps every in-image weight strictly positive at the farthest corner.
const RADIUS_SLACK: f64 = 1.05;

/// `w = (1 − r / (1.05·r_max))^k`, with `r` measured from `(cx, cy)`.
pub fn radial_weight_mask(
    width: u32,
    height: u32,
    cx: f64,
    cy: f64,
    exponent: f64,
) -> WeightImage {
    let r_max = [
        (0.0, 0.0),
        (f64::from(width) - 1.0, 0.0),
        (0.0, f64::from(height) - 1.0),
        (f64::from(width) - 1.0, f64::from(height) - 1.0),
    ]
    .iter()
    .map(|(x, y)| ((x - cx).powi(2) + (y - cy).powi(2)).sqrt())
    .fold(0.0f64, f64::max)
    .max(1.0);
    let scale = 1.0 / (RADIUS_SLACK * r_max);

    ImageBuffer::from_fn(width, height, |u, v| {
        let r = ((f64::from(u) - cx).powi(2) + (f64::from(v) - cy).powi(2)).sqrt();
        let base = (1.0 - r * scale).max(0.0);
        Luma([base.powf(exponent) as f32])
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MaskKey {
    width: u32,
    height: u32,
    cx: f64,
    cy: f64,
}

/// Per-camera weight mask, built once and rebuilt only when the image
/// dimensions (or principal point) change.
pub struct WeightMaskCache {
    exponent: f64,
    cached: Mutex<Option<(MaskKey, Arc<WeightImage>)>>,
}

impl WeightMaskCache {
    pub fn new(exponent: f64) -> Self {
        Self {
            exponent,
            cached: Mutex::new(None),
        }
    }

    /// Mask for a `width × height` image from `camera`.
    pub fn get(&self, camera: &CameraParameters, width: u32, height: u32) -> Arc<WeightImage> {
        let key = MaskKey {
            width,
            height,
            cx: camera.cx,
            cy: camera.cy,
        };
        let mut cached = self.cached.lock();
        if let Some((k, mask)) = cached.as_ref() {
            if *k == key {
                return Arc::clone(mask);
            }
        }
        debug!("Building {}x{} weight mask (k = {})", width, height, self.exponent);
        let mask = Arc::new(radial_weight_mask(width, height, key.cx, key.cy, self.exponent));
        *cached = Some((key, Arc::clone(&mask)));
        mask
    }
}
