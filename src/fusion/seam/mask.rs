//! Morphological clean-up of seam ownership masks.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, open};

use super::finder::PlacedFrame;

pub fn label_mask(labels: &[i32], width: u32, height: u32, label: i32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let l = labels[y as usize * width as usize + x as usize];
        Luma([if l == label { 255 } else { 0 }])
    })
}

/// Open every ownership mask with an L∞ structuring element of `radius` and
/// hand the removed slivers to a neighbouring frame that covers them.
///
/// A removed pixel with no covering neighbour keeps its seam label.
pub fn smooth_labels(
    labels: &[i32],
    width: u32,
    height: u32,
    frames: &[PlacedFrame<'_>],
    radius: u8,
) -> Vec<i32> {
    if radius == 0 {
        return labels.to_vec();
    }
    let opened: Vec<GrayImage> = (0..frames.len())
        .map(|i| open(&label_mask(labels, width, height, i as i32), Norm::LInf, radius))
        .collect();
    let grown: Vec<GrayImage> = opened.iter().map(|m| dilate(m, Norm::LInf, radius)).collect();

    let mut out = labels.to_vec();
    for y in 0..height {
        for x in 0..width {
            let k = y as usize * width as usize + x as usize;
            let Ok(own) = usize::try_from(labels[k]) else {
                continue;
            };
            if own >= frames.len() || opened[own].get_pixel(x, y).0[0] != 0 {
                continue;
            }
            let heir = (0..frames.len()).find(|&j| {
                j != own && grown[j].get_pixel(x, y).0[0] != 0 && frames[j].covers(x, y)
            });
            if let Some(j) = heir {
                out[k] = j as i32;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::warp::WarpedFrame;
    use crate::fusion::weight::WeightImage;
    use crate::mosaic::{TileIndex, TileRange};
    use image::Rgb32FImage;

    fn full(w: u32, h: u32) -> WarpedFrame {
        WarpedFrame {
            range: TileRange::single(TileIndex::new(0, 0)),
            image: Rgb32FImage::new(w, h),
            weight: WeightImage::from_pixel(w, h, Luma([1.0])),
        }
    }

    #[test]
    fn test_sliver_goes_to_covering_neighbour() {
        let (w, h) = (30u32, 20u32);
        // Frame 0 owns everything except a 1-px column of frame 1 at x = 15.
        let mut labels = vec![0i32; (w * h) as usize];
        for y in 0..h {
            labels[(y * w + 15) as usize] = 1;
        }
        let a = full(w, h);
        let b = full(w, h);
        let frames = [
            PlacedFrame { frame: &a, offset: (0, 0) },
            PlacedFrame { frame: &b, offset: (0, 0) },
        ];

        let smoothed = smooth_labels(&labels, w, h, &frames, 1);
        assert!(smoothed.iter().all(|l| *l == 0));
        assert_eq!(smooth_labels(&labels, w, h, &frames, 0), labels);
    }

    #[test]
    fn test_uncovered_sliver_keeps_label() {
        let (w, h) = (30u32, 20u32);
        let mut labels = vec![0i32; (w * h) as usize];
        for y in 0..h {
            labels[(y * w + 15) as usize] = 1;
        }
        // Frame 0 only covers x < 15: nobody can take over the sliver.
        let a = WarpedFrame {
            weight: WeightImage::from_fn(w, h, |x, _| Luma([if x < 15 { 1.0 } else { 0.0 }])),
            ..full(w, h)
        };
        let b = full(w, h);
        let frames = [
            PlacedFrame { frame: &a, offset: (0, 0) },
            PlacedFrame { frame: &b, offset: (0, 0) },
        ];
        let smoothed = smooth_labels(&labels, w, h, &frames, 1);
        assert_eq!(smoothed[15], 1);
    }
}
