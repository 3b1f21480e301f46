//! Gaussian / Laplacian image pyramids on `f32` image buffers.
//!
//! Level 0 is the finest. Downsampling uses the 5-tap binomial kernel
//! `[1 4 6 4 1] / 16` with clamp-to-edge borders; upsampling is its
//! zero-insertion dual, so `collapse(laplacian(img)) == img` up to rounding.

use image::{ImageBuffer, Luma, Pixel, Rgb, Rgb32FImage};

use super::weight::WeightImage;

/// Upper bound on pyramid levels: a 256-px tile reaches 1 px at level 8.
pub const MAX_LEVELS: usize = 9;

const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

pub type FloatImage<P> = ImageBuffer<P, Vec<f32>>;

fn channels<P: Pixel<Subpixel = f32>>() -> usize {
    usize::from(P::CHANNEL_COUNT)
}

#[inline]
fn clamp_index(i: i64, len: u32) -> usize {
    i.clamp(0, i64::from(len) - 1) as usize
}

/// Blur with the binomial kernel and keep every second sample.
/// Output size is `ceil(w/2) × ceil(h/2)`.
pub fn pyr_down<P: Pixel<Subpixel = f32>>(src: &FloatImage<P>) -> FloatImage<P> {
    let (w, h) = src.dimensions();
    let (ow, oh) = (w.div_ceil(2).max(1), h.div_ceil(2).max(1));
    let c = channels::<P>();
    let data: &[f32] = src.as_raw();

    // Horizontal pass: w × h → ow × h.
    let mut tmp = vec![0.0f32; ow as usize * h as usize * c];
    for y in 0..h as usize {
        let row = &data[y * w as usize * c..(y + 1) * w as usize * c];
        let out = &mut tmp[y * ow as usize * c..(y + 1) * ow as usize * c];
        for x in 0..ow as usize {
            for (k, kw) in KERNEL.iter().enumerate() {
                let sx = clamp_index(2 * x as i64 + k as i64 - 2, w);
                for ch in 0..c {
                    out[x * c + ch] += kw * row[sx * c + ch];
                }
            }
        }
    }

    // Vertical pass: ow × h → ow × oh.
    let stride = ow as usize * c;
    let mut out = vec![0.0f32; stride * oh as usize];
    for y in 0..oh as usize {
        let dst = &mut out[y * stride..(y + 1) * stride];
        for (k, kw) in KERNEL.iter().enumerate() {
            let sy = clamp_index(2 * y as i64 + k as i64 - 2, h);
            let srow = &tmp[sy * stride..(sy + 1) * stride];
            for (d, s) in dst.iter_mut().zip(srow) {
                *d += kw * s;
            }
        }
    }

    from_vec(ow, oh, out)
}

/// Expand `src` to `width × height` (normally twice its size).
///
/// Output sample `x` maps to source sample `x / 2`; the source is clamped at
/// its borders.
pub fn pyr_up<P: Pixel<Subpixel = f32>>(
    src: &FloatImage<P>,
    width: u32,
    height: u32,
) -> FloatImage<P> {
    let (w, h) = src.dimensions();
    let c = channels::<P>();
    let data: &[f32] = src.as_raw();

    // Horizontal pass: w × h → width × h.
    let stride = width as usize * c;
    let mut tmp = vec![0.0f32; stride * h as usize];
    for y in 0..h as usize {
        let row = &data[y * w as usize * c..(y + 1) * w as usize * c];
        let out = &mut tmp[y * stride..(y + 1) * stride];
        for x in 0..width as usize {
            expand_taps(x as i64, w, |sx, kw| {
                for ch in 0..c {
                    out[x * c + ch] += kw * row[sx * c + ch];
                }
            });
        }
    }

    // Vertical pass: width × h → width × height.
    let mut out = vec![0.0f32; stride * height as usize];
    for y in 0..height as usize {
        let dst = &mut out[y * stride..(y + 1) * stride];
        expand_taps(y as i64, h, |sy, kw| {
            let srow = &tmp[sy * stride..(sy + 1) * stride];
            for (d, s) in dst.iter_mut().zip(srow) {
                *d += kw * s;
            }
        });
    }

    from_vec(width, height, out)
}

/// Source taps contributing to upsampled sample `x` (kernel scaled by 2).
#[inline]
fn expand_taps(x: i64, len: u32, mut f: impl FnMut(usize, f32)) {
    for (k, kw) in KERNEL.iter().enumerate() {
        let t = x + k as i64 - 2;
        if t.rem_euclid(2) == 0 {
            f(clamp_index(t.div_euclid(2), len), 2.0 * kw);
        }
    }
}

fn from_vec<P: Pixel<Subpixel = f32>>(w: u32, h: u32, data: Vec<f32>) -> FloatImage<P> {
    // Lengths are computed from (w, h, channels) by every caller.
    ImageBuffer::from_raw(w, h, data).unwrap_or_else(|| ImageBuffer::new(w, h))
}

/// `levels` Gaussian levels, level 0 = `src`.
pub fn gaussian_pyramid<P: Pixel<Subpixel = f32>>(
    src: &FloatImage<P>,
    levels: usize,
) -> Vec<FloatImage<P>> {
    let levels = levels.clamp(1, MAX_LEVELS);
    let mut out = Vec::with_capacity(levels);
    out.push(src.clone());
    for l in 1..levels {
        let next = pyr_down(&out[l - 1]);
        out.push(next);
    }
    out
}

/// `levels` bands: `levels − 1` Laplacian residuals plus the coarsest Gaussian.
pub fn laplacian_pyramid<P: Pixel<Subpixel = f32>>(
    src: &FloatImage<P>,
    levels: usize,
) -> Vec<FloatImage<P>> {
    let mut bands = gaussian_pyramid(src, levels);
    for l in 0..bands.len() - 1 {
        let (w, h) = bands[l].dimensions();
        let up = pyr_up(&bands[l + 1], w, h);
        sub_assign(&mut bands[l], &up);
    }
    bands
}

/// Sum a Laplacian pyramid back into an image.
pub fn collapse<P: Pixel<Subpixel = f32>>(bands: &[FloatImage<P>]) -> Option<FloatImage<P>> {
    let (last, rest) = bands.split_last()?;
    let mut acc = last.clone();
    for band in rest.iter().rev() {
        let (w, h) = band.dimensions();
        let mut up = pyr_up(&acc, w, h);
        add_assign(&mut up, band);
        acc = up;
    }
    Some(acc)
}

pub fn add_assign<P: Pixel<Subpixel = f32>>(dst: &mut FloatImage<P>, src: &FloatImage<P>) {
    let d: &mut [f32] = dst;
    for (a, b) in d.iter_mut().zip(src.as_raw()) {
        *a += b;
    }
}

pub fn sub_assign<P: Pixel<Subpixel = f32>>(dst: &mut FloatImage<P>, src: &FloatImage<P>) {
    let d: &mut [f32] = dst;
    for (a, b) in d.iter_mut().zip(src.as_raw()) {
        *a -= b;
    }
}

/// Copy a `w × h` window starting at `(x, y)`; samples outside `src` are clamped.
pub fn crop<P: Pixel<Subpixel = f32>>(
    src: &FloatImage<P>,
    x: i64,
    y: i64,
    w: u32,
    h: u32,
) -> FloatImage<P> {
    let (sw, sh) = src.dimensions();
    let c = channels::<P>();
    let data: &[f32] = src.as_raw();
    let mut out = Vec::with_capacity(w as usize * h as usize * c);
    for row in 0..i64::from(h) {
        let sy = clamp_index(y + row, sh);
        for col in 0..i64::from(w) {
            let sx = clamp_index(x + col, sw);
            let base = (sy * sw as usize + sx) * c;
            out.extend_from_slice(&data[base..base + c]);
        }
    }
    from_vec(w, h, out)
}

/// Paste `src` into `dst` with its top-left at `(x, y)`; out-of-range parts are skipped.
pub fn paste<P: Pixel<Subpixel = f32>>(dst: &mut FloatImage<P>, src: &FloatImage<P>, x: i64, y: i64) {
    let (dw, dh) = dst.dimensions();
    let (sw, sh) = src.dimensions();
    let c = channels::<P>();
    let s: &[f32] = src.as_raw();
    let d: &mut [f32] = dst;
    for row in 0..i64::from(sh) {
        let dy = y + row;
        if dy < 0 || dy >= i64::from(dh) {
            continue;
        }
        for col in 0..i64::from(sw) {
            let dx = x + col;
            if dx < 0 || dx >= i64::from(dw) {
                continue;
            }
            let si = (row as usize * sw as usize + col as usize) * c;
            let di = (dy as usize * dw as usize + dx as usize) * c;
            d[di..di + c].copy_from_slice(&s[si..si + c]);
        }
    }
}

/// Fill pixels where `valid` is zero from progressively coarser averages of
/// the valid ones (push-pull). Valid pixels keep their exact value.
pub fn push_pull_fill(image: &Rgb32FImage, valid: &WeightImage) -> Rgb32FImage {
    let alpha: WeightImage = ImageBuffer::from_fn(valid.width(), valid.height(), |x, y| {
        Luma([if valid.get_pixel(x, y).0[0] > 0.0 { 1.0 } else { 0.0 }])
    });
    let premultiplied: Rgb32FImage = ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let a = alpha.get_pixel(x, y).0[0];
        let p = image.get_pixel(x, y).0;
        Rgb([p[0] * a, p[1] * a, p[2] * a])
    });

    // Push: premultiplied colour and coverage down to a single pixel.
    let mut sums = vec![premultiplied];
    let mut alphas = vec![alpha];
    loop {
        let (s, a) = (&sums[sums.len() - 1], &alphas[alphas.len() - 1]);
        if s.width() <= 1 && s.height() <= 1 {
            break;
        }
        let (s, a) = (pyr_down(s), pyr_down(a));
        sums.push(s);
        alphas.push(a);
    }

    // Pull: blend each level's own estimate with the upsampled coarser one.
    let mut filled: Option<Rgb32FImage> = None;
    for (s, a) in sums.iter().zip(&alphas).rev() {
        let up = filled.map(|coarse| pyr_up(&coarse, s.width(), s.height()));
        let level = ImageBuffer::from_fn(s.width(), s.height(), |x, y| {
            let a = a.get_pixel(x, y).0[0];
            let sum = s.get_pixel(x, y).0;
            let coarse = up.as_ref().map_or([0.0; 3], |u| u.get_pixel(x, y).0);
            if a > 1e-6 {
                let t = a.min(1.0);
                Rgb([0, 1, 2].map(|c| t * sum[c] / a + (1.0 - t) * coarse[c]))
            } else {
                Rgb(coarse)
            }
        });
        filled = Some(level);
    }
    filled.unwrap_or_else(|| image.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(w: u32, h: u32) -> FloatImage<Rgb<f32>> {
        ImageBuffer::from_fn(w, h, |x, y| {
            Rgb([x as f32 * 2.0, y as f32, ((x * 7 + y * 13) % 50) as f32])
        })
    }

    #[test]
    fn test_pyr_down_sizes() {
        let img = ramp(256, 128);
        let g = gaussian_pyramid(&img, 6);
        let sizes: Vec<_> = g.iter().map(|l| l.dimensions()).collect();
        assert_eq!(sizes, vec![(256, 128), (128, 64), (64, 32), (32, 16), (16, 8), (8, 4)]);
    }

    #[test]
    fn test_constant_image_is_fixed_point() {
        let img: FloatImage<Luma<f32>> = ImageBuffer::from_pixel(64, 64, Luma([3.5]));
        let down = pyr_down(&img);
        let up = pyr_up(&down, 64, 64);
        assert!(down.pixels().all(|p| (p.0[0] - 3.5).abs() < 1e-5));
        assert!(up.pixels().all(|p| (p.0[0] - 3.5).abs() < 1e-5));
    }

    #[test]
    fn test_laplacian_collapse_reconstructs() {
        let img = ramp(256, 256);
        for levels in [1, 2, 5, 9] {
            let bands = laplacian_pyramid(&img, levels);
            assert_eq!(bands.len(), levels);
            let back = collapse(&bands).unwrap();
            for (a, b) in back.as_raw().iter().zip(img.as_raw()) {
                assert!((a - b).abs() < 1e-3, "levels={levels}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_single_level_is_identity() {
        let img = ramp(32, 32);
        let bands = laplacian_pyramid(&img, 1);
        assert_eq!(bands[0], img);
    }

    #[test]
    fn test_crop_and_paste() {
        let img = ramp(16, 16);
        let window = crop(&img, 4, 6, 8, 8);
        assert_eq!(window.get_pixel(0, 0), img.get_pixel(4, 6));

        let mut canvas: FloatImage<Rgb<f32>> = ImageBuffer::new(16, 16);
        paste(&mut canvas, &window, 4, 6);
        assert_eq!(canvas.get_pixel(11, 13), img.get_pixel(11, 13));
        assert_eq!(canvas.get_pixel(0, 0), &Rgb([0.0, 0.0, 0.0]));

        // Clamped reads past the border repeat the edge.
        let edge = crop(&img, -2, 0, 1, 1);
        assert_eq!(edge.get_pixel(0, 0), img.get_pixel(0, 0));
    }

    #[test]
    fn test_push_pull_keeps_valid_and_fills_holes() {
        let img = ramp(64, 64);
        let valid: WeightImage = ImageBuffer::from_fn(64, 64, |x, _| Luma([if x < 32 { 1.0 } else { 0.0 }]));
        let filled = push_pull_fill(&img, &valid);

        for y in 0..64 {
            for x in 0..32 {
                for c in 0..3 {
                    let (a, b) = (filled.get_pixel(x, y).0[c], img.get_pixel(x, y).0[c]);
                    assert!((a - b).abs() < 1e-3);
                }
            }
        }
        // Holes take values from the valid side, not black.
        let far = filled.get_pixel(63, 10).0;
        assert!(far[0] > 20.0, "{far:?}");
    }
}
