//! Dynamic-programming seam search between a new frame and the composite.

use image::Rgb32FImage;

use crate::fusion::warp::WarpedFrame;

/// Owner label of an uncovered canvas pixel.
pub const NO_LABEL: i32 = -1;

/// Cost of routing the seam through a pixel outside the overlap.
const OFF_OVERLAP_COST: f32 = 1.0e6;

/// A warped frame placed on the batch canvas.
pub struct PlacedFrame<'a> {
    pub frame: &'a WarpedFrame,
    /// Canvas pixel of the frame's top-left.
    pub offset: (u32, u32),
}

impl PlacedFrame<'_> {
    /// Frame-local coordinates of canvas pixel `(x, y)` if the frame covers it.
    #[inline]
    pub fn local(&self, x: u32, y: u32) -> Option<(u32, u32)> {
        let (ox, oy) = self.offset;
        let (w, h) = self.frame.weight.dimensions();
        if x < ox || y < oy || x >= ox + w || y >= oy + h {
            return None;
        }
        let (lx, ly) = (x - ox, y - oy);
        (self.frame.weight.get_pixel(lx, ly).0[0] > 0.0).then_some((lx, ly))
    }

    pub fn covers(&self, x: u32, y: u32) -> bool {
        self.local(x, y).is_some()
    }
}

/// Minimum-cost 8-connected path from the top row to the bottom row of a
/// row-major `width × height` cost grid. Returns one column per row.
pub fn min_cost_seam(cost: &[f32], width: usize, height: usize) -> Vec<usize> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let mut acc = cost[..width].to_vec();
    let mut from = vec![0usize; width * height];
    for y in 1..height {
        let mut next = vec![0.0f32; width];
        for x in 0..width {
            let lo = x.saturating_sub(1);
            let hi = (x + 1).min(width - 1);
            let mut best = lo;
            for cand in lo..=hi {
                if acc[cand] < acc[best] {
                    best = cand;
                }
            }
            next[x] = acc[best] + cost[y * width + x];
            from[y * width + x] = best;
        }
        acc = next;
    }

    let mut x = (0..width)
        .min_by(|a, b| acc[*a].total_cmp(&acc[*b]))
        .unwrap_or(0);
    let mut seam = vec![0usize; height];
    for y in (0..height).rev() {
        seam[y] = x;
        x = from[y * width + x];
    }
    seam
}

fn luma(p: [f32; 3]) -> f32 {
    0.299 * p[0] + 0.587 * p[1] + 0.114 * p[2]
}

/// Composites frames in order, cutting each overlap along a minimum-cost seam.
pub struct SeamComposer {
    width: u32,
    height: u32,
    labels: Vec<i32>,
    colour: Rgb32FImage,
    weight: Vec<f32>,
}

impl SeamComposer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            labels: vec![NO_LABEL; width as usize * height as usize],
            colour: Rgb32FImage::new(width, height),
            weight: vec![0.0; width as usize * height as usize],
        }
    }

    pub fn into_labels(self) -> Vec<i32> {
        self.labels
    }

    fn idx(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    fn assign(&mut self, label: i32, placed: &PlacedFrame<'_>, x: u32, y: u32, lx: u32, ly: u32) {
        let i = self.idx(x, y);
        self.labels[i] = label;
        self.weight[i] = placed.frame.weight.get_pixel(lx, ly).0[0];
        self.colour.put_pixel(x, y, *placed.frame.image.get_pixel(lx, ly));
    }

    fn composite_gradient(&self, x: u32, y: u32) -> f32 {
        let at = |x: u32, y: u32| luma(self.colour.get_pixel(x, y).0);
        let (xl, xr) = (x.saturating_sub(1), (x + 1).min(self.width - 1));
        let (yu, yd) = (y.saturating_sub(1), (y + 1).min(self.height - 1));
        (at(xr, y) - at(xl, y)).abs() + (at(x, yd) - at(x, yu)).abs()
    }

    /// Add frame `label` to the composite.
    pub fn add(&mut self, label: i32, placed: &PlacedFrame<'_>) {
        let (ox, oy) = placed.offset;
        let (fw, fh) = placed.frame.weight.dimensions();
        let x_end = (ox + fw).min(self.width);
        let y_end = (oy + fh).min(self.height);

        // Exclusive pixels go straight to the new frame; collect the overlap.
        let mut overlap = Vec::new();
        let (mut ex_sum, mut ex_n) = ((0.0f64, 0.0f64), 0usize);
        for y in oy..y_end {
            for x in ox..x_end {
                let Some((lx, ly)) = placed.local(x, y) else {
                    continue;
                };
                if self.labels[self.idx(x, y)] == NO_LABEL {
                    self.assign(label, placed, x, y, lx, ly);
                    ex_sum.0 += f64::from(x);
                    ex_sum.1 += f64::from(y);
                    ex_n += 1;
                } else {
                    overlap.push((x, y));
                }
            }
        }
        if overlap.is_empty() {
            return;
        }

        if ex_n == 0 {
            // Nothing of its own: keep the stronger frame per pixel.
            for (x, y) in overlap {
                if let Some((lx, ly)) = placed.local(x, y) {
                    if placed.frame.weight.get_pixel(lx, ly).0[0] >= self.weight[self.idx(x, y)] {
                        self.assign(label, placed, x, y, lx, ly);
                    }
                }
            }
            return;
        }

        let (mut bx0, mut by0, mut bx1, mut by1) = (u32::MAX, u32::MAX, 0, 0);
        let (mut ov_sum, ov_n) = ((0.0f64, 0.0f64), overlap.len() as f64);
        for &(x, y) in &overlap {
            bx0 = bx0.min(x);
            by0 = by0.min(y);
            bx1 = bx1.max(x);
            by1 = by1.max(y);
            ov_sum.0 += f64::from(x);
            ov_sum.1 += f64::from(y);
        }
        let bw = (bx1 - bx0 + 1) as usize;
        let bh = (by1 - by0 + 1) as usize;

        // Seam runs along the longer axis of the overlap.
        let vertical = bh >= bw;
        let (seam_w, seam_h) = if vertical { (bw, bh) } else { (bh, bw) };
        let mut cost = vec![OFF_OVERLAP_COST; seam_w * seam_h];
        for &(x, y) in &overlap {
            let (lx, ly) = placed.local(x, y).unwrap_or((0, 0));
            let new = placed.frame.image.get_pixel(lx, ly).0;
            let old = self.colour.get_pixel(x, y).0;
            let colour_diff: f32 = (0..3).map(|c| (new[c] - old[c]).abs()).sum();
            let grad_diff = (frame_gradient(placed, lx, ly) - self.composite_gradient(x, y)).abs();
            let (cx, cy) = ((x - bx0) as usize, (y - by0) as usize);
            let k = if vertical { cy * seam_w + cx } else { cx * seam_w + cy };
            cost[k] = colour_diff + grad_diff;
        }
        let seam = min_cost_seam(&cost, seam_w, seam_h);

        // The new frame takes the side facing its exclusive area.
        let ex_c = (ex_sum.0 / ex_n as f64, ex_sum.1 / ex_n as f64);
        let ov_c = (ov_sum.0 / ov_n, ov_sum.1 / ov_n);
        let new_after = if vertical { ex_c.0 > ov_c.0 } else { ex_c.1 > ov_c.1 };

        for (x, y) in overlap {
            let (cx, cy) = ((x - bx0) as usize, (y - by0) as usize);
            let (along, across) = if vertical { (cy, cx) } else { (cx, cy) };
            let cut = seam[along];
            let take = if new_after { across >= cut } else { across <= cut };
            if take {
                if let Some((lx, ly)) = placed.local(x, y) {
                    self.assign(label, placed, x, y, lx, ly);
                }
            }
        }
    }
}

fn frame_gradient(placed: &PlacedFrame<'_>, x: u32, y: u32) -> f32 {
    let image = &placed.frame.image;
    let (w, h) = image.dimensions();
    let at = |x: u32, y: u32| luma(image.get_pixel(x, y).0);
    let (xl, xr) = (x.saturating_sub(1), (x + 1).min(w - 1));
    let (yu, yd) = (y.saturating_sub(1), (y + 1).min(h - 1));
    (at(xr, y) - at(xl, y)).abs() + (at(x, yd) - at(x, yu)).abs()
}
