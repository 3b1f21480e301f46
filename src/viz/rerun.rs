//! Rerun-based tile viewer.
//!
//! Entity hierarchy:
//!     status             - Engine counters
//!     tiles/<ix>_<iy>    - Latest texture of each uploaded tile
//!     world/tiles        - Outline of every textured tile, coloured by its mean texel
//!     world/camera       - Position of the last fed frame

use std::collections::HashMap;

use anyhow::{Context, Result};
use image::RgbaImage;
use nalgebra::Vector3;
use rerun::RecordingStream;

use crate::mosaic::TileIndex;
use crate::render::TileRenderer;
use crate::system::FusionStats;

pub struct RerunTileViewer {
    rec: RecordingStream,
    tile_colors: HashMap<TileIndex, [u8; 3]>,
    outlines: Vec<Vec<[f32; 3]>>,
    outline_colors: Vec<[u8; 3]>,
    start_timestamp_ns: Option<u64>,
}

impl RerunTileViewer {
    pub fn new(app_name: &str) -> Result<Self> {
        // Runs rerun viewer in a separate process
        let rec = rerun::RecordingStreamBuilder::new(app_name)
            .spawn()
            .context("Failed to spawn rerun viewer")?;
        // Ground plane is z-up.
        rec.log_static("world", &rerun::ViewCoordinates::RFU()).ok();
        Ok(Self {
            rec,
            tile_colors: HashMap::new(),
            outlines: Vec::new(),
            outline_colors: Vec::new(),
            start_timestamp_ns: None,
        })
    }

    /// Set the current timestamp for all subsequent logs, relative to the first frame.
    pub fn set_time(&mut self, timestamp_ns: u64) {
        let start_ns = *self.start_timestamp_ns.get_or_insert(timestamp_ns);
        let relative_sec = timestamp_ns.saturating_sub(start_ns) as f64 / 1e9;
        self.rec.set_duration_secs("time", relative_sec);
    }

    pub fn log_camera_position(&self, position: &Vector3<f64>) {
        self.rec
            .log(
                "world/camera",
                &rerun::Points3D::new([[position.x as f32, position.y as f32, position.z as f32]])
                    .with_colors([[255u8, 200, 0]])
                    .with_radii([0.5f32]),
            )
            .ok();
    }

    pub fn log_stats(&self, stats: &FusionStats, queue_size: usize) {
        let text = format!(
            "Fed: {} | Merged: {} | Evicted: {} | Rejected: {} | Stale: {} | Tiles: {} | Queue: {}",
            stats.fed, stats.merged, stats.evicted, stats.rejected, stats.stale_drops, stats.tiles, queue_size
        );
        self.rec
            .log(
                "status",
                &rerun::TextDocument::new(text).with_media_type(rerun::MediaType::markdown()),
            )
            .ok();
    }

    /// Log the outlines collected by the last `draw` pass.
    pub fn finish_frame(&mut self) {
        if self.outlines.is_empty() {
            return;
        }
        let strips = std::mem::take(&mut self.outlines);
        let colors = std::mem::take(&mut self.outline_colors);
        self.rec
            .log(
                "world/tiles",
                &rerun::LineStrips3D::new(strips)
                    .with_colors(colors)
                    .with_radii([0.05f32]),
            )
            .ok();
    }
}

impl TileRenderer for RerunTileViewer {
    fn upload_texture(&mut self, tile: TileIndex, texture: &RgbaImage) {
        self.tile_colors.insert(tile, mean_color(texture));
        let (w, h) = texture.dimensions();
        self.rec
            .log(
                format!("tiles/{}_{}", tile.ix, tile.iy),
                &rerun::Image::from_rgba32(texture.as_raw().clone(), [w, h]),
            )
            .ok();
    }

    fn draw_quad(&mut self, tile: TileIndex, corners: [Vector3<f64>; 4]) {
        let mut strip: Vec<[f32; 3]> = corners
            .iter()
            .map(|p| [p.x as f32, p.y as f32, p.z as f32])
            .collect();
        strip.push(strip[0]);
        self.outlines.push(strip);
        self.outline_colors
            .push(self.tile_colors.get(&tile).copied().unwrap_or([128, 128, 128]));
    }
}

/// Mean colour of the covered texels.
fn mean_color(texture: &RgbaImage) -> [u8; 3] {
    let mut sum = [0u64; 3];
    let mut n = 0u64;
    for p in texture.pixels().filter(|p| p.0[3] > 0) {
        for c in 0..3 {
            sum[c] += u64::from(p.0[c]);
        }
        n += 1;
    }
    if n == 0 {
        return [0, 0, 0];
    }
    [(sum[0] / n) as u8, (sum[1] / n) as u8, (sum[2] / n) as u8]
}
