//! The engine contract and the strategy selected by configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use image::RgbImage;

use crate::config::{FusionConfig, FusionMode};
use crate::fusion::device::DeviceBackend;
use crate::fusion::{DeviceCompositor, FlatCompositor, HostDevice, MultiBandCompositor};
use crate::geometry::{CameraParameters, SE3};
use crate::render::{DrawStats, SaveSummary, TileRenderer};

use super::batch::SeamBatchFusion;
use super::incremental::IncrementalFusion;
use super::messages::{FeedOutcome, Frame};
use super::prepare::PrepareError;
use super::shared_state::FusionStats;

/// Producer-facing operations shared by every fusion strategy.
pub trait FusionEngine: Send + Sync {
    /// Fix the ground plane, camera and resolution from an initial batch and
    /// allocate a tile grid covering its union footprint. Replaces any
    /// previous session.
    fn prepare(&self, plane: &SE3, camera: &CameraParameters, frames: &[Frame]) -> Result<(), PrepareError>;

    /// Enqueue a frame without blocking. At capacity the oldest queued frame
    /// is dropped.
    fn feed(&self, image: RgbImage, pose: SE3) -> FeedOutcome;

    /// Upload changed tile textures and issue one quad per textured tile.
    fn draw(&self, renderer: &mut dyn TileRenderer) -> DrawStats;

    /// Write the flattened mosaic. Fails without writing when nothing has
    /// been fused.
    fn save(&self, path: &Path) -> Result<SaveSummary>;

    /// Frames currently waiting in the queue.
    fn queue_size(&self) -> usize;

    /// Wait until every accepted frame has been fused (or dropped).
    fn flush(&self, timeout: Duration) -> bool;

    fn stats(&self) -> FusionStats;

    /// Hold the consumer between frames. Returns once it has acknowledged.
    fn set_paused(&self, paused: bool);
}

pub enum MapFusion {
    Flat(IncrementalFusion<FlatCompositor>),
    MultiBand(IncrementalFusion<MultiBandCompositor>),
    Device(IncrementalFusion<DeviceCompositor>),
    SeamBatch(SeamBatchFusion),
}

macro_rules! delegate {
    ($self:ident, $engine:ident => $body:expr) => {
        match $self {
            MapFusion::Flat($engine) => $body,
            MapFusion::MultiBand($engine) => $body,
            MapFusion::Device($engine) => $body,
            MapFusion::SeamBatch($engine) => $body,
        }
    };
}

impl MapFusion {
    /// Build the engine for `config.mode`. The device strategy runs on the
    /// host backend.
    pub fn new(config: FusionConfig) -> Self {
        let config = config.validated();
        match config.mode {
            FusionMode::Flat => Self::Flat(IncrementalFusion::new(
                FlatCompositor::new(config.weight_exponent),
                config,
            )),
            FusionMode::MultiBand => Self::MultiBand(IncrementalFusion::new(
                MultiBandCompositor::new(
                    config.band_count,
                    config.weight_exponent,
                    config.high_quality_blend,
                ),
                config,
            )),
            FusionMode::Device => {
                let backend = Arc::new(HostDevice::new(config.band_count));
                Self::with_device(backend, config)
            }
            FusionMode::SeamBatch => Self::SeamBatch(SeamBatchFusion::new(config)),
        }
    }

    /// Device strategy on a caller-supplied backend.
    pub fn with_device(backend: Arc<dyn DeviceBackend>, config: FusionConfig) -> Self {
        let compositor = DeviceCompositor::new(backend, config.weight_exponent);
        Self::Device(IncrementalFusion::new(compositor, config))
    }

    pub fn mode(&self) -> FusionMode {
        match self {
            Self::Flat(_) => FusionMode::Flat,
            Self::MultiBand(_) => FusionMode::MultiBand,
            Self::Device(_) => FusionMode::Device,
            Self::SeamBatch(_) => FusionMode::SeamBatch,
        }
    }
}

impl FusionEngine for MapFusion {
    fn prepare(&self, plane: &SE3, camera: &CameraParameters, frames: &[Frame]) -> Result<(), PrepareError> {
        delegate!(self, e => e.prepare(plane, camera, frames))
    }

    fn feed(&self, image: RgbImage, pose: SE3) -> FeedOutcome {
        delegate!(self, e => e.feed(image, pose))
    }

    fn draw(&self, renderer: &mut dyn TileRenderer) -> DrawStats {
        delegate!(self, e => e.draw(renderer))
    }

    fn save(&self, path: &Path) -> Result<SaveSummary> {
        delegate!(self, e => e.save(path))
    }

    fn queue_size(&self) -> usize {
        delegate!(self, e => e.queue_size())
    }

    fn flush(&self, timeout: Duration) -> bool {
        delegate!(self, e => e.flush(timeout))
    }

    fn stats(&self) -> FusionStats {
        delegate!(self, e => e.stats())
    }

    fn set_paused(&self, paused: bool) {
        delegate!(self, e => e.set_paused(paused))
    }
}
