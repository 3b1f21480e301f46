//! Fusion configuration, read once when an engine is constructed.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::fusion::pyramid::MAX_LEVELS;

/// Which fusion strategy an engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    Flat,
    #[default]
    MultiBand,
    Device,
    SeamBatch,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub mode: FusionMode,
    /// Ground length per map pixel; 0 derives it from the prepared batch.
    pub resolution: f64,
    /// Stored pyramid levels, including the coarsest residual.
    pub band_count: usize,
    pub weight_exponent: f64,
    /// Uncovered texels are transparent rather than background-coloured.
    pub alpha_test: bool,
    pub queue_size: usize,
    /// Neighbour-aware reconstruction for the multi-band strategy.
    pub high_quality_blend: bool,
    pub background: [u8; 3],
    pub grid_headroom_tiles: i64,
    pub upload_budget_ms: u64,
    pub batch_size: usize,
    pub seam_smoothing_radius: u8,
    pub poll_interval_ms: u64,
    /// Frames whose footprint spans more than this many times the prepared
    /// footprint (per axis) are rejected.
    pub max_footprint_scale: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            mode: FusionMode::MultiBand,
            resolution: 0.0,
            band_count: 6,
            weight_exponent: 1.0,
            alpha_test: true,
            queue_size: 20,
            high_quality_blend: false,
            background: [0, 0, 0],
            grid_headroom_tiles: 1,
            upload_budget_ms: 15,
            batch_size: 20,
            seam_smoothing_radius: 2,
            poll_interval_ms: 10,
            max_footprint_scale: 4.0,
        }
    }
}

impl FusionConfig {
    /// Load from a YAML file. Missing keys take their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open fusion config {:?}", path))?;
        let config: FusionConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse fusion config {:?}", path))?;
        Ok(config.validated())
    }

    /// Clamp out-of-range values into their valid ranges.
    pub fn validated(mut self) -> Self {
        if !self.resolution.is_finite() || self.resolution < 0.0 {
            warn!("resolution {} is invalid, deriving it at prepare", self.resolution);
            self.resolution = 0.0;
        }
        if !(1..=MAX_LEVELS).contains(&self.band_count) {
            let clamped = self.band_count.clamp(1, MAX_LEVELS);
            warn!("band_count {} out of range, using {}", self.band_count, clamped);
            self.band_count = clamped;
        }
        if !self.weight_exponent.is_finite() || self.weight_exponent <= 0.0 {
            warn!("weight_exponent {} is invalid, using 1.0", self.weight_exponent);
            self.weight_exponent = 1.0;
        }
        if self.queue_size == 0 {
            warn!("queue_size 0 is invalid, using 1");
            self.queue_size = 1;
        }
        if self.grid_headroom_tiles < 0 {
            warn!("grid_headroom_tiles {} is negative, using 0", self.grid_headroom_tiles);
            self.grid_headroom_tiles = 0;
        }
        if self.batch_size == 0 {
            warn!("batch_size 0 is invalid, using 1");
            self.batch_size = 1;
        }
        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms 0 is invalid, using 1");
            self.poll_interval_ms = 1;
        }
        if !self.max_footprint_scale.is_finite() || self.max_footprint_scale < 1.0 {
            warn!("max_footprint_scale {} is invalid, using 4.0", self.max_footprint_scale);
            self.max_footprint_scale = 4.0;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: seam_batch\nband_count: 4\nbackground: [10, 20, 30]").unwrap();

        let config = FusionConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.mode, FusionMode::SeamBatch);
        assert_eq!(config.band_count, 4);
        assert_eq!(config.background, [10, 20, 30]);
        assert_eq!(config.queue_size, 20);
        assert!(config.alpha_test);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let config = FusionConfig {
            band_count: 40,
            queue_size: 0,
            weight_exponent: -2.0,
            resolution: f64::NAN,
            max_footprint_scale: 0.5,
            ..FusionConfig::default()
        }
        .validated();
        assert_eq!(config.band_count, MAX_LEVELS);
        assert_eq!(config.queue_size, 1);
        assert_eq!(config.weight_exponent, 1.0);
        assert_eq!(config.resolution, 0.0);
        assert_eq!(config.max_footprint_scale, 4.0);
    }

    #[test]
    fn test_unknown_mode_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode: watercolour").unwrap();
        assert!(FusionConfig::from_yaml_file(file.path()).is_err());
    }
}
