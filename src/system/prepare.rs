//! Session sizing from the initial frame batch.

use nalgebra::Vector2;
use tracing::{info, warn};

use crate::config::FusionConfig;
use crate::fusion::warp::footprint_range;
use crate::geometry::{CameraParameters, SE3, project_frame};
use crate::mosaic::{MapLayout, TILE_SIZE, TileRange};

use super::messages::Frame;

/// Why `prepare` refused a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareError {
    InvalidCamera,
    EmptyBatch,
    /// Cameras on the plane, or on both sides of it.
    DegenerateAltitude { min: f64, max: f64 },
    ImageSizeMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    InvalidResolution(f64),
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCamera => write!(f, "camera parameters are degenerate"),
            Self::EmptyBatch => write!(f, "initial frame batch is empty"),
            Self::DegenerateAltitude { min, max } => {
                write!(f, "degenerate camera heights (min {:.3}, max {:.3})", min, max)
            }
            Self::ImageSizeMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "frame {} is {}x{}, camera is {}x{}",
                index, actual.0, actual.1, expected.0, expected.1
            ),
            Self::InvalidResolution(r) => write!(f, "invalid map resolution {}", r),
        }
    }
}

impl std::error::Error for PrepareError {}

/// Layout and initial grid range of a new session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub layout: MapLayout,
    pub range: TileRange,
}

/// Validate the batch, derive the resolution and size the grid.
pub fn plan_session(
    plane: &SE3,
    camera: &CameraParameters,
    frames: &[Frame],
    config: &FusionConfig,
) -> Result<SessionPlan, PrepareError> {
    if !camera.is_valid() {
        return Err(PrepareError::InvalidCamera);
    }
    if frames.is_empty() {
        return Err(PrepareError::EmptyBatch);
    }
    let expected = (camera.width, camera.height);
    for (index, frame) in frames.iter().enumerate() {
        let actual = frame.image.dimensions();
        if actual != expected {
            return Err(PrepareError::ImageSizeMismatch {
                index,
                expected,
                actual,
            });
        }
    }

    let plane_inv = plane.inverse();
    let poses: Vec<SE3> = frames.iter().map(|f| plane_inv.compose(&f.pose)).collect();
    let heights: Vec<f64> = poses.iter().map(|p| p.translation.z).collect();
    let min = heights.iter().copied().fold(f64::INFINITY, f64::min);
    let max = heights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(min * max > 0.0) {
        return Err(PrepareError::DegenerateAltitude { min, max });
    }

    let mean_height = heights.iter().map(|z| z.abs()).sum::<f64>() / heights.len() as f64;
    let resolution = if config.resolution > 0.0 {
        config.resolution
    } else {
        mean_height / camera.fx
    };
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(PrepareError::InvalidResolution(resolution));
    }

    // Footprint diagonal of a nadir frame at the mean height, in map pixels.
    let diagonal = f64::from(camera.width).hypot(f64::from(camera.height));
    let nominal_px = diagonal * mean_height / (camera.fx * resolution);
    let max_span = (config.max_footprint_scale * nominal_px / f64::from(TILE_SIZE)).ceil() as usize + 1;
    let layout = MapLayout::new(*plane, *camera, resolution).with_max_frame_span(max_span);
    let mut range: Option<TileRange> = None;
    for (index, pose) in poses.iter().enumerate() {
        let footprint = match project_frame(camera, pose) {
            Ok(projection) => footprint_range(&projection, &layout),
            Err(e) => {
                warn!("Initial frame {} not projectable ({}), using its ground position", index, e);
                let p = Vector2::new(pose.translation.x, pose.translation.y);
                TileRange::single(layout.tile_of(&p))
            }
        };
        range = Some(range.map_or(footprint, |r| r.union(&footprint)));
    }
    // Non-empty batch, so at least one range was recorded.
    let range = range
        .ok_or(PrepareError::EmptyBatch)?
        .padded(config.grid_headroom_tiles);

    info!(
        "Prepared session: resolution {:.4} m/px, tile {:.2} m, grid {}x{} tiles",
        resolution,
        layout.tile_world_size,
        range.cols(),
        range.rows()
    );
    Ok(SessionPlan { layout, range })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::nadir_pose;
    use crate::mosaic::TileIndex;
    use approx::assert_relative_eq;
    use image::RgbImage;
    use nalgebra::Vector3;

    fn camera() -> CameraParameters {
        CameraParameters::new(640, 480, 500.0, 500.0, 320.0, 240.0)
    }

    fn frame_at(p: Vector3<f64>) -> Frame {
        Frame::new(RgbImage::new(640, 480), nadir_pose(p))
    }

    #[test]
    fn test_resolution_from_mean_altitude() {
        let frames = [frame_at(Vector3::new(0.0, 0.0, 40.0)), frame_at(Vector3::new(10.0, 0.0, 60.0))];
        let plan = plan_session(&SE3::identity(), &camera(), &frames, &FusionConfig::default()).unwrap();
        assert_relative_eq!(plan.layout.resolution, 0.1, epsilon = 1e-12);
        // 800 px diagonal, four times over: 12.5 tiles, plus one for alignment.
        assert_eq!(plan.layout.max_frame_span, Some(14));

        // The 40 m frame reaches x = -25.6 (tile -1), the 60 m frame x = 48.4
        // (tile 1); headroom adds one tile on each side.
        assert!(plan.range.contains(TileIndex::new(-2, 0)));
        assert!(plan.range.contains(TileIndex::new(2, 0)));
    }

    #[test]
    fn test_resolution_override() {
        let config = FusionConfig {
            resolution: 0.25,
            ..FusionConfig::default()
        };
        let frames = [frame_at(Vector3::new(0.0, 0.0, 50.0))];
        let plan = plan_session(&SE3::identity(), &camera(), &frames, &config).unwrap();
        assert_eq!(plan.layout.resolution, 0.25);
    }

    #[test]
    fn test_rejections() {
        let config = FusionConfig::default();
        let plane = SE3::identity();
        assert_eq!(
            plan_session(&plane, &camera(), &[], &config).unwrap_err(),
            PrepareError::EmptyBatch
        );

        let bad = CameraParameters::new(0, 480, 500.0, 500.0, 320.0, 240.0);
        let frames = [frame_at(Vector3::new(0.0, 0.0, 50.0))];
        assert_eq!(
            plan_session(&plane, &bad, &frames, &config).unwrap_err(),
            PrepareError::InvalidCamera
        );

        let straddling = [
            frame_at(Vector3::new(0.0, 0.0, 50.0)),
            frame_at(Vector3::new(0.0, 0.0, -50.0)),
        ];
        assert!(matches!(
            plan_session(&plane, &camera(), &straddling, &config),
            Err(PrepareError::DegenerateAltitude { .. })
        ));

        let small = [Frame::new(RgbImage::new(320, 240), nadir_pose(Vector3::new(0.0, 0.0, 50.0)))];
        assert!(matches!(
            plan_session(&plane, &camera(), &small, &config),
            Err(PrepareError::ImageSizeMismatch { index: 0, .. })
        ));
    }
}
