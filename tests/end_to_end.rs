use std::time::Duration;

use approx::assert_relative_eq;
use image::{Rgb, RgbImage};
use nalgebra::{Vector2, Vector3};

use rust_mapfusion::config::{FusionConfig, FusionMode};
use rust_mapfusion::fusion::FlatCompositor;
use rust_mapfusion::geometry::{CameraParameters, SE3, nadir_pose};
use rust_mapfusion::system::{Frame, FusionEngine, IncrementalFusion, MapFusion};

const HEIGHT: f64 = 50.0;
// 640 px at f = 500 from 50 m: 64 m across, 48 m along.
const FOOTPRINT_WIDTH: f64 = 64.0;

fn camera() -> CameraParameters {
    CameraParameters::new(640, 480, 500.0, 500.0, 320.0, 240.0)
}

fn config(mode: FusionMode) -> FusionConfig {
    FusionConfig {
        mode,
        grid_headroom_tiles: 0,
        poll_interval_ms: 1,
        ..FusionConfig::default()
    }
}

fn uniform(v: u8) -> RgbImage {
    RgbImage::from_pixel(640, 480, Rgb([v, v, v]))
}

/// Raster colour at a world point.
fn sample(raster: &RgbImage, summary: &rust_mapfusion::render::SaveSummary, x: f64, y: f64) -> u8 {
    let px = summary.bounds.world_to_pixel(&Vector2::new(x, y));
    raster.get_pixel(px.x as u32, px.y as u32).0[0]
}

#[test]
fn test_two_overlapping_frames() {
    let engine = IncrementalFusion::new(FlatCompositor::new(1.0), config(FusionMode::Flat));
    let a = nadir_pose(Vector3::new(0.0, 0.0, HEIGHT));
    let b = nadir_pose(Vector3::new(FOOTPRINT_WIDTH / 2.0, 0.0, HEIGHT));

    engine
        .prepare(&SE3::identity(), &camera(), &[Frame::new(uniform(0), a)])
        .unwrap();
    let prepared = engine.session().unwrap();
    assert_relative_eq!(prepared.layout.resolution, 0.1, epsilon = 1e-12);
    let before = prepared.grid.range();

    assert!(engine.feed(uniform(40), a).is_accepted());
    assert!(engine.feed(uniform(200), b).is_accepted());
    assert!(engine.flush(Duration::from_secs(30)));
    assert_eq!(engine.stats().merged, 2);

    // B reaches past the prepared grid; the grid grows and keeps what it had.
    let session = engine.session().unwrap();
    let after = session.grid.range();
    assert!(after.contains_range(&before));
    assert!(after.max_ix > before.max_ix);
    assert!(std::sync::Arc::ptr_eq(&prepared.arena, &session.arena));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mosaic.png");
    let summary = engine.save(&path).unwrap();
    let raster = image::open(&path).unwrap().to_rgb8();

    // Overlap x in [0, 32]: each side goes to the nearer optical centre.
    assert_eq!(sample(&raster, &summary, 8.0, 3.0), 40);
    assert_eq!(sample(&raster, &summary, 24.0, -3.0), 200);
    // Exclusive areas.
    assert_eq!(sample(&raster, &summary, -20.0, 10.0), 40);
    assert_eq!(sample(&raster, &summary, 50.0, -10.0), 200);

    // Observed pixels span the union footprint.
    assert_relative_eq!(summary.covered.min.x, -32.0, epsilon = 0.2);
    assert_relative_eq!(summary.covered.max.x, 64.0, epsilon = 0.2);
    assert_relative_eq!(summary.covered.min.y, -24.0, epsilon = 0.2);
    assert_relative_eq!(summary.covered.max.y, 24.0, epsilon = 0.2);
    assert!(summary.bounds.contains(&summary.covered));
}

#[test]
fn test_every_strategy_fuses_the_scenario() {
    for mode in [
        FusionMode::Flat,
        FusionMode::MultiBand,
        FusionMode::Device,
        FusionMode::SeamBatch,
    ] {
        let engine = MapFusion::new(FusionConfig {
            band_count: 4,
            ..config(mode)
        });
        let a = nadir_pose(Vector3::new(0.0, 0.0, HEIGHT));
        let b = nadir_pose(Vector3::new(FOOTPRINT_WIDTH / 2.0, 0.0, HEIGHT));
        engine
            .prepare(&SE3::identity(), &camera(), &[Frame::new(uniform(0), a)])
            .unwrap();
        assert!(engine.feed(uniform(40), a).is_accepted());
        assert!(engine.feed(uniform(200), b).is_accepted());
        assert!(engine.flush(Duration::from_secs(60)), "{:?} did not flush", mode);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mosaic.png");
        let summary = engine.save(&path).unwrap();
        let raster = image::open(&path).unwrap().to_rgb8();

        // Far from the overlap every strategy reproduces the source colour.
        let a_side = sample(&raster, &summary, -20.0, 0.0);
        let b_side = sample(&raster, &summary, 50.0, 0.0);
        assert!(a_side.abs_diff(40) <= 2, "{:?}: {}", mode, a_side);
        assert!(b_side.abs_diff(200) <= 2, "{:?}: {}", mode, b_side);
        assert_relative_eq!(summary.covered.min.x, -32.0, epsilon = 0.2);
        assert_relative_eq!(summary.covered.max.x, 64.0, epsilon = 0.2);
    }
}
