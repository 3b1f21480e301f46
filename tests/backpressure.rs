use std::time::Duration;

use image::{Rgb, RgbImage};
use nalgebra::Vector3;

use rust_mapfusion::config::{FusionConfig, FusionMode};
use rust_mapfusion::geometry::{CameraParameters, SE3, nadir_pose};
use rust_mapfusion::system::{FeedOutcome, Frame, FusionEngine, MapFusion};

const QUEUE: usize = 20;
const FED: usize = 35;

// 64 px at f = 50 from 50 m: 1 m per pixel, 64 m footprint.
fn camera() -> CameraParameters {
    CameraParameters::new(64, 48, 50.0, 50.0, 32.0, 24.0)
}

fn pose(i: usize) -> SE3 {
    nadir_pose(Vector3::new(100.0 * i as f64, 0.0, 50.0))
}

#[test]
fn test_stalled_consumer_keeps_latest_frames() {
    let engine = MapFusion::new(FusionConfig {
        mode: FusionMode::Flat,
        queue_size: QUEUE,
        poll_interval_ms: 1,
        ..FusionConfig::default()
    });
    engine
        .prepare(&SE3::identity(), &camera(), &[Frame::new(RgbImage::new(64, 48), pose(0))])
        .unwrap();
    engine.set_paused(true);

    for i in 0..FED {
        let outcome = engine.feed(RgbImage::from_pixel(64, 48, Rgb([i as u8, 0, 0])), pose(i));
        if i < QUEUE {
            assert_eq!(outcome, FeedOutcome::Enqueued);
        } else {
            assert_eq!(outcome, FeedOutcome::EnqueuedDroppedOldest);
        }
        assert!(engine.queue_size() <= QUEUE);
    }
    assert_eq!(engine.queue_size(), QUEUE);
    let stats = engine.stats();
    assert_eq!((stats.fed, stats.evicted, stats.merged), (FED as u64, (FED - QUEUE) as u64, 0));

    engine.set_paused(false);
    assert!(engine.flush(Duration::from_secs(30)));
    assert_eq!(engine.queue_size(), 0);
    assert_eq!(engine.stats().merged, QUEUE as u64);

    // Only frames 15..35 reached the map.
    let dir = tempfile::tempdir().unwrap();
    let summary = engine.save(&dir.path().join("latest.png")).unwrap();
    let first = 100.0 * (FED - QUEUE) as f64;
    let last = 100.0 * (FED - 1) as f64;
    approx::assert_relative_eq!(summary.covered.min.x, first - 32.0, epsilon = 1.5);
    approx::assert_relative_eq!(summary.covered.max.x, last + 32.0, epsilon = 1.5);
}
