use std::path::Path;
use std::time::Duration;

use image::{Rgb, RgbImage};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rust_mapfusion::config::{FusionConfig, FusionMode};
use rust_mapfusion::geometry::{CameraParameters, SE3, nadir_pose};
use rust_mapfusion::system::{Frame, FusionEngine, MapFusion};

fn camera() -> CameraParameters {
    CameraParameters::new(320, 240, 250.0, 250.0, 160.0, 120.0)
}

fn noise(rng: &mut StdRng) -> RgbImage {
    RgbImage::from_fn(320, 240, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]))
}

/// Nadir pose rotated by `yaw` about the optical axis.
fn yawed(position: Vector3<f64>, yaw: f64) -> SE3 {
    let half = yaw / 2.0;
    nadir_pose(position).compose(&SE3::from_quaternion(half.cos(), 0.0, 0.0, half.sin(), Vector3::zeros()))
}

fn fuse(mode: FusionMode, band_count: usize, frames: &[(RgbImage, SE3)], out: &Path) -> RgbImage {
    let engine = MapFusion::new(FusionConfig {
        mode,
        band_count,
        poll_interval_ms: 1,
        ..FusionConfig::default()
    });
    let initial: Vec<Frame> = frames
        .iter()
        .map(|(image, pose)| Frame::new(image.clone(), *pose))
        .collect();
    engine.prepare(&SE3::identity(), &camera(), &initial).unwrap();
    for (image, pose) in frames {
        assert!(engine.feed(image.clone(), *pose).is_accepted());
    }
    assert!(engine.flush(Duration::from_secs(60)));
    engine.save(out).unwrap();
    image::open(out).unwrap().to_rgb8()
}

#[test]
fn test_single_band_multi_band_equals_flat() {
    let mut rng = StdRng::seed_from_u64(7);
    let frames = vec![
        (noise(&mut rng), nadir_pose(Vector3::new(0.0, 0.0, 40.0))),
        (noise(&mut rng), yawed(Vector3::new(15.0, -8.0, 40.0), 0.4)),
        (noise(&mut rng), yawed(Vector3::new(-6.0, 12.0, 42.0), -1.1)),
    ];
    let dir = tempfile::tempdir().unwrap();

    let flat = fuse(FusionMode::Flat, 6, &frames, &dir.path().join("flat.png"));
    let single = fuse(FusionMode::MultiBand, 1, &frames, &dir.path().join("single.png"));
    assert_eq!(flat.dimensions(), single.dimensions());
    assert!(flat == single);
}

#[test]
fn test_multi_band_differs_from_flat_only_near_seams() {
    let mut rng = StdRng::seed_from_u64(11);
    let frames = vec![
        (noise(&mut rng), nadir_pose(Vector3::new(0.0, 0.0, 40.0))),
        (noise(&mut rng), nadir_pose(Vector3::new(30.0, 0.0, 40.0))),
    ];
    let dir = tempfile::tempdir().unwrap();

    let flat = fuse(FusionMode::Flat, 6, &frames, &dir.path().join("flat.png"));
    let bands = fuse(FusionMode::MultiBand, 4, &frames, &dir.path().join("bands.png"));
    assert_eq!(flat.dimensions(), bands.dimensions());

    // Away from footprint borders and the seam, the Laplacian bands of a
    // single owner collapse back to that owner's pixels.
    let identical = flat
        .pixels()
        .zip(bands.pixels())
        .filter(|(a, b)| a.0.iter().zip(b.0.iter()).all(|(x, y)| x.abs_diff(*y) <= 1))
        .count();
    let total = flat.pixels().count();
    assert!(identical > total / 2, "{identical}/{total}");
}
