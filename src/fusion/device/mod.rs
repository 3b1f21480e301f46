//! Device-resident compositing.
//!
//! Band storage lives behind a [`DeviceBackend`]: tiles only hold a buffer
//! handle, each frame is uploaded once, and all tiles touched by a frame are
//! composited by one batched `write_bands` dispatch. The merge contract is the
//! multi-band one (per-level max-weight-wins).

pub mod host;

use std::sync::Arc;

use anyhow::Result;
use image::{RgbImage, RgbaImage};
use nalgebra::Matrix3;
use tracing::warn;

use crate::fusion::warp::footprint_touches;
use crate::fusion::weight::{WeightImage, WeightMaskCache};
use crate::fusion::{Compositor, FrameInput, Neighbors, TileTarget};
use crate::geometry::GroundProjection;
use crate::mosaic::{MapLayout, Tile, TileIndex};

pub use host::HostDevice;

/// Handle of a band buffer owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBufferId(pub u64);

/// Handle of an uploaded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceFrameId(pub u64);

/// Per-tile entry of a batched kernel call.
#[derive(Debug, Clone, Copy)]
pub struct TileKernelArgs {
    pub buffer: DeviceBufferId,
    /// Buffer was just allocated and holds no data yet.
    pub fresh: bool,
    /// Inverse warp: map pixel → source image pixel.
    pub map_to_image: Matrix3<f64>,
    /// Map-pixel offset of the tile's top-left corner.
    pub origin: (i64, i64),
}

/// Capability interface of a compositing device.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate a band buffer. Its contents are undefined until the first
    /// `write_bands` entry marked `fresh`.
    fn allocate(&self) -> Result<DeviceBufferId>;

    /// Upload a frame and its weight mask once, for use by `write_bands`.
    fn upload_frame(&self, image: &RgbImage, mask: &WeightImage) -> Result<DeviceFrameId>;

    /// Composite `frame` into every listed buffer in one dispatch.
    /// Returns the number of adopted coefficients per entry.
    fn write_bands(&self, frame: DeviceFrameId, args: &[TileKernelArgs]) -> Result<Vec<usize>>;

    /// Reconstructed RGBA texture of a buffer; `None` if it holds no data.
    fn export_for_display(&self, buffer: DeviceBufferId) -> Option<RgbaImage>;

    fn release(&self, buffer: DeviceBufferId);

    fn release_frame(&self, frame: DeviceFrameId);
}

/// Tile payload: a lazily allocated device buffer, released on drop.
pub struct DeviceTile {
    backend: Arc<dyn DeviceBackend>,
    buffer: Option<DeviceBufferId>,
}

impl DeviceTile {
    pub fn buffer(&self) -> Option<DeviceBufferId> {
        self.buffer
    }
}

impl Drop for DeviceTile {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.backend.release(buffer);
        }
    }
}

/// Uploaded frame, released from the device when dropped.
pub struct DeviceFrame {
    backend: Arc<dyn DeviceBackend>,
    id: DeviceFrameId,
    projection: GroundProjection,
    layout: MapLayout,
}

impl Drop for DeviceFrame {
    fn drop(&mut self) {
        self.backend.release_frame(self.id);
    }
}

pub struct DeviceCompositor {
    backend: Arc<dyn DeviceBackend>,
    masks: WeightMaskCache,
}

impl DeviceCompositor {
    pub fn new(backend: Arc<dyn DeviceBackend>, weight_exponent: f64) -> Self {
        Self {
            backend,
            masks: WeightMaskCache::new(weight_exponent),
        }
    }
}

impl Compositor for DeviceCompositor {
    type TileData = DeviceTile;
    type Frame = DeviceFrame;

    fn name(&self) -> &'static str {
        "device"
    }

    fn new_tile(&self, _index: TileIndex) -> DeviceTile {
        DeviceTile {
            backend: Arc::clone(&self.backend),
            buffer: None,
        }
    }

    fn prepare_frame(&self, input: &FrameInput<'_>) -> Result<DeviceFrame> {
        let (w, h) = input.image.dimensions();
        let mask = self.masks.get(&input.layout.camera, w, h);
        let id = self.backend.upload_frame(input.image, &mask)?;
        Ok(DeviceFrame {
            backend: Arc::clone(&self.backend),
            id,
            projection: input.projection.clone(),
            layout: input.layout.clone(),
        })
    }

    fn touches(&self, frame: &DeviceFrame, index: TileIndex) -> bool {
        footprint_touches(&frame.projection, &frame.layout, index)
    }

    fn merge(&self, frame: &DeviceFrame, targets: &[TileTarget<DeviceTile>]) -> usize {
        let map_to_image = frame.projection.map_pixel_to_image(frame.layout.resolution);

        let mut args = Vec::with_capacity(targets.len());
        for (index, tile) in targets {
            let mut data = tile.lock();
            let fresh = data.buffer.is_none();
            let buffer = match data.buffer {
                Some(buffer) => buffer,
                None => match self.backend.allocate() {
                    Ok(buffer) => {
                        data.buffer = Some(buffer);
                        buffer
                    }
                    Err(e) => {
                        warn!("Device allocation failed for tile {}: {:#}", index, e);
                        continue;
                    }
                },
            };
            args.push((
                tile,
                TileKernelArgs {
                    buffer,
                    fresh,
                    map_to_image,
                    origin: frame.layout.tile_origin_px(*index),
                },
            ));
        }

        let kernel_args: Vec<TileKernelArgs> = args.iter().map(|(_, a)| *a).collect();
        let adopted = match self.backend.write_bands(frame.id, &kernel_args) {
            Ok(adopted) => adopted,
            Err(e) => {
                warn!("Device dispatch failed on {}: {:#}", self.backend.name(), e);
                // A buffer allocated for this dispatch never had its `fresh`
                // entry run, so it may still hold a recycled tile's bands.
                for (tile, a) in args.iter().filter(|(_, a)| a.fresh) {
                    tile.lock().buffer = None;
                    self.backend.release(a.buffer);
                }
                return 0;
            }
        };

        let mut changed = 0;
        for ((tile, _), n) in args.iter().zip(adopted) {
            if n > 0 {
                tile.mark_changed();
                changed += 1;
            }
        }
        changed
    }

    fn render(&self, tile: &Tile<DeviceTile>, _neighbors: Option<&Neighbors<DeviceTile>>) -> Option<RgbaImage> {
        let buffer = tile.lock().buffer?;
        self.backend.export_for_display(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::flat::FlatCompositor;
    use crate::fusion::warp::footprint_range;
    use crate::geometry::{CameraParameters, SE3, nadir_pose, project_frame};
    use crate::mosaic::{TileArena, TileGrid};
    use image::Rgb;
    use nalgebra::Vector3;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Host device whose dispatches can be made to fail.
    struct FlakyDevice {
        host: HostDevice,
        fail: AtomicBool,
    }

    impl DeviceBackend for FlakyDevice {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn allocate(&self) -> Result<DeviceBufferId> {
            self.host.allocate()
        }

        fn upload_frame(&self, image: &RgbImage, mask: &WeightImage) -> Result<DeviceFrameId> {
            self.host.upload_frame(image, mask)
        }

        fn write_bands(&self, frame: DeviceFrameId, args: &[TileKernelArgs]) -> Result<Vec<usize>> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("device lost");
            }
            self.host.write_bands(frame, args)
        }

        fn export_for_display(&self, buffer: DeviceBufferId) -> Option<RgbaImage> {
            self.host.export_for_display(buffer)
        }

        fn release(&self, buffer: DeviceBufferId) {
            self.host.release(buffer);
        }

        fn release_frame(&self, frame: DeviceFrameId) {
            self.host.release_frame(frame);
        }
    }

    fn scene() -> (MapLayout, RgbImage, GroundProjection) {
        let camera = CameraParameters::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let layout = MapLayout::new(SE3::identity(), camera, 0.1);
        let image = RgbImage::from_fn(640, 480, |x, y| Rgb([(x % 200) as u8, (y % 200) as u8, 77]));
        let projection = project_frame(&camera, &nadir_pose(Vector3::new(4.0, 2.0, 50.0))).unwrap();
        (layout, image, projection)
    }

    fn fuse<C: Compositor>(c: &C, layout: &MapLayout, image: &RgbImage, projection: &GroundProjection)
        -> Vec<(TileIndex, Option<RgbaImage>)>
    {
        let range = footprint_range(projection, layout);
        let arena = TileArena::new();
        let grid = TileGrid::new(range);
        let frame = c
            .prepare_frame(&FrameInput { image, projection, layout })
            .unwrap();
        let targets: Vec<_> = range
            .iter()
            .filter(|i| c.touches(&frame, *i))
            .filter_map(|i| grid.tile_at(&arena, i, || c.new_tile(i)).map(|(_, t)| (i, t)))
            .collect();
        assert!(c.merge(&frame, &targets) > 0);
        targets.iter().map(|(i, t)| (*i, c.render(t, None))).collect()
    }

    #[test]
    fn test_single_band_device_tracks_flat() {
        let (layout, image, projection) = scene();
        let device = DeviceCompositor::new(Arc::new(HostDevice::new(1)), 1.0);
        let flat = FlatCompositor::new(1.0);

        let a: HashMap<_, _> = fuse(&device, &layout, &image, &projection).into_iter().collect();
        let b = fuse(&flat, &layout, &image, &projection);

        let (mut total, mut close) = (0usize, 0usize);
        for (index, tb) in &b {
            let (Some(ta), Some(tb)) = (a.get(index).and_then(|t| t.as_ref()), tb.as_ref()) else {
                panic!("tile {index} missing");
            };
            for (p, q) in ta.pixels().zip(tb.pixels()) {
                if q.0[3] == 255 {
                    total += 1;
                    if p.0[3] == 255 && (0..3).all(|c| p.0[c].abs_diff(q.0[c]) <= 1) {
                        close += 1;
                    }
                }
            }
        }
        assert!(close as f64 >= 0.999 * total as f64, "{close}/{total}");
    }

    #[test]
    fn test_buffers_allocated_lazily_and_released() {
        let (layout, image, projection) = scene();
        let backend = Arc::new(HostDevice::new(4));
        let device = DeviceCompositor::new(backend.clone(), 1.0);

        let tile = Tile::new(TileIndex::new(0, 0), device.new_tile(TileIndex::new(0, 0)));
        assert!(tile.lock().buffer().is_none());
        assert_eq!(backend.live_buffers(), 0);

        let tiles = fuse(&device, &layout, &image, &projection);
        assert!(tiles.iter().any(|(_, t)| t.is_some()));
        // Tiles (and their buffers) were dropped with the arena inside `fuse`.
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_frames(), 0);
    }

    #[test]
    fn test_failed_dispatch_detaches_new_buffer() {
        let (layout, image, projection) = scene();
        let backend = Arc::new(FlakyDevice {
            host: HostDevice::new(3),
            fail: AtomicBool::new(false),
        });
        let device = DeviceCompositor::new(backend.clone(), 1.0);

        // Leaves recycled buffers holding bands behind.
        assert!(fuse(&device, &layout, &image, &projection).iter().any(|(_, t)| t.is_some()));
        assert_eq!(backend.host.live_buffers(), 0);

        backend.fail.store(true, Ordering::SeqCst);
        let index = TileIndex::new(0, 0);
        let tile = Arc::new(Tile::new(index, device.new_tile(index)));
        let frame = device
            .prepare_frame(&FrameInput {
                image: &image,
                projection: &projection,
                layout: &layout,
            })
            .unwrap();
        assert_eq!(device.merge(&frame, &[(index, Arc::clone(&tile))]), 0);

        assert!(tile.lock().buffer().is_none());
        assert!(device.render(&tile, None).is_none());
        assert!(!tile.is_changed());
        assert_eq!(backend.host.live_buffers(), 0);

        // Once the device is back the tile starts from a clean buffer.
        backend.fail.store(false, Ordering::SeqCst);
        assert_eq!(device.merge(&frame, &[(index, Arc::clone(&tile))]), 1);
        assert!(device.render(&tile, None).is_some());
    }
}
