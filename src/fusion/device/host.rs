//! Host-memory device backend.
//!
//! Buffers and uploaded frames live in backend-owned maps; a `write_bands`
//! dispatch runs the tile kernel over every argument entry in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Result, bail};
use image::{RgbImage, RgbaImage};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::debug;

use crate::fusion::homography_for_tile;
use crate::fusion::multiband::PyramidTile;
use crate::fusion::pyramid::{gaussian_pyramid, laplacian_pyramid};
use crate::fusion::warp::{has_weight_in, warp_region};
use crate::fusion::weight::WeightImage;
use crate::mosaic::TILE_SIZE;

use super::{DeviceBackend, DeviceBufferId, DeviceFrameId, TileKernelArgs};

/// Released buffers kept for reuse.
const MAX_RECYCLED: usize = 64;

struct UploadedFrame {
    image: RgbImage,
    mask: WeightImage,
}

type Storage = Arc<Mutex<PyramidTile>>;

pub struct HostDevice {
    band_count: usize,
    next_id: AtomicU64,
    buffers: RwLock<HashMap<DeviceBufferId, Storage>>,
    frames: RwLock<HashMap<DeviceFrameId, Arc<UploadedFrame>>>,
    recycled: Mutex<Vec<Storage>>,
}

impl HostDevice {
    pub fn new(band_count: usize) -> Self {
        Self {
            band_count: band_count.max(1),
            next_id: AtomicU64::new(0),
            buffers: RwLock::new(HashMap::new()),
            frames: RwLock::new(HashMap::new()),
            recycled: Mutex::new(Vec::new()),
        }
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.read().len()
    }

    pub fn live_frames(&self) -> usize {
        self.frames.read().len()
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Warp one tile from the uploaded frame, decompose it and merge it.
    fn run_kernel(&self, frame: &UploadedFrame, args: &TileKernelArgs, storage: &Storage) -> usize {
        let h = homography_for_tile(&args.map_to_image, args.origin);
        let (image, weight) = warp_region(&frame.image, &frame.mask, &h, TILE_SIZE, TILE_SIZE);

        let mut tile = storage.lock();
        if args.fresh {
            *tile = PyramidTile::new(self.band_count);
        }
        if !has_weight_in(&weight, 0, 0, TILE_SIZE) {
            return 0;
        }
        let bands = laplacian_pyramid(&image, self.band_count);
        let weights = gaussian_pyramid(&weight, self.band_count);
        (0..tile.band_count())
            .map(|l| tile.merge_level(l, &bands[l], &weights[l], 0, 0))
            .sum()
    }
}

impl DeviceBackend for HostDevice {
    fn name(&self) -> &'static str {
        "host"
    }

    fn allocate(&self) -> Result<DeviceBufferId> {
        let storage = self
            .recycled
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(Mutex::new(PyramidTile::new(self.band_count))));
        let id = DeviceBufferId(self.next());
        self.buffers.write().insert(id, storage);
        Ok(id)
    }

    fn upload_frame(&self, image: &RgbImage, mask: &WeightImage) -> Result<DeviceFrameId> {
        if image.dimensions() != mask.dimensions() {
            bail!(
                "frame {:?} and weight mask {:?} differ in size",
                image.dimensions(),
                mask.dimensions()
            );
        }
        let id = DeviceFrameId(self.next());
        let frame = UploadedFrame {
            image: image.clone(),
            mask: mask.clone(),
        };
        self.frames.write().insert(id, Arc::new(frame));
        Ok(id)
    }

    fn write_bands(&self, frame: DeviceFrameId, args: &[TileKernelArgs]) -> Result<Vec<usize>> {
        let Some(uploaded) = self.frames.read().get(&frame).cloned() else {
            bail!("frame {:?} is not resident", frame);
        };
        let storages: Vec<Storage> = {
            let buffers = self.buffers.read();
            args.iter()
                .map(|a| buffers.get(&a.buffer).cloned())
                .collect::<Option<_>>()
                .ok_or_else(|| anyhow::anyhow!("dispatch references a released buffer"))?
        };

        let adopted: Vec<usize> = args
            .par_iter()
            .zip(storages.par_iter())
            .map(|(a, s)| self.run_kernel(&uploaded, a, s))
            .collect();
        debug!(
            "Host dispatch: {} tiles, {} coefficients adopted",
            args.len(),
            adopted.iter().sum::<usize>()
        );
        Ok(adopted)
    }

    fn export_for_display(&self, buffer: DeviceBufferId) -> Option<RgbaImage> {
        let storage = self.buffers.read().get(&buffer).cloned()?;
        let tile = storage.lock();
        if !tile.has_coverage() {
            return None;
        }
        Some(tile.texture(&tile.reconstruct()))
    }

    fn release(&self, buffer: DeviceBufferId) {
        if let Some(storage) = self.buffers.write().remove(&buffer) {
            let mut recycled = self.recycled.lock();
            if recycled.len() < MAX_RECYCLED {
                recycled.push(storage);
            }
        }
    }

    fn release_frame(&self, frame: DeviceFrameId) {
        self.frames.write().remove(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use nalgebra::Matrix3;

    #[test]
    fn test_fresh_flag_clears_recycled_buffer() {
        let device = HostDevice::new(3);
        let image = RgbImage::from_pixel(512, 512, Rgb([90, 90, 90]));
        let mask = WeightImage::from_pixel(512, 512, Luma([0.5]));
        let frame = device.upload_frame(&image, &mask).unwrap();

        // Identity inverse warp: map pixel (u, v) samples image pixel (u, v).
        let args = |buffer, fresh| TileKernelArgs {
            buffer,
            fresh,
            map_to_image: Matrix3::identity(),
            origin: (0, 0),
        };

        let a = device.allocate().unwrap();
        let adopted = device.write_bands(frame, &[args(a, true)]).unwrap();
        assert!(adopted[0] > 0);
        assert!(device.export_for_display(a).is_some());
        device.release(a);

        // The recycled storage still holds data, but `fresh` wipes it.
        let b = device.allocate().unwrap();
        let off_frame = TileKernelArgs {
            origin: (4096, 4096),
            ..args(b, true)
        };
        assert_eq!(device.write_bands(frame, &[off_frame]).unwrap(), vec![0]);
        assert!(device.export_for_display(b).is_none());

        device.release_frame(frame);
        assert!(device.write_bands(frame, &[args(b, false)]).is_err());
    }
}
