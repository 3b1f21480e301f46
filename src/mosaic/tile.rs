//! Tile - one 256×256 cell of the mosaic.
//!
//! A tile owns its pixel payload behind its own mutex so the fusion thread can
//! merge into one tile while a renderer reads another. The payload type `D` is
//! chosen by the compositor (flat buffer, band pyramid, device handle).

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

use super::types::TileIndex;

pub struct Tile<D> {
    index: TileIndex,
    data: Mutex<D>,
    /// Cached display texture is stale.
    changed: AtomicBool,
    /// At least one merge wrote data.
    covered: AtomicBool,
    /// A texture has been handed to the renderer at least once.
    textured: AtomicBool,
}

impl<D> Tile<D> {
    pub fn new(index: TileIndex, data: D) -> Self {
        Self {
            index,
            data: Mutex::new(data),
            changed: AtomicBool::new(false),
            covered: AtomicBool::new(false),
            textured: AtomicBool::new(false),
        }
    }

    /// World-anchored tile coordinates.
    pub fn index(&self) -> TileIndex {
        self.index
    }

    /// Lock the payload for reading or merging.
    pub fn lock(&self) -> MutexGuard<'_, D> {
        self.data.lock()
    }

    /// Record that a merge changed the payload.
    pub fn mark_changed(&self) {
        self.covered.store(true, Ordering::Release);
        self.changed.store(true, Ordering::Release);
    }

    /// Flag the texture for re-upload without recording new data.
    pub fn invalidate(&self) {
        self.changed.store(true, Ordering::Release);
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Clear the changed flag, returning its previous value.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    pub fn is_covered(&self) -> bool {
        self.covered.load(Ordering::Acquire)
    }

    pub fn set_textured(&self) {
        self.textured.store(true, Ordering::Release);
    }

    pub fn is_textured(&self) -> bool {
        self.textured.load(Ordering::Acquire)
    }
}

impl<D> std::fmt::Debug for Tile<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("index", &self.index)
            .field("changed", &self.is_changed())
            .field("covered", &self.is_covered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changed_flag_lifecycle() {
        let tile = Tile::new(TileIndex::new(0, 0), 0u8);
        assert!(!tile.is_covered());
        assert!(!tile.take_changed());

        *tile.lock() = 5;
        tile.mark_changed();
        assert!(tile.is_covered());
        assert!(tile.take_changed());
        assert!(!tile.is_changed());
        assert!(tile.is_covered());
        assert_eq!(*tile.lock(), 5);
    }
}
