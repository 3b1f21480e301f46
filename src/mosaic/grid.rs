//! TileGrid - the growable 2-D index over the tile arena.
//!
//! A grid's shape is fixed at construction. Slots are filled lazily (set once)
//! the first time a tile is requested. Growth never mutates a grid: `spread`
//! builds a larger grid carrying the same tile ids at their new offsets, and
//! the caller publishes it in place of the old one.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::arena::TileArena;
use super::tile::Tile;
use super::types::{TileId, TileIndex, TileRange};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Offsets of the 8 neighbours, in row-major order around the centre.
pub const NEIGHBOR_OFFSETS: [(i64, i64); 8] = [
    (-1, 1),
    (0, 1),
    (1, 1),
    (-1, 0),
    (1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

pub struct TileGrid {
    range: TileRange,
    slots: Box<[OnceLock<TileId>]>,
    /// Unique per constructed grid; identifies the grid across snapshots.
    generation: u64,
}

impl TileGrid {
    /// Empty grid covering `range`.
    pub fn new(range: TileRange) -> Self {
        let slots = (0..range.len()).map(|_| OnceLock::new()).collect();
        Self {
            range,
            slots,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn range(&self) -> TileRange {
        self.range
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, index: TileIndex) -> bool {
        self.range.contains(index)
    }

    pub fn covers(&self, range: &TileRange) -> bool {
        self.range.contains_range(range)
    }

    /// Id of the tile at `index`, if one has been created.
    pub fn get(&self, index: TileIndex) -> Option<TileId> {
        let slot = self.range.slot(index)?;
        self.slots[slot].get().copied()
    }

    /// Tile at `index`, if one has been created.
    pub fn tile<D>(&self, arena: &TileArena<D>, index: TileIndex) -> Option<Arc<Tile<D>>> {
        arena.get(self.get(index)?)
    }

    /// Tile at `index`, creating an empty one on first access.
    ///
    /// Returns `None` when `index` lies outside the grid.
    pub fn tile_at<D>(
        &self,
        arena: &TileArena<D>,
        index: TileIndex,
        init: impl FnOnce() -> D,
    ) -> Option<(TileId, Arc<Tile<D>>)> {
        let slot = self.range.slot(index)?;
        let id = *self.slots[slot].get_or_init(|| arena.insert(index, init()));
        arena.get(id).map(|tile| (id, tile))
    }

    /// Grid grown to cover `target` as well, or `None` if already covered.
    ///
    /// Existing tile ids are carried over to their new slots; tiles are not touched.
    pub fn spread(&self, target: &TileRange) -> Option<TileGrid> {
        if self.covers(target) {
            return None;
        }
        let grown = TileGrid::new(self.range.union(target));
        for (index, id) in self.occupied() {
            if let Some(slot) = grown.range.slot(index) {
                // Freshly built grid: every slot is empty.
                let _ = grown.slots[slot].set(id);
            }
        }
        Some(grown)
    }

    /// Created tiles, in raster order.
    pub fn occupied(&self) -> impl Iterator<Item = (TileIndex, TileId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, cell)| cell.get().map(|id| (self.range.index_of_slot(slot), *id)))
    }

    pub fn num_occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    /// The 8 neighbours of `index` in [`NEIGHBOR_OFFSETS`] order.
    pub fn neighbors<D>(
        &self,
        arena: &TileArena<D>,
        index: TileIndex,
    ) -> [Option<Arc<Tile<D>>>; 8] {
        NEIGHBOR_OFFSETS.map(|(dx, dy)| self.tile(arena, index.offset(dx, dy)))
    }
}

impl std::fmt::Debug for TileGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileGrid")
            .field("range", &self.range)
            .field("occupied", &self.num_occupied())
            .field("generation", &self.generation)
            .finish()
    }
}
