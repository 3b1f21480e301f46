//! Append-only tile storage addressed by stable [`TileId`]s.
//!
//! Grids hold ids, not tiles. Growing a grid builds a new id mapping over the
//! same arena, so tile payloads are never copied or moved.

use std::sync::Arc;

use parking_lot::RwLock;

use super::tile::Tile;
use super::types::{TileId, TileIndex};

pub struct TileArena<D> {
    tiles: RwLock<Vec<Arc<Tile<D>>>>,
}

impl<D> TileArena<D> {
    pub fn new() -> Self {
        Self {
            tiles: RwLock::new(Vec::new()),
        }
    }

    /// Create a tile and return its id.
    pub fn insert(&self, index: TileIndex, data: D) -> TileId {
        let mut tiles = self.tiles.write();
        let id = TileId::new(tiles.len() as u32);
        tiles.push(Arc::new(Tile::new(index, data)));
        id
    }

    pub fn get(&self, id: TileId) -> Option<Arc<Tile<D>>> {
        self.tiles.read().get(id.as_usize()).cloned()
    }

    pub fn len(&self) -> usize {
        self.tiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D> Default for TileArena<D> {
    fn default() -> Self {
        Self::new()
    }
}
