//! Core index types for the tile mosaic.

/// Side length of every tile, in pixels.
pub const TILE_SIZE: u32 = 256;

/// Handle of a tile inside the [`TileArena`](super::TileArena).
///
/// Ids are assigned sequentially when tiles are created and stay valid for
/// the lifetime of the session, independent of the grid that indexes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(pub u32);

impl TileId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tile#{}", self.0)
    }
}

/// World-anchored tile coordinates: tile `(ix, iy)` covers
/// `[ix·T, (ix+1)·T) × [iy·T, (iy+1)·T)` on the ground plane.
///
/// Unlike a grid slot, a tile's index never changes when the grid grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex {
    pub ix: i64,
    pub iy: i64,
}

impl TileIndex {
    pub fn new(ix: i64, iy: i64) -> Self {
        Self { ix, iy }
    }

    pub fn offset(self, dx: i64, dy: i64) -> Self {
        Self::new(self.ix + dx, self.iy + dy)
    }
}

impl std::fmt::Display for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.ix, self.iy)
    }
}

/// Inclusive rectangle of tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRange {
    pub min_ix: i64,
    pub min_iy: i64,
    pub max_ix: i64,
    pub max_iy: i64,
}

impl TileRange {
    /// Range spanning two corner indices in any order.
    pub fn spanning(a: TileIndex, b: TileIndex) -> Self {
        Self {
            min_ix: a.ix.min(b.ix),
            min_iy: a.iy.min(b.iy),
            max_ix: a.ix.max(b.ix),
            max_iy: a.iy.max(b.iy),
        }
    }

    pub fn single(index: TileIndex) -> Self {
        Self::spanning(index, index)
    }

    pub fn cols(&self) -> usize {
        (self.max_ix - self.min_ix + 1) as usize
    }

    pub fn rows(&self) -> usize {
        (self.max_iy - self.min_iy + 1) as usize
    }

    pub fn len(&self) -> usize {
        self.cols() * self.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: TileIndex) -> bool {
        index.ix >= self.min_ix
            && index.ix <= self.max_ix
            && index.iy >= self.min_iy
            && index.iy <= self.max_iy
    }

    pub fn contains_range(&self, other: &TileRange) -> bool {
        self.contains(TileIndex::new(other.min_ix, other.min_iy))
            && self.contains(TileIndex::new(other.max_ix, other.max_iy))
    }

    pub fn union(&self, other: &TileRange) -> Self {
        Self {
            min_ix: self.min_ix.min(other.min_ix),
            min_iy: self.min_iy.min(other.min_iy),
            max_ix: self.max_ix.max(other.max_ix),
            max_iy: self.max_iy.max(other.max_iy),
        }
    }

    pub fn padded(&self, tiles: i64) -> Self {
        Self {
            min_ix: self.min_ix - tiles,
            min_iy: self.min_iy - tiles,
            max_ix: self.max_ix + tiles,
            max_iy: self.max_iy + tiles,
        }
    }

    /// Row-major slot of `index`, with row 0 at `max_iy` (north-up raster order).
    pub fn slot(&self, index: TileIndex) -> Option<usize> {
        if !self.contains(index) {
            return None;
        }
        let row = (self.max_iy - index.iy) as usize;
        let col = (index.ix - self.min_ix) as usize;
        Some(row * self.cols() + col)
    }

    /// Tile index of a row-major slot.
    pub fn index_of_slot(&self, slot: usize) -> TileIndex {
        let cols = self.cols();
        let row = (slot / cols) as i64;
        let col = (slot % cols) as i64;
        TileIndex::new(self.min_ix + col, self.max_iy - row)
    }

    /// All indices in raster order (north row first, west to east).
    pub fn iter(&self) -> impl Iterator<Item = TileIndex> + '_ {
        (0..self.len()).map(move |s| self.index_of_slot(s))
    }
}
