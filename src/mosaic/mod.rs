//! Mosaic - the spatial structure holding the growing orthomosaic.
//!
//! - [`MapLayout`]: resolution, tile size and ground plane fixed at `prepare`.
//! - [`TileArena`]: append-only tile storage addressed by [`TileId`].
//! - [`TileGrid`]: immutable index over the arena; growth builds a new grid.
//! - [`Tile`]: one 256×256 cell with its own lock and a "changed" flag.

pub mod arena;
pub mod bbox;
pub mod grid;
pub mod layout;
pub mod tile;
pub mod types;

pub use arena::TileArena;
pub use bbox::BoundingBox;
pub use grid::{NEIGHBOR_OFFSETS, TileGrid};
pub use layout::MapLayout;
pub use tile::Tile;
pub use types::{TILE_SIZE, TileId, TileIndex, TileRange};
