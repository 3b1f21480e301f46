//! Live tile viewer (feature `viz`).

pub mod rerun;

pub use self::rerun::RerunTileViewer;
