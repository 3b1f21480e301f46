pub mod config;
pub mod fusion;
pub mod geometry;
pub mod io;
pub mod mosaic;
pub mod render;
pub mod system;
#[cfg(feature = "viz")]
pub mod viz;
