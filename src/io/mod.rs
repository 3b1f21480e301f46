//! Dataset loading for the binary.

pub mod dataset;

pub use dataset::{AerialDataset, PoseEntry};
