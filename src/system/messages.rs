//! Values passed across the feed boundary and the consumer thread.

use image::RgbImage;

use crate::geometry::{ProjectionError, SE3};

/// A posed camera frame.
pub struct Frame {
    pub image: RgbImage,
    /// Camera pose in the world frame (`T_world_cam`).
    pub pose: SE3,
}

impl Frame {
    pub fn new(image: RgbImage, pose: SE3) -> Self {
        Self { image, pose }
    }
}

/// Result of handing a frame to `feed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Enqueued,
    /// Enqueued after evicting the oldest pending frame.
    EnqueuedDroppedOldest,
    NotPrepared,
    /// The batch strategy already ran its blend.
    Finished,
    Disconnected,
}

impl FeedOutcome {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Enqueued | Self::EnqueuedDroppedOldest)
    }
}

/// Why the consumer dropped a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRejection {
    NotPrepared,
    ImageSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    Projection(ProjectionError),
    /// Footprint spans more tiles than the session allows for one frame.
    FootprintTooLarge { span: usize, limit: usize },
    /// The grid was replaced while the frame was being merged.
    StaleGrid,
    Compositor(String),
}

impl std::fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPrepared => write!(f, "session not prepared"),
            Self::ImageSize { expected, actual } => write!(
                f,
                "image is {}x{}, camera expects {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Self::Projection(e) => write!(f, "projection failed: {}", e),
            Self::FootprintTooLarge { span, limit } => {
                write!(f, "footprint spans {} tiles, limit is {}", span, limit)
            }
            Self::StaleGrid => write!(f, "grid replaced during merge"),
            Self::Compositor(e) => write!(f, "compositor failed: {}", e),
        }
    }
}

impl std::error::Error for FrameRejection {}

impl From<ProjectionError> for FrameRejection {
    fn from(e: ProjectionError) -> Self {
        Self::Projection(e)
    }
}
