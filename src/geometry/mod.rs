//! Geometry utilities: SE3 transforms, pinhole camera, plane homographies and
//! the ground-plane projector.

pub mod camera;
pub mod homography;
pub mod projector;
pub mod se3;

pub use camera::CameraParameters;
pub use projector::{
    GroundProjection, MIN_DOWN_ALIGNMENT, ProjectionError, nadir_pose, project_frame,
};
pub use se3::SE3;
