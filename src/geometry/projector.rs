//! Ground-plane projector.
//!
//! Casts the four image-corner rays of a posed camera onto the z = 0 plane
//! and derives the pixel ↔ ground homographies used by the warp stage.
//!
//! The "down" axis is chosen from the sign of the camera height, so the same
//! code serves z-up (ENU-like) and z-down (NED-like) plane frames.

use nalgebra::{Matrix3, Vector2, Vector3};

use super::homography::{self, map_pixel_to_ground};
use super::{CameraParameters, SE3};

/// Minimum cosine between a corner ray and the down axis.
///
/// Below this the view is too close to grazing (or looks away from the
/// ground) and the whole frame is rejected.
pub const MIN_DOWN_ALIGNMENT: f64 = 0.4;

/// Why a frame could not be projected onto the ground plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProjectionError {
    /// The camera centre lies on the plane.
    OnPlane,
    /// A corner ray is too far from the down axis.
    GrazingView { corner: usize, alignment: f64 },
    /// The image ↔ ground homography is singular.
    SingularHomography,
}

impl std::fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnPlane => write!(f, "camera centre lies on the ground plane"),
            Self::GrazingView { corner, alignment } => write!(
                f,
                "corner {} ray alignment {:.3} below {:.1}",
                corner, alignment, MIN_DOWN_ALIGNMENT
            ),
            Self::SingularHomography => write!(f, "singular ground homography"),
        }
    }
}

impl std::error::Error for ProjectionError {}

/// A frame's footprint on the ground plane.
#[derive(Debug, Clone)]
pub struct GroundProjection {
    /// Ground-plane footprint, in image-corner order (TL, TR, BR, BL).
    pub corners: [Vector2<f64>; 4],
    /// Camera centre in the plane frame.
    pub camera_position: Vector3<f64>,
    /// Ground (x, y) → image pixel.
    pub ground_to_image: Matrix3<f64>,
    /// Image pixel → ground (x, y).
    pub image_to_ground: Matrix3<f64>,
}

impl GroundProjection {
    /// Axis-aligned bounds of the footprint as (min, max).
    pub fn bounds(&self) -> (Vector2<f64>, Vector2<f64>) {
        let mut min = self.corners[0];
        let mut max = self.corners[0];
        for c in &self.corners[1..] {
            min = min.inf(c);
            max = max.sup(c);
        }
        (min, max)
    }

    /// Map pixel (u, v) → image pixel, at the given resolution.
    pub fn map_pixel_to_image(&self, resolution: f64) -> Matrix3<f64> {
        self.ground_to_image * map_pixel_to_ground(resolution)
    }
}

/// Project a camera with pose `T_plane_cam` onto the ground plane.
pub fn project_frame(
    camera: &CameraParameters,
    t_plane_cam: &SE3,
) -> Result<GroundProjection, ProjectionError> {
    let c = t_plane_cam.translation;
    if c.z.abs() < 1e-9 {
        return Err(ProjectionError::OnPlane);
    }
    let down = if c.z > 0.0 {
        Vector3::new(0.0, 0.0, -1.0)
    } else {
        Vector3::new(0.0, 0.0, 1.0)
    };

    let mut corners = [Vector2::zeros(); 4];
    for (i, px) in camera.image_corners().iter().enumerate() {
        let ray = t_plane_cam.transform_vector(&camera.unproject(*px)).normalize();
        let alignment = ray.dot(&down);
        if alignment < MIN_DOWN_ALIGNMENT {
            return Err(ProjectionError::GrazingView {
                corner: i,
                alignment,
            });
        }
        let s = -c.z / ray.z;
        let hit = c + ray * s;
        corners[i] = Vector2::new(hit.x, hit.y);
    }

    let ground_to_image = homography::ground_to_image(camera, t_plane_cam);
    let image_to_ground = ground_to_image
        .try_inverse()
        .ok_or(ProjectionError::SingularHomography)?;

    Ok(GroundProjection {
        corners,
        camera_position: c,
        ground_to_image,
        image_to_ground,
    })
}

/// Pose of a camera at `position` looking straight down at a z-up plane,
/// with image "up" pointing along +y.
pub fn nadir_pose(position: Vector3<f64>) -> SE3 {
    SE3::from_rt(
        Matrix3::new(
            1.0, 0.0, 0.0,
            0.0, -1.0, 0.0,
            0.0, 0.0, -1.0,
        ),
        position,
    )
}
