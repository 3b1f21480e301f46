//! Plane homography helpers.
//!
//! The ground plane is z = 0 in its own frame. A camera with pose
//! `T_plane_cam = (R, c)` images a ground point X = (x, y, 0) at
//!
//! ```text
//! p ~ K Rᵀ (X − c) = K Rᵀ [e1 | e2 | −c] (x, y, 1)ᵀ
//! ```
//!
//! so `H_img_ground = K Rᵀ [e1 | e2 | −c]`.

use nalgebra::{Matrix3, Vector2, Vector3};

use super::{CameraParameters, SE3};

/// Project a 2D point through a 3×3 homography. `None` at infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<Vector2<f64>> {
    let p = h * Vector3::new(x, y, 1.0);
    if p.z.abs() < 1e-15 {
        return None;
    }
    Some(Vector2::new(p.x / p.z, p.y / p.z))
}

/// Homography mapping ground-plane (x, y) to image pixels.
pub fn ground_to_image(camera: &CameraParameters, t_plane_cam: &SE3) -> Matrix3<f64> {
    let rt = t_plane_cam.rotation_matrix().transpose();
    let c = t_plane_cam.translation;
    let basis = Matrix3::new(
        1.0, 0.0, -c.x,
        0.0, 1.0, -c.y,
        0.0, 0.0, -c.z,
    );
    camera.k() * rt * basis
}

/// Affine map from map pixels `(u, v)` to ground coordinates `(x, y)`:
/// `x = u · res`, `y = −v · res`.
pub fn map_pixel_to_ground(resolution: f64) -> Matrix3<f64> {
    Matrix3::new(
        resolution, 0.0, 0.0,
        0.0, -resolution, 0.0,
        0.0, 0.0, 1.0,
    )
}

/// Translation by `(dx, dy)` in homogeneous 2D coordinates.
pub fn translation(dx: f64, dy: f64) -> Matrix3<f64> {
    Matrix3::new(
        1.0, 0.0, dx,
        0.0, 1.0, dy,
        0.0, 0.0, 1.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_nadir_camera_maps_centre_to_principal_point() {
        let cam = CameraParameters::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        // Camera looking straight down from 50 m: optical axis = −z.
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(std::f64::consts::PI, 0.0, 0.0),
            translation: Vector3::new(10.0, 20.0, 50.0),
        };
        let h = ground_to_image(&cam, &pose);

        let px = project(&h, 10.0, 20.0).unwrap();
        assert_relative_eq!(px, Vector2::new(320.0, 240.0), epsilon = 1e-9);

        // 1 m on the ground is fx / height = 10 px.
        let px = project(&h, 11.0, 20.0).unwrap();
        assert_relative_eq!(px.x, 330.0, epsilon = 1e-9);
    }

    #[test]
    fn test_map_pixel_affine() {
        let a = map_pixel_to_ground(0.1);
        let g = project(&a, 10.0, 20.0).unwrap();
        assert_relative_eq!(g, Vector2::new(1.0, -2.0), epsilon = 1e-12);
        let back = project(&a.try_inverse().unwrap(), g.x, g.y).unwrap();
        assert_relative_eq!(back, Vector2::new(10.0, 20.0), epsilon = 1e-12);
    }
}
