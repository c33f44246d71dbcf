//! Rotation helpers and the fixed frame conventions of the camera.
//!
//! Two frames matter here:
//!
//! * **device** – x forward, y right, z down (the frame calibration angles
//!   are expressed in).
//! * **view** – x right, y down, z forward (the pinhole camera frame).
//!
//! Euler angles follow the roll-pitch-yaw convention, `R = Rz(yaw) · Ry(pitch)
//! · Rx(roll)`.

use nalgebra::{Matrix3, Rotation3, Vector3};

/// Rotation matrix for the given roll, pitch and yaw.
pub fn rot_from_euler(rpy: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::from_euler_angles(rpy.x, rpy.y, rpy.z).into_inner()
}

/// Roll, pitch and yaw recovered from a rotation matrix.
pub fn euler_from_rot(rot: &Matrix3<f64>) -> Vector3<f64> {
    let (roll, pitch, yaw) = Rotation3::from_matrix_unchecked(*rot).euler_angles();
    Vector3::new(roll, pitch, yaw)
}

/// Maps device-frame vectors into the view frame.
pub fn view_frame_from_device_frame() -> Matrix3<f64> {
    Matrix3::new(
        0.0, 1.0, 0.0,
        0.0, 0.0, 1.0,
        1.0, 0.0, 0.0,
    )
}

/// Row-major 3×4 extrinsic matrix mapping road-frame points into the view
/// frame for a device mounted `height` metres above the road with the given
/// calibration angles.
pub fn view_frame_from_road_frame(rpy: &Vector3<f64>, height: f64) -> [f64; 12] {
    // Road frame has z up and y left; flip into the device convention first.
    let device_from_road = rot_from_euler(rpy) * Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, -1.0));
    let view_from_road = view_frame_from_device_frame() * device_from_road;
    let translation = Vector3::new(0.0, height, 0.0);
    let mut out = [0.0; 12];
    for row in 0..3 {
        for col in 0..3 {
            out[row * 4 + col] = view_from_road[(row, col)];
        }
        out[row * 4 + 3] = translation[row];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn euler_roundtrip_small_angles() {
        let rpy = Vector3::new(0.01, -0.03, 0.05);
        let back = euler_from_rot(&rot_from_euler(&rpy));
        assert!((back - rpy).norm() < 1e-9, "got {back:?}");
    }

    #[test]
    fn zero_euler_is_identity() {
        let r = rot_from_euler(&Vector3::zeros());
        assert!((r - Matrix3::identity()).norm() < 1e-12);
    }

    #[test]
    fn view_frame_maps_forward_to_z() {
        let forward = view_frame_from_device_frame() * Vector3::new(1.0, 0.0, 0.0);
        assert_eq!(forward, Vector3::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn road_extrinsics_place_road_below_camera() {
        let m = view_frame_from_road_frame(&Vector3::zeros(), 1.22);
        // Road origin sits `height` below the camera: +y in the view frame.
        assert!((m[7] - 1.22).abs() < 1e-12);
        assert_eq!(m[3], 0.0);
        assert_eq!(m[11], 0.0);
    }
}
