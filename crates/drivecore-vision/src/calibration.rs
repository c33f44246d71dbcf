//! Camera calibration tracking.
//!
//! [`CalibrationTracker`] owns the camera intrinsics, the mounting angles
//! reported by the live calibrator, and the derived device-to-model
//! perspective transform.  The transform is recomputed synchronously on every
//! accepted change, so readers never observe a transform that disagrees with
//! the inputs it was built from.
//!
//! # Example
//!
//! ```rust
//! use drivecore_vision::calibration::CalibrationTracker;
//! use nalgebra::Vector3;
//!
//! let mut tracker = CalibrationTracker::new();
//! let before = tracker.state().device_to_model;
//!
//! tracker.update_calibration(Vector3::new(0.0, 0.02, -0.01)).unwrap();
//! assert_ne!(tracker.state().device_to_model, before);
//!
//! // A zero focal length is rejected and the previous intrinsics survive.
//! let mut bogus = [0.0f32; 9];
//! bogus[8] = 1.0;
//! assert!(!tracker.update_intrinsics(&bogus));
//! ```

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use tracing::{debug, warn};

use crate::VisionError;
use crate::orientation::rot_from_euler;

// ────────────────────────────────────────────────────────────────────────────
// Fixed camera and model geometry
// ────────────────────────────────────────────────────────────────────────────

/// Focal length of the stock road camera, pixels.
pub const FOCAL: f32 = 910.0;
/// Full camera frame size as (height, width).
pub const FULL_FRAME_SIZE: (u32, u32) = (874, 1164);
/// Assumed camera mounting height above the road, metres.
pub const MODEL_HEIGHT: f32 = 1.22;
/// Model input resolution as (width, height).
pub const MEDMODEL_INPUT_SIZE: (u32, u32) = (512, 256);
/// Vertical principal point of the model frame.
pub const MEDMODEL_CY: f32 = 47.6;
const MEDMODEL_ZOOM: f32 = 1.0;

/// Indices of the row-major 3×3 camera matrix that must be nonzero for a
/// candidate to be accepted: fx, cx, fy, cy and the homogeneous scale.
const REQUIRED_INTRINSIC_ENTRIES: [usize; 5] = [0, 2, 4, 5, 8];

/// Camera matrix assumed until the camera reports its own.
#[rustfmt::skip]
pub fn default_camera_intrinsics() -> Matrix3<f32> {
    let (height, width) = FULL_FRAME_SIZE;
    Matrix3::new(
        FOCAL, 0.0, width as f32 / 2.0,
        0.0, FOCAL, height as f32 / 2.0,
        0.0, 0.0, 1.0,
    )
}

/// Intrinsics of the virtual camera the model was trained on.
#[rustfmt::skip]
pub fn medmodel_intrinsics() -> Matrix3<f32> {
    Matrix3::new(
        FOCAL / MEDMODEL_ZOOM, 0.0, 0.5 * MEDMODEL_INPUT_SIZE.0 as f32,
        0.0, FOCAL / MEDMODEL_ZOOM, MEDMODEL_CY,
        0.0, 0.0, 1.0,
    )
}

// ────────────────────────────────────────────────────────────────────────────
// CalibrationState
// ────────────────────────────────────────────────────────────────────────────

/// Geometric calibration owned by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    pub intrinsics: Matrix3<f32>,
    /// Roll, pitch, yaw of the device relative to the road, radians.
    pub rpy_calib: Vector3<f32>,
    pub translation_calib: Vector3<f32>,
    /// Perspective transform from camera pixels to model-input pixels.
    pub device_to_model: Matrix3<f32>,
}

impl CalibrationState {
    /// Build a state, deriving the transform from the given inputs.
    pub fn new(
        intrinsics: Matrix3<f32>,
        rpy_calib: Vector3<f32>,
        translation_calib: Vector3<f32>,
    ) -> Result<Self, VisionError> {
        let device_to_model = device_to_calibrated_frame(
            MODEL_HEIGHT,
            FULL_FRAME_SIZE,
            &intrinsics,
            &medmodel_intrinsics(),
            &rpy_calib,
            &translation_calib,
        )?;
        Ok(Self {
            intrinsics,
            rpy_calib,
            translation_calib,
            device_to_model,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CalibrationTracker
// ────────────────────────────────────────────────────────────────────────────

/// Owns [`CalibrationState`] and guards it against invalid updates.
#[derive(Debug, Clone)]
pub struct CalibrationTracker {
    state: CalibrationState,
}

impl CalibrationTracker {
    /// Start from the stock camera intrinsics and a level mount.
    pub fn new() -> Self {
        let intrinsics = default_camera_intrinsics();
        let zero = Vector3::zeros();
        // The stock geometry always yields a well-conditioned transform.
        let device_to_model = device_to_calibrated_frame(
            MODEL_HEIGHT,
            FULL_FRAME_SIZE,
            &intrinsics,
            &medmodel_intrinsics(),
            &zero,
            &zero,
        )
        .unwrap_or_else(|_| Matrix3::identity());
        Self {
            state: CalibrationState {
                intrinsics,
                rpy_calib: zero,
                translation_calib: zero,
                device_to_model,
            },
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    /// The current camera-to-model transform.
    pub fn transform(&self) -> &Matrix3<f32> {
        &self.state.device_to_model
    }

    /// Replace the camera intrinsics with a row-major 3×3 `candidate`.
    ///
    /// The candidate is accepted only when fx, cx, fy, cy and the scale term
    /// are all nonzero and the resulting transform is well defined; otherwise
    /// the call is a no-op and returns `false`.
    pub fn update_intrinsics(&mut self, candidate: &[f32; 9]) -> bool {
        if !intrinsics_valid(candidate) {
            debug!(?candidate, "ignoring intrinsics with zero structural entries");
            return false;
        }
        let intrinsics = Matrix3::from_row_slice(candidate);
        if intrinsics == self.state.intrinsics {
            return true;
        }
        match CalibrationState::new(intrinsics, self.state.rpy_calib, self.state.translation_calib) {
            Ok(next) => {
                self.state = next;
                true
            }
            Err(e) => {
                warn!(error = %e, "intrinsics rejected; keeping previous calibration");
                false
            }
        }
    }

    /// Apply new mounting angles and recompute the transform.
    ///
    /// # Errors
    ///
    /// [`VisionError::InvalidCalibration`] for non-finite angles and
    /// [`VisionError::SingularTransform`] when the geometry degenerates.  On
    /// error the previous state is kept untouched.
    pub fn update_calibration(&mut self, rpy: Vector3<f32>) -> Result<(), VisionError> {
        if !rpy.iter().all(|v| v.is_finite()) {
            return Err(VisionError::InvalidCalibration(format!(
                "non-finite calibration angles {rpy:?}"
            )));
        }
        self.state = CalibrationState::new(self.state.intrinsics, rpy, self.state.translation_calib)?;
        debug!(rpy = ?rpy, "calibration transform recomputed");
        Ok(())
    }
}

impl Default for CalibrationTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `true` when every structurally required camera-matrix entry is nonzero.
pub fn intrinsics_valid(candidate: &[f32; 9]) -> bool {
    REQUIRED_INTRINSIC_ENTRIES
        .iter()
        .all(|&i| candidate[i] != 0.0 && candidate[i].is_finite())
}

// ────────────────────────────────────────────────────────────────────────────
// Transform construction
// ────────────────────────────────────────────────────────────────────────────

/// Perspective transform from camera pixels to model pixels.
///
/// Four points on the road below the horizon are lifted into 3-D assuming a
/// flat road `height` metres below the camera, rotated by the calibration
/// angles, shifted by `augment_trans`, and re-projected through the model
/// intrinsics.  The transform is the homography relating the two
/// quadrangles.
pub fn device_to_calibrated_frame(
    height: f32,
    frame_size: (u32, u32),
    camera_intrinsics: &Matrix3<f32>,
    model_intrinsics: &Matrix3<f32>,
    rpy: &Vector3<f32>,
    augment_trans: &Vector3<f32>,
) -> Result<Matrix3<f32>, VisionError> {
    let from_intr: Matrix3<f64> = camera_intrinsics.cast();
    let to_intr: Matrix3<f64> = model_intrinsics.cast();
    let h = f64::from(height);
    let (rows, cols) = (f64::from(frame_size.0), f64::from(frame_size.1));

    let cy = from_intr[(1, 2)];
    let quadrangle = [
        (0.0, cy + 20.0),
        (cols - 1.0, cy + 20.0),
        (0.0, rows - 1.0),
        (cols - 1.0, rows - 1.0),
    ];

    let from_intr_inv = from_intr
        .try_inverse()
        .ok_or(VisionError::SingularTransform)?;
    let rot = rot_from_euler(&rpy.cast());
    let trans: Vector3<f64> = augment_trans.cast();
    let rot_t = rot.transpose();

    let mut warped = [(0.0, 0.0); 4];
    for (i, &(u, v)) in quadrangle.iter().enumerate() {
        let norm = from_intr_inv * Vector3::new(u, v, 1.0);
        let (xn, yn) = (norm.x / norm.z, norm.y / norm.z);
        let world = Vector3::new(h * xn / yn, h, h / yn);
        let projected = to_intr * (rot_t * world - trans);
        let (pu, pv) = (projected.x / projected.z, projected.y / projected.z);
        if !pu.is_finite() || !pv.is_finite() {
            return Err(VisionError::SingularTransform);
        }
        warped[i] = (pu, pv);
    }

    perspective_transform(&quadrangle, &warped)
}

/// Solve for the homography mapping each `src` point onto its `dst`
/// counterpart.
pub fn perspective_transform(
    src: &[(f64, f64); 4],
    dst: &[(f64, f64); 4],
) -> Result<Matrix3<f32>, VisionError> {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for i in 0..4 {
        let (x, y) = src[i];
        let (u, v) = dst[i];
        let r = 2 * i;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -x * u;
        a[(r, 7)] = -y * u;
        b[r] = u;

        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -x * v;
        a[(r + 1, 7)] = -y * v;
        b[r + 1] = v;
    }
    let h = a.lu().solve(&b).ok_or(VisionError::SingularTransform)?;
    if !h.iter().all(|v| v.is_finite()) {
        return Err(VisionError::SingularTransform);
    }
    Ok(Matrix3::new(
        h[0] as f32, h[1] as f32, h[2] as f32,
        h[3] as f32, h[4] as f32, h[5] as f32,
        h[6] as f32, h[7] as f32, 1.0,
    ))
}
