//! Registry of known parameter keys.

use serde::{Deserialize, Serialize};

/// Lifetime class of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKeyType {
    /// Survives restarts.
    Persistent,
    /// Deleted by [`Params::set_defaults`][crate::Params::set_defaults] at
    /// process start.
    ClearOnStart,
}

pub const CALIBRATION_PARAMS: &str = "CalibrationParams";
pub const CAMERA_MATRIX: &str = "CameraMatrix";
pub const DISTORTION_COEFFICIENTS: &str = "DistortionCoefficients";
/// Set while the perception pipeline is in its steady state.
pub const MODELD_READY: &str = "ModelDReady";
pub const FLOWINIT_READY: &str = "FlowinitReady";
pub const DRIVECORE_PID: &str = "DrivecorePID";
pub const CONTROLS_READY: &str = "ControlsReady";
/// One-shot request to discard the live calibration.
pub const RESET_EXTRINSIC_CALIBRATION: &str = "ResetExtrinsicCalibration";

pub const KEYS: &[(&str, ParamKeyType)] = &[
    (CALIBRATION_PARAMS, ParamKeyType::Persistent),
    (CAMERA_MATRIX, ParamKeyType::Persistent),
    (DISTORTION_COEFFICIENTS, ParamKeyType::Persistent),
    (MODELD_READY, ParamKeyType::ClearOnStart),
    (FLOWINIT_READY, ParamKeyType::Persistent),
    (DRIVECORE_PID, ParamKeyType::ClearOnStart),
    (CONTROLS_READY, ParamKeyType::ClearOnStart),
    (RESET_EXTRINSIC_CALIBRATION, ParamKeyType::ClearOnStart),
];

/// Lifetime class of `key`, or `None` for unknown keys.
pub fn key_type(key: &str) -> Option<ParamKeyType> {
    KEYS.iter().find(|(k, _)| *k == key).map(|(_, t)| *t)
}
