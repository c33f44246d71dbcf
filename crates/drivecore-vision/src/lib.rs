//! `drivecore-vision` – Geometry and tensor layer of the perception core.
//!
//! Turns raw road-camera frames into the tensors the driving network
//! consumes, and turns the network's flat output back into typed
//! predictions.
//!
//! # Modules
//!
//! - [`orientation`] – Euler-angle helpers and the device/view/road frame
//!   conventions.
//! - [`calibration`] – [`CalibrationTracker`][calibration::CalibrationTracker]:
//!   owns intrinsics plus mounting angles and keeps the camera-to-model
//!   transform in sync with them.
//! - [`warp`] – [`FrameWarper`][warp::FrameWarper]: perspective warp of an RGB
//!   frame into the packed 6-channel model layout.
//! - [`assembler`] – [`FrameAssembler`][assembler::FrameAssembler]: keeps the
//!   two most recent warped frames and exposes them as one input tensor.
//! - [`parser`] – decodes the network's flat output vector into a
//!   [`PredictionBundle`][drivecore_types::PredictionBundle].
//! - [`live_calib`] – [`Calibrator`][live_calib::Calibrator]: estimates the
//!   mounting angles online from the network's pose output.

pub mod assembler;
pub mod calibration;
pub mod live_calib;
pub mod orientation;
pub mod parser;
pub mod warp;

use drivecore_types::DriveError;
use thiserror::Error;

/// Errors produced by the vision layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VisionError {
    /// The calibration geometry produced a non-invertible transform.
    #[error("calibration transform is singular or non-finite")]
    SingularTransform,
    #[error("frame {frame_id} is malformed: {details}")]
    MalformedFrame { frame_id: u32, details: String },
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),
    /// The network output did not match the expected layout.
    #[error("network output decode failed: {0}")]
    Decode(String),
}

impl From<VisionError> for DriveError {
    fn from(e: VisionError) -> Self {
        match e {
            VisionError::SingularTransform => DriveError::InvalidCalibration(e.to_string()),
            VisionError::InvalidCalibration(msg) => DriveError::InvalidCalibration(msg),
            VisionError::MalformedFrame { .. } => DriveError::DecodeFailure(e.to_string()),
            VisionError::Decode(msg) => DriveError::DecodeFailure(msg),
        }
    }
}
