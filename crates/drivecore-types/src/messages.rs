//! Wire message schemas for the pub/sub topics.
//!
//! Messages travel as JSON inside [`EventPayload::Encoded`][crate::EventPayload::Encoded].
//! Only the fields the perception core reads or writes are modelled.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{DesireVector, DriveError, MetaData, Trajectory, LANE_LINES};

/// Serialize a message into the bytes carried on the bus.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, DriveError> {
    serde_json::to_vec(msg).map_err(|e| DriveError::Serialization(e.to_string()))
}

/// Parse bus bytes back into a message.
///
/// # Errors
///
/// [`DriveError::DecodeFailure`] when the bytes are not a valid `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DriveError> {
    serde_json::from_slice(bytes).map_err(|e| DriveError::DecodeFailure(e.to_string()))
}

/// `modelV2` – the full prediction set plus pipeline health metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelV2Msg {
    pub frame_id: u32,
    /// Frames elapsed between capture of `frame_id` and publication.
    pub frame_age: u32,
    pub frame_drop_perc: f32,
    /// Mean iteration latency in seconds.
    pub model_execution_time: f32,
    /// Publish time, nanoseconds.
    pub timestamp: u64,
    pub position: Trajectory,
    pub lane_line_probs: [f32; LANE_LINES],
    pub lead_prob: f32,
    pub meta: MetaData,
}

/// `desire` – the pulse vector fed to the model plus the decoded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesireMsg {
    pub timestamp: u64,
    pub pulse: DesireVector,
    pub desire_state: DesireVector,
}

/// `cameraOdometry` – ego-motion derived from the temporal window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraOdometryMsg {
    pub timestamp: u64,
    pub frame_id: u32,
    pub trans: [f32; 3],
    pub rot: [f32; 3],
    pub trans_std: [f32; 3],
    pub rot_std: [f32; 3],
}

/// Calibration confidence reported by the live calibrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    #[default]
    Uncalibrated,
    Calibrated,
    Invalid,
}

/// `liveCalibration` – device mounting angles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveCalibrationMsg {
    /// Roll, pitch, yaw of the device relative to the road, radians.
    pub rpy_calib: Vec<f32>,
    #[serde(default)]
    pub valid_blocks: u32,
    #[serde(default)]
    pub cal_status: CalibrationStatus,
    #[serde(default)]
    pub cal_perc: u8,
    /// Row-major 3×4 view-from-road extrinsic matrix.
    #[serde(default)]
    pub extrinsic_matrix: Vec<f32>,
    #[serde(default)]
    pub rpy_calib_spread: Vec<f32>,
}

/// `carState` – only the ego speed is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CarStateMsg {
    /// Vehicle speed, m/s.
    pub v_ego: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_calibration_decodes_with_only_rpy() {
        let msg: LiveCalibrationMsg = decode(br#"{"rpy_calib":[0.0,0.01,-0.02]}"#).unwrap();
        assert_eq!(msg.rpy_calib, vec![0.0, 0.01, -0.02]);
        assert_eq!(msg.cal_status, CalibrationStatus::Uncalibrated);
    }

    #[test]
    fn decode_garbage_is_decode_failure() {
        let err = decode::<CarStateMsg>(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, DriveError::DecodeFailure(_)));
    }

    #[test]
    fn camera_odometry_encodes_snake_case_fields() {
        let msg = CameraOdometryMsg {
            timestamp: 5,
            frame_id: 3,
            trans: [1.0, 0.0, 0.0],
            rot: [0.0; 3],
            trans_std: [0.1; 3],
            rot_std: [0.01; 3],
        };
        let text = String::from_utf8(encode(&msg).unwrap()).unwrap();
        assert!(text.contains("\"trans_std\""));
        assert!(text.contains("\"frame_id\":3"));
    }
}
