//! `drivecore-types` – shared data model for the drivecore perception stack.
//!
//! Holds the per-frame and per-iteration values that cross crate boundaries
//! (frames, decoded predictions, recurrent state), the bus [`Event`] wrapper
//! and the global [`DriveError`].  Wire message schemas live in
//! [`messages`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod messages;

/// Number of discrete maneuvers the model understands (none, turn left,
/// turn right, lane change left, lane change right, keep left, keep right,
/// null).
pub const DESIRE_LEN: usize = 8;
/// Number of future steps in the multi-step desire prediction.
pub const DESIRE_PRED_STEPS: usize = 4;
/// Length of the traffic-convention one-hot model input.
pub const TRAFFIC_CONVENTION_LEN: usize = 2;
/// Length of the recurrent state vector fed back into the model.
pub const STATE_LEN: usize = 512;
/// Number of horizons covered by the disengage predictions.
pub const DISENGAGE_LEN: usize = 5;
/// Number of points along a predicted trajectory.
pub const TRAJECTORY_SIZE: usize = 33;
/// Number of lane lines the model reports on.
pub const LANE_LINES: usize = 4;

/// One-hot-ish maneuver pulse vector used as a model input.
pub type DesireVector = [f32; DESIRE_LEN];

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

/// A raw camera frame as delivered by the road camera feed.
///
/// The pixel buffer is reference counted so the frame can be fanned out over
/// the bus without copying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDescriptor {
    /// Monotonic frame counter assigned by the camera.
    pub frame_id: u32,
    /// End-of-frame capture time in nanoseconds.
    pub timestamp_eof: u64,
    pub width: u32,
    pub height: u32,
    /// Packed RGB888 pixel data, row major.
    pub pixels: Arc<[u8]>,
    /// Row-major 3×3 camera matrix, when the camera reports one.
    pub intrinsics: Option<[f32; 9]>,
}

impl FrameDescriptor {
    /// Number of bytes a well-formed RGB888 buffer of this size holds.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// `true` when the pixel buffer matches the advertised dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.pixels.len() == self.expected_len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recurrent state
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-length vector summarizing temporal context, fed back as the model's
/// own next input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentState(Vec<f32>);

impl RecurrentState {
    /// The all-zero state used before the first inference.
    pub fn zeroed() -> Self {
        Self(vec![0.0; STATE_LEN])
    }

    /// Wrap a model-emitted vector.
    ///
    /// # Errors
    ///
    /// [`DriveError::DecodeFailure`] if the vector is not exactly
    /// [`STATE_LEN`] long.
    pub fn from_vec(values: Vec<f32>) -> Result<Self, DriveError> {
        if values.len() != STATE_LEN {
            return Err(DriveError::DecodeFailure(format!(
                "recurrent state has {} entries, expected {STATE_LEN}",
                values.len()
            )));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl Default for RecurrentState {
    fn default() -> Self {
        Self::zeroed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoded model output
// ─────────────────────────────────────────────────────────────────────────────

/// Probability that the driver disengages or overrides, per horizon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisengagePredictions {
    /// Horizon of each prediction in seconds.
    pub t: [f32; DISENGAGE_LEN],
    pub gas_disengage_probs: [f32; DISENGAGE_LEN],
    pub brake_disengage_probs: [f32; DISENGAGE_LEN],
    pub steer_override_probs: [f32; DISENGAGE_LEN],
    pub brake_3ms2_probs: [f32; DISENGAGE_LEN],
    pub brake_4ms2_probs: [f32; DISENGAGE_LEN],
    pub brake_5ms2_probs: [f32; DISENGAGE_LEN],
    pub gas_press_probs: [f32; DISENGAGE_LEN],
}

/// Maneuver and risk metadata decoded from one inference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    pub engaged_prob: f32,
    /// Probability of each maneuver being in progress right now.
    pub desire_state: DesireVector,
    /// [`DESIRE_PRED_STEPS`] × [`DESIRE_LEN`] future maneuver probabilities,
    /// step major.
    pub desire_prediction: Vec<f32>,
    pub disengage_predictions: DisengagePredictions,
    pub hard_brake_predicted: bool,
}

/// Ego-motion between the two frames of the temporal window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EgoMotion {
    /// Translation in m/s, device frame (x forward, y right, z down).
    pub trans: [f32; 3],
    /// Rotation rate in rad/s, device frame.
    pub rot: [f32; 3],
    pub trans_std: [f32; 3],
    pub rot_std: [f32; 3],
}

/// Most likely planned trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub prob: f32,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
}

/// Everything decoded from one network execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionBundle {
    pub plan: Trajectory,
    pub lane_line_probs: [f32; LANE_LINES],
    pub lead_prob: f32,
    pub meta: MetaData,
    pub pose: EgoMotion,
    pub recurrent_state: RecurrentState,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the topic bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "drivecore-hal::camera_manager"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a new event with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A road-camera frame.
    Frame(FrameDescriptor),
    /// A serialized message (see [`messages`]) or a raw encoded command such
    /// as a pulse-desire index.
    Encoded(Vec<u8>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type for the perception stack.
///
/// Only [`DriveError::FatalStartup`] halts the pipeline; every other variant
/// is logged and degrades gracefully.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriveError {
    #[error("Fatal startup error: {0}")]
    FatalStartup(String),

    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("Transient upstream condition on {topic}: {details}")]
    TransientUpstream { topic: String, details: String },

    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Params error: {0}")]
    Params(String),

    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
