//! Per-iteration state carried from one inference to the next.
//!
//! Two pieces of context survive an iteration:
//!
//! * the **desire pulse** fed back as a model input, derived by edge
//!   detection over consecutive `desire_state` outputs, and
//! * the **recurrent state**, which the model emits and consumes verbatim.
//!
//! The edge detector is written as pure functions over an explicit previous
//! value ([`debounce`], [`force_pulse`]); [`TemporalState`] just stores the
//! values between calls.

use drivecore_types::{DESIRE_LEN, DesireVector, DriveError, PredictionBundle, RecurrentState};

/// Minimum rise in confidence, between two consecutive inferences, that
/// counts as a new maneuver request.
pub const PULSE_THRESHOLD: f32 = 0.99;

/// Rising-edge detector.  `pulse[i]` is `current[i]` when it jumped by more
/// than [`PULSE_THRESHOLD`] since `previous`, else `0.0`.
pub fn debounce(previous: &DesireVector, current: &DesireVector) -> DesireVector {
    let mut pulse = [0.0; DESIRE_LEN];
    for i in 0..DESIRE_LEN {
        if current[i] - previous[i] > PULSE_THRESHOLD {
            pulse[i] = current[i];
        }
    }
    pulse
}

/// `pulse` with entry `index` latched to `1.0`.
///
/// # Errors
///
/// [`DriveError::DecodeFailure`] when `index` does not name a maneuver.
pub fn force_pulse(pulse: &DesireVector, index: usize) -> Result<DesireVector, DriveError> {
    if index >= DESIRE_LEN {
        return Err(DriveError::DecodeFailure(format!(
            "desire index {index} out of range 0..{DESIRE_LEN}"
        )));
    }
    let mut forced = *pulse;
    forced[index] = 1.0;
    Ok(forced)
}

/// Pulse vector, previous desire state and recurrent state of one pipeline.
#[derive(Debug, Clone, Default)]
pub struct TemporalState {
    pulse: DesireVector,
    previous_desire_state: DesireVector,
    recurrent: RecurrentState,
}

impl TemporalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pulse vector to feed into the next inference.
    pub fn pulse(&self) -> &DesireVector {
        &self.pulse
    }

    pub fn previous_desire_state(&self) -> &DesireVector {
        &self.previous_desire_state
    }

    pub fn recurrent_state(&self) -> &RecurrentState {
        &self.recurrent
    }

    /// Latch a manual maneuver request for the next inference.
    pub fn force_pulse(&mut self, index: usize) -> Result<(), DriveError> {
        self.pulse = force_pulse(&self.pulse, index)?;
        Ok(())
    }

    /// Recompute the pulse from the newest `desire_state` and remember it.
    ///
    /// A pulse forced since the last call is overwritten by the same rule.
    pub fn update_desire(&mut self, bundle: &PredictionBundle) -> DesireVector {
        let current = bundle.meta.desire_state;
        self.pulse = debounce(&self.previous_desire_state, &current);
        self.previous_desire_state = current;
        self.pulse
    }

    /// Replace the recurrent state with the one the model just emitted.
    pub fn update_recurrent_state(&mut self, bundle: &PredictionBundle) -> &RecurrentState {
        self.recurrent = bundle.recurrent_state.clone();
        &self.recurrent
    }
}
