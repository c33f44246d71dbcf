//! Decoding of the network's flat output vector.
//!
//! The network emits one contiguous `f32` vector per execution.  Sections,
//! in order:
//!
//! | Section          | Length | Contents |
//! |------------------|-------:|----------|
//! | plan             | 4955   | 5 hypotheses × (33 steps × 15 × mean/std + 1 logit) |
//! | lane lines       | 528    | 4 lines × 33 points × 2 × mean/std |
//! | lane line probs  | 8      | 4 × (not-present, present) logits |
//! | road edges       | 264    | 2 edges × 33 points × 2 × mean/std |
//! | leads            | 102    | lead hypotheses |
//! | lead probs       | 3      | logits for 0/2/4 s |
//! | desire state     | 8      | maneuver logits |
//! | meta             | 48     | engaged, 5 horizons × 7 disengage logits, blinkers |
//! | desire pred      | 32     | 4 steps × 8 maneuver logits |
//! | pose             | 12     | trans, rot, log-std trans, log-std rot |
//! | recurrent state  | 512    | fed back verbatim |
//!
//! Decoding is all-or-nothing: a length mismatch or any non-finite value
//! yields [`VisionError::Decode`] and nothing is produced.

use drivecore_types::{
    DESIRE_LEN, DESIRE_PRED_STEPS, DISENGAGE_LEN, DisengagePredictions, EgoMotion, LANE_LINES,
    MetaData, PredictionBundle, RecurrentState, STATE_LEN, TRAJECTORY_SIZE, Trajectory,
};

use crate::VisionError;

const PLAN_MHP_N: usize = 5;
const PLAN_WIDTH: usize = 15;
const PLAN_HYPOTHESIS_LEN: usize = TRAJECTORY_SIZE * PLAN_WIDTH * 2 + 1;

const PLAN_IDX: usize = 0;
const LL_IDX: usize = PLAN_IDX + PLAN_MHP_N * PLAN_HYPOTHESIS_LEN;
const LL_PROB_IDX: usize = LL_IDX + LANE_LINES * TRAJECTORY_SIZE * 2 * 2;
const RE_IDX: usize = LL_PROB_IDX + LANE_LINES * 2;
const LEAD_IDX: usize = RE_IDX + 2 * TRAJECTORY_SIZE * 2 * 2;
const LEAD_PROB_IDX: usize = LEAD_IDX + 102;
const DESIRE_STATE_IDX: usize = LEAD_PROB_IDX + 3;
const META_IDX: usize = DESIRE_STATE_IDX + DESIRE_LEN;
const META_LEN: usize = 48;
const DESIRE_PRED_IDX: usize = META_IDX + META_LEN;
const POSE_IDX: usize = DESIRE_PRED_IDX + DESIRE_PRED_STEPS * DESIRE_LEN;
const POSE_LEN: usize = 12;
const STATE_IDX: usize = POSE_IDX + POSE_LEN;

/// Total length of one network output vector.
pub const NET_OUTPUT_SIZE: usize = STATE_IDX + STATE_LEN;

/// Logits per disengage horizon: gas, brake, steer, brake 3/4/5 m/s², gas
/// press.
const DISENGAGE_WIDTH: usize = 7;
/// Horizons of the disengage predictions, seconds.
const DISENGAGE_T: [f32; DISENGAGE_LEN] = [2.0, 4.0, 6.0, 8.0, 10.0];

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softmax over `logits`.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Decode a raw network output into a [`PredictionBundle`].
pub fn parse_outputs(output: &[f32]) -> Result<PredictionBundle, VisionError> {
    if output.len() != NET_OUTPUT_SIZE {
        return Err(VisionError::Decode(format!(
            "network output has {} values, expected {NET_OUTPUT_SIZE}",
            output.len()
        )));
    }
    if let Some(idx) = output.iter().position(|v| !v.is_finite()) {
        return Err(VisionError::Decode(format!("non-finite value at index {idx}")));
    }

    let plan = parse_plan(&output[PLAN_IDX..LL_IDX]);

    let mut lane_line_probs = [0.0; LANE_LINES];
    for (i, prob) in lane_line_probs.iter_mut().enumerate() {
        *prob = sigmoid(output[LL_PROB_IDX + 2 * i + 1]);
    }
    let lead_prob = sigmoid(output[LEAD_PROB_IDX]);

    let meta = parse_meta(
        &output[DESIRE_STATE_IDX..META_IDX],
        &output[META_IDX..DESIRE_PRED_IDX],
        &output[DESIRE_PRED_IDX..POSE_IDX],
    );
    let pose = parse_pose(&output[POSE_IDX..STATE_IDX]);
    let recurrent_state = RecurrentState::from_vec(output[STATE_IDX..].to_vec())
        .map_err(|e| VisionError::Decode(e.to_string()))?;

    Ok(PredictionBundle {
        plan,
        lane_line_probs,
        lead_prob,
        meta,
        pose,
        recurrent_state,
    })
}

/// Pick the most likely plan hypothesis.
fn parse_plan(plan: &[f32]) -> Trajectory {
    let logits: Vec<f32> = (0..PLAN_MHP_N)
        .map(|h| plan[h * PLAN_HYPOTHESIS_LEN + PLAN_HYPOTHESIS_LEN - 1])
        .collect();
    let probs = softmax(&logits);
    let best = probs
        .iter()
        .enumerate()
        .fold(0, |best, (i, p)| if *p > probs[best] { i } else { best });

    let mean = &plan[best * PLAN_HYPOTHESIS_LEN..];
    let mut traj = Trajectory {
        prob: probs[best],
        x: Vec::with_capacity(TRAJECTORY_SIZE),
        y: Vec::with_capacity(TRAJECTORY_SIZE),
        z: Vec::with_capacity(TRAJECTORY_SIZE),
    };
    for t in 0..TRAJECTORY_SIZE {
        let base = t * PLAN_WIDTH;
        traj.x.push(mean[base]);
        traj.y.push(mean[base + 1]);
        traj.z.push(mean[base + 2]);
    }
    traj
}

fn parse_meta(desire_state: &[f32], meta: &[f32], desire_pred: &[f32]) -> MetaData {
    let mut state = [0.0; DESIRE_LEN];
    state.copy_from_slice(&softmax(desire_state));

    let desire_prediction = desire_pred
        .chunks_exact(DESIRE_LEN)
        .flat_map(softmax)
        .collect();

    let mut d = DisengagePredictions {
        t: DISENGAGE_T,
        ..Default::default()
    };
    for i in 0..DISENGAGE_LEN {
        let base = 1 + i * DISENGAGE_WIDTH;
        d.gas_disengage_probs[i] = sigmoid(meta[base]);
        d.brake_disengage_probs[i] = sigmoid(meta[base + 1]);
        d.steer_override_probs[i] = sigmoid(meta[base + 2]);
        d.brake_3ms2_probs[i] = sigmoid(meta[base + 3]);
        d.brake_4ms2_probs[i] = sigmoid(meta[base + 4]);
        d.brake_5ms2_probs[i] = sigmoid(meta[base + 5]);
        d.gas_press_probs[i] = sigmoid(meta[base + 6]);
    }

    let hard_brake_predicted = d
        .brake_5ms2_probs
        .iter()
        .enumerate()
        .all(|(i, p)| *p > if i < 2 { 0.05 } else { 0.15 });

    MetaData {
        engaged_prob: sigmoid(meta[0]),
        desire_state: state,
        desire_prediction,
        disengage_predictions: d,
        hard_brake_predicted,
    }
}

fn parse_pose(pose: &[f32]) -> EgoMotion {
    let take = |offset: usize, f: fn(f32) -> f32| -> [f32; 3] {
        [f(pose[offset]), f(pose[offset + 1]), f(pose[offset + 2])]
    };
    EgoMotion {
        trans: take(0, |v| v),
        rot: take(3, |v| v),
        trans_std: take(6, f32::exp),
        rot_std: take(9, f32::exp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros() -> Vec<f32> {
        vec![0.0; NET_OUTPUT_SIZE]
    }

    #[test]
    fn layout_adds_up() {
        assert_eq!(NET_OUTPUT_SIZE, 6472);
        assert_eq!(STATE_IDX, NET_OUTPUT_SIZE - STATE_LEN);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = parse_outputs(&[0.0; 10]).unwrap_err();
        assert!(matches!(err, VisionError::Decode(m) if m.contains("10 values")));
    }

    #[test]
    fn rejects_non_finite_values() {
        let mut out = zeros();
        out[POSE_IDX] = f32::NAN;
        assert!(parse_outputs(&out).is_err());
        out[POSE_IDX] = f32::INFINITY;
        assert!(parse_outputs(&out).is_err());
    }

    #[test]
    fn all_zero_output_decodes_to_uniform_probabilities() {
        let bundle = parse_outputs(&zeros()).unwrap();
        assert!((bundle.plan.prob - 0.2).abs() < 1e-6);
        assert!(bundle.meta.desire_state.iter().all(|p| (p - 0.125).abs() < 1e-6));
        assert_eq!(bundle.meta.desire_prediction.len(), DESIRE_PRED_STEPS * DESIRE_LEN);
        assert!((bundle.meta.engaged_prob - 0.5).abs() < 1e-6);
        assert_eq!(bundle.pose.trans_std, [1.0; 3]);
        assert_eq!(bundle.recurrent_state.as_slice().len(), STATE_LEN);
        // 0.5 exceeds every hard-brake threshold.
        assert!(bundle.meta.hard_brake_predicted);
    }

    #[test]
    fn picks_most_likely_plan_hypothesis() {
        let mut out = zeros();
        let best = 3;
        out[best * PLAN_HYPOTHESIS_LEN + PLAN_HYPOTHESIS_LEN - 1] = 10.0;
        out[best * PLAN_HYPOTHESIS_LEN + PLAN_WIDTH] = 1.5; // x at t=1
        let bundle = parse_outputs(&out).unwrap();
        assert!(bundle.plan.prob > 0.99);
        assert_eq!(bundle.plan.x[1], 1.5);
        assert_eq!(bundle.plan.x.len(), TRAJECTORY_SIZE);
    }

    #[test]
    fn desire_state_softmax_peaks_at_hot_logit() {
        let mut out = zeros();
        out[DESIRE_STATE_IDX + 3] = 20.0;
        let bundle = parse_outputs(&out).unwrap();
        assert!(bundle.meta.desire_state[3] > 0.999);
        let sum: f32 = bundle.meta.desire_state.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hard_brake_needs_every_horizon() {
        let mut out = zeros();
        for i in 0..DISENGAGE_LEN {
            out[META_IDX + 1 + i * DISENGAGE_WIDTH + 5] = 5.0;
        }
        out[META_IDX + 1 + 4 * DISENGAGE_WIDTH + 5] = -10.0;
        let bundle = parse_outputs(&out).unwrap();
        assert!(!bundle.meta.hard_brake_predicted);
        assert!(bundle.meta.disengage_predictions.brake_5ms2_probs[0] > 0.99);
    }

    #[test]
    fn recurrent_state_is_copied_verbatim() {
        let mut out = zeros();
        out[STATE_IDX] = 0.25;
        out[NET_OUTPUT_SIZE - 1] = -3.0;
        let bundle = parse_outputs(&out).unwrap();
        assert_eq!(bundle.recurrent_state.as_slice()[0], 0.25);
        assert_eq!(bundle.recurrent_state.as_slice()[STATE_LEN - 1], -3.0);
    }
}
