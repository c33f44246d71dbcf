//! Online estimation of the camera mounting angles.
//!
//! While the car drives straight and fast, the direction of the predicted
//! ego translation reveals how the device is pitched and yawed relative to
//! the road.  [`Calibrator`] averages those observations in blocks of
//! [`BLOCK_SIZE`] samples and keeps the last [`INPUTS_WANTED`] blocks; the
//! calibration is reported valid once [`INPUTS_NEEDED`] blocks exist and the
//! angles sit inside the range the model frame can accommodate.
//!
//! A large spread between blocks means the device was re-mounted: the
//! estimator restarts from the most recent block and blends from the old
//! angles over [`SMOOTH_CYCLES`] samples so the model never sees a jump.

use drivecore_types::messages::{CalibrationStatus, LiveCalibrationMsg};
use nalgebra::Vector3;
use tracing::{debug, info};

use crate::calibration::MODEL_HEIGHT;
use crate::orientation::{euler_from_rot, rot_from_euler, view_frame_from_road_frame};

const MPH_TO_MS: f64 = 0.44704;

/// Minimum speed, both reported and observed, for a sample to count.
pub const MIN_SPEED_FILTER: f64 = 15.0 * MPH_TO_MS;
pub const MAX_VEL_ANGLE_STD: f64 = 0.25 * std::f64::consts::PI / 180.0;
/// Yaw rate above which the car is considered to be turning, rad/s.
pub const MAX_YAW_RATE_FILTER: f64 = 3.0 * std::f64::consts::PI / 180.0;

pub const SMOOTH_CYCLES: f64 = 400.0;
pub const BLOCK_SIZE: usize = 100;
pub const INPUTS_NEEDED: usize = 5;
pub const INPUTS_WANTED: usize = 50;
pub const MAX_ALLOWED_SPREAD: f64 = 2.0 * std::f64::consts::PI / 180.0;

/// Pitch range the widest model frame still covers, radians.
pub const PITCH_LIMITS: (f64, f64) = (-0.090_741_120_851_297_39, 0.149_075_720_529_896_57);
/// Yaw range the widest model frame still covers, radians.
pub const YAW_LIMITS: (f64, f64) = (-0.069_120_480_847_182_24, 0.069_120_480_847_182_35);

/// Block-averaging mounting-angle estimator.
#[derive(Debug, Clone)]
pub struct Calibrator {
    rpy: Vector3<f64>,
    rpys: Vec<Vector3<f64>>,
    valid_blocks: usize,
    idx: usize,
    block_idx: usize,
    v_ego: f64,
    old_rpy: Vector3<f64>,
    old_rpy_weight: f64,
    cal_status: CalibrationStatus,
    calib_spread: Vector3<f64>,
    persist_pending: bool,
}

impl Calibrator {
    /// A fresh, uncalibrated estimator.
    pub fn new() -> Self {
        Self::with_initial(Vector3::zeros(), 0)
    }

    /// Resume from a previously persisted calibration.
    pub fn from_cache(cached: &LiveCalibrationMsg) -> Self {
        let rpy = match cached.rpy_calib.as_slice() {
            [r, p, y] => Vector3::new(f64::from(*r), f64::from(*p), f64::from(*y)),
            _ => Vector3::zeros(),
        };
        Self::with_initial(rpy, cached.valid_blocks as usize)
    }

    fn with_initial(rpy: Vector3<f64>, valid_blocks: usize) -> Self {
        let mut calibrator = Self {
            rpy: Vector3::zeros(),
            rpys: vec![Vector3::zeros(); INPUTS_WANTED],
            valid_blocks: 0,
            idx: 0,
            block_idx: 0,
            v_ego: 0.0,
            old_rpy: Vector3::zeros(),
            old_rpy_weight: 0.0,
            cal_status: CalibrationStatus::Uncalibrated,
            calib_spread: Vector3::zeros(),
            persist_pending: false,
        };
        calibrator.reset(rpy, valid_blocks, None);
        calibrator.update_status();
        calibrator
    }

    /// Restart estimation from `rpy_init`, optionally blending away from
    /// `smooth_from`.
    pub fn reset(&mut self, rpy_init: Vector3<f64>, valid_blocks: usize, smooth_from: Option<Vector3<f64>>) {
        self.rpy = if rpy_init.iter().all(|v| v.is_finite()) {
            rpy_init
        } else {
            Vector3::zeros()
        };
        self.valid_blocks = valid_blocks.min(INPUTS_WANTED);
        self.rpys = vec![self.rpy; INPUTS_WANTED];
        self.idx = 0;
        self.block_idx = 0;
        self.v_ego = 0.0;
        match smooth_from {
            Some(old) => {
                self.old_rpy = old;
                self.old_rpy_weight = 1.0;
            }
            None => {
                self.old_rpy = Vector3::zeros();
                self.old_rpy_weight = 0.0;
            }
        }
    }

    pub fn handle_v_ego(&mut self, v_ego: f32) {
        self.v_ego = f64::from(v_ego);
    }

    /// Feed one ego-motion observation.  Returns the angles implied by the
    /// sample when it was accepted.
    pub fn handle_cam_odom(
        &mut self,
        trans: [f32; 3],
        rot: [f32; 3],
        trans_std: [f32; 3],
    ) -> Option<Vector3<f64>> {
        self.old_rpy_weight = (self.old_rpy_weight - 1.0 / SMOOTH_CYCLES).max(0.0);

        let trans = trans.map(f64::from);
        let yaw_rate = f64::from(rot[2]);
        let straight_and_fast = self.v_ego > MIN_SPEED_FILTER
            && trans[0] > MIN_SPEED_FILTER
            && yaw_rate.abs() < MAX_YAW_RATE_FILTER;
        let certain_if_calib = f64::from(trans_std[1]).atan2(trans[0]) < MAX_VEL_ANGLE_STD
            || self.valid_blocks < INPUTS_NEEDED;
        if !(straight_and_fast && certain_if_calib) {
            return None;
        }

        let observed = Vector3::new(0.0, -trans[2].atan2(trans[0]), trans[1].atan2(trans[0]));
        let new_rpy = Self::sanity_clip(euler_from_rot(
            &(rot_from_euler(&self.smooth_rpy()) * rot_from_euler(&observed)),
        ));

        let block = &mut self.rpys[self.block_idx];
        *block = (*block * self.idx as f64 + new_rpy * (BLOCK_SIZE - self.idx) as f64) / BLOCK_SIZE as f64;
        self.idx = (self.idx + 1) % BLOCK_SIZE;
        if self.idx == 0 {
            self.block_idx += 1;
            self.valid_blocks = self.valid_blocks.max(self.block_idx);
            self.block_idx %= INPUTS_WANTED;
            debug!(valid_blocks = self.valid_blocks, "calibration block completed");
        }
        if self.valid_blocks > 0 {
            let sum: Vector3<f64> = self.rpys[..self.valid_blocks].iter().sum();
            self.rpy = sum / self.valid_blocks as f64;
        }

        self.update_status();
        Some(new_rpy)
    }

    fn update_status(&mut self) {
        self.calib_spread = if self.valid_blocks > 0 {
            let blocks = &self.rpys[..self.valid_blocks];
            let max = blocks.iter().fold(blocks[0], |acc, v| acc.sup(v));
            let min = blocks.iter().fold(blocks[0], |acc, v| acc.inf(v));
            (max - min).abs()
        } else {
            Vector3::zeros()
        };

        let previous = self.cal_status;
        self.cal_status = if self.valid_blocks < INPUTS_NEEDED {
            CalibrationStatus::Uncalibrated
        } else if Self::rpy_valid(&self.rpy) {
            CalibrationStatus::Calibrated
        } else {
            CalibrationStatus::Invalid
        };
        if previous != self.cal_status {
            info!(status = ?self.cal_status, rpy = ?self.rpy, "calibration status changed");
        }

        if self.calib_spread.max() > MAX_ALLOWED_SPREAD && self.cal_status == CalibrationStatus::Calibrated {
            let last_block = self.rpys[(self.block_idx + INPUTS_WANTED - 1) % INPUTS_WANTED];
            info!(spread = ?self.calib_spread, "calibration spread too large; restarting from last block");
            self.reset(last_block, INPUTS_NEEDED, Some(self.rpy));
        }

        if self.idx == 0 && self.block_idx % (INPUTS_WANTED / 5) == 5 {
            self.persist_pending = true;
        }
    }

    /// `true` when the angles sit strictly inside the supported range.
    pub fn rpy_valid(rpy: &Vector3<f64>) -> bool {
        if rpy.iter().any(|v| v.is_nan()) {
            return false;
        }
        PITCH_LIMITS.0 < rpy[1] && rpy[1] < PITCH_LIMITS.1 && YAW_LIMITS.0 < rpy[2] && rpy[2] < YAW_LIMITS.1
    }

    /// Clamp pitch and yaw into the supported range; roll passes through.
    pub fn sanity_clip(rpy: Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            rpy[0],
            rpy[1].clamp(PITCH_LIMITS.0, PITCH_LIMITS.1),
            rpy[2].clamp(YAW_LIMITS.0, YAW_LIMITS.1),
        )
    }

    /// Current estimate, blended with the pre-reset angles while a smooth
    /// transition is in progress.
    pub fn smooth_rpy(&self) -> Vector3<f64> {
        if self.old_rpy_weight > 0.0 {
            self.old_rpy * self.old_rpy_weight + self.rpy * (1.0 - self.old_rpy_weight)
        } else {
            self.rpy
        }
    }

    pub fn status(&self) -> CalibrationStatus {
        self.cal_status
    }

    pub fn valid_blocks(&self) -> usize {
        self.valid_blocks
    }

    /// Returns `true` once per completed persistence window and clears the
    /// request.
    pub fn take_persist_request(&mut self) -> bool {
        std::mem::take(&mut self.persist_pending)
    }

    /// Snapshot for the `liveCalibration` topic and the params cache.
    pub fn to_message(&self) -> LiveCalibrationMsg {
        let smooth = self.smooth_rpy();
        let extrinsic = view_frame_from_road_frame(&Vector3::new(0.0, smooth[1], smooth[2]), f64::from(MODEL_HEIGHT));
        let progress = (self.valid_blocks * BLOCK_SIZE + self.idx) * 100 / (INPUTS_NEEDED * BLOCK_SIZE);
        LiveCalibrationMsg {
            rpy_calib: smooth.iter().map(|v| *v as f32).collect(),
            valid_blocks: self.valid_blocks as u32,
            cal_status: self.cal_status,
            cal_perc: progress.min(100) as u8,
            extrinsic_matrix: extrinsic.iter().map(|v| *v as f32).collect(),
            rpy_calib_spread: self.calib_spread.iter().map(|v| *v as f32).collect(),
        }
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new()
    }
}
