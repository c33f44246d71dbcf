//! Live calibration daemon.
//!
//! Feeds every `cameraOdometry` message (with the latest `carState` speed)
//! into a [`Calibrator`], persists the estimate to `CalibrationParams` when a
//! persistence window completes, and publishes `liveCalibration` on every
//! fifth odometry message.  The `ResetExtrinsicCalibration` flag is checked
//! at the same cadence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use drivecore_middleware::{BlockingReceiver, EventBus, RecvTimeoutError, Topic, TopicReceiver, Transport};
use drivecore_params::{Params, keys};
use drivecore_types::messages::{self, CameraOdometryMsg, CarStateMsg, LiveCalibrationMsg};
use drivecore_types::{DriveError, EventPayload};
use drivecore_vision::live_calib::Calibrator;
use nalgebra::Vector3;
use tracing::{debug, info, warn};

/// Odometry messages per `liveCalibration` publish.
pub const PUBLISH_EVERY: u64 = 5;

/// How often the worker wakes up to check for a stop request when no
/// odometry is flowing.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Restore the calibrator from the params cache, or start fresh.
pub fn load_calibrator(params: &Params) -> Calibrator {
    match params.get_json::<LiveCalibrationMsg>(keys::CALIBRATION_PARAMS) {
        Ok(Some(cached)) => {
            info!(valid_blocks = cached.valid_blocks, "resuming cached calibration");
            Calibrator::from_cache(&cached)
        }
        Ok(None) => Calibrator::new(),
        Err(e) => {
            warn!(error = %e, "discarding unreadable cached calibration");
            Calibrator::new()
        }
    }
}

/// The daemon's per-message logic, independent of threads and channels.
pub struct CalibrationWorker {
    calibrator: Calibrator,
    params: Arc<Params>,
    transport: Arc<dyn Transport>,
    odometry_seen: u64,
}

impl CalibrationWorker {
    pub fn new(params: Arc<Params>, transport: Arc<dyn Transport>) -> Self {
        Self {
            calibrator: load_calibrator(&params),
            params,
            transport,
            odometry_seen: 0,
        }
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    /// Handle one odometry message taken while the car moved at `v_ego`.
    pub fn on_odometry(&mut self, odom: &CameraOdometryMsg, v_ego: f32) -> Result<(), DriveError> {
        self.calibrator.handle_v_ego(v_ego);
        if let Some(rpy) = self.calibrator.handle_cam_odom(odom.trans, odom.rot, odom.trans_std) {
            debug!(frame_id = odom.frame_id, rpy = ?rpy, "calibration sample accepted");
        }
        if self.calibrator.take_persist_request() {
            self.params.put_json(keys::CALIBRATION_PARAMS, &self.calibrator.to_message())?;
            info!(valid_blocks = self.calibrator.valid_blocks(), "calibration persisted");
        }

        self.odometry_seen += 1;
        if self.odometry_seen % PUBLISH_EVERY == 0 {
            if self.params.get_bool(keys::RESET_EXTRINSIC_CALIBRATION)? {
                info!("extrinsic calibration reset requested");
                self.calibrator.reset(Vector3::zeros(), 0, None);
                self.params.put_bool(keys::RESET_EXTRINSIC_CALIBRATION, false)?;
            }
            let bytes = messages::encode(&self.calibrator.to_message())?;
            self.transport.publish_buffer(Topic::LiveCalibration, bytes)?;
        }
        Ok(())
    }
}

/// Runs a [`CalibrationWorker`] on the `calibrationd` thread.
pub struct Calibrationd {
    bus: EventBus,
    params: Arc<Params>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Calibrationd {
    pub fn new(bus: EventBus, params: Arc<Params>) -> Self {
        Self {
            bus,
            params,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn start(&mut self) -> Result<(), DriveError> {
        if self.is_running() {
            return Ok(());
        }
        self.stop.store(false, Ordering::SeqCst);
        let odometry = BlockingReceiver::new(self.bus.subscribe_to(Topic::CameraOdometry))?;
        let car_state = self.bus.subscribe_to(Topic::CarState);
        let transport: Arc<dyn Transport> = Arc::new(self.bus.clone());
        let params = Arc::clone(&self.params);
        let stop = Arc::clone(&self.stop);

        let handle = std::thread::Builder::new()
            .name("calibrationd".to_string())
            .spawn(move || {
                let worker = CalibrationWorker::new(params, transport);
                run_loop(worker, odometry, car_state, &stop);
            })
            .map_err(|e| DriveError::Channel(format!("failed to spawn calibrationd: {e}")))?;
        self.handle = Some(handle);
        info!("calibrationd started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("calibrationd thread panicked");
            }
            info!("calibrationd stopped");
        }
    }
}

impl Drop for Calibrationd {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    mut worker: CalibrationWorker,
    mut odometry: BlockingReceiver,
    mut car_state: TopicReceiver,
    stop: &AtomicBool,
) {
    let mut v_ego = 0.0f32;
    while !stop.load(Ordering::SeqCst) {
        let event = match odometry.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Lagged(n)) => {
                warn!(skipped = n, "odometry receiver lagged");
                continue;
            }
            Err(RecvTimeoutError::Closed) => break,
        };
        if let Some(EventPayload::Encoded(bytes)) = car_state.latest().map(|e| e.payload) {
            match messages::decode::<CarStateMsg>(&bytes) {
                Ok(state) => v_ego = state.v_ego,
                Err(e) => warn!(error = %e, "ignoring carState"),
            }
        }
        let EventPayload::Encoded(bytes) = event.payload else {
            warn!("non-encoded event on cameraOdometry");
            continue;
        };
        let result = messages::decode::<CameraOdometryMsg>(&bytes).and_then(|odom| worker.on_odometry(&odom, v_ego));
        if let Err(e) = result {
            warn!(error = %e, "calibration update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use drivecore_types::messages::CalibrationStatus;
    use drivecore_vision::live_calib::{BLOCK_SIZE, INPUTS_NEEDED};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Topic, Vec<u8>)>>);

    impl Transport for Recorder {
        fn publish_buffer(&self, topic: Topic, payload: Vec<u8>) -> Result<(), DriveError> {
            self.0.lock().push((topic, payload));
            Ok(())
        }
    }

    fn cruising(frame_id: u32) -> CameraOdometryMsg {
        CameraOdometryMsg {
            timestamp: 0,
            frame_id,
            trans: [20.0, 0.0, 0.0],
            rot: [0.0, 0.0, 0.0],
            trans_std: [0.1, 0.001, 0.1],
            rot_std: [0.0; 3],
        }
    }

    fn worker() -> Result<(CalibrationWorker, Arc<Params>, Arc<Recorder>), Box<dyn std::error::Error>> {
        let params = Arc::new(Params::open_in_memory()?);
        let recorder = Arc::new(Recorder::default());
        Ok((CalibrationWorker::new(Arc::clone(&params), recorder.clone()), params, recorder))
    }

    #[test]
    fn publishes_every_fifth_odometry_message() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker, _, recorder) = worker()?;
        for id in 0..12 {
            worker.on_odometry(&cruising(id), 20.0)?;
        }
        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(t, _)| *t == Topic::LiveCalibration));
        let msg: LiveCalibrationMsg = messages::decode(&seen[1].1)?;
        assert_eq!(msg.rpy_calib.len(), 3);
        assert_eq!(msg.cal_status, CalibrationStatus::Uncalibrated);
        Ok(())
    }

    #[test]
    fn calibrates_and_persists_after_enough_blocks() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker, params, _) = worker()?;
        for id in 0..(BLOCK_SIZE * INPUTS_NEEDED) as u32 {
            worker.on_odometry(&cruising(id), 20.0)?;
        }
        assert_eq!(worker.calibrator().status(), CalibrationStatus::Calibrated);
        let cached: LiveCalibrationMsg = params
            .get_json(keys::CALIBRATION_PARAMS)?
            .ok_or("calibration was not persisted")?;
        assert_eq!(cached.valid_blocks, INPUTS_NEEDED as u32);

        // A restarted daemon resumes from the cache.
        let resumed = CalibrationWorker::new(Arc::clone(&params), Arc::new(Recorder::default()));
        assert_eq!(resumed.calibrator().status(), CalibrationStatus::Calibrated);
        Ok(())
    }

    #[test]
    fn stationary_samples_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker, _, _) = worker()?;
        for id in 0..(BLOCK_SIZE * INPUTS_NEEDED) as u32 {
            worker.on_odometry(&cruising(id), 0.0)?;
        }
        assert_eq!(worker.calibrator().valid_blocks(), 0);
        Ok(())
    }

    #[test]
    fn reset_flag_is_honoured_and_cleared() -> Result<(), Box<dyn std::error::Error>> {
        let (mut worker, params, _) = worker()?;
        for id in 0..(BLOCK_SIZE * INPUTS_NEEDED) as u32 {
            worker.on_odometry(&cruising(id), 20.0)?;
        }
        params.put_bool(keys::RESET_EXTRINSIC_CALIBRATION, true)?;
        for id in 0..PUBLISH_EVERY as u32 {
            worker.on_odometry(&cruising(id), 0.0)?;
        }
        assert_eq!(worker.calibrator().valid_blocks(), 0);
        assert!(!params.get_bool(keys::RESET_EXTRINSIC_CALIBRATION)?);
        Ok(())
    }

    #[test]
    fn daemon_consumes_bus_traffic() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::with_capacities(4, 64);
        let params = Arc::new(Params::open_in_memory()?);
        let mut out = bus.subscribe_to(Topic::LiveCalibration);
        let mut daemon = Calibrationd::new(bus.clone(), params);
        daemon.start()?;
        assert!(daemon.is_running());

        bus.publish_buffer(Topic::CarState, messages::encode(&CarStateMsg { v_ego: 20.0 })?)?;
        for id in 0..PUBLISH_EVERY as u32 {
            bus.publish_buffer(Topic::CameraOdometry, messages::encode(&cruising(id))?)?;
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            received = out.try_recv();
            std::thread::sleep(Duration::from_millis(10));
        }
        daemon.stop();
        assert!(!daemon.is_running());
        assert!(received.is_some(), "no liveCalibration published");
        Ok(())
    }
}
