//! The real-time perception loop.
//!
//! [`ModelRunner`] owns every piece of mutable pipeline state (calibration,
//! temporal window, desire pulse, recurrent state, statistics) and moves
//! through four states:
//!
//! ```text
//! Uninitialized ──initialize──▶ Warming ──prime──▶ Steady ──shutdown──▶ Stopped
//! ```
//!
//! * `initialize` builds the backend from the weight artifact, runs the
//!   throwaway warmup inferences and starts the publish worker.
//! * `prime` consumes the first frame: intrinsics, transform, both temporal
//!   slots, then raises `ModelDReady`.
//! * each Steady [`step`][ModelRunner::step] warps, infers, decodes,
//!   debounces, replaces the recurrent state, publishes and records stats.
//!
//! [`Modeld`] runs a runner on the dedicated `modeld` thread, wired to the
//! bus.  Stop requests are observed between iterations only.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use drivecore_middleware::{BlockingReceiver, EventBus, RecvTimeoutError, Topic, Transport};
use drivecore_params::{Params, keys};
use drivecore_types::messages::{self, LiveCalibrationMsg};
use drivecore_types::{DriveError, Event, EventPayload, FrameDescriptor, TRAFFIC_CONVENTION_LEN};
use drivecore_vision::assembler::FrameAssembler;
use drivecore_vision::calibration::CalibrationTracker;
use drivecore_vision::parser::parse_outputs;
use drivecore_vision::warp::FrameWarper;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::backend::{InferenceBackend, ModelInputs, NetworkBuilder, warmup};
use crate::publisher::{Backpressure, OutputPublisher, PublishJob};
use crate::stats::{RuntimeStats, StatsTracker};
use crate::temporal_state::TemporalState;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of the road traffic drives on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficConvention {
    /// Left-hand drive, traffic on the right.
    #[default]
    Lhd,
    Rhd,
}

impl TrafficConvention {
    /// The one-hot model input.
    pub fn one_hot(self) -> [f32; TRAFFIC_CONVENTION_LEN] {
        match self {
            TrafficConvention::Lhd => [1.0, 0.0],
            TrafficConvention::Rhd => [0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRunnerConfig {
    /// Weight artifact handed to the [`NetworkBuilder`].
    pub model_path: PathBuf,
    /// Longest wait for a frame before the receive counts as stalled.
    pub frame_timeout: Duration,
    pub warmup_iterations: usize,
    pub publish_queue_depth: usize,
    pub backpressure: Backpressure,
    pub traffic_convention: TrafficConvention,
}

impl Default for ModelRunnerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("supercombo.replay"),
            frame_timeout: Duration::from_secs(1),
            warmup_iterations: 100,
            publish_queue_depth: 8,
            backpressure: Backpressure::default(),
            traffic_convention: TrafficConvention::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Uninitialized = 0,
    Warming = 1,
    Steady = 2,
    Stopped = 3,
}

impl PipelineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PipelineState::Warming,
            2 => PipelineState::Steady,
            3 => PipelineState::Stopped,
            _ => PipelineState::Uninitialized,
        }
    }
}

/// Owns and advances all pipeline state.  Single-threaded by construction.
pub struct ModelRunner<W: FrameWarper> {
    config: ModelRunnerConfig,
    state: PipelineState,
    calibration: CalibrationTracker,
    assembler: FrameAssembler<W>,
    temporal: TemporalState,
    stats: StatsTracker,
    backend: Option<Box<dyn InferenceBackend>>,
    publisher: Option<OutputPublisher>,
    transport: Arc<dyn Transport>,
    params: Arc<Params>,
    iteration: u64,
}

impl<W: FrameWarper> ModelRunner<W> {
    pub fn new(config: ModelRunnerConfig, warper: W, params: Arc<Params>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            state: PipelineState::Uninitialized,
            calibration: CalibrationTracker::new(),
            assembler: FrameAssembler::new(warper),
            temporal: TemporalState::new(),
            stats: StatsTracker::new(),
            backend: None,
            publisher: None,
            transport,
            params,
            iteration: 0,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn calibration(&self) -> &CalibrationTracker {
        &self.calibration
    }

    pub fn temporal(&self) -> &TemporalState {
        &self.temporal
    }

    pub fn assembler(&self) -> &FrameAssembler<W> {
        &self.assembler
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats.snapshot()
    }

    fn expect_state(&self, expected: PipelineState, op: &str) -> Result<(), DriveError> {
        if self.state != expected {
            return Err(DriveError::FatalStartup(format!(
                "{op} called in state {:?}, expected {expected:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Build the backend, warm it up and start the publish worker.
    ///
    /// # Errors
    ///
    /// [`DriveError::FatalStartup`] when the backend cannot be built or
    /// warmed up.  Nothing has been published at that point.
    pub fn initialize(&mut self, builder: &dyn NetworkBuilder) -> Result<(), DriveError> {
        self.expect_state(PipelineState::Uninitialized, "initialize")?;
        let mut backend = builder
            .build(&self.config.model_path)
            .map_err(|e| DriveError::FatalStartup(e.to_string()))?;
        warmup(backend.as_mut(), self.config.warmup_iterations)
            .map_err(|e| DriveError::FatalStartup(format!("warmup failed: {e}")))?;
        self.publisher = Some(
            OutputPublisher::new(
                Arc::clone(&self.transport),
                self.config.publish_queue_depth,
                self.config.backpressure,
            )
            .map_err(|e| DriveError::FatalStartup(e.to_string()))?,
        );
        self.backend = Some(backend);
        self.state = PipelineState::Warming;
        info!(
            model = %self.config.model_path.display(),
            warmup = self.config.warmup_iterations,
            "modeld warming"
        );
        Ok(())
    }

    /// Consume the first frame and enter the steady state.
    pub fn prime(&mut self, frame: &FrameDescriptor) -> Result<(), DriveError> {
        self.expect_state(PipelineState::Warming, "prime")?;
        if let Some(intrinsics) = &frame.intrinsics {
            self.calibration.update_intrinsics(intrinsics);
        }
        let transform = *self.calibration.transform();
        // The window is only seeded once readiness is written.
        self.params.put_bool(keys::MODELD_READY, true)?;
        if let Err(e) = self.assembler.warp_and_push(frame, &transform) {
            if let Err(clear) = self.params.put_bool(keys::MODELD_READY, false) {
                warn!(error = %clear, "failed to clear ModelDReady");
            }
            return Err(e.into());
        }
        self.stats.prime(frame.frame_id);
        self.state = PipelineState::Steady;
        info!(frame_id = frame.frame_id, "modeld steady");
        Ok(())
    }

    /// Apply a `pulseDesire` payload: an ASCII maneuver index.
    pub fn apply_pulse(&mut self, payload: &[u8]) -> Result<(), DriveError> {
        let index = std::str::from_utf8(payload)
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| DriveError::DecodeFailure(format!("bad pulseDesire payload {payload:?}")))?;
        self.temporal.force_pulse(index)?;
        debug!(index, "desire pulse forced");
        Ok(())
    }

    /// Apply a `liveCalibration` payload.
    pub fn apply_live_calibration(&mut self, payload: &[u8]) -> Result<(), DriveError> {
        let msg: LiveCalibrationMsg = messages::decode(payload)?;
        let rpy = match msg.rpy_calib.as_slice() {
            [r, p, y] => Vector3::new(*r, *p, *y),
            other => {
                return Err(DriveError::DecodeFailure(format!(
                    "rpy_calib has {} entries, expected 3",
                    other.len()
                )));
            }
        };
        self.calibration.update_calibration(rpy)?;
        Ok(())
    }

    /// One steady-state iteration on `frame`.
    ///
    /// Every error is recoverable: the iteration is skipped and the desire
    /// pulse, recurrent state and statistics keep their previous values.
    /// The skipped frame id then shows up as a drop on the next success.
    pub fn step(&mut self, frame: &FrameDescriptor) -> Result<(), DriveError> {
        self.expect_state(PipelineState::Steady, "step")?;
        let start = Instant::now();

        if let Some(intrinsics) = &frame.intrinsics {
            self.calibration.update_intrinsics(intrinsics);
        }
        let transform = *self.calibration.transform();
        self.assembler.warp_and_push(frame, &transform)?;

        let images = self
            .assembler
            .model_input()
            .ok_or_else(|| DriveError::DecodeFailure("temporal window is empty".into()))?;
        let traffic = self.config.traffic_convention.one_hot();
        let pulse_in = *self.temporal.pulse();
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| DriveError::FatalStartup("backend missing in steady state".into()))?;
        let raw = backend.execute(&ModelInputs {
            images: &images,
            desire: &pulse_in,
            traffic_convention: &traffic,
            recurrent_state: self.temporal.recurrent_state().as_slice(),
        })?;
        let bundle = parse_outputs(&raw)?;

        let pulse = self.temporal.update_desire(&bundle);
        self.temporal.update_recurrent_state(&bundle);

        self.iteration += 1;
        let job = PublishJob {
            bundle,
            pulse,
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64,
            frame_id: frame.frame_id,
            stats: self.stats.snapshot(),
        };
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(job) {
                warn!(frame_id = frame.frame_id, error = %e, "enqueue failed");
            }
        }

        self.stats.record(self.iteration, frame.frame_id, start.elapsed());
        Ok(())
    }

    /// Note a frame receive that timed out.  Once the stats warmup is over
    /// it counts as a dropped frame.
    pub fn record_stall(&mut self) {
        self.stats.record_stall();
    }

    /// Lower the readiness flag, drain the publisher and release the
    /// backend.
    pub fn shutdown(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }
        if let Err(e) = self.params.put_bool(keys::MODELD_READY, false) {
            warn!(error = %e, "failed to clear ModelDReady");
        }
        if let Some(mut publisher) = self.publisher.take() {
            publisher.shutdown();
        }
        self.backend = None;
        self.state = PipelineState::Stopped;
        let stats = self.stats.snapshot();
        info!(
            iterations = stats.iteration_count,
            drop_percent = stats.drop_percent(),
            stalled = stats.stalled_receives,
            "modeld stopped"
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread handle
// ─────────────────────────────────────────────────────────────────────────────

/// Runs a [`ModelRunner`] on its own thread, fed from the bus.
pub struct Modeld {
    config: ModelRunnerConfig,
    bus: EventBus,
    params: Arc<Params>,
    transport: Arc<dyn Transport>,
    builder: Arc<dyn NetworkBuilder + Sync>,
    warper_factory: Arc<dyn Fn() -> Box<dyn FrameWarper> + Send + Sync>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl Modeld {
    pub fn new(
        config: ModelRunnerConfig,
        bus: EventBus,
        params: Arc<Params>,
        builder: Arc<dyn NetworkBuilder + Sync>,
        warper_factory: Arc<dyn Fn() -> Box<dyn FrameWarper> + Send + Sync>,
    ) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(bus.clone());
        Self {
            config,
            bus,
            params,
            transport,
            builder,
            warper_factory,
            stop: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(PipelineState::Uninitialized as u8)),
            handle: None,
        }
    }

    /// Publish through `transport` instead of the bus.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the `modeld` thread and wait until the backend is built and
    /// warmed up.
    ///
    /// # Errors
    ///
    /// [`DriveError::FatalStartup`] if the backend fails to load; the thread
    /// has exited by then and `ModelDReady` was never raised.
    pub fn start(&mut self) -> Result<(), DriveError> {
        if self.is_running() {
            return Ok(());
        }
        self.stop.store(false, Ordering::SeqCst);
        self.state.store(PipelineState::Uninitialized as u8, Ordering::SeqCst);

        let frames = BlockingReceiver::new(self.bus.subscribe_to(Topic::RoadCameraState))?;
        let pulses = self.bus.subscribe_to(Topic::PulseDesire);
        let calibrations = self.bus.subscribe_to(Topic::LiveCalibration);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), DriveError>>(1);

        let config = self.config.clone();
        let params = Arc::clone(&self.params);
        let transport = Arc::clone(&self.transport);
        let builder = Arc::clone(&self.builder);
        let warper_factory = Arc::clone(&self.warper_factory);
        let stop = Arc::clone(&self.stop);
        let state = Arc::clone(&self.state);

        let handle = std::thread::Builder::new()
            .name("modeld".to_string())
            .spawn(move || {
                let mut runner = ModelRunner::new(config, warper_factory(), params, transport);
                let init = runner.initialize(builder.as_ref());
                state.store(runner.state() as u8, Ordering::SeqCst);
                let failed = init.is_err();
                let _ = ready_tx.send(init);
                if failed {
                    return;
                }
                run_loop(&mut runner, frames, pulses, calibrations, &stop, &state);
                runner.shutdown();
                state.store(runner.state() as u8, Ordering::SeqCst);
            })
            .map_err(|e| DriveError::FatalStartup(format!("failed to spawn modeld: {e}")))?;

        let init = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(DriveError::FatalStartup("modeld exited during startup".into())));
        match init {
            Ok(()) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    /// Request a stop and join the thread.  The current iteration (or frame
    /// wait, bounded by the frame timeout) finishes first.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("modeld thread panicked");
            }
        }
    }
}

impl Drop for Modeld {
    fn drop(&mut self) {
        self.stop();
    }
}

fn frame_of(event: Event) -> Option<FrameDescriptor> {
    match event.payload {
        EventPayload::Frame(frame) => Some(frame),
        EventPayload::Encoded(_) => None,
    }
}

fn encoded_of(event: Event) -> Option<Vec<u8>> {
    match event.payload {
        EventPayload::Encoded(bytes) => Some(bytes),
        EventPayload::Frame(_) => None,
    }
}

fn run_loop<W: FrameWarper>(
    runner: &mut ModelRunner<W>,
    mut frames: BlockingReceiver,
    mut pulses: drivecore_middleware::TopicReceiver,
    mut calibrations: drivecore_middleware::TopicReceiver,
    stop: &AtomicBool,
    state: &AtomicU8,
) {
    let timeout = runner.config.frame_timeout;
    while !stop.load(Ordering::SeqCst) {
        let frame = match frames.recv_timeout(timeout) {
            Ok(event) => match frame_of(event) {
                Some(frame) => frame,
                None => {
                    warn!("non-frame event on roadCameraState");
                    continue;
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                runner.record_stall();
                warn!(timeout_ms = timeout.as_millis() as u64, "no frame received; stalled");
                continue;
            }
            Err(RecvTimeoutError::Lagged(n)) => {
                warn!(skipped = n, "frame receiver lagged");
                continue;
            }
            Err(RecvTimeoutError::Closed) => {
                info!("frame source closed");
                break;
            }
        };

        if runner.state() == PipelineState::Warming {
            if let Err(e) = runner.prime(&frame) {
                warn!(frame_id = frame.frame_id, error = %e, "priming failed; waiting for next frame");
            }
            state.store(runner.state() as u8, Ordering::SeqCst);
            continue;
        }

        if let Some(payload) = pulses.latest().and_then(encoded_of) {
            if let Err(e) = runner.apply_pulse(&payload) {
                warn!(error = %e, "ignoring pulseDesire");
            }
        }
        if let Some(payload) = calibrations.latest().and_then(encoded_of) {
            if let Err(e) = runner.apply_live_calibration(&payload) {
                warn!(error = %e, "ignoring liveCalibration");
            }
        }

        let span = info_span!("modeld.iteration", frame_id = frame.frame_id);
        let _enter = span.enter();
        if let Err(e) = runner.step(&frame) {
            warn!(error = %e, "iteration skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, ReplayBackend};
    use drivecore_types::messages::{CalibrationStatus, ModelV2Msg};
    use drivecore_types::{DESIRE_LEN, STATE_LEN};
    use drivecore_vision::VisionError;
    use drivecore_vision::parser::NET_OUTPUT_SIZE;
    use drivecore_vision::warp::{INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH};
    use nalgebra::Matrix3;
    use ndarray::Array3;
    use parking_lot::Mutex;

    struct FlatWarper;

    impl FrameWarper for FlatWarper {
        fn warp(&mut self, frame: &FrameDescriptor, _t: &Matrix3<f32>) -> Result<Array3<f32>, VisionError> {
            if frame.frame_id == 999 {
                return Err(VisionError::SingularTransform);
            }
            Ok(Array3::from_elem((INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH), frame.frame_id as f32))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Topic, Vec<u8>)>>);

    impl Transport for Recorder {
        fn publish_buffer(&self, topic: Topic, payload: Vec<u8>) -> Result<(), DriveError> {
            self.0.lock().push((topic, payload));
            Ok(())
        }
    }

    /// Output whose desire_state is one-hot at `hot` and whose recurrent
    /// state is filled with `fill`.
    fn output(hot: Option<usize>, fill: f32) -> Vec<f32> {
        let mut out = vec![0.0; NET_OUTPUT_SIZE];
        let desire_idx = NET_OUTPUT_SIZE - STATE_LEN - 12 - 32 - 48 - DESIRE_LEN;
        if let Some(i) = hot {
            out[desire_idx + i] = 50.0;
        }
        for v in &mut out[NET_OUTPUT_SIZE - STATE_LEN..] {
            *v = fill;
        }
        out
    }

    struct Scripted(Vec<Vec<f32>>);

    impl NetworkBuilder for Scripted {
        fn build(&self, _path: &std::path::Path) -> Result<Box<dyn InferenceBackend>, BackendError> {
            Ok(Box::new(ReplayBackend::from_outputs(self.0.clone())?))
        }
    }

    struct Broken;

    impl NetworkBuilder for Broken {
        fn build(&self, path: &std::path::Path) -> Result<Box<dyn InferenceBackend>, BackendError> {
            Err(BackendError::Load {
                path: path.to_path_buf(),
                details: "no such model".into(),
            })
        }
    }

    fn frame(id: u32) -> FrameDescriptor {
        FrameDescriptor {
            frame_id: id,
            timestamp_eof: 0,
            width: 1,
            height: 1,
            pixels: vec![0u8; 3].into(),
            intrinsics: None,
        }
    }

    fn runner(
        outputs: Vec<Vec<f32>>,
    ) -> Result<(ModelRunner<FlatWarper>, Arc<Params>, Arc<Recorder>), Box<dyn std::error::Error>> {
        let params = Arc::new(Params::open_in_memory()?);
        let recorder = Arc::new(Recorder::default());
        let config = ModelRunnerConfig {
            warmup_iterations: 2,
            backpressure: Backpressure::Block,
            ..Default::default()
        };
        let mut runner = ModelRunner::new(config, FlatWarper, Arc::clone(&params), recorder.clone());
        runner.initialize(&Scripted(outputs))?;
        Ok((runner, params, recorder))
    }

    #[test]
    fn lifecycle_raises_and_clears_readiness() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, params, _) = runner(vec![output(None, 0.0)])?;
        assert_eq!(runner.state(), PipelineState::Warming);
        assert!(!params.get_bool(keys::MODELD_READY)?);

        runner.prime(&frame(1))?;
        assert_eq!(runner.state(), PipelineState::Steady);
        assert!(params.get_bool(keys::MODELD_READY)?);

        runner.shutdown();
        assert_eq!(runner.state(), PipelineState::Stopped);
        assert!(!params.get_bool(keys::MODELD_READY)?);
        Ok(())
    }

    #[test]
    fn backend_load_failure_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let params = Arc::new(Params::open_in_memory()?);
        let mut runner = ModelRunner::new(
            ModelRunnerConfig::default(),
            FlatWarper,
            Arc::clone(&params),
            Arc::new(Recorder::default()),
        );
        let err = runner.initialize(&Broken).unwrap_err();
        assert!(matches!(err, DriveError::FatalStartup(_)));
        assert_eq!(runner.state(), PipelineState::Uninitialized);
        assert!(!params.exists(keys::MODELD_READY)?);
        Ok(())
    }

    #[test]
    fn step_publishes_three_topics_and_carries_state() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, _, recorder) = runner(vec![output(Some(2), 0.5)])?;
        runner.prime(&frame(1))?;
        runner.step(&frame(2))?;
        runner.shutdown();

        assert_eq!(runner.temporal().pulse()[2], runner.temporal().previous_desire_state()[2]);
        assert!(runner.temporal().pulse()[2] > 0.99);
        assert!(runner.temporal().recurrent_state().as_slice().iter().all(|v| *v == 0.5));

        let seen = recorder.0.lock();
        let topics: Vec<Topic> = seen.iter().map(|(t, _)| *t).collect();
        assert_eq!(topics, vec![Topic::ModelV2, Topic::Desire, Topic::CameraOdometry]);
        let msg: ModelV2Msg = messages::decode(&seen[0].1)?;
        assert_eq!(msg.frame_id, 2);
        Ok(())
    }

    #[test]
    fn decode_failure_preserves_previous_state() -> Result<(), Box<dyn std::error::Error>> {
        let mut bad = output(Some(1), 9.0);
        bad[0] = f32::NAN;
        let (mut runner, _, recorder) = runner(vec![output(Some(3), 0.25), bad])?;
        runner.prime(&frame(1))?;
        // Warmup consumed two outputs, so the cycle is back at the good one.
        runner.step(&frame(2))?;
        let pulse_before = *runner.temporal().pulse();
        let stats_before = runner.stats();

        assert!(matches!(runner.step(&frame(3)), Err(DriveError::DecodeFailure(_))));
        assert_eq!(*runner.temporal().pulse(), pulse_before);
        assert!(runner.temporal().recurrent_state().as_slice().iter().all(|v| *v == 0.25));
        assert_eq!(runner.stats(), stats_before);

        runner.shutdown();
        assert_eq!(recorder.0.lock().len(), 3);
        Ok(())
    }

    #[test]
    fn warp_failure_skips_iteration() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, _, recorder) = runner(vec![output(None, 0.0)])?;
        runner.prime(&frame(1))?;
        assert!(matches!(runner.step(&frame(999)), Err(DriveError::InvalidCalibration(_))));
        runner.shutdown();
        assert!(recorder.0.lock().is_empty());
        assert_eq!(runner.stats().iteration_count, 0);
        Ok(())
    }

    #[test]
    fn pulse_override_feeds_next_inference_then_debounces() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, _, _) = runner(vec![output(None, 0.0)])?;
        runner.prime(&frame(1))?;
        runner.apply_pulse(b"4")?;
        assert_eq!(runner.temporal().pulse()[4], 1.0);
        runner.step(&frame(2))?;
        assert_eq!(runner.temporal().pulse()[4], 0.0);

        assert!(runner.apply_pulse(b"banana").is_err());
        assert!(runner.apply_pulse(b"8").is_err());
        runner.shutdown();
        Ok(())
    }

    #[test]
    fn live_calibration_updates_transform() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, _, _) = runner(vec![output(None, 0.0)])?;
        let before = *runner.calibration().transform();
        let msg = LiveCalibrationMsg {
            rpy_calib: vec![0.0, 0.03, -0.01],
            cal_status: CalibrationStatus::Calibrated,
            ..Default::default()
        };
        runner.apply_live_calibration(&messages::encode(&msg)?)?;
        assert_ne!(*runner.calibration().transform(), before);

        let short = LiveCalibrationMsg {
            rpy_calib: vec![0.1],
            ..Default::default()
        };
        assert!(runner.apply_live_calibration(&messages::encode(&short)?).is_err());
        assert!(runner.apply_live_calibration(b"{oops").is_err());
        runner.shutdown();
        Ok(())
    }

    #[test]
    fn stalled_receive_counts_as_drop() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, _, _) = runner(vec![output(None, 0.0)])?;
        runner.prime(&frame(1))?;
        for id in 2..=12 {
            runner.step(&frame(id))?;
        }
        let before = runner.stats();
        assert_eq!(before.frame_drop_count, 0);

        runner.record_stall();
        runner.record_stall();
        runner.step(&frame(13))?;
        let after = runner.stats();
        assert_eq!(after.stalled_receives, 2);
        assert_eq!(after.frame_drop_count, 2);
        assert!(after.drop_percent() > 0.0);

        // Frames lost during a stall are not booked a second time.
        runner.record_stall();
        runner.step(&frame(16))?;
        assert_eq!(runner.stats().frame_drop_count, 4);
        runner.shutdown();
        Ok(())
    }

    #[test]
    fn failed_prime_leaves_window_empty() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, params, _) = runner(vec![output(None, 0.0)])?;
        assert!(runner.prime(&frame(999)).is_err());
        assert_eq!(runner.state(), PipelineState::Warming);
        assert!(!params.get_bool(keys::MODELD_READY)?);
        assert!(runner.assembler().stack().is_none());

        runner.prime(&frame(7))?;
        let stack = runner.assembler().stack().ok_or("window not seeded")?;
        assert_eq!(stack.slot0(), stack.slot1());
        assert!(stack.slot0().iter().all(|v| *v == 7.0));
        assert!(params.get_bool(keys::MODELD_READY)?);
        runner.shutdown();
        Ok(())
    }

    #[test]
    fn step_before_prime_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let (mut runner, _, _) = runner(vec![output(None, 0.0)])?;
        assert!(runner.step(&frame(1)).is_err());
        runner.shutdown();
        Ok(())
    }

    #[test]
    fn traffic_convention_one_hot() {
        assert_eq!(TrafficConvention::Lhd.one_hot(), [1.0, 0.0]);
        assert_eq!(TrafficConvention::Rhd.one_hot(), [0.0, 1.0]);
    }
}
