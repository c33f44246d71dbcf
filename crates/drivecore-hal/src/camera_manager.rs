//! Paced camera capture onto the event bus.
//!
//! [`CameraManager`] owns one [`Camera`] and a dedicated thread that captures
//! at a fixed rate, stamps each frame with a monotonically increasing id and
//! an end-of-frame timestamp, and publishes it on a bus topic (normally
//! [`Topic::RoadCameraState`]).
//!
//! Capture faults are logged and the frame id is still consumed, so
//! downstream consumers see the gap as a dropped frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use drivecore_middleware::{EventBus, Topic};
use drivecore_types::{DriveError, Event, EventPayload, FrameDescriptor};
use tracing::{debug, info, warn};

use crate::camera::Camera;
use crate::sensor::Sensor;

const SOURCE: &str = "drivecore-hal::camera_manager";

pub struct CameraManager {
    topic: Topic,
    frequency_hz: f32,
    bus: EventBus,
    camera: Option<Box<dyn Camera>>,
    running: Arc<AtomicBool>,
    frames_published: Arc<AtomicU32>,
    worker: Option<JoinHandle<Box<dyn Camera>>>,
}

impl CameraManager {
    pub fn new(camera: Box<dyn Camera>, bus: EventBus, topic: Topic, frequency_hz: f32) -> Self {
        Self {
            topic,
            frequency_hz,
            bus,
            camera: Some(camera),
            running: Arc::new(AtomicBool::new(false)),
            frames_published: Arc::new(AtomicU32::new(0)),
            worker: None,
        }
    }

    /// Frames captured (successfully or not) since construction.
    pub fn frames_published(&self) -> u32 {
        self.frames_published.load(Ordering::Relaxed)
    }
}

impl Sensor for CameraManager {
    fn start(&mut self) -> Result<(), DriveError> {
        if self.is_running() {
            return Ok(());
        }
        if !(self.frequency_hz > 0.0 && self.frequency_hz.is_finite()) {
            return Err(DriveError::HardwareFault(format!(
                "invalid capture frequency {} Hz",
                self.frequency_hz
            )));
        }
        let mut camera = self
            .camera
            .take()
            .ok_or_else(|| DriveError::HardwareFault("camera was lost by a previous worker".into()))?;

        let period = Duration::from_secs_f32(1.0 / self.frequency_hz);
        let running = Arc::clone(&self.running);
        let counter = Arc::clone(&self.frames_published);
        let bus = self.bus.clone();
        let topic = self.topic;
        running.store(true, Ordering::SeqCst);

        let spawned = std::thread::Builder::new()
            .name(format!("camerad-{}", camera.id()))
            .spawn(move || {
                info!(camera = camera.id(), %topic, "camera manager started");
                let epoch = Instant::now();
                let mut next_tick = Instant::now();
                while running.load(Ordering::SeqCst) {
                    let frame_id = counter.fetch_add(1, Ordering::Relaxed);
                    match camera.capture() {
                        Ok(raw) => {
                            let frame = FrameDescriptor {
                                frame_id,
                                timestamp_eof: epoch.elapsed().as_nanos() as u64,
                                width: raw.width,
                                height: raw.height,
                                pixels: raw.data.into(),
                                intrinsics: raw.intrinsics,
                            };
                            if let Err(e) = bus.publish_to(topic, Event::new(SOURCE, EventPayload::Frame(frame))) {
                                debug!(frame_id, error = %e, "frame not delivered");
                            }
                        }
                        Err(e) => warn!(frame_id, error = %e, "capture failed"),
                    }
                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                    } else {
                        next_tick = now;
                    }
                }
                info!(camera = camera.id(), "camera manager stopped");
                camera
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(DriveError::HardwareFault(format!("failed to spawn camera thread: {e}")))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(camera) => self.camera = Some(camera),
                Err(_) => warn!(topic = %self.topic, "camera thread panicked"),
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.stop();
    }
}
