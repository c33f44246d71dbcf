//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  A slow subscriber lags and loses the oldest messages instead
//! of back-pressuring the publisher.
//!
//! # Topics
//!
//! | Topic | Wire name | Typical traffic |
//! |---|---|---|
//! | [`Topic::RoadCameraState`] | `roadCameraState` | Raw road-camera frames (~20 Hz) |
//! | [`Topic::PulseDesire`] | `pulseDesire` | One-shot maneuver override index |
//! | [`Topic::LiveCalibration`] | `liveCalibration` | Mounting angles (~4 Hz) |
//! | [`Topic::CarState`] | `carState` | Vehicle speed |
//! | [`Topic::ModelV2`] | `modelV2` | Decoded predictions |
//! | [`Topic::Desire`] | `desire` | Desire pulse vector |
//! | [`Topic::CameraOdometry`] | `cameraOdometry` | Ego-motion |

use std::time::Duration;

use drivecore_types::{DriveError, Event};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity for message lanes.
const DEFAULT_CAPACITY: usize = 256;

/// Default capacity of the frame lane.  Frames are large, so only a handful
/// are buffered before a slow consumer starts lagging.
const DEFAULT_FRAME_CAPACITY: usize = 4;

/// Enumeration of all routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    RoadCameraState,
    PulseDesire,
    LiveCalibration,
    CarState,
    ModelV2,
    Desire,
    CameraOdometry,
}

impl Topic {
    /// The topic name used on the wire and in logs.
    pub fn name(self) -> &'static str {
        match self {
            Topic::RoadCameraState => "roadCameraState",
            Topic::PulseDesire => "pulseDesire",
            Topic::LiveCalibration => "liveCalibration",
            Topic::CarState => "carState",
            Topic::ModelV2 => "modelV2",
            Topic::Desire => "desire",
            Topic::CameraOdometry => "cameraOdometry",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    road_camera_state: broadcast::Sender<Event>,
    pulse_desire: broadcast::Sender<Event>,
    live_calibration: broadcast::Sender<Event>,
    car_state: broadcast::Sender<Event>,
    model_v2: broadcast::Sender<Event>,
    desire: broadcast::Sender<Event>,
    camera_odometry: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus where every topic channel has the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_capacities(capacity, capacity)
    }

    /// Create a bus with a dedicated capacity for the frame lane.
    pub fn with_capacities(frame_capacity: usize, message_capacity: usize) -> Self {
        let lane = || broadcast::channel(message_capacity).0;
        Self {
            road_camera_state: broadcast::channel(frame_capacity).0,
            pulse_desire: lane(),
            live_calibration: lane(),
            car_state: lane(),
            model_v2: lane(),
            desire: lane(),
            camera_odometry: lane(),
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`DriveError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, DriveError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| DriveError::Channel(format!("No subscribers for topic {topic}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    ///
    /// The receiver only observes events published after this call.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::RoadCameraState => &self.road_camera_state,
            Topic::PulseDesire => &self.pulse_desire,
            Topic::LiveCalibration => &self.live_calibration,
            Topic::CarState => &self.car_state,
            Topic::ModelV2 => &self.model_v2,
            Topic::Desire => &self.desire,
            Topic::CameraOdometry => &self.camera_odometry,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacities(DEFAULT_FRAME_CAPACITY, DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Return the next already-buffered event without waiting.
    ///
    /// Lag is logged and skipped; `None` means nothing is pending (or the bus
    /// is closed).
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every pending event and keep only the newest one.
    ///
    /// Mirrors the "has this topic been updated since I last looked" polling
    /// style used for low-rate control topics.
    pub fn latest(&mut self) -> Option<Event> {
        let mut latest = None;
        while let Some(event) = self.try_recv() {
            latest = Some(event);
        }
        latest
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

// ---------------------------------------------------------------------------
// Blocking receiver
// ---------------------------------------------------------------------------

/// Why a [`BlockingReceiver::recv_timeout`] call returned without an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    /// Nothing arrived before the deadline.
    Timeout,
    /// The receiver fell behind and `n` events were overwritten.
    Lagged(u64),
    /// Every sender has been dropped.
    Closed,
}

/// A [`TopicReceiver`] usable from a plain (non-async) thread, with a receive
/// deadline.
///
/// Owns a single-threaded Tokio runtime that only drives the timer and the
/// channel wake-ups, so it must not be used from inside another runtime.
pub struct BlockingReceiver {
    inner: TopicReceiver,
    runtime: tokio::runtime::Runtime,
}

impl BlockingReceiver {
    /// Wrap `inner` for blocking use.
    ///
    /// # Errors
    ///
    /// [`DriveError::Channel`] if the timer runtime cannot be created.
    pub fn new(inner: TopicReceiver) -> Result<Self, DriveError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| DriveError::Channel(format!("blocking receiver runtime: {e}")))?;
        Ok(Self { inner, runtime })
    }

    /// Block until the next event arrives or `timeout` elapses.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        let inner = &mut self.inner;
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, inner.recv()).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => Err(RecvTimeoutError::Lagged(n)),
                Ok(Err(broadcast::error::RecvError::Closed)) => Err(RecvTimeoutError::Closed),
                Err(_) => Err(RecvTimeoutError::Timeout),
            }
        })
    }

    pub fn topic(&self) -> Topic {
        self.inner.topic()
    }
}
