//! Ordered, off-thread output publication.
//!
//! The pipeline thread hands each iteration's result to [`OutputPublisher`]
//! as an immutable [`PublishJob`].  A single named worker thread serializes
//! the `modelV2`, `desire` and `cameraOdometry` messages and writes them to
//! the [`Transport`] in submission order.  There is exactly one worker, so
//! job N+1 can never overtake job N.
//!
//! The queue between the two threads is bounded.  What happens when it is
//! full is the [`Backpressure`] policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded};
use drivecore_middleware::{Topic, Transport};
use drivecore_types::messages::{self, CameraOdometryMsg, DesireMsg, ModelV2Msg};
use drivecore_types::{DesireVector, DriveError, PredictionBundle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::stats::RuntimeStats;

/// How often a blocked producer checks that the worker is still alive.
const WORKER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Queue-full policy of the publish queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// The pipeline thread waits for the worker to make room.
    Block,
    /// The oldest queued job is discarded to make room.
    #[default]
    DropOldest,
}

/// Everything one publish needs, frozen at enqueue time.
#[derive(Debug, Clone)]
pub struct PublishJob {
    pub bundle: PredictionBundle,
    /// Pulse debounced from `bundle`, fed into the next inference.
    pub pulse: DesireVector,
    /// Publish time, nanoseconds.
    pub timestamp: u64,
    pub frame_id: u32,
    pub stats: RuntimeStats,
}

impl PublishJob {
    pub fn model_v2(&self) -> ModelV2Msg {
        ModelV2Msg {
            frame_id: self.frame_id,
            frame_age: 0,
            frame_drop_perc: self.stats.drop_percent(),
            model_execution_time: self.stats.mean_latency().as_secs_f32(),
            timestamp: self.timestamp,
            position: self.bundle.plan.clone(),
            lane_line_probs: self.bundle.lane_line_probs,
            lead_prob: self.bundle.lead_prob,
            meta: self.bundle.meta.clone(),
        }
    }

    pub fn desire(&self) -> DesireMsg {
        DesireMsg {
            timestamp: self.timestamp,
            pulse: self.pulse,
            desire_state: self.bundle.meta.desire_state,
        }
    }

    pub fn camera_odometry(&self) -> CameraOdometryMsg {
        let pose = &self.bundle.pose;
        CameraOdometryMsg {
            timestamp: self.timestamp,
            frame_id: self.frame_id,
            trans: pose.trans,
            rot: pose.rot,
            trans_std: pose.trans_std,
            rot_std: pose.rot_std,
        }
    }
}

pub struct OutputPublisher {
    sender: Option<Sender<PublishJob>>,
    /// Producer-side handle on the queue, used to evict the oldest job.
    evict: Receiver<PublishJob>,
    policy: Backpressure,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl OutputPublisher {
    /// Spawn the publish worker.
    ///
    /// # Errors
    ///
    /// [`DriveError::Channel`] if the worker thread cannot be spawned.
    pub fn new(
        transport: Arc<dyn Transport>,
        queue_depth: usize,
        policy: Backpressure,
    ) -> Result<Self, DriveError> {
        let (sender, receiver) = bounded::<PublishJob>(queue_depth.max(1));
        let evict = receiver.clone();
        let worker = std::thread::Builder::new()
            .name("modeld-publish".to_string())
            .spawn(move || {
                for job in receiver.iter() {
                    publish_job(transport.as_ref(), &job);
                }
                debug!("publish worker drained");
            })
            .map_err(|e| DriveError::Channel(format!("failed to spawn publish worker: {e}")))?;

        info!(queue_depth, ?policy, "output publisher started");
        Ok(Self {
            sender: Some(sender),
            evict,
            policy,
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Some(worker),
        })
    }

    /// Enqueue `job` for publication.
    ///
    /// Never blocks under [`Backpressure::DropOldest`].  Under
    /// [`Backpressure::Block`] it waits for room only while the worker is
    /// alive.
    pub fn publish(&self, job: PublishJob) -> Result<(), DriveError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| DriveError::Channel("publisher already shut down".into()))?;

        match self.policy {
            Backpressure::Block => {
                let mut job = job;
                loop {
                    match sender.send_timeout(job, WORKER_CHECK_INTERVAL) {
                        Ok(()) => return Ok(()),
                        Err(SendTimeoutError::Timeout(rejected)) => {
                            if !self.worker_alive() {
                                return Err(DriveError::Channel("publish worker gone".into()));
                            }
                            job = rejected;
                        }
                        Err(SendTimeoutError::Disconnected(_)) => {
                            return Err(DriveError::Channel("publish worker gone".into()));
                        }
                    }
                }
            }
            Backpressure::DropOldest => {
                let mut job = job;
                loop {
                    match sender.try_send(job) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(rejected)) => {
                            if let Ok(evicted) = self.evict.try_recv() {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                                warn!(frame_id = evicted.frame_id, "publish queue full; dropped oldest job");
                            }
                            job = rejected;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            return Err(DriveError::Channel("publish worker gone".into()));
                        }
                    }
                }
            }
        }
    }

    fn worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Jobs discarded by the drop-oldest policy so far.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue, let the worker publish what is left, and join it.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("publish worker panicked");
            }
        }
    }
}

impl Drop for OutputPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn publish_job(transport: &dyn Transport, job: &PublishJob) {
    let outputs = [
        (Topic::ModelV2, messages::encode(&job.model_v2())),
        (Topic::Desire, messages::encode(&job.desire())),
        (Topic::CameraOdometry, messages::encode(&job.camera_odometry())),
    ];
    for (topic, encoded) in outputs {
        let result = encoded.and_then(|bytes| transport.publish_buffer(topic, bytes));
        if let Err(e) = result {
            warn!(%topic, frame_id = job.frame_id, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use drivecore_types::{EgoMotion, MetaData, RecurrentState, Trajectory};
    use parking_lot::Mutex;

    /// Holds the worker inside the transport until `release` disconnects.
    struct Gate {
        entered: Sender<u32>,
        release: Receiver<()>,
    }

    /// Records `(topic, frame_id)` in the order the transport sees them.
    /// Publishing anything for `slow_frame` sleeps first, or waits on the
    /// gate when there is one.
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<(Topic, u32)>>,
        slow_frame: Option<u32>,
        delay: Duration,
        gate: Option<Gate>,
    }

    impl Transport for RecordingTransport {
        fn publish_buffer(&self, topic: Topic, payload: Vec<u8>) -> Result<(), DriveError> {
            let frame_id = match topic {
                Topic::ModelV2 => messages::decode::<ModelV2Msg>(&payload)?.frame_id,
                Topic::CameraOdometry => messages::decode::<CameraOdometryMsg>(&payload)?.frame_id,
                _ => messages::decode::<DesireMsg>(&payload)?.timestamp as u32,
            };
            if Some(frame_id) == self.slow_frame {
                match &self.gate {
                    Some(gate) => {
                        let _ = gate.entered.send(frame_id);
                        let _ = gate.release.recv();
                    }
                    None => std::thread::sleep(self.delay),
                }
            }
            self.seen.lock().push((topic, frame_id));
            Ok(())
        }
    }

    fn job(frame_id: u32) -> PublishJob {
        PublishJob {
            bundle: PredictionBundle {
                plan: Trajectory::default(),
                lane_line_probs: [0.0; 4],
                lead_prob: 0.5,
                meta: MetaData::default(),
                pose: EgoMotion::default(),
                recurrent_state: RecurrentState::zeroed(),
            },
            pulse: [0.0; 8],
            // Desire messages carry no frame id; the timestamp doubles as one.
            timestamp: u64::from(frame_id),
            frame_id,
            stats: RuntimeStats::default(),
        }
    }

    #[test]
    fn slow_job_does_not_get_overtaken() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(RecordingTransport {
            slow_frame: Some(2),
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let mut publisher = OutputPublisher::new(transport.clone(), 8, Backpressure::Block)?;
        for id in 1..=3 {
            publisher.publish(job(id))?;
        }
        publisher.shutdown();

        let seen = transport.seen.lock();
        let order: Vec<u32> = seen.iter().filter(|(t, _)| *t == Topic::ModelV2).map(|(_, id)| *id).collect();
        assert_eq!(order, vec![1, 2, 3]);
        // Every job emits all three topics, grouped per job.
        assert_eq!(seen.len(), 9);
        assert_eq!(&seen[3..6], &[(Topic::ModelV2, 2), (Topic::Desire, 2), (Topic::CameraOdometry, 2)]);
        Ok(())
    }

    #[test]
    fn drop_oldest_never_blocks_and_counts_evictions() -> Result<(), Box<dyn std::error::Error>> {
        // Frame 1 holds the worker while the queue overflows.
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();
        let transport = Arc::new(RecordingTransport {
            slow_frame: Some(1),
            gate: Some(Gate {
                entered: entered_tx,
                release: release_rx,
            }),
            ..Default::default()
        });
        let mut publisher = OutputPublisher::new(transport.clone(), 2, Backpressure::DropOldest)?;
        publisher.publish(job(1))?;
        entered_rx.recv_timeout(Duration::from_secs(5))?;
        for id in 2..=6 {
            publisher.publish(job(id))?;
        }
        assert_eq!(publisher.dropped_jobs(), 3);
        drop(release_tx);
        publisher.shutdown();

        let seen = transport.seen.lock();
        let order: Vec<u32> = seen.iter().filter(|(t, _)| *t == Topic::ModelV2).map(|(_, id)| *id).collect();
        assert_eq!(order, vec![1, 5, 6]);
        Ok(())
    }

    struct PanickingTransport;

    impl Transport for PanickingTransport {
        fn publish_buffer(&self, _topic: Topic, _payload: Vec<u8>) -> Result<(), DriveError> {
            panic!("transport exploded");
        }
    }

    #[test]
    fn blocked_publish_returns_when_worker_dies() -> Result<(), Box<dyn std::error::Error>> {
        let mut publisher = OutputPublisher::new(Arc::new(PanickingTransport), 1, Backpressure::Block)?;
        // Job 1 kills the worker; job 2 fills the queue nobody drains.
        publisher.publish(job(1))?;
        publisher.publish(job(2))?;
        assert!(matches!(publisher.publish(job(3)), Err(DriveError::Channel(_))));
        publisher.shutdown();
        Ok(())
    }

    #[test]
    fn publish_after_shutdown_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let transport = Arc::new(RecordingTransport::default());
        let mut publisher = OutputPublisher::new(transport, 1, Backpressure::Block)?;
        publisher.shutdown();
        assert!(matches!(publisher.publish(job(1)), Err(DriveError::Channel(_))));
        Ok(())
    }

    #[test]
    fn model_v2_carries_stats() {
        let mut j = job(9);
        j.stats = RuntimeStats {
            first_frame_id: 0,
            last_frame_id: 100,
            frame_drop_count: 10,
            iteration_count: 2,
            cumulative_latency: Duration::from_millis(100),
            stalled_receives: 0,
        };
        let msg = j.model_v2();
        assert_eq!(msg.frame_id, 9);
        assert_eq!(msg.frame_drop_perc, 10.0);
        assert!((msg.model_execution_time - 0.05).abs() < 1e-6);
        assert_eq!(msg.lead_prob, 0.5);
    }
}
