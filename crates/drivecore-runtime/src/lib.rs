//! `drivecore-runtime` – The Perception Loop
//!
//! Turns road-camera frames into published driving predictions, one
//! inference per frame, on a dedicated real-time thread.
//!
//! # Modules
//!
//! - [`pipeline`] – [`ModelRunner`][pipeline::ModelRunner], the
//!   Uninitialized → Warming → Steady → Stopped state machine that owns all
//!   per-iteration state, and [`Modeld`][pipeline::Modeld], which runs it on
//!   the `modeld` thread fed from the bus.
//! - [`backend`] – the [`InferenceBackend`][backend::InferenceBackend] /
//!   [`NetworkBuilder`][backend::NetworkBuilder] seam and the recorded-output
//!   [`ReplayBackend`][backend::ReplayBackend].
//! - [`temporal_state`] – desire-pulse edge detection and recurrent-state
//!   carry-over.
//! - [`stats`] – frame-drop and latency accounting.
//! - [`publisher`] – [`OutputPublisher`][publisher::OutputPublisher]:
//!   ordered off-thread serialization of `modelV2`, `desire` and
//!   `cameraOdometry`.
//! - [`calibrationd`] – the live mounting-angle estimator daemon.
//! - [`launcher`] – starts and stops sensors, modeld and daemons together.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod backend;
pub mod calibrationd;
pub mod launcher;
pub mod pipeline;
pub mod publisher;
pub mod stats;
pub mod telemetry;
pub mod temporal_state;

pub use backend::{InferenceBackend, NetworkBuilder, ReplayBackend, ReplayBuilder};
pub use calibrationd::Calibrationd;
pub use launcher::Launcher;
pub use pipeline::{Modeld, ModelRunner, ModelRunnerConfig, PipelineState, TrafficConvention};
pub use publisher::{Backpressure, OutputPublisher, PublishJob};
pub use stats::{RuntimeStats, StatsTracker};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use temporal_state::TemporalState;
