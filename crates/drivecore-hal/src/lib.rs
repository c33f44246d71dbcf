//! `drivecore-hal` – Hardware abstraction for the sensors feeding the stack.
//!
//! # Modules
//!
//! - [`camera`] – the [`Camera`][camera::Camera] driver trait.
//! - [`sim`] – [`SyntheticCamera`][sim::SyntheticCamera]: a deterministic
//!   rendered road view for headless runs.
//! - [`camera_manager`] – [`CameraManager`][camera_manager::CameraManager]:
//!   paces a camera and publishes its frames on the bus.
//! - [`sensor`] – the start/stop lifecycle shared by sensor publishers.

pub mod camera;
pub mod camera_manager;
pub mod sensor;
pub mod sim;

pub use camera::{Camera, CameraFrame};
pub use camera_manager::CameraManager;
pub use sensor::Sensor;
pub use sim::SyntheticCamera;
