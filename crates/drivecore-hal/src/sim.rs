//! Simulated camera for CI and headless runs without physical hardware.
//!
//! [`SyntheticCamera`] renders a crude forward road view: flat grey sky
//! above the horizon, dark asphalt below it, and two white lane markings
//! converging on the vanishing point.  Markings scroll with the configured
//! speed so consecutive frames differ.
//!
//! # Example
//!
//! ```rust
//! use drivecore_hal::camera::Camera;
//! use drivecore_hal::sim::SyntheticCamera;
//!
//! let mut cam = SyntheticCamera::road(20.0, 20.0);
//! let frame = cam.capture().unwrap();
//! assert_eq!(frame.data.len(), (frame.width * frame.height * 3) as usize);
//! ```

use drivecore_types::DriveError;

use crate::camera::{Camera, CameraFrame};

/// Road camera resolution as (width, height).
pub const ROAD_CAMERA_SIZE: (u32, u32) = (1164, 874);
/// Focal length of the simulated road camera, pixels.
pub const ROAD_CAMERA_FOCAL: f32 = 910.0;

const SKY: [u8; 3] = [150, 160, 170];
const ASPHALT: [u8; 3] = [60, 60, 60];
const MARKING: [u8; 3] = [240, 240, 240];
/// Lateral offset of each lane marking, metres.
const LANE_HALF_WIDTH: f32 = 1.8;
const MOUNT_HEIGHT: f32 = 1.22;
/// Length of a dash plus its gap, metres.
const DASH_PERIOD: f32 = 12.0;

/// A deterministic synthetic road camera.
pub struct SyntheticCamera {
    id: String,
    width: u32,
    height: u32,
    focal: f32,
    /// Distance travelled per captured frame, metres.
    step_m: f32,
    travelled_m: f32,
}

impl SyntheticCamera {
    /// A road camera at the stock resolution moving at `speed_mps`, captured
    /// at `fps`.
    pub fn road(speed_mps: f32, fps: f32) -> Self {
        Self::new("road", ROAD_CAMERA_SIZE.0, ROAD_CAMERA_SIZE.1, ROAD_CAMERA_FOCAL, speed_mps, fps)
    }

    pub fn new(id: impl Into<String>, width: u32, height: u32, focal: f32, speed_mps: f32, fps: f32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            focal,
            step_m: if fps > 0.0 { speed_mps / fps } else { 0.0 },
            travelled_m: 0.0,
        }
    }

    fn intrinsics(&self) -> [f32; 9] {
        [
            self.focal, 0.0, self.width as f32 / 2.0,
            0.0, self.focal, self.height as f32 / 2.0,
            0.0, 0.0, 1.0,
        ]
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cx, cy) = (self.width as f32 / 2.0, self.height as f32 / 2.0);
        let mut data = Vec::with_capacity(w * h * 3);
        for v in 0..h {
            let dy = v as f32 - cy;
            for u in 0..w {
                let pixel = if dy <= 0.0 {
                    SKY
                } else {
                    // Ground point seen by this pixel on a flat road.
                    let depth = self.focal * MOUNT_HEIGHT / dy;
                    let lateral = (u as f32 - cx) * depth / self.focal;
                    let on_line = (lateral.abs() - LANE_HALF_WIDTH).abs() < 0.08;
                    let dashed = (depth + self.travelled_m).rem_euclid(DASH_PERIOD) < DASH_PERIOD / 2.0;
                    if on_line && dashed { MARKING } else { ASPHALT }
                };
                data.extend_from_slice(&pixel);
            }
        }
        data
    }
}

impl Camera for SyntheticCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn capture(&mut self) -> Result<CameraFrame, DriveError> {
        if self.width == 0 || self.height == 0 {
            return Err(DriveError::HardwareFault(format!(
                "camera {} has zero-sized sensor",
                self.id
            )));
        }
        let data = self.render();
        self.travelled_m += self.step_m;
        Ok(CameraFrame {
            width: self.width,
            height: self.height,
            data,
            intrinsics: Some(self.intrinsics()),
        })
    }
}
