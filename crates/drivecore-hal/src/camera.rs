//! Generic `Camera` trait and supporting types for image-capture hardware.

use drivecore_types::DriveError;

/// A raw image frame returned by a camera driver.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Packed RGB888 pixel data, row major.
    pub data: Vec<u8>,
    /// Row-major 3×3 camera matrix, when the driver knows it.
    pub intrinsics: Option<[f32; 9]>,
}

/// A camera or image-capture device.
///
/// Drivers are handed to a
/// [`CameraManager`][crate::camera_manager::CameraManager], which paces
/// capture and stamps frame ids.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"road"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::HardwareFault`] if the frame cannot be captured
    /// (e.g. the device is disconnected or the buffer is unavailable).
    fn capture(&mut self) -> Result<CameraFrame, DriveError>;
}
