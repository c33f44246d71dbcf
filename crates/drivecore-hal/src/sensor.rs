//! Lifecycle trait shared by every background sensor publisher.

use drivecore_types::DriveError;

/// A background data source that can be started and stopped by the
/// launcher.
pub trait Sensor: Send {
    /// Spawn the background worker.  Calling `start` on a running sensor is
    /// a no-op.
    fn start(&mut self) -> Result<(), DriveError>;

    /// Signal the worker to exit and wait for it.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}
