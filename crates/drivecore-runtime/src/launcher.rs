//! Process supervisor: sensors first, then modeld, then the daemons that
//! consume modeld's output.

use std::collections::BTreeMap;

use drivecore_hal::Sensor;
use drivecore_types::DriveError;
use tracing::{info, warn};

use crate::calibrationd::Calibrationd;
use crate::pipeline::Modeld;

pub struct Launcher {
    sensors: BTreeMap<String, Box<dyn Sensor>>,
    modeld: Modeld,
    calibrationd: Calibrationd,
}

impl Launcher {
    pub fn new(sensors: BTreeMap<String, Box<dyn Sensor>>, modeld: Modeld, calibrationd: Calibrationd) -> Self {
        Self {
            sensors,
            modeld,
            calibrationd,
        }
    }

    pub fn sensor(&self, name: &str) -> Option<&dyn Sensor> {
        self.sensors.get(name).map(|s| s.as_ref())
    }

    pub fn modeld(&self) -> &Modeld {
        &self.modeld
    }

    /// Start every sensor that is not already running.  A sensor that fails
    /// to start is logged and skipped.
    pub fn start_sensors(&mut self) {
        for (name, sensor) in &mut self.sensors {
            if sensor.is_running() {
                continue;
            }
            match sensor.start() {
                Ok(()) => info!(sensor = %name, "sensor started"),
                Err(e) => warn!(sensor = %name, error = %e, "sensor failed to start"),
            }
        }
    }

    /// Start the perception pipeline and wait for it to warm up.
    ///
    /// # Errors
    ///
    /// [`DriveError::FatalStartup`] when the model cannot be loaded.
    pub fn start_modeld(&mut self) -> Result<(), DriveError> {
        if self.modeld.is_running() {
            return Ok(());
        }
        self.modeld.start()
    }

    pub fn start_daemons(&mut self) -> Result<(), DriveError> {
        self.calibrationd.start()
    }

    pub fn start_all(&mut self) -> Result<(), DriveError> {
        self.start_sensors();
        self.start_modeld()?;
        self.start_daemons()
    }

    /// Stop everything.  Safe to call more than once.
    pub fn dispose(&mut self) {
        for (name, sensor) in &mut self.sensors {
            if sensor.is_running() {
                sensor.stop();
                info!(sensor = %name, "sensor stopped");
            }
        }
        self.modeld.stop();
        self.calibrationd.stop();
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
