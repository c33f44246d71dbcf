//! The transport seam.
//!
//! The perception core never speaks to a concrete pub/sub system.  It hands
//! serialized message bytes to a [`Transport`] under a [`Topic`]; the
//! in-process [`EventBus`] is the default implementation, and other
//! transports (shared memory, ZMQ, a test recorder) plug in behind the same
//! trait.

use drivecore_types::{DriveError, Event, EventPayload};
use tracing::trace;

use crate::bus::{EventBus, Topic};

/// Every outbound transport must implement this trait.
///
/// # Contract
///
/// * `publish_buffer` – deliver one already-serialized message.  Having no
///   listeners is not an error; only a broken transport is.
pub trait Transport: Send + Sync {
    fn publish_buffer(&self, topic: Topic, payload: Vec<u8>) -> Result<(), DriveError>;
}

impl Transport for EventBus {
    fn publish_buffer(&self, topic: Topic, payload: Vec<u8>) -> Result<(), DriveError> {
        let bytes = payload.len();
        let event = Event::new("drivecore-middleware::transport", EventPayload::Encoded(payload));
        match self.publish_to(topic, event) {
            Ok(receivers) => {
                trace!(%topic, bytes, receivers, "published buffer");
                Ok(())
            }
            // No subscribers is a normal condition for a broadcast bus.
            Err(DriveError::Channel(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
