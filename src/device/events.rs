use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::serial::DeviceId;

/// Device lifecycle notifications raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// The poller applied fresh telemetry for this plug.
    Updated(DeviceId),
    /// A scan registered a plug that was not known before.
    Discovered(DeviceId),
    /// The plug was removed from the known set.
    Removed(DeviceId),
}

impl DeviceEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DeviceEvent::Updated(id) | DeviceEvent::Discovered(id) | DeviceEvent::Removed(id) => id,
        }
    }
}

/// Receives engine notifications. Called from the poller thread and from
/// whichever thread runs a scan or removal, so it must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: DeviceEvent);
}

impl NotificationSink for broadcast::Sender<DeviceEvent> {
    fn notify(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.send(event);
    }
}

/// Adapts a closure into a sink.
pub struct CallbackSink<F>(pub F);

impl<F> NotificationSink for CallbackSink<F>
where
    F: Fn(DeviceEvent) + Send + Sync,
{
    fn notify(&self, event: DeviceEvent) {
        (self.0)(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _event: DeviceEvent) {}
}
