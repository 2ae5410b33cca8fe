pub mod events;
pub mod manager;
pub mod models;
mod poller;
pub mod scanner;
pub mod store;

pub use events::{CallbackSink, DeviceEvent, NotificationSink, NullSink};
pub use manager::{DeviceManager, DeviceManagerBuilder};
pub use models::*;
pub use scanner::ScanDeadline;
pub use store::{DeviceStore, JsonFileStore, MemoryStore, StoreError};

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::serial::{DeviceId, ProtocolError, SerialError};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Serial communication error: {0}")]
    Serial(#[from] SerialError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Device store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Failed to start worker thread: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

// Guarded data is consistent between statements, so a panic elsewhere never
// leaves it half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
