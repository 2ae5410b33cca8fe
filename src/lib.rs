pub mod config;
pub mod device;
pub mod serial;

pub use config::EngineConfig;
pub use device::{DeviceError, DeviceEvent, DeviceManager, DeviceManagerBuilder, DeviceState};
pub use serial::{Channel, DeviceId, ScriptedTransport, SerialInterface};
