use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::models::KnownDevices;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Device store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device store format error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the device-to-channel mapping lives between runs.
pub trait DeviceStore: Send + Sync {
    fn load(&self) -> Result<KnownDevices, StoreError>;

    fn save(&self, known: &KnownDevices) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredMapping {
    #[serde(default)]
    channels: KnownDevices,
}

/// JSON document of the form `{"channels": {"009088163": "01"}}`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DeviceStore for JsonFileStore {
    fn load(&self) -> Result<KnownDevices, StoreError> {
        if !self.path.exists() {
            log::debug!("No device store at {}, starting empty", self.path.display());
            return Ok(KnownDevices::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let stored: StoredMapping = serde_json::from_str(&raw)?;
        log::info!("Loaded {} known devices from {}", stored.channels.len(), self.path.display());
        Ok(stored.channels)
    }

    fn save(&self, known: &KnownDevices) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let stored = StoredMapping {
            channels: known.clone(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;
        log::info!("Saved {} known devices to {}", known.len(), self.path.display());
        Ok(())
    }
}

/// Keeps the mapping in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    known: Mutex<KnownDevices>,
}

impl MemoryStore {
    pub fn new(known: KnownDevices) -> Self {
        Self {
            known: Mutex::new(known),
        }
    }

    pub fn snapshot(&self) -> KnownDevices {
        self.known.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl DeviceStore for MemoryStore {
    fn load(&self) -> Result<KnownDevices, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, known: &KnownDevices) -> Result<(), StoreError> {
        *self.known.lock().unwrap_or_else(PoisonError::into_inner) = known.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{Channel, DeviceId};

    #[test]
    fn test_json_store_round_trips_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("devices.json"));
        assert!(store.load().unwrap().is_empty());

        let mut known = KnownDevices::new();
        known.insert("009088163".parse::<DeviceId>().unwrap(), Channel::new(1));
        known.insert("001002003".parse::<DeviceId>().unwrap(), Channel::new(12));
        store.save(&known).unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains(r#""009088163": "01""#));
        assert_eq!(store.load().unwrap(), known);
    }

    #[test]
    fn test_json_store_reads_legacy_hex_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, r#"{"channels": {"009088163": "0A"}}"#).unwrap();

        let known = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(known[&"009088163".parse::<DeviceId>().unwrap()], Channel::new(10));
    }

    #[test]
    fn test_json_store_rejects_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, r#"{"channels": {"12": "01"}}"#).unwrap();
        assert!(matches!(JsonFileStore::new(&path).load(), Err(StoreError::Json(_))));
    }
}
