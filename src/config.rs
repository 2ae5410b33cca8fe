use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::BAUD_RATE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a discovery scan decides it has heard every plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlePolicy {
    /// Stop `settle` after the most recent new device, bounded by `timeout`
    /// from scan start. With no new device, listen until `timeout`.
    Debounce,
    /// Listen until `timeout` has passed since the most recent new device
    /// (or scan start when none was found).
    Legacy,
}

/// Listening bounds for one kind of discovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWindow {
    pub timeout_ms: u64,
    pub settle_ms: u64,
}

impl ScanWindow {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub fast: ScanWindow,
    pub full: ScanWindow,
    pub settle_policy: SettlePolicy,
}

impl ScanConfig {
    pub fn window(&self, fast: bool) -> ScanWindow {
        if fast { self.fast } else { self.full }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            fast: ScanWindow {
                timeout_ms: 5_000,
                settle_ms: 5_000,
            },
            full: ScanWindow {
                timeout_ms: 30_000,
                settle_ms: 15_000,
            },
            settle_policy: SettlePolicy::Debounce,
        }
    }
}

/// Engine settings. Every timing constant of the protocol engine lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub poll_read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub scan_quiesce_ms: u64,
    pub command_settle_ms: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_ms: u64,
    pub scan: ScanConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: BAUD_RATE,
            read_timeout_ms: 2_000,
            ready_timeout_ms: 2_000,
            poll_read_timeout_ms: 500,
            poll_interval_ms: 100,
            scan_quiesce_ms: 500,
            command_settle_ms: 500,
            confirm_timeout_ms: 2_000,
            confirm_poll_ms: 50,
            scan: ScanConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load settings from a JSON file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_read_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scan_quiesce(&self) -> Duration {
        Duration::from_millis(self.scan_quiesce_ms)
    }

    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_gateway_protocol() {
        let config = EngineConfig::default();
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.scan.window(true).timeout_ms, 5_000);
        assert_eq!(config.scan.window(true).settle_ms, 5_000);
        assert_eq!(config.scan.window(false).timeout(), Duration::from_secs(30));
        assert_eq!(config.scan.window(false).settle(), Duration::from_secs(15));
        assert_eq!(config.scan.settle_policy, SettlePolicy::Debounce);
        assert_eq!(config.poll_read_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": "/dev/ttyACM0", "scan": {{"settle_policy": "legacy"}}}}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.scan.settle_policy, SettlePolicy::Legacy);
        assert_eq!(config.scan.full.timeout_ms, 30_000);
        assert_eq!(config.confirm_timeout_ms, 2_000);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(EngineConfig::load(file.path()), Err(ConfigError::Json(_))));
    }
}
