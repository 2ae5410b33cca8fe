use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serial::{Channel, DeviceId, Telemetry};

/// Durable identity set: which channel every known plug answers on.
pub type KnownDevices = BTreeMap<DeviceId, Channel>;

/// Last known reading of one plug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Relay state; `None` until a reading has been seen.
    pub state: Option<bool>,
    /// Watts, one decimal of precision.
    pub power: f64,
    /// kWh, two decimals of precision.
    pub consumption: f64,
    pub channel: Channel,
    /// Telemetry frames applied since the entry was (re)seeded.
    pub updates: u64,
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Entry for a known plug before any telemetry arrived.
    pub fn zeroed(channel: Channel) -> Self {
        Self {
            state: Some(false),
            power: 0.0,
            consumption: 0.0,
            channel,
            updates: 0,
            last_update: None,
        }
    }

    fn unseen(channel: Channel) -> Self {
        Self {
            state: None,
            ..Self::zeroed(channel)
        }
    }

    pub fn apply(&mut self, telemetry: &Telemetry) {
        self.state = Some(telemetry.state);
        self.power = telemetry.power_watts();
        self.consumption = telemetry.consumption_kwh();
        self.channel = telemetry.channel;
        self.updates += 1;
        self.last_update = Some(Utc::now());
    }
}

/// Known plugs plus the live working set of their readings.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    known: KnownDevices,
    devices: BTreeMap<DeviceId, DeviceState>,
}

impl DeviceRegistry {
    pub fn new(known: KnownDevices) -> Self {
        Self {
            known,
            devices: BTreeMap::new(),
        }
    }

    pub fn known_devices(&self) -> &KnownDevices {
        &self.known
    }

    pub fn is_known(&self, device_id: &DeviceId) -> bool {
        self.known.contains_key(device_id)
    }

    /// Channel used to address a plug; channel 1 when it is not known.
    pub fn channel_for(&self, device_id: &DeviceId) -> Channel {
        self.known.get(device_id).copied().unwrap_or_default()
    }

    /// Reset every known plug to a zeroed entry. Entries for plugs that were
    /// only ever heard by the poller are kept.
    pub fn reseed(&mut self) {
        for (device_id, channel) in &self.known {
            self.devices.insert(device_id.clone(), DeviceState::zeroed(*channel));
        }
    }

    /// The working set, seeded from the known plugs while it is empty.
    pub fn devices(&mut self) -> &BTreeMap<DeviceId, DeviceState> {
        if self.devices.is_empty() && !self.known.is_empty() {
            self.reseed();
        }
        &self.devices
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    /// Apply a real reading, creating the entry if needed.
    pub fn apply_telemetry(&mut self, telemetry: &Telemetry) {
        self.devices
            .entry(telemetry.device_id.clone())
            .or_insert_with(|| DeviceState::unseen(telemetry.channel))
            .apply(telemetry);
    }

    /// Apply a reading heard during a scan and register the plug if it is
    /// new. Returns true only the first time a plug is registered.
    pub fn record_discovery(&mut self, telemetry: &Telemetry) -> bool {
        self.apply_telemetry(telemetry);
        if self.known.contains_key(&telemetry.device_id) {
            return false;
        }
        self.known.insert(telemetry.device_id.clone(), telemetry.channel);
        true
    }

    /// Optimistically record a relay state. Returns the entry's update count
    /// at that moment so callers can wait for newer telemetry.
    pub fn set_state(&mut self, device_id: &DeviceId, on: bool) -> u64 {
        let channel = self.channel_for(device_id);
        let entry = self
            .devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceState::zeroed(channel));
        entry.state = Some(on);
        entry.updates
    }

    pub fn state(&self, device_id: &DeviceId) -> Option<bool> {
        self.devices.get(device_id).and_then(|d| d.state)
    }

    pub fn current_power(&self, device_id: &DeviceId) -> Option<f64> {
        self.devices.get(device_id).map(|d| d.power)
    }

    pub fn total_consumption(&self, device_id: &DeviceId) -> Option<f64> {
        self.devices.get(device_id).map(|d| d.consumption)
    }

    pub fn updates(&self, device_id: &DeviceId) -> u64 {
        self.devices.get(device_id).map_or(0, |d| d.updates)
    }

    /// Forget a plug entirely. Returns its channel if it was known.
    pub fn remove(&mut self, device_id: &DeviceId) -> Option<Channel> {
        self.devices.remove(device_id);
        self.known.remove(device_id)
    }
}
