use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use super::events::{DeviceEvent, NotificationSink, NullSink};
use super::models::{DeviceRegistry, DeviceState, KnownDevices};
use super::poller::Poller;
use super::scanner;
use super::store::{DeviceStore, MemoryStore};
use super::{lock, DeviceError, Result};
use crate::config::{EngineConfig, ScanWindow};
use crate::serial::protocol::{encode_command, wait_ready};
use crate::serial::{Channel, Command, DeviceId, LineTransport, SerialError};

/// State shared between the engine and its poller thread.
///
/// Lock order is always `link` before `registry`; the registry lock is never
/// held while talking to the gateway.
pub(crate) struct Shared {
    pub(crate) link: Mutex<Box<dyn LineTransport>>,
    /// Callers blocked on `link`; the poller backs off while non-zero.
    gate_waiters: AtomicUsize,
    registry: Mutex<DeviceRegistry>,
    pub(crate) config: EngineConfig,
    store: Arc<dyn DeviceStore>,
    pub(crate) sink: Arc<dyn NotificationSink>,
}

impl Shared {
    /// Blocking acquisition of the gate.
    pub(crate) fn link(&self) -> MutexGuard<'_, Box<dyn LineTransport>> {
        self.gate_waiters.fetch_add(1, Ordering::AcqRel);
        let link = lock(&self.link);
        self.gate_waiters.fetch_sub(1, Ordering::AcqRel);
        link
    }

    pub(crate) fn gate_wanted(&self) -> bool {
        self.gate_waiters.load(Ordering::Acquire) > 0
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        lock(&self.registry)
    }

    fn persist(&self) -> std::result::Result<(), super::StoreError> {
        let known = self.registry().known_devices().clone();
        self.store.save(&known)
    }
}

/// Protocol engine for one PCA301 radio gateway.
///
/// Owns the transport, the device registry and the background poller.
/// All methods take `&self` and may be called from any thread.
pub struct DeviceManager {
    shared: Arc<Shared>,
    poller: Mutex<Option<Poller>>,
}

impl DeviceManager {
    pub fn builder(transport: impl LineTransport + 'static) -> DeviceManagerBuilder {
        DeviceManagerBuilder::new(transport)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Open the gateway, wait for it to come up and start polling.
    ///
    /// Not seeing a ready frame in time is not an error.
    pub fn open(&self) -> Result<()> {
        let config = &self.shared.config;
        let mut slot = lock(&self.poller);
        stop_poller(&mut slot);

        {
            let mut link = self.shared.link();
            if link.is_open() {
                log::warn!("Gateway already open, reopening");
                if let Err(e) = link.close() {
                    log::warn!("Error closing gateway before reopen: {}", e);
                }
            }

            if let Err(e) = link.open() {
                log::error!("Failed to open gateway: {}", e);
                return Err(e.into());
            }

            match wait_ready(&mut **link, config.read_timeout(), config.ready_timeout()) {
                Ok(true) => log::info!("Gateway opened and ready"),
                Ok(false) => log::info!("Gateway opened, no ready frame seen"),
                Err(e) => {
                    log::error!("Gateway failed while waiting for ready frame: {}", e);
                    if let Err(close_err) = link.close() {
                        log::warn!("Error closing gateway: {}", close_err);
                    }
                    return Err(e.into());
                }
            }
        }

        self.start_poller(&mut slot)
    }

    /// Stop the poller and release the gateway. Safe to call repeatedly and
    /// from any thread.
    pub fn close(&self) -> std::result::Result<(), SerialError> {
        stop_poller(&mut lock(&self.poller));

        let mut link = self.shared.link();
        if !link.is_open() {
            log::debug!("Gateway already closed");
            return Ok(());
        }
        match link.close() {
            Ok(()) => {
                log::info!("Gateway closed");
                Ok(())
            }
            Err(e) => {
                log::warn!("Error closing gateway: {}", e);
                Err(e)
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.link().is_open()
    }

    /// Whether the poller thread is alive. False while a scan runs, and after
    /// the poller gave up on a failing transport.
    pub fn is_polling(&self) -> bool {
        match self.poller.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(Poller::is_running),
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().as_ref().is_some_and(Poller::is_running)
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }

    /// Listen for plugs that are not known yet. Returns the newly registered
    /// ids, in the order they were heard.
    ///
    /// A gateway that cannot be opened yields an empty list. A read error
    /// ends the scan early and is returned; plugs registered before it are
    /// kept and persisted.
    pub fn scan(&self, fast: bool) -> Result<Vec<DeviceId>> {
        let config = &self.shared.config;
        let window = config.scan.window(fast);
        log::info!(
            "Starting {} scan (timeout {:?}, settle {:?})",
            if fast { "fast" } else { "full" },
            window.timeout(),
            window.settle()
        );

        let mut slot = lock(&self.poller);
        stop_poller(&mut slot);
        thread::sleep(config.scan_quiesce());

        let discovered = self.scan_exclusive(window);

        if let Err(e) = self.start_poller(&mut slot) {
            log::error!("Failed to restart poller after scan: {}", e);
        }
        discovered
    }

    fn scan_exclusive(&self, window: ScanWindow) -> Result<Vec<DeviceId>> {
        let (discovered, failure) = {
            let mut link = self.shared.link();
            if !link.is_open() {
                if let Err(e) = link.open() {
                    log::error!("Unable to open gateway for scan: {}", e);
                    return Ok(Vec::new());
                }
            }
            if let Err(e) = link.clear_buffers() {
                log::warn!("Failed to flush gateway buffers: {}", e);
            }
            if let Err(e) = link.set_read_timeout(self.shared.config.read_timeout()) {
                log::warn!("Failed to set scan read timeout: {}", e);
            }
            scanner::run(&mut **link, &self.shared, window)
        };

        if let Err(e) = self.shared.persist() {
            log::error!("Failed to save known devices after scan: {}", e);
        }
        for device_id in &discovered {
            self.shared.sink.notify(DeviceEvent::Discovered(device_id.clone()));
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(discovered),
        }
    }

    fn start_poller(&self, slot: &mut Option<Poller>) -> Result<()> {
        stop_poller(slot);
        let poller = Poller::spawn(self.shared.clone())
            .map_err(|e| DeviceError::Thread(e.to_string()))?;
        *slot = Some(poller);
        Ok(())
    }

    /// Live readings, seeded from the known plugs when nothing was heard yet.
    pub fn get_devices(&self) -> BTreeMap<DeviceId, DeviceState> {
        self.shared.registry().devices().clone()
    }

    pub fn get_device(&self, device_id: &DeviceId) -> Option<DeviceState> {
        self.shared.registry().device(device_id).cloned()
    }

    pub fn known_devices(&self) -> KnownDevices {
        self.shared.registry().known_devices().clone()
    }

    /// Relay state, or `None` when the plug or its state is unknown.
    pub fn get_state(&self, device_id: &DeviceId) -> Option<bool> {
        self.shared.registry().state(device_id)
    }

    pub fn get_current_power(&self, device_id: &DeviceId) -> Option<f64> {
        self.shared.registry().current_power(device_id)
    }

    pub fn get_total_consumption(&self, device_id: &DeviceId) -> Option<f64> {
        self.shared.registry().total_consumption(device_id)
    }

    pub fn turn_on(&self, device_id: &DeviceId) -> Result<bool> {
        self.switch(device_id, true)
    }

    pub fn turn_off(&self, device_id: &DeviceId) -> Result<bool> {
        self.switch(device_id, false)
    }

    /// Switch the relay, then ask for a reading and wait until telemetry
    /// newer than the command reports the requested state.
    fn switch(&self, device_id: &DeviceId, on: bool) -> Result<bool> {
        let config = &self.shared.config;
        let channel = self.shared.registry().channel_for(device_id);

        let generation = {
            let mut link = self.shared.link();
            write_command(&mut **link, channel, device_id, Command::SetState(on))?;
            self.shared.registry().set_state(device_id, on)
        };

        thread::sleep(config.command_settle());
        {
            let mut link = self.shared.link();
            write_command(&mut **link, channel, device_id, Command::Status)?;
        }

        let confirmed = self.wait_for(config.confirm_timeout(), |registry| {
            registry.updates(device_id) > generation && registry.state(device_id) == Some(on)
        });
        if confirmed {
            log::info!("Device {} confirmed {}", device_id, if on { "on" } else { "off" });
        } else {
            log::warn!(
                "No confirmation from device {} within {:?}",
                device_id,
                config.confirm_timeout()
            );
        }
        Ok(confirmed)
    }

    /// Ask a plug for a reading. Returns true when its relay state changed
    /// within `timeout`; the request counts as sent either way.
    pub fn status_request(&self, device_id: &DeviceId, timeout: Duration) -> Result<bool> {
        let channel = self.shared.registry().channel_for(device_id);

        let baseline = {
            let mut link = self.shared.link();
            let baseline = self.shared.registry().state(device_id);
            write_command(&mut **link, channel, device_id, Command::Status)?;
            baseline
        };

        let changed = self.wait_for(timeout, |registry| registry.state(device_id) != baseline);
        log::debug!("Status request for {}: state changed = {}", device_id, changed);
        Ok(changed)
    }

    fn wait_for(&self, timeout: Duration, mut done: impl FnMut(&DeviceRegistry) -> bool) -> bool {
        let started = Instant::now();
        loop {
            if done(&*self.shared.registry()) {
                return true;
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(self.shared.config.confirm_poll().min(remaining));
        }
    }

    /// Forget a plug and persist the smaller mapping. Returns the channel it
    /// answered on.
    pub fn remove_device(&self, device_id: &DeviceId) -> Result<Channel> {
        let channel = self
            .shared
            .registry()
            .remove(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.clone()))?;
        log::info!("Removed device {} (channel {})", device_id, channel);

        self.shared.persist()?;
        self.shared.sink.notify(DeviceEvent::Removed(device_id.clone()));
        Ok(channel)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Error closing gateway on drop: {}", e);
        }
    }
}

fn stop_poller(slot: &mut Option<Poller>) {
    if let Some(poller) = slot.take() {
        poller.stop();
    }
}

fn write_command(
    link: &mut dyn LineTransport,
    channel: Channel,
    device_id: &DeviceId,
    command: Command,
) -> Result<()> {
    let frame = encode_command(channel, device_id, command);
    log::debug!("Sending command: {}", frame);
    link.write_all(frame.as_bytes()).map_err(|e| {
        log::error!("Failed to send command {}: {}", frame, e);
        DeviceError::from(e)
    })
}

/// Assembles a [`DeviceManager`]. Without an explicit known-device set the
/// mapping is loaded from the store.
pub struct DeviceManagerBuilder {
    transport: Box<dyn LineTransport>,
    config: EngineConfig,
    store: Option<Arc<dyn DeviceStore>>,
    sink: Option<Arc<dyn NotificationSink>>,
    known: Option<KnownDevices>,
}

impl DeviceManagerBuilder {
    pub fn new(transport: impl LineTransport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            config: EngineConfig::default(),
            store: None,
            sink: None,
            known: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn known_devices(mut self, known: KnownDevices) -> Self {
        self.known = Some(known);
        self
    }

    pub fn build(self) -> Result<DeviceManager> {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::default()));
        let known = match self.known {
            Some(known) => known,
            None => store.load()?,
        };
        log::debug!("Engine starts with {} known devices", known.len());

        let shared = Shared {
            link: Mutex::new(self.transport),
            gate_waiters: AtomicUsize::new(0),
            registry: Mutex::new(DeviceRegistry::new(known)),
            config: self.config,
            store,
            sink: self.sink.unwrap_or_else(|| Arc::new(NullSink)),
        };
        Ok(DeviceManager {
            shared: Arc::new(shared),
            poller: Mutex::new(None),
        })
    }
}
