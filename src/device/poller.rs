use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, TryLockError};
use std::thread::{self, JoinHandle};

use super::events::DeviceEvent;
use super::manager::Shared;
use crate::serial::protocol::{decode_frame, Frame};

/// Background reader that keeps the registry fresh while nothing else owns
/// the gateway.
pub(crate) struct Poller {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Poller {
    pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name("pca301-poller".to_string())
            .spawn(move || run(&shared, &stop_flag))?;
        Ok(Self { stop, handle })
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop and wait for it. Bounded by one poll read timeout.
    pub(crate) fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            log::error!("Poller thread panicked");
        }
    }
}

fn run(shared: &Shared, stop: &AtomicBool) {
    log::debug!("Poller started");
    let config = &shared.config;

    while !stop.load(Ordering::Acquire) {
        if shared.gate_wanted() {
            thread::sleep(config.poll_interval());
            continue;
        }

        let read = {
            let mut link = match shared.link.try_lock() {
                Ok(link) => link,
                Err(TryLockError::WouldBlock) => {
                    thread::sleep(config.poll_interval());
                    continue;
                }
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };

            if !link.is_open() {
                log::warn!("Serial port closed, poller exiting");
                break;
            }

            link.set_read_timeout(config.poll_read_timeout())
                .and_then(|()| link.read_line())
        };
        thread::yield_now();

        match read {
            Ok(Some(line)) => handle_line(shared, &line),
            Ok(None) => {}
            Err(e) => {
                log::warn!("Serial error in poller: {}, exiting", e);
                break;
            }
        }
    }
    log::debug!("Poller stopped");
}

/// Apply one line read by the poller.
fn handle_line(shared: &Shared, line: &str) {
    match decode_frame(line) {
        Frame::Telemetry(telemetry) => {
            log::debug!("Poller received: {}", line);
            shared.registry().apply_telemetry(&telemetry);
            shared.sink.notify(DeviceEvent::Updated(telemetry.device_id));
        }
        Frame::NoReading { device_id, .. } => {
            log::debug!("Device {} reported no reading", device_id);
        }
        Frame::Malformed(reason) => {
            log::debug!("Ignoring line '{}': {}", line, reason);
        }
        Frame::TooShort(_) => {
            log::trace!("Ignoring line '{}'", line);
        }
    }
}
