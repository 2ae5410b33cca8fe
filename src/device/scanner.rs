use std::time::Instant;

use super::manager::Shared;
use crate::config::{ScanWindow, SettlePolicy};
use crate::serial::protocol::{decode_scan_line, Frame};
use crate::serial::{DeviceId, LineTransport, SerialError};

/// Decides when a discovery scan stops listening.
#[derive(Debug, Clone)]
pub struct ScanDeadline {
    started: Instant,
    last_find: Option<Instant>,
    window: ScanWindow,
    policy: SettlePolicy,
}

impl ScanDeadline {
    pub fn new(started: Instant, window: ScanWindow, policy: SettlePolicy) -> Self {
        Self {
            started,
            last_find: None,
            window,
            policy,
        }
    }

    pub fn record_find(&mut self, at: Instant) {
        self.last_find = Some(at);
    }

    pub fn found_any(&self) -> bool {
        self.last_find.is_some()
    }

    pub fn expired(&self, now: Instant) -> bool {
        let hard_stop = self.started + self.window.timeout();
        match (self.policy, self.last_find) {
            (SettlePolicy::Debounce, None) => now >= hard_stop,
            (SettlePolicy::Debounce, Some(last)) => {
                now >= hard_stop || now >= last + self.window.settle()
            }
            (SettlePolicy::Legacy, last) => {
                now >= last.unwrap_or(self.started) + self.window.timeout()
            }
        }
    }
}

/// Listen for plugs until the deadline passes or the link fails. The caller
/// holds the gate and has already opened and flushed the link.
///
/// Returns the newly registered plugs, plus the read error that cut the scan
/// short, if any.
pub(crate) fn run(
    link: &mut dyn LineTransport,
    shared: &Shared,
    window: ScanWindow,
) -> (Vec<DeviceId>, Option<SerialError>) {
    let policy = shared.config.scan.settle_policy;
    {
        let mut registry = shared.registry();
        log::debug!(
            "Known devices before scan: {:?}",
            registry.known_devices().keys().collect::<Vec<_>>()
        );
        registry.reseed();
    }

    let mut deadline = ScanDeadline::new(Instant::now(), window, policy);
    let mut discovered = Vec::new();
    let mut failure = None;

    while !deadline.expired(Instant::now()) {
        let line = match link.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => {
                log::error!("Serial error during scan, stopping: {}", e);
                failure = Some(e);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.len() < 2 {
            continue;
        }
        log::debug!("Received line: {}", trimmed);

        match decode_scan_line(trimmed) {
            Frame::Telemetry(telemetry) => {
                let device_id = telemetry.device_id.clone();
                if shared.registry().record_discovery(&telemetry) {
                    log::info!(
                        "New device found: {} (channel {}), waiting {:?} for another device",
                        device_id,
                        telemetry.channel,
                        window.settle()
                    );
                    discovered.push(device_id);
                    deadline.record_find(Instant::now());
                } else {
                    log::info!("Skip device {}, already known", device_id);
                }
            }
            Frame::NoReading { device_id, .. } => {
                log::debug!("Device {} answered without a reading", device_id);
            }
            Frame::TooShort(_) => {
                log::warn!("Malformed device response (too short): {}", trimmed)
            }
            Frame::Malformed(reason) => {
                log::warn!("Error parsing device response: {} - {}", trimmed, reason)
            }
        }
    }

    log::info!(
        "Scan finished, {} new: {:?}",
        discovered.len(),
        discovered.iter().map(DeviceId::as_str).collect::<Vec<_>>()
    );
    (discovered, failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WINDOW: ScanWindow = ScanWindow {
        timeout_ms: 30_000,
        settle_ms: 15_000,
    };

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_debounce_without_finds_runs_to_timeout() {
        let t0 = Instant::now();
        let deadline = ScanDeadline::new(t0, WINDOW, SettlePolicy::Debounce);
        assert!(!deadline.expired(t0 + secs(29)));
        assert!(deadline.expired(t0 + secs(30)));
        assert!(!deadline.found_any());
    }

    #[test]
    fn test_debounce_stops_after_quiet_period() {
        let t0 = Instant::now();
        let mut deadline = ScanDeadline::new(t0, WINDOW, SettlePolicy::Debounce);
        deadline.record_find(t0 + secs(2));
        assert!(!deadline.expired(t0 + secs(16)));
        assert!(deadline.expired(t0 + secs(17)));

        // A later find pushes the quiet period out, but never past the timeout
        deadline.record_find(t0 + secs(20));
        assert!(!deadline.expired(t0 + secs(29)));
        assert!(deadline.expired(t0 + secs(30)));
    }

    #[test]
    fn test_legacy_extends_timeout_from_last_find() {
        let t0 = Instant::now();
        let mut deadline = ScanDeadline::new(t0, WINDOW, SettlePolicy::Legacy);
        assert!(deadline.expired(t0 + secs(30)));

        deadline.record_find(t0 + secs(10));
        assert!(!deadline.expired(t0 + secs(30)));
        assert!(!deadline.expired(t0 + secs(39)));
        assert!(deadline.expired(t0 + secs(40)));
    }
}
