//! PCA301 gateway line protocol.
//!
//! The gateway reports plugs with space separated telemetry lines:
//!
//! ```text
//! OK 24 <channel> 4 <addr1> <addr2> <addr3> <state> <power hi> <power lo> <cons hi> <cons lo>
//! ```
//!
//! and accepts comma separated command frames terminated by a literal `s`:
//!
//! ```text
//! <channel>,<cmd>,<addr1>,<addr2>,<addr3>,<flag>,255,255,255,255s
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::interface::LineTransport;

pub const SEND_SUFFIX: &str = "s";

/// Tokens in a complete telemetry line.
pub const FRAME_TOKENS: usize = 12;

/// Power bytes of a frame that carries no reading.
pub const NO_READING_SENTINEL: u8 = 0xAA;

const CMD_STATUS: u8 = 4;
const CMD_SET_STATE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid device id '{0}': expected 9 digits forming three bytes")]
    InvalidDeviceId(String),

    #[error("Invalid channel '{0}'")]
    InvalidChannel(String),
}

/// Radio address of a plug: three zero-padded address bytes, e.g. `009088163`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn from_address(address: [u8; 3]) -> Self {
        Self(format!("{:03}{:03}{:03}", address[0], address[1], address[2]))
    }

    /// The three address bytes, in wire order.
    pub fn address(&self) -> [u8; 3] {
        let mut address = [0u8; 3];
        for (i, byte) in address.iter_mut().enumerate() {
            // Validated on construction
            *byte = self.0[i * 3..i * 3 + 3].parse().unwrap_or_default();
        }
        address
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidDeviceId(s.to_string());
        if s.len() != 9 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        for group in 0..3 {
            s[group * 3..group * 3 + 3].parse::<u8>().map_err(|_| invalid())?;
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Radio sub-channel a plug answers on.
///
/// Held as the decimal value the gateway reports and written to the wire in
/// decimal. Persisted as a two-digit string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(u8);

impl Channel {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self(1)
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    /// Decimal first; `0x`-prefixed or bare hex values from older stores are
    /// accepted as a fallback.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if let Ok(value) = token.parse::<u8>() {
            return Ok(Self(value));
        }
        let hex = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        u8::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidChannel(s.to_string()))
    }
}

impl TryFrom<String> for Channel {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

/// A decoded telemetry reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub device_id: DeviceId,
    pub channel: Channel,
    pub state: bool,
    pub power_raw: u16,
    pub consumption_raw: u16,
}

impl Telemetry {
    /// Instantaneous power in watts.
    pub fn power_watts(&self) -> f64 {
        f64::from(self.power_raw) / 10.0
    }

    /// Cumulative consumption in kWh.
    pub fn consumption_kwh(&self) -> f64 {
        f64::from(self.consumption_raw) / 100.0
    }
}

/// Result of decoding one gateway line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Well-formed frame with a real reading.
    Telemetry(Telemetry),
    /// Well-formed frame whose power bytes are the 170/170 sentinel: the
    /// device was seen but reported nothing.
    NoReading {
        device_id: DeviceId,
        channel: Channel,
    },
    /// Enough tokens, but not a telemetry frame.
    Malformed(String),
    /// Fewer tokens than a telemetry frame has.
    TooShort(usize),
}

impl Frame {
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Frame::Telemetry(t) => Some(&t.device_id),
            Frame::NoReading { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// True for frames with the telemetry layout, readings or not.
    pub fn is_well_formed(&self) -> bool {
        self.device_id().is_some()
    }
}

/// Decode a line strictly: `OK 24 <n> 4` followed by eight numeric fields.
///
/// Used by the background poller and the readiness wait.
pub fn decode_frame(line: &str) -> Frame {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < FRAME_TOKENS {
        return Frame::TooShort(tokens.len());
    }
    if tokens[0] != "OK" || tokens[1] != "24" || tokens[3] != "4" {
        return Frame::Malformed(format!(
            "unexpected header '{} {} {} {}'",
            tokens[0], tokens[1], tokens[2], tokens[3]
        ));
    }
    decode_fields(&tokens)
}

/// Decode a line received during a discovery scan.
///
/// Tolerates leading garbage: tokens are dropped from the front until the
/// line starts with `OK` or would become shorter than a frame. The header
/// tokens themselves are not checked.
pub fn decode_scan_line(line: &str) -> Frame {
    let trimmed = line.trim();
    let mut tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if trimmed.len() < 2 {
        return Frame::TooShort(tokens.len());
    }

    if tokens.len() > FRAME_TOKENS {
        let skip = tokens
            .iter()
            .take(tokens.len() - FRAME_TOKENS + 1)
            .position(|t| *t == "OK")
            .unwrap_or(tokens.len() - FRAME_TOKENS + 1);
        tokens.drain(..skip);
    }

    if tokens.len() < FRAME_TOKENS {
        return Frame::TooShort(tokens.len());
    }
    decode_fields(&tokens)
}

fn decode_fields(tokens: &[&str]) -> Frame {
    parse_fields(tokens).unwrap_or_else(Frame::Malformed)
}

fn field(tokens: &[&str], index: usize) -> Result<u8, String> {
    tokens[index]
        .parse::<u8>()
        .map_err(|_| format!("field {} '{}' is not a byte", index, tokens[index]))
}

fn parse_fields(tokens: &[&str]) -> Result<Frame, String> {
    let channel = Channel::new(field(tokens, 2)?);
    let address = [field(tokens, 4)?, field(tokens, 5)?, field(tokens, 6)?];
    let device_id = DeviceId::from_address(address);
    let state = field(tokens, 7)? != 0;
    let (power_hi, power_lo) = (field(tokens, 8)?, field(tokens, 9)?);
    let (cons_hi, cons_lo) = (field(tokens, 10)?, field(tokens, 11)?);

    if power_hi == NO_READING_SENTINEL && power_lo == NO_READING_SENTINEL {
        return Ok(Frame::NoReading { device_id, channel });
    }

    Ok(Frame::Telemetry(Telemetry {
        device_id,
        channel,
        state,
        power_raw: u16::from_be_bytes([power_hi, power_lo]),
        consumption_raw: u16::from_be_bytes([cons_hi, cons_lo]),
    }))
}

/// Commands the gateway relays to a plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the plug to report its current reading.
    Status,
    /// Switch the relay on (`true`) or off.
    SetState(bool),
}

impl Command {
    fn code(self) -> u8 {
        match self {
            Command::Status => CMD_STATUS,
            Command::SetState(_) => CMD_SET_STATE,
        }
    }

    fn flag(self) -> u8 {
        match self {
            Command::Status => 0,
            Command::SetState(on) => u8::from(on),
        }
    }
}

/// Encode a command frame. No newline is appended.
pub fn encode_command(channel: Channel, device_id: &DeviceId, command: Command) -> String {
    let [addr1, addr2, addr3] = device_id.address();
    let fields = [
        channel.value(),
        command.code(),
        addr1,
        addr2,
        addr3,
        command.flag(),
        255,
        255,
        255,
        255,
    ];
    let body: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    format!("{}{}", body.join(","), SEND_SUFFIX)
}

/// Read lines until the gateway emits a telemetry-shaped line or `timeout`
/// passes. Returns whether the gateway was seen; running out of time is not
/// an error.
///
/// Each read waits at most `read_timeout` and never past `timeout`; the link
/// is left with `read_timeout` set.
pub fn wait_ready(
    link: &mut dyn LineTransport,
    read_timeout: Duration,
    timeout: Duration,
) -> super::Result<bool> {
    let start = Instant::now();
    let ready = loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            log::debug!("No ready frame within {:?}, continuing", timeout);
            break false;
        }
        link.set_read_timeout(read_timeout.min(remaining))?;
        if let Some(line) = link.read_line()? {
            if decode_frame(&line).is_well_formed() {
                log::debug!("Gateway ready: {}", line);
                break true;
            }
            log::debug!("Waiting for gateway, skipped: {}", line);
        }
    };
    link.set_read_timeout(read_timeout)?;
    Ok(ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::ScriptedTransport;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[test]
    fn test_device_id_address_round_trip() {
        for raw in ["009088163", "000000000", "255255255", "001002003"] {
            let device_id = id(raw);
            assert_eq!(DeviceId::from_address(device_id.address()).as_str(), raw);
        }
        assert_eq!(id("009088163").address(), [9, 88, 163]);
    }

    #[test]
    fn test_device_id_rejects_bad_input() {
        assert!("09088163".parse::<DeviceId>().is_err());
        assert!("0090881634".parse::<DeviceId>().is_err());
        assert!("00908816a".parse::<DeviceId>().is_err());
        assert!("256000000".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_channel_parsing() {
        assert_eq!("01".parse::<Channel>().unwrap(), Channel::new(1));
        assert_eq!("12".parse::<Channel>().unwrap(), Channel::new(12));
        assert_eq!("0A".parse::<Channel>().unwrap(), Channel::new(10));
        assert_eq!("0x0f".parse::<Channel>().unwrap(), Channel::new(15));
        assert!("zz".parse::<Channel>().is_err());
        assert_eq!(Channel::new(3).to_string(), "03");
    }

    #[test]
    fn test_decode_telemetry_frame() {
        let frame = decode_frame("OK 24 1 4 9 88 163 1 1 44 2 18");
        let Frame::Telemetry(t) = frame else { panic!("expected telemetry") };
        assert_eq!(t.device_id.as_str(), "009088163");
        assert_eq!(t.channel, Channel::new(1));
        assert!(t.state);
        assert_eq!(t.power_raw, 300);
        assert!((t.power_watts() - 30.0).abs() < f64::EPSILON);
        assert_eq!(t.consumption_raw, 530);
        assert!((t.consumption_kwh() - 5.3).abs() < 1e-9);
    }

    #[test]
    fn test_decode_sentinel_is_no_reading() {
        let frame = decode_frame("OK 24 3 4 9 88 163 0 170 170 0 0");
        assert_eq!(
            frame,
            Frame::NoReading {
                device_id: id("009088163"),
                channel: Channel::new(3),
            }
        );
        assert!(frame.is_well_formed());
    }

    #[test]
    fn test_decode_rejects_non_frames() {
        assert_eq!(decode_frame(""), Frame::TooShort(0));
        assert_eq!(decode_frame("[pcaSerial.4] = 1"), Frame::TooShort(3));
        assert!(matches!(decode_frame("L 24 1 4 9 88 163 0 0 0 0 0"), Frame::Malformed(_)));
        assert!(matches!(decode_frame("OK 24 1 4 9 88 999 0 0 0 0 0"), Frame::Malformed(_)));
    }

    #[test]
    fn test_scan_line_skips_leading_garbage() {
        let frame = decode_scan_line("xx yy OK 24 2 4 1 2 3 0 0 5 0 7\r\n");
        let Frame::Telemetry(t) = frame else { panic!("expected telemetry") };
        assert_eq!(t.device_id.as_str(), "001002003");
        assert_eq!(t.channel, Channel::new(2));
        assert_eq!(t.power_raw, 5);
    }

    #[test]
    fn test_scan_line_too_short() {
        assert_eq!(decode_scan_line(" a "), Frame::TooShort(1));
        assert_eq!(decode_scan_line("OK 24 2 4 1 2 3"), Frame::TooShort(7));
        // Garbage that never reaches an OK token is trimmed down below frame length
        assert_eq!(decode_scan_line("a b c d e f g h i j k l m"), Frame::TooShort(11));
    }

    #[test]
    fn test_encode_commands() {
        let device = id("009088163");
        assert_eq!(
            encode_command(Channel::new(1), &device, Command::SetState(true)),
            "1,5,9,88,163,1,255,255,255,255s"
        );
        assert_eq!(
            encode_command(Channel::new(1), &device, Command::SetState(false)),
            "1,5,9,88,163,0,255,255,255,255s"
        );
        assert_eq!(
            encode_command(Channel::new(12), &device, Command::Status),
            "12,4,9,88,163,0,255,255,255,255s"
        );
    }

    #[test]
    fn test_wait_ready_finds_ready_frame() {
        let mut link = ScriptedTransport::new();
        link.open().unwrap();
        link.push_lines(["boot banner", "OK 24 1 4 0 0 1 0 0 0 0 0"]);
        let ready = wait_ready(&mut link, Duration::from_millis(10), Duration::from_secs(1));
        assert!(ready.unwrap());
        assert_eq!(link.pending_lines(), 0);
    }

    #[test]
    fn test_wait_ready_bounded_by_its_own_timeout() {
        let mut link = ScriptedTransport::new();
        link.open().unwrap();

        let started = Instant::now();
        let ready = wait_ready(&mut link, Duration::from_secs(5), Duration::from_millis(100));
        assert!(!ready.unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
