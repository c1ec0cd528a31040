//! Helios ASCII command protocol.
//!
//! Commands are three-letter codes. A query is the bare code, a set command
//! carries one integer value:
//!
//! ```text
//! LDF\r          -> 20000\r      (period between pulses in ns)
//! LDF 20000\r                    (set; no acknowledgement)
//! ```
//!
//! Temperatures are reported in m°C, currents in mA, power in mW.

use std::fmt;

use bytes::{Bytes, BytesMut};
use scan_core::pump::FrameDecoder;
use scan_core::{ScanError, ScanResult};

/// Line terminator for both directions.
pub const TERMINATOR: u8 = b'\r';

/// Longest reply line accepted before the stream is declared corrupted.
pub const DEFAULT_MAX_LINE_LEN: usize = 256;

// =============================================================================
// Commands
// =============================================================================

/// Every command the Helios controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Laser emission enable (0/1)
    Ldo,
    /// Pulse mode (1, 4 or 14)
    Ldg,
    /// Period between pulses in ns
    Ldf,
    /// Remote enable (0/1)
    Lre,
    /// Laser diode pulse current in mA
    Lds,
    /// Pump diode temperature in m°C
    Lta,
    /// Resonator/SHG temperature in m°C
    Lma,
    /// Q-switch temperature in m°C
    Eoa,
    /// Pump diode temperature control deviation in m°C
    Elt,
    /// Resonator/SHG temperature control deviation in m°C
    Elm,
    /// Q-switch temperature control deviation in m°C
    Eeo,
    /// Controller power stage temperature in m°C
    Ltt,
    /// Status register
    Ler,
    /// Clear status register
    Lce,
    /// Clear controller errors
    Cce,
    /// Controller serial number
    Csr,
    /// Laser head serial number
    Hsr,
    /// Laser diode operating hours
    Htr,
    /// Restore factory settings
    Hpr,
    /// Power monitor in mW
    Hmp,
}

impl Command {
    /// All commands, in protocol-manual order.
    pub const ALL: [Command; 20] = [
        Command::Ldo,
        Command::Ldg,
        Command::Ldf,
        Command::Lre,
        Command::Lds,
        Command::Lta,
        Command::Lma,
        Command::Eoa,
        Command::Elt,
        Command::Elm,
        Command::Eeo,
        Command::Ltt,
        Command::Ler,
        Command::Lce,
        Command::Cce,
        Command::Csr,
        Command::Hsr,
        Command::Htr,
        Command::Hpr,
        Command::Hmp,
    ];

    /// Three-letter wire code.
    pub fn code(self) -> &'static str {
        match self {
            Command::Ldo => "LDO",
            Command::Ldg => "LDG",
            Command::Ldf => "LDF",
            Command::Lre => "LRE",
            Command::Lds => "LDS",
            Command::Lta => "LTA",
            Command::Lma => "LMA",
            Command::Eoa => "EOA",
            Command::Elt => "ELT",
            Command::Elm => "ELM",
            Command::Eeo => "EEO",
            Command::Ltt => "LTT",
            Command::Ler => "LER",
            Command::Lce => "LCE",
            Command::Cce => "CCE",
            Command::Csr => "CSR",
            Command::Hsr => "HSR",
            Command::Htr => "HTR",
            Command::Hpr => "HPR",
            Command::Hmp => "HMP",
        }
    }

    /// Documented value range, if the command carries a bounded number.
    pub fn range(self) -> Option<(i64, i64)> {
        match self {
            Command::Ldo | Command::Lre => Some((0, 1)),
            Command::Ldg => Some((0, 14)),
            Command::Ldf => Some((8_000, 60_000)),
            Command::Lds => Some((0, 7_000)),
            Command::Lta | Command::Eoa => Some((5_000, 50_000)),
            Command::Lma => Some((0, 4_000)),
            Command::Elt | Command::Elm | Command::Eeo => Some((-32_768, 32_767)),
            Command::Ltt => Some((5_000, 65_535)),
            Command::Htr => Some((0, 65_535)),
            Command::Hmp => Some((0, 5_000)),
            _ => None,
        }
    }

    /// Check `value` against [`range`](Self::range).
    pub fn check(self, value: f64) -> ScanResult<()> {
        match self.range() {
            Some((min, max)) if !(value.is_finite() && value >= min as f64 && value <= max as f64) => {
                Err(ScanError::OutOfRange {
                    parameter: self.code(),
                    value,
                    min: min as f64,
                    max: max as f64,
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for Command {
    type Err = ScanError;

    fn from_str(s: &str) -> ScanResult<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Command::ALL
            .into_iter()
            .find(|c| c.code() == upper)
            .ok_or_else(|| ScanError::Parse {
                command: "command code".into(),
                response: s.to_string(),
            })
    }
}

// =============================================================================
// Building and parsing
// =============================================================================

/// Build `"CMD\r"` (query) or `"CMD value\r"` (set).
pub fn build(command: Command, value: Option<i64>) -> Vec<u8> {
    let text = match value {
        Some(v) => format!("{} {}\r", command.code(), v),
        None => format!("{}\r", command.code()),
    };
    text.into_bytes()
}

/// Build a set command after checking the value range. Nothing is built on failure.
pub fn build_set(command: Command, value: i64) -> ScanResult<Vec<u8>> {
    command.check(value as f64)?;
    Ok(build(command, Some(value)))
}

/// Trim a reply line.
///
/// # Errors
///
/// [`ScanError::EmptyResponse`] if nothing but whitespace was received.
pub fn parse_response(command: Command, line: &[u8]) -> ScanResult<String> {
    let text = String::from_utf8_lossy(line).trim().to_string();
    if text.is_empty() {
        return Err(ScanError::EmptyResponse {
            command: command.code().to_string(),
        });
    }
    Ok(text)
}

/// Parse an integer reply.
pub fn parse_int(command: Command, text: &str) -> ScanResult<i64> {
    text.trim().parse().map_err(|_| parse_error(command, text))
}

/// Parse a decimal reply.
pub fn parse_float(command: Command, text: &str) -> ScanResult<f64> {
    text.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| parse_error(command, text))
}

/// Parse a `0`/`1` reply.
pub fn parse_flag(command: Command, text: &str) -> ScanResult<bool> {
    match text.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(parse_error(command, text)),
    }
}

fn parse_error(command: Command, text: &str) -> ScanError {
    ScanError::Parse {
        command: command.code().to_string(),
        response: text.to_string(),
    }
}

// =============================================================================
// Unit conversions
// =============================================================================

/// Pulse frequency to the period the controller expects, rounded to whole ns.
pub fn frequency_to_period_ns(frequency_hz: f64) -> ScanResult<i64> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(ScanError::InvalidFrequency(frequency_hz));
    }
    Ok((1e9 / frequency_hz).round() as i64)
}

/// Period in ns back to pulse frequency.
pub fn period_ns_to_frequency(period_ns: i64) -> ScanResult<f64> {
    if period_ns <= 0 {
        return Err(ScanError::InvalidPeriod(period_ns));
    }
    Ok(1e9 / period_ns as f64)
}

/// °C to m°C.
pub fn celsius_to_millicelsius(celsius: f64) -> i64 {
    (celsius * 1000.0).round() as i64
}

/// m°C to °C.
pub fn millicelsius_to_celsius(millicelsius: i64) -> f64 {
    millicelsius as f64 / 1000.0
}

// =============================================================================
// Pulse mode and status register
// =============================================================================

/// Pulse mode (`LDG`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PulseMode {
    /// One pulse per trigger
    SinglePulse,
    /// Pulses while the gate input is active
    Gating,
    /// Free-running pulse train
    #[default]
    ContinuousPulsing,
}

impl PulseMode {
    /// Value sent with `LDG`.
    pub fn value(self) -> i64 {
        match self {
            PulseMode::SinglePulse => 1,
            PulseMode::Gating => 4,
            PulseMode::ContinuousPulsing => 14,
        }
    }
}

impl TryFrom<i64> for PulseMode {
    type Error = ScanError;

    fn try_from(value: i64) -> ScanResult<Self> {
        match value {
            1 => Ok(PulseMode::SinglePulse),
            4 => Ok(PulseMode::Gating),
            14 => Ok(PulseMode::ContinuousPulsing),
            other => Err(parse_error(Command::Ldg, &other.to_string())),
        }
    }
}

/// `LER` status register. Bit meanings depend on the controller model; any
/// set bit is an error or warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusRegister(pub u32);

impl StatusRegister {
    /// Positions of the set bits, lowest first.
    pub fn active_bits(self) -> Vec<u8> {
        (0..32u8).filter(|bit| self.0 & (1 << bit) != 0).collect()
    }

    /// Nonzero register.
    pub fn has_errors(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (bits {:?})", self.0, self.active_bits())
    }
}

// =============================================================================
// Line framing
// =============================================================================

/// Splits the inbound stream at each carriage return.
///
/// Yields the line without its terminator. A stray `\n` left over from a
/// `\r\n` reply is dropped from the front of the next line.
#[derive(Debug)]
pub struct LineDecoder {
    max_len: usize,
}

impl LineDecoder {
    /// Decoder that gives up on lines longer than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LEN)
    }
}

impl FrameDecoder for LineDecoder {
    type Frame = Bytes;

    fn decode(&mut self, buf: &mut BytesMut) -> ScanResult<Option<Bytes>> {
        let Some(end) = buf.iter().position(|&b| b == TERMINATOR) else {
            if buf.len() > self.max_len {
                return Err(ScanError::StreamCorrupted(format!(
                    "{} bytes without a line terminator",
                    buf.len()
                )));
            }
            return Ok(None);
        };

        let mut line = buf.split_to(end + 1);
        line.truncate(end);
        let skip = line.iter().take_while(|&&b| b == b'\n').count();
        Ok(Some(line.freeze().slice(skip..)))
    }
}
