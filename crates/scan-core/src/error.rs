//! Error type shared by every NueScan driver.
//!
//! `ScanError` collects everything that can go wrong between a caller and a
//! serial instrument, from opening the port to verifying that a setting took.
//! Driver crates return [`ScanResult`] from all public operations so callers can
//! match on the failure kind instead of parsing strings.
//!
//! ## Error categories
//!
//! 1. **Link errors** - `Transport`, `Disconnected`, `StreamCorrupted`
//!    - Fatal to the current connection; the driver must be reconnected.
//! 2. **Framing errors** - `MalformedHeader`, `TruncatedPayload`
//!    - Mean "not enough bytes yet". The receive pump waits for more input.
//! 3. **Rejected requests** - `OutOfRange`, `InvalidFrequency`, `InvalidPeriod`,
//!    `InvalidChannel`, `NotReady`, `Interlock`
//!    - Raised before any byte is written; device state is untouched.
//! 4. **Outcome errors** - `VerificationFailed`, `Timeout`, `Cancelled`, `EmptyResponse`
//!    - The command went out but the expected result was not observed.
//! 5. **Discovery errors** - `DeviceNotFound`, `PortEnumeration`

use thiserror::Error;

/// Convenience alias for results using [`ScanError`].
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type for device communication.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Opening, writing or reading the serial link failed.
    ///
    /// **Recovery Strategy**: disconnect and reopen the port.
    #[error("Transport error on {port}: {message}")]
    Transport {
        /// Port path or device label
        port: String,
        /// What failed
        message: String,
    },

    /// The connection is closed or its receive pump has exited.
    #[error("Device link is down: {reason}")]
    Disconnected {
        /// Why the link went down
        reason: String,
    },

    /// The byte stream could not be framed; the connection must be reopened.
    #[error("Stream corrupted: {0}")]
    StreamCorrupted(String),

    /// Fewer than six header bytes were supplied to the header parser.
    #[error("Malformed header: need 6 bytes, have {available}")]
    MalformedHeader {
        /// Bytes available
        available: usize,
    },

    /// A fixed-shape payload was shorter than its layout requires.
    #[error("Truncated {kind} payload: need {needed} bytes, have {available}")]
    TruncatedPayload {
        /// Message kind being parsed
        kind: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// A frame carried a message ID outside the known vocabulary.
    #[error("Unknown message id 0x{0:04X}")]
    UnknownMessageId(u16),

    /// A setting was outside the range the device accepts.
    #[error("{parameter} value {value} outside valid range {min}..={max}")]
    OutOfRange {
        /// Parameter name
        parameter: &'static str,
        /// Rejected value
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// Frequency was zero, negative or not finite.
    #[error("Invalid frequency {0} Hz: must be positive")]
    InvalidFrequency(f64),

    /// Period was zero or negative.
    #[error("Invalid period {0} ns: must be positive")]
    InvalidPeriod(i64),

    /// Channel index outside the controller's channel range.
    #[error("Invalid channel {0}")]
    InvalidChannel(u8),

    /// Motion refused because the channel is not enabled, homed and error-free.
    #[error("Channel {0} not ready for movement")]
    NotReady(u8),

    /// A safety interlock blocked the command.
    #[error("Interlock: {0}")]
    Interlock(String),

    /// Set-and-verify exhausted its attempts without observing the expected value.
    #[error("Failed to verify {what} after {attempts} attempts (expected {expected}, last observed {observed})")]
    VerificationFailed {
        /// Setting being verified
        what: String,
        /// Attempts made
        attempts: u32,
        /// Expected value
        expected: String,
        /// Last observed value, or "nothing"
        observed: String,
    },

    /// A wait or query deadline elapsed.
    #[error("Timed out after {elapsed_ms} ms waiting for {what}")]
    Timeout {
        /// What was awaited
        what: String,
        /// Time spent waiting
        elapsed_ms: u64,
    },

    /// A wait was cancelled by its caller.
    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),

    /// No reply arrived for an ASCII query.
    #[error("No response to {command}")]
    EmptyResponse {
        /// Command that went unanswered
        command: String,
    },

    /// A reply arrived but could not be interpreted.
    #[error("Failed to parse response to {command}: '{response}'")]
    Parse {
        /// Command that was answered
        command: String,
        /// Raw response text
        response: String,
    },

    /// Serial-number lookup found no matching device.
    #[error("Device with serial number {serial} not found (available: {available:?})")]
    DeviceNotFound {
        /// Requested serial number
        serial: String,
        /// Serial numbers of the candidates that were found
        available: Vec<String>,
    },

    /// The operating system refused to enumerate serial ports.
    #[error("Port enumeration failed: {0}")]
    PortEnumeration(String),

    /// Semantically invalid configuration values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl ScanError {
    /// Build a transport error for a port.
    pub fn transport(port: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            port: port.into(),
            message: message.to_string(),
        }
    }

    /// True for errors that leave the connection unusable.
    pub fn is_link_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Disconnected { .. } | Self::StreamCorrupted(_)
        )
    }
}

impl From<serialport::Error> for ScanError {
    fn from(err: serialport::Error) -> Self {
        ScanError::PortEnumeration(err.to_string())
    }
}
