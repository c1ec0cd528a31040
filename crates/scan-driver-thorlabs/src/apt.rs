//! Thorlabs APT binary protocol codec.
//!
//! Every APT message starts with a 6-byte little-endian header:
//!
//! ```text
//! offset  0..2   message id (u16 LE)
//!         2      param1  | payload length (u16 LE, data-bearing messages)
//!         3      param2  |
//!         4      destination (bit 7 set = payload follows)
//!         5      source
//!         6..    payload
//! ```
//!
//! A header-only message carries two one-byte parameters. A data-bearing
//! message sets bit 7 of the destination byte and carries its payload length in
//! bytes 2-3. This module builds and parses those frames; it performs no I/O.

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use scan_core::pump::FrameDecoder;
use scan_core::{ScanError, ScanResult};

/// Header size in bytes.
pub const HEADER_LEN: usize = 6;
/// Largest payload the controller ever sends.
pub const MAX_PAYLOAD_LEN: usize = 255;
/// Destination-byte flag marking a data-bearing message.
pub const DATA_FLAG: u8 = 0x80;

/// Encoder sample period of the BBD203 servo loop in seconds (102.4 µs).
pub const SAMPLE_TIME: f64 = 102.4e-6;
/// mm/s * counts/mm * VELOCITY_SCALE = APT velocity units.
pub const VELOCITY_SCALE: f64 = SAMPLE_TIME * 65536.0;
/// mm/s² * counts/mm * ACCEL_SCALE = APT acceleration units.
pub const ACCEL_SCALE: f64 = SAMPLE_TIME * SAMPLE_TIME * 65536.0;
/// Encoder counts per mm for the MLS203 stage.
pub const DEFAULT_COUNTS_PER_MM: f64 = 20000.0;

/// Number of motor channels on a BBD203.
pub const CHANNEL_COUNT: usize = 3;

// =============================================================================
// Addresses
// =============================================================================

/// Destination and source addresses.
pub mod address {
    /// Host PC
    pub const HOST: u8 = 0x01;
    /// All channels of the controller
    pub const ALL_CHANNELS: u8 = 0x11;
    /// Channel 1 bay; channels 2 and 3 follow consecutively
    pub const CHANNEL_1: u8 = 0x21;
    /// Channel 2 bay
    pub const CHANNEL_2: u8 = 0x22;
    /// Channel 3 bay
    pub const CHANNEL_3: u8 = 0x23;
    /// Controller motherboard (USB interface)
    pub const USB: u8 = 0x50;
}

/// Validated motor channel, 1 to 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    /// Validate a 1-based channel number.
    pub fn new(number: u8) -> ScanResult<Self> {
        if (1..=CHANNEL_COUNT as u8).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ScanError::InvalidChannel(number))
        }
    }

    /// All three channels in order.
    pub fn all() -> [Channel; CHANNEL_COUNT] {
        [Channel(1), Channel(2), Channel(3)]
    }

    /// Map a bay address (0x21..=0x23) back to its channel.
    pub fn from_address(address: u8) -> Option<Self> {
        address
            .checked_sub(address::CHANNEL_1 - 1)
            .and_then(|n| Channel::new(n).ok())
    }

    /// 1-based channel number.
    pub fn number(self) -> u8 {
        self.0
    }

    /// Zero-based index into per-channel tables.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }

    /// Bay address of this channel.
    pub fn address(self) -> u8 {
        address::CHANNEL_1 + (self.0 - 1)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Message IDs
// =============================================================================

macro_rules! message_ids {
    ($($(#[$doc:meta])* $name:ident = $value:literal,)+) => {
        /// Every APT message the driver sends or understands.
        ///
        /// Variant names follow the `MGMSG_*` names of the APT protocol manual.
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum MessageId {
            $($(#[$doc])* $name = $value,)+
        }

        impl TryFrom<u16> for MessageId {
            type Error = ScanError;

            fn try_from(value: u16) -> ScanResult<Self> {
                match value {
                    $($value => Ok(MessageId::$name),)+
                    other => Err(ScanError::UnknownMessageId(other)),
                }
            }
        }
    };
}

message_ids! {
    /// Flash the front-panel LED
    ModIdentify = 0x0223,
    ModSetChanEnableState = 0x0210,
    ModReqChanEnableState = 0x0211,
    ModGetChanEnableState = 0x0212,

    HwDisconnect = 0x0002,
    /// Controller error or event report
    HwResponse = 0x0080,
    /// Controller error report with text
    HwRichResponse = 0x0081,
    HwStartUpdateMsgs = 0x0011,
    HwStopUpdateMsgs = 0x0012,
    HwReqInfo = 0x0005,
    HwGetInfo = 0x0006,

    MotSetPosCounter = 0x0410,
    MotReqPosCounter = 0x0411,
    MotGetPosCounter = 0x0412,
    MotSetEncCounter = 0x0409,
    MotReqEncCounter = 0x040A,
    MotGetEncCounter = 0x040B,

    MotSetHomeParams = 0x0440,
    MotReqHomeParams = 0x0441,
    MotGetHomeParams = 0x0442,
    MotMoveHome = 0x0443,
    MotMoveHomed = 0x0444,

    MotSetMoveRelParams = 0x0445,
    MotReqMoveRelParams = 0x0446,
    MotGetMoveRelParams = 0x0447,
    MotMoveRelative = 0x0448,
    MotSetMoveAbsParams = 0x0450,
    MotReqMoveAbsParams = 0x0451,
    MotGetMoveAbsParams = 0x0452,
    MotMoveAbsolute = 0x0453,
    MotMoveCompleted = 0x0464,
    MotMoveVelocity = 0x0457,
    MotMoveStop = 0x0465,
    MotMoveStopped = 0x0466,

    MotSetVelParams = 0x0413,
    MotReqVelParams = 0x0414,
    MotGetVelParams = 0x0415,

    MotReqStatusUpdate = 0x0480,
    MotGetStatusUpdate = 0x0481,
    MotReqStatusBits = 0x0429,
    MotGetStatusBits = 0x042A,
}

impl MessageId {
    /// Raw wire value.
    pub fn value(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Status bits
// =============================================================================

bitflags! {
    /// Motor status word reported in status updates and status-bits replies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusBits: u32 {
        /// Forward hardware limit switch active
        const FORWARD_LIMIT = 0x0000_0001;
        /// Reverse hardware limit switch active
        const REVERSE_LIMIT = 0x0000_0002;
        /// Moving forward
        const IN_MOTION_FORWARD = 0x0000_0010;
        /// Moving in reverse
        const IN_MOTION_REVERSE = 0x0000_0020;
        /// Jogging forward
        const JOGGING_FORWARD = 0x0000_0040;
        /// Jogging in reverse
        const JOGGING_REVERSE = 0x0000_0080;
        /// Homing in progress
        const HOMING = 0x0000_0200;
        /// Homing completed
        const HOMED = 0x0000_0400;
        /// Position tracking within window
        const TRACKING = 0x0000_1000;
        /// Position settled
        const SETTLED = 0x0000_2000;
        /// Excessive position error or other motion fault
        const MOTION_ERROR = 0x0000_4000;
        /// Motor drive enabled
        const MOTOR_ENABLED = 0x8000_0000;
    }
}

impl StatusBits {
    /// Any bit that means the stage is moving.
    pub const MOTION: StatusBits = StatusBits::IN_MOTION_FORWARD
        .union(StatusBits::IN_MOTION_REVERSE)
        .union(StatusBits::JOGGING_FORWARD)
        .union(StatusBits::JOGGING_REVERSE)
        .union(StatusBits::HOMING);

    /// Keep unknown bits; the controller sets some undocumented ones.
    pub fn from_raw(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// True if any motion bit is set.
    pub fn is_moving(self) -> bool {
        self.intersects(Self::MOTION)
    }
}

// =============================================================================
// Header
// =============================================================================

/// Parsed 6-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw message id
    pub id: u16,
    /// Byte 2
    pub param1: u8,
    /// Byte 3
    pub param2: u8,
    /// Destination byte as sent, including [`DATA_FLAG`]
    pub dest: u8,
    /// Source byte
    pub source: u8,
}

impl Header {
    /// True when a payload follows the header.
    pub fn has_data(&self) -> bool {
        self.dest & DATA_FLAG != 0
    }

    /// Payload length from bytes 2-3 (meaningful only when [`Self::has_data`]).
    pub fn data_len(&self) -> usize {
        usize::from(u16::from_le_bytes([self.param1, self.param2]))
    }

    /// Destination address without the data flag.
    pub fn destination(&self) -> u8 {
        self.dest & !DATA_FLAG
    }

    /// Known message id, or `UnknownMessageId`.
    pub fn message_id(&self) -> ScanResult<MessageId> {
        MessageId::try_from(self.id)
    }

    /// Channel this message concerns, from the destination byte, or from the
    /// source byte for replies addressed to the host.
    pub fn channel(&self) -> Option<Channel> {
        let dest = self.destination();
        Channel::from_address(dest).or_else(|| {
            if dest == address::HOST {
                Channel::from_address(self.source)
            } else {
                None
            }
        })
    }
}

/// Build a header-only message.
pub fn build_header_only(id: u16, param1: u8, param2: u8, dest: u8, source: u8) -> [u8; HEADER_LEN] {
    let id = id.to_le_bytes();
    [id[0], id[1], param1, param2, dest, source]
}

/// Build a data-bearing message; the destination gets [`DATA_FLAG`].
///
/// Payloads longer than [`MAX_PAYLOAD_LEN`] are never built by this crate.
pub fn build_with_data(id: u16, dest: u8, payload: &[u8], source: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.push(dest | DATA_FLAG);
    frame.push(source);
    frame.extend_from_slice(payload);
    frame
}

/// Parse the first six bytes of `buf`.
pub fn parse_header(buf: &[u8]) -> ScanResult<Header> {
    if buf.len() < HEADER_LEN {
        return Err(ScanError::MalformedHeader {
            available: buf.len(),
        });
    }
    Ok(Header {
        id: u16::from_le_bytes([buf[0], buf[1]]),
        param1: buf[2],
        param2: buf[3],
        dest: buf[4],
        source: buf[5],
    })
}

// =============================================================================
// Frames and framing
// =============================================================================

/// One complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptMessage {
    /// Parsed header
    pub header: Header,
    /// Payload after the header (empty for header-only messages)
    pub payload: Bytes,
}

impl AptMessage {
    /// Parse one complete frame held in `frame`.
    pub fn parse(frame: &[u8]) -> ScanResult<Self> {
        let header = parse_header(frame)?;
        let total = frame_len(&header)?;
        if frame.len() < total {
            return Err(ScanError::TruncatedPayload {
                kind: "frame",
                needed: total,
                available: frame.len(),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&frame[HEADER_LEN..total]),
        })
    }
}

fn frame_len(header: &Header) -> ScanResult<usize> {
    if !header.has_data() {
        return Ok(HEADER_LEN);
    }
    let len = header.data_len();
    if len == 0 || len > MAX_PAYLOAD_LEN {
        return Err(ScanError::StreamCorrupted(format!(
            "message 0x{:04X} declares payload length {}",
            header.id, len
        )));
    }
    Ok(HEADER_LEN + len)
}

/// Splits the inbound byte stream into [`AptMessage`]s for the receive pump.
#[derive(Debug, Default)]
pub struct AptDecoder;

impl FrameDecoder for AptDecoder {
    type Frame = AptMessage;

    fn decode(&mut self, buf: &mut BytesMut) -> ScanResult<Option<AptMessage>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = parse_header(buf)?;
        let total = frame_len(&header)?;
        if buf.len() < total {
            return Ok(None);
        }
        let mut frame = buf.split_to(total).freeze();
        let payload = frame.split_off(HEADER_LEN);
        Ok(Some(AptMessage { header, payload }))
    }
}

// =============================================================================
// Payloads
// =============================================================================

fn require(kind: &'static str, payload: &[u8], needed: usize) -> ScanResult<()> {
    if payload.len() < needed {
        Err(ScanError::TruncatedPayload {
            kind,
            needed,
            available: payload.len(),
        })
    } else {
        Ok(())
    }
}

fn u16_at(p: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([p[at], p[at + 1]])
}

fn u32_at(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

fn i32_at(p: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

fn text_at(p: &[u8], at: usize, len: usize) -> String {
    let raw = &p[at..at + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

/// `GET_STATUSUPDATE` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Channel ident inside the payload
    pub channel: u16,
    /// Position counter in encoder counts
    pub position: i32,
    /// Encoder counter
    pub encoder: i32,
    /// Status word
    pub status: StatusBits,
}

impl StatusUpdate {
    /// Payload size in bytes.
    pub const LEN: usize = 14;

    /// Parse from a payload slice.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("status update", payload, Self::LEN)?;
        Ok(Self {
            channel: u16_at(payload, 0),
            position: i32_at(payload, 2),
            encoder: i32_at(payload, 6),
            status: StatusBits::from_raw(u32_at(payload, 10)),
        })
    }

    /// Serialize, as the controller would send it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.position.to_le_bytes());
        out.extend_from_slice(&self.encoder.to_le_bytes());
        out.extend_from_slice(&self.status.bits().to_le_bytes());
        out
    }
}

/// `GET_POSCOUNTER` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionCounter {
    /// Channel ident inside the payload
    pub channel: u16,
    /// Position in encoder counts
    pub position: i32,
}

impl PositionCounter {
    /// Payload size in bytes.
    pub const LEN: usize = 6;

    /// Parse from a payload slice.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("position counter", payload, Self::LEN)?;
        Ok(Self {
            channel: u16_at(payload, 0),
            position: i32_at(payload, 2),
        })
    }

    /// Serialize.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.channel.to_le_bytes().to_vec();
        out.extend_from_slice(&self.position.to_le_bytes());
        out
    }
}

/// `GET_ENCCOUNTER` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderCounter {
    /// Channel ident inside the payload
    pub channel: u16,
    /// Encoder count
    pub count: i32,
}

impl EncoderCounter {
    /// Payload size in bytes.
    pub const LEN: usize = 6;

    /// Parse from a payload slice.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("encoder counter", payload, Self::LEN)?;
        Ok(Self {
            channel: u16_at(payload, 0),
            count: i32_at(payload, 2),
        })
    }

    /// Serialize.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.channel.to_le_bytes().to_vec();
        out.extend_from_slice(&self.count.to_le_bytes());
        out
    }
}

/// `GET_STATUSBITS` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBitsReply {
    /// Channel ident inside the payload
    pub channel: u16,
    /// Status word
    pub status: StatusBits,
}

impl StatusBitsReply {
    /// Payload size in bytes.
    pub const LEN: usize = 6;

    /// Parse from a payload slice.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("status bits", payload, Self::LEN)?;
        Ok(Self {
            channel: u16_at(payload, 0),
            status: StatusBits::from_raw(u32_at(payload, 2)),
        })
    }
}

/// Velocity profile in APT units (`SET_VELPARAMS` / `GET_VELPARAMS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VelocityParams {
    /// Channel ident inside the payload
    pub channel: u16,
    /// Minimum (start) velocity
    pub min_velocity: u32,
    /// Maximum velocity
    pub max_velocity: u32,
    /// Acceleration
    pub acceleration: u32,
}

impl VelocityParams {
    /// Payload size in bytes.
    pub const LEN: usize = 14;

    /// Parse from a payload slice.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("velocity params", payload, Self::LEN)?;
        Ok(Self {
            channel: u16_at(payload, 0),
            min_velocity: u32_at(payload, 2),
            max_velocity: u32_at(payload, 6),
            acceleration: u32_at(payload, 10),
        })
    }

    /// Serialize.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.min_velocity.to_le_bytes());
        out.extend_from_slice(&self.max_velocity.to_le_bytes());
        out.extend_from_slice(&self.acceleration.to_le_bytes());
        out
    }

    /// Convert to mm units with `scaling`.
    pub fn to_limits(&self, scaling: &AptScaling) -> VelocityLimits {
        VelocityLimits {
            min_velocity_mm_s: scaling.apt_to_velocity(self.min_velocity),
            max_velocity_mm_s: scaling.apt_to_velocity(self.max_velocity),
            acceleration_mm_s2: scaling.apt_to_accel(self.acceleration),
        }
    }
}

/// Velocity profile in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityLimits {
    /// mm/s
    pub min_velocity_mm_s: f64,
    /// mm/s
    pub max_velocity_mm_s: f64,
    /// mm/s²
    pub acceleration_mm_s2: f64,
}

/// `GET_CHANENABLESTATE`, header-only: state in byte 2, channel ident in byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEnableState {
    /// Channel ident
    pub channel: u8,
    /// 0x01 enabled, anything else disabled
    pub enabled: bool,
}

impl ChannelEnableState {
    /// Read from the header parameters.
    pub fn from_header(header: &Header) -> Self {
        Self {
            enabled: header.param1 == 0x01,
            channel: header.param2,
        }
    }
}

/// `GET_HW_INFO` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    /// Unit serial number
    pub serial_number: u32,
    /// Model string, e.g. "BBD203"
    pub model: String,
    /// Hardware type code
    pub hardware_type: u16,
    /// Firmware version (major, interim, minor)
    pub firmware_version: (u8, u8, u8),
    /// Free-text notes
    pub notes: String,
    /// Hardware revision
    pub hardware_version: u16,
    /// Modification state
    pub modification_state: u16,
    /// Number of channels
    pub channel_count: u16,
}

impl HardwareInfo {
    /// Payload size in bytes.
    pub const LEN: usize = 84;

    /// Parse from a payload slice.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("hardware info", payload, Self::LEN)?;
        Ok(Self {
            serial_number: u32_at(payload, 0),
            model: text_at(payload, 4, 8),
            hardware_type: u16_at(payload, 12),
            // minor, interim, major, unused
            firmware_version: (payload[16], payload[15], payload[14]),
            notes: text_at(payload, 18, 48),
            hardware_version: u16_at(payload, 78),
            modification_state: u16_at(payload, 80),
            channel_count: u16_at(payload, 82),
        })
    }

    /// Firmware version as "major.interim.minor".
    pub fn firmware(&self) -> String {
        let (major, interim, minor) = self.firmware_version;
        format!("{}.{}.{}", major, interim, minor)
    }
}

/// `HW_RICHRESPONSE` payload: the message that failed, an error code and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RichResponse {
    /// Message id the controller is complaining about
    pub message_id: u16,
    /// Error code
    pub code: u16,
    /// Description
    pub notes: String,
}

impl RichResponse {
    /// Minimum payload size.
    pub const MIN_LEN: usize = 4;

    /// Parse from a payload slice; the text is optional.
    pub fn parse(payload: &[u8]) -> ScanResult<Self> {
        require("rich response", payload, Self::MIN_LEN)?;
        let notes_len = payload.len().saturating_sub(4).min(64);
        Ok(Self {
            message_id: u16_at(payload, 0),
            code: u16_at(payload, 2),
            notes: text_at(payload, 4, notes_len),
        })
    }
}

// =============================================================================
// Scaling
// =============================================================================

/// Conversion between physical units and APT integer units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AptScaling {
    counts_per_mm: f64,
}

impl Default for AptScaling {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTS_PER_MM)
    }
}

impl AptScaling {
    /// Scaling for a stage with `counts_per_mm` encoder resolution.
    pub fn new(counts_per_mm: f64) -> Self {
        Self { counts_per_mm }
    }

    /// Encoder resolution.
    pub fn counts_per_mm(&self) -> f64 {
        self.counts_per_mm
    }

    /// mm to encoder counts, rounded to nearest.
    ///
    /// # Errors
    ///
    /// `OutOfRange` for a non-finite position or one whose count does not fit
    /// the 32-bit position field.
    pub fn position_to_apt(&self, position_mm: f64) -> ScanResult<i32> {
        let counts = (position_mm * self.counts_per_mm).round();
        if counts.is_finite() && counts >= f64::from(i32::MIN) && counts <= f64::from(i32::MAX) {
            Ok(counts as i32)
        } else {
            Err(ScanError::OutOfRange {
                parameter: "position",
                value: position_mm,
                min: f64::from(i32::MIN) / self.counts_per_mm,
                max: f64::from(i32::MAX) / self.counts_per_mm,
            })
        }
    }

    /// Encoder counts to mm.
    pub fn apt_to_position(&self, counts: i32) -> f64 {
        f64::from(counts) / self.counts_per_mm
    }

    /// mm/s to APT velocity units.
    pub fn velocity_to_apt(&self, velocity_mm_s: f64) -> u32 {
        (velocity_mm_s * self.counts_per_mm * VELOCITY_SCALE).round() as u32
    }

    /// APT velocity units to mm/s.
    pub fn apt_to_velocity(&self, apt: u32) -> f64 {
        f64::from(apt) / (self.counts_per_mm * VELOCITY_SCALE)
    }

    /// mm/s² to APT acceleration units.
    pub fn accel_to_apt(&self, accel_mm_s2: f64) -> u32 {
        (accel_mm_s2 * self.counts_per_mm * ACCEL_SCALE).round() as u32
    }

    /// APT acceleration units to mm/s².
    pub fn apt_to_accel(&self, apt: u32) -> f64 {
        f64::from(apt) / (self.counts_per_mm * ACCEL_SCALE)
    }
}

// =============================================================================
// Command builders
// =============================================================================

/// Outbound command frames. The host is always the source.
pub mod commands {
    use super::*;

    /// Channel ident placed inside data packets; the bay is selected by the destination.
    const PAYLOAD_CHANNEL: u16 = 0x0001;

    fn header(id: MessageId, p1: u8, p2: u8, dest: u8) -> Vec<u8> {
        build_header_only(id.value(), p1, p2, dest, address::HOST).to_vec()
    }

    fn request(id: MessageId, channel: Channel) -> Vec<u8> {
        header(id, 0x01, 0x00, channel.address())
    }

    fn with_position(id: MessageId, channel: Channel, counts: i32) -> Vec<u8> {
        let mut payload = PAYLOAD_CHANNEL.to_le_bytes().to_vec();
        payload.extend_from_slice(&counts.to_le_bytes());
        build_with_data(id.value(), channel.address(), &payload, address::HOST)
    }

    /// Flash the channel LED.
    pub fn identify(channel: Channel) -> Vec<u8> {
        header(MessageId::ModIdentify, 0x00, 0x00, channel.address())
    }

    /// Enable (state 0x01) or disable (0x02) a channel.
    pub fn enable_channel(channel: Channel, enable: bool) -> Vec<u8> {
        let state = if enable { 0x01 } else { 0x02 };
        header(MessageId::ModSetChanEnableState, state, 0x01, channel.address())
    }

    /// Ask for the channel enable state.
    pub fn request_enable_state(channel: Channel) -> Vec<u8> {
        request(MessageId::ModReqChanEnableState, channel)
    }

    /// Start automatic status update messages.
    pub fn start_update_messages() -> Vec<u8> {
        header(MessageId::HwStartUpdateMsgs, 0x00, 0x00, address::ALL_CHANNELS)
    }

    /// Stop automatic status update messages.
    pub fn stop_update_messages() -> Vec<u8> {
        header(MessageId::HwStopUpdateMsgs, 0x00, 0x00, address::ALL_CHANNELS)
    }

    /// Ask the controller for its hardware information.
    pub fn request_hardware_info() -> Vec<u8> {
        header(MessageId::HwReqInfo, 0x00, 0x00, address::USB)
    }

    /// Start homing.
    pub fn move_home(channel: Channel) -> Vec<u8> {
        header(MessageId::MotMoveHome, 0x01, 0x00, channel.address())
    }

    /// Move to an absolute position.
    pub fn move_absolute(
        channel: Channel,
        position_mm: f64,
        scaling: &AptScaling,
    ) -> ScanResult<Vec<u8>> {
        Ok(with_position(
            MessageId::MotMoveAbsolute,
            channel,
            scaling.position_to_apt(position_mm)?,
        ))
    }

    /// Move by a signed distance.
    pub fn move_relative(
        channel: Channel,
        distance_mm: f64,
        scaling: &AptScaling,
    ) -> ScanResult<Vec<u8>> {
        Ok(with_position(
            MessageId::MotMoveRelative,
            channel,
            scaling.position_to_apt(distance_mm)?,
        ))
    }

    /// Stop, immediately (0x01) or with the deceleration profile (0x02).
    pub fn move_stop(channel: Channel, immediate: bool) -> Vec<u8> {
        let mode = if immediate { 0x01 } else { 0x02 };
        header(MessageId::MotMoveStop, 0x01, mode, channel.address())
    }

    /// Set maximum velocity and acceleration; minimum velocity is always zero.
    pub fn set_velocity_params(
        channel: Channel,
        max_velocity_mm_s: f64,
        acceleration_mm_s2: f64,
        scaling: &AptScaling,
    ) -> Vec<u8> {
        let params = VelocityParams {
            channel: PAYLOAD_CHANNEL,
            min_velocity: 0,
            max_velocity: scaling.velocity_to_apt(max_velocity_mm_s),
            acceleration: scaling.accel_to_apt(acceleration_mm_s2),
        };
        build_with_data(
            MessageId::MotSetVelParams.value(),
            channel.address(),
            &params.to_bytes(),
            address::HOST,
        )
    }

    /// Ask for the velocity parameters.
    pub fn request_velocity_params(channel: Channel) -> Vec<u8> {
        request(MessageId::MotReqVelParams, channel)
    }

    /// Ask for the position counter.
    pub fn request_position(channel: Channel) -> Vec<u8> {
        request(MessageId::MotReqPosCounter, channel)
    }

    /// Ask for the encoder counter.
    pub fn request_encoder(channel: Channel) -> Vec<u8> {
        request(MessageId::MotReqEncCounter, channel)
    }

    /// Ask for a full status update.
    pub fn request_status_update(channel: Channel) -> Vec<u8> {
        request(MessageId::MotReqStatusUpdate, channel)
    }

    /// Ask for the status bits only.
    pub fn request_status_bits(channel: Channel) -> Vec<u8> {
        request(MessageId::MotReqStatusBits, channel)
    }

    /// Overwrite the position counter.
    pub fn set_position_counter(
        channel: Channel,
        position_mm: f64,
        scaling: &AptScaling,
    ) -> ScanResult<Vec<u8>> {
        Ok(with_position(
            MessageId::MotSetPosCounter,
            channel,
            scaling.position_to_apt(position_mm)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    #[test]
    fn header_only_round_trip() {
        let cases = [
            (0x0223u16, 0x00u8, 0x00u8, 0x21u8, 0x01u8),
            (0x0210, 0x01, 0x01, 0x22, 0x01),
            (0x0443, 0x01, 0x00, 0x23, 0x01),
            (0x0011, 0x00, 0x00, 0x11, 0x01),
            (0xFFFF, 0xFF, 0x7F, 0x50, 0xFF),
        ];
        for (id, p1, p2, dest, source) in cases {
            let frame = build_header_only(id, p1, p2, dest, source);
            let header = parse_header(&frame).unwrap();
            assert_eq!(
                (header.id, header.param1, header.param2, header.dest, header.source),
                (id, p1, p2, dest, source)
            );
            assert!(!header.has_data());
        }
    }

    #[test]
    fn data_message_layout() {
        let frame = build_with_data(0x0453, 0x21, &[1, 2, 3, 4, 5, 6], 0x01);
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[..6], &[0x53, 0x04, 0x06, 0x00, 0xA1, 0x01]);

        let msg = AptMessage::parse(&frame).unwrap();
        assert!(msg.header.has_data());
        assert_eq!(msg.header.data_len(), 6);
        assert_eq!(msg.header.destination(), 0x21);
        assert_eq!(msg.payload.as_ref(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn short_header_is_malformed() {
        let err = parse_header(&[0x81, 0x04, 0x0E]).unwrap_err();
        assert!(matches!(err, ScanError::MalformedHeader { available: 3 }));
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        assert!(matches!(
            StatusUpdate::parse(&[0u8; 13]),
            Err(ScanError::TruncatedPayload { needed: 14, available: 13, .. })
        ));
        assert!(PositionCounter::parse(&[0u8; 5]).is_err());
        assert!(EncoderCounter::parse(&[0u8; 2]).is_err());
        assert!(VelocityParams::parse(&[0u8; 10]).is_err());
        assert!(HardwareInfo::parse(&[0u8; 83]).is_err());
    }

    #[test]
    fn status_update_payload_round_trip() {
        let update = StatusUpdate {
            channel: 1,
            position: -123_456,
            encoder: 987_654,
            status: StatusBits::HOMED | StatusBits::MOTOR_ENABLED | StatusBits::IN_MOTION_FORWARD,
        };
        assert_eq!(StatusUpdate::parse(&update.to_bytes()).unwrap(), update);
    }

    #[test]
    fn velocity_params_payload_round_trip() {
        let params = VelocityParams {
            channel: 1,
            min_velocity: 0,
            max_velocity: 134_218,
            acceleration: 14,
        };
        assert_eq!(VelocityParams::parse(&params.to_bytes()).unwrap(), params);
    }

    #[test]
    fn unknown_status_bits_are_retained() {
        let bits = StatusBits::from_raw(0x8000_0400 | 0x0010_0000);
        assert!(bits.contains(StatusBits::HOMED | StatusBits::MOTOR_ENABLED));
        assert_eq!(bits.bits(), 0x8010_0400);
        assert!(!bits.is_moving());
        assert!(StatusBits::HOMING.is_moving());
        assert!(StatusBits::JOGGING_REVERSE.is_moving());
    }

    #[test]
    fn message_id_vocabulary_is_closed() {
        assert_eq!(MessageId::try_from(0x0481).unwrap(), MessageId::MotGetStatusUpdate);
        assert_eq!(MessageId::MotMoveHomed.value(), 0x0444);
        assert!(matches!(
            MessageId::try_from(0x1234),
            Err(ScanError::UnknownMessageId(0x1234))
        ));
    }

    #[test]
    fn channel_addressing() {
        assert_eq!(ch(1).address(), 0x21);
        assert_eq!(ch(3).address(), 0x23);
        assert_eq!(Channel::from_address(0x22), Some(ch(2)));
        assert_eq!(Channel::from_address(0x24), None);
        assert_eq!(Channel::from_address(0x01), None);
        assert!(matches!(Channel::new(0), Err(ScanError::InvalidChannel(0))));
        assert!(Channel::new(4).is_err());

        // Reply to host: channel comes from the source byte
        let reply = parse_header(&build_with_data(0x0481, 0x01, &[0; 14], 0x23)).unwrap();
        assert_eq!(reply.channel(), Some(ch(3)));
        // Controller-level message: no channel
        let info = parse_header(&build_with_data(0x0006, 0x01, &[0; 84], 0x50)).unwrap();
        assert_eq!(info.channel(), None);
    }

    #[test]
    fn scaling_matches_mls203() {
        let s = AptScaling::default();
        assert_eq!(s.position_to_apt(10.0).unwrap(), 200_000);
        assert_eq!(s.position_to_apt(-2.5).unwrap(), -50_000);
        assert_eq!(s.apt_to_position(200_000), 10.0);
        assert_eq!(s.velocity_to_apt(1.0), 134_218);
        assert_eq!(s.accel_to_apt(1.0), 14);
        assert!((s.apt_to_velocity(s.velocity_to_apt(50.0)) - 50.0).abs() < 1e-4);
        assert!((VELOCITY_SCALE - 6.7108864).abs() < 1e-9);
    }

    #[test]
    fn positions_outside_the_count_field_are_rejected() {
        let s = AptScaling::default();
        // 20000 counts/mm: i32::MAX is about 107374 mm
        assert!(s.position_to_apt(107_000.0).is_ok());
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 200_000.0, -200_000.0] {
            assert!(matches!(
                s.position_to_apt(bad),
                Err(ScanError::OutOfRange { parameter: "position", .. })
            ));
        }
        assert!(commands::set_position_counter(ch(1), f64::NAN, &s).is_err());
    }

    #[test]
    fn move_absolute_encodes_counts() {
        let frame = commands::move_absolute(ch(1), 10.0, &AptScaling::default()).unwrap();
        assert_eq!(
            frame,
            vec![0x53, 0x04, 0x06, 0x00, 0xA1, 0x01, 0x01, 0x00, 0x40, 0x0D, 0x03, 0x00]
        );
    }

    #[test]
    fn move_relative_is_signed() {
        let frame = commands::move_relative(ch(2), -0.5, &AptScaling::default()).unwrap();
        let msg = AptMessage::parse(&frame).unwrap();
        assert_eq!(msg.header.destination(), 0x22);
        assert_eq!(PositionCounter::parse(&msg.payload).unwrap().position, -10_000);
    }

    #[test]
    fn header_only_commands() {
        assert_eq!(
            commands::enable_channel(ch(2), true),
            vec![0x10, 0x02, 0x01, 0x01, 0x22, 0x01]
        );
        assert_eq!(
            commands::enable_channel(ch(2), false),
            vec![0x10, 0x02, 0x02, 0x01, 0x22, 0x01]
        );
        assert_eq!(
            commands::move_home(ch(3)),
            vec![0x43, 0x04, 0x01, 0x00, 0x23, 0x01]
        );
        assert_eq!(
            commands::move_stop(ch(1), false),
            vec![0x65, 0x04, 0x01, 0x02, 0x21, 0x01]
        );
        assert_eq!(
            commands::start_update_messages(),
            vec![0x11, 0x00, 0x00, 0x00, 0x11, 0x01]
        );
        assert_eq!(
            commands::request_hardware_info(),
            vec![0x05, 0x00, 0x00, 0x00, 0x50, 0x01]
        );
        assert_eq!(
            commands::request_status_update(ch(1)),
            vec![0x80, 0x04, 0x01, 0x00, 0x21, 0x01]
        );
    }

    #[test]
    fn set_velocity_params_payload() {
        let frame = commands::set_velocity_params(ch(1), 1.0, 1.0, &AptScaling::default());
        let msg = AptMessage::parse(&frame).unwrap();
        assert_eq!(msg.header.id, 0x0413);
        let params = VelocityParams::parse(&msg.payload).unwrap();
        assert_eq!(params.min_velocity, 0);
        assert_eq!(params.max_velocity, 134_218);
        assert_eq!(params.acceleration, 14);
    }

    #[test]
    fn decoder_waits_for_complete_frames() {
        let frame = build_with_data(0x0481, 0x22, &[0u8; 14], 0x01);
        let mut decoder = AptDecoder;
        let mut buf = BytesMut::new();

        for (i, byte) in frame.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let out = decoder.decode(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(out.is_none(), "dispatched early at byte {}", i);
            } else {
                let msg = out.unwrap();
                assert_eq!(msg.header.id, 0x0481);
                assert_eq!(msg.payload.len(), 14);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_handles_header_only_with_nonzero_params() {
        // MOVE_HOMED carries param1 = 0x01; it is still header-only.
        let mut buf = BytesMut::from(&build_header_only(0x0444, 0x01, 0x00, 0x21, 0x01)[..]);
        buf.extend_from_slice(&build_header_only(0x0464, 0x01, 0x00, 0x22, 0x01));

        let mut decoder = AptDecoder;
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.header.id, 0x0444);
        assert!(first.payload.is_empty());
        assert_eq!(second.header.id, 0x0464);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decoder_rejects_impossible_lengths() {
        let mut bad = BytesMut::from(&[0x81u8, 0x04, 0x00, 0x00, 0xA1, 0x01][..]);
        assert!(matches!(
            AptDecoder.decode(&mut bad),
            Err(ScanError::StreamCorrupted(_))
        ));

        let mut too_long = BytesMut::from(&[0x81u8, 0x04, 0x00, 0x01, 0xA1, 0x01][..]);
        assert!(AptDecoder.decode(&mut too_long).is_err());
    }

    #[test]
    fn hardware_info_parses_fixed_fields() {
        let mut payload = vec![0u8; HardwareInfo::LEN];
        payload[0..4].copy_from_slice(&83_123_456u32.to_le_bytes());
        payload[4..10].copy_from_slice(b"BBD203");
        payload[12..14].copy_from_slice(&16u16.to_le_bytes());
        payload[14] = 3; // minor
        payload[15] = 0; // interim
        payload[16] = 1; // major
        payload[18..32].copy_from_slice(b"APT Controller");
        payload[82..84].copy_from_slice(&3u16.to_le_bytes());

        let info = HardwareInfo::parse(&payload).unwrap();
        assert_eq!(info.serial_number, 83_123_456);
        assert_eq!(info.model, "BBD203");
        assert_eq!(info.firmware(), "1.0.3");
        assert_eq!(info.notes, "APT Controller");
        assert_eq!(info.channel_count, 3);
    }

    #[test]
    fn enable_state_reads_header_params() {
        let header = parse_header(&build_header_only(0x0212, 0x01, 0x01, 0x01, 0x21)).unwrap();
        let state = ChannelEnableState::from_header(&header);
        assert!(state.enabled);
        assert_eq!(state.channel, 1);

        let header = parse_header(&build_header_only(0x0212, 0x02, 0x01, 0x01, 0x21)).unwrap();
        assert!(!ChannelEnableState::from_header(&header).enabled);
    }
}
