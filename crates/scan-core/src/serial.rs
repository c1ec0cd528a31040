//! Serial transport shared by the NueScan drivers.
//!
//! Every connection is split once at connect time: the receive pump takes the
//! read half for its whole life, and all writers go through one
//! [`SharedWriter`] lock so frames from concurrent callers never interleave.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//! - [`SharedWriter`]: Write half behind the per-device write lock
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`split_port`]: Split a port into pump-owned reader and shared writer
//! - [`write_frame`]: Write and flush one complete frame under the lock
//! - [`drain_serial_buffer`]: Drain stale data before the pump starts
//!
//! # Example
//!
//! ```rust,ignore
//! use scan_core::serial::{open_serial_async, split_port, write_frame};
//!
//! let port = open_serial_async("/dev/ttyUSB0", &SerialSettings::new(115_200), "BBD203").await?;
//! let (reader, writer) = split_port(Box::new(port));
//! write_frame(&writer, &[0x23, 0x02, 0x01, 0x00, 0x50, 0x01], "/dev/ttyUSB0").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::{ScanError, ScanResult};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::mock_serial::MockSerialPort`] (scripted device tests)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Read half of a split port, owned by the receive pump.
pub type PortReader = ReadHalf<DynSerial>;

/// Write half of a split port behind the per-device write lock.
pub type SharedWriter = Arc<Mutex<WriteHalf<DynSerial>>>;

/// Line settings for opening a port. Data format is always 8N1.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate (115200 for the motor controller, 9600 for the laser)
    pub baud_rate: u32,
    /// Enable RTS/CTS hardware handshaking
    #[serde(default)]
    pub hardware_flow_control: bool,
}

impl SerialSettings {
    /// 8N1 settings at `baud_rate` with no flow control.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            hardware_flow_control: false,
        }
    }

    /// Enable or disable RTS/CTS handshaking.
    pub fn with_hardware_flow_control(mut self, enabled: bool) -> Self {
        self.hardware_flow_control = enabled;
        self
    }
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// Opening a port can block for tens of milliseconds on some USB adapters, so
/// it is moved off the runtime. Settings are 8N1 with the requested flow control.
///
/// # Errors
///
/// Returns [`ScanError::Transport`] if the port cannot be opened.
pub async fn open_serial_async(
    port_path: &str,
    settings: &SerialSettings,
    device_name: &str,
) -> ScanResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();
    let settings = settings.clone();

    spawn_blocking(move || {
        let flow_control = if settings.hardware_flow_control {
            tokio_serial::FlowControl::Hardware
        } else {
            tokio_serial::FlowControl::None
        };

        tokio_serial::new(&port_path_owned, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| {
                ScanError::transport(
                    &port_path_owned,
                    format!("failed to open {} serial port: {}", device_name_owned, e),
                )
            })
    })
    .await
    .map_err(|e| ScanError::transport(port_path, format!("spawn_blocking failed: {}", e)))?
}

/// Split a port into the pump's read half and the shared, locked write half.
pub fn split_port(port: DynSerial) -> (PortReader, SharedWriter) {
    let (reader, writer) = tokio::io::split(port);
    (reader, Arc::new(Mutex::new(writer)))
}

/// Write one complete frame and flush it while holding the write lock.
///
/// Failures are reported immediately as [`ScanError::Transport`]; nothing is retried.
pub async fn write_frame(writer: &SharedWriter, bytes: &[u8], port: &str) -> ScanResult<()> {
    let mut guard = writer.lock().await;
    guard
        .write_all(bytes)
        .await
        .map_err(|e| ScanError::transport(port, format!("write failed: {}", e)))?;
    guard
        .flush()
        .await
        .map_err(|e| ScanError::transport(port, format!("flush failed: {}", e)))
}

/// Shut down the write side of a port, ignoring errors from an already closed link.
pub async fn close_writer(writer: &SharedWriter) {
    let mut guard = writer.lock().await;
    if let Err(e) = guard.shutdown().await {
        tracing::debug!(error = %e, "Serial writer shutdown failed");
    }
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within the timeout. Used right after
/// opening a port, before the receive pump takes over the read half, so replies
/// left over from a previous session are not mistaken for fresh ones.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}
