//! Serial port discovery by USB identity.
//!
//! Device paths like `/dev/ttyUSB0` or `COM5` change between reboots and USB
//! re-plugs. The instruments are found instead by their USB vendor ID and the
//! serial number burned into the adapter, which stay fixed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scan_core::port_resolver::{find_port_by_serial, list_usb_candidates};
//!
//! const FTDI_VID: u16 = 0x0403;
//!
//! for candidate in list_usb_candidates(Some(FTDI_VID))? {
//!     println!("{} {:?}", candidate.port, candidate.serial_number);
//! }
//! let port = find_port_by_serial("83123456", Some(FTDI_VID))?;
//! ```

use serialport::{SerialPortInfo, SerialPortType};

use crate::error::{ScanError, ScanResult};

/// One enumerated serial port with whatever USB identity it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// OS device path (e.g. `/dev/ttyUSB0`, `COM5`)
    pub port: String,
    /// USB serial number, if the port is a USB adapter that reports one
    pub serial_number: Option<String>,
    /// USB product string
    pub description: Option<String>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB vendor ID
    pub vid: Option<u16>,
    /// USB product ID
    pub pid: Option<u16>,
}

impl PortCandidate {
    /// True if this is a USB port reporting `vid`.
    pub fn has_vid(&self, vid: u16) -> bool {
        self.vid == Some(vid)
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => format!(
                "{} [{:04x}:{:04x}] serial={} {} {}",
                self.port,
                vid,
                pid,
                self.serial_number.as_deref().unwrap_or("-"),
                self.manufacturer.as_deref().unwrap_or(""),
                self.description.as_deref().unwrap_or(""),
            )
            .trim_end()
            .to_string(),
            _ => self.port.clone(),
        }
    }
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => PortCandidate {
                port: info.port_name,
                serial_number: usb.serial_number,
                description: usb.product,
                manufacturer: usb.manufacturer,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            },
            _ => PortCandidate {
                port: info.port_name,
                serial_number: None,
                description: None,
                manufacturer: None,
                vid: None,
                pid: None,
            },
        }
    }
}

/// Enumerate every serial port on the host, sorted by path.
pub fn list_ports() -> ScanResult<Vec<PortCandidate>> {
    let mut ports: Vec<PortCandidate> = serialport::available_ports()?
        .into_iter()
        .map(PortCandidate::from)
        .collect();
    ports.sort_by(|a, b| a.port.cmp(&b.port));
    Ok(ports)
}

/// Enumerate USB serial ports, optionally restricted to one vendor ID.
pub fn list_usb_candidates(vid: Option<u16>) -> ScanResult<Vec<PortCandidate>> {
    Ok(filter_usb(list_ports()?, vid))
}

/// Keep USB ports, and only those with `vid` when given.
pub fn filter_usb(ports: Vec<PortCandidate>, vid: Option<u16>) -> Vec<PortCandidate> {
    ports
        .into_iter()
        .filter(|p| match vid {
            Some(vid) => p.has_vid(vid),
            None => p.vid.is_some(),
        })
        .collect()
}

/// Resolve a USB serial number to its port path.
///
/// # Errors
///
/// [`ScanError::DeviceNotFound`] listing the serial numbers that were seen.
pub fn find_port_by_serial(serial: &str, vid: Option<u16>) -> ScanResult<String> {
    let candidates = list_usb_candidates(vid)?;
    select_by_serial(&candidates, serial).map(|c| c.port.clone())
}

/// Pick the candidate whose serial number equals `serial`.
pub fn select_by_serial<'a>(
    candidates: &'a [PortCandidate],
    serial: &str,
) -> ScanResult<&'a PortCandidate> {
    candidates
        .iter()
        .find(|c| c.serial_number.as_deref() == Some(serial))
        .ok_or_else(|| ScanError::DeviceNotFound {
            serial: serial.to_string(),
            available: candidates
                .iter()
                .filter_map(|c| c.serial_number.clone())
                .collect(),
        })
}
