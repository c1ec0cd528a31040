//! Thorlabs BBD203 motor controller driver.
//!
//! - [`apt`]: APT binary frame codec, message ids, payload types, unit scaling
//! - [`channel`]: per-channel state kept current by the receive pump
//! - [`bbd203`]: the driver: connection lifecycle, enable, home, move, stop,
//!   velocity parameters and completion callbacks
//!
//! Inbound messages are applied to channel state on the receive pump task;
//! driver calls never read the port themselves.

pub mod apt;
pub mod bbd203;
pub mod channel;
mod dispatch;

pub use apt::{AptScaling, Channel, HardwareInfo, StatusBits, VelocityLimits};
pub use bbd203::{Bbd203Config, Bbd203Driver, THORLABS_VID};
pub use channel::ChannelState;
pub use dispatch::ChannelEvent;
