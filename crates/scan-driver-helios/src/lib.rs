//! Helios pulsed laser driver.
//!
//! - [`protocol`]: command vocabulary, command building, reply parsing, unit
//!   conversions and the CR line decoder
//! - [`helios`]: the driver, with verified settings and cached [`LaserState`]

pub mod helios;
pub mod protocol;

pub use helios::{HeliosConfig, HeliosDriver, LaserState, TemperatureSensor, Temperatures};
pub use protocol::{Command, PulseMode, StatusRegister};
