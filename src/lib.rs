//! NueScan application layer.
//!
//! The device drivers live in their own crates ([`scan_driver_thorlabs`] and
//! [`scan_driver_helios`]); this crate holds what the command-line tool needs
//! around them:
//!
//! - [`config`]: figment-based TOML + environment configuration
//! - [`logging`]: tracing subscriber setup

pub mod config;
pub mod logging;

pub use config::NuescanConfig;
pub use scan_core::{ScanError, ScanResult};
