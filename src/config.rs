//! Application configuration using Figment.
//!
//! Loaded from a TOML file (default `nuescan.toml`) and then from environment
//! variables prefixed with `NUESCAN_`. Nested keys are separated by a double
//! underscore, e.g. `NUESCAN_STAGE__PORT=/dev/ttyUSB0` or
//! `NUESCAN_APPLICATION__LOG_LEVEL=debug`.
//!
//! ```toml
//! [application]
//! log_level = "info"
//! log_format = "compact"
//!
//! [stage]
//! serial_number = "83123456"
//! counts_per_mm = 20000.0
//!
//! [laser]
//! port = "/dev/ttyUSB1"
//! query_timeout_ms = 2000
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use scan_driver_helios::HeliosConfig;
use scan_driver_thorlabs::Bbd203Config;
use serde::Deserialize;

use crate::logging::{parse_log_level, OutputFormat};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "nuescan.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct NuescanConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Motor controller; absent when no stage is attached
    #[serde(default)]
    pub stage: Option<Bbd203Config>,
    /// Laser; absent when no laser is attached
    #[serde(default)]
    pub laser: Option<HeliosConfig>,
}

/// Application-level configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NuescanConfig {
    /// Load from `path` merged with `NUESCAN_` environment variables.
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Self = Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// The provider chain used by [`load`](Self::load).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("NUESCAN_").split("__"))
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        parse_log_level(&self.application.log_level).map_err(anyhow::Error::msg)?;
        if let Some(stage) = &self.stage {
            stage.validate().context("[stage]")?;
        }
        if let Some(laser) = &self.laser {
            laser.validate().context("[laser]")?;
        }
        Ok(())
    }

    /// The `[stage]` section, or an error naming the missing section.
    pub fn stage(&self) -> Result<&Bbd203Config> {
        self.stage
            .as_ref()
            .context("no [stage] section in configuration")
    }

    /// The `[laser]` section, or an error naming the missing section.
    pub fn laser(&self) -> Result<&HeliosConfig> {
        self.laser
            .as_ref()
            .context("no [laser] section in configuration")
    }
}
