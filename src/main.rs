//! `nuescan` command-line tool.
//!
//! A thin caller of the drivers, for bench checks and scripting:
//!
//! ```bash
//! nuescan ports --thorlabs
//! nuescan stage home all
//! nuescan stage move 1 12.5
//! nuescan laser frequency 50000
//! nuescan laser status
//! ```
//!
//! Device ports come from `nuescan.toml` (see [`nuescan::config`]) unless
//! `--port` or `--serial` is given.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nuescan::config::{NuescanConfig, DEFAULT_CONFIG_PATH};
use nuescan::logging::{self, TracingConfig};
use scan_core::port_resolver;
use scan_driver_helios::{HeliosConfig, HeliosDriver, PulseMode};
use scan_driver_thorlabs::{Bbd203Config, Bbd203Driver, THORLABS_VID};
use tracing::info;

#[derive(Parser)]
#[command(name = "nuescan")]
#[command(about = "Control the NueScan stage controller and pulsed laser", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports {
        /// Only FTDI-based Thorlabs candidates
        #[arg(long)]
        thorlabs: bool,
    },

    /// BBD203 motor controller
    Stage {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        command: StageCommand,
    },

    /// Helios pulsed laser
    Laser {
        #[command(flatten)]
        target: Target,

        #[command(subcommand)]
        command: LaserCommand,
    },
}

/// Port selection overriding the config file.
#[derive(Args)]
struct Target {
    /// Serial port path
    #[arg(long, conflicts_with = "serial")]
    port: Option<String>,

    /// USB serial number
    #[arg(long)]
    serial: Option<String>,
}

#[derive(Subcommand)]
enum StageCommand {
    /// Show hardware info and channel state
    Status,
    /// Enable (or with --off, disable) a channel
    Enable {
        channel: u8,
        #[arg(long)]
        off: bool,
    },
    /// Home one channel, or every enabled channel with "all"
    Home { channel: String },
    /// Move a channel to a position in mm
    Move {
        channel: u8,
        position_mm: f64,
        /// Treat the position as a distance from the current position
        #[arg(long)]
        relative: bool,
    },
    /// Stop one channel, or all with 0
    Stop {
        #[arg(default_value_t = 0)]
        channel: u8,
        /// Abrupt stop instead of profiled deceleration
        #[arg(long)]
        immediate: bool,
    },
}

#[derive(Subcommand)]
enum LaserCommand {
    /// Show emission, settings, status register, power and temperatures
    Status,
    /// Switch emission on
    Enable,
    /// Switch emission off
    Disable,
    /// Read, or set in Hz, the pulse repetition frequency
    Frequency { hz: Option<f64> },
    /// Read, or set in mA, the diode current
    Current { ma: Option<f64> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = NuescanConfig::load(&cli.config)?;
    let tracing_config =
        TracingConfig::from_config(&config.application).map_err(anyhow::Error::msg)?;
    logging::init(&tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Ports { thorlabs } => list_ports(thorlabs),
        Commands::Stage { target, command } => {
            let stage_config = config.stage.clone().unwrap_or_default();
            run_stage(target.apply_stage(stage_config), command).await
        }
        Commands::Laser { target, command } => {
            let laser_config = config.laser.clone().unwrap_or_default();
            run_laser(target.apply_laser(laser_config), command).await
        }
    }
}

impl Target {
    fn apply_stage(self, mut config: Bbd203Config) -> Bbd203Config {
        if self.port.is_some() || self.serial.is_some() {
            config.port = self.port;
            config.serial_number = self.serial;
        }
        config
    }

    fn apply_laser(self, mut config: HeliosConfig) -> HeliosConfig {
        if self.port.is_some() || self.serial.is_some() {
            config.port = self.port;
            config.serial_number = self.serial;
        }
        config
    }
}

// =============================================================================
// Ports
// =============================================================================

fn list_ports(thorlabs_only: bool) -> Result<()> {
    let ports = if thorlabs_only {
        port_resolver::list_usb_candidates(Some(THORLABS_VID))
    } else {
        port_resolver::list_ports()
    }
    .context("failed to enumerate serial ports")?;

    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port.summary());
    }
    Ok(())
}

// =============================================================================
// Stage
// =============================================================================

async fn run_stage(config: Bbd203Config, command: StageCommand) -> Result<()> {
    let stage = Bbd203Driver::connect_configured(config)
        .await
        .context("failed to connect to BBD203")?;
    info!(port = %stage.port(), "stage connected");

    let result = stage_command(&stage, command).await;
    stage.disconnect().await?;
    result
}

async fn stage_command(stage: &Bbd203Driver, command: StageCommand) -> Result<()> {
    match command {
        StageCommand::Status => {
            for channel in 1..=3u8 {
                stage.request_status_update(channel).await?;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;

            match stage.hardware_info() {
                Some(hw) => {
                    let (major, interim, minor) = hw.firmware_version;
                    println!(
                        "{} serial {} firmware {major}.{interim}.{minor}",
                        hw.model, hw.serial_number
                    );
                }
                None => println!("No hardware info received"),
            }
            for (index, state) in stage.channels().iter().enumerate() {
                println!(
                    "ch{}: {:>10.4} mm  enabled={} homed={} moving={} error={} status=0x{:08x}",
                    index + 1,
                    state.position_mm,
                    state.enabled,
                    state.homed,
                    state.moving,
                    state.error,
                    state.raw_status
                );
            }
        }
        StageCommand::Enable { channel, off } => {
            stage.enable_channel(channel, !off).await?;
            println!("ch{channel} {}", if off { "disabled" } else { "enabled" });
        }
        StageCommand::Home { channel } => {
            if channel.eq_ignore_ascii_case("all") {
                let homed = stage.home_all_channels(true).await?;
                println!("Homed channels {homed:?}");
            } else {
                let channel: u8 = channel
                    .parse()
                    .with_context(|| format!("invalid channel '{channel}'"))?;
                stage.home_channel(channel, true).await?;
                println!("ch{channel} homed");
            }
        }
        StageCommand::Move {
            channel,
            position_mm,
            relative,
        } => {
            if relative {
                stage.move_relative(channel, position_mm, true).await?;
            } else {
                stage.move_absolute(channel, position_mm, true).await?;
            }
            println!("ch{channel} at {:.4} mm", stage.position(channel)?);
        }
        StageCommand::Stop { channel, immediate } => {
            stage.stop(channel, immediate).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Laser
// =============================================================================

async fn run_laser(config: HeliosConfig, command: LaserCommand) -> Result<()> {
    let laser = HeliosDriver::connect_configured(config)
        .await
        .context("failed to connect to Helios")?;
    info!(port = %laser.port(), "laser connected");

    // Only an explicit disable ends emission; disconnect() would always
    // switch it off, so the session ends by dropping the driver instead.
    laser_command(&laser, command).await
}

async fn laser_command(laser: &HeliosDriver, command: LaserCommand) -> Result<()> {
    match command {
        LaserCommand::Status => {
            let state = laser.update_status().await?;
            println!(
                "controller {} head {}",
                display_or_dash(&state.controller_serial),
                display_or_dash(&state.head_serial)
            );
            println!(
                "emission {}  mode {}  {:.1} Hz  {:.0} mA",
                if state.enabled { "ON" } else { "off" },
                pulse_mode_name(state.pulse_mode),
                state.frequency_hz,
                state.current_ma
            );
            println!("power {:.1} mW  status {}", state.power_mw, state.status);
            let t = state.temperatures;
            println!(
                "temperatures pump {:.2} C  resonator {:.2} C  q-switch {:.2} C  power stage {:.2} C",
                t.pump_diode_c, t.resonator_c, t.q_switch_c, t.power_stage_c
            );
        }
        LaserCommand::Enable => {
            laser.set_laser_enable(true).await?;
            println!("emission ON");
        }
        LaserCommand::Disable => {
            laser.set_laser_enable(false).await?;
            println!("emission off");
        }
        LaserCommand::Frequency { hz } => {
            let actual = match hz {
                Some(hz) => laser.set_frequency_hz(hz).await?,
                None => laser.query_frequency_hz().await?,
            };
            println!("{actual:.1} Hz");
        }
        LaserCommand::Current { ma } => {
            let current = match ma {
                Some(ma) => {
                    laser.set_current_ma(ma).await?;
                    laser.state().current_ma
                }
                None => laser.query_current_ma().await?,
            };
            println!("{current:.0} mA");
        }
    }
    Ok(())
}

fn display_or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn pulse_mode_name(mode: PulseMode) -> &'static str {
    match mode {
        PulseMode::ContinuousPulsing => "continuous",
        PulseMode::Gating => "gating",
        PulseMode::SinglePulse => "single pulse",
    }
}
