//! Helios pulsed laser driver.
//!
//! Protocol: three-letter ASCII commands terminated by CR, 9600 baud 8N1.
//! The controller never acknowledges a set command, so every setting is
//! confirmed by querying it back.
//!
//! Replies are framed into lines by the receive pump and handed to the driver
//! through a channel. One exchange (write plus the reply it provokes) runs at a
//! time; stale lines are discarded before each query.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scan_driver_helios::{HeliosConfig, HeliosDriver};
//!
//! let laser = HeliosDriver::connect("/dev/ttyUSB1", HeliosConfig::default()).await?;
//! laser.set_frequency_hz(50_000.0).await?;
//! laser.set_laser_enable(true).await?;
//! ```

use std::time::Duration;

use bytes::Bytes;
use futures::future::FutureExt;
use parking_lot::RwLock;
use scan_core::port_resolver;
use scan_core::serial::{
    close_writer, drain_serial_buffer, open_serial_async, split_port, write_frame,
};
use scan_core::{
    set_and_verify, spawn_pump, DynSerial, LinkStatus, PumpHandle, ScanError, ScanResult,
    SerialSettings, SharedWriter, StopSignal, VerifyPolicy,
};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::instrument;

use crate::protocol::{
    self, frequency_to_period_ns, millicelsius_to_celsius, period_ns_to_frequency, Command,
    LineDecoder, PulseMode, StatusRegister, DEFAULT_MAX_LINE_LEN,
};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the Helios driver.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HeliosConfig {
    /// Serial port path (e.g., "/dev/ttyUSB1"); takes precedence over `serial_number`
    #[serde(default)]
    pub port: Option<String>,
    /// USB serial number of the RS-232 adapter
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How long a query waits for its reply line
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Pause between consecutive queries in multi-query refreshes
    #[serde(default = "default_query_gap_ms")]
    pub query_gap_ms: u64,
    /// Set-and-verify timings (controller needs 500 ms to apply a setting)
    #[serde(default = "default_verify")]
    pub verify: VerifyPolicy,
    /// Time to discard stale bytes after opening the port
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    /// Longest reply line before the stream counts as corrupted
    #[serde(default = "default_max_line_len")]
    pub max_line_len: usize,
    /// Wait after a factory reset before the controller may be power cycled
    #[serde(default = "default_factory_reset_ms")]
    pub factory_reset_ms: u64,
    /// Bound on joining the receive pump at disconnect
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_query_timeout_ms() -> u64 {
    2_000
}

fn default_query_gap_ms() -> u64 {
    500
}

fn default_verify() -> VerifyPolicy {
    VerifyPolicy::new(Duration::from_millis(500), Duration::from_millis(500))
}

fn default_drain_ms() -> u64 {
    50
}

fn default_max_line_len() -> usize {
    DEFAULT_MAX_LINE_LEN
}

fn default_factory_reset_ms() -> u64 {
    2_000
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

impl Default for HeliosConfig {
    fn default() -> Self {
        Self {
            port: None,
            serial_number: None,
            baud_rate: default_baud_rate(),
            query_timeout_ms: default_query_timeout_ms(),
            query_gap_ms: default_query_gap_ms(),
            verify: default_verify(),
            drain_ms: default_drain_ms(),
            max_line_len: default_max_line_len(),
            factory_reset_ms: default_factory_reset_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl HeliosConfig {
    /// Check values that would make the driver misbehave.
    pub fn validate(&self) -> ScanResult<()> {
        if self.baud_rate == 0 {
            return Err(ScanError::Configuration("baud_rate must be non-zero".into()));
        }
        if self.query_timeout_ms == 0 {
            return Err(ScanError::Configuration(
                "query_timeout_ms must be non-zero".into(),
            ));
        }
        if self.max_line_len < 16 {
            return Err(ScanError::Configuration(format!(
                "max_line_len {} is too short for any reply",
                self.max_line_len
            )));
        }
        self.verify.validate()
    }

    fn query_gap(&self) -> Duration {
        Duration::from_millis(self.query_gap_ms)
    }
}

// =============================================================================
// Laser state
// =============================================================================

/// The four temperature readings, in °C.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Temperatures {
    /// Pump diode (`LTA`)
    pub pump_diode_c: f64,
    /// Resonator/SHG (`LMA`)
    pub resonator_c: f64,
    /// Q-switch (`EOA`)
    pub q_switch_c: f64,
    /// Controller power stage (`LTT`)
    pub power_stage_c: f64,
}

/// Temperature sensors that can be queried individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureSensor {
    /// Pump diode
    PumpDiode,
    /// Resonator/SHG
    Resonator,
    /// Q-switch
    QSwitch,
    /// Controller power stage
    PowerStage,
}

impl TemperatureSensor {
    /// Query command for this sensor.
    pub fn command(self) -> Command {
        match self {
            TemperatureSensor::PumpDiode => Command::Lta,
            TemperatureSensor::Resonator => Command::Lma,
            TemperatureSensor::QSwitch => Command::Eoa,
            TemperatureSensor::PowerStage => Command::Ltt,
        }
    }
}

/// Cached laser state. Only successful queries and verified settings change it.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserState {
    /// Emission enabled
    pub enabled: bool,
    /// Pulse mode
    pub pulse_mode: PulseMode,
    /// Pulse frequency in Hz
    pub frequency_hz: f64,
    /// Laser diode current in mA
    pub current_ma: f64,
    /// Power monitor reading in mW
    pub power_mw: f64,
    /// Laser diode operating hours
    pub operation_hours: f64,
    /// Last temperature readings
    pub temperatures: Temperatures,
    /// Last status register
    pub status: StatusRegister,
    /// Controller serial number
    pub controller_serial: String,
    /// Laser head serial number
    pub head_serial: String,
}

impl Default for LaserState {
    fn default() -> Self {
        Self {
            enabled: false,
            pulse_mode: PulseMode::ContinuousPulsing,
            frequency_hz: 10_000.0,
            current_ma: 500.0,
            power_mw: 0.0,
            operation_hours: 0.0,
            temperatures: Temperatures::default(),
            status: StatusRegister::default(),
            controller_serial: String::new(),
            head_serial: String::new(),
        }
    }
}

impl LaserState {
    /// Status register is nonzero.
    pub fn has_errors(&self) -> bool {
        self.status.has_errors()
    }
}

// =============================================================================
// HeliosDriver
// =============================================================================

/// Driver for a Helios laser controller.
pub struct HeliosDriver {
    config: HeliosConfig,
    port: String,
    writer: SharedWriter,
    link: LinkStatus,
    /// Reply lines from the pump; holding the lock owns the exchange
    replies: tokio::sync::Mutex<UnboundedReceiver<Bytes>>,
    state: RwLock<LaserState>,
    pump: tokio::sync::Mutex<Option<PumpHandle>>,
    pump_stop: StopSignal,
}

impl std::fmt::Debug for HeliosDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeliosDriver")
            .field("port", &self.port)
            .field("connected", &self.link.is_up())
            .finish()
    }
}

impl HeliosDriver {
    /// Open `port`, then read serial numbers and the current settings.
    #[instrument(skip(config), err)]
    pub async fn connect(port: &str, config: HeliosConfig) -> ScanResult<Self> {
        config.validate()?;
        let settings = SerialSettings::new(config.baud_rate);

        tracing::info!(port, baud = config.baud_rate, "Connecting to Helios laser");
        let mut stream = open_serial_async(port, &settings, "Helios").await?;

        let discarded = drain_serial_buffer(&mut stream, config.drain_ms).await;
        if discarded > 0 {
            tracing::debug!(port, discarded, "Discarded stale bytes");
        }

        let driver = Self::from_port(Box::new(stream), port, config)?;
        driver.initialize().await?;
        Ok(driver)
    }

    /// Find the RS-232 adapter by USB serial number, then [`connect`](Self::connect).
    #[instrument(skip(config), err)]
    pub async fn connect_by_serial(serial_number: &str, config: HeliosConfig) -> ScanResult<Self> {
        let port = port_resolver::find_port_by_serial(serial_number, None)?;
        tracing::info!(serial_number, port = %port, "Resolved Helios adapter");
        Self::connect(&port, config).await
    }

    /// Connect using `port` or `serial_number` from the config.
    pub async fn connect_configured(config: HeliosConfig) -> ScanResult<Self> {
        match (config.port.clone(), config.serial_number.clone()) {
            (Some(port), _) => Self::connect(&port, config).await,
            (None, Some(serial)) => Self::connect_by_serial(&serial, config).await,
            (None, None) => Err(ScanError::Configuration(
                "laser needs either `port` or `serial_number`".into(),
            )),
        }
    }

    /// Start the driver on an already-open byte stream without talking to the laser.
    ///
    /// Call [`initialize`](Self::initialize) afterwards to read the serial
    /// numbers and current settings.
    pub fn from_port(
        port: DynSerial,
        label: impl Into<String>,
        config: HeliosConfig,
    ) -> ScanResult<Self> {
        config.validate()?;
        let label = label.into();
        let (reader, writer) = split_port(port);
        let link = LinkStatus::new();

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = spawn_pump(
            label.clone(),
            reader,
            LineDecoder::new(config.max_line_len),
            move |line: Bytes| {
                // Receiver gone means the driver is being dropped
                let _ = tx.send(line);
            },
            link.clone(),
        );

        Ok(Self {
            config,
            port: label,
            writer,
            link,
            replies: tokio::sync::Mutex::new(rx),
            state: RwLock::new(LaserState::default()),
            pump_stop: pump.stop_signal(),
            pump: tokio::sync::Mutex::new(Some(pump)),
        })
    }

    /// Read serial numbers, enable state, frequency and status register.
    ///
    /// Unanswered queries are logged and skipped; a lost link is an error.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn initialize(&self) -> ScanResult<()> {
        let gap = self.config.query_gap();

        tolerate(self.query_controller_serial().await)?;
        tokio::time::sleep(gap).await;
        tolerate(self.query_head_serial().await)?;
        tokio::time::sleep(gap).await;
        self.refresh_state().await?;

        let state = self.state();
        tracing::info!(
            controller_serial = %state.controller_serial,
            head_serial = %state.head_serial,
            "Helios laser connected"
        );
        Ok(())
    }

    async fn refresh_state(&self) -> ScanResult<()> {
        let gap = self.config.query_gap();
        tolerate(self.query_laser_enable().await)?;
        tokio::time::sleep(gap).await;
        tolerate(self.query_frequency_hz().await)?;
        tokio::time::sleep(gap).await;
        tolerate(self.query_status().await)?;
        Ok(())
    }

    /// Switch emission off, stop the receive pump and close the port.
    ///
    /// Calling it twice is harmless.
    #[instrument(skip(self), fields(port = %self.port))]
    pub async fn disconnect(&self) -> ScanResult<()> {
        let Some(pump) = self.pump.lock().await.take() else {
            return Ok(());
        };

        if self.link.is_up() {
            if let Err(e) = self.set_laser_enable(false).await {
                tracing::warn!(error = %e, "Failed to disable emission before disconnect");
            }
        }

        let exit = pump
            .shutdown(Duration::from_millis(self.config.shutdown_timeout_ms))
            .await;
        close_writer(&self.writer).await;
        self.link.mark_down("disconnect requested");

        tracing::info!(exit = ?exit, "Helios laser disconnected");
        Ok(())
    }

    /// True while the port is open and the receive pump is running.
    pub fn is_connected(&self) -> bool {
        self.link.is_up()
    }

    /// Port label this driver was opened with.
    pub fn port(&self) -> &str {
        &self.port
    }

    // =========================================================================
    // Exchanges
    // =========================================================================

    /// Write a command without waiting for a reply.
    async fn send(&self, frame: &[u8]) -> ScanResult<()> {
        self.link.ensure_up()?;
        let _exchange = self.replies.lock().await;
        tracing::trace!(port = %self.port, command = %String::from_utf8_lossy(frame).trim_end(), "TX");
        write_frame(&self.writer, frame, &self.port).await
    }

    /// Send a query and return its trimmed reply line.
    async fn query(&self, command: Command) -> ScanResult<String> {
        self.link.ensure_up()?;
        let mut replies = self.replies.lock().await;

        while let Ok(stale) = replies.try_recv() {
            tracing::debug!(port = %self.port, line = %String::from_utf8_lossy(&stale), "Discarding stale reply");
        }

        write_frame(&self.writer, &protocol::build(command, None), &self.port).await?;

        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(line)) => {
                let text = protocol::parse_response(command, &line)?;
                tracing::trace!(port = %self.port, %command, reply = %text, "RX");
                Ok(text)
            }
            Ok(None) => {
                self.link.ensure_up()?;
                Err(ScanError::Disconnected {
                    reason: "receive pump stopped".into(),
                })
            }
            Err(_) => {
                self.link.ensure_up()?;
                Err(ScanError::EmptyResponse {
                    command: command.code().to_string(),
                })
            }
        }
    }

    async fn query_int(&self, command: Command) -> ScanResult<i64> {
        let text = self.query(command).await?;
        protocol::parse_int(command, &text)
    }

    async fn query_float(&self, command: Command) -> ScanResult<f64> {
        let text = self.query(command).await?;
        protocol::parse_float(command, &text)
    }

    /// Write `value` with `command` and confirm it by reading it back.
    ///
    /// Every reading is passed to `record`, so after a failed verification the
    /// state holds what the laser last reported.
    async fn set_verified_int(
        &self,
        command: Command,
        value: i64,
        record: fn(&mut LaserState, i64),
    ) -> ScanResult<i64> {
        let frame = protocol::build_set(command, value)?;
        let frame = &frame;

        set_and_verify(
            command.code(),
            &self.config.verify,
            &self.link,
            &value,
            move || self.send(frame).boxed(),
            move || self.observe_int(command, record).boxed(),
        )
        .await
    }

    async fn observe_int(
        &self,
        command: Command,
        record: fn(&mut LaserState, i64),
    ) -> ScanResult<Option<i64>> {
        let value = self.query_int(command).await?;
        record(&mut self.state.write(), value);
        Ok(Some(value))
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Enable or disable emission, confirmed with `LDO`.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn set_laser_enable(&self, enabled: bool) -> ScanResult<()> {
        self.set_verified_int(Command::Ldo, i64::from(enabled), |s, v| s.enabled = v == 1)
            .await?;
        tracing::info!(enabled, "Laser emission state verified");
        Ok(())
    }

    /// Read the emission state from the laser.
    pub async fn query_laser_enable(&self) -> ScanResult<bool> {
        let text = self.query(Command::Ldo).await?;
        let enabled = protocol::parse_flag(Command::Ldo, &text)?;
        self.state.write().enabled = enabled;
        Ok(enabled)
    }

    /// Cached emission state.
    pub fn is_laser_enabled(&self) -> bool {
        self.state.read().enabled
    }

    // =========================================================================
    // Pulse settings
    // =========================================================================

    /// Set the pulse mode, confirmed with `LDG`.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn set_pulse_mode(&self, mode: PulseMode) -> ScanResult<()> {
        self.set_verified_int(Command::Ldg, mode.value(), |s, v| {
            if let Ok(mode) = PulseMode::try_from(v) {
                s.pulse_mode = mode;
            }
        })
        .await?;
        Ok(())
    }

    /// Read the pulse mode from the laser.
    pub async fn query_pulse_mode(&self) -> ScanResult<PulseMode> {
        let mode = PulseMode::try_from(self.query_int(Command::Ldg).await?)?;
        self.state.write().pulse_mode = mode;
        Ok(mode)
    }

    /// Set the pulse frequency.
    ///
    /// The controller takes a period in whole ns (8000-60000, i.e. about
    /// 16.7 kHz to 125 kHz). Returns the frequency the confirmed period gives.
    ///
    /// # Errors
    ///
    /// `InvalidFrequency` for non-positive input, `OutOfRange` when the period
    /// falls outside the controller's range. Nothing is sent in either case.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn set_frequency_hz(&self, frequency_hz: f64) -> ScanResult<f64> {
        let period_ns = frequency_to_period_ns(frequency_hz)?;
        let observed = self
            .set_verified_int(Command::Ldf, period_ns, |s, v| {
                if let Ok(frequency_hz) = period_ns_to_frequency(v) {
                    s.frequency_hz = frequency_hz;
                }
            })
            .await?;
        let actual = period_ns_to_frequency(observed)?;
        tracing::info!(requested = frequency_hz, actual, period_ns, "Pulse frequency verified");
        Ok(actual)
    }

    /// Read the pulse frequency from the laser.
    pub async fn query_frequency_hz(&self) -> ScanResult<f64> {
        let period_ns = self.query_int(Command::Ldf).await?;
        let frequency_hz = period_ns_to_frequency(period_ns)?;
        self.state.write().frequency_hz = frequency_hz;
        Ok(frequency_hz)
    }

    /// Set the laser diode current in mA (0-7000), confirmed with `LDS`.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn set_current_ma(&self, current_ma: f64) -> ScanResult<()> {
        Command::Lds.check(current_ma)?;
        self.set_verified_int(Command::Lds, current_ma.round() as i64, |s, v| {
            s.current_ma = v as f64;
        })
        .await?;
        Ok(())
    }

    /// Read the laser diode current from the laser.
    pub async fn query_current_ma(&self) -> ScanResult<f64> {
        let current_ma = self.query_int(Command::Lds).await? as f64;
        self.state.write().current_ma = current_ma;
        Ok(current_ma)
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    /// Read one temperature in °C.
    pub async fn query_temperature(&self, sensor: TemperatureSensor) -> ScanResult<f64> {
        let command = sensor.command();
        let millicelsius = self.query_int(command).await?;
        let celsius = millicelsius_to_celsius(millicelsius);
        let mut state = self.state.write();
        match sensor {
            TemperatureSensor::PumpDiode => state.temperatures.pump_diode_c = celsius,
            TemperatureSensor::Resonator => state.temperatures.resonator_c = celsius,
            TemperatureSensor::QSwitch => state.temperatures.q_switch_c = celsius,
            TemperatureSensor::PowerStage => state.temperatures.power_stage_c = celsius,
        }
        Ok(celsius)
    }

    /// Read all four temperatures, pausing between queries.
    pub async fn query_all_temperatures(&self) -> ScanResult<Temperatures> {
        let gap = self.config.query_gap();
        let pump_diode_c = self.query_temperature(TemperatureSensor::PumpDiode).await?;
        tokio::time::sleep(gap).await;
        let resonator_c = self.query_temperature(TemperatureSensor::Resonator).await?;
        tokio::time::sleep(gap).await;
        let q_switch_c = self.query_temperature(TemperatureSensor::QSwitch).await?;
        tokio::time::sleep(gap).await;
        let power_stage_c = self.query_temperature(TemperatureSensor::PowerStage).await?;

        Ok(Temperatures {
            pump_diode_c,
            resonator_c,
            q_switch_c,
            power_stage_c,
        })
    }

    /// Read the status register.
    pub async fn query_status(&self) -> ScanResult<StatusRegister> {
        let raw = self.query_int(Command::Ler).await?;
        let status = StatusRegister(u32::try_from(raw).map_err(|_| ScanError::Parse {
            command: Command::Ler.code().to_string(),
            response: raw.to_string(),
        })?);
        if status.has_errors() {
            tracing::warn!(port = %self.port, %status, "Laser status register reports errors");
        }
        self.state.write().status = status;
        Ok(status)
    }

    /// Clear the status register.
    pub async fn clear_status(&self) -> ScanResult<()> {
        self.send(&protocol::build(Command::Lce, Some(0))).await
    }

    /// Clear controller errors.
    pub async fn clear_errors(&self) -> ScanResult<()> {
        self.send(&protocol::build(Command::Cce, Some(0))).await
    }

    /// Read the power monitor in mW.
    pub async fn query_power_mw(&self) -> ScanResult<f64> {
        let power_mw = self.query_float(Command::Hmp).await?;
        self.state.write().power_mw = power_mw;
        Ok(power_mw)
    }

    /// Read the laser diode operating hours.
    pub async fn query_operation_hours(&self) -> ScanResult<f64> {
        let hours = self.query_float(Command::Htr).await?;
        self.state.write().operation_hours = hours;
        Ok(hours)
    }

    /// Read the controller serial number.
    pub async fn query_controller_serial(&self) -> ScanResult<String> {
        let serial = self.query(Command::Csr).await?;
        self.state.write().controller_serial = serial.clone();
        Ok(serial)
    }

    /// Read the laser head serial number.
    pub async fn query_head_serial(&self) -> ScanResult<String> {
        let serial = self.query(Command::Hsr).await?;
        self.state.write().head_serial = serial.clone();
        Ok(serial)
    }

    /// Refresh status register, power and temperatures.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn update_status(&self) -> ScanResult<LaserState> {
        let gap = self.config.query_gap();
        self.query_status().await?;
        tokio::time::sleep(gap).await;
        self.query_power_mw().await?;
        tokio::time::sleep(gap).await;
        self.query_all_temperatures().await?;
        Ok(self.state())
    }

    /// Snapshot of the cached state.
    pub fn state(&self) -> LaserState {
        self.state.read().clone()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Restore factory settings.
    ///
    /// Refused unless the laser confirms emission is off. Waits the configured
    /// reset time afterwards; power cycle the controller once it returns.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn restore_factory_settings(&self) -> ScanResult<()> {
        if self.query_laser_enable().await? {
            return Err(ScanError::Interlock(
                "laser must be disabled before restoring factory settings".into(),
            ));
        }

        tracing::warn!("Restoring factory settings");
        self.send(&protocol::build(Command::Hpr, None)).await?;
        tokio::time::sleep(Duration::from_millis(self.config.factory_reset_ms)).await;
        tracing::info!("Factory settings restored; power cycle the controller");
        Ok(())
    }
}

impl Drop for HeliosDriver {
    fn drop(&mut self) {
        self.pump_stop.trigger();
    }
}

/// Log a failed query and carry on, unless the link itself is gone.
fn tolerate<T>(result: ScanResult<T>) -> ScanResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_link_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "Query failed during refresh");
            Ok(None)
        }
    }
}
