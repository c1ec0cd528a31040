//! Thorlabs BBD203 three-channel brushless DC motor controller driver.
//!
//! Protocol: APT binary messages over the controller's FTDI USB serial bridge,
//! 115200 baud 8N1.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scan_driver_thorlabs::{Bbd203Config, Bbd203Driver};
//!
//! let stage = Bbd203Driver::connect_by_serial("83123456", Bbd203Config::default()).await?;
//! stage.enable_channel(1, true).await?;
//! stage.home_channel(1, true).await?;
//! stage.move_absolute(1, 10.0, true).await?;
//! println!("x = {} mm", stage.position(1)?);
//! stage.disconnect().await?;
//! ```
//!
//! On connect the driver requests hardware info and switches on automatic
//! status update messages, so channel state stays current without polling.

use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use parking_lot::Mutex;
use scan_core::port_resolver;
use scan_core::serial::{
    close_writer, drain_serial_buffer, open_serial_async, split_port, write_frame,
};
use scan_core::{
    set_and_verify, spawn_pump, wait_until, DynSerial, EventRegistry, LinkStatus, PumpHandle,
    ScanError, ScanResult, SerialSettings, SharedWriter, StopSignal, SubscriptionId, VerifyPolicy,
    WaitOptions,
};
use serde::Deserialize;
use tracing::instrument;

use crate::apt::{
    commands, AptDecoder, AptScaling, Channel, HardwareInfo, VelocityLimits,
    DEFAULT_COUNTS_PER_MM,
};
use crate::channel::{ChannelState, ChannelTable};
use crate::dispatch::{ChannelEvent, Dispatcher};

/// FTDI vendor ID used by Thorlabs controllers.
pub const THORLABS_VID: u16 = 0x0403;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the BBD203 driver.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Bbd203Config {
    /// Serial port path (e.g., "/dev/ttyUSB0"); takes precedence over `serial_number`
    #[serde(default)]
    pub port: Option<String>,
    /// USB serial number used to find the port
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// RTS/CTS handshaking
    #[serde(default)]
    pub hardware_flow_control: bool,
    /// Encoder counts per mm (default: 20000, MLS203 stage)
    #[serde(default = "default_counts_per_mm")]
    pub counts_per_mm: f64,
    /// Highest accepted max velocity in mm/s
    #[serde(default = "default_velocity_limit")]
    pub velocity_limit_mm_s: f64,
    /// Highest accepted acceleration in mm/s²
    #[serde(default = "default_acceleration_limit")]
    pub acceleration_limit_mm_s2: f64,
    /// Set-and-verify timings for enable state and velocity parameters
    #[serde(default = "default_verify")]
    pub verify: VerifyPolicy,
    /// Delay after each connect/disconnect handshake message
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    /// Time to discard stale bytes after opening the port
    #[serde(default = "default_drain_ms")]
    pub drain_ms: u64,
    /// Move wait timeout
    #[serde(default = "default_motion_timeout_ms")]
    pub move_timeout_ms: u64,
    /// Move wait poll interval
    #[serde(default = "default_move_poll_ms")]
    pub move_poll_ms: u64,
    /// Homing wait timeout
    #[serde(default = "default_motion_timeout_ms")]
    pub home_timeout_ms: u64,
    /// Homing wait poll interval
    #[serde(default = "default_home_poll_ms")]
    pub home_poll_ms: u64,
    /// Bound on joining the receive pump at disconnect
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_counts_per_mm() -> f64 {
    DEFAULT_COUNTS_PER_MM
}

fn default_velocity_limit() -> f64 {
    250.0
}

fn default_acceleration_limit() -> f64 {
    2000.0
}

fn default_verify() -> VerifyPolicy {
    VerifyPolicy::new(Duration::from_millis(100), Duration::from_millis(100))
}

fn default_handshake_delay_ms() -> u64 {
    100
}

fn default_drain_ms() -> u64 {
    50
}

fn default_motion_timeout_ms() -> u64 {
    30_000
}

fn default_move_poll_ms() -> u64 {
    10
}

fn default_home_poll_ms() -> u64 {
    100
}

fn default_shutdown_timeout_ms() -> u64 {
    2_000
}

impl Default for Bbd203Config {
    fn default() -> Self {
        Self {
            port: None,
            serial_number: None,
            baud_rate: default_baud_rate(),
            hardware_flow_control: false,
            counts_per_mm: default_counts_per_mm(),
            velocity_limit_mm_s: default_velocity_limit(),
            acceleration_limit_mm_s2: default_acceleration_limit(),
            verify: default_verify(),
            handshake_delay_ms: default_handshake_delay_ms(),
            drain_ms: default_drain_ms(),
            move_timeout_ms: default_motion_timeout_ms(),
            move_poll_ms: default_move_poll_ms(),
            home_timeout_ms: default_motion_timeout_ms(),
            home_poll_ms: default_home_poll_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Bbd203Config {
    /// Check values that would make the driver misbehave.
    pub fn validate(&self) -> ScanResult<()> {
        if !(self.counts_per_mm.is_finite() && self.counts_per_mm > 0.0) {
            return Err(ScanError::Configuration(format!(
                "counts_per_mm must be positive, got {}",
                self.counts_per_mm
            )));
        }
        if self.baud_rate == 0 {
            return Err(ScanError::Configuration("baud_rate must be non-zero".into()));
        }
        if self.move_poll_ms == 0 || self.home_poll_ms == 0 {
            return Err(ScanError::Configuration(
                "poll intervals must be non-zero".into(),
            ));
        }
        self.verify.validate()
    }

    /// Wait options for move completion.
    pub fn move_wait(&self) -> WaitOptions {
        WaitOptions::new(Duration::from_millis(self.move_timeout_ms))
            .poll_every(Duration::from_millis(self.move_poll_ms))
    }

    /// Wait options for homing completion.
    pub fn home_wait(&self) -> WaitOptions {
        WaitOptions::new(Duration::from_millis(self.home_timeout_ms))
            .poll_every(Duration::from_millis(self.home_poll_ms))
    }

    fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }
}

// =============================================================================
// Bbd203Driver
// =============================================================================

/// Driver for one BBD203 controller and its three motor channels.
pub struct Bbd203Driver {
    config: Bbd203Config,
    scaling: AptScaling,
    port: String,
    writer: SharedWriter,
    link: LinkStatus,
    state: Dispatcher,
    pump: tokio::sync::Mutex<Option<PumpHandle>>,
    pump_stop: StopSignal,
    /// Cancels motion waits at disconnect
    cancel: StopSignal,
}

impl std::fmt::Debug for Bbd203Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bbd203Driver")
            .field("port", &self.port)
            .field("connected", &self.link.is_up())
            .finish()
    }
}

impl Bbd203Driver {
    /// Open `port` and initialize the controller.
    #[instrument(skip(config), err)]
    pub async fn connect(port: &str, config: Bbd203Config) -> ScanResult<Self> {
        config.validate()?;
        let settings = SerialSettings::new(config.baud_rate)
            .with_hardware_flow_control(config.hardware_flow_control);

        tracing::info!(port, baud = config.baud_rate, "Connecting to BBD203");
        let mut stream = open_serial_async(port, &settings, "BBD203").await?;

        let discarded = drain_serial_buffer(&mut stream, config.drain_ms).await;
        if discarded > 0 {
            tracing::debug!(port, discarded, "Discarded stale bytes");
        }

        Self::from_port(Box::new(stream), port, config).await
    }

    /// Find the controller by USB serial number, then [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// [`ScanError::DeviceNotFound`] lists the serial numbers that were seen.
    #[instrument(skip(config), err)]
    pub async fn connect_by_serial(serial_number: &str, config: Bbd203Config) -> ScanResult<Self> {
        let port = port_resolver::find_port_by_serial(serial_number, Some(THORLABS_VID))?;
        tracing::info!(serial_number, port = %port, "Resolved BBD203");
        Self::connect(&port, config).await
    }

    /// Connect using `port` or `serial_number` from the config.
    pub async fn connect_configured(config: Bbd203Config) -> ScanResult<Self> {
        match (config.port.clone(), config.serial_number.clone()) {
            (Some(port), _) => Self::connect(&port, config).await,
            (None, Some(serial)) => Self::connect_by_serial(&serial, config).await,
            (None, None) => Err(ScanError::Configuration(
                "stage needs either `port` or `serial_number`".into(),
            )),
        }
    }

    /// Start the driver on an already-open byte stream and initialize the controller.
    ///
    /// Used by [`connect`](Self::connect) and by tests with a mock port.
    pub async fn from_port(
        port: DynSerial,
        label: impl Into<String>,
        config: Bbd203Config,
    ) -> ScanResult<Self> {
        config.validate()?;
        let label = label.into();
        let scaling = AptScaling::new(config.counts_per_mm);
        let (reader, writer) = split_port(port);
        let link = LinkStatus::new();

        let state = Dispatcher {
            channels: Arc::new(ChannelTable::new()),
            events: Arc::new(EventRegistry::new()),
            hardware_info: Arc::new(Mutex::new(None)),
            scaling,
            port: label.clone(),
        };
        let sink = state.clone();
        let pump = spawn_pump(
            label.clone(),
            reader,
            AptDecoder,
            move |msg| sink.dispatch(msg),
            link.clone(),
        );

        let driver = Self {
            config,
            scaling,
            port: label,
            writer,
            link,
            state,
            pump_stop: pump.stop_signal(),
            pump: tokio::sync::Mutex::new(Some(pump)),
            cancel: StopSignal::new(),
        };

        driver.initialize().await?;
        Ok(driver)
    }

    async fn initialize(&self) -> ScanResult<()> {
        self.send(&commands::request_hardware_info()).await?;
        tokio::time::sleep(self.config.handshake_delay()).await;

        self.send(&commands::start_update_messages()).await?;
        tokio::time::sleep(self.config.handshake_delay()).await;

        tracing::info!(port = %self.port, "BBD203 connected");
        Ok(())
    }

    /// Stop status updates, stop the receive pump and close the port.
    ///
    /// Pending motion waits end with `Cancelled`. Calling it twice is harmless.
    #[instrument(skip(self), fields(port = %self.port))]
    pub async fn disconnect(&self) -> ScanResult<()> {
        let Some(pump) = self.pump.lock().await.take() else {
            return Ok(());
        };

        if self.link.is_up() {
            if let Err(e) = self.send(&commands::stop_update_messages()).await {
                tracing::warn!(error = %e, "Failed to stop update messages");
            }
            tokio::time::sleep(self.config.handshake_delay()).await;
        }

        self.cancel.trigger();
        let exit = pump
            .shutdown(Duration::from_millis(self.config.shutdown_timeout_ms))
            .await;
        close_writer(&self.writer).await;
        self.link.mark_down("disconnect requested");

        tracing::info!(exit = ?exit, "BBD203 disconnected");
        Ok(())
    }

    /// True while the port is open and the receive pump is running.
    pub fn is_connected(&self) -> bool {
        self.link.is_up()
    }

    /// Why the connection went down, if it did.
    pub fn link_fault(&self) -> Option<String> {
        self.link.fault()
    }

    /// Port label this driver was opened with.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Unit conversion in use.
    pub fn scaling(&self) -> AptScaling {
        self.scaling
    }

    async fn send(&self, frame: &[u8]) -> ScanResult<()> {
        self.link.ensure_up()?;
        tracing::trace!(port = %self.port, frame = ?frame, "TX");
        write_frame(&self.writer, frame, &self.port).await
    }

    // =========================================================================
    // Channel control
    // =========================================================================

    /// Enable or disable a channel, confirmed by a status update.
    ///
    /// # Errors
    ///
    /// `VerificationFailed` if the controller does not report the requested
    /// state after three attempts.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn enable_channel(&self, channel: u8, enable: bool) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        let set_frame = commands::enable_channel(ch, enable);
        let set_frame = &set_frame;

        set_and_verify(
            &format!("channel {} enable state", ch),
            &self.config.verify,
            &self.link,
            &enable,
            move || self.send(set_frame).boxed(),
            move || {
                self.refresh_status(ch)
                    .map(|r| r.map(|s| Some(s.enabled)))
                    .boxed()
            },
        )
        .await?;

        tracing::info!(channel, enable, "Channel enable state verified");
        Ok(())
    }

    /// Request a status update and read the state after the settle delay.
    async fn refresh_status(&self, ch: Channel) -> ScanResult<ChannelState> {
        self.send(&commands::request_status_update(ch)).await?;
        tokio::time::sleep(self.config.verify.settle()).await;
        Ok(self.state.channels.get(ch))
    }

    /// Flash the channel's front-panel LED.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn identify(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::identify(Channel::new(channel)?)).await
    }

    /// Ask for the channel enable state; the reply updates `enabled`.
    pub async fn request_enable_state(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::request_enable_state(Channel::new(channel)?))
            .await
    }

    // =========================================================================
    // Homing
    // =========================================================================

    /// Start homing a channel, optionally waiting until it reports homed.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn home_channel(&self, channel: u8, wait: bool) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        let started = self.start_home(ch).await?;

        if wait {
            let options = self.wait_options(self.config.home_wait());
            wait_until(&format!("channel {} homing", ch), &options, || {
                self.link.ensure_up()?;
                Ok(self.state.channels.get(ch).homes_finished > started)
            })
            .await?;
            tracing::info!(channel, "Homing completed");
        }
        Ok(())
    }

    /// Send MOVE_HOME and return the channel's homing count before it.
    ///
    /// Waits key on MOVE_HOMED arriving, not on the status flags: a periodic
    /// status update sent before homing begins still reports the old state.
    async fn start_home(&self, ch: Channel) -> ScanResult<u64> {
        self.link.ensure_up()?;
        let started = self.state.channels.update(ch, |s| {
            s.homing = true;
            s.homed = false;
            s.homes_finished
        });
        self.send(&commands::move_home(ch)).await?;
        Ok(started)
    }

    /// Home every enabled channel. Returns the channels that were homed.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn home_all_channels(&self, wait: bool) -> ScanResult<Vec<u8>> {
        let enabled: Vec<Channel> = Channel::all()
            .into_iter()
            .filter(|ch| self.state.channels.get(*ch).enabled)
            .collect();

        if enabled.is_empty() {
            tracing::warn!("No enabled channels to home");
            return Ok(Vec::new());
        }

        let mut started = Vec::with_capacity(enabled.len());
        for ch in &enabled {
            started.push((*ch, self.start_home(*ch).await?));
        }

        if wait {
            let options = self.wait_options(self.config.home_wait());
            wait_until("all enabled channels homed", &options, || {
                self.link.ensure_up()?;
                Ok(started
                    .iter()
                    .all(|(ch, count)| self.state.channels.get(*ch).homes_finished > *count))
            })
            .await?;
            tracing::info!("All enabled channels homed");
        }

        Ok(enabled.iter().map(|ch| ch.number()).collect())
    }

    /// Wait until `channel` is homed and no longer homing.
    ///
    /// Reads the status flags, so call it once homing is under way; the
    /// `wait` flag of [`home_channel`](Self::home_channel) waits for MOVE_HOMED.
    pub async fn wait_for_home(&self, channel: u8, options: &WaitOptions) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        let options = self.wait_options(options.clone());
        wait_until(&format!("channel {} homing", ch), &options, || {
            self.link.ensure_up()?;
            let s = self.state.channels.get(ch);
            Ok(s.homed && !s.homing)
        })
        .await
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Move to an absolute position in mm.
    ///
    /// # Errors
    ///
    /// `NotReady` unless the channel is enabled, homed and error-free.
    /// `OutOfRange` for a non-finite position or one beyond the 32-bit count
    /// range. Nothing is sent in either case.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn move_absolute(&self, channel: u8, position_mm: f64, wait: bool) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        let frame = commands::move_absolute(ch, position_mm, &self.scaling)?;
        self.start_move(ch, &frame, wait).await
    }

    /// Move by a signed distance in mm.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn move_relative(&self, channel: u8, distance_mm: f64, wait: bool) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        let frame = commands::move_relative(ch, distance_mm, &self.scaling)?;
        self.start_move(ch, &frame, wait).await
    }

    async fn start_move(&self, ch: Channel, frame: &[u8], wait: bool) -> ScanResult<()> {
        self.link.ensure_up()?;
        if !self.state.channels.get(ch).is_ready() {
            return Err(ScanError::NotReady(ch.number()));
        }

        // Status updates may still say "idle" after the move frame goes out;
        // completion is the MOVE_COMPLETED / MOVE_STOPPED count advancing.
        let started = self.state.channels.update(ch, |s| {
            s.moving = true;
            s.moves_finished
        });
        self.send(frame).await?;

        if wait {
            let options = self.wait_options(self.config.move_wait());
            wait_until(&format!("channel {} move", ch), &options, || {
                self.link.ensure_up()?;
                Ok(self.state.channels.get(ch).moves_finished > started)
            })
            .await?;
            tracing::debug!(channel = ch.number(), "Move completed");
        }
        Ok(())
    }

    /// Wait until `channel` stops moving.
    ///
    /// Reads the `moving` flag, so call it once the move is under way; the
    /// `wait` flag of the move calls waits for the completion message.
    pub async fn wait_for_move(&self, channel: u8, options: &WaitOptions) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        let options = self.wait_options(options.clone());
        wait_until(&format!("channel {} move", ch), &options, || {
            self.link.ensure_up()?;
            Ok(!self.state.channels.get(ch).moving)
        })
        .await
    }

    /// Stop a channel; channel 0 stops all three.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn stop(&self, channel: u8, immediate: bool) -> ScanResult<()> {
        if channel == 0 {
            return self.stop_all(immediate).await;
        }
        self.send(&commands::move_stop(Channel::new(channel)?, immediate))
            .await
    }

    /// Stop every channel. All channels are attempted; the first error is returned.
    pub async fn stop_all(&self, immediate: bool) -> ScanResult<()> {
        let mut first_error = None;
        for ch in Channel::all() {
            if let Err(e) = self.send(&commands::move_stop(ch, immediate)).await {
                tracing::warn!(channel = ch.number(), error = %e, "Stop failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn wait_options(&self, options: WaitOptions) -> WaitOptions {
        if options.cancel.is_some() {
            options
        } else {
            options.cancel_on(self.cancel.clone())
        }
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Set max velocity and acceleration, confirmed by reading them back.
    ///
    /// Returns the limits the controller reports, converted to mm units.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn set_velocity_params(
        &self,
        channel: u8,
        max_velocity_mm_s: f64,
        acceleration_mm_s2: f64,
    ) -> ScanResult<VelocityLimits> {
        let ch = Channel::new(channel)?;
        check_range("max velocity", max_velocity_mm_s, self.config.velocity_limit_mm_s)?;
        check_range("acceleration", acceleration_mm_s2, self.config.acceleration_limit_mm_s2)?;

        let expected = (
            0u32,
            self.scaling.velocity_to_apt(max_velocity_mm_s),
            self.scaling.accel_to_apt(acceleration_mm_s2),
        );
        let set_frame =
            commands::set_velocity_params(ch, max_velocity_mm_s, acceleration_mm_s2, &self.scaling);
        let set_frame = &set_frame;

        set_and_verify(
            &format!("channel {} velocity parameters", ch),
            &self.config.verify,
            &self.link,
            &expected,
            move || self.send(set_frame).boxed(),
            move || self.refresh_velocity(ch).boxed(),
        )
        .await?;

        let limits = self
            .state
            .channels
            .get(ch)
            .velocity
            .map(|v| v.to_limits(&self.scaling))
            .unwrap_or_default();
        tracing::info!(
            channel,
            max_velocity = limits.max_velocity_mm_s,
            acceleration = limits.acceleration_mm_s2,
            "Velocity parameters verified"
        );
        Ok(limits)
    }

    async fn refresh_velocity(&self, ch: Channel) -> ScanResult<Option<(u32, u32, u32)>> {
        self.state.channels.update(ch, |s| s.velocity = None);
        self.send(&commands::request_velocity_params(ch)).await?;
        tokio::time::sleep(self.config.verify.settle()).await;
        Ok(self
            .state
            .channels
            .get(ch)
            .velocity
            .map(|v| (v.min_velocity, v.max_velocity, v.acceleration)))
    }

    /// Last velocity parameters reported by the controller, in mm units.
    pub fn velocity_params(&self, channel: u8) -> ScanResult<Option<VelocityLimits>> {
        Ok(self
            .state
            .channels
            .get_number(channel)?
            .velocity
            .map(|v| v.to_limits(&self.scaling)))
    }

    /// Ask for the velocity parameters; the reply refreshes the cache.
    pub async fn request_velocity_params(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::request_velocity_params(Channel::new(channel)?))
            .await
    }

    /// Overwrite the controller's position counter.
    #[instrument(skip(self), fields(port = %self.port), err)]
    pub async fn set_position_counter(&self, channel: u8, position_mm: f64) -> ScanResult<()> {
        let ch = Channel::new(channel)?;
        self.send(&commands::set_position_counter(ch, position_mm, &self.scaling)?)
            .await
    }

    // =========================================================================
    // Status and position
    // =========================================================================

    /// Ask for a full status update.
    pub async fn request_status_update(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::request_status_update(Channel::new(channel)?))
            .await
    }

    /// Ask for the position counter.
    pub async fn request_position(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::request_position(Channel::new(channel)?))
            .await
    }

    /// Ask for the encoder counter.
    pub async fn request_encoder(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::request_encoder(Channel::new(channel)?))
            .await
    }

    /// Ask for the status bits.
    pub async fn request_status_bits(&self, channel: u8) -> ScanResult<()> {
        self.send(&commands::request_status_bits(Channel::new(channel)?))
            .await
    }

    /// Ask for controller hardware information again.
    pub async fn request_hardware_info(&self) -> ScanResult<()> {
        self.send(&commands::request_hardware_info()).await
    }

    /// Snapshot of one channel.
    pub fn status_of(&self, channel: u8) -> ScanResult<ChannelState> {
        self.state.channels.get_number(channel)
    }

    /// Snapshots of all three channels.
    pub fn channels(&self) -> [ChannelState; 3] {
        self.state.channels.all()
    }

    /// Last known position in mm.
    pub fn position(&self, channel: u8) -> ScanResult<f64> {
        Ok(self.status_of(channel)?.position_mm)
    }

    /// Enabled, homed and error-free.
    pub fn is_ready(&self, channel: u8) -> ScanResult<bool> {
        Ok(self.status_of(channel)?.is_ready())
    }

    /// Hardware information received at connect, if any.
    pub fn hardware_info(&self) -> Option<HardwareInfo> {
        self.state.hardware_info.lock().clone()
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Call `callback(channel)` on the receive pump each time a move completes.
    pub fn on_move_complete<F>(&self, channel: u8, callback: F) -> ScanResult<SubscriptionId>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let ch = Channel::new(channel)?;
        Ok(self
            .state
            .events
            .register(ch.number(), ChannelEvent::MoveComplete, callback))
    }

    /// Call `callback(channel)` on the receive pump each time homing completes.
    pub fn on_home_complete<F>(&self, channel: u8, callback: F) -> ScanResult<SubscriptionId>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let ch = Channel::new(channel)?;
        Ok(self
            .state
            .events
            .register(ch.number(), ChannelEvent::HomeComplete, callback))
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.events.unregister(id)
    }
}

impl Drop for Bbd203Driver {
    fn drop(&mut self) {
        self.cancel.trigger();
        self.pump_stop.trigger();
    }
}

fn check_range(parameter: &'static str, value: f64, max: f64) -> ScanResult<()> {
    if value.is_finite() && value > 0.0 && value <= max {
        Ok(())
    } else {
        Err(ScanError::OutOfRange {
            parameter,
            value,
            min: 0.0,
            max,
        })
    }
}
