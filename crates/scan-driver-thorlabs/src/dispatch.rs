//! Applies inbound APT messages to channel state and fires completion events.
//!
//! Runs on the receive pump. Messages for channels outside 1..=3 are dropped,
//! unknown message ids are logged and skipped, and a malformed payload only
//! costs that one message.

use std::sync::Arc;

use parking_lot::Mutex;
use scan_core::{EventRegistry, ScanError, ScanResult};

use crate::apt::{
    AptMessage, AptScaling, Channel, ChannelEnableState, EncoderCounter, HardwareInfo, MessageId,
    PositionCounter, RichResponse, StatusBitsReply, StatusUpdate, VelocityParams,
};
use crate::channel::ChannelTable;

/// Completion events a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// `MOVE_COMPLETED` received
    MoveComplete,
    /// `MOVE_HOMED` received
    HomeComplete,
}

/// Pump-side state shared with the driver.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    pub(crate) channels: Arc<ChannelTable>,
    pub(crate) events: Arc<EventRegistry<ChannelEvent>>,
    pub(crate) hardware_info: Arc<Mutex<Option<HardwareInfo>>>,
    pub(crate) scaling: AptScaling,
    pub(crate) port: String,
}

impl Dispatcher {
    pub(crate) fn dispatch(&self, msg: AptMessage) {
        if let Err(e) = self.apply(&msg) {
            match e {
                ScanError::UnknownMessageId(id) => {
                    tracing::debug!(port = %self.port, id = format_args!("0x{:04X}", id), "Skipping unknown message");
                }
                other => {
                    tracing::warn!(port = %self.port, id = format_args!("0x{:04X}", msg.header.id), error = %other, "Dropping message");
                }
            }
        }
    }

    fn apply(&self, msg: &AptMessage) -> ScanResult<()> {
        let id = msg.header.message_id()?;
        let payload = msg.payload.as_ref();

        match id {
            MessageId::HwGetInfo => {
                let info = HardwareInfo::parse(payload)?;
                tracing::info!(
                    port = %self.port,
                    serial = info.serial_number,
                    model = %info.model,
                    firmware = %info.firmware(),
                    channels = info.channel_count,
                    "Controller hardware info"
                );
                *self.hardware_info.lock() = Some(info);
                return Ok(());
            }
            MessageId::HwResponse => {
                tracing::warn!(port = %self.port, p1 = msg.header.param1, p2 = msg.header.param2, "Controller response event");
                return Ok(());
            }
            MessageId::HwRichResponse => {
                let response = RichResponse::parse(payload)?;
                tracing::warn!(
                    port = %self.port,
                    message = format_args!("0x{:04X}", response.message_id),
                    code = response.code,
                    notes = %response.notes,
                    "Controller reported an error"
                );
                return Ok(());
            }
            _ => {}
        }

        let Some(channel) = msg.header.channel() else {
            tracing::debug!(
                port = %self.port,
                id = ?id,
                dest = msg.header.destination(),
                source = msg.header.source,
                "Discarding message for unknown channel"
            );
            return Ok(());
        };

        match id {
            MessageId::MotGetStatusUpdate => {
                let update = StatusUpdate::parse(payload)?;
                self.channels
                    .update(channel, |s| s.apply_status_update(&update, &self.scaling));
                tracing::trace!(port = %self.port, channel = channel.number(), status = format_args!("0x{:08X}", update.status.bits()), "Status update");
            }
            MessageId::MotGetStatusBits => {
                let reply = StatusBitsReply::parse(payload)?;
                self.channels.update(channel, |s| s.apply_status_bits(reply.status));
            }
            MessageId::MotGetPosCounter => {
                let counter = PositionCounter::parse(payload)?;
                let position_mm = self.scaling.apt_to_position(counter.position);
                self.channels.update(channel, |s| s.position_mm = position_mm);
            }
            MessageId::MotGetEncCounter => {
                let counter = EncoderCounter::parse(payload)?;
                self.channels.update(channel, |s| s.encoder_count = counter.count);
            }
            MessageId::MotGetVelParams => {
                let params = VelocityParams::parse(payload)?;
                self.channels.update(channel, |s| s.velocity = Some(params));
            }
            MessageId::ModGetChanEnableState => {
                let state = ChannelEnableState::from_header(&msg.header);
                self.channels.update(channel, |s| s.enabled = state.enabled);
            }
            MessageId::MotMoveCompleted => {
                self.finish_motion(channel, payload);
                tracing::debug!(port = %self.port, channel = channel.number(), "Move completed");
                self.events.notify(channel.number(), ChannelEvent::MoveComplete);
            }
            MessageId::MotMoveStopped => {
                self.finish_motion(channel, payload);
                tracing::debug!(port = %self.port, channel = channel.number(), "Motion stopped");
            }
            MessageId::MotMoveHomed => {
                self.channels.update(channel, |s| {
                    s.homed = true;
                    s.homing = false;
                    s.homes_finished += 1;
                });
                tracing::debug!(port = %self.port, channel = channel.number(), "Homing completed");
                self.events.notify(channel.number(), ChannelEvent::HomeComplete);
            }
            other => {
                tracing::trace!(port = %self.port, id = ?other, channel = channel.number(), "Ignoring message");
            }
        }
        Ok(())
    }

    /// Motion-end messages may carry a status update; apply it if present.
    fn finish_motion(&self, channel: Channel, payload: &[u8]) {
        let update = StatusUpdate::parse(payload).ok();
        self.channels.update(channel, |s| {
            if let Some(update) = &update {
                s.apply_status_update(update, &self.scaling);
            }
            s.moving = false;
            s.moves_finished += 1;
        });
    }
}
