//! Per-channel motor state.
//!
//! The receive pump is the only writer apart from the command paths that mark
//! a motion or homing as started. Readers always get a full copy taken under
//! the lock, never a half-applied update.

use parking_lot::RwLock;
use scan_core::ScanResult;

use crate::apt::{AptScaling, Channel, StatusBits, StatusUpdate, VelocityParams, CHANNEL_COUNT};

/// State of one motor channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelState {
    /// Motor drive enabled
    pub enabled: bool,
    /// Homing completed since power-up
    pub homed: bool,
    /// Homing in progress
    pub homing: bool,
    /// Any motion in progress
    pub moving: bool,
    /// Motion error reported
    pub error: bool,
    /// Position in mm
    pub position_mm: f64,
    /// Raw encoder count
    pub encoder_count: i32,
    /// Last status word
    pub raw_status: u32,
    /// Last velocity parameters reported by the controller
    pub velocity: Option<VelocityParams>,
    /// MOVE_COMPLETED / MOVE_STOPPED messages received
    pub moves_finished: u64,
    /// MOVE_HOMED messages received
    pub homes_finished: u64,
}

impl ChannelState {
    /// Enabled, homed and error-free: safe to command a move.
    pub fn is_ready(&self) -> bool {
        self.enabled && self.homed && !self.error
    }

    /// Status word as flags.
    pub fn status_bits(&self) -> StatusBits {
        StatusBits::from_raw(self.raw_status)
    }

    /// Derive the flags from a status word.
    pub fn apply_status_bits(&mut self, status: StatusBits) {
        self.raw_status = status.bits();
        self.enabled = status.contains(StatusBits::MOTOR_ENABLED);
        self.homed = status.contains(StatusBits::HOMED);
        self.homing = status.contains(StatusBits::HOMING);
        self.error = status.contains(StatusBits::MOTION_ERROR);
        self.moving = status.is_moving();
    }

    /// Apply a full status update.
    pub fn apply_status_update(&mut self, update: &StatusUpdate, scaling: &AptScaling) {
        self.position_mm = scaling.apt_to_position(update.position);
        self.encoder_count = update.encoder;
        self.apply_status_bits(update.status);
    }
}

/// The three channel states behind one lock.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: RwLock<[ChannelState; CHANNEL_COUNT]>,
}

impl ChannelTable {
    /// All channels disabled, unhomed, at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of one channel's state.
    pub fn get(&self, channel: Channel) -> ChannelState {
        self.channels.read()[channel.index()]
    }

    /// Copy of one channel's state by number.
    pub fn get_number(&self, number: u8) -> ScanResult<ChannelState> {
        Ok(self.get(Channel::new(number)?))
    }

    /// Copy of every channel's state.
    pub fn all(&self) -> [ChannelState; CHANNEL_COUNT] {
        *self.channels.read()
    }

    /// Mutate one channel under the write lock.
    pub fn update<R>(&self, channel: Channel, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        f(&mut self.channels.write()[channel.index()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(enabled: bool, homed: bool, error: bool) -> ChannelState {
        ChannelState {
            enabled,
            homed,
            error,
            ..ChannelState::default()
        }
    }

    #[test]
    fn ready_truth_table() {
        for enabled in [false, true] {
            for homed in [false, true] {
                for error in [false, true] {
                    let expected = enabled && homed && !error;
                    assert_eq!(
                        state(enabled, homed, error).is_ready(),
                        expected,
                        "enabled={enabled} homed={homed} error={error}"
                    );
                }
            }
        }
    }

    #[test]
    fn homed_and_enabled_status_makes_channel_ready() {
        let mut ch = ChannelState::default();
        let update = StatusUpdate {
            channel: 1,
            position: 200_000,
            encoder: 200_010,
            status: StatusBits::HOMED | StatusBits::MOTOR_ENABLED,
        };
        ch.apply_status_update(&update, &AptScaling::default());

        assert!(ch.enabled);
        assert!(ch.homed);
        assert!(!ch.homing);
        assert!(!ch.moving);
        assert!(!ch.error);
        assert!(ch.is_ready());
        assert_eq!(ch.position_mm, 10.0);
        assert_eq!(ch.encoder_count, 200_010);
        assert_eq!(ch.raw_status, 0x8000_0400);
    }

    #[test]
    fn each_motion_bit_sets_moving() {
        for bit in [
            StatusBits::IN_MOTION_FORWARD,
            StatusBits::IN_MOTION_REVERSE,
            StatusBits::JOGGING_FORWARD,
            StatusBits::JOGGING_REVERSE,
            StatusBits::HOMING,
        ] {
            let mut ch = ChannelState::default();
            ch.apply_status_bits(bit | StatusBits::MOTOR_ENABLED);
            assert!(ch.moving, "{bit:?} should count as motion");
        }

        let mut ch = ChannelState::default();
        ch.apply_status_bits(StatusBits::SETTLED | StatusBits::TRACKING);
        assert!(!ch.moving);
    }

    #[test]
    fn motion_error_blocks_ready() {
        let mut ch = ChannelState::default();
        ch.apply_status_bits(StatusBits::HOMED | StatusBits::MOTOR_ENABLED | StatusBits::MOTION_ERROR);
        assert!(ch.error);
        assert!(!ch.is_ready());
    }

    #[test]
    fn table_updates_are_per_channel() {
        let table = ChannelTable::new();
        let ch2 = Channel::new(2).unwrap();
        table.update(ch2, |s| s.moving = true);

        assert!(table.get(ch2).moving);
        assert!(!table.get_number(1).unwrap().moving);
        assert!(table.get_number(4).is_err());
        assert_eq!(table.all().iter().filter(|s| s.moving).count(), 1);
    }
}
