//! Shared building blocks for the NueScan serial instrument drivers.
//!
//! The motor-controller and laser drivers speak different wire protocols but
//! share one shape: a split serial link, a receive pump that frames inbound
//! bytes and updates device state, a command engine that confirms settings by
//! reading them back, and per-device completion callbacks.
//!
//! - [`error`]: [`ScanError`] and [`ScanResult`]
//! - [`serial`]: port opening, splitting and the per-device write lock
//! - [`port_resolver`]: USB vendor / serial-number discovery
//! - [`pump`]: the receive pump and the [`pump::FrameDecoder`] seam
//! - [`wait`]: stop signal and cancellable deadline waits
//! - [`verify`]: bounded set-and-verify
//! - [`link`]: connection liveness shared with the pump
//! - [`events`]: per-(channel, kind) subscriber lists
//! - [`mock_serial`]: scripted device for tests

pub mod error;
pub mod events;
pub mod link;
pub mod mock_serial;
pub mod port_resolver;
pub mod pump;
pub mod serial;
pub mod verify;
pub mod wait;

pub use error::{ScanError, ScanResult};
pub use events::{EventRegistry, SubscriptionId};
pub use link::LinkStatus;
pub use port_resolver::PortCandidate;
pub use pump::{spawn_pump, FrameDecoder, PumpExit, PumpHandle};
pub use serial::{DynSerial, SerialSettings, SharedWriter};
pub use verify::{set_and_verify, VerifyPolicy};
pub use wait::{wait_until, StopSignal, WaitOptions};
