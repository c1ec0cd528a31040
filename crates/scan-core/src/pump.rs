//! Receive pump: one background task per connection that turns the inbound
//! byte stream into complete frames.
//!
//! The pump cycles Idle -> Accumulating -> Dispatching -> Idle:
//!
//! 1. Wait for bytes (or the stop signal).
//! 2. Append them to a growing buffer.
//! 3. While the [`FrameDecoder`] can extract a complete frame, remove exactly
//!    that frame from the front of the buffer and hand it to the [`FrameSink`].
//!
//! Partial frames stay buffered until the rest arrives. A decoder error means the
//! stream can no longer be framed; the pump stops and marks the link down
//! instead of guessing where the next frame starts.
//!
//! Sinks run synchronously on the pump task. They must update state and return
//! quickly; a slow sink delays every later frame.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::error::ScanResult;
use crate::link::LinkStatus;
use crate::wait::StopSignal;

const READ_CHUNK: usize = 256;

/// Extracts complete frames from the front of a byte buffer.
pub trait FrameDecoder: Send + 'static {
    /// Decoded frame type.
    type Frame: Send;

    /// Remove and return one complete frame, or `Ok(None)` if more bytes are needed.
    ///
    /// Must not consume anything when returning `Ok(None)`. An `Err` means the
    /// stream is corrupted and ends the pump.
    fn decode(&mut self, buf: &mut BytesMut) -> ScanResult<Option<Self::Frame>>;
}

/// Receives each decoded frame on the pump task.
pub trait FrameSink<F>: Send + 'static {
    /// Apply one frame to device state.
    fn dispatch(&mut self, frame: F);
}

impl<F, T> FrameSink<F> for T
where
    T: FnMut(F) + Send + 'static,
{
    fn dispatch(&mut self, frame: F) {
        self(frame)
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The stop signal was triggered.
    Stopped,
    /// The device side closed the stream.
    EndOfStream,
    /// Reading failed.
    Transport(String),
    /// The decoder could not frame the stream.
    Corrupted(String),
}

impl PumpExit {
    /// Text recorded as the link fault.
    pub fn describe(&self) -> String {
        match self {
            PumpExit::Stopped => "disconnect requested".to_string(),
            PumpExit::EndOfStream => "device closed the connection".to_string(),
            PumpExit::Transport(e) => format!("read failed: {}", e),
            PumpExit::Corrupted(e) => format!("stream corrupted: {}", e),
        }
    }
}

/// Handle to a running pump.
#[derive(Debug)]
pub struct PumpHandle {
    stop: StopSignal,
    task: JoinHandle<PumpExit>,
}

impl PumpHandle {
    /// Signal the pump to stop and join it, waiting at most `timeout`.
    ///
    /// Returns `None` if the pump did not finish in time; it is aborted then.
    pub async fn shutdown(self, timeout: Duration) -> Option<PumpExit> {
        self.stop.trigger();
        let PumpHandle { task, .. } = self;
        let abort = task.abort_handle();
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Receive pump task failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Receive pump did not stop in time, aborting");
                abort.abort();
                None
            }
        }
    }

    /// True once the pump task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Clone of the pump's stop signal.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }
}

/// Spawn the receive pump for one connection.
///
/// Marks `link` up immediately and down when the pump exits.
pub fn spawn_pump<R, D, S>(
    label: impl Into<String>,
    reader: R,
    decoder: D,
    sink: S,
    link: LinkStatus,
) -> PumpHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    D: FrameDecoder,
    S: FrameSink<D::Frame>,
{
    let stop = StopSignal::new();
    let label = label.into();
    link.mark_up();

    let task = tokio::spawn(run_pump(label, reader, decoder, sink, link, stop.clone()));
    PumpHandle { stop, task }
}

async fn run_pump<R, D, S>(
    label: String,
    mut reader: R,
    mut decoder: D,
    mut sink: S,
    link: LinkStatus,
    stop: StopSignal,
) -> PumpExit
where
    R: AsyncRead + Unpin + Send + 'static,
    D: FrameDecoder,
    S: FrameSink<D::Frame>,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK * 4);
    tracing::debug!(port = %label, "Receive pump started");

    let exit = loop {
        if let Err(e) = dispatch_complete(&mut decoder, &mut buf, &mut sink) {
            tracing::error!(port = %label, error = %e, buffered = buf.len(), "Unframeable input, closing connection");
            break PumpExit::Corrupted(e.to_string());
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            biased;
            _ = stop.triggered() => break PumpExit::Stopped,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break PumpExit::EndOfStream,
                Ok(n) => tracing::trace!(port = %label, bytes = n, buffered = buf.len(), "Received bytes"),
                Err(e) => break PumpExit::Transport(e.to_string()),
            },
        }
    };

    link.mark_down(exit.describe());
    match &exit {
        PumpExit::Stopped => tracing::debug!(port = %label, "Receive pump stopped"),
        other => tracing::warn!(port = %label, reason = %other.describe(), "Receive pump exited"),
    }
    exit
}

fn dispatch_complete<D, S>(decoder: &mut D, buf: &mut BytesMut, sink: &mut S) -> ScanResult<()>
where
    D: FrameDecoder,
    S: FrameSink<D::Frame>,
{
    while let Some(frame) = decoder.decode(buf)? {
        sink.dispatch(frame);
    }
    Ok(())
}
