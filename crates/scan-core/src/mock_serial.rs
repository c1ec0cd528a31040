//! Scripted serial device for driver tests.
//!
//! [`MockSerialPort`] implements `AsyncRead`/`AsyncWrite` and is handed to the
//! driver in place of a real port. The test keeps the [`MockDeviceHarness`] and
//! plays the instrument: it asserts on the bytes the driver writes and pushes
//! back replies, status frames or garbage at chosen moments.
//!
//! # Architecture
//!
//! A pair of unbounded channels carries the two directions:
//! - `MockSerialPort` (given to the driver): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in the test): scripts device behavior
//!
//! Dropping the harness closes the port: reads return end-of-file and writes
//! fail with `BrokenPipe`, which is how tests simulate an unplugged cable.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scan_core::mock_serial;
//! use scan_driver_helios::{HeliosConfig, HeliosDriver};
//!
//! let (port, mut harness) = mock_serial::new();
//! let laser = Arc::new(HeliosDriver::from_port(
//!     Box::new(port),
//!     "mock-helios",
//!     HeliosConfig::default(),
//! )?);
//!
//! let querier = Arc::clone(&laser);
//! let query = tokio::spawn(async move { querier.query_frequency_hz().await });
//! harness.expect_and_respond(b"LDF\r", b"20000\r").await;
//! assert_eq!(query.await??, 50_000.0);
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const EXPECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Driver-facing side of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Bytes written by the driver, forwarded to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Chunks pushed by the harness for the driver to read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Harness data received but not yet read
    read_buffer: VecDeque<u8>,
}

/// Test-facing side that plays the instrument.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Driver writes received but not yet consumed by an expectation
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: harness_to_client_tx,
        write_buffer: Vec::new(),
    };

    (port, harness)
}

impl MockSerialPort {
    fn fill_from_buffer(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill_from_buffer(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill_from_buffer(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Push bytes for the driver to read, as if the device had sent them.
    ///
    /// # Errors
    /// Returns error if the driver side has been dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Push bytes one at a time, to exercise reassembly of split frames.
    pub async fn send_bytewise(&self, data: &[u8], gap: Duration) -> Result<(), &'static str> {
        for byte in data {
            self.send_response(std::slice::from_ref(byte))?;
            tokio::time::sleep(gap).await;
        }
        Ok(())
    }

    async fn fill_write_buffer(&mut self, wanted: usize, timeout: Duration) -> bool {
        while self.write_buffer.len() < wanted {
            match tokio::time::timeout(timeout, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) | Err(_) => return false,
            }
        }
        true
    }

    /// Wait for the driver to write `expected` next, and assert it.
    ///
    /// # Panics
    /// Panics if the bytes do not arrive within 2 seconds or differ.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        if !self.fill_write_buffer(expected.len(), EXPECT_TIMEOUT).await {
            panic!(
                "Timeout waiting for write. Expected {:02X?} ({} bytes), received {:02X?}",
                expected,
                expected.len(),
                self.write_buffer
            );
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual, expected,
            "Mismatch in expected write. Expected {:02X?}, got {:02X?} ({:?})",
            expected,
            actual,
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Wait for exactly `len` written bytes and return them.
    ///
    /// # Panics
    /// Panics if they do not arrive within 2 seconds.
    pub async fn read_written(&mut self, len: usize) -> Vec<u8> {
        if !self.fill_write_buffer(len, EXPECT_TIMEOUT).await {
            panic!(
                "Timeout waiting for {} written bytes, received {:02X?}",
                len, self.write_buffer
            );
        }
        self.write_buffer.drain(..len).collect()
    }

    /// Expect a write, then answer it.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{e}");
        }
    }

    /// Assert the driver writes nothing for `window`.
    ///
    /// # Panics
    /// Panics if any byte is written.
    pub async fn expect_silence(&mut self, window: Duration) {
        let got_any = self.fill_write_buffer(self.write_buffer.len() + 1, window).await;
        assert!(
            !got_any && self.write_buffer.is_empty(),
            "Expected no writes, got {:02X?}",
            self.write_buffer
        );
    }

    /// Discard pending writes without asserting on them.
    pub async fn drain_writes(&mut self) {
        let short_timeout = Duration::from_millis(50);
        while let Ok(Some(chunk)) = tokio::time::timeout(short_timeout, self.writes_rx.recv()).await
        {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }
}
