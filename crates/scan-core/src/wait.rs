//! Cancellable waits with a deadline.
//!
//! Motion waits, homing waits and pump shutdown all reduce to "poll a condition
//! on a fixed interval until it holds, the deadline passes, or someone cancels".
//! [`wait_until`] is that loop; [`StopSignal`] is the cancellation handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{ScanError, ScanResult};

/// One-shot, clonable stop flag that async tasks can await.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    /// An untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check the flag without waiting.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been triggered.
    pub async fn triggered(&self) {
        loop {
            // Register before checking the flag so a trigger in between is not lost.
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Deadline, poll interval and optional cancellation for [`wait_until`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Give up after this long
    pub timeout: Duration,
    /// Re-check the condition this often
    pub poll_interval: Duration,
    /// Abort early when triggered
    pub cancel: Option<StopSignal>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            cancel: None,
        }
    }
}

impl WaitOptions {
    /// Wait up to `timeout` with the default 10 ms poll interval.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Set the poll interval.
    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cancel the wait when `signal` triggers.
    pub fn cancel_on(mut self, signal: StopSignal) -> Self {
        self.cancel = Some(signal);
        self
    }
}

/// Poll `condition` until it returns `true`.
///
/// The condition is checked immediately, then once per poll interval. An error
/// from the condition ends the wait with that error.
///
/// # Errors
///
/// [`ScanError::Timeout`] when the deadline passes, [`ScanError::Cancelled`]
/// when the cancel signal fires.
pub async fn wait_until<F>(what: &str, options: &WaitOptions, mut condition: F) -> ScanResult<()>
where
    F: FnMut() -> ScanResult<bool>,
{
    let start = Instant::now();
    let deadline = start + options.timeout;

    loop {
        if let Some(cancel) = &options.cancel {
            if cancel.is_triggered() {
                return Err(ScanError::Cancelled(what.to_string()));
            }
        }

        if condition()? {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ScanError::Timeout {
                what: what.to_string(),
                elapsed_ms: now.duration_since(start).as_millis() as u64,
            });
        }

        let nap = options.poll_interval.min(deadline - now);
        match &options.cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.triggered() => {
                        return Err(ScanError::Cancelled(what.to_string()));
                    }
                    _ = tokio::time::sleep(nap) => {}
                }
            }
            None => tokio::time::sleep(nap).await,
        }
    }
}
