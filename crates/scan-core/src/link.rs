//! Connection liveness shared between a driver and its receive pump.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ScanError, ScanResult};

#[derive(Debug, Default)]
struct LinkInner {
    up: AtomicBool,
    fault: Mutex<Option<String>>,
}

/// Up/down flag plus the reason the link last went down.
///
/// Cloned into the pump; the pump marks the link down when it exits for any
/// reason, which makes every pending verify loop or motion wait fail fast.
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    inner: Arc<LinkInner>,
}

impl LinkStatus {
    /// A link that starts out down.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the link up and clear any previous fault.
    pub fn mark_up(&self) {
        *self.inner.fault.lock() = None;
        self.inner.up.store(true, Ordering::SeqCst);
    }

    /// Mark the link down. The first reason recorded wins.
    pub fn mark_down(&self, reason: impl Into<String>) {
        let mut fault = self.inner.fault.lock();
        if fault.is_none() {
            *fault = Some(reason.into());
        }
        self.inner.up.store(false, Ordering::SeqCst);
    }

    /// True while the connection is usable.
    pub fn is_up(&self) -> bool {
        self.inner.up.load(Ordering::SeqCst)
    }

    /// Why the link went down, if it did.
    pub fn fault(&self) -> Option<String> {
        self.inner.fault.lock().clone()
    }

    /// `Ok` while up, otherwise [`ScanError::Disconnected`] carrying the fault.
    pub fn ensure_up(&self) -> ScanResult<()> {
        if self.is_up() {
            Ok(())
        } else {
            Err(ScanError::Disconnected {
                reason: self.fault().unwrap_or_else(|| "not connected".to_string()),
            })
        }
    }
}
