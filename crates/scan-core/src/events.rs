//! Per-device event subscriptions.
//!
//! Each driver owns one [`EventRegistry`]. Subscribers are keyed by
//! `(channel, kind)` and called in registration order with the channel index.
//! Notification happens on the receive pump, so callbacks must return quickly.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Callback invoked with the channel index.
pub type EventCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Handle returned by [`EventRegistry::register`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscribers = Vec<(SubscriptionId, EventCallback)>;

/// Ordered subscriber lists per `(channel, kind)`.
pub struct EventRegistry<K> {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<(u8, K), Subscribers>>,
}

impl<K> Default for EventRegistry<K> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }
}

impl<K> std::fmt::Debug for EventRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("keys", &self.subscribers.read().len())
            .finish()
    }
}

impl<K> EventRegistry<K>
where
    K: Copy + Eq + Hash + std::fmt::Debug,
{
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `callback` to the `(channel, kind)` list.
    pub fn register<F>(&self, channel: u8, kind: K, callback: F) -> SubscriptionId
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry((channel, kind))
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of subscribers for `(channel, kind)`.
    pub fn subscriber_count(&self, channel: u8, kind: K) -> usize {
        self.subscribers
            .read()
            .get(&(channel, kind))
            .map_or(0, Vec::len)
    }

    /// Call every subscriber of `(channel, kind)` in order.
    ///
    /// The list is snapshotted first, so callbacks may register or unregister
    /// without deadlocking. A panicking callback is logged and skipped.
    /// Returns how many callbacks completed normally.
    pub fn notify(&self, channel: u8, kind: K) -> usize {
        let snapshot: Vec<EventCallback> = match self.subscribers.read().get(&(channel, kind)) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };

        let mut completed = 0;
        for callback in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(channel))) {
                Ok(()) => completed += 1,
                Err(_) => {
                    tracing::error!(channel, event = ?kind, "Event callback panicked");
                }
            }
        }
        completed
    }
}
