//! Synchronous callback registries.
//!
//! [`Signal`] is the observer primitive behind run/stream notifications, the
//! aggregator's `run_created`/`run_completed` and every plot spec change
//! event. Delivery is synchronous and in subscription order, over a snapshot
//! of the subscriber list taken when `emit` starts:
//!
//! - a callback disconnected during an emit is skipped if it has not run yet,
//!   and the remaining callbacks still run;
//! - a callback connected during an emit only sees later emits;
//! - no lock is held while callbacks run, so callbacks may connect,
//!   disconnect or emit on the same signal;
//! - a panicking callback is logged and the emit moves on to the next one.
//!
//! [`Subscription`] is an RAII guard that disconnects when dropped.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: AtomicU64,
    slots: Mutex<Vec<(u64, Callback<T>)>>,
}

/// A list of callbacks notified with `&T`.
pub struct Signal<T> {
    inner: Arc<Slots<T>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T> Signal<T> {
    /// Create a signal with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Slots {
                next_id: AtomicU64::new(0),
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of connected callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.inner.slots.lock().len()
    }
}

impl<T: 'static> Signal<T> {
    /// Connect a callback. It stays connected until the returned guard drops.
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn connect<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.slots.lock().push((id, Arc::new(callback)));
        let weak: Weak<Slots<T>> = Arc::downgrade(&self.inner);
        Subscription {
            disconnect: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots.slots.lock().retain(|(slot_id, _)| *slot_id != id);
                }
            })),
        }
    }

    /// Notify every connected callback. Returns how many of them panicked.
    pub fn emit(&self, value: &T) -> usize {
        let mut panicked = 0;
        let snapshot: Vec<(u64, Callback<T>)> = self.inner.slots.lock().clone();
        for (id, callback) in snapshot {
            let still_connected = self
                .inner
                .slots
                .lock()
                .iter()
                .any(|(slot_id, _)| *slot_id == id);
            if !still_connected {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                tracing::error!(subscriber = id, "signal callback panicked");
                panicked += 1;
            }
        }
        panicked
    }
}

/// Disconnects its callback when dropped.
pub struct Subscription {
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.disconnect.is_some())
            .finish()
    }
}

impl Subscription {
    /// Disconnect now. Equivalent to dropping the guard.
    pub fn cancel(mut self) {
        self.run_disconnect();
    }

    /// Keep the callback connected for the lifetime of the signal.
    pub fn detach(mut self) {
        self.disconnect = None;
    }

    fn run_disconnect(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = seen.clone();
            signal.connect(move |v| seen.lock().push(("a", *v)))
        };
        let s2 = {
            let seen = seen.clone();
            signal.connect(move |v| seen.lock().push(("b", *v)))
        };

        signal.emit(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
        drop((s1, s2));
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_dropping_subscription_disconnects() {
        let signal = Signal::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = count.clone();
            signal.connect(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        signal.emit(&());
        drop(sub);
        signal.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disconnect_during_emit_skips_only_that_callback() {
        let signal = Arc::new(Signal::<()>::new());
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let victim_calls = Arc::new(AtomicUsize::new(0));
        let last_calls = Arc::new(AtomicUsize::new(0));

        let killer = {
            let victim = victim.clone();
            signal.connect(move |_| {
                victim.lock().take();
            })
        };
        let v = {
            let victim_calls = victim_calls.clone();
            signal.connect(move |_| {
                victim_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        *victim.lock() = Some(v);
        let last = {
            let last_calls = last_calls.clone();
            signal.connect(move |_| {
                last_calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        signal.emit(&());
        assert_eq!(victim_calls.load(Ordering::SeqCst), 0);
        assert_eq!(last_calls.load(Ordering::SeqCst), 1);
        drop((killer, last));
    }

    #[test]
    fn test_panicking_callback_does_not_starve_later_ones() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let _bad = signal.connect(|_| panic!("observer failure"));
        let _good = {
            let seen = seen.clone();
            signal.connect(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(signal.emit(&1), 1);
        assert_eq!(signal.emit(&2), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_detached_subscription_stays_connected() {
        let signal = Signal::<()>::new();
        signal.connect(|_| {}).detach();
        assert_eq!(signal.subscriber_count(), 1);
    }
}
