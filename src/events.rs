//! Publish/subscribe notifications for transceiver events
//!
//! A [`Signal`] is owned by the object that emits the event. Subscribers get
//! a [`Subscription`] back and stay connected exactly as long as they keep it;
//! dropping the handle disconnects the callback, so a router that goes away
//! before the transceivers it listened to leaves nothing dangling behind.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<T>)>>,
}

/// Event source with any number of subscribers
pub struct Signal<T> {
    slots: Arc<Slots<T>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Slots {
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connect a callback; it stays connected while the returned handle lives
    #[must_use = "dropping the subscription disconnects the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.slots.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.callbacks.lock().push((id, Arc::new(callback)));

        let weak: Weak<Slots<T>> = Arc::downgrade(&self.slots);
        Subscription {
            disconnect: Some(Box::new(move || {
                if let Some(slots) = weak.upgrade() {
                    slots.callbacks.lock().retain(|(cid, _)| *cid != id);
                }
            })),
        }
    }

    /// Deliver `value` to every subscriber, in subscription order
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe or
    /// drop subscriptions on this same signal.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .slots
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.callbacks.lock().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection handle returned by [`Signal::subscribe`]
pub struct Subscription {
    disconnect: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Disconnect now instead of on drop
    pub fn unsubscribe(mut self) {
        self.disconnect_now();
    }

    fn disconnect_now(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disconnect_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("connected", &self.disconnect.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_subscribers() {
        let signal = Signal::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));

        let t = total.clone();
        let _a = signal.subscribe(move |v| {
            t.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let t = total.clone();
        let _b = signal.subscribe(move |v| {
            t.fetch_add(*v as usize * 10, Ordering::SeqCst);
        });

        signal.emit(&2);
        assert_eq!(total.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let signal = Signal::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = signal.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        signal.emit(&());
        drop(sub);
        signal.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outlives_signal() {
        let signal = Signal::<bool>::new();
        let sub = signal.subscribe(|_| {});
        drop(signal);
        sub.unsubscribe();
    }
}
