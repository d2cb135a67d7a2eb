//! Listener registration and fan-out.
//!
//! Connections and nodes notify observers through a `Listeners` bus.
//! The callback list is cloned out of the lock before invocation, so a
//! listener may register or remove listeners (including itself) from within
//! its own callback without deadlocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription<E> {
    bus: Weak<Listeners<E>>,
    id: usize,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions.
pub struct Listeners<E> {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(E) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on
    /// drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic
        // unwinding while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Clone> Listeners<E> {
    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list to prevent deadlock if a callback
        // subscribes or unsubscribes.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(Listeners::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |value| {
            count_clone.fetch_add(value as usize, Ordering::Relaxed);
        });

        bus.emit(3);
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(Listeners::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(1);
            // _sub dropped here
        }

        bus.emit(2);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_multiple_subscribers() {
        let bus = Arc::new(Listeners::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _sub1 = bus.subscribe(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        });
        let c2 = Arc::clone(&count);
        let _sub2 = bus.subscribe(move |_| {
            c2.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(0);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_subscribe_from_within_callback() {
        let bus = Arc::new(Listeners::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));

        let bus_clone = Arc::clone(&bus);
        let count_clone = Arc::clone(&count);
        let _sub = bus.subscribe(move |_| {
            // Registering from inside a callback must not deadlock; the new
            // subscription is leaked on purpose for the test.
            let inner_count = Arc::clone(&count_clone);
            std::mem::forget(bus_clone.subscribe(move |_| {
                inner_count.fetch_add(1, Ordering::Relaxed);
            }));
        });

        bus.emit(0);
        assert_eq!(bus.len(), 2);

        bus.emit(0);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
