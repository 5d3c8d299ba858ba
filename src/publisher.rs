//! A tiny in-process subject/subscriber primitive.
//!
//! Used both by [`Event`](crate::observer::event::Event) occurrences and by
//! [`Device`](crate::device::Device) state-change notifications. Subscribers
//! are held by identity (a `SubscriberId`), not by `Weak` reference: the
//! publisher does not own subscriber lifetime, callers must
//! `unsubscribe` explicitly, exactly as spec.md 4.3 describes.
//!
//! Operations are synchronous and backed by a `std::sync::Mutex`, not a
//! Tokio one: the critical section never holds across an `.await` (it is
//! a `Vec` push/retain/clone), the same reasoning the teacher gives for
//! using `std::sync::Mutex` around `Db`'s `Shared` state.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

/// Opaque handle returned from `subscribe`, used to `unsubscribe` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriberId, Callback<T>)>>,
}

/// A topic that can be published to and subscribed from, fanning payloads
/// out to every live subscriber.
pub struct Publisher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Publisher {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T> {
    pub fn new() -> Self {
        Publisher {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register `callback`, returning an id usable with [`unsubscribe`](Publisher::unsubscribe).
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a previously registered subscriber. No-op if already removed.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Fan `payload` out to a snapshot of the current subscriber list.
    ///
    /// Subscribers are invoked outside the lock so a slow or panicking
    /// subscriber cannot block registration/removal, or the whole publish
    /// call. A panic from one subscriber is caught and logged; it never
    /// stops the remaining subscribers from being notified.
    pub fn notify_subscribers(&self, payload: T) {
        let snapshot: Vec<Callback<T>> = {
            let guard = self.inner.subscribers.lock().unwrap();
            guard.iter().map(|(_, cb)| cb.clone()).collect()
        };

        for callback in snapshot {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&payload))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(panic = %msg, "publisher subscriber panicked; swallowing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notify_reaches_every_live_subscriber() {
        let publisher: Publisher<i32> = Publisher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let s1 = seen.clone();
        publisher.subscribe(move |_| {
            s1.fetch_add(1, Ordering::SeqCst);
        });
        let s2 = seen.clone();
        let id2 = publisher.subscribe(move |_| {
            s2.fetch_add(10, Ordering::SeqCst);
        });

        publisher.notify_subscribers(1);
        assert_eq!(seen.load(Ordering::SeqCst), 11);

        publisher.unsubscribe(id2);
        publisher.notify_subscribers(1);
        assert_eq!(seen.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn a_panicking_subscriber_does_not_block_the_others() {
        let publisher: Publisher<()> = Publisher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        publisher.subscribe(|_| panic!("boom"));
        let s = seen.clone();
        publisher.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        publisher.notify_subscribers(());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
