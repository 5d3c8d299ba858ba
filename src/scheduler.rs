//! Minimal timing service used for observer timeouts and device housekeeping.
//!
//! The fire-or-cancel race here is the same shape as the teacher's
//! `purge_expired_tasks`: `tokio::select! { _ = time::sleep_until(when) => {},
//! _ = notify.notified() => {} }`, generalized from one hardcoded purge job
//! into arbitrary `call_later`/`call_periodic` callbacks. Accuracy floor is
//! whatever `tokio::time` gives us under load (spec.md 4.6 documents a
//! ±20 ms floor for callers; the scheduler itself never claims more).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::{self, Duration};

/// A cancellable handle to a scheduled (one-shot or periodic) callback.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl TimerHandle {
    /// Cancel the timer. Idempotent; prevents any further fires.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.cancel_notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Schedules callbacks to run after a delay, or repeatedly on an interval.
///
/// Each call spawns its own worker task; there is no shared event loop to
/// starve. `Scheduler` is cheap to clone (it is stateless besides being a
/// handle used for naming in log lines) and is typically held as a single
/// process-wide instance, injected rather than accessed as a singleton
/// (REDESIGN FLAGS: module-level singletons become explicit services).
#[derive(Clone, Default)]
pub struct Scheduler {
    name: Arc<str>,
}

impl Scheduler {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Scheduler { name: name.into() }
    }

    /// Run `callback` once, after `delay`.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());

        let c = cancelled.clone();
        let n = cancel_notify.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    if !c.load(Ordering::Acquire) {
                        callback();
                    }
                }
                _ = n.notified() => {}
            }
        });

        TimerHandle {
            cancelled,
            cancel_notify,
        }
    }

    /// Run `callback` repeatedly, every `interval`, until cancelled.
    pub fn call_periodic<F>(&self, interval: Duration, mut callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());

        let c = cancelled.clone();
        let n = cancel_notify.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if c.load(Ordering::Acquire) {
                            break;
                        }
                        callback();
                    }
                    _ = n.notified() => break,
                }
            }
        });

        TimerHandle {
            cancelled,
            cancel_notify,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn call_later_fires_once_after_delay() {
        let scheduler = Scheduler::new("test");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let _handle = scheduler.call_later(Duration::from_millis(50), move || {
            f.store(true, Ordering::SeqCst);
        });

        time::advance(Duration::from_millis(10)).await;
        assert!(!fired.load(Ordering::SeqCst));

        time::advance(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire_and_is_idempotent() {
        let scheduler = Scheduler::new("test");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = scheduler.call_later(Duration::from_millis(50), move || {
            f.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        handle.cancel(); // idempotent

        time::advance(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn call_periodic_fires_repeatedly_until_cancelled() {
        let scheduler = Scheduler::new("test");
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let handle = scheduler.call_periodic(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        time::advance(Duration::from_millis(35)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        handle.cancel();
        let seen = count.load(Ordering::SeqCst);
        time::advance(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
