//! State machine shared by every [`Command`](super::command::Command) and
//! [`Event`](super::event::Event).
//!
//! Completion is signalled with a `tokio::sync::Notify`, not a `oneshot`:
//! `add_done_subscriber` must support registering after construction and
//! `done()`/`running()`/`cancelled()` must be queryable synchronously,
//! neither of which a one-shot channel (consumable exactly once) supports.
//! State, the result slot and the done-subscriber list all live behind one
//! `std::sync::Mutex` so a subscriber registered concurrently with
//! completion is invoked exactly once, never zero or two times (spec.md 8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::error::Error;
use crate::fanout::{FanoutConnection, Intake};
use crate::scheduler::TimerHandle;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_observer_id() -> u64 {
    NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// An observer's lifecycle state. Never transitions back once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Created,
    Running,
    Done,
    Cancelled,
}

/// Handle returned from [`ObserverCore::add_done_subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoneSubscriberId(u64);

type DoneCallback = Arc<dyn Fn() + Send + Sync>;

struct Locked<T> {
    state: ObserverState,
    value: Option<Result<T, Error>>,
    start_time: Option<Instant>,
    start_timeout: Option<Duration>,
    done_subscribers: Vec<(DoneSubscriberId, DoneCallback)>,
    next_sub_id: u64,
}

pub struct ObserverCore<T> {
    id: u64,
    connection: Arc<FanoutConnection>,
    locked: Mutex<Locked<T>>,
    done_notify: Notify,
    subscription: Mutex<Option<crate::fanout::SubscriptionHandle>>,
    timer: Mutex<Option<TimerHandle>>,
}

impl<T> ObserverCore<T> {
    pub fn new(connection: Arc<FanoutConnection>) -> Self {
        ObserverCore {
            id: next_observer_id(),
            connection,
            locked: Mutex::new(Locked {
                state: ObserverState::Created,
                value: None,
                start_time: None,
                start_timeout: None,
                done_subscribers: Vec::new(),
                next_sub_id: 0,
            }),
            done_notify: Notify::new(),
            subscription: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<FanoutConnection> {
        &self.connection
    }

    pub fn state(&self) -> ObserverState {
        self.locked.lock().unwrap().state
    }

    pub fn done(&self) -> bool {
        matches!(self.state(), ObserverState::Done | ObserverState::Cancelled)
    }

    pub fn running(&self) -> bool {
        self.state() == ObserverState::Running
    }

    pub fn cancelled(&self) -> bool {
        self.state() == ObserverState::Cancelled
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.locked.lock().unwrap().start_time
    }

    /// Subscribe `intake` to this observer's connection and move to
    /// `Running`. Returns `AlreadyStarted` if not currently `Created`.
    pub fn begin(&self, timeout: Duration, intake: Arc<dyn Intake>) -> Result<(), Error> {
        {
            let mut locked = self.locked.lock().unwrap();
            if locked.state != ObserverState::Created {
                return Err(Error::AlreadyStarted);
            }
            locked.state = ObserverState::Running;
            locked.start_time = Some(Instant::now());
            locked.start_timeout = Some(timeout);
        }

        // Subscribed before any command string is written by the caller
        // (spec.md 4.2.1): this method only subscribes, it never sends.
        let handle = self.connection.subscribe(intake);
        *self.subscription.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Store the timer handle registered for this observer's timeout, so
    /// it can be cancelled on early completion.
    pub fn set_timer(&self, handle: TimerHandle) {
        *self.timer.lock().unwrap() = Some(handle);
    }

    /// Called by this observer's own scheduled timeout callback. If still
    /// running, forces a `Timeout` failure; otherwise a no-op (the
    /// observer already finished before the timer fired).
    pub fn force_timeout(&self) {
        let (timeout, elapsed) = {
            let locked = self.locked.lock().unwrap();
            let timeout = locked.start_timeout.unwrap_or_default();
            let elapsed = locked
                .start_time
                .map(|st| st.elapsed())
                .unwrap_or_default();
            (timeout, elapsed)
        };
        self.complete(Err(Error::Timeout { timeout, elapsed }));
    }

    pub fn set_result(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn set_exception(&self, err: Error) {
        self.complete(Err(err));
    }

    /// Fail with `ConnectionLost` if currently running; no-op otherwise.
    pub fn connection_lost(&self) {
        self.complete(Err(Error::ConnectionLost));
    }

    pub fn cancel(&self) {
        let subscribers = {
            let mut locked = self.locked.lock().unwrap();
            if matches!(locked.state, ObserverState::Done | ObserverState::Cancelled) {
                return;
            }
            locked.state = ObserverState::Cancelled;
            std::mem::take(&mut locked.done_subscribers)
        };
        self.finish_terminal(subscribers);
    }

    fn complete(&self, outcome: Result<T, Error>) {
        let subscribers = {
            let mut locked = self.locked.lock().unwrap();
            if locked.state != ObserverState::Running {
                return;
            }
            locked.state = ObserverState::Done;
            locked.value = Some(outcome);
            std::mem::take(&mut locked.done_subscribers)
        };
        self.finish_terminal(subscribers);
    }

    fn finish_terminal(&self, subscribers: Vec<(DoneSubscriberId, DoneCallback)>) {
        if let Some(handle) = self.subscription.lock().unwrap().take() {
            handle.unsubscribe();
        }
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
        trace!(observer = self.id, "observer reached terminal state");
        self.done_notify.notify_waiters();
        for (_, callback) in subscribers {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback())) {
                let _ = panic;
                tracing::error!(observer = self.id, "done subscriber panicked; swallowing");
            }
        }
    }

    /// Register `callback` to run once this observer becomes terminal. If
    /// already terminal, runs immediately, on the caller's context.
    pub fn add_done_subscriber<F>(&self, callback: F) -> DoneSubscriberId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut locked = self.locked.lock().unwrap();
        if matches!(locked.state, ObserverState::Done | ObserverState::Cancelled) {
            drop(locked);
            callback();
            return DoneSubscriberId(0);
        }
        let id = DoneSubscriberId(locked.next_sub_id);
        locked.next_sub_id += 1;
        locked.done_subscribers.push((id, Arc::new(callback)));
        id
    }

    pub fn remove_done_subscriber(&self, id: DoneSubscriberId) {
        self.locked
            .lock()
            .unwrap()
            .done_subscribers
            .retain(|(sid, _)| *sid != id);
    }

    /// Block until terminal or the effective deadline elapses. Per spec,
    /// when the observer was started with a timeout, the effective deadline
    /// is always `start_time + start_timeout`, regardless of what `timeout`
    /// this particular call passes — `timeout` only bounds the wait when
    /// the observer has no start-time/start-timeout of its own yet (e.g.
    /// awaited before it was started). On a local timeout that races ahead
    /// of the observer's own scheduled timer, forces the observer terminal
    /// here too (spec.md 8: "terminal at the next observable point").
    pub async fn await_done(&self, timeout: Duration) -> Result<(), Error> {
        let wait = async {
            let notified = self.done_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.done() {
                return;
            }
            notified.await;
        };

        let bound = {
            let locked = self.locked.lock().unwrap();
            match (locked.start_time, locked.start_timeout) {
                (Some(start_time), Some(start_timeout)) => {
                    (start_time + start_timeout).saturating_duration_since(Instant::now())
                }
                _ => timeout,
            }
        };

        if tokio::time::timeout(bound, wait).await.is_err() && self.running() {
            self.force_timeout();
        }

        let locked = self.locked.lock().unwrap();
        match &locked.value {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(Error::Internal("observer has no result after await_done".into())),
        }
    }
}

impl<T: Clone> ObserverCore<T> {
    pub fn result(&self) -> Result<T, Error> {
        let locked = self.locked.lock().unwrap();
        match &locked.value {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(e)) => Err(e.clone()),
            None => Err(Error::NotDone),
        }
    }

    pub fn exception(&self) -> Option<Error> {
        match &self.locked.lock().unwrap().value {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }
}
