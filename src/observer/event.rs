//! Events: observers that watch a connection for repeated pattern matches
//! without writing anything themselves.
//!
//! An `Event` never transitions to `Done` on its own the way a `Command`
//! does on its first parse; it stays `Running`, publishing a [`Match`] each
//! time `matcher` fires, until either `max_matches` is reached, it is
//! cancelled, or the connection is lost.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use regex::Regex;
use tokio::time::{Duration, Instant};
use tracing::instrument;

use crate::error::Result;
use crate::fanout::{Chunk, FanoutConnection, Intake};
use crate::observer::{DoneSubscriberId, ObserverCore, ObserverHandle};
use crate::publisher::{Publisher, SubscriberId};
use crate::scheduler::Scheduler;

/// One occurrence of an event's pattern, published as it happens.
#[derive(Debug, Clone)]
pub struct Match {
    pub text: Arc<str>,
    pub at: Instant,
    pub occurrence: usize,
}

/// Decides whether a chunk contains an occurrence of the pattern being
/// watched for. The built-in [`RegexMatcher`] covers the common case; a
/// custom matcher can look for anything derivable from a chunk's text.
pub trait EventMatcher: Send + 'static {
    /// Returns the matched text for every occurrence found in `chunk`, in
    /// order. A chunk may contain zero, one, or several occurrences.
    fn find_all(&mut self, chunk: &Chunk) -> Vec<String>;
}

/// Matches every non-overlapping occurrence of a compiled regex.
pub struct RegexMatcher {
    pattern: Regex,
}

impl RegexMatcher {
    pub fn new(pattern: Regex) -> Self {
        RegexMatcher { pattern }
    }
}

impl EventMatcher for RegexMatcher {
    fn find_all(&mut self, chunk: &Chunk) -> Vec<String> {
        self.pattern
            .find_iter(&chunk.text)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

struct Counters {
    occurrences: usize,
    max_matches: Option<usize>,
}

/// A long-lived observer that republishes every pattern occurrence seen on
/// a connection as a [`Match`], until `max_matches` (if any) is reached.
pub struct Event<M: EventMatcher> {
    core: ObserverCore<usize>,
    matcher: Mutex<M>,
    counters: Mutex<Counters>,
    matches: Publisher<Match>,
    scheduler: Scheduler,
    weak_self: Weak<Event<M>>,
}

impl<M: EventMatcher> Event<M> {
    /// `max_matches = None` watches indefinitely; the observer only
    /// completes on cancellation, connection loss, or timeout.
    pub fn new(
        matcher: M,
        connection: Arc<FanoutConnection>,
        scheduler: Scheduler,
        max_matches: Option<usize>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Event {
            core: ObserverCore::new(connection),
            matcher: Mutex::new(matcher),
            counters: Mutex::new(Counters {
                occurrences: 0,
                max_matches,
            }),
            matches: Publisher::new(),
            scheduler,
            weak_self: weak.clone(),
        })
    }

    /// Subscribe to every occurrence as it is published. Mirrors
    /// `Publisher::subscribe` directly; there is no event-specific wrapping.
    pub fn subscribe_matches<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Match) + Send + Sync + 'static,
    {
        self.matches.subscribe(callback)
    }

    pub fn unsubscribe_matches(&self, id: SubscriberId) {
        self.matches.unsubscribe(id);
    }

    /// Total occurrences observed so far, or the failure this event ended
    /// with if it is already terminal with no result.
    pub fn occurrences(&self) -> Result<usize> {
        self.core.result()
    }

    fn self_as_intake(&self) -> Result<Arc<dyn Intake>> {
        self.weak_self
            .upgrade()
            .map(|arc| arc as Arc<dyn Intake>)
            .ok_or_else(|| crate::error::Error::Internal("event dropped before start".into()))
    }
}

impl<M: EventMatcher> Intake for Event<M> {
    fn feed(&self, chunk: &Chunk) {
        if self.core.done() {
            return;
        }
        // A matcher is third-party catalog code; a panic in it must not
        // unwind into the fan-out's shared distributor task and take every
        // other subscriber on this connection down with it (spec.md 4.1).
        let occurrences = {
            let matcher = &self.matcher;
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut matcher = matcher.lock().unwrap();
                matcher.find_all(chunk)
            })) {
                Ok(occurrences) => occurrences,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(event = self.core.id(), panic = %msg, "matcher panicked; swallowing");
                    self.core.set_exception(crate::error::Error::Internal(format!(
                        "matcher panicked: {msg}"
                    )));
                    return;
                }
            }
        };
        if occurrences.is_empty() {
            return;
        }

        let reached_max = {
            let mut counters = self.counters.lock().unwrap();
            for text in &occurrences {
                counters.occurrences += 1;
                let occurrence = counters.occurrences;
                self.matches.notify_subscribers(Match {
                    text: Arc::from(text.as_str()),
                    at: chunk.at,
                    occurrence,
                });
                if counters.max_matches == Some(occurrence) {
                    break;
                }
            }
            counters.max_matches.is_some_and(|max| counters.occurrences >= max)
        };

        if reached_max {
            let total = self.counters.lock().unwrap().occurrences;
            self.core.set_result(total);
        }
    }

    fn connection_lost(&self) {
        self.core.connection_lost();
    }

    fn is_terminal(&self) -> bool {
        self.core.done()
    }
}

#[async_trait]
impl<M: EventMatcher> ObserverHandle for Event<M> {
    fn id(&self) -> u64 {
        self.core.id()
    }

    #[instrument(skip(self), fields(event_id = self.core.id()))]
    async fn start(&self, timeout: Duration) -> Result<()> {
        let intake = self.self_as_intake()?;
        self.core.begin(timeout, intake)?;

        let weak = self.weak_self.clone();
        let handle = self.scheduler.call_later(timeout, move || {
            if let Some(event) = weak.upgrade() {
                event.core.force_timeout();
            }
        });
        self.core.set_timer(handle);

        Ok(())
    }

    async fn await_done(&self, timeout: Duration) -> Result<()> {
        self.core.await_done(timeout).await
    }

    fn cancel(&self) {
        self.core.cancel();
    }

    fn done(&self) -> bool {
        self.core.done()
    }

    fn running(&self) -> bool {
        self.core.running()
    }

    fn cancelled(&self) -> bool {
        self.core.cancelled()
    }

    fn add_done_subscriber(&self, callback: Box<dyn Fn() + Send + Sync>) -> DoneSubscriberId {
        self.core.add_done_subscriber(move || callback())
    }

    fn remove_done_subscriber(&self, id: DoneSubscriberId) {
        self.core.remove_done_subscriber(id);
    }
}
