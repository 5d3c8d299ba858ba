//! Commands: observers that also write an input string to elicit output.
//!
//! The parser catalog itself (ping, ls, ssh, ...) is explicitly out of
//! scope (spec.md 1); this module only defines [`CommandParser`], the
//! contract a concrete parser conforms to, and the `Command` future/state
//! machine that drives it.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tokio::time::Duration;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::fanout::{Chunk, FanoutConnection, Intake};
use crate::observer::{DoneSubscriberId, ObserverCore, ObserverHandle};
use crate::scheduler::Scheduler;

/// Outcome of feeding one chunk to a command's output parser.
///
/// This is the explicit result/failure return REDESIGN FLAGS (spec.md 9)
/// asks for in place of "exceptions as control flow from parsers": a
/// parser never throws, it reports `Pending`/`Complete`/`Failed` and the
/// observer surface converts that into future semantics.
pub enum ParseOutcome<T> {
    Pending,
    Complete(T),
    Failed(Error),
}

/// Parses one command's output incrementally as chunks arrive.
pub trait CommandParser: Send + 'static {
    type Output: Send + Clone + 'static;

    /// The literal command string written to the connection on `start`
    /// (without the trailing newline).
    fn command_string(&self) -> String;

    /// Feed one chunk. `expected_prompt` is the regex compiled once at
    /// `Command` construction (spec.md 4.2); most parsers check for it
    /// themselves as part of detecting end-of-output.
    fn feed(&mut self, chunk: &Chunk, expected_prompt: &Regex) -> ParseOutcome<Self::Output>;
}

/// An observer that writes `command_string` to its connection and parses
/// the resulting output into `P::Output`.
pub struct Command<P: CommandParser> {
    core: ObserverCore<P::Output>,
    command_string: String,
    expected_prompt: Regex,
    parser: Mutex<P>,
    scheduler: Scheduler,
    weak_self: Weak<Command<P>>,
}

impl<P: CommandParser> Command<P> {
    /// `expected_prompt` is compiled once, here, per spec.md 4.2.
    pub fn new(
        parser: P,
        connection: Arc<FanoutConnection>,
        scheduler: Scheduler,
        expected_prompt: Regex,
    ) -> Arc<Self> {
        let command_string = parser.command_string();
        Arc::new_cyclic(|weak| Command {
            core: ObserverCore::new(connection),
            command_string,
            expected_prompt,
            parser: Mutex::new(parser),
            scheduler,
            weak_self: weak.clone(),
        })
    }

    pub fn result(&self) -> Result<P::Output> {
        self.core.result()
    }

    pub fn exception(&self) -> Option<Error> {
        self.core.exception()
    }

    /// Synchronous call: `start(timeout); await_done(timeout)` sharing one
    /// deadline (spec.md 4.2, "callable shape").
    pub async fn call(&self, timeout: Duration) -> Result<P::Output> {
        ObserverHandle::start(self, timeout).await?;
        ObserverHandle::await_done(self, timeout).await?;
        self.result()
    }

    fn self_as_intake(&self) -> Result<Arc<dyn Intake>> {
        self.weak_self
            .upgrade()
            .map(|arc| arc as Arc<dyn Intake>)
            .ok_or_else(|| Error::Internal("command dropped before start".into()))
    }
}

impl<P: CommandParser> Intake for Command<P> {
    fn feed(&self, chunk: &Chunk) {
        if self.core.done() {
            return;
        }
        // A parser is third-party catalog code; a panic in it must not
        // unwind into the fan-out's shared distributor task and take every
        // other subscriber on this connection down with it (spec.md 4.1).
        let outcome = {
            let parser = &self.parser;
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut parser = parser.lock().unwrap();
                parser.feed(chunk, &self.expected_prompt)
            }))
        };
        match outcome {
            Ok(ParseOutcome::Pending) => {}
            Ok(ParseOutcome::Complete(value)) => self.core.set_result(value),
            Ok(ParseOutcome::Failed(err)) => self.core.set_exception(err),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(command = self.core.id(), panic = %msg, "parser panicked; swallowing");
                self.core.set_exception(Error::Internal(format!("parser panicked: {msg}")));
            }
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
impl<P: CommandParser> ObserverHandle for Command<P> {
    fn id(&self) -> u64 {
        self.core.id()
    }

    #[instrument(skip(self), fields(command_id = self.core.id()))]
    async fn start(&self, timeout: Duration) -> Result<()> {
        let intake = self.self_as_intake()?;
        self.core.begin(timeout, intake)?;

        let mut line = self.command_string.clone();
        line.push('\n');
        if let Err(err) = self.core.connection().send(Bytes::from(line)).await {
            self.core.set_exception(err.clone());
            return Err(err);
        }

        let weak = self.weak_self.clone();
        let handle = self.scheduler.call_later(timeout, move || {
            if let Some(cmd) = weak.upgrade() {
                cmd.core.force_timeout();
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
