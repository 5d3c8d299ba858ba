//! Observer base: a passive stream consumer with a future-like result surface.
//!
//! REDESIGN FLAGS (spec.md 9) calls out "callable objects acting as
//! futures" as a pattern to retire: here the future surface
//! (`start`/`await_done`/`cancel`/`result`) is primary, and the
//! `Command::call` convenience (spec.md 4.2, "callable shape") is defined
//! purely in terms of it.

pub mod command;
pub mod core;
pub mod event;

pub use core::{DoneSubscriberId, ObserverCore, ObserverState};

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::Result;

/// The object-safe part of the observer lifecycle, used by
/// [`Runner`](crate::runner::Runner) and [`Device`](crate::device::Device)
/// without needing to know an observer's result type.
#[async_trait]
pub trait ObserverHandle: Send + Sync {
    /// Stable id, unique within the process, used in log lines.
    fn id(&self) -> u64;

    /// Subscribe this observer's intake to its connection and record
    /// `start_time = now`. Fails with `AlreadyStarted` if not `Created`.
    async fn start(&self, timeout: Duration) -> Result<()>;

    /// Block the calling task until terminal or `timeout` elapses,
    /// whichever the effective deadline (`start_time + start_timeout`, if
    /// smaller) allows first. Returns `Ok(())` on a successful terminal
    /// state, or the stored failure.
    async fn await_done(&self, timeout: Duration) -> Result<()>;

    /// Transition to `Cancelled`. Idempotent.
    fn cancel(&self);

    fn done(&self) -> bool;
    fn running(&self) -> bool;
    fn cancelled(&self) -> bool;

    /// Register a callback invoked once the observer reaches a terminal
    /// state. If already terminal, `callback` runs immediately, on the
    /// caller's task.
    fn add_done_subscriber(&self, callback: Box<dyn Fn() + Send + Sync>) -> DoneSubscriberId;

    fn remove_done_subscriber(&self, id: DoneSubscriberId);
}
