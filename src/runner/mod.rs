//! Drives observers from subscription to completion under a timeout.
//!
//! Two interchangeable strategies implement the same [`Runner`] contract:
//! [`PerObserverTaskRunner`] spawns one task per submitted observer, and
//! [`SingleTaskRunner`] services every observer's completion bookkeeping
//! from a single background task, bounding task count under heavy fan-out.
//! Both graceful-shutdown the same way the server's `Listener` does: a
//! `broadcast` tells outstanding work to stop, and a dropped-sender `mpsc`
//! tells the caller when every worker has actually finished, joined with a
//! bounded timeout rather than awaited forever.

mod per_observer;
mod single_task;

pub use per_observer::PerObserverTaskRunner;
pub use single_task::SingleTaskRunner;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::Result;
use crate::observer::ObserverHandle;

/// The service that submits observers and drives them to completion.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Start `observer` under `timeout` and drive it to completion in the
    /// background. Non-blocking: returns once submission has happened, not
    /// once the observer is done. Fails with `AlreadySubmitted` if
    /// `observer` is not `Created`.
    async fn submit(&self, observer: Arc<dyn ObserverHandle>, timeout: Duration) -> Result<()>;

    /// Block until `observer` is terminal or `timeout` elapses.
    async fn wait_for(&self, observer: &Arc<dyn ObserverHandle>, timeout: Duration) -> Result<()> {
        observer.await_done(timeout).await
    }

    /// Cancel every outstanding observer, drain workers, and stop accepting
    /// submissions. Idempotent.
    async fn shutdown(&self);
}
