//! One worker task per submitted observer.
//!
//! Good for small observer counts, or observers whose parser does
//! expensive work feeding back into `await_done` accounting; independence
//! between observers is complete, at the cost of one task each.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration};
use tracing::{error, instrument, trace, warn};

use crate::error::{Error, Result};
use crate::observer::ObserverHandle;
use crate::runner::Runner;

pub struct PerObserverTaskRunner {
    name: Arc<str>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: Mutex<Option<mpsc::Receiver<()>>>,
    observers: Mutex<Vec<Weak<dyn ObserverHandle>>>,
    join_timeout: Duration,
}

impl PerObserverTaskRunner {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_join_timeout(name, Duration::from_secs(5))
    }

    pub fn with_join_timeout(name: impl Into<Arc<str>>, join_timeout: Duration) -> Self {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        PerObserverTaskRunner {
            name: name.into(),
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: Mutex::new(Some(shutdown_complete_rx)),
            observers: Mutex::new(Vec::new()),
            join_timeout,
        }
    }
}

#[async_trait]
impl Runner for PerObserverTaskRunner {
    #[instrument(skip(self, observer), fields(runner = %self.name, observer = observer.id()))]
    async fn submit(&self, observer: Arc<dyn ObserverHandle>, timeout: Duration) -> Result<()> {
        if observer.running() || observer.done() {
            return Err(Error::AlreadySubmitted);
        }

        let complete_tx = self
            .shutdown_complete_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal("runner is shut down".into()))?;
        self.observers.lock().unwrap().push(Arc::downgrade(&observer));

        let mut shutdown = self.notify_shutdown.subscribe();
        let name = self.name.clone();
        let worker_observer = observer.clone();

        tokio::spawn(async move {
            // Held until this task ends; its drop is how `shutdown` learns
            // every worker has actually stopped.
            let _complete_tx = complete_tx;

            tokio::select! {
                res = worker_observer.start(timeout) => {
                    if let Err(err) = res {
                        error!(runner = %name, observer = worker_observer.id(), %err, "observer failed to start");
                        return;
                    }
                }
                _ = shutdown.recv() => {
                    worker_observer.cancel();
                    return;
                }
            }

            tokio::select! {
                res = worker_observer.await_done(timeout) => {
                    if let Err(err) = res {
                        trace!(runner = %name, observer = worker_observer.id(), %err, "observer finished with a failure");
                    }
                }
                _ = shutdown.recv() => {
                    worker_observer.cancel();
                }
            }
        });

        Ok(())
    }

    async fn shutdown(&self) {
        let observers: Vec<Weak<dyn ObserverHandle>> =
            std::mem::take(&mut *self.observers.lock().unwrap());
        for weak in &observers {
            if let Some(observer) = weak.upgrade() {
                observer.cancel();
            }
        }

        let _ = self.notify_shutdown.send(());
        // Dropping our own sender lets `rx.recv()` below complete once every
        // spawned worker's clone has also dropped.
        self.shutdown_complete_tx.lock().unwrap().take();

        if let Some(mut rx) = self.shutdown_complete_rx.lock().unwrap().take() {
            if time::timeout(self.join_timeout, rx.recv()).await.is_err() {
                warn!(runner = %self.name, "workers did not drain within bound; leaking stragglers");
            }
        }
    }
}
