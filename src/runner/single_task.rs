//! One shared worker task services every submitted observer's completion
//! bookkeeping, bounding task count under heavy fan-out. Chosen as the
//! default runner: it scales to many concurrently-running observers
//! without one task each, at the cost of independence between them.
//!
//! Observer parsing never happens on this worker — that still runs on the
//! fan-out connection's own distributor task. This worker only reacts to
//! `done`-subscriber notices pushed onto a shared queue as observers
//! finish, so it never blocks on any one observer's timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{instrument, trace, warn};

use crate::error::{Error, Result};
use crate::observer::ObserverHandle;
use crate::runner::Runner;

pub struct SingleTaskRunner {
    name: Arc<str>,
    done_tx: Mutex<Option<mpsc::UnboundedSender<Arc<dyn ObserverHandle>>>>,
    started: Arc<Mutex<HashMap<u64, Arc<dyn ObserverHandle>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl SingleTaskRunner {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_join_timeout(name, Duration::from_secs(5))
    }

    pub fn with_join_timeout(name: impl Into<Arc<str>>, join_timeout: Duration) -> Self {
        let name = name.into();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let started = Arc::new(Mutex::new(HashMap::new()));
        let worker = tokio::spawn(worker_loop(done_rx, started.clone(), name.clone()));
        SingleTaskRunner {
            name,
            done_tx: Mutex::new(Some(done_tx)),
            started,
            worker: Mutex::new(Some(worker)),
            join_timeout,
        }
    }
}

async fn worker_loop(
    mut done_rx: mpsc::UnboundedReceiver<Arc<dyn ObserverHandle>>,
    started: Arc<Mutex<HashMap<u64, Arc<dyn ObserverHandle>>>>,
    name: Arc<str>,
) {
    while let Some(observer) = done_rx.recv().await {
        started.lock().unwrap().remove(&observer.id());
        trace!(runner = %name, observer = observer.id(), "observer reached terminal state");
    }
}

#[async_trait]
impl Runner for SingleTaskRunner {
    #[instrument(skip(self, observer), fields(runner = %self.name, observer = observer.id()))]
    async fn submit(&self, observer: Arc<dyn ObserverHandle>, timeout: Duration) -> Result<()> {
        if observer.running() || observer.done() {
            return Err(Error::AlreadySubmitted);
        }

        let done_tx = self
            .done_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal("runner is shut down".into()))?;

        self.started.lock().unwrap().insert(observer.id(), observer.clone());

        let notify_tx = done_tx;
        let notify_observer = observer.clone();
        observer.add_done_subscriber(Box::new(move || {
            let _ = notify_tx.send(notify_observer.clone());
        }));

        observer.start(timeout).await
    }

    async fn shutdown(&self) {
        let observers: Vec<Arc<dyn ObserverHandle>> =
            self.started.lock().unwrap().values().cloned().collect();
        for observer in &observers {
            observer.cancel();
        }

        // Dropping the last sender closes the queue once every in-flight
        // done-subscriber clone above has also fired and dropped its own.
        self.done_tx.lock().unwrap().take();

        if let Some(handle) = self.worker.lock().unwrap().take() {
            if time::timeout(self.join_timeout, handle).await.is_err() {
                warn!(runner = %self.name, "worker did not join within bound; leaking");
            }
        }
    }
}
