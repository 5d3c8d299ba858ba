//! Multicasts one connection's inbound bytes to many observers.
//!
//! Structurally this is the teacher's `Listener`/`Handler` split turned
//! inside out: instead of one task reading frames for one handler, a
//! reader task only timestamps and decodes bytes, hands them to a
//! distributor task over an `mpsc` channel, and the distributor is the
//! only place that ever touches the subscriber list. A slow subscriber
//! backs up the distributor's queue, never the reader, so the transport is
//! never back-pressured by a misbehaving parser (spec.md 4.4).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::connection::RawConnection;
use crate::error::Result;

/// One inbound chunk: raw bytes, lossily-decoded text, and a monotonic
/// timestamp assigned as early as possible after the bytes arrived.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub bytes: Bytes,
    pub text: Arc<str>,
    pub at: Instant,
}

/// Anything that can receive chunks and be told the connection is gone.
///
/// [`ObserverCore`](crate::observer::ObserverCore) implements this; the
/// fan-out only depends on this narrow trait so it never needs to know
/// about commands, events, or futures.
pub trait Intake: Send + Sync {
    /// Called by the distributor task for every chunk. Must not block and
    /// must not perform I/O; heavy parsing is fine (spec.md 4.1).
    fn feed(&self, chunk: &Chunk);

    /// Called once, when the connection transitions to closed.
    fn connection_lost(&self);

    /// Distinguishes log lines and lets the distributor skip terminated observers.
    fn is_terminal(&self) -> bool;
}

#[derive(Clone)]
struct Subscription {
    id: u64,
    intake: Arc<dyn Intake>,
}

struct Shared {
    // Short, non-`.await`-holding critical section: a `Vec` push / retain /
    // clone. `std::sync::Mutex` is the right tool, the same call the
    // teacher makes for `Db`'s `Shared` state (spec.md 5).
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Wraps a [`RawConnection`], timestamping inbound chunks and multicasting
/// them to zero-or-more subscribers through a processing queue isolated
/// from the reader.
pub struct FanoutConnection {
    raw: Arc<dyn RawConnection>,
    shared: Arc<Shared>,
    distributor: tokio::task::JoinHandle<()>,
}

/// Handle returned from [`FanoutConnection::subscribe`]; drop or call
/// [`unsubscribe`](SubscriptionHandle::unsubscribe) to stop receiving chunks.
pub struct SubscriptionHandle {
    id: u64,
    shared: Arc<Shared>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        self.shared.subscriptions.lock().unwrap().retain(|s| s.id != self.id);
    }
}

impl FanoutConnection {
    /// Wrap `raw`, taking ownership of its inbound byte stream and starting
    /// the reader + distributor tasks.
    pub fn new(mut raw: Box<dyn RawConnection>, name: impl Into<String>) -> Self {
        let name = name.into();
        let inbound = raw
            .subscribe()
            .expect("FanoutConnection must be the sole subscriber of the raw connection");
        let raw: Arc<dyn RawConnection> = Arc::from(raw);

        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::channel::<Bytes>(1024);

        // Reader: only decodes + timestamps, then hands off. Never touches
        // the subscriber list, so it can never be slowed down by a parser.
        tokio::spawn(reader_loop(inbound, tx));

        // Distributor: the only task that ever locks `subscriptions`.
        let distributor = tokio::spawn(distributor_loop(rx, shared.clone(), name));

        FanoutConnection {
            raw,
            shared,
            distributor,
        }
    }

    /// Register `intake` to receive every subsequent chunk, in arrival order.
    ///
    /// A removal observed right after a chunk was queued for the
    /// distributor still sees that chunk (spec.md 4.4): the distributor
    /// snapshots subscribers once per chunk, so `unsubscribe` only takes
    /// effect starting with the *next* chunk.
    pub fn subscribe(&self, intake: Arc<dyn Intake>) -> SubscriptionHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .push(Subscription { id, intake });
        SubscriptionHandle {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Write bytes to the underlying transport.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        tracing::event!(
            target: "moler_core::raw",
            tracing::Level::DEBUG,
            connection = %self.raw.name(),
            "> {}",
            String::from_utf8_lossy(&data),
        );
        self.raw.send(data).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the transport and notify every live subscriber of the loss.
    #[instrument(skip(self), fields(connection = %self.raw.name()))]
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.raw.close().await;
        let subs = self.shared.subscriptions.lock().unwrap().clone();
        for sub in &subs {
            sub.intake.connection_lost();
        }
        debug!("fanout connection closed, {} subscribers notified", subs.len());
        self.distributor.abort();
    }
}

async fn reader_loop(mut inbound: mpsc::Receiver<Bytes>, tx: mpsc::Sender<Bytes>) {
    while let Some(bytes) = inbound.recv().await {
        if tx.send(bytes).await.is_err() {
            break;
        }
    }
    // Sender drop signals the distributor that the transport is gone.
}

async fn distributor_loop(mut rx: mpsc::Receiver<Bytes>, shared: Arc<Shared>, name: String) {
    while let Some(bytes) = rx.recv().await {
        let text: Arc<str> = Arc::from(String::from_utf8_lossy(&bytes).into_owned());
        let chunk = Chunk {
            bytes,
            text,
            at: Instant::now(),
        };

        // Snapshot once per chunk: every subscriber alive at queuing time
        // gets fed, no fewer, no more, and dropping/adding subscribers
        // concurrently never blocks on a chunk's worth of parsing.
        let snapshot = {
            let mut subs = shared.subscriptions.lock().unwrap();
            subs.retain(|s| !s.intake.is_terminal());
            subs.clone()
        };
        tracing::event!(
            target: "moler_core::raw",
            tracing::Level::DEBUG,
            connection = %name,
            "< {}",
            chunk.text,
        );
        trace!(connection = %name, subscribers = snapshot.len(), "dispatching chunk");
        for sub in &snapshot {
            sub.intake.feed(&chunk);
        }
    }

    if !shared.closed.swap(true, Ordering::AcqRel) {
        let subs = shared.subscriptions.lock().unwrap().clone();
        for sub in &subs {
            sub.intake.connection_lost();
        }
        debug!(connection = %name, "transport ended, {} subscribers notified", subs.len());
    }
}
