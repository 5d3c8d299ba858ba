//! An in-crate `RawConnection` test double, used by this crate's own unit
//! tests and by integration tests under `tests/`.
//!
//! Grounded in the way `jonwiggins-cedis`'s `tests/integration_test.rs`
//! drives a real in-process server rather than mocking at the socket
//! layer: `FakeConnection` plugs into the exact same `RawConnection` seam
//! `TcpRawConnection` does, so everything above it (fan-out, observers,
//! runners, devices) runs unmodified against canned bytes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::RawConnection;
use crate::error::Result;

/// The `RawConnection` half given to a [`FanoutConnection`](crate::fanout::FanoutConnection).
pub struct FakeConnection {
    name: String,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

/// The test-side half: feeds inbound bytes and inspects what was sent.
pub struct FakeConnectionHandle {
    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl FakeConnection {
    /// Build a connected pair: the `RawConnection` half to wrap in a
    /// `FanoutConnection`, and the handle used to drive it from a test.
    pub fn new(name: impl Into<String>) -> (FakeConnection, FakeConnectionHandle) {
        let (tx, rx) = mpsc::channel(256);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let conn = FakeConnection {
            name: name.into(),
            inbound_rx: Mutex::new(Some(rx)),
            sent: sent.clone(),
            closed: closed.clone(),
        };
        let handle = FakeConnectionHandle {
            inbound_tx: Mutex::new(Some(tx)),
            sent,
            closed,
        };
        (conn, handle)
    }
}

impl FakeConnectionHandle {
    /// Inject `bytes` as though they just arrived from the transport.
    /// A no-op once [`drop_transport`](FakeConnectionHandle::drop_transport) has been called.
    pub async fn feed(&self, bytes: impl Into<Bytes>) {
        let tx = self.inbound_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(bytes.into()).await;
        }
    }

    /// Every chunk handed to `send` so far, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    /// Simulate the transport dropping out from under the connection: the
    /// last sender is dropped, so the fan-out's reader task sees its
    /// inbound channel close exactly as it would on a real socket error.
    pub fn drop_transport(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RawConnection for FakeConnection {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    fn subscribe(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::FanoutConnection;

    #[tokio::test]
    async fn fed_bytes_reach_a_subscriber() {
        use crate::fanout::{Chunk, Intake};
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(Arc<AtomicUsize>);
        impl Intake for Counter {
            fn feed(&self, _chunk: &Chunk) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
            fn connection_lost(&self) {}
            fn is_terminal(&self) -> bool {
                false
            }
        }

        let (fake, handle) = FakeConnection::new("test");
        let fanout = FanoutConnection::new(Box::new(fake), "test");
        let count = Arc::new(AtomicUsize::new(0));
        let _sub = fanout.subscribe(Arc::new(Counter(count.clone())));

        handle.feed(Bytes::from_static(b"hello")).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_is_recorded() {
        let (fake, handle) = FakeConnection::new("test");
        let fanout = FanoutConnection::new(Box::new(fake), "test");
        fanout.send(Bytes::from_static(b"ping\n")).await.unwrap();
        assert_eq!(handle.sent(), vec![Bytes::from_static(b"ping\n")]);
    }
}
