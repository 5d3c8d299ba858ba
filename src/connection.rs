//! Abstract byte-oriented transport.
//!
//! The core never talks to a pty, an ssh library, a telnet stack or a
//! serial port directly — those are out of scope and live behind this
//! trait. `TcpRawConnection` is the one concrete adapter shipped here, kept
//! around mostly to exercise [`FanoutConnection`](crate::fanout::FanoutConnection)
//! in tests without pulling in a real device transport; it is built the
//! same way the teacher wraps a `TcpStream` in a `BufWriter`, just adapted
//! from frame-oriented reads to raw byte chunks.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// A live byte stream an observer-driving device can be bound to.
///
/// Implementations own the read side internally and hand inbound bytes out
/// through the channel returned from [`subscribe`](RawConnection::subscribe).
/// There is exactly one such channel per connection; fanning that single
/// stream out to many observers is [`FanoutConnection`](crate::fanout::FanoutConnection)'s job,
/// not this trait's.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Write `data` to the transport. Blocks only on the transport's write buffer.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Take the raw inbound byte stream. May only be called once; the
    /// second call should return `None` so a fan-out can enforce "exactly
    /// one reader per connection".
    fn subscribe(&mut self) -> Option<mpsc::Receiver<Bytes>>;

    /// Close the transport. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Human-readable identifier, used in log lines.
    fn name(&self) -> &str;
}

/// A `RawConnection` backed by a plain `TcpStream`.
///
/// Reads happen on a dedicated background task so that `subscribe`'s
/// receiver can be handed to a [`FanoutConnection`](crate::fanout::FanoutConnection)
/// without that fan-out needing to know anything about sockets.
pub struct TcpRawConnection {
    name: String,
    write_half: tokio::sync::Mutex<BufWriter<tokio::net::tcp::OwnedWriteHalf>>,
    inbound_rx: Option<mpsc::Receiver<Bytes>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl TcpRawConnection {
    /// Connect to `addr` and start relaying inbound bytes onto an internal channel.
    pub async fn connect(name: impl Into<String>, addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Internal(format!("connect {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(256);
        let reader_task = tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = [0u8; 4 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(TcpRawConnection {
            name: name.into(),
            write_half: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            inbound_rx: Some(rx),
            reader_task,
        })
    }
}

#[async_trait]
impl RawConnection for TcpRawConnection {
    async fn send(&self, data: Bytes) -> Result<()> {
        let mut w = self.write_half.lock().await;
        w.write_all(&data)
            .await
            .map_err(|e| Error::Internal(format!("send: {e}")))?;
        w.flush()
            .await
            .map_err(|e| Error::Internal(format!("flush: {e}")))
    }

    fn subscribe(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.take()
    }

    async fn close(&self) -> Result<()> {
        self.reader_task.abort();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
