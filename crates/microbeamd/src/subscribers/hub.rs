//! Subscriber bookkeeping: broadcast writes and the primary's ack channel.
//!
//! Every connection is split once on accept. The write half joins the
//! broadcast list, the read half joins the reader list whose head is the
//! primary subscriber, the only connection ever read from.
//!
//! New connections are parked in `pending` queues behind a plain mutex so
//! the accept loop never waits on a broadcast or an ack read in progress;
//! both lists pick up pending entries the next time they are used.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failed or slow writer is dropped from the list, never retried
//! - A primary that reaches EOF is removed and the next oldest connection
//!   takes its place

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use microbeam_protocol::{is_ack, SubscriberMessage};

/// Write timeout per subscriber and message
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct WriterEntry {
    id: u64,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
}

struct ReaderEntry {
    id: u64,
    peer: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    /// Bytes of a line not yet terminated; survives a cancelled read
    partial: Vec<u8>,
}

#[derive(Default)]
struct Pending {
    writers: Vec<WriterEntry>,
    readers: Vec<ReaderEntry>,
}

#[derive(Default)]
struct HubInner {
    writers: Mutex<Vec<WriterEntry>>,
    readers: Mutex<VecDeque<ReaderEntry>>,
    pending: StdMutex<Pending>,
    next_id: AtomicU64,
}

/// Shared handle to all subscriber connections.
#[derive(Clone, Default)]
pub struct SubscriberHub {
    inner: Arc<HubInner>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an accepted connection. The first one becomes primary.
    pub fn register(&self, stream: TcpStream, peer: SocketAddr) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to disable Nagle on subscriber");
        }
        let (read_half, write_half) = stream.into_split();

        let mut pending = self.pending();
        pending.writers.push(WriterEntry {
            id,
            peer,
            writer: write_half,
        });
        pending.readers.push(ReaderEntry {
            id,
            peer,
            reader: BufReader::new(read_half),
            partial: Vec::new(),
        });
        drop(pending);

        info!(subscriber = id, %peer, "Subscriber connected");
        id
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes one line to every subscriber.
    ///
    /// Writers that fail or time out are removed; the others still get the
    /// message. Returns the number of subscribers that received it.
    pub async fn broadcast(&self, message: &SubscriberMessage) -> usize {
        let line = message.to_line();
        let mut writers = self.inner.writers.lock().await;
        writers.append(&mut self.pending().writers);

        let mut failed = Vec::new();
        for entry in writers.iter_mut() {
            let send = async {
                entry.writer.write_all(line.as_bytes()).await?;
                entry.writer.flush().await
            };
            match timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(
                        subscriber = entry.id,
                        peer = %entry.peer,
                        error = %e,
                        "Failed to send to subscriber"
                    );
                    failed.push(entry.id);
                }
                Err(_) => {
                    warn!(
                        subscriber = entry.id,
                        peer = %entry.peer,
                        "Subscriber write timed out"
                    );
                    failed.push(entry.id);
                }
            }
        }

        if !failed.is_empty() {
            writers.retain(|entry| !failed.contains(&entry.id));
            debug!(removed = failed.len(), "Removed failed subscribers");
        }

        debug!(message = %message, subscribers = writers.len(), "Broadcast");
        writers.len()
    }

    /// Reads one line from the primary subscriber.
    ///
    /// `Some(true)` for `ack`, `Some(false)` for anything else, `None` when
    /// there is no primary or it just went away.
    pub async fn read_ack(&self) -> Option<bool> {
        let mut readers = self.inner.readers.lock().await;
        readers.extend(self.pending().readers.drain(..));

        let primary = readers.front_mut()?;
        let result = primary
            .reader
            .read_until(b'\n', &mut primary.partial)
            .await;

        match result {
            Ok(0) => {
                info!(
                    subscriber = primary.id,
                    peer = %primary.peer,
                    "Primary subscriber disconnected"
                );
                readers.pop_front();
                None
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&primary.partial).into_owned();
                primary.partial.clear();
                let acked = is_ack(&line);
                if !acked {
                    debug!(line = line.trim(), "Primary subscriber sent a non-ack line");
                }
                Some(acked)
            }
            Err(e) => {
                warn!(
                    subscriber = primary.id,
                    error = %e,
                    "Failed to read from primary subscriber"
                );
                readers.pop_front();
                None
            }
        }
    }

    /// Whether a primary subscriber is connected.
    pub fn has_primary(&self) -> bool {
        if !self.pending().readers.is_empty() {
            return true;
        }
        match self.inner.readers.try_lock() {
            Ok(readers) => !readers.is_empty(),
            // an ack read holds the lock, so there is a primary
            Err(_) => true,
        }
    }

    /// Number of connections currently on the broadcast list.
    pub async fn subscriber_count(&self) -> usize {
        let writers = self.inner.writers.lock().await.len();
        writers + self.pending().writers.len()
    }

    /// Drops every connection.
    pub async fn clear(&self) {
        {
            let mut pending = self.pending();
            pending.writers.clear();
            pending.readers.clear();
        }
        self.inner.writers.lock().await.clear();
        self.inner.readers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microbeam_core::{DacPoint, RunId};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair(hub: &SubscriberHub, listener: &TcpListener) -> TcpStream {
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        hub.register(server, peer);
        client
    }

    async fn read_line(client: &mut TcpStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                return String::from_utf8(out).unwrap();
            }
            out.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub = SubscriberHub::new();
        let mut a = pair(&hub, &listener).await;
        let mut b = pair(&hub, &listener).await;

        let sent = hub
            .broadcast(&SubscriberMessage::StartRun { id: RunId::new(2) })
            .await;
        assert_eq!(sent, 2);
        hub.broadcast(&SubscriberMessage::Pos(DacPoint::new(-5, 7)))
            .await;

        assert_eq!(read_line(&mut a).await, "start_run 2");
        assert_eq!(read_line(&mut a).await, "pos -5 7");
        assert_eq!(read_line(&mut b).await, "start_run 2");
        assert_eq!(read_line(&mut b).await, "pos -5 7");
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_pruned() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub = SubscriberHub::new();
        let dead = pair(&hub, &listener).await;
        let mut alive = pair(&hub, &listener).await;
        drop(dead);

        // the first writes after a reset may still succeed locally
        for _ in 0..20 {
            hub.broadcast(&SubscriberMessage::StopRun).await;
            if hub.subscriber_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_count().await, 1);
        assert_eq!(read_line(&mut alive).await, "stop_run");
    }

    #[tokio::test]
    async fn test_only_primary_is_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub = SubscriberHub::new();
        assert!(!hub.has_primary());
        assert_eq!(hub.read_ack().await, None);

        let mut primary = pair(&hub, &listener).await;
        let mut other = pair(&hub, &listener).await;
        assert!(hub.has_primary());

        other.write_all(b"ack\n").await.unwrap();
        primary.write_all(b"nope\nack \r\n").await.unwrap();
        assert_eq!(hub.read_ack().await, Some(false));
        assert_eq!(hub.read_ack().await, Some(true));

        // primary leaves, the next connection takes over
        drop(primary);
        assert_eq!(hub.read_ack().await, None);
        assert_eq!(hub.read_ack().await, Some(true));
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_partial_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub = SubscriberHub::new();
        let mut primary = pair(&hub, &listener).await;

        primary.write_all(b"ac").await.unwrap();
        let first = timeout(Duration::from_millis(50), hub.read_ack()).await;
        assert!(first.is_err());

        primary.write_all(b"k\n").await.unwrap();
        let second = timeout(Duration::from_secs(5), hub.read_ack()).await.unwrap();
        assert_eq!(second, Some(true));
    }
}
