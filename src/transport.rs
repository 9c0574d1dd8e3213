//! Tagged blob transport between named parties.
//!
//! The transport moves opaque byte payloads addressed by `(party, tag)`;
//! the channel fabric above it derives the tags from its monotonic message
//! counters. Transport failures are fatal for the session: cryptographic
//! state (consumed randomness, counters) cannot be safely replayed, so
//! nothing at this layer retries.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender, channel};
use tokio::time::timeout;
use tracing::trace;

/// A transport able to move a tagged byte payload between two parties.
pub trait Transport: Send + Sync {
    /// The error that can occur moving payloads.
    type Error: fmt::Debug + Send;

    /// Delivers `payload` under `tag` to the party with the given rank.
    fn put(
        &self,
        dst: usize,
        tag: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Awaits the payload tagged `tag` from the party with the given rank.
    fn get(
        &self,
        src: usize,
        tag: &str,
    ) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;
}

/// Errors raised by the in-process [`LocalTransport`].
#[derive(Debug, Error)]
pub enum LocalTransportError {
    /// There is no route to the given party (e.g. sending to oneself).
    #[error("no route to party {0}")]
    NoRoute(usize),
    /// The peer hung up.
    #[error("the channel to the peer has been closed")]
    Closed,
    /// No message arrived before the timeout.
    #[error("timed out waiting for a message")]
    TimeoutElapsed,
    /// The next message from the peer carries an unexpected tag: the two
    /// parties have desynchronized their counters. Fatal; the session must
    /// be aborted, not retried.
    #[error("channel desynchronized: expected tag {expected}, received {actual}")]
    Desynchronized {
        /// The tag this party expected next.
        expected: String,
        /// The tag actually received.
        actual: String,
    },
}

struct TaggedMessage {
    tag: String,
    payload: Vec<u8>,
}

/// An in-process full-mesh transport over tokio channels, used for simulated
/// sessions and tests.
///
/// Delivery between a pair of parties is in order; `get` checks the received
/// tag against the expected one, so any counter mismatch between two parties
/// surfaces immediately as [`LocalTransportError::Desynchronized`].
pub struct LocalTransport {
    senders: Vec<Option<Sender<TaggedMessage>>>,
    receivers: Vec<Option<tokio::sync::Mutex<Receiver<TaggedMessage>>>>,
    recv_timeout: Duration,
}

impl LocalTransport {
    /// Creates connected transports for `parties` parties.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut transports: Vec<Self> = (0..parties)
            .map(|_| LocalTransport {
                senders: (0..parties).map(|_| None).collect(),
                receivers: (0..parties).map(|_| None).collect(),
                recv_timeout: Duration::from_secs(60),
            })
            .collect();
        for a in 0..parties {
            for b in 0..parties {
                if a == b {
                    continue;
                }
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                transports[a].senders[b] = Some(send_a_to_b);
                transports[b].receivers[a] = Some(tokio::sync::Mutex::new(recv_a_to_b));
            }
        }
        transports
    }
}

impl Transport for LocalTransport {
    type Error = LocalTransportError;

    async fn put(&self, dst: usize, tag: &str, payload: Vec<u8>) -> Result<(), LocalTransportError> {
        let sender = self
            .senders
            .get(dst)
            .and_then(|s| s.as_ref())
            .ok_or(LocalTransportError::NoRoute(dst))?;
        trace!(dst, tag, bytes = payload.len(), "put");
        sender
            .send(TaggedMessage {
                tag: tag.to_string(),
                payload,
            })
            .await
            .map_err(|_| LocalTransportError::Closed)
    }

    async fn get(&self, src: usize, tag: &str) -> Result<Vec<u8>, LocalTransportError> {
        let receiver = self
            .receivers
            .get(src)
            .and_then(|r| r.as_ref())
            .ok_or(LocalTransportError::NoRoute(src))?;
        let mut receiver = receiver.lock().await;
        let msg = match timeout(self.recv_timeout, receiver.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(LocalTransportError::Closed),
            Err(_) => return Err(LocalTransportError::TimeoutElapsed),
        };
        if msg.tag != tag {
            return Err(LocalTransportError::Desynchronized {
                expected: tag.to_string(),
                actual: msg.tag,
            });
        }
        trace!(src, tag, bytes = msg.payload.len(), "got");
        Ok(msg.payload)
    }
}

/// Best-effort communication telemetry, accumulated by [`Instrumented`].
#[derive(Debug, Clone, Default)]
pub struct CommStats {
    /// Number of transport calls (sends plus receives).
    pub rounds: u64,
    /// Total payload bytes moved.
    pub bytes: u64,
    /// Wall-clock time spent inside transport calls.
    pub elapsed: Duration,
    /// Tags delivered by this party, in call order.
    pub sent_tags: Vec<String>,
    /// Tags awaited by this party, in call order.
    pub received_tags: Vec<String>,
}

/// A transport wrapper that records per-call round, byte and timing counters.
///
/// Instrumentation is orthogonal to protocol correctness: the wrapper can be
/// removed without touching any protocol logic. Note that each party records
/// its own traffic, so system-wide byte counts must be halved to avoid
/// double-counting.
pub struct Instrumented<T> {
    inner: T,
    stats: Arc<Mutex<CommStats>>,
}

impl<T> Instrumented<T> {
    /// Wraps a transport.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            stats: Arc::new(Mutex::new(CommStats::default())),
        }
    }

    /// A snapshot of the accumulated statistics.
    pub fn stats(&self) -> CommStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Resets all counters.
    pub fn reset(&self) {
        *self.stats.lock().expect("stats lock poisoned") = CommStats::default();
    }
}

impl<T: Transport> Transport for Instrumented<T> {
    type Error = T::Error;

    async fn put(&self, dst: usize, tag: &str, payload: Vec<u8>) -> Result<(), T::Error> {
        let bytes = payload.len() as u64;
        let start = Instant::now();
        let result = self.inner.put(dst, tag, payload).await;
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.rounds += 1;
        stats.bytes += bytes;
        stats.elapsed += start.elapsed();
        stats.sent_tags.push(tag.to_string());
        result
    }

    async fn get(&self, src: usize, tag: &str) -> Result<Vec<u8>, T::Error> {
        let start = Instant::now();
        let result = self.inner.get(src, tag).await;
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.rounds += 1;
        if let Ok(payload) = &result {
            stats.bytes += payload.len() as u64;
        }
        stats.elapsed += start.elapsed();
        stats.received_tags.push(tag.to_string());
        result
    }
}
