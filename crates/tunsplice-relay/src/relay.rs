//! Connection Relay
//!
//! One relay per flow. It owns the outbound socket of the flow and moves
//! bytes in both directions:
//!
//! ```text
//!  forward() ──▶ queue ──▶ driver task ──▶ socket write half ──▶ destination
//!                                                                   │
//!  tunnel ◀── TunnelWriter ◀── build_response ◀── ResponseReader ◀──┘
//!                                                 (read half, Weak<relay>)
//! ```
//!
//! # States
//!
//! `New → Connecting → Connected → Closing → Closed`
//!
//! The first forwarded segment starts the driver task, which dials the
//! destination under a bounded retry policy, then writes queued payloads in
//! arrival order. The response reader runs until end-of-stream or error and
//! then closes the relay. Closing removes the relay from the table; `Closed`
//! is reached once both socket halves are released. A closed relay is never
//! reused.

use crate::config::EngineConfig;
use crate::connector::Connector;
use crate::flow::FlowKey;
use crate::stats::{DropReason, EngineStats};
use crate::table::RelayTable;
use crate::tunnel::{TunnelError, TunnelWriter};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tunsplice_packet::{PacketError, TcpHeader, build_response};

/// Bytes requested from the outbound socket per read
const RESPONSE_BUFFER_SIZE: usize = 16 * 1024;

/// Relay lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Created, no socket yet
    New,
    /// Dialing the destination
    Connecting,
    /// Socket open, relaying in both directions
    Connected,
    /// Shutting down, socket being released
    Closing,
    /// Socket released; terminal
    Closed,
}

impl RelayState {
    /// Check if the relay still accepts payload
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RelayState::New | RelayState::Connecting | RelayState::Connected
        )
    }

    /// Check if the relay is closing or closed
    pub fn is_terminating(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RelayState::New => "new",
            RelayState::Connecting => "connecting",
            RelayState::Connected => "connected",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay closed")]
    Closed,

    #[error("Relay queue full, dropped {0} bytes")]
    QueueFull(usize),

    #[error("Connect to {addr} timed out ({attempts} attempts in {elapsed:?})")]
    ConnectTimeout {
        addr: SocketAddr,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Outbound I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet build failed: {0}")]
    Packet(#[from] PacketError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Everything a relay shares with the rest of the engine
pub(crate) struct RelayContext {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) tunnel: TunnelWriter,
    pub(crate) table: RelayTable,
    pub(crate) stats: Arc<EngineStats>,
}

/// Best-effort TCP numbering for injected packets.
///
/// `ack` follows the last segment seen from the tunnel side; `seq` starts at
/// the tunnel side's acknowledgement number and advances by every payload
/// byte sent back.
#[derive(Debug, Default)]
struct SequenceTracker {
    next_ack: AtomicU32,
    next_seq: AtomicU32,
    synced: AtomicBool,
}

impl SequenceTracker {
    fn observe(&self, tcp: &TcpHeader, payload_len: usize) {
        self.next_ack.store(
            tcp.seq.wrapping_add(tcp.sequence_len(payload_len)),
            Ordering::Relaxed,
        );
        if tcp.has_ack() && !self.synced.swap(true, Ordering::Relaxed) {
            self.next_seq.store(tcp.ack, Ordering::Relaxed);
        }
    }

    /// Reserve sequence space for `len` bytes, returning `(seq, ack)`
    fn next_response(&self, len: usize) -> (u32, u32) {
        let seq = self.next_seq.fetch_add(len as u32, Ordering::Relaxed);
        (seq, self.next_ack.load(Ordering::Relaxed))
    }
}

/// Per-flow relay between the tunnel and one outbound socket
pub struct ConnectionRelay {
    key: FlowKey,
    state: watch::Sender<RelayState>,
    queue_tx: mpsc::Sender<Bytes>,
    /// Taken by the driver task when the relay starts connecting
    queue_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    sequence: SequenceTracker,
    created_at: Instant,
    ctx: Arc<RelayContext>,
}

impl ConnectionRelay {
    pub(crate) fn new(key: FlowKey, ctx: Arc<RelayContext>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(ctx.config.relay_queue_depth.max(1));
        let (state, _) = watch::channel(RelayState::New);

        Arc::new(Self {
            key,
            state,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            sequence: SequenceTracker::default(),
            created_at: Instant::now(),
            ctx,
        })
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Time since the relay was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Hand one tunnel segment to the relay.
    ///
    /// Never waits on the network: the payload is queued and the socket work
    /// happens on the relay's own tasks. The first call starts the connect,
    /// even for an empty payload (a bare SYN). A full queue refuses the
    /// payload with [`RelayError::QueueFull`].
    pub fn forward(self: &Arc<Self>, tcp: &TcpHeader, payload: Bytes) -> Result<(), RelayError> {
        if self.state().is_terminating() {
            return Err(RelayError::Closed);
        }

        self.sequence.observe(tcp, payload.len());
        self.enqueue(payload)
    }

    /// Queue `payload`, starting the driver task on first use
    fn enqueue(self: &Arc<Self>, payload: Bytes) -> Result<(), RelayError> {
        if !payload.is_empty() {
            match self.queue_tx.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(payload)) => {
                    debug!("Relay {} queue full", self.key);
                    self.ctx.stats.record_drop(DropReason::Overflow);
                    return Err(RelayError::QueueFull(payload.len()));
                }
                Err(TrySendError::Closed(_)) => return Err(RelayError::Closed),
            }
        }

        if self.begin_connect() {
            if let Some(queue) = self.take_queue() {
                tokio::spawn(self.clone().drive(queue));
            }
        } else if self.state().is_terminating() && !self.driver_started() {
            // Closed while still new: no driver will ever drain the queue
            return Err(RelayError::Closed);
        }

        Ok(())
    }

    fn take_queue(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn driver_started(&self) -> bool {
        self.queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Start closing the relay. Idempotent.
    ///
    /// Removes the relay from the table and signals its tasks; the state
    /// reaches [`RelayState::Closed`] once the socket is released.
    pub fn close(&self) {
        let mut previous = RelayState::Closed;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                RelayState::New => {
                    *state = RelayState::Closed;
                    true
                }
                RelayState::Connecting | RelayState::Connected => {
                    *state = RelayState::Closing;
                    true
                }
                RelayState::Closing | RelayState::Closed => false,
            }
        });

        if !changed {
            return;
        }

        self.ctx.table.remove_relay(&self.key, self);
        self.ctx.stats.record_relay_closed();
        debug!(
            "Relay {} closing (was {}, age {:?})",
            self.key,
            previous,
            self.age()
        );
    }

    /// Wait until the relay has released its socket
    pub async fn closed(&self) {
        self.wait_until(|state| *state == RelayState::Closed).await;
    }

    /// Wait until `predicate` holds for the current state, returning it
    pub async fn wait_until<F>(&self, predicate: F) -> RelayState
    where
        F: FnMut(&RelayState) -> bool,
    {
        let mut rx = self.state.subscribe();
        match rx.wait_for(predicate).await {
            Ok(state) => *state,
            // The sender lives in `self`, so this is unreachable in practice
            Err(_) => self.state(),
        }
    }

    fn begin_connect(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RelayState::New {
                *state = RelayState::Connecting;
                true
            } else {
                false
            }
        })
    }

    fn mark_connected(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == RelayState::Connecting {
                *state = RelayState::Connected;
                true
            } else {
                false
            }
        })
    }

    fn mark_closed(&self) {
        self.state.send_replace(RelayState::Closed);
        debug!("Relay {} closed", self.key);
    }

    /// Driver task: connect, then write queued payloads until closed
    async fn drive(self: Arc<Self>, mut queue: mpsc::Receiver<Bytes>) {
        let mut closing = self.state.subscribe();

        let stream = match self.connect(&mut closing).await {
            Ok(stream) => stream,
            Err(RelayError::Cancelled) => {
                debug!("Relay {} connect cancelled", self.key);
                self.mark_closed();
                return;
            }
            Err(e) => {
                warn!("Relay {} connect failed: {}", self.key, e);
                self.ctx.stats.record_connect_failure();
                self.close();
                self.mark_closed();
                return;
            }
        };

        let (read_half, mut write_half) = stream.into_split();
        if !self.mark_connected() {
            // Closed while the connect was completing
            self.mark_closed();
            return;
        }
        info!("Relay {} connected", self.key);

        let reader = ResponseReader {
            relay: Arc::downgrade(&self),
            key: self.key,
            socket: read_half,
            closing: self.state.subscribe(),
        };
        let reader = tokio::spawn(reader.run());

        loop {
            let payload = tokio::select! {
                biased;
                _ = terminated(&mut closing) => break,
                next = queue.recv() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };

            let written = tokio::select! {
                biased;
                _ = terminated(&mut closing) => break,
                result = write_half.write_all(&payload) => result,
            };

            match written {
                Ok(()) => self.ctx.stats.record_forwarded(payload.len()),
                Err(e) => {
                    warn!("Relay {} write failed: {}", self.key, e);
                    break;
                }
            }
        }

        self.close();
        if let Err(e) = write_half.shutdown().await {
            debug!("Relay {} socket shutdown: {}", self.key, e);
        }
        drop(write_half);
        let _ = reader.await;
        self.mark_closed();
    }

    /// Dial the destination with bounded, cancellable retries
    async fn connect(
        &self,
        closing: &mut watch::Receiver<RelayState>,
    ) -> Result<TcpStream, RelayError> {
        let config = &self.ctx.config;
        let addr = self.key.destination();
        let attempts = config.connect_attempts.max(1);
        let started = Instant::now();
        let mut backoff = config.connect_backoff();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let dial = tokio::time::timeout(config.connect_timeout(), self.ctx.connector.connect(addr));

            tokio::select! {
                biased;
                _ = terminated(closing) => return Err(RelayError::Cancelled),
                result = dial => match result {
                    Ok(Ok(stream)) => {
                        debug!("Relay {} connected on attempt {}", self.key, attempt);
                        return Ok(stream);
                    }
                    Ok(Err(e)) => {
                        debug!("Relay {} connect attempt {} failed: {}", self.key, attempt, e);
                        last_error = Some(e);
                    }
                    Err(_) => {
                        debug!("Relay {} connect attempt {} timed out", self.key, attempt);
                        last_error = None;
                    }
                },
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = terminated(closing) => return Err(RelayError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(config.connect_backoff_max());
            }
        }

        Err(match last_error {
            Some(source) => RelayError::ConnectFailed { addr, source },
            None => RelayError::ConnectTimeout {
                addr,
                attempts,
                elapsed: started.elapsed(),
            },
        })
    }

    /// Wrap response bytes into packets and inject them into the tunnel
    async fn deliver(&self, data: &[u8]) -> Result<(), RelayError> {
        let config = &self.ctx.config;

        for chunk in data.chunks(config.max_segment_size) {
            let (seq, ack) = self.sequence.next_response(chunk.len());
            let packet = build_response(
                self.key.src,
                self.key.dst,
                seq,
                ack,
                config.response_window,
                chunk,
            )?;
            self.ctx.tunnel.write_packet(&packet).await?;
            self.ctx.stats.record_returned(chunk.len());
        }

        Ok(())
    }
}

impl std::fmt::Debug for ConnectionRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRelay")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the relay is closing or closed
async fn terminated(rx: &mut watch::Receiver<RelayState>) {
    let _ = rx.wait_for(|state| state.is_terminating()).await;
}

/// Detached task reading the outbound socket.
///
/// Holds only a weak reference: the relay owns the flow, the reader merely
/// reports back to it.
struct ResponseReader {
    relay: Weak<ConnectionRelay>,
    key: FlowKey,
    socket: OwnedReadHalf,
    closing: watch::Receiver<RelayState>,
}

impl ResponseReader {
    async fn run(mut self) {
        let mut buf = vec![0u8; RESPONSE_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                biased;
                _ = terminated(&mut self.closing) => break,
                result = self.socket.read(&mut buf) => result,
            };

            match read {
                Ok(0) => {
                    debug!("Relay {} destination closed the connection", self.key);
                    break;
                }
                Ok(n) => {
                    let Some(relay) = self.relay.upgrade() else {
                        break;
                    };
                    if let Err(e) = relay.deliver(&buf[..n]).await {
                        warn!("Relay {} response delivery failed: {}", self.key, e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Relay {} read failed: {}", self.key, e);
                    break;
                }
            }
        }

        if let Some(relay) = self.relay.upgrade() {
            relay.close();
        }
    }
}
