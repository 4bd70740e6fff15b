//! Tunnel Pump
//!
//! The read loop of the engine. Each tunnel read is split into whole
//! packets; every packet is split off the read buffer as an owned value
//! before the buffer is reused, so payload handed to a relay is never
//! overwritten by the next read.
//!
//! Per packet:
//! 1. IPv6 or any other non-IPv4 packet → drop
//! 2. IPv4 but not TCP → drop
//! 3. TCP toward a port that is not intercepted → drop
//! 4. Otherwise → resolve/create the flow's relay and forward the payload

use crate::engine::EngineError;
use crate::flow::FlowKey;
use crate::relay::{ConnectionRelay, RelayContext, RelayError, RelayState};
use crate::stats::DropReason;
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use tunsplice_packet::{ParsedPacket, classify, packet_len};

pub(crate) struct TunnelPump<R> {
    reader: R,
    buffer: BytesMut,
    ctx: Arc<RelayContext>,
    stop: watch::Receiver<bool>,
}

impl<R> TunnelPump<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub(crate) fn new(reader: R, ctx: Arc<RelayContext>, stop: watch::Receiver<bool>) -> Self {
        let buffer = BytesMut::with_capacity(ctx.config.read_buffer_size);
        Self {
            reader,
            buffer,
            ctx,
            stop,
        }
    }

    /// Run until stopped, the tunnel closes, or a read fails.
    ///
    /// Always finishes with the shutdown sweep: every relay is closed and
    /// the tunnel's write side is shut down.
    pub(crate) async fn run(mut self) -> Result<(), EngineError> {
        info!("Tunnel pump started");
        let result = self.read_loop().await;

        let ctx = self.ctx.clone();
        drop(self);
        close_relays(&ctx).await;
        ctx.tunnel.shutdown().await;

        info!("Tunnel pump stopped");
        result
    }

    async fn read_loop(&mut self) -> Result<(), EngineError> {
        let read_size = self.ctx.config.read_buffer_size;

        loop {
            if self.buffer.capacity() - self.buffer.len() < read_size {
                self.buffer.reserve(read_size);
            }

            let read = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => {
                    debug!("Tunnel pump received stop");
                    return Ok(());
                }
                result = self.reader.read_buf(&mut self.buffer) => result,
            };

            match read {
                Ok(0) => {
                    info!("Tunnel device closed");
                    return Ok(());
                }
                Ok(n) => {
                    self.ctx.stats.record_read(n);
                    self.drain_packets();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Tunnel read failed: {}", e);
                    return Err(EngineError::TunnelRead(e));
                }
            }
        }
    }

    /// Dispatch every complete packet of one read.
    ///
    /// A read carries whole packets only, so bytes left after the last
    /// complete packet are a truncated packet and are dropped. The buffer is
    /// always empty on return.
    fn drain_packets(&mut self) {
        while !self.buffer.is_empty() {
            match packet_len(&self.buffer) {
                Ok(Some(len)) if len <= self.buffer.len() => {
                    let packet = self.buffer.split_to(len).freeze();
                    self.ctx.stats.record_packet();
                    self.dispatch(packet);
                }
                Ok(_) => {
                    trace!("Dropping truncated packet of {} bytes", self.buffer.len());
                    self.ctx.stats.record_drop(DropReason::Malformed);
                    self.buffer.clear();
                }
                Err(e) => {
                    trace!(
                        "Discarding {} unframeable tunnel bytes: {}",
                        self.buffer.len(),
                        e
                    );
                    self.ctx.stats.record_drop(DropReason::Malformed);
                    self.buffer.clear();
                }
            }
        }
    }

    fn dispatch(&self, packet: Bytes) {
        let (ip, tcp, payload) = match classify(&packet) {
            Ok(ParsedPacket::Ipv4Tcp { ip, tcp, payload }) => (ip, tcp, payload),
            Ok(ParsedPacket::Unsupported(kind)) => {
                trace!("Dropping {} packet", kind);
                self.ctx.stats.record_drop(kind.into());
                return;
            }
            Err(e) => {
                trace!("Dropping malformed packet: {}", e);
                self.ctx.stats.record_drop(DropReason::Malformed);
                return;
            }
        };

        if !self.ctx.config.intercepts(tcp.dst_port) {
            trace!("Dropping TCP packet to port {}", tcp.dst_port);
            self.ctx.stats.record_drop(DropReason::Port);
            return;
        }

        let key = FlowKey::from_headers(&ip, &tcp);

        // A reset tears the flow down and never opens a socket
        if tcp.is_rst() {
            if let Some(relay) = self.ctx.table.get(&key) {
                debug!("Relay {} reset by tunnel side", key);
                relay.close();
            }
            return;
        }

        let payload = packet.slice(payload);

        // A relay may close between lookup and forward; retry once on a fresh one
        for _ in 0..2 {
            let relay = self.relay_for(key);
            match relay.forward(&tcp, payload.clone()) {
                Ok(()) => return,
                Err(RelayError::Closed) => {
                    self.ctx.table.remove_relay(&key, &relay);
                }
                Err(e) => {
                    debug!("Relay {} rejected segment: {}", key, e);
                    return;
                }
            }
        }
        debug!("Relay {} dropped segment of {} bytes", key, payload.len());
    }

    fn relay_for(&self, key: FlowKey) -> Arc<ConnectionRelay> {
        self.ctx.table.get_or_create(key, || {
            debug!("Opening relay {}", key);
            self.ctx.stats.record_relay_opened();
            ConnectionRelay::new(key, self.ctx.clone())
        })
    }
}

/// Close every relay and wait (bounded) for their sockets to be released
async fn close_relays(ctx: &RelayContext) {
    let mut relays = Vec::new();
    ctx.table.for_each_active(|relay| {
        relay.close();
        relays.push(relay.clone());
    });

    if relays.is_empty() {
        return;
    }

    let grace = ctx.config.shutdown_grace();
    let released = async {
        for relay in &relays {
            relay.closed().await;
        }
    };
    if tokio::time::timeout(grace, released).await.is_err() {
        let pending = relays
            .iter()
            .filter(|relay| relay.state() != RelayState::Closed)
            .count();
        warn!(
            "{} of {} relays still releasing after {:?}",
            pending,
            relays.len(),
            grace
        );
    }

    ctx.table.clear();
    info!("Closed {} relays", relays.len());
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop
    let _ = stop.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::{
        RedirectConnector, StallingConnector, client_segment, context, flow, refused_addr,
    };
    use std::cell::Cell;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tunsplice_packet::TcpFlags;

    const WAIT: Duration = Duration::from_secs(5);

    fn pump_with<C: crate::connector::Connector>(
        connector: C,
    ) -> (
        TunnelPump<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        watch::Sender<bool>,
        Arc<RelayContext>,
    ) {
        let (ctx, _device) = context(EngineConfig::default(), connector);
        let (reader, writer) = tokio::io::duplex(64 * 1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        (TunnelPump::new(reader, ctx.clone(), stop_rx), writer, stop_tx, ctx)
    }

    #[tokio::test]
    async fn test_drop_policy() {
        let (mut pump, _tun, _stop, ctx) = pump_with(StallingConnector::new());

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        let mut udp = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"");
        udp[9] = 17;
        let mut port_80 = flow(51000);
        port_80.dst.set_port(80);
        let http = client_segment(port_80, 1, 0, TcpFlags::SYN, b"GET /");
        let truncated = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"")[..30].to_vec();

        for packet in [v6, udp, http] {
            pump.buffer.extend_from_slice(&packet);
        }
        pump.drain_packets();

        // A header claiming more bytes than were read is dropped with the read
        pump.buffer.extend_from_slice(&truncated);
        pump.drain_packets();
        assert!(pump.buffer.is_empty());

        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.packets_read, 3);
        assert_eq!(snapshot.dropped_malformed, 1);
        assert_eq!(snapshot.dropped_ipv6, 1);
        assert_eq!(snapshot.dropped_protocol, 1);
        assert_eq!(snapshot.dropped_port, 1);
        assert_eq!(snapshot.relays_opened, 0);
        assert!(ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_read_spares_next_read() {
        let (mut pump, _tun, _stop, ctx) = pump_with(StallingConnector::new());

        let cut = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"")[..30].to_vec();
        pump.buffer.extend_from_slice(&cut);
        pump.drain_packets();

        let syn = client_segment(flow(51001), 1, 0, TcpFlags::SYN, b"");
        pump.buffer.extend_from_slice(&syn);
        pump.drain_packets();

        assert_eq!(ctx.table.keys(), vec![flow(51001)]);
        let snapshot = ctx.stats.snapshot();
        assert_eq!(snapshot.dropped_malformed, 1);
        assert_eq!(snapshot.packets_read, 1);
        assert!(pump.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_fragment_after_whole_packet() {
        let (mut pump, _tun, _stop, ctx) = pump_with(StallingConnector::new());

        let syn = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"");
        pump.buffer.extend_from_slice(&syn);
        pump.buffer.extend_from_slice(&syn[..3]);
        pump.drain_packets();

        assert!(pump.buffer.is_empty());
        assert_eq!(ctx.table.len(), 1);
        assert_eq!(ctx.stats.snapshot().dropped_malformed, 1);
    }

    #[tokio::test]
    async fn test_garbage_is_discarded() {
        let (mut pump, _tun, _stop, ctx) = pump_with(StallingConnector::new());

        pump.buffer.extend_from_slice(&[0x00, 0x01, 0x02, 0x03, 0x04]);
        pump.drain_packets();

        assert!(pump.buffer.is_empty());
        assert_eq!(ctx.stats.snapshot().dropped_malformed, 1);
    }

    #[tokio::test]
    async fn test_packets_of_one_read_are_split() {
        let (mut pump, _tun, _stop, ctx) = pump_with(StallingConnector::new());

        for port in [51000, 51001, 51002] {
            let syn = client_segment(flow(port), 1, 0, TcpFlags::SYN, b"");
            pump.buffer.extend_from_slice(&syn);
        }
        pump.drain_packets();

        assert_eq!(ctx.table.len(), 3);
        for port in [51000, 51001, 51002] {
            let relay = ctx.table.get(&flow(port)).unwrap();
            assert_eq!(relay.state(), RelayState::Connecting);
        }
    }

    #[tokio::test]
    async fn test_payload_outlives_buffer_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut pump, _tun, _stop, _ctx) =
            pump_with(RedirectConnector::new(listener.local_addr().unwrap()));

        let first = client_segment(flow(51000), 1, 0, TcpFlags::PSH | TcpFlags::ACK, b"AAAA");
        pump.buffer.extend_from_slice(&first);
        pump.drain_packets();

        // Refill the same buffer before the relay has written anything
        let second = client_segment(flow(51000), 5, 0, TcpFlags::PSH | TcpFlags::ACK, b"BBBB");
        pump.buffer.extend_from_slice(&second);
        pump.drain_packets();

        let (mut server, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut received = [0u8; 8];
        timeout(WAIT, server.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received, b"AAAABBBB");
    }

    #[tokio::test]
    async fn test_rst_closes_without_opening() {
        let (mut pump, _tun, _stop, ctx) = pump_with(StallingConnector::new());

        let rst = client_segment(flow(51000), 1, 0, TcpFlags::RST, b"");
        pump.buffer.extend_from_slice(&rst);
        pump.drain_packets();
        assert!(ctx.table.is_empty());

        let syn = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"");
        pump.buffer.extend_from_slice(&syn);
        pump.drain_packets();
        let relay = ctx.table.get(&flow(51000)).unwrap();

        pump.buffer.extend_from_slice(&rst);
        pump.drain_packets();
        assert!(ctx.table.is_empty());
        assert!(relay.state().is_terminating());
    }

    #[tokio::test]
    async fn test_closed_relay_is_replaced() {
        let (mut pump, _tun, _stop, ctx) =
            pump_with(RedirectConnector::new(refused_addr().await));

        let syn = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"");
        pump.buffer.extend_from_slice(&syn);
        pump.drain_packets();
        let first = ctx.table.get(&flow(51000)).unwrap();
        timeout(WAIT, first.closed()).await.unwrap();

        pump.buffer.extend_from_slice(&syn);
        pump.drain_packets();
        let second = ctx.table.get(&flow(51000)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(ctx.stats.snapshot().relays_opened, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal_and_sweeps() {
        let (pump, mut tun, stop, ctx) = pump_with(StallingConnector::new());
        let handle = tokio::spawn(pump.run());

        for port in [51000, 51001] {
            let syn = client_segment(flow(port), 1, 0, TcpFlags::SYN, b"");
            tun.write_all(&syn).await.unwrap();
        }
        while ctx.table.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        stop.send_replace(true);
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

        assert!(ctx.table.is_empty());
        assert!(ctx.tunnel.is_closed().await);
        assert_eq!(ctx.stats.snapshot().relays_closed, 2);
    }

    /// Send but not Sync, like a handle only one task may poll
    struct UnsyncReader {
        inner: DuplexStream,
        _marker: Cell<()>,
    }

    impl AsyncRead for UnsyncReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_with_unsync_reader() {
        let (ctx, _device) = context(EngineConfig::default(), StallingConnector::new());
        let (reader, mut tun) = tokio::io::duplex(64 * 1024);
        let reader = UnsyncReader {
            inner: reader,
            _marker: Cell::new(()),
        };
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(TunnelPump::new(reader, ctx.clone(), stop_rx).run());

        let syn = client_segment(flow(51000), 1, 0, TcpFlags::SYN, b"");
        tun.write_all(&syn).await.unwrap();
        timeout(WAIT, async {
            while ctx.table.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop.send_replace(true);
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert!(ctx.table.is_empty());
    }

    #[tokio::test]
    async fn test_run_ends_when_tunnel_closes() {
        let (pump, tun, _stop, ctx) = pump_with(StallingConnector::new());
        let handle = tokio::spawn(pump.run());

        drop(tun);
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert!(ctx.tunnel.is_closed().await);
    }
}
