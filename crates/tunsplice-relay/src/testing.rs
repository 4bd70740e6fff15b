//! Shared fixtures for the engine's unit tests.

use crate::config::EngineConfig;
use crate::connector::{ConnectFuture, Connector};
use crate::flow::FlowKey;
use crate::relay::RelayContext;
use crate::stats::EngineStats;
use crate::table::RelayTable;
use crate::tunnel::TunnelWriter;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tunsplice_packet::{ParsedPacket, TcpFlags, TcpHeader, TcpSegment, classify};

/// Sends every dial to one local address and counts the attempts
#[derive(Clone)]
pub(crate) struct RedirectConnector {
    target: SocketAddr,
    dials: Arc<AtomicUsize>,
}

impl RedirectConnector {
    pub(crate) fn new(target: SocketAddr) -> Self {
        Self {
            target,
            dials: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

impl Connector for RedirectConnector {
    fn connect(&self, _addr: SocketAddr) -> ConnectFuture<'_> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Box::pin(TcpStream::connect(self.target))
    }
}

/// Never completes a dial
#[derive(Clone, Default)]
pub(crate) struct StallingConnector;

impl StallingConnector {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Connector for StallingConnector {
    fn connect(&self, _addr: SocketAddr) -> ConnectFuture<'_> {
        Box::pin(std::future::pending())
    }
}

/// A local address with nothing listening on it
pub(crate) async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Relay context whose tunnel writes go to the returned device end
pub(crate) fn context<C: Connector>(
    config: EngineConfig,
    connector: C,
) -> (Arc<RelayContext>, DuplexStream) {
    let (engine_end, device_end) = tokio::io::duplex(64 * 1024);
    let stats = Arc::new(EngineStats::new());

    let ctx = Arc::new(RelayContext {
        config: Arc::new(config),
        connector: Arc::new(connector),
        tunnel: TunnelWriter::new(engine_end, stats.clone()),
        table: RelayTable::new(),
        stats,
    });
    (ctx, device_end)
}

/// Context for relays that are never forwarded to
pub(crate) fn idle_context() -> Arc<RelayContext> {
    let stats = Arc::new(EngineStats::new());
    Arc::new(RelayContext {
        config: Arc::new(EngineConfig::default()),
        connector: Arc::new(StallingConnector),
        tunnel: TunnelWriter::new(tokio::io::sink(), stats.clone()),
        table: RelayTable::new(),
        stats,
    })
}

/// `10.0.0.2:<src_port> -> 93.184.216.34:443`
pub(crate) fn flow(src_port: u16) -> FlowKey {
    FlowKey::new(
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), src_port),
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
    )
}

/// Raw packet sent from the tunnel side of `flow`
pub(crate) fn client_segment(
    flow: FlowKey,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    TcpSegment::new(flow.src, flow.dst, payload)
        .with_seq(seq, ack)
        .with_flags(flags)
        .with_window(65535)
        .build()
        .unwrap()
}

pub(crate) fn tcp_of(packet: &[u8]) -> TcpHeader {
    match classify(packet).unwrap() {
        ParsedPacket::Ipv4Tcp { tcp, .. } => tcp,
        other => panic!("expected TCP, got {:?}", other),
    }
}

/// Read one whole IPv4 packet from the device end of a tunnel
pub(crate) async fn read_packet(device: &mut DuplexStream) -> Vec<u8> {
    let mut head = [0u8; 4];
    device.read_exact(&mut head).await.unwrap();
    let total = u16::from_be_bytes([head[2], head[3]]) as usize;

    let mut packet = vec![0u8; total];
    packet[..4].copy_from_slice(&head);
    device.read_exact(&mut packet[4..]).await.unwrap();
    packet
}
