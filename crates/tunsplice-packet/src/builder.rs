//! IPv4/TCP packet construction
//!
//! Produces option-less headers (20 + 20 bytes) followed by the payload,
//! with total length and both checksums filled in.

use crate::checksum::{ipv4_checksum, tcp_checksum};
use crate::ipv4::{IPV4_MIN_HEADER_LEN, PROTO_TCP};
use crate::tcp::{TCP_MIN_HEADER_LEN, TcpFlags};
use crate::{PacketError, Result};
use std::net::{Ipv4Addr, SocketAddrV4};

const HEADERS_LEN: usize = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN;

/// Default TTL of injected packets
const DEFAULT_TTL: u8 = 64;

/// Default advertised window
const DEFAULT_WINDOW: u16 = 8192;

/// A TCP segment to be wrapped in an IPv4 datagram
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub identification: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    /// Create a `PSH|ACK` data segment with zeroed sequence numbers
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, payload: &'a [u8]) -> Self {
        Self {
            src,
            dst,
            seq: 0,
            ack: 0,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window: DEFAULT_WINDOW,
            identification: 0,
            ttl: DEFAULT_TTL,
            payload,
        }
    }

    pub fn with_seq(mut self, seq: u32, ack: u32) -> Self {
        self.seq = seq;
        self.ack = ack;
        self
    }

    pub fn with_flags(mut self, flags: TcpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn with_identification(mut self, identification: u16) -> Self {
        self.identification = identification;
        self
    }

    /// Total length of the resulting datagram
    pub fn packet_len(&self) -> usize {
        HEADERS_LEN + self.payload.len()
    }

    /// Serialize into a checksummed IPv4/TCP packet
    pub fn build(&self) -> Result<Vec<u8>> {
        let total_len = self.packet_len();
        if total_len > u16::MAX as usize {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }

        let mut packet = vec![0u8; total_len];

        let ip = &mut packet[..IPV4_MIN_HEADER_LEN];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[4..6].copy_from_slice(&self.identification.to_be_bytes());
        ip[6] = 0x40; // Don't Fragment
        ip[8] = self.ttl;
        ip[9] = PROTO_TCP;
        ip[12..16].copy_from_slice(&self.src.ip().octets());
        ip[16..20].copy_from_slice(&self.dst.ip().octets());
        let ip_sum = ipv4_checksum(ip);
        ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

        let tcp = &mut packet[IPV4_MIN_HEADER_LEN..];
        tcp[0..2].copy_from_slice(&self.src.port().to_be_bytes());
        tcp[2..4].copy_from_slice(&self.dst.port().to_be_bytes());
        tcp[4..8].copy_from_slice(&self.seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&self.ack.to_be_bytes());
        tcp[12] = ((TCP_MIN_HEADER_LEN / 4) as u8) << 4;
        tcp[13] = self.flags.bits();
        tcp[14..16].copy_from_slice(&self.window.to_be_bytes());
        tcp[TCP_MIN_HEADER_LEN..].copy_from_slice(self.payload);
        let tcp_sum = tcp_checksum(*self.src.ip(), *self.dst.ip(), tcp);
        tcp[16..18].copy_from_slice(&tcp_sum.to_be_bytes());

        Ok(packet)
    }
}

/// Build a minimal IPv4/TCP data packet.
pub fn build_ipv4_tcp_packet(
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    TcpSegment::new(
        SocketAddrV4::new(src_addr, src_port),
        SocketAddrV4::new(dst_addr, dst_port),
        payload,
    )
    .build()
}

/// Build a packet travelling back along a flow.
///
/// `flow_src` is the tunnel-side endpoint and `flow_dst` the external peer,
/// as seen on the outgoing packets. The response is addressed from
/// `flow_dst` to `flow_src`.
pub fn build_response(
    flow_src: SocketAddrV4,
    flow_dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    window: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    TcpSegment::new(flow_dst, flow_src, payload)
        .with_seq(seq, ack)
        .with_window(window)
        .build()
}
