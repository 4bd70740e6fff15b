//! Flow identity

use std::net::{SocketAddr, SocketAddrV4};
use tunsplice_packet::{Ipv4Header, TcpHeader};

/// 4-tuple of a relayed flow, oriented from the tunnel side toward the
/// external destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Tunnel-side endpoint
    pub src: SocketAddrV4,
    /// External destination
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }

    /// Derive the key from the headers of an outgoing packet
    pub fn from_headers(ip: &Ipv4Header, tcp: &TcpHeader) -> Self {
        Self {
            src: SocketAddrV4::new(ip.src_addr, tcp.src_port),
            dst: SocketAddrV4::new(ip.dst_addr, tcp.dst_port),
        }
    }

    /// The same flow seen from the reply direction
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Address the outbound socket dials
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::V4(self.dst)
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.src, self.dst)
    }
}
