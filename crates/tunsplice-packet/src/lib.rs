//! tunsplice Packet Codec
//!
//! Stateless parsing and construction of the raw IPv4/TCP packets that
//! travel across a tunnel device.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬───────────────┐
//! │ IPv4 header (20..60) │ TCP header (20..60)  │    payload    │
//! └──────────────────────┴──────────────────────┴───────────────┘
//!   Ipv4Header::parse      TcpHeader::parse        ParsedPacket
//! ```
//!
//! Parsers never read past the end of the buffer: a header that claims more
//! bytes than are present fails with [`PacketError::Truncated`].
//! Builders always fill in both the IPv4 header checksum and the TCP
//! checksum, so injected packets validate on the wire.

mod builder;
mod checksum;
mod classify;
mod ipv4;
mod tcp;

pub use builder::{TcpSegment, build_ipv4_tcp_packet, build_response};
pub use checksum::{internet_checksum, ipv4_checksum, tcp_checksum};
pub use classify::{ParsedPacket, Unsupported, classify, packet_len};
pub use ipv4::{IPV4_MIN_HEADER_LEN, Ipv4Header, PROTO_TCP, parse_ipv4_header};
pub use tcp::{TCP_MIN_HEADER_LEN, TcpFlags, TcpHeader, parse_tcp_header};

/// Packet codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unsupported IP version {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid header length: {0} bytes")]
    InvalidHeaderLength(usize),

    #[error("Invalid total length: {0} bytes")]
    InvalidTotalLength(usize),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, PacketError>;
