//! Packet classification and framing
//!
//! A tunnel read is turned into whole packets with [`packet_len`], then each
//! packet is dispatched on [`classify`].

use crate::ipv4::{IPV4_MIN_HEADER_LEN, Ipv4Header};
use crate::tcp::TcpHeader;
use crate::{PacketError, Result};
use std::ops::Range;

const IPV6_HEADER_LEN: usize = 40;

/// Why a well-formed packet is not relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    /// IPv6 datagram
    Ipv6,
    /// Any other IP version nibble
    Version(u8),
    /// IPv4 carrying something other than TCP
    Protocol(u8),
}

impl std::fmt::Display for Unsupported {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv6 => write!(f, "IPv6"),
            Self::Version(v) => write!(f, "IP version {}", v),
            Self::Protocol(p) => write!(f, "IP protocol {}", p),
        }
    }
}

/// Result of classifying one raw packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPacket {
    /// IPv4 datagram carrying a TCP segment
    Ipv4Tcp {
        ip: Ipv4Header,
        tcp: TcpHeader,
        /// Byte range of the TCP payload within the packet
        payload: Range<usize>,
    },
    /// Valid packet of a kind the relay does not handle
    Unsupported(Unsupported),
}

impl ParsedPacket {
    /// Check if the packet is an IPv4/TCP segment
    pub fn is_tcp(&self) -> bool {
        matches!(self, ParsedPacket::Ipv4Tcp { .. })
    }
}

/// Classify a single raw IP packet.
///
/// Bytes beyond the IPv4 total length (link padding) are ignored.
pub fn classify(packet: &[u8]) -> Result<ParsedPacket> {
    let first = *packet.first().ok_or(PacketError::Truncated {
        needed: 1,
        available: 0,
    })?;

    match first >> 4 {
        4 => {}
        6 => return Ok(ParsedPacket::Unsupported(Unsupported::Ipv6)),
        v => return Ok(ParsedPacket::Unsupported(Unsupported::Version(v))),
    }

    let ip = Ipv4Header::parse(packet)?;
    if !ip.is_tcp() {
        return Ok(ParsedPacket::Unsupported(Unsupported::Protocol(ip.protocol)));
    }

    let end = ip.total_length as usize;
    if packet.len() < end {
        return Err(PacketError::Truncated {
            needed: end,
            available: packet.len(),
        });
    }

    let tcp = TcpHeader::parse(&packet[ip.payload_offset..end])?;
    let start = ip.payload_offset + tcp.payload_offset;

    Ok(ParsedPacket::Ipv4Tcp {
        ip,
        tcp,
        payload: start..end,
    })
}

/// Length of the first packet in `buf`.
///
/// Returns `Ok(None)` when more bytes are needed to tell, and an error when
/// the buffer does not start with a recognizable IP header.
pub fn packet_len(buf: &[u8]) -> Result<Option<usize>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    match first >> 4 {
        4 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
            if total < IPV4_MIN_HEADER_LEN {
                return Err(PacketError::InvalidTotalLength(total));
            }
            Ok(Some(total))
        }
        6 => {
            if buf.len() < 6 {
                return Ok(None);
            }
            let payload = u16::from_be_bytes([buf[4], buf[5]]) as usize;
            Ok(Some(IPV6_HEADER_LEN + payload))
        }
        v => Err(PacketError::UnsupportedVersion(v)),
    }
}
