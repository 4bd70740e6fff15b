//! IPv4 fixed header
//!
//! ```text
//!  0               1               2               3
//! ┌───────┬───────┬───────────────┬───────────────────────────────┐
//! │Version│  IHL  │      TOS      │         Total Length          │
//! ├───────┴───────┴───────────────┼─────┬─────────────────────────┤
//! │        Identification         │Flags│     Fragment Offset     │
//! ├───────────────┬───────────────┼─────┴─────────────────────────┤
//! │      TTL      │   Protocol    │        Header Checksum        │
//! ├───────────────┴───────────────┴───────────────────────────────┤
//! │                        Source Address                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │                      Destination Address                      │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use crate::{PacketError, Result};
use std::net::Ipv4Addr;

/// Length of an IPv4 header without options
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// IANA protocol number for TCP
pub const PROTO_TCP: u8 = 6;

/// Parsed IPv4 header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// IP version (always 4 after a successful parse)
    pub version: u8,
    /// Header length in bytes (IHL * 4)
    pub header_length: usize,
    /// Total datagram length claimed by the header
    pub total_length: u16,
    /// Identification field
    pub identification: u16,
    /// Time to live
    pub ttl: u8,
    /// Upper-layer protocol number
    pub protocol: u8,
    /// Source address
    pub src_addr: Ipv4Addr,
    /// Destination address
    pub dst_addr: Ipv4Addr,
    /// Offset of the upper-layer header (equals `header_length`)
    pub payload_offset: usize,
}

impl Ipv4Header {
    /// Parse the header at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let first = *buf.first().ok_or(PacketError::Truncated {
            needed: 1,
            available: 0,
        })?;

        let version = first >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }

        if buf.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: IPV4_MIN_HEADER_LEN,
                available: buf.len(),
            });
        }

        let header_length = ((first & 0x0F) as usize) * 4;
        if header_length < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::InvalidHeaderLength(header_length));
        }
        if buf.len() < header_length {
            return Err(PacketError::Truncated {
                needed: header_length,
                available: buf.len(),
            });
        }

        let total_length = u16::from_be_bytes([buf[2], buf[3]]);
        if (total_length as usize) < header_length {
            return Err(PacketError::InvalidTotalLength(total_length as usize));
        }

        Ok(Self {
            version,
            header_length,
            total_length,
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            ttl: buf[8],
            protocol: buf[9],
            src_addr: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst_addr: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            payload_offset: header_length,
        })
    }

    /// Check if this datagram carries TCP
    pub fn is_tcp(&self) -> bool {
        self.protocol == PROTO_TCP
    }
}

/// Parse an IPv4 header from the start of `buf`.
pub fn parse_ipv4_header(buf: &[u8]) -> Result<Ipv4Header> {
    Ipv4Header::parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&40u16.to_be_bytes());
        buf[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = PROTO_TCP;
        buf[12..16].copy_from_slice(&[10, 0, 0, 2]);
        buf[16..20].copy_from_slice(&[93, 184, 216, 34]);
        buf
    }

    #[test]
    fn test_parse_minimal_header() {
        let header = parse_ipv4_header(&sample_header()).unwrap();

        assert_eq!(header.version, 4);
        assert_eq!(header.header_length, 20);
        assert_eq!(header.payload_offset, 20);
        assert_eq!(header.total_length, 40);
        assert_eq!(header.identification, 0x1234);
        assert_eq!(header.ttl, 64);
        assert!(header.is_tcp());
        assert_eq!(header.src_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(header.dst_addr, Ipv4Addr::new(93, 184, 216, 34));
    }

    #[test]
    fn test_header_with_options() {
        let mut buf = sample_header();
        buf[0] = 0x46; // IHL 6 -> 24 bytes
        buf.extend_from_slice(&[1, 1, 1, 0]);
        buf[2..4].copy_from_slice(&44u16.to_be_bytes());

        let header = parse_ipv4_header(&buf).unwrap();
        assert_eq!(header.header_length, 24);
        assert_eq!(header.payload_offset, 24);
    }

    #[test]
    fn test_rejects_ipv6() {
        let mut buf = sample_header();
        buf[0] = 0x60;
        assert_eq!(
            parse_ipv4_header(&buf),
            Err(PacketError::UnsupportedVersion(6))
        );
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            parse_ipv4_header(&[]),
            Err(PacketError::Truncated { needed: 1, available: 0 })
        ));
        assert!(matches!(
            parse_ipv4_header(&sample_header()[..12]),
            Err(PacketError::Truncated { needed: 20, available: 12 })
        ));

        // Claims 60 bytes of header but only 20 are present
        let mut buf = sample_header();
        buf[0] = 0x4F;
        assert!(matches!(
            parse_ipv4_header(&buf),
            Err(PacketError::Truncated { needed: 60, .. })
        ));
    }

    #[test]
    fn test_invalid_lengths() {
        let mut buf = sample_header();
        buf[0] = 0x44;
        assert_eq!(
            parse_ipv4_header(&buf),
            Err(PacketError::InvalidHeaderLength(16))
        );

        let mut buf = sample_header();
        buf[2..4].copy_from_slice(&10u16.to_be_bytes());
        assert_eq!(
            parse_ipv4_header(&buf),
            Err(PacketError::InvalidTotalLength(10))
        );
    }
}
