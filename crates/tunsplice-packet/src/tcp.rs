//! TCP fixed header

use crate::{PacketError, Result};

/// Length of a TCP header without options
pub const TCP_MIN_HEADER_LEN: usize = 20;

bitflags::bitflags! {
    /// TCP control bits (byte 13 of the header)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Parsed TCP header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes (data offset * 4)
    pub header_length: usize,
    pub flags: TcpFlags,
    pub window: u16,
    /// Offset of the payload relative to the start of the TCP header
    pub payload_offset: usize,
}

impl TcpHeader {
    /// Parse the header at the start of `buf` (the IPv4 payload).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < TCP_MIN_HEADER_LEN {
            return Err(PacketError::Truncated {
                needed: TCP_MIN_HEADER_LEN,
                available: buf.len(),
            });
        }

        let header_length = ((buf[12] >> 4) as usize) * 4;
        if header_length < TCP_MIN_HEADER_LEN {
            return Err(PacketError::InvalidHeaderLength(header_length));
        }
        if buf.len() < header_length {
            return Err(PacketError::Truncated {
                needed: header_length,
                available: buf.len(),
            });
        }

        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            header_length,
            flags: TcpFlags::from_bits_truncate(buf[13]),
            window: u16::from_be_bytes([buf[14], buf[15]]),
            payload_offset: header_length,
        })
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    pub fn has_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    /// Sequence space consumed by a segment carrying `payload_len` bytes.
    ///
    /// SYN and FIN each occupy one sequence number.
    pub fn sequence_len(&self, payload_len: usize) -> u32 {
        let mut len = payload_len as u32;
        if self.is_syn() {
            len = len.wrapping_add(1);
        }
        if self.is_fin() {
            len = len.wrapping_add(1);
        }
        len
    }
}

/// Parse a TCP header from the start of `buf`.
pub fn parse_tcp_header(buf: &[u8]) -> Result<TcpHeader> {
    TcpHeader::parse(buf)
}
