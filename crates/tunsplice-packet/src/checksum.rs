//! RFC 1071 internet checksums

use crate::ipv4::PROTO_TCP;
use std::net::Ipv4Addr;

/// Accumulate 16-bit big-endian words into a 32-bit sum.
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// One's-complement checksum over `data`
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// IPv4 header checksum. The checksum field itself must be zeroed.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// TCP checksum over the pseudo-header and `segment` (header + payload).
/// The checksum field in `segment` must be zeroed.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = PROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    fold(sum_words(segment, sum_words(&pseudo, 0)))
}
