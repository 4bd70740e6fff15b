//! Engine statistics collection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tunsplice_packet::Unsupported;

/// Why the pump discarded a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Truncated or otherwise unparseable
    Malformed,
    /// IPv6 datagram
    Ipv6,
    /// IP version other than 4 or 6
    OtherVersion,
    /// IPv4 but not TCP
    NotTcp,
    /// TCP toward a port that is not intercepted
    Port,
    /// Payload refused by a relay whose queue is full
    Overflow,
}

impl From<Unsupported> for DropReason {
    fn from(kind: Unsupported) -> Self {
        match kind {
            Unsupported::Ipv6 => DropReason::Ipv6,
            Unsupported::Version(_) => DropReason::OtherVersion,
            Unsupported::Protocol(_) => DropReason::NotTcp,
        }
    }
}

/// Counters shared by the pump, the relays and the tunnel writer.
#[derive(Debug, Default)]
pub struct EngineStats {
    packets_read: AtomicU64,
    bytes_read: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_ipv6: AtomicU64,
    dropped_version: AtomicU64,
    dropped_protocol: AtomicU64,
    dropped_port: AtomicU64,
    dropped_overflow: AtomicU64,
    relays_opened: AtomicU64,
    relays_closed: AtomicU64,
    connect_failures: AtomicU64,
    bytes_forwarded: AtomicU64,
    bytes_returned: AtomicU64,
    packets_injected: AtomicU64,
    tunnel_write_errors: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a chunk read from the tunnel
    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one whole packet split off a tunnel read
    pub fn record_packet(&self) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Ipv6 => &self.dropped_ipv6,
            DropReason::OtherVersion => &self.dropped_version,
            DropReason::NotTcp => &self.dropped_protocol,
            DropReason::Port => &self.dropped_port,
            DropReason::Overflow => &self.dropped_overflow,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_opened(&self) {
        self.relays_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_closed(&self) {
        self.relays_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record payload written to an outbound socket
    pub fn record_forwarded(&self, bytes: usize) {
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record response payload received from an outbound socket
    pub fn record_returned(&self, bytes: usize) {
        self.bytes_returned.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_injected(&self) {
        self.packets_injected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_write_error(&self) {
        self.tunnel_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_ipv6: self.dropped_ipv6.load(Ordering::Relaxed),
            dropped_version: self.dropped_version.load(Ordering::Relaxed),
            dropped_protocol: self.dropped_protocol.load(Ordering::Relaxed),
            dropped_port: self.dropped_port.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            relays_opened: self.relays_opened.load(Ordering::Relaxed),
            relays_closed: self.relays_closed.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            bytes_returned: self.bytes_returned.load(Ordering::Relaxed),
            packets_injected: self.packets_injected.load(Ordering::Relaxed),
            tunnel_write_errors: self.tunnel_write_errors.load(Ordering::Relaxed),
        }
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        self.snapshot().format()
    }
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub packets_read: u64,
    pub bytes_read: u64,
    pub dropped_malformed: u64,
    pub dropped_ipv6: u64,
    pub dropped_version: u64,
    pub dropped_protocol: u64,
    pub dropped_port: u64,
    pub dropped_overflow: u64,
    pub relays_opened: u64,
    pub relays_closed: u64,
    pub connect_failures: u64,
    pub bytes_forwarded: u64,
    pub bytes_returned: u64,
    pub packets_injected: u64,
    pub tunnel_write_errors: u64,
}

impl StatsSnapshot {
    /// Packets discarded for any reason
    pub fn dropped(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_ipv6
            + self.dropped_version
            + self.dropped_protocol
            + self.dropped_port
            + self.dropped_overflow
    }

    /// Relays opened and not yet closed
    pub fn active_relays(&self) -> u64 {
        self.relays_opened.saturating_sub(self.relays_closed)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn format(&self) -> String {
        format!(
            "RX: {} pkts ({} dropped), relays: {} active / {} opened, \
             fwd: {:.2}KB, ret: {:.2}KB ({} pkts), connect failures: {}",
            self.packets_read,
            self.dropped(),
            self.active_relays(),
            self.relays_opened,
            self.bytes_forwarded as f64 / 1024.0,
            self.bytes_returned as f64 / 1024.0,
            self.packets_injected,
            self.connect_failures,
        )
    }
}
