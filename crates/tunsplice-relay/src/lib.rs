//! tunsplice Relay Engine
//!
//! Sits behind a tunnel device, picks out TCP flows toward the intercepted
//! ports, and relays their payload to the real destination over ordinary
//! sockets. Response bytes are wrapped into synthetic IPv4/TCP packets and
//! written back into the tunnel.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────── RelayEngine ────────────────────────┐
//!            │                                                             │
//!  tunnel ──▶│ TunnelPump ──▶ classify ──▶ RelayTable ──▶ ConnectionRelay ─│──▶ TCP socket
//!   read     │  (read loop)                (FlowKey)      (driver task)    │   (destination)
//!            │                                                 ▲           │
//!            │                                                 │ Weak      │
//!  tunnel ◀──│ TunnelWriter ◀── build_response ◀── ResponseReader ◀────────│─── response
//!   write    │ (one packet per lock)                                       │    bytes
//!            └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one relay (and one outbound socket) per flow key
//! - Payloads of one flow reach the socket in tunnel order
//! - Every injected packet is written whole; packets from different
//!   relays never interleave
//! - After [`RelayEngine::stop`] the relay table is empty and every
//!   outbound socket has been released

mod config;
mod connector;
mod engine;
mod flow;
mod pump;
mod relay;
mod stats;
mod table;
mod tunnel;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ConfigFormat, EngineConfig};
pub use connector::{ConnectFuture, Connector, DirectConnector};
pub use engine::{EngineError, RelayEngine};
pub use flow::FlowKey;
pub use relay::{ConnectionRelay, RelayError, RelayState};
pub use stats::{DropReason, EngineStats, StatsSnapshot};
pub use table::RelayTable;
pub use tunnel::{TunnelError, TunnelWriter};
