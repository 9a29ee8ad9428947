//! Packet side of the veiltun data plane.
//!
//! Reads raw IPv4 packets from a TUN descriptor, keeps the host's TCP
//! and UDP state satisfied in userspace, and relays flow payload through
//! per-flow VLESS-over-WebSocket tunnels (see `veiltun-protocol`).

pub mod error;
pub mod icmp;
pub mod logging;
pub mod packet;
pub mod stack;
pub mod stats;
pub mod tcp;
pub mod udp;

#[cfg(unix)]
pub mod supervisor;
#[cfg(unix)]
pub mod tun;

use std::net::SocketAddr;

/// 4-tuple naming a transport flow seen on the TUN. Unique per protocol
/// among live flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }
}

pub use error::{NetStackError, Result};
pub use stack::{PacketTunnel, StackConfig};
pub use stats::{StackStats, TrafficCounters};
#[cfg(unix)]
pub use supervisor::{StatsSink, Supervisor, SupervisorConfig};
