//! Engine-wide counters.
//!
//! `bytes_in`/`bytes_out` follow the relay payload: in = tunnel to host,
//! out = host to tunnel. Synthetic packets (SYN-ACK, bare ACK, Echo
//! Reply) are never counted there.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative relay traffic, published to the host sink.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.bytes_out.load(Ordering::Relaxed),
        )
    }
}

/// Packet-level statistics for diagnostics.
#[derive(Debug, Default)]
pub struct StackStats {
    pub packets_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub icmp_packets: AtomicU64,
    pub other_packets: AtomicU64,
    pub tcp_flows_total: AtomicU64,
    pub udp_sessions_total: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_icmp(&self) {
        self.icmp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_flow(&self) {
        self.tcp_flows_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
    }
}
