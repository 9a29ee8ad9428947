//! Flow demultiplexer.
//!
//! One packet in, one dispatch out: TCP segments to the flow table, UDP
//! datagrams to the session table, echo requests to the responder,
//! everything else dropped. Handlers only enqueue work; the read loop
//! never waits on outbound network I/O.

use crate::icmp::IcmpResponder;
use crate::packet::{parse_packet, TransportInfo};
use crate::stats::{StackStats, TrafficCounters};
use crate::tcp::{TcpFlowConfig, TcpFlowTable};
use crate::udp::{UdpConfig, UdpSessionTable};
use crate::FlowKey;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use veiltun_protocol::TunnelConfig;

#[derive(Debug, Clone, Default)]
pub struct StackConfig {
    pub tcp: TcpFlowConfig,
    pub udp: UdpConfig,
}

/// The packet side of the engine: parses TUN reads and keeps the host's
/// transport state satisfied while payload rides the tunnel.
pub struct PacketTunnel {
    tcp: Arc<TcpFlowTable>,
    udp: Arc<UdpSessionTable>,
    icmp: IcmpResponder,
    stats: Arc<StackStats>,
    counters: Arc<TrafficCounters>,
}

impl PacketTunnel {
    pub fn new(
        config: StackConfig,
        tunnel_cfg: Arc<TunnelConfig>,
        tun_tx: mpsc::Sender<BytesMut>,
    ) -> Arc<Self> {
        let counters = Arc::new(TrafficCounters::new());
        let tcp = TcpFlowTable::new(config.tcp, tunnel_cfg, tun_tx.clone(), counters.clone());
        let udp = UdpSessionTable::new(config.udp, tun_tx.clone(), counters.clone());
        let icmp = IcmpResponder::new(tun_tx);

        Arc::new(Self {
            tcp,
            udp,
            icmp,
            stats: Arc::new(StackStats::new()),
            counters,
        })
    }

    pub fn tcp(&self) -> &Arc<TcpFlowTable> {
        &self.tcp
    }

    pub fn udp(&self) -> &Arc<UdpSessionTable> {
        &self.udp
    }

    pub fn stats(&self) -> &Arc<StackStats> {
        &self.stats
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    /// Dispatch one packet as read from the TUN. Parse failures and
    /// foreign protocols are absorbed here, never propagated.
    pub async fn process_packet(self: &Arc<Self>, packet: &[u8]) {
        self.stats.record_received();

        let parsed = match parse_packet(packet) {
            Ok(p) => p,
            Err(e) => {
                self.stats.record_parse_error();
                trace!("Packet dropped: {}", e);
                return;
            }
        };

        match &parsed.transport {
            TransportInfo::Tcp(info) => {
                self.stats.record_tcp();
                let (Some(src), Some(dst)) = (parsed.src_socket(), parsed.dst_socket()) else {
                    return;
                };
                let key = FlowKey::new(src, dst);
                if parsed.is_tcp_syn() && self.tcp.get(&key).is_none() {
                    self.stats.record_tcp_flow();
                }
                let end = (info.payload_offset + info.payload_len).min(packet.len());
                let payload = &packet[info.payload_offset.min(end)..end];
                self.tcp.handle_segment(key, info, payload).await;
            }
            TransportInfo::Udp(info) => {
                self.stats.record_udp();
                let (Some(src), Some(dst)) = (parsed.src_socket(), parsed.dst_socket()) else {
                    return;
                };
                let key = FlowKey::new(src, dst);
                if !self.udp.contains(&key) {
                    self.stats.record_udp_session();
                }
                let end = (info.payload_offset + info.payload_len).min(packet.len());
                let payload = &packet[info.payload_offset.min(end)..end];
                self.udp.handle_datagram(key, payload).await;
            }
            TransportInfo::Icmp(info) => {
                self.stats.record_icmp();
                self.icmp.handle_packet(info, packet).await;
            }
            TransportInfo::Other(proto) => {
                self.stats.record_other();
                trace!("Protocol {} dropped", proto);
            }
        }
    }

    /// Demultiplexer loop over the TUN read channel.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<BytesMut>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match rx.recv().await {
                Some(packet) => self.process_packet(&packet).await,
                None => break,
            }
        }
        trace!("Demultiplexer loop ended");
    }

    /// Tear down every flow and session. Used on supervisor stop.
    pub fn shutdown(&self) {
        self.tcp.close_all();
        self.udp.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4_udp, parse_packet as pp};
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_stack() -> (Arc<PacketTunnel>, mpsc::Receiver<BytesMut>) {
        let cfg = TunnelConfig::new(
            "127.0.0.1",
            9, // discard port; TCP tests here never complete a dial
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
        );
        let (tun_tx, tun_rx) = mpsc::channel(64);
        let stack = PacketTunnel::new(StackConfig::default(), Arc::new(cfg), tun_tx);
        (stack, tun_rx)
    }

    #[tokio::test]
    async fn test_malformed_packets_absorbed() {
        let (stack, _tun_rx) = test_stack();

        stack.process_packet(&[]).await;
        stack.process_packet(&[0x60, 0x00, 0x00]).await; // IPv6 nibble
        stack.process_packet(&[0x45, 0x00]).await; // truncated

        use std::sync::atomic::Ordering;
        assert_eq!(stack.stats().packets_received.load(Ordering::Relaxed), 3);
        assert_eq!(stack.stats().parse_errors.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_unknown_protocol_dropped() {
        let (stack, _tun_rx) = test_stack();

        // take a valid UDP packet and rewrite the protocol byte to GRE
        let mut pkt = build_ipv4_udp(
            "10.0.0.2".parse().unwrap(),
            "1.1.1.1".parse().unwrap(),
            1000,
            2000,
            b"x",
        );
        pkt[9] = 47;
        pkt[10] = 0;
        pkt[11] = 0;
        let ck = crate::packet::checksum(&pkt[..20]);
        pkt[10..12].copy_from_slice(&ck.to_be_bytes());
        assert!(pp(&pkt).is_ok());

        stack.process_packet(&pkt).await;

        use std::sync::atomic::Ordering;
        assert_eq!(stack.stats().other_packets.load(Ordering::Relaxed), 1);
        assert_eq!(stack.tcp().flow_count(), 0);
        assert_eq!(stack.udp().session_count(), 0);
    }

    #[tokio::test]
    async fn test_icmp_echo_dispatched() {
        let (stack, mut tun_rx) = test_stack();

        let mut icmp = vec![8u8, 0, 0, 0, 0, 9, 0, 2, 0xCC];
        let ck = crate::packet::checksum(&icmp);
        icmp[2..4].copy_from_slice(&ck.to_be_bytes());
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        let total = (20 + icmp.len()) as u16;
        pkt[2..4].copy_from_slice(&total.to_be_bytes());
        pkt[8] = 64;
        pkt[9] = 1;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 2]);
        pkt[16..20].copy_from_slice(&[8, 8, 8, 8]);
        let ck = crate::packet::checksum(&pkt[..20]);
        pkt[10..12].copy_from_slice(&ck.to_be_bytes());
        pkt.extend_from_slice(&icmp);

        stack.process_packet(&pkt).await;

        let reply = tun_rx.recv().await.unwrap();
        let parsed = pp(&reply).unwrap();
        assert_eq!(parsed.src_addr.octets(), [8, 8, 8, 8]);
        assert_eq!(parsed.dst_addr.octets(), [10, 0, 0, 2]);
    }
}
