//! TCP flow engine.
//!
//! A userspace responder, not an RFC 793 implementation: it answers the
//! host's SYN immediately, acknowledges whatever contiguous payload the
//! host delivers, and replays relay bytes back as PSH+ACK segments. There
//! is no retransmission queue; a lost TUN write surfaces as a host
//! retransmission which is forwarded to the relay again.

use crate::packet::{TcpFlags, TcpInfo};
use crate::stats::TrafficCounters;
use crate::FlowKey;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use veiltun_protocol::{DestAddr, Tunnel, TunnelConfig};

#[derive(Debug, Clone)]
pub struct TcpFlowConfig {
    pub mss: u16,
    pub window: u16,
    /// Bound on the tunnel handshake, SYN to open WebSocket.
    pub connect_timeout: Duration,
    /// A flow with no traffic in either direction for this long is closed.
    pub idle_timeout: Duration,
    /// Host->tunnel pipe bound in chunks; at one MSS per chunk this is
    /// roughly the 64 KiB pre-connect buffer.
    pub pipe_chunks: usize,
}

impl Default for TcpFlowConfig {
    fn default() -> Self {
        Self {
            mss: crate::packet::DEFAULT_MSS,
            window: crate::packet::DEFAULT_WINDOW,
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            pipe_chunks: 48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    SynReceived,
    Established,
    Closed,
}

struct FlowState {
    phase: TcpPhase,
    /// Our ISN, kept for SYN-ACK replays.
    isn: u32,
    /// Sequence number of the next byte we emit toward the host.
    server_seq: u32,
    /// Highest contiguous byte received from the host, plus one.
    client_ack: u32,
    connected: bool,
    pipe_tx: Option<mpsc::Sender<Bytes>>,
}

pub struct TcpFlow {
    pub key: FlowKey,
    state: Mutex<FlowState>,
    last_active: Mutex<Instant>,
}

impl TcpFlow {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    pub fn phase(&self) -> TcpPhase {
        self.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn server_seq(&self) -> u32 {
        self.state.lock().server_seq
    }

    pub fn client_ack(&self) -> u32 {
        self.state.lock().client_ack
    }

    pub fn isn(&self) -> u32 {
        self.state.lock().isn
    }

    /// Queue host payload for the tunnel. The pipe is bounded; beyond the
    /// bound delivery is deferred to a waiter so the demultiplexer never
    /// blocks here.
    fn deliver_to_pipe(&self, data: Bytes) {
        let tx = self.state.lock().pipe_tx.clone();
        let Some(tx) = tx else {
            trace!("Flow pipe gone, dropping {} bytes", data.len());
            return;
        };
        match tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(data)) => {
                debug!("Flow pipe full, deferring {} bytes", data.len());
                tokio::spawn(async move {
                    let _ = tx.send(data).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Flow pipe closed, dropping payload");
            }
        }
    }
}

/// All live TCP flows plus the machinery to answer them.
pub struct TcpFlowTable {
    flows: DashMap<FlowKey, Arc<TcpFlow>>,
    config: TcpFlowConfig,
    tunnel_cfg: Arc<TunnelConfig>,
    tun_tx: mpsc::Sender<BytesMut>,
    counters: Arc<TrafficCounters>,
}

impl TcpFlowTable {
    pub fn new(
        config: TcpFlowConfig,
        tunnel_cfg: Arc<TunnelConfig>,
        tun_tx: mpsc::Sender<BytesMut>,
        counters: Arc<TrafficCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
            config,
            tunnel_cfg,
            tun_tx,
            counters,
        })
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.flows.get(key).map(|f| f.clone())
    }

    /// Entry point from the demultiplexer, one segment at a time.
    pub async fn handle_segment(self: &Arc<Self>, key: FlowKey, seg: &TcpInfo, payload: &[u8]) {
        if seg.flags.syn && !seg.flags.ack {
            self.handle_syn(key, seg).await;
            return;
        }

        let Some(flow) = self.flows.get(&key).map(|f| f.clone()) else {
            // Segments for unknown flows are dropped, not RST: after a
            // connect timeout the host must be left to give up on its own.
            trace!("No flow for segment {} -> {}", key.src, key.dst);
            return;
        };
        flow.touch();

        if seg.flags.rst {
            debug!("Host RST: {} -> {}", key.src, key.dst);
            self.remove(&key);
            return;
        }

        let mut deliver: Option<Bytes> = None;
        let mut reply: Option<(u32, u32, TcpFlags)> = None;
        let mut teardown = false;
        {
            let mut st = flow.state.lock();
            if st.phase == TcpPhase::Closed {
                return;
            }

            if !payload.is_empty() {
                let seq_end = seg.seq.wrapping_add(payload.len() as u32);
                if !seq_after(seq_end, st.client_ack) {
                    // full duplicate, just re-ACK
                } else if seq_after(seg.seq, st.client_ack) {
                    // gap; dup-ACK until the host retransmits the hole
                    trace!(
                        "Out-of-order segment seq={} expected={}, dropping",
                        seg.seq,
                        st.client_ack
                    );
                } else {
                    let skip = st.client_ack.wrapping_sub(seg.seq) as usize;
                    let fresh = &payload[skip..];
                    st.client_ack = st.client_ack.wrapping_add(fresh.len() as u32);
                    deliver = Some(Bytes::copy_from_slice(fresh));
                }
                reply = Some((st.server_seq, st.client_ack, TcpFlags::ack_only()));
            }

            if seg.flags.fin {
                st.client_ack = st.client_ack.wrapping_add(1);
                let seq = st.server_seq;
                st.server_seq = st.server_seq.wrapping_add(1);
                st.phase = TcpPhase::Closed;
                reply = Some((seq, st.client_ack, TcpFlags::fin_ack()));
                teardown = true;
            }
        }

        if let Some(data) = deliver {
            flow.deliver_to_pipe(data);
        }
        if let Some((seq, ack, flags)) = reply {
            self.write_segment(&key, seq, ack, flags, &[], None).await;
        }
        if teardown {
            debug!("Host FIN: {} -> {}", key.src, key.dst);
            self.remove(&key);
        }
    }

    async fn handle_syn(self: &Arc<Self>, key: FlowKey, seg: &TcpInfo) {
        if let Some(flow) = self.flows.get(&key).map(|f| f.clone()) {
            // retransmitted SYN: replay the SYN-ACK with the same ISN
            let (isn, ack) = {
                let st = flow.state.lock();
                (st.isn, st.client_ack)
            };
            self.write_segment(&key, isn, ack, TcpFlags::syn_ack(), &[], Some(self.config.mss))
                .await;
            return;
        }

        let IpAddr::V4(dst_ip) = key.dst.ip() else {
            return;
        };

        let isn: u32 = rand::random();
        let client_ack = seg.seq.wrapping_add(1);
        let (pipe_tx, pipe_rx) = mpsc::channel(self.config.pipe_chunks);

        let flow = Arc::new(TcpFlow {
            key,
            state: Mutex::new(FlowState {
                phase: TcpPhase::SynReceived,
                isn,
                server_seq: isn.wrapping_add(1),
                client_ack,
                connected: false,
                pipe_tx: Some(pipe_tx),
            }),
            last_active: Mutex::new(Instant::now()),
        });
        self.flows.insert(key, flow.clone());

        debug!("TCP SYN: {} -> {}", key.src, key.dst);

        // SYN-ACK before the tunnel exists. The host's connect() returns
        // and it starts transmitting; that data parks in the pipe until
        // the relay handshake lands.
        self.write_segment(&key, isn, client_ack, TcpFlags::syn_ack(), &[], Some(self.config.mss))
            .await;

        let table = self.clone();
        let dst = DestAddr::ipv4(dst_ip, key.dst.port());
        tokio::spawn(async move {
            table.run_flow(flow, dst, pipe_rx).await;
        });
    }

    /// Per-flow task: dial the relay, then pump host bytes into the
    /// tunnel until either side finishes.
    async fn run_flow(
        self: Arc<Self>,
        flow: Arc<TcpFlow>,
        dst: DestAddr,
        mut pipe_rx: mpsc::Receiver<Bytes>,
    ) {
        // whatever the host already delivered goes out fused with the
        // VLESS header in a single frame
        let mut early = BytesMut::new();
        while let Ok(chunk) = pipe_rx.try_recv() {
            early.extend_from_slice(&chunk);
        }
        let early_len = early.len();
        let early = if early.is_empty() {
            None
        } else {
            Some(early.freeze())
        };

        let connected = tokio::time::timeout(
            self.config.connect_timeout,
            Tunnel::connect(&self.tunnel_cfg, &dst, early),
        )
        .await;

        let tunnel = match connected {
            Ok(Ok(t)) => Arc::new(t),
            Ok(Err(e)) => {
                warn!("Tunnel connect failed for {}: {}", dst, e);
                self.remove(&flow.key);
                return;
            }
            Err(_) => {
                // buffered data is discarded with the pipe; no RST, the
                // host will time out on its own
                warn!("Tunnel connect timed out for {}", dst);
                self.remove(&flow.key);
                return;
            }
        };

        if early_len > 0 {
            self.counters.add_out(early_len);
        }

        let torn_down = {
            let mut st = flow.state.lock();
            if st.phase == TcpPhase::Closed {
                true
            } else {
                st.connected = true;
                st.phase = TcpPhase::Established;
                false
            }
        };
        if torn_down {
            // host gave up (FIN/RST) while we were dialing
            tunnel.close().await;
            return;
        }
        flow.touch();
        debug!("Flow established: {} -> {}", flow.key.src, dst);

        // tunnel -> host pump
        let downlink = {
            let table = self.clone();
            let flow = flow.clone();
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let mut stream = tunnel.recv_stream();
                while let Some(chunk) = stream.next().await {
                    table.counters.add_in(chunk.len());
                    table.emit_data(&flow, &chunk).await;
                }
                table.finish_flow(&flow).await;
            })
        };

        // host -> tunnel pump; ends when the flow is removed (pipe drop)
        while let Some(chunk) = pipe_rx.recv().await {
            let len = chunk.len();
            if let Err(e) = tunnel.send(&chunk).await {
                debug!("Tunnel send failed for {}: {}", dst, e);
                break;
            }
            self.counters.add_out(len);
            flow.touch();
        }

        tunnel.close().await;
        // the reader ends with the socket; the downlink pump then runs
        // flow teardown itself
        let _ = downlink.await;
    }

    /// Replay one relay chunk to the host as PSH+ACK segments of at most
    /// one MSS. The whole chunk's sequence range is claimed up front so
    /// segments of a chunk are never interleaved with another chunk's.
    async fn emit_data(&self, flow: &TcpFlow, data: &[u8]) {
        let (base_seq, ack) = {
            let mut st = flow.state.lock();
            if st.phase == TcpPhase::Closed {
                return;
            }
            let seq = st.server_seq;
            st.server_seq = st.server_seq.wrapping_add(data.len() as u32);
            (seq, st.client_ack)
        };
        flow.touch();

        let mut seq = base_seq;
        for chunk in data.chunks(self.config.mss as usize) {
            self.write_segment(&flow.key, seq, ack, TcpFlags::psh_ack(), chunk, None)
                .await;
            seq = seq.wrapping_add(chunk.len() as u32);
        }
    }

    /// Half-close toward the host after the relay side finished, then
    /// drop the flow.
    async fn finish_flow(&self, flow: &TcpFlow) {
        let reply = {
            let mut st = flow.state.lock();
            if st.phase == TcpPhase::Closed {
                None
            } else {
                let seq = st.server_seq;
                st.server_seq = st.server_seq.wrapping_add(1);
                st.phase = TcpPhase::Closed;
                Some((seq, st.client_ack))
            }
        };
        if let Some((seq, ack)) = reply {
            self.write_segment(&flow.key, seq, ack, TcpFlags::fin_ack(), &[], None)
                .await;
        }
        self.remove(&flow.key);
    }

    pub fn remove(&self, key: &FlowKey) {
        if let Some((_, flow)) = self.flows.remove(key) {
            let mut st = flow.state.lock();
            st.phase = TcpPhase::Closed;
            st.pipe_tx = None;
            debug!("TCP flow removed: {} -> {}", key.src, key.dst);
        }
    }

    /// Close flows with no traffic in either direction for the idle bound.
    pub async fn sweep_idle(&self) {
        let idle = self.config.idle_timeout;
        let expired: Vec<Arc<TcpFlow>> = self
            .flows
            .iter()
            .filter(|e| e.value().idle_for() > idle)
            .map(|e| e.value().clone())
            .collect();
        for flow in expired {
            debug!("TCP flow idle, closing: {} -> {}", flow.key.src, flow.key.dst);
            self.finish_flow(&flow).await;
        }
    }

    /// Supervisor stop: drop everything without synthesizing packets.
    pub fn close_all(&self) {
        let keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    async fn write_segment(
        &self,
        key: &FlowKey,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
        mss: Option<u16>,
    ) {
        // synthetic replies travel dst -> src
        let (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) = (key.dst.ip(), key.src.ip()) else {
            return;
        };
        let pkt = crate::packet::build_ipv4_tcp(
            src_ip,
            dst_ip,
            key.dst.port(),
            key.src.port(),
            seq,
            ack,
            flags,
            self.config.window,
            payload,
            mss,
        );
        if self.tun_tx.send(BytesMut::from(&pkt[..])).await.is_err() {
            warn!("TUN channel closed, segment dropped");
        }
    }
}

fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
