//! UDP session table.
//!
//! Datagrams do not ride the VLESS tunnel; each 4-tuple gets its own
//! bypassed outbound socket and a receive loop that wraps replies back
//! into synthesized packets for the TUN. Sessions die by idling out.

use crate::packet::build_ipv4_udp;
use crate::stats::TrafficCounters;
use crate::FlowKey;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use veiltun_protocol::bypass;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Sessions idle beyond this are reaped by the sweeper.
    pub idle_timeout: Duration,
    /// Socket read timeout per receive-loop iteration.
    pub read_timeout: Duration,
    pub mtu: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(5),
            mtu: crate::packet::DEFAULT_MTU,
        }
    }
}

pub struct UdpSession {
    pub key: FlowKey,
    socket: Arc<tokio::net::UdpSocket>,
    last_active: Mutex<Instant>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

pub struct UdpSessionTable {
    sessions: DashMap<FlowKey, Arc<UdpSession>>,
    config: UdpConfig,
    tun_tx: mpsc::Sender<BytesMut>,
    counters: Arc<TrafficCounters>,
}

impl UdpSessionTable {
    pub fn new(
        config: UdpConfig,
        tun_tx: mpsc::Sender<BytesMut>,
        counters: Arc<TrafficCounters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            config,
            tun_tx,
            counters,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// One host-to-network datagram.
    pub async fn handle_datagram(self: &Arc<Self>, key: FlowKey, payload: &[u8]) {
        if key.dst.port() == 53 {
            debug!(kind = "dns", "UDP datagram: {} -> {}", key.src, key.dst);
        }

        let session = match self.get_or_create(key) {
            Ok(s) => s,
            Err(e) => {
                warn!("UDP session setup failed for {} -> {}: {}", key.src, key.dst, e);
                return;
            }
        };
        session.touch();

        match session.socket.send_to(payload, key.dst).await {
            Ok(_) => self.counters.add_out(payload.len()),
            Err(e) => debug!("UDP send failed: {} -> {}: {}", key.src, key.dst, e),
        }
    }

    fn get_or_create(self: &Arc<Self>, key: FlowKey) -> io::Result<Arc<UdpSession>> {
        if let Some(session) = self.sessions.get(&key) {
            return Ok(session.clone());
        }

        let std_socket = bypass::bind_bypassed_udp()?;
        let socket = Arc::new(tokio::net::UdpSocket::from_std(std_socket)?);

        let session = Arc::new(UdpSession {
            key,
            socket,
            last_active: Mutex::new(Instant::now()),
            task: Mutex::new(None),
        });
        self.sessions.insert(key, session.clone());
        debug!("UDP session created: {} -> {}", key.src, key.dst);

        let handle = tokio::spawn(self.clone().recv_loop(session.clone()));
        *session.task.lock() = Some(handle);

        Ok(session)
    }

    async fn recv_loop(self: Arc<Self>, session: Arc<UdpSession>) {
        let (IpAddr::V4(host_ip), IpAddr::V4(peer_ip)) =
            (session.key.src.ip(), session.key.dst.ip())
        else {
            return;
        };
        let mut buf = vec![0u8; self.config.mtu.saturating_sub(28)];

        loop {
            match tokio::time::timeout(self.config.read_timeout, session.socket.recv_from(&mut buf))
                .await
            {
                Ok(Ok((n, _from))) => {
                    session.touch();
                    // the reply claims the original destination as source
                    let pkt = build_ipv4_udp(
                        peer_ip,
                        host_ip,
                        session.key.dst.port(),
                        session.key.src.port(),
                        &buf[..n],
                    );
                    self.counters.add_in(n);
                    if self.tun_tx.send(BytesMut::from(&pkt[..])).await.is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!("UDP recv error: {} -> {}: {}", session.key.src, session.key.dst, e);
                    break;
                }
                Err(_) => {
                    // idle tick; expiry is the sweeper's call, but bail if
                    // the session is already gone from the table
                    if !self.sessions.contains_key(&session.key) {
                        break;
                    }
                }
            }
        }
        trace!("UDP recv loop ended: {} -> {}", session.key.src, session.key.dst);
    }

    /// Reap sessions idle for longer than the configured bound.
    pub fn sweep(&self) {
        let idle = self.config.idle_timeout;
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > idle)
            .map(|e| *e.key())
            .collect();
        for key in expired {
            debug!("UDP session idle, closing: {} -> {}", key.src, key.dst);
            self.remove(&key);
        }
    }

    pub fn remove(&self, key: &FlowKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            if let Some(task) = session.task.lock().take() {
                task.abort();
            }
        }
    }

    /// Supervisor stop: close every session.
    pub fn clear(&self) {
        let keys: Vec<FlowKey> = self.sessions.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.remove(&key);
        }
    }
}
