//! Lifecycle and stats publishing.
//!
//! `start` wires the TUN descriptor to the demultiplexer and hands the
//! bypass predicate to the tunnel layer; `stop` unwinds everything. Both
//! are idempotent. A failing flow never takes the supervisor down; the
//! only errors that surface from `start` are configuration and TUN
//! setup problems, raised before any traffic moves.

use crate::error::Result;
use crate::packet::DEFAULT_MTU;
use crate::stack::{PacketTunnel, StackConfig};
use crate::tun::TunDevice;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use veiltun_protocol::{BypassFn, TunnelConfig};

/// Cumulative `(bytes_in, bytes_out)` callback for the host UI.
pub type StatsSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub mtu: usize,
    pub stack: StackConfig,
    /// Cadence of the flow/session sweeper.
    pub sweep_interval: Duration,
    /// Cadence of stats pushes; a push only happens when counters moved.
    pub stats_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            stack: StackConfig::default(),
            sweep_interval: Duration::from_secs(30),
            stats_interval: Duration::from_secs(1),
        }
    }
}

struct Running {
    running: Arc<AtomicBool>,
    tun: TunDevice,
    stack: Arc<PacketTunnel>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns one engine instance end to end.
pub struct Supervisor {
    config: SupervisorConfig,
    inner: Mutex<Option<Running>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_config(SupervisorConfig::default())
    }

    pub fn with_config(config: SupervisorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Validate, wire up and go. A redundant start is ignored.
    ///
    /// Must be called from within a tokio runtime; the engine's tasks are
    /// spawned here.
    pub fn start(
        &self,
        tunnel_cfg: TunnelConfig,
        tun_fd: RawFd,
        bypass: BypassFn,
        stats_sink: StatsSink,
    ) -> Result<()> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            debug!("Supervisor already running, start ignored");
            return Ok(());
        }

        tunnel_cfg.validate().map_err(crate::error::NetStackError::Tunnel)?;
        veiltun_protocol::set_bypass(bypass);

        let mut tun = match TunDevice::from_raw_fd(tun_fd, self.config.mtu) {
            Ok(tun) => tun,
            Err(e) => {
                veiltun_protocol::clear_bypass();
                return Err(e);
            }
        };
        let tun_rx = tun
            .take_receiver()
            .expect("fresh TUN device always has a receiver");

        let stack = PacketTunnel::new(
            self.config.stack.clone(),
            Arc::new(tunnel_cfg),
            tun.sender(),
        );
        let running = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::new();

        // demultiplexer loop
        tasks.push(tokio::spawn(stack.clone().run(tun_rx, running.clone())));

        // flow/session sweeper
        {
            let stack = stack.clone();
            let running = running.clone();
            let interval = self.config.sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                while running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    stack.tcp().sweep_idle().await;
                    stack.udp().sweep();
                }
            }));
        }

        // stats publisher
        {
            let counters = stack.counters().clone();
            let running = running.clone();
            let interval = self.config.stats_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut last = (0u64, 0u64);
                while running.load(Ordering::Relaxed) {
                    ticker.tick().await;
                    let snapshot = counters.snapshot();
                    if snapshot != last {
                        last = snapshot;
                        stats_sink(snapshot.0, snapshot.1);
                    }
                }
            }));
        }

        *guard = Some(Running {
            running,
            tun,
            stack,
            tasks,
        });
        info!("veiltun supervisor started");
        Ok(())
    }

    /// Stop everything: flows, sessions, TUN tasks, bypass registration.
    /// A redundant stop is ignored.
    pub async fn stop(&self) {
        let taken = self.inner.lock().take();
        let Some(mut running) = taken else {
            debug!("Supervisor not running, stop ignored");
            return;
        };

        running.running.store(false, Ordering::Relaxed);
        running.stack.shutdown();
        running.tun.stop().await;
        for task in running.tasks {
            task.abort();
        }
        veiltun_protocol::clear_bypass();
        info!("veiltun supervisor stopped");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
