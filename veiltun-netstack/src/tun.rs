//! TUN descriptor I/O.
//!
//! The platform hands us a raw descriptor where one read is one IPv4
//! packet and one write sends one. The descriptor is duplicated so the
//! platform keeps ownership of the original. A single writer task owns
//! the write side; synthesized packets from every flow funnel through
//! its channel, which keeps packet boundaries intact without a lock.

use crate::error::{NetStackError, Result};
use bytes::BytesMut;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct TunDevice {
    tx: mpsc::Sender<BytesMut>,
    rx: Option<mpsc::Receiver<BytesMut>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<AtomicBool>,
}

impl TunDevice {
    /// Wrap a raw TUN descriptor in async read/write tasks.
    pub fn from_raw_fd(fd: RawFd, mtu: usize) -> Result<Self> {
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(NetStackError::Io(std::io::Error::last_os_error()));
        }

        // AsyncFd needs the descriptor non-blocking
        let flags = unsafe { libc::fcntl(dup_fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(dup_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(dup_fd) };
            return Err(NetStackError::Io(err));
        }

        // SAFETY: dup_fd is a valid descriptor we own
        let file = unsafe { std::fs::File::from_raw_fd(dup_fd) };
        let async_fd = AsyncFd::new(file)?;

        let (tx_to_tun, mut rx_from_stack) = mpsc::channel::<BytesMut>(4096);
        let (tx_to_stack, rx_from_tun) = mpsc::channel::<BytesMut>(4096);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_task = running.clone();

        tokio::spawn(async move {
            use std::io::{Read, Write};
            let mut read_buf = vec![0u8; mtu];
            debug!("TUN I/O task started (fd={})", dup_fd);

            loop {
                tokio::select! {
                    readable = async_fd.readable() => {
                        let mut guard = match readable {
                            Ok(g) => g,
                            Err(e) => {
                                error!("TUN readable error: {}", e);
                                break;
                            }
                        };
                        match guard.try_io(|inner| inner.get_ref().read(&mut read_buf)) {
                            Ok(Ok(n)) if n > 0 => {
                                let packet = BytesMut::from(&read_buf[..n]);
                                if tx_to_stack.send(packet).await.is_err() {
                                    debug!("Stack receiver dropped");
                                    break;
                                }
                            }
                            Ok(Ok(_)) => {
                                info!("TUN read EOF");
                                break;
                            }
                            Ok(Err(e)) => {
                                if e.kind() != std::io::ErrorKind::WouldBlock {
                                    error!("TUN read error: {}", e);
                                    break;
                                }
                            }
                            Err(_would_block) => continue,
                        }
                    }
                    packet = rx_from_stack.recv() => {
                        let Some(packet) = packet else { break };
                        let mut guard = match async_fd.writable().await {
                            Ok(g) => g,
                            Err(e) => {
                                error!("TUN writable error: {}", e);
                                break;
                            }
                        };
                        match guard.try_io(|inner| inner.get_ref().write(&packet)) {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                // the flow may desynchronize and idle out;
                                // the engine keeps going
                                warn!("TUN write error: {}", e);
                            }
                            Err(_would_block) => {
                                warn!("TUN write would block, packet dropped");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("TUN shutdown requested");
                        break;
                    }
                }
            }

            running_task.store(false, Ordering::Relaxed);
            debug!("TUN I/O task stopped");
        });

        Ok(Self {
            tx: tx_to_tun,
            rx: Some(rx_from_tun),
            shutdown_tx: Some(shutdown_tx),
            running,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Write side shared by every flow task.
    pub fn sender(&self) -> mpsc::Sender<BytesMut> {
        self.tx.clone()
    }

    /// Packet stream for the demultiplexer. Yields once.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<BytesMut>> {
        self.rx.take()
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[tokio::test]
    async fn test_socketpair_read_write() {
        let (ours, theirs) =
            socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::DGRAM, None).unwrap();
        theirs.set_nonblocking(true).unwrap();
        let theirs: std::os::unix::net::UnixDatagram = theirs.into();
        let theirs = tokio::net::UnixDatagram::from_std(theirs).unwrap();

        let mut tun = TunDevice::from_raw_fd(ours.as_raw_fd(), 1500).unwrap();
        let mut rx = tun.take_receiver().unwrap();

        // inbound: a "packet" written by the platform side shows up on
        // the read channel
        theirs.send(b"\x45inbound").await.unwrap();
        let pkt = rx.recv().await.unwrap();
        assert_eq!(&pkt[..], b"\x45inbound");

        // outbound: a packet sent through the writer task reaches the
        // platform side intact
        tun.sender()
            .send(BytesMut::from(&b"\x45outbound"[..]))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = theirs.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x45outbound");

        tun.stop().await;
    }

    #[tokio::test]
    async fn test_original_fd_survives_device() {
        let (ours, theirs) =
            socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::DGRAM, None).unwrap();

        let mut tun = TunDevice::from_raw_fd(ours.as_raw_fd(), 1500).unwrap();
        tun.stop().await;
        drop(tun);

        // the caller's descriptor was duplicated, not consumed
        ours.send(b"still alive").unwrap();
        let mut buf = [std::mem::MaybeUninit::uninit(); 32];
        let n = theirs.recv(&mut buf).unwrap();
        assert_eq!(n, 11);
    }
}
