//! End-to-end scenarios: a socketpair stands in for the TUN descriptor
//! and a local WebSocket server for the relay. Packets go in one side,
//! synthesized replies and relay frames are observed on the others.

#![cfg(unix)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixDatagram};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use veiltun_netstack::packet::{
    build_ipv4_tcp, build_ipv4_udp, checksum, parse_packet, TcpFlags, TcpInfo, TransportInfo,
};
use veiltun_netstack::Supervisor;
use veiltun_protocol::TunnelConfig;

const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const REMOTE: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

// each harness owns the process-global bypass registry for its lifetime
static HARNESS_LOCK: Mutex<()> = Mutex::new(());

struct Harness {
    supervisor: Supervisor,
    tun: UnixDatagram,
    relay_frames: mpsc::Receiver<Vec<u8>>,
    relay_push: mpsc::Sender<Vec<u8>>,
    stats: Arc<Mutex<Vec<(u64, u64)>>>,
    _guard: parking_lot::MutexGuard<'static, ()>,
}

async fn start_harness() -> Harness {
    let guard = HARNESS_LOCK.lock();

    // mock relay: records binary frames, forwards pushed ones
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::channel::<Vec<u8>>(64);
    let (push_tx, push_rx) = mpsc::channel::<Vec<u8>>(64);
    let push_rx = Arc::new(tokio::sync::Mutex::new(push_rx));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let seen_tx = seen_tx.clone();
            let push_rx = push_rx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                let mut push_rx = push_rx.lock().await;
                loop {
                    tokio::select! {
                        msg = source.next() => match msg {
                            Some(Ok(Message::Binary(data))) => {
                                if seen_tx.send(data.to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break,
                        },
                        frame = push_rx.recv() => match frame {
                            Some(data) => {
                                if sink.send(Message::Binary(data.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
    });

    // socketpair stands in for the TUN descriptor
    let (engine_side, test_side) =
        socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::DGRAM, None).unwrap();
    test_side.set_nonblocking(true).unwrap();
    let tun: std::os::unix::net::UnixDatagram = test_side.into();
    let tun = UnixDatagram::from_std(tun).unwrap();

    let mut cfg = TunnelConfig::new(
        "127.0.0.1",
        relay_addr.port(),
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
    );
    cfg.ws_path = "/tunnel".to_string();

    let stats = Arc::new(Mutex::new(Vec::new()));
    let stats_sink = stats.clone();

    let supervisor = Supervisor::new();
    supervisor
        .start(
            cfg,
            engine_side.as_raw_fd(),
            Arc::new(|_fd| true),
            Arc::new(move |bytes_in, bytes_out| {
                stats_sink.lock().push((bytes_in, bytes_out));
            }),
        )
        .unwrap();

    Harness {
        supervisor,
        tun,
        relay_frames: seen_rx,
        relay_push: push_tx,
        stats,
        _guard: guard,
    }
}

async fn recv_tun(tun: &UnixDatagram) -> Vec<u8> {
    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(5), tun.recv(&mut buf))
        .await
        .expect("no packet on TUN within 5s")
        .unwrap();
    buf.truncate(n);
    buf
}

fn tcp_of(pkt: &[u8]) -> TcpInfo {
    match parse_packet(pkt).unwrap().transport {
        TransportInfo::Tcp(t) => t,
        other => panic!("not TCP: {:?}", other),
    }
}

#[tokio::test]
async fn test_tcp_flow_end_to_end() {
    let mut h = start_harness().await;

    // scenario: SYN synthesis
    let syn = build_ipv4_tcp(
        HOST,
        REMOTE,
        51000,
        80,
        1000,
        0,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        65535,
        &[],
        Some(1460),
    );
    h.tun.send(&syn).await.unwrap();

    let syn_ack_pkt = recv_tun(&h.tun).await;
    let parsed = parse_packet(&syn_ack_pkt).unwrap();
    assert_eq!(parsed.src_addr, REMOTE);
    assert_eq!(parsed.dst_addr, HOST);
    let syn_ack = tcp_of(&syn_ack_pkt);
    assert_eq!(syn_ack.src_port, 80);
    assert_eq!(syn_ack.dst_port, 51000);
    assert_eq!(syn_ack.flags.to_byte(), 0x12);
    assert_eq!(syn_ack.ack, 1001);
    let server_isn = syn_ack.seq;

    // scenario: first-frame merge
    let payload = b"GET / HTTP/1.0\r\n\r\n";
    let data = build_ipv4_tcp(
        HOST,
        REMOTE,
        51000,
        80,
        1001,
        server_isn.wrapping_add(1),
        TcpFlags::psh_ack(),
        65535,
        payload,
        None,
    );
    h.tun.send(&data).await.unwrap();

    let ack_pkt = recv_tun(&h.tun).await;
    let ack = tcp_of(&ack_pkt);
    assert!(ack.flags.ack && !ack.flags.syn);
    assert_eq!(ack.ack, 1001 + payload.len() as u32);

    let frame = tokio::time::timeout(Duration::from_secs(5), h.relay_frames.recv())
        .await
        .expect("relay saw no frame")
        .unwrap();
    assert_eq!(frame.len(), 26 + payload.len());
    assert_eq!(frame[0], 0x00);
    assert_eq!(frame[17], 0x00);
    assert_eq!(frame[18], 0x01);
    assert_eq!(&frame[19..21], &[0x00, 0x50]);
    assert_eq!(frame[21], 0x01);
    assert_eq!(&frame[22..26], &[1, 2, 3, 4]);
    assert_eq!(&frame[26..], payload);

    // scenario: response strip
    h.relay_push
        .send(vec![0x00, 0x00, 0x48, 0x49, 0x21])
        .await
        .unwrap();

    let data_pkt = recv_tun(&h.tun).await;
    let seg = tcp_of(&data_pkt);
    assert!(seg.flags.psh && seg.flags.ack);
    assert_eq!(seg.seq, server_isn.wrapping_add(1));
    assert_eq!(seg.ack, 1001 + payload.len() as u32);
    assert_eq!(&data_pkt[seg.payload_offset..], &[0x48, 0x49, 0x21]);

    // stats follow relay payload only; synthetic packets are uncounted
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let last = *h.stats.lock().last().expect("no stats pushed");
    assert_eq!(last, (3, payload.len() as u64));

    h.supervisor.stop().await;
    h.supervisor.stop().await; // idempotent
    assert!(!h.supervisor.is_running());
}

#[tokio::test]
async fn test_icmp_echo_end_to_end() {
    let h = start_harness().await;

    let mut icmp = vec![8u8, 0, 0, 0, 0, 7, 0, 1, 0xAA, 0xBB];
    let ck = checksum(&icmp);
    icmp[2..4].copy_from_slice(&ck.to_be_bytes());
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    let total = (20 + icmp.len()) as u16;
    pkt[2..4].copy_from_slice(&total.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 1;
    pkt[12..16].copy_from_slice(&HOST.octets());
    pkt[16..20].copy_from_slice(&Ipv4Addr::new(8, 8, 8, 8).octets());
    let ck = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ck.to_be_bytes());
    pkt.extend_from_slice(&icmp);

    h.tun.send(&pkt).await.unwrap();

    let reply = recv_tun(&h.tun).await;
    let parsed = parse_packet(&reply).unwrap();
    assert_eq!(parsed.src_addr, Ipv4Addr::new(8, 8, 8, 8));
    assert_eq!(parsed.dst_addr, HOST);
    match parsed.transport {
        TransportInfo::Icmp(i) => {
            assert_eq!(i.icmp_type, 0);
            assert_eq!(i.ident, 7);
            assert_eq!(i.seq_no, 1);
        }
        other => panic!("not ICMP: {:?}", other),
    }
    assert_eq!(&reply[28..], &[0xAA, 0xBB]);
    assert_eq!(checksum(&reply[..20]), 0);
    assert_eq!(checksum(&reply[20..]), 0);

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_udp_dns_passthrough() {
    let h = start_harness().await;

    // local stand-in for a resolver
    let resolver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let resolver_addr = match resolver.local_addr().unwrap() {
        SocketAddr::V4(v4) => v4,
        other => panic!("unexpected: {}", other),
    };

    let query = [0x12u8, 0x34, 0x01, 0x00, 0x00, 0x01];
    let pkt = build_ipv4_udp(HOST, *resolver_addr.ip(), 55555, resolver_addr.port(), &query);
    h.tun.send(&pkt).await.unwrap();

    // the datagram leaves on a bypassed socket with the exact payload
    let mut buf = [0u8; 512];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), resolver.recv_from(&mut buf))
        .await
        .expect("resolver saw no query")
        .unwrap();
    assert_eq!(&buf[..n], &query);

    let answer = b"\x12\x34\x81\x80answer";
    resolver.send_to(answer, from).await.unwrap();

    // and the answer comes back as a synthesized packet to the host
    let reply = recv_tun(&h.tun).await;
    let parsed = parse_packet(&reply).unwrap();
    assert_eq!(parsed.src_addr, *resolver_addr.ip());
    assert_eq!(parsed.dst_addr, HOST);
    match parsed.transport {
        TransportInfo::Udp(u) => {
            assert_eq!(u.src_port, resolver_addr.port());
            assert_eq!(u.dst_port, 55555);
            assert_eq!(&reply[u.payload_offset..], answer);
        }
        other => panic!("not UDP: {:?}", other),
    }

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_host_fin_closes_flow() {
    let mut h = start_harness().await;

    let syn = build_ipv4_tcp(
        HOST,
        REMOTE,
        51001,
        443,
        5000,
        0,
        TcpFlags {
            syn: true,
            ..Default::default()
        },
        65535,
        &[],
        None,
    );
    h.tun.send(&syn).await.unwrap();
    let syn_ack = tcp_of(&recv_tun(&h.tun).await);

    // make sure the tunnel actually opened before tearing down
    let probe = build_ipv4_tcp(
        HOST, REMOTE, 51001, 443, 5001, syn_ack.seq.wrapping_add(1),
        TcpFlags::psh_ack(), 65535, b"x", None,
    );
    h.tun.send(&probe).await.unwrap();
    let _ack = recv_tun(&h.tun).await;
    let _frame = tokio::time::timeout(Duration::from_secs(5), h.relay_frames.recv())
        .await
        .expect("relay saw no frame")
        .unwrap();

    let fin = build_ipv4_tcp(
        HOST, REMOTE, 51001, 443, 5002, syn_ack.seq.wrapping_add(1),
        TcpFlags::fin_ack(), 65535, &[], None,
    );
    h.tun.send(&fin).await.unwrap();

    let fin_ack = tcp_of(&recv_tun(&h.tun).await);
    assert!(fin_ack.flags.fin && fin_ack.flags.ack);
    assert_eq!(fin_ack.ack, 5003);

    h.supervisor.stop().await;
}
