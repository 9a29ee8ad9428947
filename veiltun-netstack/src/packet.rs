//! IPv4 packet parsing and building.
//!
//! Parsing rides on smoltcp's wire types for header validation; emitted
//! packets are built by hand with the Internet checksum implemented here.
//! The TUN side of this engine is IPv4 only.

use crate::error::{NetStackError, Result};
use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_MSS: u16 = 1360;
pub const DEFAULT_WINDOW: u16 = 65535;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: IpProtocol,
    /// IPv4 header length in bytes (options included, never emitted back).
    pub header_len: usize,
    pub total_len: usize,
    pub transport: TransportInfo,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp(IcmpInfo),
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    /// Absolute offset of the TCP payload within the IP packet.
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub code: u8,
    pub ident: u16,
    pub seq_no: u16,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(IpAddr::V4(self.src_addr), t.src_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(IpAddr::V4(self.src_addr), u.src_port)),
            _ => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(IpAddr::V4(self.dst_addr), t.dst_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(IpAddr::V4(self.dst_addr), u.dst_port)),
            _ => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, TransportInfo::Tcp(t) if t.flags.syn && !t.flags.ack)
    }

    pub fn is_dns(&self) -> bool {
        matches!(&self.transport, TransportInfo::Udp(u) if u.dst_port == 53)
    }
}

/// Parse one IPv4 packet as read from the TUN.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(NetStackError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = (data[0] >> 4) & 0x0F;
    if version != 4 {
        return Err(NetStackError::InvalidIpVersion(version));
    }

    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("IPv4: {}", e)))?;

    let header_len = ((data[0] & 0x0F) as usize) * 4;
    let total_len = (pkt.total_len() as usize).min(data.len());
    let payload = pkt.payload();
    let protocol = pkt.next_header();
    let src_addr = pkt.src_addr();
    let dst_addr = pkt.dst_addr();

    let transport = parse_transport(protocol, header_len, payload)?;

    Ok(ParsedPacket {
        src_addr,
        dst_addr,
        protocol,
        header_len,
        total_len,
        transport,
    })
}

fn parse_transport(protocol: IpProtocol, ip_header_len: usize, payload: &[u8]) -> Result<TransportInfo> {
    match protocol {
        IpProtocol::Tcp => parse_tcp(ip_header_len, payload),
        IpProtocol::Udp => parse_udp(ip_header_len, payload),
        IpProtocol::Icmp => parse_icmp(payload),
        _ => Ok(TransportInfo::Other(protocol.into())),
    }
}

fn parse_tcp(ip_header_len: usize, data: &[u8]) -> Result<TransportInfo> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let mut mss = None;

    // walk the options for MSS; everything else is ignored
    if header_len > 20 && data.len() >= header_len {
        let opts = &data[20..header_len];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                2 if i + 4 <= opts.len() => {
                    mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 1 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    Ok(TransportInfo::Tcp(TcpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
        payload_offset: ip_header_len + header_len,
        payload_len: data.len().saturating_sub(header_len),
    }))
}

fn parse_udp(ip_header_len: usize, data: &[u8]) -> Result<TransportInfo> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| NetStackError::InvalidPacket(format!("UDP: {}", e)))?;

    Ok(TransportInfo::Udp(UdpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        payload_offset: ip_header_len + 8,
        payload_len: pkt.payload().len(),
    }))
}

fn parse_icmp(data: &[u8]) -> Result<TransportInfo> {
    if data.len() < 8 {
        return Err(NetStackError::PacketTooShort { expected: 8, actual: data.len() });
    }

    Ok(TransportInfo::Icmp(IcmpInfo {
        icmp_type: data[0],
        code: data[1],
        ident: u16::from_be_bytes([data[4], data[5]]),
        seq_no: u16::from_be_bytes([data[6], data[7]]),
    }))
}

/// Build an IPv4/TCP packet. The header is always 20 bytes except for the
/// 4-byte MSS option on SYN-bearing segments.
#[allow(clippy::too_many_arguments)]
pub fn build_ipv4_tcp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    use std::sync::atomic::{AtomicU16, Ordering};
    static IP_ID: AtomicU16 = AtomicU16::new(1);

    let tcp_opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_hdr_len = 20 + tcp_opts_len;
    let total_len = 20 + tcp_hdr_len + payload.len();

    let mut pkt = vec![0u8; total_len];

    // IPv4 header
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());

    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());

    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    pkt[8] = 64;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    // TCP header
    let tcp = 20;
    pkt[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    pkt[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    pkt[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
    pkt[tcp + 8..tcp + 12].copy_from_slice(&ack.to_be_bytes());
    pkt[tcp + 12] = ((tcp_hdr_len / 4) as u8) << 4;
    pkt[tcp + 13] = flags.to_byte();
    pkt[tcp + 14..tcp + 16].copy_from_slice(&window.to_be_bytes());

    if flags.syn {
        if let Some(mss_val) = mss {
            pkt[tcp + 20] = 2;
            pkt[tcp + 21] = 4;
            pkt[tcp + 22..tcp + 24].copy_from_slice(&mss_val.to_be_bytes());
        }
    }

    let payload_start = tcp + tcp_hdr_len;
    if !payload.is_empty() {
        pkt[payload_start..payload_start + payload.len()].copy_from_slice(payload);
    }

    let tcp_cksum = transport_checksum(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[tcp..]);
    pkt[tcp + 16..tcp + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt
}

/// Build an IPv4/UDP packet.
pub fn build_ipv4_udp(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 20 + 8 + payload.len();
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    let ip_cksum = checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    let udp_len = (8 + payload.len()) as u16;
    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&udp_len.to_be_bytes());

    if !payload.is_empty() {
        pkt[28..].copy_from_slice(payload);
    }

    let udp_cksum = udp_checksum(&src_ip.octets(), &dst_ip.octets(), &pkt[20..]);
    pkt[26..28].copy_from_slice(&udp_cksum.to_be_bytes());

    pkt
}

/// Synthesize an Echo Reply from an Echo Request packet: addresses
/// swapped, type zeroed, both checksums recomputed. Returns None for
/// anything that is not a well-formed type 8 request.
pub fn build_icmp_echo_reply(request: &[u8]) -> Option<Vec<u8>> {
    if request.len() < 20 || (request[0] >> 4) != 4 {
        return None;
    }
    let ihl = ((request[0] & 0x0F) as usize) * 4;
    let total_len = (u16::from_be_bytes([request[2], request[3]]) as usize).min(request.len());
    if total_len < ihl + 8 || request[9] != 1 || request[ihl] != 8 {
        return None;
    }

    let mut reply = request[..total_len].to_vec();

    let mut src = [0u8; 4];
    src.copy_from_slice(&reply[12..16]);
    reply.copy_within(16..20, 12);
    reply[16..20].copy_from_slice(&src);

    reply[ihl] = 0; // echo reply

    reply[ihl + 2] = 0;
    reply[ihl + 3] = 0;
    let icmp_cksum = checksum(&reply[ihl..]);
    reply[ihl + 2..ihl + 4].copy_from_slice(&icmp_cksum.to_be_bytes());

    reply[10] = 0;
    reply[11] = 0;
    let ip_cksum = checksum(&reply[..ihl]);
    reply[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    Some(reply)
}

/// Internet checksum: ones-complement sum of big-endian 16-bit words, an
/// odd trailing byte padded with zero on the right, carries folded back,
/// final complement.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Transport checksum over the standard pseudo-header
/// `(src, dst, 0, protocol, length)` followed by the segment.
pub fn transport_checksum(src: &[u8; 4], dst: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = 0u32;
    sum = sum.wrapping_add(((src[0] as u32) << 8) | src[1] as u32);
    sum = sum.wrapping_add(((src[2] as u32) << 8) | src[3] as u32);
    sum = sum.wrapping_add(((dst[0] as u32) << 8) | dst[1] as u32);
    sum = sum.wrapping_add(((dst[2] as u32) << 8) | dst[3] as u32);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn udp_checksum(src: &[u8; 4], dst: &[u8; 4], udp: &[u8]) -> u16 {
    let cksum = transport_checksum(src, dst, 17, udp);
    // an all-zero UDP checksum means "none"; transmit 0xFFFF instead
    if cksum == 0 { 0xFFFF } else { cksum }
}
