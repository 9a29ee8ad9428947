//! VLESS v0 request/response framing.
//!
//! The request header is prepended to the first client-to-server payload;
//! the response prefix arrives at the head of the first server-to-client
//! frame and carries no information this client uses beyond its length.

use crate::address::DestAddr;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use uuid::Uuid;

pub const VLESS_VERSION: u8 = 0x00;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlessCommand {
    Tcp = 0x01,
    Udp = 0x02,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlessAddressType {
    Ipv4 = 0x01,
    Domain = 0x02,
    Ipv6 = 0x03,
}

/// Build the request header for a flow.
///
/// Layout: version(1) + uuid(16) + addon_len(1, zero) + command(1) +
/// port(2, BE) + address_type(1) + address. Always at least 22 bytes.
pub fn build_request(uuid: &Uuid, command: VlessCommand, dst: &DestAddr) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);

    buf.push(VLESS_VERSION);
    buf.extend_from_slice(uuid.as_bytes());
    buf.push(0x00); // no addons
    buf.push(command as u8);
    buf.extend_from_slice(&dst.port().to_be_bytes());
    write_address(&mut buf, dst)?;

    Ok(buf)
}

fn write_address(buf: &mut Vec<u8>, dst: &DestAddr) -> Result<()> {
    match dst {
        DestAddr::Domain(domain, _) => {
            if domain.is_empty() || domain.len() > 255 {
                return Err(Error::protocol(format!(
                    "Domain name length {} out of range",
                    domain.len()
                )));
            }
            buf.push(VlessAddressType::Domain as u8);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
        DestAddr::Ip(addr) => match addr {
            SocketAddr::V4(v4) => {
                buf.push(VlessAddressType::Ipv4 as u8);
                buf.extend_from_slice(&v4.ip().octets());
            }
            SocketAddr::V6(v6) => {
                buf.push(VlessAddressType::Ipv6 as u8);
                buf.extend_from_slice(&v6.ip().octets());
            }
        },
    }
    Ok(())
}

/// Strip the response prefix from the first inbound frame and return the
/// remaining payload.
///
/// The prefix is version(1) + addon_len(1) + addons; the full
/// `2 + addon_len` bytes are discarded, never a fixed two.
pub fn strip_response(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 2 {
        return Err(Error::protocol(format!(
            "Response header truncated: {} bytes",
            frame.len()
        )));
    }
    if frame[0] != VLESS_VERSION {
        return Err(Error::protocol(format!(
            "Unexpected response version {:#04x}",
            frame[0]
        )));
    }
    let skip = 2 + frame[1] as usize;
    if frame.len() < skip {
        return Err(Error::protocol(format!(
            "Response addons truncated: need {}, have {}",
            skip,
            frame.len()
        )));
    }
    Ok(&frame[skip..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn test_uuid() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn test_request_layout_ipv4() {
        let dst = DestAddr::ipv4(Ipv4Addr::new(1, 2, 3, 4), 80);
        let hdr = build_request(&test_uuid(), VlessCommand::Tcp, &dst).unwrap();

        assert_eq!(hdr.len(), 26);
        assert_eq!(hdr[0], 0x00);
        assert_eq!(&hdr[1..17], test_uuid().as_bytes());
        assert_eq!(hdr[17], 0x00);
        assert_eq!(hdr[18], 0x01);
        assert_eq!(&hdr[19..21], &[0x00, 0x50]);
        assert_eq!(hdr[21], 0x01);
        assert_eq!(&hdr[22..26], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_request_layout_domain() {
        let dst = DestAddr::Domain("example.com".to_string(), 443);
        let hdr = build_request(&test_uuid(), VlessCommand::Tcp, &dst).unwrap();

        assert_eq!(hdr[21], 0x02);
        assert_eq!(hdr[22], 11);
        assert_eq!(&hdr[23..34], b"example.com");
        assert_eq!(hdr.len(), 23 + 11);
    }

    #[test]
    fn test_request_layout_ipv6() {
        let dst = DestAddr::ipv6(Ipv6Addr::LOCALHOST, 53);
        let hdr = build_request(&test_uuid(), VlessCommand::Tcp, &dst).unwrap();

        assert_eq!(hdr[21], 0x03);
        assert_eq!(hdr.len(), 22 + 16);
        assert_eq!(hdr[22 + 15], 1);
    }

    #[test]
    fn test_request_udp_command() {
        let dst = DestAddr::ipv4(Ipv4Addr::new(8, 8, 8, 8), 53);
        let hdr = build_request(&test_uuid(), VlessCommand::Udp, &dst).unwrap();
        assert_eq!(hdr[18], 0x02);
    }

    #[test]
    fn test_request_rejects_oversized_domain() {
        let dst = DestAddr::Domain("a".repeat(256), 80);
        assert!(build_request(&test_uuid(), VlessCommand::Tcp, &dst).is_err());
    }

    #[test]
    fn test_strip_response_no_addons() {
        let frame = [0x00, 0x00, 0x48, 0x49, 0x21];
        assert_eq!(strip_response(&frame).unwrap(), &[0x48, 0x49, 0x21]);
    }

    #[test]
    fn test_strip_response_with_addons() {
        let frame = [0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x01, 0x02];
        assert_eq!(strip_response(&frame).unwrap(), &[0x01, 0x02]);
    }

    #[test]
    fn test_strip_response_header_only() {
        let frame = [0x00, 0x00];
        assert_eq!(strip_response(&frame).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn test_strip_response_truncated() {
        assert!(strip_response(&[0x00]).is_err());
        assert!(strip_response(&[0x00, 0x05, 0x01]).is_err());
    }

    #[test]
    fn test_strip_response_bad_version() {
        assert!(strip_response(&[0x01, 0x00, 0xFF]).is_err());
    }
}
