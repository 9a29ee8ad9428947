use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetStackError>;

/// Error type for the packet engine
#[derive(Error, Debug)]
pub enum NetStackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("TCP error: {0}")]
    TcpError(String),

    #[error("UDP error: {0}")]
    UdpError(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] veiltun_protocol::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Not running")]
    NotRunning,

    #[error("Unsupported: {0}")]
    Unsupported(String),
}
