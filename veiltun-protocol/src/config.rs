use crate::error::{Error, Result};
use std::time::Duration;
use uuid::Uuid;

/// Transport security for the WebSocket connection to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
}

impl Security {
    pub fn scheme(self) -> &'static str {
        match self {
            Security::None => "ws",
            Security::Tls => "wss",
        }
    }
}

/// Relay endpoint configuration. Immutable after the supervisor starts.
///
/// The host environment constructs this from whatever profile store it
/// keeps; this crate never reads files or URIs.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Relay hostname or IP literal.
    pub server: String,
    /// Relay port, 1..=65535.
    pub port: u16,
    /// VLESS user identity.
    pub uuid: Uuid,
    /// Absolute WebSocket path, must begin with '/'.
    pub ws_path: String,
    /// HTTP Host header value; may differ from `server` for CDN fronting.
    pub ws_host: String,
    pub security: Security,
    /// TLS server name, required when `security` is `Tls`.
    pub sni: String,
    /// When false the certificate chain and hostname are not checked.
    pub verify_tls: bool,
}

impl TunnelConfig {
    pub fn new(server: impl Into<String>, port: u16, uuid: Uuid) -> Self {
        let server = server.into();
        Self {
            ws_host: server.clone(),
            server,
            port,
            uuid,
            ws_path: "/".to_string(),
            security: Security::None,
            sni: String::new(),
            verify_tls: true,
        }
    }

    /// Reject configurations that cannot produce a working tunnel.
    /// Called before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("Missing relay server address"));
        }
        if self.port == 0 {
            return Err(Error::config("Relay port must be 1-65535"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(Error::config(format!(
                "WebSocket path must be absolute, got '{}'",
                self.ws_path
            )));
        }
        if self.ws_host.is_empty() {
            return Err(Error::config("Missing WebSocket Host header value"));
        }
        if self.security == Security::Tls && self.sni.is_empty() {
            return Err(Error::config("TLS enabled but SNI is empty"));
        }
        Ok(())
    }
}

/// Fixed client timeouts for the WebSocket tunnel.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Inbound frame queue bound and the timed-offer window before a frame
/// is dropped under backpressure.
pub const FRAME_QUEUE_DEPTH: usize = 1000;
pub const FRAME_OFFER_TIMEOUT: Duration = Duration::from_millis(100);

/// Browser-like User-Agent presented during the upgrade request.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
