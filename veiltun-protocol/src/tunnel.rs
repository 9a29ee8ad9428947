//! WebSocket tunnel carrying a single VLESS flow to the relay.
//!
//! One tunnel per TCP flow. The VLESS request frame is deferred until the
//! first payload so header and data leave in one WebSocket frame; some
//! relay implementations short-close a connection that delivers a bare
//! header. Inbound frames pass through a bounded queue with a timed offer
//! so a stalled consumer slows the relay down instead of wedging the
//! socket reader.

use crate::address::DestAddr;
use crate::bypass;
use crate::config::{self, Security, TunnelConfig};
use crate::error::{Error, Result};
use crate::tls;
use crate::vless::{self, VlessCommand};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Plain or TLS-wrapped relay connection underneath the WebSocket.
#[derive(Debug)]
pub enum TransportStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TransportStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TransportStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TransportStream>>;

#[derive(Debug)]
pub struct Tunnel {
    header: Vec<u8>,
    header_sent: AtomicBool,
    closed: AtomicBool,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    frames: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    reader_task: JoinHandle<()>,
    ping_task: JoinHandle<()>,
}

impl Tunnel {
    /// Dial the relay and perform the WebSocket handshake for one flow.
    ///
    /// The underlying socket is offered to the bypass predicate before
    /// connecting. With non-empty `early_data` the VLESS request frame and
    /// that data go out merged as one binary frame; otherwise header
    /// emission waits for the first `send`.
    pub async fn connect(
        cfg: &TunnelConfig,
        dst: &DestAddr,
        early_data: Option<Bytes>,
    ) -> Result<Tunnel> {
        let header = vless::build_request(&cfg.uuid, VlessCommand::Tcp, dst)?;

        let relay = format!("{}:{}", cfg.server, cfg.port);
        let stream = bypass::connect_bypassed(&relay, config::CONNECT_TIMEOUT)
            .await
            .map_err(|e| {
                Error::network_with_source(format!("Failed to connect to relay {}", relay), e)
            })?;
        stream.set_nodelay(true).ok();

        let transport = match cfg.security {
            Security::None => TransportStream::Plain(stream),
            Security::Tls => {
                let connector = tls::build_connector(cfg)?;
                let name = tls::server_name(cfg)?;
                let tls_stream =
                    tokio::time::timeout(config::CONNECT_TIMEOUT, connector.connect(name, stream))
                        .await
                        .map_err(|_| Error::timeout("TLS handshake timed out"))?
                        .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;
                TransportStream::Tls(Box::new(tls_stream))
            }
        };

        let request = upgrade_request(cfg)?;
        let (ws, _response) = tokio::time::timeout(
            config::CONNECT_TIMEOUT,
            tokio_tungstenite::client_async(request, transport),
        )
        .await
        .map_err(|_| Error::timeout("WebSocket handshake timed out"))?
        .map_err(|e| Error::network(format!("WebSocket handshake failed: {}", e)))?;

        debug!("WebSocket open to {} for {}", relay, dst);

        let (sink, source) = ws.split();
        let sink = Arc::new(tokio::sync::Mutex::new(sink));

        let (frame_tx, frame_rx) = mpsc::channel(config::FRAME_QUEUE_DEPTH);
        let reader_task = tokio::spawn(read_loop(source, frame_tx));
        let ping_task = tokio::spawn(ping_loop(sink.clone()));

        let tunnel = Tunnel {
            header,
            header_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sink,
            frames: parking_lot::Mutex::new(Some(frame_rx)),
            reader_task,
            ping_task,
        };

        match early_data {
            Some(data) if !data.is_empty() => tunnel.send(&data).await?,
            _ => {}
        }

        Ok(tunnel)
    }

    /// Send one payload chunk as a binary frame. The first call on a
    /// tunnel prepends the VLESS request header.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        // The flip happens under the sink lock so the request frame can
        // never be reordered behind a payload frame.
        let mut guard = self.sink.lock().await;
        let frame = if !self.header_sent.swap(true, Ordering::SeqCst) {
            let mut merged = Vec::with_capacity(self.header.len() + data.len());
            merged.extend_from_slice(&self.header);
            merged.extend_from_slice(data);
            merged
        } else {
            data.to_vec()
        };

        tokio::time::timeout(config::WRITE_TIMEOUT, guard.send(Message::Binary(frame.into())))
            .await
            .map_err(|_| Error::timeout("WebSocket write timed out"))?
            .map_err(|e| Error::network(format!("WebSocket write failed: {}", e)))?;
        Ok(())
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent.load(Ordering::SeqCst)
    }

    /// Take the inbound chunk stream. The first non-empty frame has its
    /// VLESS response prefix stripped. May be taken once; a second call
    /// yields an already-finished stream.
    pub fn recv_stream(&self) -> RecvStream {
        RecvStream {
            rx: self.frames.lock().take(),
            response_consumed: false,
        }
    }

    /// Orderly close (code 1000). Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if let Err(e) = guard.send(Message::Close(Some(frame))).await {
            trace!("WebSocket close failed: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.ping_task.abort();
    }
}

/// Finite stream of inbound payload chunks, in arrival order.
/// Ends on relay close, transport failure, or 30 s without a frame.
pub struct RecvStream {
    rx: Option<mpsc::Receiver<Bytes>>,
    response_consumed: bool,
}

impl RecvStream {
    pub async fn next(&mut self) -> Option<Bytes> {
        let rx = self.rx.as_mut()?;
        loop {
            let frame = match tokio::time::timeout(config::READ_IDLE_TIMEOUT, rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return None,
                Err(_) => {
                    debug!("Tunnel read idle, ending stream");
                    return None;
                }
            };

            if !self.response_consumed {
                self.response_consumed = true;
                match vless::strip_response(&frame) {
                    Ok(rest) if rest.is_empty() => continue,
                    Ok(rest) => return Some(Bytes::copy_from_slice(rest)),
                    Err(e) => {
                        warn!("Malformed VLESS response header: {}", e);
                        return None;
                    }
                }
            }
            return Some(frame);
        }
    }
}

async fn read_loop(mut source: WsSource, frame_tx: mpsc::Sender<Bytes>) {
    while let Some(msg) = source.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => Bytes::from(text.as_bytes().to_vec()),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!("Relay closed WebSocket");
                break;
            }
            Err(e) => {
                debug!("WebSocket read error: {}", e);
                break;
            }
        };

        if data.is_empty() {
            continue;
        }

        match frame_tx
            .send_timeout(data, config::FRAME_OFFER_TIMEOUT)
            .await
        {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!("Inbound frame queue full, dropping frame");
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => break,
        }
    }
}

async fn ping_loop(sink: Arc<tokio::sync::Mutex<WsSink>>) {
    let mut interval = tokio::time::interval(config::PING_INTERVAL);
    interval.tick().await; // consume the immediate first tick
    loop {
        interval.tick().await;
        let mut guard = sink.lock().await;
        if guard.send(Message::Ping(Bytes::new())).await.is_err() {
            trace!("Keepalive ping failed, stopping");
            break;
        }
    }
}

fn upgrade_request(cfg: &TunnelConfig) -> Result<Request> {
    let uri_str = format!(
        "{}://{}:{}{}",
        cfg.security.scheme(),
        cfg.ws_host,
        cfg.port,
        cfg.ws_path
    );
    let uri: Uri = uri_str
        .parse()
        .map_err(|e| Error::config(format!("Invalid WebSocket URI: {}", e)))?;

    Request::builder()
        .uri(uri)
        .header("Host", cfg.ws_host.as_str())
        .header("User-Agent", config::USER_AGENT)
        .header("Cache-Control", "no-cache")
        .header("Pragma", "no-cache")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_ws_key())
        .body(())
        .map_err(|e| Error::config(format!("Failed to build upgrade request: {}", e)))
}

fn generate_ws_key() -> String {
    use base64::Engine;
    let mut key = [0u8; 16];
    getrandom::fill(&mut key).ok();
    base64::engine::general_purpose::STANDARD.encode(key)
}
