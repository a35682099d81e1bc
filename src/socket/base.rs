//! Base socket: one WebSocket connection.
//!
//! Owns the framing loop for a single connection. Two long-lived tasks run
//! per socket: the *read pump* (frames in, heartbeat recording, control-frame
//! replies) and the *heartbeat watchdog* (liveness pings, dead-peer close).
//! All writes funnel through one async mutex so frames from concurrent
//! senders never interleave on the wire.
//!
//! # Close Lifecycle
//!
//! The socket moves `OPEN → CLOSED` exactly once. The first of local
//! `close()`, a peer close frame, a read error, a pump-internal write error,
//! or a watchdog liveness failure wins the transition; the close hook fires
//! exactly once and no message or error hook fires afterwards.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{WebSocketStream, client_async};
use tracing::{debug, error, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::message::{MessageKind, PreparedMessage};

// ============================================================================
// Constants
// ============================================================================

/// Watchdog wake interval; also the idle threshold before a ping is sent.
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Idle threshold after which the peer is considered dead.
const HEARTBEAT_DEAD_AFTER: Duration = Duration::from_secs(20);

/// Timeout for the full dial (TCP connect, TLS, WebSocket handshake).
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for a local, orderly shutdown.
pub(crate) const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the peer's close frame carried no payload.
pub(crate) const CLOSE_NO_STATUS: u16 = 1005;

/// Close code for any read or write failure on an established socket.
pub(crate) const CLOSE_INTERNAL_ERROR: u16 = 1011;

// ============================================================================
// Types
// ============================================================================

/// Byte stream under the WebSocket framing: plain TCP or a TLS session.
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> RawStream for T {}

/// The unified WebSocket stream type used by every layer.
pub(crate) type WsStream = WebSocketStream<Box<dyn RawStream>>;

type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Event hooks of a base socket.
///
/// Wired by the layer above before the pumps start, so no event can race
/// past an unset hook.
pub(crate) struct SocketHooks {
    /// Inbound data frame (text or binary).
    pub on_message: Box<dyn Fn(MessageKind, Bytes) + Send + Sync>,
    /// Transport failure on the established connection.
    pub on_error: Box<dyn Fn(&Error) + Send + Sync>,
    /// Terminal close; fires exactly once per socket.
    pub on_close: Box<dyn Fn(u16, &str) + Send + Sync>,
}

// ============================================================================
// Heartbeat Policy
// ============================================================================

/// Watchdog decision for one tick, from the idle time since the last
/// inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatAction {
    /// Peer was heard from recently; nothing to do.
    Idle,
    /// Peer is quiet; probe it with a ping.
    Ping,
    /// Peer is dead; close the socket.
    Terminate,
}

impl HeartbeatAction {
    pub(crate) fn decide(elapsed: Duration) -> Self {
        if elapsed >= HEARTBEAT_DEAD_AFTER {
            Self::Terminate
        } else if elapsed >= HEARTBEAT_CHECK_INTERVAL {
            Self::Ping
        } else {
            Self::Idle
        }
    }
}

// ============================================================================
// BaseSocket
// ============================================================================

/// One WebSocket connection with serialized writes and liveness tracking.
pub(crate) struct BaseSocket {
    /// Connection label for logs (the URL on the client side, the peer
    /// address on the server side).
    label: String,
    writer: AsyncMutex<WsSink>,
    /// Held until `start` hands the reader to the pump.
    reader: Mutex<Option<WsSource>>,
    last_heartbeat: Mutex<Instant>,
    closed: AtomicBool,
    /// Wakes the read pump when the close transition happens elsewhere.
    close_notify: Notify,
    hooks: OnceLock<SocketHooks>,
}

impl BaseSocket {
    /// Wraps an established WebSocket stream. The pumps do not run until
    /// [`start`](Self::start) is called with the event hooks.
    pub(crate) fn new(stream: WsStream, label: impl Into<String>) -> Arc<Self> {
        let (sink, source) = stream.split();

        Arc::new(Self {
            label: label.into(),
            writer: AsyncMutex::new(sink),
            reader: Mutex::new(Some(source)),
            last_heartbeat: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            hooks: OnceLock::new(),
        })
    }

    /// Installs the event hooks and spawns the read pump and the watchdog.
    ///
    /// Must be called exactly once, before any traffic is expected.
    pub(crate) fn start(self: &Arc<Self>, hooks: SocketHooks) {
        if self.hooks.set(hooks).is_err() {
            debug!(label = %self.label, "socket already started");
            return;
        }

        let pump = Arc::clone(self);
        tokio::spawn(async move { pump.read_pump().await });

        let watchdog = Arc::clone(self);
        tokio::spawn(async move { watchdog.heartbeat_watchdog().await });
    }

    /// Returns `true` once the close transition has happened.
    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// BaseSocket - Sending
// ============================================================================

impl BaseSocket {
    /// Sends a text frame.
    pub(crate) async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.write_frame(Message::Text(Utf8Bytes::from(text.into())))
            .await
    }

    /// JSON-encodes `value` and sends it as a text frame.
    pub(crate) async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.write_frame(Message::Text(Utf8Bytes::from(encoded)))
            .await
    }

    /// Sends a pre-encoded frame without re-serializing.
    pub(crate) async fn send_prepared(&self, prepared: &PreparedMessage) -> Result<()> {
        self.write_frame(prepared.to_frame()).await
    }

    /// Writes one frame under the write mutex.
    async fn write_frame(&self, frame: Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(Error::from)
    }

    /// Closes the connection and marks the socket closed with a normal
    /// closure. Idempotent.
    pub(crate) async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("Normal Closure"),
                })))
                .await;
            let _ = writer.close().await;
        }

        self.mark_closed(CLOSE_NORMAL, "Normal Closure");
    }
}

// ============================================================================
// BaseSocket - Close Lifecycle
// ============================================================================

impl BaseSocket {
    /// Performs the one-time `OPEN → CLOSED` transition.
    ///
    /// The first caller wins and emits the close hook; later callers are
    /// no-ops.
    pub(crate) fn mark_closed(&self, code: u16, reason: &str) {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if !won {
            trace!(label = %self.label, "socket already marked as closed");
            return;
        }

        debug!(label = %self.label, code, reason, "socket closed");
        self.close_notify.notify_one();

        if let Some(hooks) = self.hooks.get() {
            (hooks.on_close)(code, reason);
        }
    }

    fn emit_message(&self, kind: MessageKind, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        if let Some(hooks) = self.hooks.get() {
            (hooks.on_message)(kind, payload);
        }
    }

    fn emit_error(&self, err: &Error) {
        if self.is_closed() {
            return;
        }
        if let Some(hooks) = self.hooks.get() {
            (hooks.on_error)(err);
        }
    }
}

// ============================================================================
// BaseSocket - Read Pump
// ============================================================================

impl BaseSocket {
    async fn read_pump(self: Arc<Self>) {
        let Some(mut reader) = self.reader.lock().take() else {
            warn!(label = %self.label, "read pump started twice");
            return;
        };

        loop {
            if self.is_closed() {
                return;
            }

            tokio::select! {
                () = self.close_notify.notified() => return,

                frame = reader.next() => match frame {
                    Some(Ok(message)) => self.handle_frame(message),

                    Some(Err(err)) => {
                        if self.is_closed() {
                            return;
                        }
                        error!(label = %self.label, error = %err, "error reading message");
                        let wrapped = Error::from(err);
                        self.emit_error(&wrapped);
                        self.mark_closed(CLOSE_INTERNAL_ERROR, &wrapped.to_string());
                        return;
                    }

                    None => {
                        if self.is_closed() {
                            return;
                        }
                        let err = Error::transport("connection dropped");
                        self.emit_error(&err);
                        self.mark_closed(CLOSE_INTERNAL_ERROR, "connection dropped");
                        return;
                    }
                },
            }
        }
    }

    fn handle_frame(&self, message: Message) {
        self.record_heartbeat();

        match message {
            Message::Text(text) => {
                trace!(label = %self.label, len = text.len(), "text frame");
                self.emit_message(MessageKind::Text, Bytes::from(text));
            }

            Message::Binary(data) => {
                trace!(label = %self.label, len = data.len(), "binary frame");
                self.emit_message(MessageKind::Binary, data);
            }

            Message::Ping(_) => {
                // The protocol layer queues the echoing pong; it goes out on
                // the pump's next poll.
                trace!(label = %self.label, "ping received");
            }

            Message::Pong(_) => {
                trace!(label = %self.label, "pong received");
            }

            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
                self.mark_closed(code, &reason);
            }

            // Raw frames only appear when manual fragmentation is enabled.
            Message::Frame(_) => {}
        }
    }

    fn record_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }
}

// ============================================================================
// BaseSocket - Heartbeat Watchdog
// ============================================================================

impl BaseSocket {
    async fn heartbeat_watchdog(self: Arc<Self>) {
        let start = tokio::time::Instant::now() + HEARTBEAT_CHECK_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, HEARTBEAT_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if self.is_closed() {
                trace!(label = %self.label, "watchdog exiting, socket closed");
                return;
            }

            let elapsed = self.last_heartbeat.lock().elapsed();
            match HeartbeatAction::decide(elapsed) {
                HeartbeatAction::Idle => {}

                HeartbeatAction::Ping => {
                    if let Err(err) = self.send_ping().await {
                        error!(label = %self.label, error = %err, "error sending ping");
                        self.emit_error(&err);
                        self.mark_closed(CLOSE_INTERNAL_ERROR, &err.to_string());
                        return;
                    }
                    trace!(label = %self.label, "ping sent");
                }

                HeartbeatAction::Terminate => {
                    warn!(
                        label = %self.label,
                        idle_secs = elapsed.as_secs(),
                        "no heartbeat detected, terminating socket"
                    );
                    {
                        let mut writer = self.writer.lock().await;
                        let _ = writer.close().await;
                    }
                    self.mark_closed(CLOSE_INTERNAL_ERROR, "heartbeat timeout");
                    return;
                }
            }
        }
    }

    /// Sends a ping whose payload is the current Unix-milli timestamp,
    /// big-endian 8 bytes.
    async fn send_ping(&self) -> Result<()> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let payload = Bytes::copy_from_slice(&millis.to_be_bytes());

        self.write_frame(Message::Ping(payload)).await
    }
}

// ============================================================================
// Dialing
// ============================================================================

/// Lazily-built TLS connector shared by all `wss://` dials.
fn tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

    CONNECTOR
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

/// Dials `url` (ws or wss) and completes the WebSocket handshake, applying
/// `headers` to the upgrade request.
pub(crate) async fn dial(url_str: &str, headers: &HeaderMap) -> Result<WsStream> {
    match timeout(DIAL_TIMEOUT, dial_inner(url_str, headers)).await {
        Ok(result) => result,
        Err(_) => Err(Error::transport(format!(
            "dial of {url_str} timed out after {} seconds",
            DIAL_TIMEOUT.as_secs()
        ))),
    }
}

async fn dial_inner(url_str: &str, headers: &HeaderMap) -> Result<WsStream> {
    let url = Url::parse(url_str)?;
    let secure = match url.scheme() {
        "ws" => false,
        "wss" => true,
        scheme => {
            return Err(Error::protocol(format!(
                "unsupported URL scheme: {scheme}"
            )));
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::protocol(format!("URL has no host: {url_str}")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .unwrap_or(if secure { 443 } else { 80 });

    let tcp = TcpStream::connect((host.as_str(), port)).await?;

    let raw: Box<dyn RawStream> = if secure {
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| Error::protocol(format!("invalid TLS server name: {host}")))?;
        let tls = tls_connector().connect(server_name, tcp).await?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    let mut request = url_str.into_client_request()?;
    for (name, value) in headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let (stream, _response) = client_async(request, raw).await?;
    debug!(url = %url_str, "socket connected");

    Ok(stream)
}

// ============================================================================
// Tests
// ============================================================================
