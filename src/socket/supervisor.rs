//! Reconnection supervisor.
//!
//! Preserves the illusion of a stable connection across transport drops.
//! When the current subsocket closes unexpectedly, the supervisor rebuilds
//! the correlator stack with backoff, broadcasting every state transition on
//! a watch channel so correlated requests can gate on readiness without
//! polling.
//!
//! The parser registry lives here, above the reconnect boundary, so handler
//! registrations survive subsocket rotation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::{JsonObject, MessageKind, PreparedMessage};
use crate::parser::ParserRegistry;
use crate::socket::base::SocketHooks;
use crate::socket::correlator::{CorrelatorSocket, DEFAULT_REQUEST_TIMEOUT};

// ============================================================================
// Constants
// ============================================================================

/// Base reconnect delay.
const RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Additional delay per failed attempt.
const RECONNECT_STEP_MS: u64 = 250;

/// Upper bound on the reconnect delay.
const RECONNECT_MAX_DELAY_MS: u64 = 2_500;

// ============================================================================
// ClientState
// ============================================================================

/// Connection state of a supervised client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// A dial is in flight; no subsocket is usable yet.
    Connecting,
    /// The current subsocket is open and usable.
    Ready,
    /// The subsocket dropped; the reconnect loop is running.
    Disconnected,
    /// Terminal: `close()` was called on the supervisor.
    Closed,
}

impl ClientState {
    /// Returns `true` if sends can proceed without gating.
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

// ============================================================================
// Callbacks
// ============================================================================

type MessageCallback = Box<dyn Fn(MessageKind, Bytes) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;
type CloseCallback = Box<dyn Fn(u16, &str) + Send + Sync>;
type ReconnectCallback = Box<dyn Fn() + Send + Sync>;

/// User-settable callback slots, shared with every subsocket generation.
#[derive(Default)]
struct Callbacks {
    on_message: Mutex<Option<MessageCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_disconnect: Mutex<Option<CloseCallback>>,
    on_reconnect_error: Mutex<Option<ErrorCallback>>,
    on_reconnect: Mutex<Option<ReconnectCallback>>,
}

// ============================================================================
// Supervisor
// ============================================================================

/// Supervised, self-healing correlator stack.
pub(crate) struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    url: Mutex<String>,
    headers: Mutex<HeaderMap>,
    correlation_property: String,
    registry: Arc<ParserRegistry>,
    current: RwLock<Option<Arc<CorrelatorSocket>>>,
    state_tx: watch::Sender<ClientState>,
    closed: AtomicBool,
    callbacks: Callbacks,
}

impl Supervisor {
    /// Dials once and starts supervising the connection.
    ///
    /// The initial connect fails fast: a dial error here is returned to the
    /// caller instead of entering the reconnect loop. Only drops of an
    /// established connection trigger reconnection.
    pub(crate) async fn connect(
        url: String,
        headers: HeaderMap,
        correlation_property: String,
    ) -> Result<Self> {
        let (state_tx, _) = watch::channel(ClientState::Connecting);

        let shared = Arc::new(Shared {
            url: Mutex::new(url),
            headers: Mutex::new(headers),
            correlation_property,
            registry: Arc::new(ParserRegistry::new()),
            current: RwLock::new(None),
            state_tx,
            closed: AtomicBool::new(false),
            callbacks: Callbacks::default(),
        });

        let subsocket = Shared::dial_subsocket(&shared).await?;
        *shared.current.write() = Some(subsocket);
        shared.state_tx.send_replace(ClientState::Ready);

        Ok(Self { shared })
    }

    /// Current supervisor state.
    pub(crate) fn state(&self) -> ClientState {
        *self.shared.state_tx.borrow()
    }

    /// Registry shared across all subsocket generations.
    pub(crate) fn registry(&self) -> &Arc<ParserRegistry> {
        &self.shared.registry
    }

    /// Applies to the next reconnect attempt, not the live connection.
    pub(crate) fn set_url(&self, url: String) {
        *self.shared.url.lock() = url;
    }

    /// Applies to the next reconnect attempt, not the live connection.
    pub(crate) fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.shared.headers.lock().insert(name, value);
    }

    /// Terminally closes the supervisor and the current subsocket.
    pub(crate) async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.state_tx.send_replace(ClientState::Closed);

        let current = self.shared.current.read().clone();
        if let Some(socket) = current {
            socket.close().await;
        }
    }
}

// ============================================================================
// Supervisor - Callback Setters
// ============================================================================

impl Supervisor {
    pub(crate) fn set_on_message(&self, callback: MessageCallback) {
        *self.shared.callbacks.on_message.lock() = Some(callback);
    }

    pub(crate) fn set_on_error(&self, callback: ErrorCallback) {
        *self.shared.callbacks.on_error.lock() = Some(callback);
    }

    pub(crate) fn set_on_disconnect(&self, callback: CloseCallback) {
        *self.shared.callbacks.on_disconnect.lock() = Some(callback);
    }

    pub(crate) fn set_on_reconnect_error(&self, callback: ErrorCallback) {
        *self.shared.callbacks.on_reconnect_error.lock() = Some(callback);
    }

    pub(crate) fn set_on_reconnect(&self, callback: ReconnectCallback) {
        *self.shared.callbacks.on_reconnect.lock() = Some(callback);
    }
}

// ============================================================================
// Supervisor - Sending
// ============================================================================

impl Supervisor {
    /// Current subsocket, or [`Error::NotConnected`] mid-rotation.
    fn current_socket(&self) -> Result<Arc<CorrelatorSocket>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.shared
            .current
            .read()
            .clone()
            .ok_or(Error::NotConnected)
    }

    /// Plain sends pass through to the current subsocket without gating;
    /// callers are expected to react to disconnect/reconnect callbacks.
    pub(crate) async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.current_socket()?.send_text(text).await
    }

    pub(crate) async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.current_socket()?.send_json(value).await
    }

    pub(crate) async fn send_prepared(&self, prepared: &PreparedMessage) -> Result<()> {
        self.current_socket()?.send_prepared(prepared).await
    }

    pub(crate) async fn request(&self, obj: JsonObject) -> Result<Bytes> {
        self.request_with_timeout(obj, Some(DEFAULT_REQUEST_TIMEOUT))
            .await
    }

    /// Correlated request, gated on readiness.
    ///
    /// Waits for the supervisor to be `Ready` (across an in-flight
    /// reconnect if needed), then delegates to the current subsocket.
    pub(crate) async fn request_with_timeout(
        &self,
        obj: JsonObject,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        self.await_ready().await?;
        self.current_socket()?
            .request_with_timeout(obj, deadline)
            .await
    }

    async fn await_ready(&self) -> Result<()> {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                ClientState::Ready => return Ok(()),
                ClientState::Closed => return Err(Error::Closed),
                ClientState::Connecting | ClientState::Disconnected => {}
            }
            state_rx.changed().await.map_err(|_| Error::Closed)?;
        }
    }
}

// ============================================================================
// Shared - Subsocket Lifecycle
// ============================================================================

impl Shared {
    /// Dials a fresh subsocket and wires its hooks back into the supervisor.
    async fn dial_subsocket(shared: &Arc<Self>) -> Result<Arc<CorrelatorSocket>> {
        let (url, headers) = {
            (shared.url.lock().clone(), shared.headers.lock().clone())
        };

        let subsocket = CorrelatorSocket::dial(
            &url,
            &headers,
            shared.correlation_property.clone(),
            Arc::clone(&shared.registry),
        )
        .await?;

        let on_message = Arc::downgrade(shared);
        let on_error = Arc::downgrade(shared);
        let on_close = Arc::downgrade(shared);

        subsocket.start(SocketHooks {
            on_message: Box::new(move |kind, payload| {
                if let Some(shared) = Weak::upgrade(&on_message)
                    && let Some(callback) = &*shared.callbacks.on_message.lock()
                {
                    callback(kind, payload);
                }
            }),
            on_error: Box::new(move |err| {
                if let Some(shared) = Weak::upgrade(&on_error)
                    && let Some(callback) = &*shared.callbacks.on_error.lock()
                {
                    callback(err);
                }
            }),
            on_close: Box::new(move |code, reason| {
                if let Some(shared) = Weak::upgrade(&on_close) {
                    shared.handle_subsocket_closed(code, reason);
                }
            }),
        });

        Ok(subsocket)
    }

    /// Subsocket close observed; decide between terminal shutdown and the
    /// reconnect loop.
    fn handle_subsocket_closed(self: &Arc<Self>, code: u16, reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        info!(code, reason, "connection dropped, reconnecting");
        self.state_tx.send_replace(ClientState::Disconnected);

        if let Some(callback) = &*self.callbacks.on_disconnect.lock() {
            callback(code, reason);
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.reconnect_loop().await });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut retries: u32 = 0;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            debug!(url = %self.url.lock(), retries, "connecting to new subsocket");
            match Self::dial_subsocket(&self).await {
                Ok(subsocket) => {
                    if self.closed.load(Ordering::SeqCst) {
                        // Terminally closed while the dial was in flight.
                        subsocket.close().await;
                        return;
                    }
                    *self.current.write() = Some(subsocket);
                    self.state_tx.send_replace(ClientState::Ready);

                    info!("reconnected");
                    if let Some(callback) = &*self.callbacks.on_reconnect.lock() {
                        callback();
                    }
                    return;
                }

                Err(err) => {
                    warn!(error = %err, retries, "failed to open subsocket");
                    let wrapped = Error::reconnect(err.to_string());
                    if let Some(callback) = &*self.callbacks.on_reconnect_error.lock() {
                        callback(&wrapped);
                    }

                    tokio::time::sleep(reconnect_delay(retries)).await;
                    retries = retries.saturating_add(1);
                }
            }
        }
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Delay before reconnect attempt number `retries` (zero-based):
/// `min(500 + retries * 250, 2500)` milliseconds.
fn reconnect_delay(retries: u32) -> Duration {
    let extra = u64::from(retries).saturating_mul(RECONNECT_STEP_MS);
    let millis = (RECONNECT_BASE_DELAY_MS + extra).min(RECONNECT_MAX_DELAY_MS);
    Duration::from_millis(millis)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    use crate::socket::base::RawStream;

    #[test]
    fn test_reconnect_delay_schedule() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(500));
        assert_eq!(reconnect_delay(1), Duration::from_millis(750));
        assert_eq!(reconnect_delay(4), Duration::from_millis(1_500));
        assert_eq!(reconnect_delay(8), Duration::from_millis(2_500));
        // Capped from here on.
        assert_eq!(reconnect_delay(9), Duration::from_millis(2_500));
        assert_eq!(reconnect_delay(1_000), Duration::from_millis(2_500));
    }

    #[test]
    fn test_client_state_predicates() {
        assert!(ClientState::Ready.is_ready());
        assert!(!ClientState::Connecting.is_ready());
        assert!(!ClientState::Disconnected.is_ready());
        assert!(!ClientState::Closed.is_ready());
    }

    /// Accepts connections forever, keeping each socket open and silent.
    async fn spawn_silent_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let raw: Box<dyn RawStream> = Box::new(stream);
                    let Ok(mut ws) = tokio_tungstenite::accept_async(raw).await else {
                        return;
                    };
                    while ws.next().await.is_some() {}
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_initial_connect_fails_fast() {
        // Nothing listens here; the dial must error instead of retrying.
        let result = tokio::time::timeout(
            Duration::from_secs(15),
            Supervisor::connect(
                "ws://127.0.0.1:9".to_string(),
                HeaderMap::new(),
                "id".to_string(),
            ),
        )
        .await
        .expect("fail fast, not retry");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let addr = spawn_silent_server().await;
        let supervisor = Supervisor::connect(
            format!("ws://{addr}"),
            HeaderMap::new(),
            "id".to_string(),
        )
        .await
        .expect("connect");

        assert_eq!(supervisor.state(), ClientState::Ready);

        supervisor.close().await;
        assert_eq!(supervisor.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_request_after_close_returns_closed() {
        let addr = spawn_silent_server().await;
        let supervisor = Supervisor::connect(
            format!("ws://{addr}"),
            HeaderMap::new(),
            "id".to_string(),
        )
        .await
        .expect("connect");

        supervisor.close().await;

        let err = supervisor
            .request(JsonObject::new())
            .await
            .expect_err("closed supervisor must refuse");
        assert!(err.is_closed());

        let err = supervisor
            .send_text("hello")
            .await
            .expect_err("closed supervisor must refuse");
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_registry_survives_across_generations() {
        let addr = spawn_silent_server().await;
        let supervisor = Supervisor::connect(
            format!("ws://{addr}"),
            HeaderMap::new(),
            "id".to_string(),
        )
        .await
        .expect("connect");

        let registry = Arc::clone(supervisor.registry());
        registry.register_json::<serde_json::Value, _>(|_| {});
        assert_eq!(supervisor.registry().len(), 1);

        // The registry instance is shared with the live subsocket.
        let subsocket = supervisor.current_socket().expect("socket");
        assert!(Arc::ptr_eq(subsocket.registry(), supervisor.registry()));

        supervisor.close().await;
    }
}
