//! Correlator: request/response RPC over the duplex message stream.
//!
//! Wraps a [`BaseSocket`] and inspects every inbound text frame for the
//! configured correlation property. Frames matching a pending request are
//! delivered to the waiting caller; everything else is offered to the parser
//! registry and then to the layer above.
//!
//! The pending map owns one `oneshot` sender per outstanding request.
//! Whoever removes an entry under the lock is the unique resolver, so a
//! response, a caller timeout and a socket close can race freely: exactly one
//! of them settles the request, the others are no-ops.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::correlate::{correlation_id, generate_request_id};
use crate::error::{Error, Result};
use crate::message::{JsonObject, MessageKind, PreparedMessage};
use crate::parser::ParserRegistry;
use crate::socket::base::{self, BaseSocket, SocketHooks, WsStream};

// ============================================================================
// Constants
// ============================================================================

/// Default deadline for a correlated request.
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

// ============================================================================
// CorrelatorSocket
// ============================================================================

/// A base socket plus request correlation and registry dispatch.
///
/// `server_mode` decides what happens to a private message that matches no
/// pending request: servers surface it to the layer above (an unsolicited
/// request from the peer), clients drop it (a stale response).
pub(crate) struct CorrelatorSocket {
    base: Arc<BaseSocket>,
    correlation_property: String,
    server_mode: bool,
    pending: Mutex<FxHashMap<String, oneshot::Sender<Bytes>>>,
    registry: Arc<ParserRegistry>,
    upper: OnceLock<SocketHooks>,
}

impl CorrelatorSocket {
    /// Wraps an already-established stream (server accept path).
    ///
    /// The pumps do not run until [`start`](Self::start).
    pub(crate) fn attach(
        stream: WsStream,
        label: impl Into<String>,
        correlation_property: impl Into<String>,
        server_mode: bool,
        registry: Arc<ParserRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: BaseSocket::new(stream, label),
            correlation_property: correlation_property.into(),
            server_mode,
            pending: Mutex::new(FxHashMap::default()),
            registry,
            upper: OnceLock::new(),
        })
    }

    /// Dials `url` and wraps the connection in client mode.
    pub(crate) async fn dial(
        url: &str,
        headers: &HeaderMap,
        correlation_property: impl Into<String>,
        registry: Arc<ParserRegistry>,
    ) -> Result<Arc<Self>> {
        let stream = base::dial(url, headers).await?;
        Ok(Self::attach(stream, url, correlation_property, false, registry))
    }

    /// Installs the upper-layer hooks and starts the pumps.
    pub(crate) fn start(self: &Arc<Self>, upper: SocketHooks) {
        if self.upper.set(upper).is_err() {
            debug!("correlator already started");
            return;
        }

        // Weak references break the hook cycle back through the base socket.
        let on_message = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);

        self.base.start(SocketHooks {
            on_message: Box::new(move |kind, payload| {
                if let Some(socket) = Weak::upgrade(&on_message) {
                    socket.handle_message(kind, payload);
                }
            }),
            on_error: Box::new(move |err| {
                if let Some(socket) = Weak::upgrade(&on_error)
                    && let Some(upper) = socket.upper.get()
                {
                    (upper.on_error)(err);
                }
            }),
            on_close: Box::new(move |code, reason| {
                if let Some(socket) = Weak::upgrade(&on_close) {
                    socket.handle_close(code, reason);
                }
            }),
        });
    }

    /// Returns the registry consulted before the upper message hook.
    #[inline]
    pub(crate) fn registry(&self) -> &Arc<ParserRegistry> {
        &self.registry
    }

    /// Returns the correlation property name this socket routes on.
    #[inline]
    pub(crate) fn correlation_property(&self) -> &str {
        &self.correlation_property
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    /// Number of requests currently awaiting a response.
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// ============================================================================
// CorrelatorSocket - Sending
// ============================================================================

impl CorrelatorSocket {
    pub(crate) async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.base.send_text(text).await
    }

    pub(crate) async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.base.send_json(value).await
    }

    pub(crate) async fn send_prepared(&self, prepared: &PreparedMessage) -> Result<()> {
        self.base.send_prepared(prepared).await
    }

    pub(crate) async fn close(&self) {
        self.base.close().await;
    }

    /// Sends `obj` as a correlated request with the default 4 second
    /// deadline and awaits the matching response.
    pub(crate) async fn request(&self, obj: JsonObject) -> Result<Bytes> {
        self.request_with_timeout(obj, Some(DEFAULT_REQUEST_TIMEOUT))
            .await
    }

    /// Sends `obj` as a correlated request and awaits the matching response.
    ///
    /// A fresh request id is attached under the correlation property,
    /// overwriting any value already present. `deadline` of `None` (or a
    /// zero duration) waits until the response arrives or the socket closes.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] when the deadline elapses first; the
    ///   pending entry is removed so a late response becomes a drop.
    /// - [`Error::Closed`] when the socket closes while waiting.
    /// - The send error when the request could not be written at all.
    pub(crate) async fn request_with_timeout(
        &self,
        mut obj: JsonObject,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        if self.base.is_closed() {
            return Err(Error::Closed);
        }

        let (id, rx) = self.add_pending();
        debug!(request_id = %id, "sending correlated request");

        obj.insert(
            self.correlation_property.clone(),
            Value::String(id.clone()),
        );

        if let Err(err) = self.base.send_json(&obj).await {
            self.remove_pending(&id);
            return Err(err);
        }

        match deadline.filter(|limit| !limit.is_zero()) {
            None => rx.await.map_err(|_| Error::Closed),
            Some(limit) => match timeout(limit, rx).await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(_)) => Err(Error::Closed),
                Err(_) => {
                    self.remove_pending(&id);
                    Err(Error::request_timeout(limit.as_secs()))
                }
            },
        }
    }

    fn add_pending(&self) -> (String, oneshot::Receiver<Bytes>) {
        let mut pending = self.pending.lock();

        let id = loop {
            let candidate = generate_request_id();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        pending.insert(id.clone(), tx);
        (id, rx)
    }

    fn remove_pending(&self, id: &str) {
        self.pending.lock().remove(id);
    }
}

// ============================================================================
// CorrelatorSocket - Inbound Dispatch
// ============================================================================

impl CorrelatorSocket {
    fn handle_message(&self, kind: MessageKind, payload: Bytes) {
        if kind == MessageKind::Text
            && let Some(id) = correlation_id(&payload, &self.correlation_property)
        {
            let sender = self.pending.lock().remove(&id);

            if let Some(tx) = sender {
                // The receiver is gone when the caller already timed out; the
                // late response is dropped here.
                let _ = tx.send(payload);
                return;
            }

            if !self.server_mode {
                trace!(request_id = %id, "response for unknown request dropped");
                return;
            }
            // Server side: an unsolicited request, handled by the layer above.
        }

        if self.registry.try_dispatch(&payload) {
            return;
        }

        if let Some(upper) = self.upper.get() {
            (upper.on_message)(kind, payload);
        }
    }

    fn handle_close(&self, code: u16, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests on close");
        }
        // Dropping the senders wakes every waiter with a closed error.
        drop(drained);

        if let Some(upper) = self.upper.get() {
            (upper.on_close)(code, reason);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
