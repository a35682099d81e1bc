//! One accepted server-side connection.
//!
//! Each [`ServerConnection`] owns a server-mode correlator stack, a typed
//! scratch store and the per-connection callbacks. Inbound private messages
//! with no matching pending request are surfaced as unsolicited requests
//! through [`RequestContext`], whose `reply` re-attaches the originating id.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{trace, warn};

use crate::correlate::correlation_id;
use crate::error::{Error, Result};
use crate::message::{JsonObject, MessageKind, PreparedMessage};
use crate::parser::ParserRegistry;
use crate::socket::base::{SocketHooks, WsStream};
use crate::socket::correlator::CorrelatorSocket;

use super::{HandshakeInfo, ServerInner};

// ============================================================================
// Callback Types
// ============================================================================

type RequestCallback = Box<dyn Fn(RequestContext) -> Option<JsonObject> + Send + Sync>;
type MessageCallback = Box<dyn Fn(MessageKind, Bytes) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&Error) + Send + Sync>;
type CloseCallback = Box<dyn Fn(u16, &str) + Send + Sync>;

// ============================================================================
// ServerConnection
// ============================================================================

/// An accepted peer: socket stack, scratch store, callbacks.
pub struct ServerConnection {
    id: u64,
    server: Weak<ServerInner>,
    socket: Arc<CorrelatorSocket>,
    handshake: HandshakeInfo,
    data: ConnectionData,
    correlation_property: String,
    on_request: Mutex<Option<RequestCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl ServerConnection {
    /// Wraps an accepted stream. The pumps do not run until
    /// [`start`](Self::start), giving the server a chance to run the
    /// connect callback first.
    pub(crate) fn attach(
        server: &Arc<ServerInner>,
        stream: WsStream,
        handshake: HandshakeInfo,
        id: u64,
    ) -> Arc<Self> {
        let correlation_property = server.correlation_property.clone();

        let socket = CorrelatorSocket::attach(
            stream,
            format!("conn#{id}"),
            correlation_property.clone(),
            true,
            Arc::new(ParserRegistry::new()),
        );

        Arc::new(Self {
            id,
            server: Arc::downgrade(server),
            socket,
            handshake,
            data: ConnectionData::new(),
            correlation_property,
            on_request: Mutex::new(None),
            on_message: Mutex::new(None),
            on_error: Mutex::new(None),
            on_close: Mutex::new(None),
        })
    }

    /// Starts the socket pumps. Called by the server after the connect
    /// callback has run.
    pub(crate) fn start(self: &Arc<Self>) {
        let on_message = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);

        self.socket.start(SocketHooks {
            on_message: Box::new(move |kind, payload| {
                if let Some(connection) = Weak::upgrade(&on_message) {
                    connection.handle_message(kind, payload);
                }
            }),
            on_error: Box::new(move |err| {
                if let Some(connection) = Weak::upgrade(&on_error)
                    && let Some(callback) = &*connection.on_error.lock()
                {
                    callback(err);
                }
            }),
            on_close: Box::new(move |code, reason| {
                if let Some(connection) = Weak::upgrade(&on_close) {
                    connection.handle_close(code, reason);
                }
            }),
        });
    }

    /// Connection id: monotonically increasing, never reused within a
    /// server lifetime.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handshake details captured during the upgrade.
    #[inline]
    #[must_use]
    pub fn handshake(&self) -> &HandshakeInfo {
        &self.handshake
    }

    /// The per-connection scratch store.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &ConnectionData {
        &self.data
    }

    /// The parser registry of this connection.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<ParserRegistry> {
        self.socket.registry()
    }

    /// Returns `true` once the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }
}

// ============================================================================
// ServerConnection - Callbacks
// ============================================================================

impl ServerConnection {
    /// Called for every unsolicited private message from the peer.
    ///
    /// Return `Some(reply)` to answer immediately; the reply is sent with
    /// the originating request id attached. For deferred replies, clone the
    /// [`RequestContext`] into a task and return `None`.
    pub fn on_request<F>(&self, callback: F)
    where
        F: Fn(RequestContext) -> Option<JsonObject> + Send + Sync + 'static,
    {
        *self.on_request.lock() = Some(Box::new(callback));
    }

    /// Called for inbound data frames that are neither correlated responses,
    /// unsolicited requests, nor consumed by the parser registry.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(MessageKind, Bytes) + Send + Sync + 'static,
    {
        *self.on_message.lock() = Some(Box::new(callback));
    }

    /// Called on any transport error of this connection.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        *self.on_error.lock() = Some(Box::new(callback));
    }

    /// Called exactly once when this connection closes.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        *self.on_close.lock() = Some(Box::new(callback));
    }
}

// ============================================================================
// ServerConnection - Sending
// ============================================================================

impl ServerConnection {
    /// Sends a text frame to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or the underlying transport error.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.socket.send_text(text).await
    }

    /// JSON-encodes `value` and sends it to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or the underlying transport error.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.socket.send_json(value).await
    }

    /// Sends a pre-encoded frame without re-serializing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or the underlying transport error.
    pub async fn send_prepared(&self, prepared: &PreparedMessage) -> Result<()> {
        self.socket.send_prepared(prepared).await
    }

    /// Server-initiated correlated request to this peer, default 4 second
    /// deadline.
    ///
    /// # Errors
    ///
    /// See [`Client::request`](crate::Client::request).
    pub async fn request(&self, obj: JsonObject) -> Result<Bytes> {
        self.socket.request(obj).await
    }

    /// Like [`request`](Self::request) with an explicit deadline. `None` or
    /// zero waits indefinitely.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn request_with_timeout(
        &self,
        obj: JsonObject,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        self.socket.request_with_timeout(obj, deadline).await
    }

    /// Closes this connection. Idempotent.
    pub async fn close(&self) {
        self.socket.close().await;
    }
}

// ============================================================================
// ServerConnection - Inbound Dispatch
// ============================================================================

impl ServerConnection {
    fn handle_message(self: &Arc<Self>, kind: MessageKind, payload: Bytes) {
        if kind == MessageKind::Text
            && let Some(request_id) = correlation_id(&payload, &self.correlation_property)
        {
            self.handle_request(request_id, payload);
            return;
        }

        if let Some(callback) = &*self.on_message.lock() {
            callback(kind, payload);
        }
    }

    fn handle_request(self: &Arc<Self>, request_id: String, body: Bytes) {
        let context = RequestContext {
            socket: Arc::clone(&self.socket),
            property: self.correlation_property.clone(),
            request_id,
            body,
        };

        let callback = self.on_request.lock();
        if let Some(callback) = &*callback {
            if let Some(reply) = callback(context.clone()) {
                // The hook runs on the read pump; the reply write happens on
                // its own task so a slow peer cannot stall the pump.
                tokio::spawn(async move {
                    if let Err(err) = context.reply(reply).await {
                        warn!(error = %err, "failed to send request reply");
                    }
                });
            }
            return;
        }
        drop(callback);

        // No request handler installed; surface as a plain message.
        trace!(id = self.id, "unsolicited request without handler");
        if let Some(callback) = &*self.on_message.lock() {
            callback(MessageKind::Text, context.body);
        }
    }

    fn handle_close(self: &Arc<Self>, code: u16, reason: &str) {
        if let Some(server) = self.server.upgrade() {
            server.handle_connection_close(self, code, reason);
        }

        if let Some(callback) = &*self.on_close.lock() {
            callback(code, reason);
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.handshake.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// RequestContext
// ============================================================================

/// An unsolicited request from a peer, carrying everything needed to answer
/// it. Cloneable and `Send`, so it can be moved into a task for a deferred
/// reply.
#[derive(Clone)]
pub struct RequestContext {
    socket: Arc<CorrelatorSocket>,
    property: String,
    request_id: String,
    body: Bytes,
}

impl RequestContext {
    /// Raw request body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The correlation id the requester attached.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Decodes the request body into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] when decoding fails.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Sends `reply` to the requester with the originating id attached
    /// under the correlation property, overwriting any value present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] or the underlying transport error.
    pub async fn reply(&self, mut reply: JsonObject) -> Result<()> {
        reply.insert(
            self.property.clone(),
            Value::String(self.request_id.clone()),
        );
        self.socket.send_json(&reply).await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("body_len", &self.body.len())
            .finish()
    }
}

// ============================================================================
// ConnectionData
// ============================================================================

/// Per-connection key-value scratch store.
///
/// Each type family is an independent map, so the same key can be used for
/// different types without collision. All families share one mutex.
#[derive(Default)]
pub struct ConnectionData {
    inner: Mutex<DataMaps>,
}

#[derive(Default)]
struct DataMaps {
    bools: FxHashMap<String, bool>,
    ints: FxHashMap<String, i64>,
    floats: FxHashMap<String, f64>,
    strings: FxHashMap<String, String>,
    values: FxHashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ConnectionData {
    fn new() -> Self {
        Self::default()
    }

    /// Gets a bool by key.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.inner.lock().bools.get(key).copied()
    }

    /// Sets a bool under key.
    pub fn set_bool(&self, key: impl Into<String>, value: bool) {
        self.inner.lock().bools.insert(key.into(), value);
    }

    /// Clears the bool under key.
    pub fn clear_bool(&self, key: &str) {
        self.inner.lock().bools.remove(key);
    }

    /// Gets an integer by key.
    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.inner.lock().ints.get(key).copied()
    }

    /// Sets an integer under key.
    pub fn set_int(&self, key: impl Into<String>, value: i64) {
        self.inner.lock().ints.insert(key.into(), value);
    }

    /// Clears the integer under key.
    pub fn clear_int(&self, key: &str) {
        self.inner.lock().ints.remove(key);
    }

    /// Gets a float by key.
    #[must_use]
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.inner.lock().floats.get(key).copied()
    }

    /// Sets a float under key.
    pub fn set_float(&self, key: impl Into<String>, value: f64) {
        self.inner.lock().floats.insert(key.into(), value);
    }

    /// Clears the float under key.
    pub fn clear_float(&self, key: &str) {
        self.inner.lock().floats.remove(key);
    }

    /// Gets a string by key.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner.lock().strings.get(key).cloned()
    }

    /// Sets a string under key.
    pub fn set_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().strings.insert(key.into(), value.into());
    }

    /// Clears the string under key.
    pub fn clear_string(&self, key: &str) {
        self.inner.lock().strings.remove(key);
    }

    /// Gets an opaque value by key, downcast to `T`.
    ///
    /// Returns `None` when the key is absent or holds a different type.
    #[must_use]
    pub fn get_value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.lock().values.get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Sets an opaque value under key.
    pub fn set_value<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.lock().values.insert(key.into(), Arc::new(value));
    }

    /// Clears the opaque value under key.
    pub fn clear_value(&self, key: &str) {
        self.inner.lock().values.remove(key);
    }
}

impl std::fmt::Debug for ConnectionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionData")
            .field("bools", &inner.bools.len())
            .field("ints", &inner.ints.len())
            .field("floats", &inner.floats.len())
            .field("strings", &inner.strings.len())
            .field("values", &inner.values.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_families_are_independent() {
        let data = ConnectionData::new();

        data.set_bool("key", true);
        data.set_int("key", 7);
        data.set_float("key", 1.5);
        data.set_string("key", "hello");

        assert_eq!(data.get_bool("key"), Some(true));
        assert_eq!(data.get_int("key"), Some(7));
        assert_eq!(data.get_float("key"), Some(1.5));
        assert_eq!(data.get_string("key"), Some("hello".to_string()));

        // Clearing one family leaves the others intact.
        data.clear_int("key");
        assert_eq!(data.get_int("key"), None);
        assert_eq!(data.get_bool("key"), Some(true));
        assert_eq!(data.get_string("key"), Some("hello".to_string()));
    }

    #[test]
    fn test_data_missing_keys() {
        let data = ConnectionData::new();
        assert_eq!(data.get_bool("missing"), None);
        assert_eq!(data.get_int("missing"), None);
        assert_eq!(data.get_float("missing"), None);
        assert_eq!(data.get_string("missing"), None);

        // Clearing a missing key is a no-op.
        data.clear_bool("missing");
        data.clear_string("missing");
    }

    #[test]
    fn test_data_opaque_values() {
        #[derive(Debug, PartialEq)]
        struct Session {
            user: String,
        }

        let data = ConnectionData::new();
        data.set_value(
            "session",
            Session {
                user: "alice".into(),
            },
        );

        let session = data.get_value::<Session>("session").expect("present");
        assert_eq!(session.user, "alice");

        // Wrong type downcast yields None.
        assert!(data.get_value::<String>("session").is_none());

        data.clear_value("session");
        assert!(data.get_value::<Session>("session").is_none());
    }

    #[test]
    fn test_data_overwrite() {
        let data = ConnectionData::new();
        data.set_int("count", 1);
        data.set_int("count", 2);
        assert_eq!(data.get_int("count"), Some(2));
    }
}
