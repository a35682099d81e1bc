//! WebSocket server: upgrade handling, connection set, broadcast.
//!
//! [`Server`] accepts WebSocket upgrades on a configured path, wraps each
//! accepted peer in the server-mode correlator stack, assigns monotonically
//! increasing connection ids and keeps the live connection map. Variants add
//! TLS from an in-memory identity or PEM files.
//!
//! # Example
//!
//! ```no_run
//! use wsstack::{Server, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = Server::builder("127.0.0.1", "/ws").build();
//!
//!     server.on_connect(|conn| {
//!         println!("peer #{} connected", conn.id());
//!         conn.on_request(|_ctx| {
//!             let mut reply = wsstack::JsonObject::new();
//!             reply.insert("result".into(), "pong".into());
//!             Some(reply)
//!         });
//!     });
//!
//!     server.listen_and_serve(8080).await
//! }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Per-connection state: socket stack, scratch store, request contexts.
pub mod connection;

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use crate::certs::{self, TlsIdentity};
use crate::correlate::DEFAULT_CORRELATION_PROPERTY;
use crate::error::{Error, Result};
use crate::message::PreparedMessage;
use crate::socket::base::RawStream;

pub use connection::{ConnectionData, RequestContext, ServerConnection};

// ============================================================================
// Types
// ============================================================================

/// The HTTP upgrade request, as seen by the origin predicate.
pub type UpgradeRequest = Request;

type OriginPredicate = dyn Fn(&UpgradeRequest) -> bool + Send + Sync;
type ConnectCallback = Box<dyn Fn(&Arc<ServerConnection>) + Send + Sync>;
type ConnectionCloseCallback = Box<dyn Fn(&Arc<ServerConnection>, u16, &str) + Send + Sync>;

/// Handshake details captured during the upgrade.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// Request path of the upgrade.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Request headers of the upgrade.
    pub headers: http::HeaderMap,
    /// Peer address.
    pub remote_addr: SocketAddr,
}

// ============================================================================
// ServerBuilder
// ============================================================================

/// Builder for [`Server`].
#[derive(Debug)]
pub struct ServerBuilder {
    addr: String,
    path: String,
    correlation_property: String,
}

impl ServerBuilder {
    fn new(addr: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            path: path.into(),
            correlation_property: DEFAULT_CORRELATION_PROPERTY.to_string(),
        }
    }

    /// Overrides the correlation property name (default `"id"`).
    #[must_use]
    pub fn correlation_property(mut self, name: impl Into<String>) -> Self {
        self.correlation_property = name.into();
        self
    }

    /// Builds the server. Nothing listens until a serve method is called.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                addr: self.addr,
                path: self.path,
                correlation_property: self.correlation_property,
                next_connection_id: AtomicU64::new(0),
                connections: AsyncMutex::new(FxHashMap::default()),
                // Default accepts all origins; replace via `set_check_origin`.
                check_origin: RwLock::new(Arc::new(|_: &UpgradeRequest| true)),
                local_addr: Mutex::new(None),
                on_connect: Mutex::new(None),
                on_close: Mutex::new(None),
            }),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Multiplexing WebSocket server.
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    addr: String,
    path: String,
    pub(crate) correlation_property: String,
    next_connection_id: AtomicU64,
    /// Async mutex: broadcast holds the guard across its frame writes so
    /// disconnect reaping serializes against an in-flight broadcast.
    connections: AsyncMutex<FxHashMap<u64, Arc<ServerConnection>>>,
    check_origin: RwLock<Arc<OriginPredicate>>,
    local_addr: Mutex<Option<SocketAddr>>,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_close: Mutex<Option<ConnectionCloseCallback>>,
}

impl Server {
    /// Starts building a server bound to `addr` and serving upgrades on
    /// `path`.
    #[must_use]
    pub fn builder(addr: impl Into<String>, path: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(addr, path)
    }

    /// Replaces the origin predicate consulted during the upgrade.
    ///
    /// The default accepts all origins. A careful predicate should validate
    /// the `Origin` header against the expected host to prevent cross-site
    /// WebSocket hijacking.
    pub fn set_check_origin<F>(&self, predicate: F)
    where
        F: Fn(&UpgradeRequest) -> bool + Send + Sync + 'static,
    {
        *self.inner.check_origin.write() = Arc::new(predicate);
    }

    /// Called for every accepted connection, after it has been added to the
    /// connection map and before its read pump starts. Wire per-connection
    /// callbacks here to observe the very first message.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Arc<ServerConnection>) + Send + Sync + 'static,
    {
        *self.inner.on_connect.lock() = Some(Box::new(callback));
    }

    /// Called once per connection when it closes, after it has been removed
    /// from the connection map.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(&Arc<ServerConnection>, u16, &str) + Send + Sync + 'static,
    {
        *self.inner.on_close.lock() = Some(Box::new(callback));
    }

    /// The bound address, available once a serve method has started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    /// Looks up a live connection by id.
    pub async fn connection(&self, id: u64) -> Option<Arc<ServerConnection>> {
        self.inner.connections.lock().await.get(&id).cloned()
    }
}

// ============================================================================
// Server - Serving
// ============================================================================

impl Server {
    /// Serves plaintext WebSocket upgrades. Blocks until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when binding or accepting fails.
    pub async fn listen_and_serve(&self, port: u16) -> Result<()> {
        let listener = self.bind(port).await?;
        self.accept_loop(listener, None).await
    }

    /// Serves TLS WebSocket upgrades with an in-memory identity. Blocks
    /// until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] for an unusable identity, [`Error::Io`] when
    /// binding or accepting fails.
    pub async fn listen_and_serve_tls(&self, port: u16, identity: TlsIdentity) -> Result<()> {
        let acceptor = identity.into_acceptor()?;
        let listener = self.bind(port).await?;
        self.accept_loop(listener, Some(acceptor)).await
    }

    /// Serves TLS WebSocket upgrades with a certificate and key loaded from
    /// PEM files. Blocks until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`]/[`Error::Protocol`] for unreadable or invalid
    /// PEM files, [`Error::Tls`] for an unusable identity.
    pub async fn listen_and_serve_tls_files(
        &self,
        port: u16,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<()> {
        let identity = certs::load_identity_from_pem_files(cert_path, key_path)?;
        self.listen_and_serve_tls(port, identity).await
    }

    async fn bind(&self, port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.inner.addr.as_str(), port)).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);

        info!(addr = %addr, path = %self.inner.path, "server listening");
        Ok(listener)
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "TCP connection accepted");

            let inner = Arc::clone(&self.inner);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = ServerInner::handle_upgrade(inner, stream, peer, acceptor).await
                {
                    warn!(error = %err, peer = %peer, "upgrade failed");
                }
            });
        }
    }
}

// ============================================================================
// Server - Broadcast
// ============================================================================

impl Server {
    /// JSON-encodes `value` once and sends the frame to every live
    /// connection.
    ///
    /// The connection map stays locked for the full iteration, so a
    /// disconnect observed mid-broadcast is reaped only after the broadcast
    /// finishes. Returns the number of connections that failed the send. An
    /// encoding failure is returned as an error instead, in which case no
    /// connection was sent anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] when encoding `value` fails.
    pub async fn broadcast<T: Serialize>(&self, value: &T) -> Result<usize> {
        let prepared = PreparedMessage::json(value)?;

        let connections = self.inner.connections.lock().await;
        let mut fail_count = 0;
        for connection in connections.values() {
            if let Err(err) = connection.send_prepared(&prepared).await {
                debug!(id = connection.id(), error = %err, "broadcast send failed");
                fail_count += 1;
            }
        }

        Ok(fail_count)
    }
}

// ============================================================================
// ServerInner - Upgrade Path
// ============================================================================

impl ServerInner {
    async fn handle_upgrade(
        inner: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) -> Result<()> {
        let raw: Box<dyn RawStream> = match acceptor {
            Some(acceptor) => Box::new(acceptor.accept(stream).await?),
            None => Box::new(stream),
        };

        let captured: Arc<Mutex<Option<HandshakeInfo>>> = Arc::new(Mutex::new(None));

        let callback = {
            let inner = Arc::clone(&inner);
            let captured = Arc::clone(&captured);
            move |request: &Request, response: Response| {
                if request.uri().path() != inner.path {
                    debug!(peer = %peer, path = %request.uri().path(), "rejecting unknown path");
                    let mut rejection = ErrorResponse::new(None);
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    return Err(rejection);
                }

                let check_origin = Arc::clone(&*inner.check_origin.read());
                if !check_origin(request) {
                    debug!(peer = %peer, "rejecting origin");
                    let mut rejection = ErrorResponse::new(None);
                    *rejection.status_mut() = StatusCode::FORBIDDEN;
                    return Err(rejection);
                }

                *captured.lock() = Some(HandshakeInfo {
                    path: request.uri().path().to_string(),
                    query: request.uri().query().map(str::to_string),
                    headers: request.headers().clone(),
                    remote_addr: peer,
                });
                Ok(response)
            }
        };

        let ws = accept_hdr_async(raw, callback).await?;
        let handshake = captured
            .lock()
            .take()
            .ok_or_else(|| Error::protocol("upgrade completed without handshake info"))?;

        let id = inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = ServerConnection::attach(&inner, ws, handshake, id);

        inner
            .connections
            .lock()
            .await
            .insert(id, Arc::clone(&connection));
        info!(id, peer = %peer, "connection established");

        // User callbacks are wired before the pumps start, so the very first
        // inbound message is observable.
        if let Some(callback) = &*inner.on_connect.lock() {
            callback(&connection);
        }
        connection.start();

        Ok(())
    }

    /// Reaps a closed connection and notifies the user.
    ///
    /// Called from the read-pump close hook, which cannot await; removal
    /// runs on its own task and queues behind any in-flight broadcast
    /// holding the map lock.
    pub(crate) fn handle_connection_close(
        self: &Arc<Self>,
        connection: &Arc<ServerConnection>,
        code: u16,
        reason: &str,
    ) {
        let inner = Arc::clone(self);
        let connection = Arc::clone(connection);
        let reason = reason.to_string();

        tokio::spawn(async move {
            inner.connections.lock().await.remove(&connection.id());
            debug!(id = connection.id(), code, reason = %reason, "connection removed");

            if let Some(callback) = &*inner.on_close.lock() {
                callback(&connection, code, &reason);
            }
        });
    }

    /// Inserts a connection directly; test hook for reap/broadcast paths.
    #[cfg(test)]
    pub(crate) async fn insert_connection(&self, connection: Arc<ServerConnection>) {
        self.connections
            .lock()
            .await
            .insert(connection.id(), connection);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let server = Server::builder("127.0.0.1", "/ws").build();
        assert_eq!(server.inner.path, "/ws");
        assert_eq!(server.inner.correlation_property, "id");
        assert_eq!(server.connection_count().await, 0);
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_builder_correlation_property() {
        let server = Server::builder("127.0.0.1", "/ws")
            .correlation_property("requestId")
            .build();
        assert_eq!(server.inner.correlation_property, "requestId");
    }

    #[test]
    fn test_default_origin_check_accepts_all() {
        let server = Server::builder("127.0.0.1", "/ws").build();
        let request = Request::builder()
            .uri("/ws")
            .header("Origin", "http://evil.example")
            .body(())
            .expect("request");

        let check = Arc::clone(&*server.inner.check_origin.read());
        assert!(check(&request));
    }

    #[test]
    fn test_replaced_origin_check() {
        let server = Server::builder("127.0.0.1", "/ws").build();
        server.set_check_origin(|request| {
            request
                .headers()
                .get("Origin")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|origin| origin.ends_with("trusted.example"))
        });

        let trusted = Request::builder()
            .uri("/ws")
            .header("Origin", "https://app.trusted.example")
            .body(())
            .expect("request");
        let untrusted = Request::builder()
            .uri("/ws")
            .header("Origin", "http://evil.example")
            .body(())
            .expect("request");

        let check = Arc::clone(&*server.inner.check_origin.read());
        assert!(check(&trusted));
        assert!(!check(&untrusted));
    }

    #[tokio::test]
    async fn test_listen_reports_local_addr() {
        let server = Arc::new(Server::builder("127.0.0.1", "/ws").build());
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = serving.listen_and_serve(0).await;
        });

        for _ in 0..100 {
            if server.local_addr().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let addr = server.local_addr().expect("bound address");
        assert!(addr.port() > 0);
    }

    #[tokio::test]
    async fn test_broadcast_counts_dead_unreaped_connection() {
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        use serde_json::json;

        use crate::client::Client;

        let server = Arc::new(Server::builder("127.0.0.1", "/ws").build());
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = serving.listen_and_serve(0).await;
        });

        let addr = loop {
            if let Some(addr) = server.local_addr() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let received = Arc::new(AtomicUsize::new(0));
        let mut clients = Vec::new();
        for _ in 0..3 {
            let client = Client::connect(format!("ws://{addr}/ws"))
                .await
                .expect("connect");
            let received = Arc::clone(&received);
            client.on_message(move |_, _| {
                received.fetch_add(1, Ordering::SeqCst);
            });
            clients.push(client);
        }

        for _ in 0..200 {
            if server.connection_count().await == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count().await, 3);

        // Terminate one peer for good (a client-side close does not
        // reconnect), then put its reaped server connection back into the
        // map to model a peer that died but has not been reaped yet.
        let dead = server.connection(0).await.expect("connection 0");
        clients[0].close().await;
        for _ in 0..200 {
            if server.connection_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.connection_count().await, 2);
        server.inner.insert_connection(Arc::clone(&dead)).await;
        assert_eq!(server.connection_count().await, 3);

        let fail_count = server
            .broadcast(&json!({"msg": "hi"}))
            .await
            .expect("broadcast");
        assert_eq!(fail_count, 1);

        // The two live peers each received exactly one frame.
        for _ in 0..200 {
            if received.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);

        for client in &clients {
            client.close().await;
        }
    }
}
