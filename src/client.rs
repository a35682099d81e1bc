//! Reconnecting WebSocket client.
//!
//! [`Client`] is the public facade over the supervised socket stack: one
//! WebSocket connection with heartbeat liveness, request/response
//! correlation, typed parser dispatch and transparent reconnection.
//!
//! # Quick Start
//!
//! ```no_run
//! use wsstack::{Client, JsonObject, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder("ws://127.0.0.1:8080/ws")
//!         .query("token", "secret")
//!         .connect()
//!         .await?;
//!
//!     client.on_message(|_kind, payload| {
//!         println!("pushed: {}", String::from_utf8_lossy(&payload));
//!     });
//!     client.on_reconnect(|| println!("back online"));
//!
//!     let mut request = JsonObject::new();
//!     request.insert("method".into(), "ping".into());
//!     let response = client.request(request).await?;
//!     println!("response: {}", String::from_utf8_lossy(&response));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use url::Url;

use crate::correlate::DEFAULT_CORRELATION_PROPERTY;
use crate::error::{Error, Result};
use crate::message::{JsonObject, MessageKind, PreparedMessage};
use crate::parser::ParserRegistry;
use crate::socket::supervisor::{ClientState, Supervisor};

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for [`Client`].
///
/// Query parameters are merged into the URL; headers are applied to the
/// upgrade request of every (re)connect.
#[derive(Debug)]
pub struct ClientBuilder {
    url: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    correlation_property: String,
}

impl ClientBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            correlation_property: DEFAULT_CORRELATION_PROPERTY.to_string(),
        }
    }

    /// Appends a query parameter to the connection URL.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Adds a header to the upgrade request.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Overrides the correlation property name (default `"id"`).
    #[must_use]
    pub fn correlation_property(mut self, name: impl Into<String>) -> Self {
        self.correlation_property = name.into();
        self
    }

    /// Dials the server and starts the supervised stack.
    ///
    /// The initial connect fails fast; reconnection only begins after an
    /// established connection drops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] for an unparseable URL, or the dial
    /// error when the server is unreachable.
    pub async fn connect(self) -> Result<Client> {
        let mut url = Url::parse(&self.url)?;
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }

        let supervisor = Supervisor::connect(
            url.to_string(),
            self.headers,
            self.correlation_property,
        )
        .await?;

        Ok(Client { supervisor })
    }
}

// ============================================================================
// Client
// ============================================================================

/// Reconnecting WebSocket client with correlated requests.
pub struct Client {
    supervisor: Supervisor,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Starts building a client for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn builder(url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(url)
    }

    /// Connects with default options.
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::connect`].
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        Self::builder(url).connect().await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.supervisor.state()
    }

    /// The parser registry consulted before [`on_message`](Self::on_message).
    ///
    /// Registrations survive reconnects.
    #[must_use]
    pub fn registry(&self) -> &Arc<ParserRegistry> {
        self.supervisor.registry()
    }

    /// Replaces the URL used by the *next* reconnect attempt.
    pub fn set_url(&self, url: impl Into<String>) {
        self.supervisor.set_url(url.into());
    }

    /// Sets a header on the upgrade request of the *next* reconnect attempt.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.supervisor.set_header(name, value);
    }

    /// Terminally closes the client. No reconnection happens afterwards.
    pub async fn close(&self) {
        self.supervisor.close().await;
    }
}

// ============================================================================
// Client - Callbacks
// ============================================================================

impl Client {
    /// Called for every inbound data frame that is neither a correlated
    /// response nor consumed by the parser registry.
    ///
    /// Runs on the read-pump task; it must not block indefinitely.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(MessageKind, Bytes) + Send + Sync + 'static,
    {
        self.supervisor.set_on_message(Box::new(callback));
    }

    /// Called on any error of the currently established connection.
    ///
    /// This can fire multiple times per connection and is not a sign of
    /// disconnection; use [`on_disconnect`](Self::on_disconnect) for that.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.supervisor.set_on_error(Box::new(callback));
    }

    /// Called once the connection unexpectedly drops; expect to be
    /// reconnected shortly after.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.supervisor.set_on_disconnect(Box::new(callback));
    }

    /// Called for every failed dial inside the reconnect loop.
    pub fn on_reconnect_error<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.supervisor.set_on_reconnect_error(Box::new(callback));
    }

    /// Called once a new connection is established after a disconnection.
    pub fn on_reconnect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.supervisor.set_on_reconnect(Box::new(callback));
    }
}

// ============================================================================
// Client - Sending
// ============================================================================

impl Client {
    /// Sends a text frame on the current connection.
    ///
    /// # Errors
    ///
    /// Fails with a transport error mid-rotation; react to
    /// [`on_disconnect`](Self::on_disconnect)/[`on_reconnect`](Self::on_reconnect)
    /// to resume.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.supervisor.send_text(text).await
    }

    /// JSON-encodes `value` and sends it as a text frame.
    ///
    /// # Errors
    ///
    /// Fails with a transport error mid-rotation.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.supervisor.send_json(value).await
    }

    /// Sends a pre-encoded frame without re-serializing.
    ///
    /// # Errors
    ///
    /// Fails with a transport error mid-rotation.
    pub async fn send_prepared(&self, prepared: &PreparedMessage) -> Result<()> {
        self.supervisor.send_prepared(prepared).await
    }

    /// Sends `obj` as a correlated request with the default 4 second
    /// deadline and awaits the matching response.
    ///
    /// Waits for the stack to be ready first, so an in-flight reconnect
    /// delays rather than fails the request.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestTimeout`] when the deadline elapses.
    /// - [`Error::Closed`] when the client is terminally closed.
    /// - The underlying send error when the request could not be written.
    pub async fn request(&self, obj: JsonObject) -> Result<Bytes> {
        self.supervisor.request(obj).await
    }

    /// Like [`request`](Self::request) with an explicit deadline.
    ///
    /// A deadline of `None` or zero waits indefinitely.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn request_with_timeout(
        &self,
        obj: JsonObject,
        deadline: Option<Duration>,
    ) -> Result<Bytes> {
        self.supervisor.request_with_timeout(obj, deadline).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = Client::builder("ws://example.com/ws");
        assert_eq!(builder.correlation_property, "id");
        assert!(builder.query.is_empty());
        assert!(builder.headers.is_empty());
    }

    #[test]
    fn test_builder_options() {
        let builder = Client::builder("ws://example.com/ws")
            .query("token", "abc")
            .query("session", "1")
            .correlation_property("requestId")
            .header(
                http::header::AUTHORIZATION,
                HeaderValue::from_static("Bearer abc"),
            );

        assert_eq!(builder.query.len(), 2);
        assert_eq!(builder.correlation_property, "requestId");
        assert_eq!(builder.headers.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = Client::connect("not a url").await.expect_err("must fail");
        assert!(matches!(err, Error::InvalidUrl(_)));
    }
}
