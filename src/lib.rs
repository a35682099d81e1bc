//! wsstack - Layered WebSocket runtime.
//!
//! One coherent API for three things that usually come separately:
//!
//! - **Client** with transparent reconnection: requests issued mid-outage
//!   wait for the next connection instead of failing.
//! - **Server** multiplexing many concurrent peers, with broadcast and a
//!   per-connection scratch store.
//! - **Request/response correlation** over the message-oriented duplex
//!   channel: a JSON correlation property (default `"id"`) ties responses to
//!   waiting requests on either side.
//!
//! # Architecture
//!
//! The engine is a stack of layers, each wrapping the one below:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Reconnection supervisor (client only)        │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ Correlator + parser registry           │  │
//! │  │  ┌──────────────────────────────────┐  │  │
//! │  │  │ Base socket                      │  │  │
//! │  │  │ read pump · heartbeat · writes   │  │  │
//! │  │  └──────────────────────────────────┘  │  │
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The base socket owns one WebSocket connection: a read pump delivering
//! frames in order, a heartbeat watchdog that pings quiet peers and closes
//! dead ones, a single write mutex serializing all frames, and a close
//! lifecycle that fires exactly once. The correlator turns the duplex stream
//! into synchronous RPC; the parser registry dispatches typed callbacks
//! before the generic message hook; the supervisor rebuilds the stack with
//! backoff when the transport drops.
//!
//! # Quick Start
//!
//! ```no_run
//! use wsstack::{Client, JsonObject, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::connect("ws://127.0.0.1:8080/ws").await?;
//!
//!     let mut request = JsonObject::new();
//!     request.insert("method".into(), "ping".into());
//!     let response = client.request(request).await?;
//!     println!("{}", String::from_utf8_lossy(&response));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Reconnecting client facade |
//! | [`server`] | Multiplexing server, per-connection state |
//! | [`parser`] | Typed parser-dispatch registry |
//! | [`correlate`] | Private-message classification |
//! | [`certs`] | Self-signed certificates, PEM loading |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`message`] | Frame kinds, prepared frames |

// ============================================================================
// Modules
// ============================================================================

/// Self-signed certificate generation and PEM loading.
pub mod certs;

/// Reconnecting WebSocket client.
pub mod client;

/// Correlation-id handling for private messages.
pub mod correlate;

/// Error types and result aliases.
pub mod error;

/// Message types shared across the socket layers.
pub mod message;

/// Typed parser-dispatch registry.
pub mod parser;

/// WebSocket server and per-connection state.
pub mod server;

/// Layered socket engine (internal).
mod socket;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder};

// Server types
pub use server::{
    ConnectionData, HandshakeInfo, RequestContext, Server, ServerBuilder, ServerConnection,
    UpgradeRequest,
};

// Engine types
pub use message::{JsonObject, MessageKind, PreparedMessage};
pub use parser::{HandlerToken, ParserRegistry};
pub use socket::ClientState;

// Certificates
pub use certs::{SelfSignedCert, TlsIdentity};

// Error types
pub use error::{Error, Result};
