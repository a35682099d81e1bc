//! Error types for the wsstack runtime.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsstack::{Result, Error, JsonObject};
//!
//! async fn example(client: &wsstack::Client) -> Result<()> {
//!     let mut obj = JsonObject::new();
//!     obj.insert("method".into(), "ping".into());
//!     let response = client.request(obj).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Transport | [`Error::Transport`], [`Error::NotConnected`], [`Error::Closed`] |
//! | Protocol | [`Error::Protocol`] |
//! | Timeout | [`Error::RequestTimeout`] |
//! | Reconnect | [`Error::Reconnect`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Tls`], [`Error::InvalidUrl`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Underlying I/O on the socket failed (dial, read or write).
    ///
    /// On the active socket this is also surfaced through the error callback
    /// and triggers the close lifecycle.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Operation attempted while no subsocket is established.
    ///
    /// Returned by plain sends on a supervisor that is mid-reconnect.
    #[error("not connected")]
    NotConnected,

    /// Operation attempted on a terminally closed socket or supervisor.
    #[error("socket has been closed")]
    Closed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Payload parse failed where a parse was attempted, or the peer
    /// violated the expected message shape.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // Timeout Errors
    // ========================================================================
    /// A correlated request exceeded its caller deadline.
    #[error("the request has timed out after {seconds} seconds")]
    RequestTimeout {
        /// Seconds waited before giving up.
        seconds: u64,
    },

    // ========================================================================
    // Reconnect Errors
    // ========================================================================
    /// A dial attempt during the reconnect loop failed.
    ///
    /// Surfaced through the reconnect-error callback; the supervisor keeps
    /// retrying with backoff.
    #[error("reconnect failed: {message}")]
    Reconnect {
        /// Description of the dial failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// URL parse error.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a reconnect error.
    #[inline]
    pub fn reconnect(message: impl Into<String>) -> Self {
        Self::Reconnect {
            message: message.into(),
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(seconds: u64) -> Self {
        Self::RequestTimeout { seconds }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a request timeout.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if the socket or supervisor was closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if this is a transport-level failure.
    #[inline]
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::NotConnected
                | Self::Io(_)
                | Self::WebSocket(_)
                | Self::Tls(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
