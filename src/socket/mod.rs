//! Layered socket engine (internal).
//!
//! The engine is a stack of three layers, each owning the one below:
//!
//! | Layer | Responsibility |
//! |-------|----------------|
//! | [`base`] | One WebSocket: read pump, heartbeat watchdog, serialized writes, close lifecycle |
//! | [`correlator`] | Request/response correlation and parser-registry dispatch |
//! | [`supervisor`] | Reconnection with backoff, send gating, URL/header rotation |
//!
//! Event hooks flow downward at construction time (they are wired before any
//! read pump starts), and inbound events bubble upward through them. The
//! public [`Client`](crate::Client) and [`Server`](crate::Server) facades sit
//! on top of this module.

// ============================================================================
// Submodules
// ============================================================================

/// Base socket: framing loop, heartbeat, close lifecycle.
pub(crate) mod base;

/// Correlator: private-message routing and synchronous requests.
pub(crate) mod correlator;

/// Reconnection supervisor.
pub(crate) mod supervisor;

// ============================================================================
// Re-exports
// ============================================================================

pub use supervisor::ClientState;
