//! Message types shared across the socket layers.
//!
//! Defines the data-frame classification handed to message callbacks and the
//! pre-encoded frame used by broadcast.

// ============================================================================
// Imports
// ============================================================================

use bytes::Bytes;
use serde::Serialize;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::error::Result;

// ============================================================================
// JsonObject
// ============================================================================

/// A JSON object payload, as accepted by the correlated-request operations.
///
/// Correlated requests must be objects so the correlation property can be
/// attached; arrays and scalars are never private messages.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// MessageKind
// ============================================================================

/// Kind of a data frame delivered to message callbacks.
///
/// Control frames (ping, pong, close) are consumed by the base socket and
/// never reach user callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

// ============================================================================
// PreparedMessage
// ============================================================================

/// A pre-encoded text frame, reusable across many sends.
///
/// Broadcast encodes the value once and clones the frame per connection;
/// the payload is reference-counted so clones are cheap.
#[derive(Debug, Clone)]
pub struct PreparedMessage(Message);

impl PreparedMessage {
    /// Encodes `value` as JSON into a reusable text frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if encoding fails.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let encoded = serde_json::to_string(value)?;
        Ok(Self(Message::Text(Utf8Bytes::from(encoded))))
    }

    /// Wraps an already-serialized string into a reusable text frame.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self(Message::Text(Utf8Bytes::from(text.into())))
    }

    /// Wraps raw bytes into a reusable binary frame.
    #[inline]
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self(Message::Binary(data.into()))
    }

    /// Returns the underlying frame, cloned for a single send.
    #[inline]
    pub(crate) fn to_frame(&self) -> Message {
        self.0.clone()
    }

    /// Returns the payload length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_prepared_json() {
        let prepared = PreparedMessage::json(&json!({"msg": "hi"})).expect("encode");
        match prepared.to_frame() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"msg":"hi"}"#),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_prepared_clone_is_same_frame() {
        let prepared = PreparedMessage::text("hello");
        let a = prepared.to_frame();
        let b = prepared.to_frame();
        assert_eq!(a, b);
    }

    #[test]
    fn test_prepared_binary() {
        let prepared = PreparedMessage::binary(vec![1u8, 2, 3]);
        assert_eq!(prepared.len(), 3);
        assert!(!prepared.is_empty());
    }

    #[test]
    fn test_message_kind_eq() {
        assert_eq!(MessageKind::Text, MessageKind::Text);
        assert_ne!(MessageKind::Text, MessageKind::Binary);
    }
}
