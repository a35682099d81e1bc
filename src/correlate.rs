//! Correlation-id handling for private messages.
//!
//! A *private message* is a JSON object carrying a non-empty string value
//! under the configured correlation property (default `"id"`). The functions
//! here classify inbound payloads and mint fresh request ids; the pending-map
//! bookkeeping lives in the correlator layer.

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Write as _;

use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::Value;
use tracing::debug;

// ============================================================================
// Constants
// ============================================================================

/// Default name of the correlation property.
pub const DEFAULT_CORRELATION_PROPERTY: &str = "id";

/// Number of random bytes in a request id (hex-encoded to twice this length).
const REQUEST_ID_BYTES: usize = 32;

// ============================================================================
// Classification
// ============================================================================

/// Extracts the correlation id from `payload`, if it is a private message.
///
/// Returns `None` when the payload is empty, is a JSON array (detected by the
/// leading `[` without a parse attempt), fails to decode as a JSON object, or
/// carries no non-empty string value under `property`.
#[must_use]
pub fn correlation_id(payload: &[u8], property: &str) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    if payload[0] == b'[' {
        return None;
    }

    let parsed: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "failed to decode inbound message as JSON");
            return None;
        }
    };

    let object = parsed.as_object()?;
    match object.get(property) {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        _ => None,
    }
}

// ============================================================================
// Id Generation
// ============================================================================

/// Mints a fresh request id: 32 random bytes, hex-encoded.
#[must_use]
pub(crate) fn generate_request_id() -> String {
    let mut buf = [0u8; REQUEST_ID_BYTES];
    OsRng.fill_bytes(&mut buf);

    let mut out = String::with_capacity(REQUEST_ID_BYTES * 2);
    for byte in buf {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_not_private() {
        assert_eq!(correlation_id(b"", "id"), None);
    }

    #[test]
    fn test_array_not_private_without_parse() {
        // Not even valid JSON past the bracket; must not matter.
        assert_eq!(correlation_id(b"[whatever", "id"), None);
        assert_eq!(correlation_id(br#"[{"id":"abc"}]"#, "id"), None);
    }

    #[test]
    fn test_invalid_json_not_private() {
        assert_eq!(correlation_id(b"{not json", "id"), None);
    }

    #[test]
    fn test_non_object_not_private() {
        assert_eq!(correlation_id(b"42", "id"), None);
        assert_eq!(correlation_id(br#""just a string""#, "id"), None);
        assert_eq!(correlation_id(b"null", "id"), None);
    }

    #[test]
    fn test_missing_property_not_private() {
        assert_eq!(correlation_id(br#"{"other":"abc"}"#, "id"), None);
    }

    #[test]
    fn test_non_string_property_not_private() {
        assert_eq!(correlation_id(br#"{"id":42}"#, "id"), None);
        assert_eq!(correlation_id(br#"{"id":null}"#, "id"), None);
        assert_eq!(correlation_id(br#"{"id":{"nested":true}}"#, "id"), None);
    }

    #[test]
    fn test_empty_string_property_not_private() {
        assert_eq!(correlation_id(br#"{"id":""}"#, "id"), None);
    }

    #[test]
    fn test_private_message() {
        assert_eq!(
            correlation_id(br#"{"id":"a1b2","result":"pong"}"#, "id"),
            Some("a1b2".to_string())
        );
    }

    #[test]
    fn test_custom_property_name() {
        let payload = br#"{"requestId":"xyz","id":"decoy"}"#;
        assert_eq!(
            correlation_id(payload, "requestId"),
            Some("xyz".to_string())
        );
        assert_eq!(correlation_id(br#"{"id":"decoy"}"#, "requestId"), None);
    }

    #[test]
    fn test_generated_id_shape() {
        let id = generate_request_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_ids_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
