//! Typed parser-dispatch registry.
//!
//! Users subscribe typed callbacks that intercept inbound messages before the
//! generic message callback. Each handler pairs a parser (`&[u8]` to
//! `Option<T>`) with a callback (`T`); handlers are consulted in registration
//! order and the first parser to accept a message consumes it.
//!
//! # Example
//!
//! ```ignore
//! #[derive(serde::Deserialize)]
//! struct Tick { price: f64 }
//!
//! let registry = client.registry();
//! let token = registry.register_json::<Tick, _>(|tick| {
//!     println!("price: {}", tick.price);
//! });
//!
//! // Later:
//! registry.deregister(token);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::trace;

// ============================================================================
// HandlerToken
// ============================================================================

/// Opaque handle identifying a registered handler.
///
/// Tokens are stable across other registrations and deregistrations; pass
/// them back to [`ParserRegistry::deregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

// ============================================================================
// Handler Erasure
// ============================================================================

/// Type-erased handler: parse attempt plus callback in one call.
trait DispatchEntry: Send + Sync {
    /// Returns `true` if the parser accepted the message and the callback ran.
    fn try_parse_and_dispatch(&self, payload: &[u8]) -> bool;
}

struct TypedHandler<T> {
    parser: Box<dyn Fn(&[u8]) -> Option<T> + Send + Sync>,
    callback: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> DispatchEntry for TypedHandler<T>
where
    T: Send,
{
    fn try_parse_and_dispatch(&self, payload: &[u8]) -> bool {
        match (self.parser)(payload) {
            Some(value) => {
                (self.callback)(value);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// ParserRegistry
// ============================================================================

/// Ordered dispatch table of typed message handlers.
///
/// Registration and deregistration take an exclusive lock; dispatch takes a
/// shared lock, so a dispatch observes either the pre- or post-state of a
/// concurrent modification, never a torn view.
#[derive(Default)]
pub struct ParserRegistry {
    handlers: RwLock<Vec<(u64, Box<dyn DispatchEntry>)>>,
    next_token: AtomicU64,
}

impl ParserRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a parser/callback pair.
    ///
    /// The parser returns `Some(value)` to accept a message; accepted
    /// messages invoke the callback and stop dispatch. Returns a token for
    /// [`deregister`](Self::deregister).
    pub fn register<T, P, C>(&self, parser: P, callback: C) -> HandlerToken
    where
        T: Send + 'static,
        P: Fn(&[u8]) -> Option<T> + Send + Sync + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let handler = TypedHandler {
            parser: Box::new(parser),
            callback: Box::new(callback),
        };

        self.handlers.write().push((token, Box::new(handler)));
        HandlerToken(token)
    }

    /// Registers a callback with the default parser for `T`.
    ///
    /// The default parser attempts a JSON decode into `T` and accepts on
    /// success. Not recommended unless `T` is the only message structure the
    /// peer sends, or `T` is strict enough to reject unrelated messages.
    pub fn register_json<T, C>(&self, callback: C) -> HandlerToken
    where
        T: DeserializeOwned + Send + 'static,
        C: Fn(T) + Send + Sync + 'static,
    {
        self.register(
            |payload: &[u8]| serde_json::from_slice::<T>(payload).ok(),
            callback,
        )
    }

    /// Removes the handler identified by `token`.
    ///
    /// The relative order of remaining handlers is preserved. Removing an
    /// already-removed token is a no-op.
    pub fn deregister(&self, token: HandlerToken) {
        let mut handlers = self.handlers.write();
        if let Some(index) = handlers.iter().position(|(id, _)| *id == token.0) {
            handlers.remove(index);
        }
    }

    /// Offers `payload` to the handlers in registration order.
    ///
    /// Returns `true` if some handler consumed the message (its callback has
    /// already run); `false` lets the message flow to the next layer.
    pub fn try_dispatch(&self, payload: &[u8]) -> bool {
        let handlers = self.handlers.read();
        trace!(handlers = handlers.len(), "registry dispatch");

        for (_, handler) in handlers.iter() {
            if handler.try_parse_and_dispatch(payload) {
                return true;
            }
        }
        false
    }

    /// Returns the number of registered handlers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns `true` if no handlers are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Typed {
        #[serde(rename = "type")]
        kind: String,
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Typed) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&count);
        (count, move |_| {
            cloned.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatch_empty_registry() {
        let registry = ParserRegistry::new();
        assert!(!registry.try_dispatch(br#"{"type":"a"}"#));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_first_accepting_handler_wins() {
        let registry = ParserRegistry::new();

        // A accepts only {"type":"a"}; B accepts any object with a type.
        let (a_count, a_cb) = counter();
        registry.register(
            |payload: &[u8]| {
                let typed: Typed = serde_json::from_slice(payload).ok()?;
                (typed.kind == "a").then_some(typed)
            },
            a_cb,
        );

        let (b_count, b_cb) = counter();
        registry.register_json::<Typed, _>(b_cb);

        assert!(registry.try_dispatch(br#"{"type":"a"}"#));
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);

        assert!(registry.try_dispatch(br#"{"type":"b"}"#));
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unaccepted_message_not_consumed() {
        let registry = ParserRegistry::new();
        let (count, cb) = counter();
        registry.register_json::<Typed, _>(cb);

        assert!(!registry.try_dispatch(b"not json at all"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deregister_restores_prior_behavior() {
        let registry = ParserRegistry::new();
        let (count, cb) = counter();
        let token = registry.register_json::<Typed, _>(cb);

        assert!(registry.try_dispatch(br#"{"type":"a"}"#));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        registry.deregister(token);
        assert!(!registry.try_dispatch(br#"{"type":"a"}"#));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Second deregister is a no-op.
        registry.deregister(token);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_preserves_order() {
        let registry = ParserRegistry::new();
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let make = |label: &'static str| {
            let hits = Arc::clone(&hits);
            move |_: Typed| hits.lock().push(label)
        };

        let _first = registry.register_json::<Typed, _>(make("first"));
        let middle = registry.register_json::<Typed, _>(make("middle"));
        let _last = registry.register_json::<Typed, _>(make("last"));

        registry.deregister(middle);
        assert_eq!(registry.len(), 2);

        // "first" still outranks "last".
        assert!(registry.try_dispatch(br#"{"type":"x"}"#));
        assert_eq!(*hits.lock(), vec!["first"]);
    }

    #[test]
    fn test_tokens_are_distinct() {
        let registry = ParserRegistry::new();
        let (_, a) = counter();
        let (_, b) = counter();
        let token_a = registry.register_json::<Typed, _>(a);
        let token_b = registry.register_json::<Typed, _>(b);
        assert_ne!(token_a, token_b);
    }
}
