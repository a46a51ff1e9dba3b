//! Transport callback set.
//!
//! A [`TransportHandlers`] value bundles the four optional callbacks a
//! transport reports through. Transports store it behind a lock and take a
//! clone before invoking anything, so callbacks are free to call back into
//! any transport (including the one that invoked them).

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::Error;

// ============================================================================
// Types
// ============================================================================

/// Callback fired on open or close.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback fired on a transport-level error.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Callback fired for every inbound message.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

// ============================================================================
// TransportHandlers
// ============================================================================

/// The callbacks a transport reports through.
///
/// # Example
///
/// ```ignore
/// transport.set_handlers(
///     TransportHandlers::new()
///         .on_open(|| println!("open"))
///         .on_message(|msg| println!("got {msg}")),
/// );
/// ```
#[derive(Clone, Default)]
pub struct TransportHandlers {
    open: Option<LifecycleCallback>,
    close: Option<LifecycleCallback>,
    error: Option<ErrorCallback>,
    message: Option<MessageCallback>,
}

impl TransportHandlers {
    /// Creates an empty handler set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the open callback.
    #[must_use]
    pub fn on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.open = Some(Arc::new(f));
        self
    }

    /// Sets the close callback.
    #[must_use]
    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.close = Some(Arc::new(f));
        self
    }

    /// Sets the error callback.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    /// Sets the message callback.
    #[must_use]
    pub fn on_message(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.message = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_open(&self) {
        if let Some(f) = &self.open {
            f();
        }
    }

    pub(crate) fn emit_close(&self) {
        if let Some(f) = &self.close {
            f();
        }
    }

    pub(crate) fn emit_error(&self, error: &Error) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    pub(crate) fn emit_message(&self, message: Value) {
        if let Some(f) = &self.message {
            f(message);
        }
    }
}

impl fmt::Debug for TransportHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandlers")
            .field("on_open", &self.open.is_some())
            .field("on_close", &self.close.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_message", &self.message.is_some())
            .finish()
    }
}

// ============================================================================
// HandlerSlot
// ============================================================================

/// Lock-protected handler storage shared between a transport and its tasks.
#[derive(Debug, Default)]
pub(crate) struct HandlerSlot(Mutex<TransportHandlers>);

impl HandlerSlot {
    /// Replaces the stored handlers.
    pub(crate) fn replace(&self, handlers: TransportHandlers) {
        *self.0.lock() = handlers;
    }

    /// Returns a clone of the current handlers; the lock is released on return.
    pub(crate) fn snapshot(&self) -> TransportHandlers {
        self.0.lock().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_handlers_are_noops() {
        let handlers = TransportHandlers::new();
        handlers.emit_open();
        handlers.emit_close();
        handlers.emit_error(&Error::ConnectionClosed);
        handlers.emit_message(Value::Null);
    }

    #[test]
    fn test_callbacks_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let (c1, c2) = (Arc::clone(&count), Arc::clone(&count));
        let handlers = TransportHandlers::new()
            .on_open(move || {
                c1.fetch_add(1, Ordering::SeqCst);
            })
            .on_message(move |_| {
                c2.fetch_add(10, Ordering::SeqCst);
            });

        handlers.emit_open();
        handlers.emit_message(Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_slot_snapshot_allows_reentrant_replace() {
        let slot = Arc::new(HandlerSlot::default());
        let inner = Arc::clone(&slot);
        slot.replace(TransportHandlers::new().on_open(move || {
            inner.replace(TransportHandlers::new());
        }));

        slot.snapshot().emit_open();
        assert!(format!("{:?}", slot.snapshot()).contains("on_open: false"));
    }
}
