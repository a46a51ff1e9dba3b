//! The transport contract.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;

use crate::error::Result;

use super::{TransportHandlers, TransportState};

// ============================================================================
// Transport
// ============================================================================

/// A bidirectional JSON message channel.
///
/// All methods are synchronous and non-blocking; connection progress and
/// inbound traffic are reported through [`TransportHandlers`]. Implementations
/// never invoke a callback while holding an internal lock.
///
/// # Contract
///
/// - [`send`](Self::send) fails with [`Error::NotConnected`] unless the state
///   is [`TransportState::Open`]. A [`Value::String`] is sent verbatim, any
///   other value is serialized to JSON text.
/// - [`close`](Self::close) is idempotent. From `Connecting` or `Open` it moves
///   through `Closing` to `Closed` and fires `on_close` exactly once.
/// - [`set_handlers`](Self::set_handlers) replaces the callback set. Socket-backed
///   transports connect automatically the first time handlers are attached
///   while `Closed`, so callers can construct and then wire without a race.
///
/// [`Error::NotConnected`]: crate::Error::NotConnected
pub trait Transport: Send + Sync {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotConnected`] if the transport is not open.
    fn send(&self, message: Value) -> Result<()>;

    /// Closes the transport.
    fn close(&self);

    /// Returns the current state.
    fn state(&self) -> TransportState;

    /// Replaces the callback set.
    fn set_handlers(&self, handlers: TransportHandlers);

    /// Starts connecting if the transport is closed.
    ///
    /// Returns once the attempt has been started; `on_open` reports success.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the attempt cannot be started at all
    /// (for example, no async runtime is available).
    fn connect(&self) -> Result<()>;
}

// ============================================================================
// Helpers
// ============================================================================

/// Renders a message as a text frame.
///
/// # Errors
///
/// Returns [`crate::Error::Json`] if serialization fails.
pub(crate) fn encode_frame(message: &Value) -> Result<String> {
    match message {
        Value::String(text) => Ok(text.clone()),
        other => Ok(serde_json::to_string(other)?),
    }
}

/// Returns a handle to the current tokio runtime.
///
/// # Errors
///
/// Returns [`crate::Error::Config`] when called outside a runtime.
pub(crate) fn runtime_handle() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|e| crate::Error::config(format!("no tokio runtime available: {e}")))
}

// ============================================================================
// Tests
// ============================================================================
