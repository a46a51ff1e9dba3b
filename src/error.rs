//! Error types for pagewire.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use pagewire::{Command, Result};
//!
//! async fn title(registry: &ConnectionRegistry, id: &ConnectionId) -> Result<Value> {
//!     registry
//!         .send_command(id, Command::new("get_title"), Duration::from_secs(5))
//!         .await
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Transport state | [`Error::NotConnected`], [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Lookup | [`Error::ConnectionNotFound`] |
//! | Timeout | [`Error::CommandTimeout`], [`Error::ConnectionTimeout`] |
//! | Protocol | [`Error::Protocol`], [`Error::CommandFailed`], [`Error::TooManyPending`] |
//! | Relay | [`Error::Relay`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio::sync::oneshot::error::RecvError;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::ConnectionId;
use crate::transport::TransportState;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a transport or registry configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Send or close attempted while the transport is not open.
    #[error("Not connected (state: {state})")]
    NotConnected {
        /// State the transport was in.
        state: TransportState,
    },

    /// Socket connection or upgrade failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Timed out while establishing a connection.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed while a command was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Registry Errors
    // ========================================================================
    /// Command addressed to an unknown or disconnected connection.
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The connection that was addressed.
        connection_id: ConnectionId,
    },

    /// No matching reply arrived within the command's budget.
    #[error("Command '{command_type}' timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// The `type` of the command that timed out.
        command_type: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The page replied with `success: false`.
    #[error("Command '{command_type}' failed: {message}")]
    CommandFailed {
        /// The `type` of the command that failed.
        command_type: String,
        /// Error string carried by the reply.
        message: String,
    },

    /// Too many commands in flight.
    #[error("Too many pending commands: {pending}/{max}")]
    TooManyPending {
        /// Commands currently in flight.
        pending: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// A frame failed to parse or failed schema validation.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// The extension host relay reported a failure.
    #[error("Relay error: {message}")]
    Relay {
        /// Description of the relay failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Channel receive error.
    #[error("Channel closed")]
    ChannelClosed(#[from] RecvError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a not-connected error for the given state.
    #[inline]
    pub fn not_connected(state: TransportState) -> Self {
        Self::NotConnected { state }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(connection_id: ConnectionId) -> Self {
        Self::ConnectionNotFound { connection_id }
    }

    /// Creates a command timeout error.
    #[inline]
    pub fn command_timeout(command_type: impl Into<String>, timeout_ms: u64) -> Self {
        Self::CommandTimeout {
            command_type: command_type.into(),
            timeout_ms,
        }
    }

    /// Creates a command failed error.
    #[inline]
    pub fn command_failed(command_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command_type: command_type.into(),
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

    /// Creates a relay error.
    #[inline]
    pub fn relay(message: impl Into<String>) -> Self {
        Self::Relay {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. } | Self::ConnectionTimeout { .. }
        )
    }

    /// Returns `true` if the addressed connection does not exist.
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ConnectionNotFound { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry, typically after the page
    /// has reconnected.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::ConnectionTimeout { .. }
                | Self::CommandTimeout { .. }
                | Self::ConnectionNotFound { .. }
                | Self::TooManyPending { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_command_timeout_names_command() {
        let err = Error::command_timeout("echo", 1000);
        assert_eq!(err.to_string(), "Command 'echo' timed out after 1000ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_not_connected_display() {
        let err = Error::not_connected(TransportState::Closed);
        assert_eq!(err.to_string(), "Not connected (state: CLOSED)");
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_is_not_found() {
        let err = Error::connection_not_found(ConnectionId::generate());
        assert!(err.is_not_found());
        assert!(!Error::ConnectionClosed.is_not_found());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::command_timeout("x", 1).is_recoverable());
        assert!(!Error::config("bad").is_recoverable());
        assert!(!Error::command_failed("x", "boom").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
