//! Transport connection state.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// TransportState
// ============================================================================

/// Lifecycle state of a transport.
///
/// Owned by the transport; observers only read it through
/// [`Transport::state`](super::Transport::state) or learn about changes
/// through callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    /// Connection attempt in progress.
    Connecting,
    /// Ready to send and receive.
    Open,
    /// Close requested, not yet finished.
    Closing,
    /// Not connected.
    #[default]
    Closed,
}

impl TransportState {
    /// Returns `true` if the transport is open.
    #[inline]
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` if the transport is closing or closed.
    #[inline]
    #[must_use]
    pub const fn is_closed_or_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Returns the uppercase wire name of the state.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
