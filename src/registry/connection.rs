//! Registered connection records.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::identifiers::{ConnectionId, SessionId};
use crate::protocol::PageInfo;
use crate::transport::Transport;

// ============================================================================
// Connection
// ============================================================================

/// Snapshot of a registered page connection.
///
/// Returned by the registry's query methods; mutating it has no effect on
/// the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Registry-assigned identifier.
    pub id: ConnectionId,
    /// Page metadata, merged from the handshake and `page_info` frames.
    pub info: PageInfo,
    /// Whether the connection is still registered.
    pub connected: bool,
    /// When the connection was registered.
    pub connected_at: Instant,
    /// Last inbound frame.
    pub last_seen: Instant,
}

impl Connection {
    /// Returns the session the page announced, if any.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.info.session_id.as_ref()
    }

    /// Returns how long the connection has been silent as of `now`.
    #[inline]
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

// ============================================================================
// ConnectionEntry
// ============================================================================

/// A registry record: the public snapshot plus the socket it describes.
pub(crate) struct ConnectionEntry {
    pub(crate) connection: Connection,
    pub(crate) socket: Arc<dyn Transport>,
}

impl ConnectionEntry {
    pub(crate) fn new(
        id: ConnectionId,
        socket: Arc<dyn Transport>,
        info: PageInfo,
        now: Instant,
    ) -> Self {
        Self {
            connection: Connection {
                id,
                info,
                connected: true,
                connected_at: now,
                last_seen: now,
            },
            socket,
        }
    }

    #[inline]
    pub(crate) fn touch(&mut self, now: Instant) {
        self.connection.last_seen = now;
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("connection", &self.connection)
            .field("socket", &self.socket.state())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::MemoryTransport;

    #[tokio::test(start_paused = true)]
    async fn test_idle_for_tracks_last_seen() {
        let now = Instant::now();
        let mut entry = ConnectionEntry::new(
            ConnectionId::generate(),
            MemoryTransport::new(),
            PageInfo::default(),
            now,
        );

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(entry.connection.idle_for(Instant::now()), Duration::from_secs(90));

        entry.touch(Instant::now());
        assert_eq!(entry.connection.idle_for(Instant::now()), Duration::ZERO);
        assert_eq!(entry.connection.connected_at, now);
    }

    #[test]
    fn test_session_id_accessor() {
        let entry = ConnectionEntry::new(
            ConnectionId::generate(),
            MemoryTransport::new(),
            PageInfo {
                session_id: SessionId::new("s1"),
                ..PageInfo::default()
            },
            Instant::now(),
        );
        assert_eq!(entry.connection.session_id().map(SessionId::as_str), Some("s1"));
    }
}
