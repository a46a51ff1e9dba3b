//! Type-safe identifiers for connections, sessions and commands.
//!
//! Newtype wrappers keep the three kinds of IDs from being mixed up:
//!
//! | Type | Generated by | Lifetime |
//! |------|--------------|----------|
//! | [`ConnectionId`] | Registry, per physical socket | One socket |
//! | [`SessionId`] | The page | Survives reconnects |
//! | [`CommandId`] | Registry, per command | One request/reply |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// ConnectionId
// ============================================================================

/// Identifier of one physical connection.
///
/// A page that reconnects gets a fresh `ConnectionId` every time, even if it
/// keeps the same [`SessionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Logical session identity chosen by the page.
///
/// Used to detect reconnections: a new socket announcing a session that is
/// already connected supersedes the old socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Creates a session ID, rejecting empty or whitespace-only values.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Returns the session ID as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id).ok_or_else(|| Error::protocol("session ID must not be blank"))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CommandId
// ============================================================================

/// Correlation ID embedded in a command and echoed in its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Generates a new random command ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a command ID from its string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn test_session_id_rejects_blank() {
        assert!(SessionId::new("").is_none());
        assert!(SessionId::new("   ").is_none());
        assert_eq!(SessionId::new("s1").map(|s| s.to_string()), Some("s1".into()));
    }

    #[test]
    fn test_session_id_deserialize_rejects_blank() {
        assert!(serde_json::from_str::<SessionId>(r#""  ""#).is_err());
        let id: SessionId = serde_json::from_str(r#""s1""#).expect("deserialize");
        assert_eq!(id.as_str(), "s1");
    }

    #[test]
    fn test_command_id_parse_roundtrip() {
        let id = CommandId::generate();
        assert_eq!(CommandId::parse(&id.to_string()), Some(id));
        assert_eq!(CommandId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_command_id_serializes_as_string() {
        let id = CommandId::generate();
        let json = serde_json::to_value(id).expect("serialize");
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }
}
