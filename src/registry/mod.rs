//! Server-side connection registry.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | [`Connection`] snapshots |
//! | `pending` | Command correlation and timeouts (internal) |
//! | `pool` | [`ConnectionRegistry`] and [`RegistryConfig`] |
//! | `server` | [`RegistryServer`] WebSocket endpoint |

// ============================================================================
// Submodules
// ============================================================================

/// Registered connection records.
pub mod connection;

/// Pending command table.
mod pending;

/// Connection registry.
pub mod pool;

/// WebSocket endpoint feeding the registry.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use pool::{ConnectionRegistry, EventHandler, RegistryConfig};
pub use server::{HandshakeInfo, RegistryServer};
