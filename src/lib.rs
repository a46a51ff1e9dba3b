//! Pagewire - command/response channels between controllers and live pages.
//!
//! This library connects a controller to scripts running inside web pages
//! over interchangeable transports, and tracks those pages on the server
//! side so commands can be sent to them and their replies correlated.
//!
//! # Architecture
//!
//! The library follows a client-server model:
//!
//! - **Page side**: a [`Transport`] (WebSocket, extension relay, or a bridge
//!   of the two) carries JSON frames to the controller
//! - **Controller side**: a [`ConnectionRegistry`] owns every accepted socket,
//!   sends commands, and settles replies by correlation ID
//!
//! Key design principles:
//!
//! - One transport contract, several implementations
//! - Every command either gets its reply or times out, exactly once
//! - A reconnecting page takes over its session from the stale socket
//! - Idle connections are evicted by a background sweep
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::time::Duration;
//!
//! use pagewire::{Command, ConnectionRegistry, RegistryConfig, RegistryServer, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = ConnectionRegistry::start(RegistryConfig::default());
//!     let server =
//!         RegistryServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 8765, registry.clone()).await?;
//!     println!("Pages connect to {}", server.ws_url());
//!
//!     // ... once a page has connected:
//!     if let Some(page) = registry.get_connections().first() {
//!         let reply = registry
//!             .send_command(
//!                 &page.id,
//!                 Command::with_payload("echo", json!({ "v": 1 })),
//!                 Duration::from_secs(5),
//!             )
//!             .await?;
//!         println!("Reply: {reply}");
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Command, reply and inbound frame types |
//! | [`registry`] | Server-side connection registry and WebSocket endpoint |
//! | [`transport`] | Transport contract and implementations |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections, sessions and commands.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire message types.
///
/// Commands sent to pages, their replies, and inbound frame classification.
pub mod protocol;

/// Server-side connection registry.
///
/// Session takeover, command correlation and staleness eviction.
pub mod registry;

/// Transport layer.
///
/// The [`Transport`] contract plus WebSocket, extension relay, bridge and
/// in-memory implementations.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CommandId, ConnectionId, SessionId};

// Protocol types
pub use protocol::{Command, CommandReply, CommandRequest, InboundFrame, PageInfo};

// Registry types
pub use registry::{Connection, ConnectionRegistry, RegistryConfig, RegistryServer};

// Transport types
pub use transport::{
    BridgeDirection, BridgeOptions, BridgeTarget, BridgeTransport, ExtensionRuntime,
    ExtensionTransport, MemoryTransport, Transport, TransportConfig, TransportEnvironment,
    TransportHandlers, TransportKind, TransportState, WebSocketOptions, WebSocketTransport,
    create_transport,
};
