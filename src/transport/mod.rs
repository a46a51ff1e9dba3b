//! Transport layer.
//!
//! Every channel between a controller and a page implements the same
//! [`Transport`] contract: send a JSON message, close, report state, and
//! notify a [`TransportHandlers`] callback set.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Page / Client  │        WebSocket             │   Controller    │
//! │                 │◄────────────────────────────►│                 │
//! │  Transport      │     ws://host:8765/ws        │  Registry       │
//! │                 │                              │  → Connection   │
//! └────────┬────────┘                              └─────────────────┘
//!          │ extension messaging
//!          ▼
//! ┌─────────────────┐
//! │  Relay          │
//! │  (Extension)    │
//! └─────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! 1. Create a transport directly or through [`create_transport`]
//! 2. [`Transport::set_handlers`] - wiring starts the connection
//! 3. `on_open` - [`Transport::send`] is now accepted
//! 4. `on_message` / `on_error` - inbound traffic and non-fatal failures
//! 5. [`Transport::close`] - `on_close` fires once
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `traits` | The [`Transport`] contract |
//! | `state` | [`TransportState`] |
//! | `handlers` | Callback set |
//! | `websocket` | Direct WebSocket, client or accepted, with reconnect |
//! | `extension` | Extension messaging relay with liveness ping |
//! | `bridge` | Two transports joined into one |
//! | `memory` | In-process pair for embedding and tests |
//! | `config` | Configuration and factory |

// ============================================================================
// Submodules
// ============================================================================

/// Two transports joined into one.
pub mod bridge;

/// Transport configuration and factory.
pub mod config;

/// Extension messaging relay.
pub mod extension;

/// Callback set.
pub mod handlers;

/// In-process transport.
pub mod memory;

/// Transport state machine.
pub mod state;

/// The transport contract.
pub mod traits;

/// Direct WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use bridge::{
    BridgeDirection, BridgeOptions, BridgeSide, BridgeTarget, BridgeTransport, derive_state,
};
pub use config::{
    TransportConfig, TransportEnvironment, TransportKind, create_transport, derive_websocket_url,
};
pub use extension::{ExtensionRuntime, ExtensionTransport, ListenerId, MessageSender};
pub use handlers::TransportHandlers;
pub use memory::MemoryTransport;
pub use state::TransportState;
pub use traits::Transport;
pub use websocket::{WebSocketOptions, WebSocketTransport};
