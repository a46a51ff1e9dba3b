//! Wire protocol message types.
//!
//! One UTF-8 JSON object per frame.
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `CommandRequest` | Controller → Page | Command with correlation ID |
//! | `CommandReply` | Page → Controller | Correlated result |
//! | `page_info` | Page → Controller | Metadata update (uncorrelated) |
//! | `heartbeat` | Page → Controller | Liveness (uncorrelated) |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Inbound frame classification |
//! | `request` | Command, request and reply types |

// ============================================================================
// Submodules
// ============================================================================

/// Inbound frame classification.
pub mod message;

/// Command request and reply types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{HEARTBEAT_TYPE, InboundFrame, PAGE_INFO_TYPE, PageInfo};
pub use request::{Command, CommandReply, CommandRequest};
