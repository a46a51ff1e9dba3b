//! Bridge transport.
//!
//! Joins two transports into one logical transport and relays traffic
//! between them, e.g. a page-side extension channel and a WebSocket to the
//! controller.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   filter/transform (P→S)   ┌──────────────┐
//! │   primary    │ ─────────────────────────► │  secondary   │
//! │  Transport   │ ◄───────────────────────── │  Transport   │
//! └──────────────┘   filter/transform (S→P)   └──────────────┘
//!         └──────────── BridgeTransport ────────────┘
//! ```
//!
//! # State
//!
//! The bridge stores no state of its own; it is derived from the children:
//!
//! | primary | secondary | bridge |
//! |---------|-----------|--------|
//! | open | open | `Open` |
//! | open | not open | `Connecting` |
//! | not open | open | `Connecting` |
//! | not open | not open | `Closed` |
//!
//! `on_open` fires when the derived state enters `Open`, `on_close` when it
//! enters `Closed`. Child events that do not cross one of those boundaries
//! are silent.
//!
//! Relayed messages are best-effort: if the destination is not open the
//! message is dropped, there is no buffer. Explicit sends through
//! [`BridgeTransport::send_to`] fail instead.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::handlers::HandlerSlot;
use super::{Transport, TransportHandlers, TransportState};

// ============================================================================
// Types
// ============================================================================

/// Predicate deciding whether a message is relayed.
pub type MessageFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Rewrites a message before it is relayed.
pub type MessageTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Which way messages are relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeDirection {
    /// Both ways.
    #[default]
    Bidirectional,
    /// Primary to secondary only.
    PrimaryToSecondary,
    /// Secondary to primary only.
    SecondaryToPrimary,
}

impl BridgeDirection {
    /// Returns `true` if messages arriving on `from` are relayed.
    #[inline]
    #[must_use]
    pub const fn allows(self, from: BridgeSide) -> bool {
        match (self, from) {
            (Self::Bidirectional, _)
            | (Self::PrimaryToSecondary, BridgeSide::Primary)
            | (Self::SecondaryToPrimary, BridgeSide::Secondary) => true,
            _ => false,
        }
    }
}

/// One of the two children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSide {
    /// The primary child.
    Primary,
    /// The secondary child.
    Secondary,
}

impl BridgeSide {
    /// Returns the other side.
    #[inline]
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

/// Destination of an explicit send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeTarget {
    /// Primary only.
    Primary,
    /// Secondary only.
    Secondary,
    /// Both children; nothing is sent unless both are open.
    #[default]
    Both,
}

/// Derives the bridge state from the children's connected flags.
#[inline]
#[must_use]
pub const fn derive_state(primary_connected: bool, secondary_connected: bool) -> TransportState {
    match (primary_connected, secondary_connected) {
        (true, true) => TransportState::Open,
        (false, false) => TransportState::Closed,
        _ => TransportState::Connecting,
    }
}

// ============================================================================
// BridgeOptions
// ============================================================================

#[derive(Clone, Default)]
struct Route {
    filter: Option<MessageFilter>,
    transform: Option<MessageTransform>,
}

impl Route {
    fn accepts(&self, message: &Value) -> bool {
        self.filter.as_ref().is_none_or(|f| f(message))
    }

    fn apply(&self, message: Value) -> Value {
        match &self.transform {
            Some(f) => f(message),
            None => message,
        }
    }
}

/// Relay policy of a [`BridgeTransport`].
///
/// Defaults: bidirectional, no filtering, no transformation.
#[derive(Clone, Default)]
pub struct BridgeOptions {
    direction: BridgeDirection,
    primary_to_secondary: Route,
    secondary_to_primary: Route,
}

impl BridgeOptions {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the relay direction.
    #[inline]
    #[must_use]
    pub fn direction(mut self, direction: BridgeDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Only relays primary → secondary messages for which `f` returns `true`.
    #[must_use]
    pub fn filter_primary_to_secondary(
        mut self,
        f: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.primary_to_secondary.filter = Some(Arc::new(f));
        self
    }

    /// Only relays secondary → primary messages for which `f` returns `true`.
    #[must_use]
    pub fn filter_secondary_to_primary(
        mut self,
        f: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.secondary_to_primary.filter = Some(Arc::new(f));
        self
    }

    /// Rewrites primary → secondary messages.
    #[must_use]
    pub fn transform_primary_to_secondary(
        mut self,
        f: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.primary_to_secondary.transform = Some(Arc::new(f));
        self
    }

    /// Rewrites secondary → primary messages.
    #[must_use]
    pub fn transform_secondary_to_primary(
        mut self,
        f: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.secondary_to_primary.transform = Some(Arc::new(f));
        self
    }

    fn route(&self, from: BridgeSide) -> &Route {
        match from {
            BridgeSide::Primary => &self.primary_to_secondary,
            BridgeSide::Secondary => &self.secondary_to_primary,
        }
    }
}

impl fmt::Debug for BridgeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeOptions")
            .field("direction", &self.direction)
            .field("filter_p2s", &self.primary_to_secondary.filter.is_some())
            .field("filter_s2p", &self.secondary_to_primary.filter.is_some())
            .field("transform_p2s", &self.primary_to_secondary.transform.is_some())
            .field("transform_s2p", &self.secondary_to_primary.transform.is_some())
            .finish()
    }
}

// ============================================================================
// Internal State
// ============================================================================

struct Flags {
    primary: bool,
    secondary: bool,
    /// Last derived state, kept only to detect boundary crossings.
    state: TransportState,
}

struct BridgeShared {
    primary: Arc<dyn Transport>,
    secondary: Arc<dyn Transport>,
    options: BridgeOptions,
    flags: Mutex<Flags>,
    handlers: HandlerSlot,
}

impl BridgeShared {
    fn child(&self, side: BridgeSide) -> &Arc<dyn Transport> {
        match side {
            BridgeSide::Primary => &self.primary,
            BridgeSide::Secondary => &self.secondary,
        }
    }

    /// Records a child's connected flag and fires boundary callbacks.
    fn set_connected(&self, side: BridgeSide, connected: bool) {
        let (previous, current) = {
            let mut flags = self.flags.lock();
            match side {
                BridgeSide::Primary => flags.primary = connected,
                BridgeSide::Secondary => flags.secondary = connected,
            }
            let current = derive_state(flags.primary, flags.secondary);
            (std::mem::replace(&mut flags.state, current), current)
        };

        if previous == current {
            return;
        }
        debug!(?side, connected, from = %previous, to = %current, "Bridge state changed");

        let handlers = self.handlers.snapshot();
        match current {
            TransportState::Open => handlers.emit_open(),
            TransportState::Closed => handlers.emit_close(),
            _ => {}
        }
    }

    /// Relays a child's inbound message and reports it to the bridge observer.
    fn on_child_message(&self, from: BridgeSide, message: Value) {
        if self.options.direction.allows(from) {
            let route = self.options.route(from);
            if route.accepts(&message) {
                let destination = self.child(from.other());
                if destination.state().is_open() {
                    if let Err(e) = destination.send(route.apply(message.clone())) {
                        debug!(?from, error = %e, "Bridge relay failed");
                    }
                } else {
                    trace!(?from, "Destination not open, dropping relayed message");
                }
            } else {
                trace!(?from, "Message filtered out");
            }
        }

        self.handlers.snapshot().emit_message(message);
    }

    fn wire(self: &Arc<Self>, side: BridgeSide) {
        let (w_open, w_close, w_error, w_message) = (
            Arc::downgrade(self),
            Arc::downgrade(self),
            Arc::downgrade(self),
            Arc::downgrade(self),
        );

        let handlers = TransportHandlers::new()
            .on_open(move || with(&w_open, |b| b.set_connected(side, true)))
            .on_close(move || with(&w_close, |b| b.set_connected(side, false)))
            .on_error(move |e| with(&w_error, |b| b.handlers.snapshot().emit_error(e)))
            .on_message(move |m| with(&w_message, |b| b.on_child_message(side, m)));

        self.child(side).set_handlers(handlers);
    }
}

fn with(weak: &Weak<BridgeShared>, f: impl FnOnce(&BridgeShared)) {
    if let Some(shared) = weak.upgrade() {
        f(&shared);
    }
}

// ============================================================================
// BridgeTransport
// ============================================================================

/// A [`Transport`] composed of two child transports.
///
/// # Example
///
/// ```ignore
/// let bridge = BridgeTransport::new(
///     extension,
///     websocket,
///     BridgeOptions::new()
///         .direction(BridgeDirection::Bidirectional)
///         .filter_primary_to_secondary(|m| m["type"] != "internal"),
/// );
/// ```
pub struct BridgeTransport {
    shared: Arc<BridgeShared>,
}

impl BridgeTransport {
    /// Creates a bridge and wires both children.
    ///
    /// Attaching handlers to the children triggers their deferred connect.
    #[must_use]
    pub fn new(
        primary: Arc<dyn Transport>,
        secondary: Arc<dyn Transport>,
        options: BridgeOptions,
    ) -> Self {
        let shared = Arc::new(BridgeShared {
            primary,
            secondary,
            options,
            flags: Mutex::new(Flags {
                primary: false,
                secondary: false,
                state: TransportState::Closed,
            }),
            handlers: HandlerSlot::default(),
        });

        shared.wire(BridgeSide::Primary);
        shared.wire(BridgeSide::Secondary);

        // Read child states only once our handlers are in place, so an open
        // that lands during wiring is not missed.
        for side in [BridgeSide::Primary, BridgeSide::Secondary] {
            let open = shared.child(side).state().is_open();
            shared.set_connected(side, open);
        }

        Self { shared }
    }

    /// Returns the primary child.
    #[inline]
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn Transport> {
        &self.shared.primary
    }

    /// Returns the secondary child.
    #[inline]
    #[must_use]
    pub fn secondary(&self) -> &Arc<dyn Transport> {
        &self.shared.secondary
    }

    /// Sends `message` to the addressed child(ren).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if an addressed child is not open.
    /// For [`BridgeTarget::Both`] nothing is sent unless both are open.
    pub fn send_to(&self, message: Value, target: BridgeTarget) -> Result<()> {
        match target {
            BridgeTarget::Primary => self.send_child(BridgeSide::Primary, message),
            BridgeTarget::Secondary => self.send_child(BridgeSide::Secondary, message),
            BridgeTarget::Both => {
                for side in [BridgeSide::Primary, BridgeSide::Secondary] {
                    let state = self.shared.child(side).state();
                    if !state.is_open() {
                        return Err(Error::not_connected(state));
                    }
                }
                self.shared.primary.send(message.clone())?;
                self.shared.secondary.send(message)
            }
        }
    }

    fn send_child(&self, side: BridgeSide, message: Value) -> Result<()> {
        let child = self.shared.child(side);
        let state = child.state();
        if !state.is_open() {
            return Err(Error::not_connected(state));
        }
        child.send(message)
    }
}

impl Transport for BridgeTransport {
    fn send(&self, message: Value) -> Result<()> {
        self.send_to(message, BridgeTarget::Both)
    }

    fn close(&self) {
        let previous = {
            let mut flags = self.shared.flags.lock();
            flags.primary = false;
            flags.secondary = false;
            std::mem::replace(&mut flags.state, TransportState::Closed)
        };

        self.shared.primary.close();
        self.shared.secondary.close();

        if previous != TransportState::Closed {
            debug!(from = %previous, "Bridge closed");
            self.shared.handlers.snapshot().emit_close();
        }
    }

    fn state(&self) -> TransportState {
        self.shared.flags.lock().state
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.shared.handlers.replace(handlers);
    }

    fn connect(&self) -> Result<()> {
        self.shared.primary.connect()?;
        self.shared.secondary.connect()
    }
}

impl fmt::Debug for BridgeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("state", &self.state())
            .field("primary", &self.shared.primary.state())
            .field("secondary", &self.shared.secondary.state())
            .field("options", &self.shared.options)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
