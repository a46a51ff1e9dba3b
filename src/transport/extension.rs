//! Extension-messaging transport.
//!
//! Relays messages through a host-controlled extension runtime instead of a
//! socket. The runtime owns the channel's lifecycle, so this transport never
//! reconnects on its own: after a disconnect the caller decides whether to
//! call [`connect`](Transport::connect) again.
//!
//! # Connection Flow
//!
//! 1. Register a listener that ignores every sender but our own extension
//! 2. Send `{"type":"connect"}` to the relay and await `{"connected":true}`
//! 3. `Open`; ping the relay every [`PING_INTERVAL`]
//! 4. A failed, missing, or negative ping reply is a disconnect
//!
//! # Relay Messages
//!
//! | Direction | Shape |
//! |-----------|-------|
//! | Page → Relay | `{"type":"connect"}`, `{"type":"ping"}`, `{"type":"disconnect"}` |
//! | Page → Relay | `{"type":"message","data":…}` |
//! | Relay → Page | `{"type":"message","data":…}`, `{"type":"disconnected"}` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

use super::handlers::HandlerSlot;
use super::traits::runtime_handle;
use super::{Transport, TransportHandlers, TransportState};

// ============================================================================
// Constants
// ============================================================================

/// Interval between liveness pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

const CONNECT_TYPE: &str = "connect";
const PING_TYPE: &str = "ping";
const DISCONNECT_TYPE: &str = "disconnect";
const DISCONNECTED_TYPE: &str = "disconnected";
const MESSAGE_TYPE: &str = "message";

// ============================================================================
// ExtensionRuntime
// ============================================================================

/// Identity of the party that sent a runtime message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSender {
    /// Extension ID of the sender, if it is an extension.
    pub id: Option<String>,
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Listener invoked for every runtime message.
pub type RuntimeListener = Arc<dyn Fn(Value, &MessageSender) + Send + Sync>;

/// The host extension runtime the transport relays through.
///
/// Mirrors the request/response messaging surface that browser extension
/// runtimes expose to pages and content scripts.
#[async_trait]
pub trait ExtensionRuntime: Send + Sync {
    /// Returns the ID of the extension hosting this code, if any.
    fn extension_id(&self) -> Option<String>;

    /// Returns `true` if the runtime can carry messages at all.
    ///
    /// Used by transport auto-selection.
    fn is_available(&self) -> bool {
        self.extension_id().is_some()
    }

    /// Registers a message listener.
    fn add_listener(&self, listener: RuntimeListener) -> ListenerId;

    /// Removes a message listener. Unknown IDs are ignored.
    fn remove_listener(&self, id: ListenerId);

    /// Sends a message to `extension_id` and awaits its response.
    ///
    /// `Ok(None)` means the relay answered without a payload.
    async fn send_message(&self, extension_id: &str, message: Value) -> Result<Option<Value>>;
}

// ============================================================================
// Internal Types
// ============================================================================

/// Work for the connection task.
enum Outbound {
    Message(Value),
    Shutdown,
}

struct Control {
    state: TransportState,
    generation: u64,
    listener: Option<ListenerId>,
    outgoing: Option<mpsc::UnboundedSender<Outbound>>,
}

struct Shared {
    control: Mutex<Control>,
    handlers: HandlerSlot,
}

impl Shared {
    fn state(&self) -> TransportState {
        self.control.lock().state
    }

    fn try_open(&self, generation: u64) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation || control.state != TransportState::Connecting {
            return false;
        }
        control.state = TransportState::Open;
        true
    }

    /// Tears down the connection of `generation`.
    ///
    /// Returns the listener to remove and whether the transport had been open.
    fn tear_down(&self, generation: u64) -> Option<(Option<ListenerId>, bool)> {
        let mut control = self.control.lock();
        if control.generation != generation || control.state == TransportState::Closed {
            return None;
        }
        let was_open = control.state == TransportState::Open;
        control.state = TransportState::Closed;
        control.outgoing = None;
        Some((control.listener.take(), was_open))
    }

    /// Handles a message delivered by the runtime listener.
    fn on_runtime_message(&self, generation: u64, message: Value) -> bool {
        if self.control.lock().generation != generation {
            return false;
        }

        match message.get("type").and_then(Value::as_str) {
            Some(DISCONNECTED_TYPE) => return true,
            Some(MESSAGE_TYPE) if message.get("data").is_some() => {
                if self.state().is_open() {
                    let data = message.get("data").cloned().unwrap_or(Value::Null);
                    self.handlers.snapshot().emit_message(data);
                }
            }
            _ => {
                if self.state().is_open() {
                    self.handlers.snapshot().emit_message(message);
                }
            }
        }
        false
    }
}

// ============================================================================
// ExtensionTransport
// ============================================================================

/// [`Transport`] over an [`ExtensionRuntime`] relay.
pub struct ExtensionTransport {
    shared: Arc<Shared>,
    runtime: Arc<dyn ExtensionRuntime>,
    /// Relay to talk to; falls back to the runtime's own ID.
    extension_id: Option<String>,
}

impl ExtensionTransport {
    /// Creates a closed transport relaying through `runtime`.
    ///
    /// `extension_id` overrides the relay address; `None` uses the runtime's
    /// own extension ID.
    #[must_use]
    pub fn new(runtime: Arc<dyn ExtensionRuntime>, extension_id: Option<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: TransportState::Closed,
                    generation: 0,
                    listener: None,
                    outgoing: None,
                }),
                handlers: HandlerSlot::default(),
            }),
            runtime,
            extension_id,
        }
    }

    /// Returns the extension ID messages are exchanged with.
    #[must_use]
    pub fn relay_id(&self) -> Option<String> {
        self.extension_id
            .clone()
            .or_else(|| self.runtime.extension_id())
    }

    /// Removes the listener and fires `on_close` if the transport had opened.
    fn finish(
        shared: &Shared,
        runtime: &Arc<dyn ExtensionRuntime>,
        generation: u64,
        reason: &str,
    ) {
        let Some((listener, was_open)) = shared.tear_down(generation) else {
            return;
        };

        if let Some(id) = listener {
            runtime.remove_listener(id);
        }

        info!(reason, "Extension transport disconnected");
        if was_open {
            shared.handlers.snapshot().emit_close();
        }
    }
}

impl Transport for ExtensionTransport {
    fn send(&self, message: Value) -> Result<()> {
        let control = self.shared.control.lock();
        if control.state != TransportState::Open {
            return Err(Error::not_connected(control.state));
        }

        control
            .outgoing
            .as_ref()
            .ok_or(Error::ConnectionClosed)?
            .send(Outbound::Message(message))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self) {
        let (listener, outgoing, previous) = {
            let mut control = self.shared.control.lock();
            if control.state.is_closed_or_closing() {
                return;
            }
            let previous = std::mem::replace(&mut control.state, TransportState::Closed);
            (control.listener.take(), control.outgoing.take(), previous)
        };

        if let Some(id) = listener {
            self.runtime.remove_listener(id);
        }
        if let Some(tx) = outgoing {
            let _ = tx.send(Outbound::Shutdown);
        }

        if let (Some(relay), Ok(handle)) = (self.relay_id(), runtime_handle()) {
            let runtime = Arc::clone(&self.runtime);
            handle.spawn(async move {
                if let Err(e) = runtime
                    .send_message(&relay, json!({ "type": DISCONNECT_TYPE }))
                    .await
                {
                    debug!(error = %e, "Relay disconnect notification failed");
                }
            });
        }

        debug!(from = %previous, "Extension transport closed");
        self.shared.handlers.snapshot().emit_close();
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        let first = {
            let control = self.shared.control.lock();
            control.generation == 0 && control.state == TransportState::Closed
        };
        self.shared.handlers.replace(handlers);

        if first && let Err(e) = self.connect() {
            self.shared.handlers.snapshot().emit_error(&e);
        }
    }

    fn connect(&self) -> Result<()> {
        let relay = self
            .relay_id()
            .ok_or_else(|| Error::config("no extension ID available for the relay"))?;
        let handle = runtime_handle()?;

        let (generation, rx) = {
            let mut control = self.shared.control.lock();
            if control.state != TransportState::Closed {
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            control.generation += 1;
            control.state = TransportState::Connecting;
            control.outgoing = Some(tx);
            (control.generation, rx)
        };

        // Phase 1: listen, scoped to the host extension's own ID (not the relay).
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let own_id = self.runtime.extension_id();
        let runtime_ref: Weak<dyn ExtensionRuntime> = Arc::downgrade(&self.runtime);
        let listener: RuntimeListener = Arc::new(move |message, sender| {
            if own_id.is_none() || sender.id != own_id {
                trace!(sender = ?sender.id, "Ignoring message from foreign sender");
                return;
            }
            let (Some(shared), Some(runtime)) = (weak.upgrade(), runtime_ref.upgrade()) else {
                return;
            };
            if shared.on_runtime_message(generation, message) {
                Self::finish(&shared, &runtime, generation, "relay reported disconnect");
            }
        });
        let listener_id = self.runtime.add_listener(listener);

        {
            let mut control = self.shared.control.lock();
            if control.generation == generation && control.state == TransportState::Connecting {
                control.listener = Some(listener_id);
            } else {
                drop(control);
                self.runtime.remove_listener(listener_id);
                return Ok(());
            }
        }

        debug!(relay = %relay, generation, "Extension transport connecting");

        // Phase 2: handshake, then liveness probing.
        handle.spawn(run_connection(
            Arc::clone(&self.shared),
            Arc::clone(&self.runtime),
            relay,
            generation,
            rx,
        ));

        Ok(())
    }
}

impl fmt::Debug for ExtensionTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionTransport")
            .field("relay", &self.relay_id())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Connection Task
// ============================================================================

fn is_connected(reply: Option<&Value>) -> bool {
    reply
        .and_then(|v| v.get("connected"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

async fn run_connection(
    shared: Arc<Shared>,
    runtime: Arc<dyn ExtensionRuntime>,
    relay: String,
    generation: u64,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
) {
    let handshake = runtime
        .send_message(&relay, json!({ "type": CONNECT_TYPE }))
        .await;

    match handshake {
        Ok(ref reply) if is_connected(reply.as_ref()) => {}
        Ok(_) => {
            let error = Error::relay("relay refused the connection");
            shared.handlers.snapshot().emit_error(&error);
            ExtensionTransport::finish(&shared, &runtime, generation, "handshake refused");
            return;
        }
        Err(e) => {
            let error = Error::relay(format!("handshake failed: {e}"));
            shared.handlers.snapshot().emit_error(&error);
            ExtensionTransport::finish(&shared, &runtime, generation, "handshake failed");
            return;
        }
    }

    if !shared.try_open(generation) {
        return;
    }
    info!(relay = %relay, "Extension transport open");
    shared.handlers.snapshot().emit_open();

    let mut ticker = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reply = runtime.send_message(&relay, json!({ "type": PING_TYPE })).await;
                match reply {
                    Ok(ref r) if is_connected(r.as_ref()) => trace!("Relay ping ok"),
                    Ok(_) => {
                        warn!(relay = %relay, "Relay ping answered negatively");
                        ExtensionTransport::finish(&shared, &runtime, generation, "ping rejected");
                        break;
                    }
                    Err(e) => {
                        warn!(relay = %relay, error = %e, "Relay ping failed");
                        ExtensionTransport::finish(&shared, &runtime, generation, "ping failed");
                        break;
                    }
                }
            }

            work = outgoing.recv() => {
                match work {
                    Some(Outbound::Message(data)) => {
                        let envelope = json!({ "type": MESSAGE_TYPE, "data": data });
                        if let Err(e) = runtime.send_message(&relay, envelope).await {
                            let error = Error::relay(e.to_string());
                            shared.handlers.snapshot().emit_error(&error);
                        }
                    }
                    Some(Outbound::Shutdown) | None => break,
                }
            }
        }
    }

    trace!(generation, "Extension connection task terminated");
}

// ============================================================================
// Tests
// ============================================================================
