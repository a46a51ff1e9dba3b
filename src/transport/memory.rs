//! In-process transport.
//!
//! [`MemoryTransport::pair`] links two ends so that whatever one end sends the
//! other receives, with the same text-frame encoding a socket would apply.
//! [`MemoryTransport::new`] creates a standalone end whose lifecycle is driven
//! by hand ([`connect`](Transport::connect), [`MemoryTransport::disconnect`],
//! [`MemoryTransport::inject`]), which makes it a convenient spy in tests:
//! every frame accepted by `send` is recorded. Linked pairs record nothing.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

use super::handlers::HandlerSlot;
use super::traits::encode_frame;
use super::{Transport, TransportHandlers, TransportState};

// ============================================================================
// MemoryTransport
// ============================================================================

/// One end of an in-process channel.
#[derive(Default)]
pub struct MemoryTransport {
    /// Current state.
    state: Mutex<TransportState>,
    /// Callback set.
    handlers: HandlerSlot,
    /// The linked end, if any.
    peer: Mutex<Weak<MemoryTransport>>,
    /// Every message accepted by `send`, when recording.
    sent: Mutex<Vec<Value>>,
    /// Standalone ends record; linked pairs do not.
    recording: bool,
}

impl MemoryTransport {
    /// Creates a standalone, closed end with no peer.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recording: true,
            ..Self::default()
        })
    }

    /// Creates two linked ends, both open.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self {
            state: Mutex::new(TransportState::Open),
            ..Self::default()
        });
        let b = Arc::new(Self {
            state: Mutex::new(TransportState::Open),
            ..Self::default()
        });

        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);

        (a, b)
    }

    /// Returns every message accepted by `send` so far.
    ///
    /// Always empty for ends created by [`pair`](Self::pair).
    #[must_use]
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Simulates an inbound message.
    ///
    /// Delivered to `on_message` regardless of state, the way a late frame
    /// from a socket would be.
    pub fn inject(&self, message: Value) {
        self.handlers.snapshot().emit_message(message);
    }

    /// Simulates the remote side going away.
    ///
    /// Moves to `Closed` and fires `on_close` if the end was open or
    /// connecting. The peer, if any, is not touched.
    pub fn disconnect(&self) {
        let was = std::mem::replace(&mut *self.state.lock(), TransportState::Closed);
        if was != TransportState::Closed {
            trace!(from = %was, "Memory transport disconnected");
            self.handlers.snapshot().emit_close();
        }
    }

    /// Receives a text frame sent by the peer.
    fn receive(&self, frame: &str) {
        if !self.state.lock().is_open() {
            return;
        }

        let handlers = self.handlers.snapshot();
        match serde_json::from_str::<Value>(frame) {
            Ok(message) => handlers.emit_message(message),
            Err(e) => handlers.emit_error(&Error::protocol(format!("Invalid JSON frame: {e}"))),
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: Value) -> Result<()> {
        let state = *self.state.lock();
        if !state.is_open() {
            return Err(Error::not_connected(state));
        }

        let frame = encode_frame(&message)?;
        if self.recording {
            self.sent.lock().push(message);
        }

        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.receive(&frame);
        }

        Ok(())
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.is_closed_or_closing() {
                return;
            }
            *state = TransportState::Closing;
        }

        *self.state.lock() = TransportState::Closed;
        self.handlers.snapshot().emit_close();

        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.close();
        }
    }

    fn state(&self) -> TransportState {
        *self.state.lock()
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.handlers.replace(handlers);
    }

    fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != TransportState::Closed {
                return Ok(());
            }
            *state = TransportState::Open;
        }

        self.handlers.snapshot().emit_open();
        Ok(())
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("state", &*self.state.lock())
            .field("linked", &(self.peer.lock().strong_count() > 0))
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (Arc::clone(&c), c)
    }

    #[test]
    fn test_pair_delivers_messages() {
        let (a, b) = MemoryTransport::pair();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        b.set_handlers(TransportHandlers::new().on_message(move |m| sink.lock().push(m)));

        a.send(json!({ "hello": "world" })).expect("send");

        assert_eq!(*received.lock(), vec![json!({ "hello": "world" })]);
        assert!(a.sent().is_empty());
    }

    #[test]
    fn test_standalone_end_records_sends() {
        let t = MemoryTransport::new();
        t.connect().expect("connect");

        t.send(json!(1)).expect("send");
        t.send(json!({ "n": 2 })).expect("send");

        assert_eq!(t.sent(), vec![json!(1), json!({ "n": 2 })]);
    }

    #[test]
    fn test_string_payload_is_raw_frame() {
        let (a, b) = MemoryTransport::pair();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        b.set_handlers(TransportHandlers::new().on_message(move |m| sink.lock().push(m)));

        a.send(json!("{\"v\":2}")).expect("send");
        assert_eq!(*received.lock(), vec![json!({ "v": 2 })]);
    }

    #[test]
    fn test_invalid_frame_is_error_not_state_change() {
        let (a, b) = MemoryTransport::pair();
        let (errors, seen) = counter();
        b.set_handlers(TransportHandlers::new().on_error(move |e| {
            assert!(matches!(e, Error::Protocol { .. }));
            errors.fetch_add(1, Ordering::SeqCst);
        }));

        a.send(json!("not json")).expect("send");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), TransportState::Open);
    }

    #[test]
    fn test_send_when_closed_fails() {
        let t = MemoryTransport::new();
        let err = t.send(json!({})).unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                state: TransportState::Closed
            }
        ));
        assert!(t.sent().is_empty());
    }

    #[test]
    fn test_close_is_idempotent_and_fires_once() {
        let (a, b) = MemoryTransport::pair();
        let (closes, seen) = counter();
        a.set_handlers(TransportHandlers::new().on_close(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        }));

        a.close();
        a.close();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(a.state(), TransportState::Closed);
        assert_eq!(b.state(), TransportState::Closed);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let t = MemoryTransport::new();
        let (events, seen) = counter();
        let e2 = Arc::clone(&events);
        t.set_handlers(
            TransportHandlers::new()
                .on_open(move || {
                    events.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move || {
                    e2.fetch_add(100, Ordering::SeqCst);
                }),
        );

        t.connect().expect("connect");
        t.connect().expect("connect again is a no-op");
        assert_eq!(t.state(), TransportState::Open);

        t.disconnect();
        t.disconnect();
        assert_eq!(seen.load(Ordering::SeqCst), 101);
    }
}
