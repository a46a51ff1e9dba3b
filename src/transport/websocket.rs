//! Direct-channel WebSocket transport.
//!
//! A [`WebSocketTransport`] either dials a URL (client mode) or wraps a stream
//! a server has already accepted (see [`WebSocketTransport::accepted`]). Both
//! modes share one event loop that pumps text frames in and out of the
//! socket.
//!
//! # Reconnection
//!
//! Client mode reconnects after a *fixed* interval, with no backoff, until
//! `max_reconnect_attempts` consecutive attempts have failed. A successful
//! open resets the count.
//!
//! ```text
//! CLOSED ──connect()──► CONNECTING ──handshake──► OPEN
//!   ▲                        │                      │
//!   │        failed attempt  │      remote close    │
//!   └────────────────────────┴──────────────────────┘
//!        (wait reconnect_interval, retry while attempts < max)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

use super::handlers::HandlerSlot;
use super::traits::{encode_frame, runtime_handle};
use super::{Transport, TransportHandlers, TransportState};

// ============================================================================
// Constants
// ============================================================================

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

// ============================================================================
// WebSocketOptions
// ============================================================================

/// Client-mode connection options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketOptions {
    /// Endpoint to dial, e.g. `ws://127.0.0.1:8765/ws`.
    pub url: String,

    /// Reconnect after the connection drops or an attempt fails.
    pub reconnect: bool,

    /// Fixed delay between attempts.
    pub reconnect_interval: Duration,

    /// Maximum consecutive failed attempts; `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl WebSocketOptions {
    /// Creates options for `url` with reconnection enabled and unbounded.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: None,
        }
    }

    /// Enables or disables reconnection.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the delay between attempts.
    #[inline]
    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Caps the number of consecutive failed attempts.
    #[inline]
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, max: Option<u32>) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    /// Returns `true` if another attempt is allowed after `attempts` failures.
    #[inline]
    #[must_use]
    pub fn may_retry(&self, attempts: u32) -> bool {
        self.reconnect && self.max_reconnect_attempts.is_none_or(|max| attempts < max)
    }
}

// ============================================================================
// Internal Types
// ============================================================================

/// Commands for the event loop.
enum SocketCommand {
    /// Write a text frame.
    Frame(String),
    /// Close the socket.
    Close,
}

/// How a pump run ended.
enum PumpExit {
    /// `close()` was requested.
    Local,
    /// The peer closed or the stream ended.
    Remote,
    /// Read or write failed.
    Failed(Error),
}

/// State guarded by one lock.
///
/// `generation` changes on every `connect()`; a loop only mutates the control
/// block while its own generation is current.
struct Control {
    state: TransportState,
    generation: u64,
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
}

/// State shared between the transport handle and its event loop.
struct Shared {
    control: Mutex<Control>,
    handlers: HandlerSlot,
    attempts: AtomicU32,
    auto_connected: AtomicBool,
    /// Event loop of an accepted stream, started once handlers are attached.
    pending_pump: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl Shared {
    fn new(state: TransportState) -> Self {
        Self {
            control: Mutex::new(Control {
                state,
                generation: 0,
                commands: None,
            }),
            handlers: HandlerSlot::default(),
            attempts: AtomicU32::new(0),
            auto_connected: AtomicBool::new(false),
            pending_pump: Mutex::new(None),
        }
    }

    fn state(&self) -> TransportState {
        self.control.lock().state
    }

    /// Moves `Connecting → Open`. Fails if `close()` won the race.
    fn try_open(&self, generation: u64) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation || control.state != TransportState::Connecting {
            return false;
        }
        control.state = TransportState::Open;
        true
    }

    /// Moves back to `Connecting` for another attempt. Fails once closed.
    fn begin_attempt(&self, generation: u64) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation || control.commands.is_none() {
            return false;
        }
        control.state = TransportState::Connecting;
        true
    }

    /// Marks the socket closed. Returns `true` if `on_close` should fire.
    fn end_session(&self, generation: u64) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        let previous = std::mem::replace(&mut control.state, TransportState::Closed);
        previous != TransportState::Closed
    }

    /// Marks a failed attempt without firing `on_close`.
    ///
    /// Returns `true` if `close()` was requested during the attempt, in which
    /// case the caller owes the close callback.
    fn fail_attempt(&self, generation: u64) -> bool {
        let mut control = self.control.lock();
        if control.generation != generation {
            return false;
        }
        let previous = std::mem::replace(&mut control.state, TransportState::Closed);
        previous == TransportState::Closing
    }

    /// Drops the command sender once the loop gives up.
    fn retire(&self, generation: u64) {
        let mut control = self.control.lock();
        if control.generation == generation {
            control.commands = None;
        }
    }

    /// Decodes an inbound text frame and hands it to the callbacks.
    fn dispatch(&self, text: &str) {
        let handlers = self.handlers.snapshot();
        match serde_json::from_str::<Value>(text) {
            Ok(message) => handlers.emit_message(message),
            Err(e) => {
                debug!(error = %e, "Dropping unparseable frame");
                handlers.emit_error(&Error::protocol(format!("Invalid JSON frame: {e}")));
            }
        }
    }
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// WebSocket implementation of [`Transport`].
///
/// # Example
///
/// ```ignore
/// let transport = WebSocketTransport::new(
///     WebSocketOptions::new("ws://127.0.0.1:8765/ws").with_max_reconnect_attempts(Some(5)),
/// );
///
/// // Attaching handlers connects (deferred-connect policy).
/// transport.set_handlers(TransportHandlers::new().on_message(|m| println!("{m}")));
/// ```
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    /// `None` for accepted streams, which never reconnect.
    options: Option<WebSocketOptions>,
}

impl WebSocketTransport {
    /// Creates a client-mode transport. Nothing is dialed until
    /// [`connect`](Transport::connect) or [`set_handlers`](Transport::set_handlers).
    #[must_use]
    pub fn new(options: WebSocketOptions) -> Self {
        Self {
            shared: Arc::new(Shared::new(TransportState::Closed)),
            options: Some(options),
        }
    }

    /// Wraps a stream a server has already accepted.
    ///
    /// The transport starts `Open`. Frames are not read until handlers are
    /// attached, so nothing the peer sends right after the upgrade is lost.
    #[must_use]
    pub fn accepted<S>(stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::new(TransportState::Open));
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut control = shared.control.lock();
            control.generation = 1;
            control.commands = Some(tx);
        }

        let pump = run_accepted(Arc::downgrade(&shared), 1, stream, rx);
        *shared.pending_pump.lock() = Some(Box::pin(pump));

        Self {
            shared,
            options: None,
        }
    }

    /// Returns the configured URL, if this is a client-mode transport.
    #[inline]
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.options.as_ref().map(|o| o.url.as_str())
    }

    /// Returns the number of consecutive failed connection attempts.
    #[inline]
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Starts the event loop of an accepted stream, once.
    fn start_pending_pump(&self) -> Result<bool> {
        let Some(pump) = self.shared.pending_pump.lock().take() else {
            return Ok(false);
        };
        runtime_handle()?.spawn(pump);
        Ok(true)
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, message: Value) -> Result<()> {
        let frame = encode_frame(&message)?;

        let control = self.shared.control.lock();
        if control.state != TransportState::Open {
            return Err(Error::not_connected(control.state));
        }

        control
            .commands
            .as_ref()
            .ok_or(Error::ConnectionClosed)?
            .send(SocketCommand::Frame(frame))
            .map_err(|_| Error::ConnectionClosed)
    }

    fn close(&self) {
        let sender = {
            let mut control = self.shared.control.lock();
            // Taking the sender also cancels a reconnect that is waiting out
            // its interval while the state reads `Closed`.
            let sender = control.commands.take();
            if control.state.is_closed_or_closing() {
                return;
            }
            control.state = TransportState::Closing;
            sender
        };

        let never_started = self.shared.pending_pump.lock().take().is_some();
        let delivered = !never_started
            && sender.is_some_and(|tx| tx.send(SocketCommand::Close).is_ok());

        if !delivered {
            self.shared.control.lock().state = TransportState::Closed;
            self.shared.handlers.snapshot().emit_close();
        }

        debug!(url = ?self.url(), "WebSocket transport close requested");
    }

    fn state(&self) -> TransportState {
        self.shared.state()
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.shared.handlers.replace(handlers);

        if let Err(e) = self.start_pending_pump() {
            self.shared.handlers.snapshot().emit_error(&e);
            return;
        }

        if self.options.is_some()
            && self.shared.state() == TransportState::Closed
            && !self.shared.auto_connected.swap(true, Ordering::SeqCst)
            && let Err(e) = self.connect()
        {
            self.shared.handlers.snapshot().emit_error(&e);
        }
    }

    fn connect(&self) -> Result<()> {
        if self.start_pending_pump()? {
            return Ok(());
        }

        let Some(options) = self.options.clone() else {
            return if self.shared.state() == TransportState::Closed {
                Err(Error::config("accepted WebSocket cannot reconnect"))
            } else {
                Ok(())
            };
        };

        let handle = runtime_handle()?;

        let (generation, rx) = {
            let mut control = self.shared.control.lock();
            if control.commands.is_some() || control.state != TransportState::Closed {
                return Ok(());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            control.generation += 1;
            control.commands = Some(tx);
            control.state = TransportState::Connecting;
            (control.generation, rx)
        };

        self.shared.auto_connected.store(true, Ordering::SeqCst);
        self.shared.attempts.store(0, Ordering::SeqCst);
        debug!(url = %options.url, generation, "WebSocket transport connecting");

        handle.spawn(run_client(Arc::clone(&self.shared), options, generation, rx));
        Ok(())
    }
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url())
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        // The loop treats a vanished sender as a close request.
        self.shared.control.lock().commands = None;
        self.shared.pending_pump.lock().take();
    }
}

// ============================================================================
// Event Loops
// ============================================================================

/// Client-mode loop: dial, pump, and reconnect according to `options`.
async fn run_client(
    shared: Arc<Shared>,
    options: WebSocketOptions,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let mut attempts: u32 = 0;

    loop {
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(options.url.as_str()) => Some(result),
            () = wait_for_close(&mut commands) => None,
        };

        match connected {
            None => {
                // close() during the handshake
                if shared.end_session(generation) {
                    shared.handlers.snapshot().emit_close();
                }
                break;
            }

            Some(Ok((stream, _response))) => {
                if !shared.try_open(generation) {
                    let mut stream = stream;
                    let _ = stream.close(None).await;
                    if shared.end_session(generation) {
                        shared.handlers.snapshot().emit_close();
                    }
                    break;
                }

                attempts = 0;
                shared.attempts.store(0, Ordering::SeqCst);
                info!(url = %options.url, "WebSocket transport open");
                shared.handlers.snapshot().emit_open();

                let exit = pump(stream, &mut commands, &shared).await;
                if let PumpExit::Failed(ref e) = exit {
                    warn!(url = %options.url, error = %e, "WebSocket transport failed");
                    shared.handlers.snapshot().emit_error(e);
                }

                if shared.end_session(generation) {
                    shared.handlers.snapshot().emit_close();
                }

                if matches!(exit, PumpExit::Local) {
                    break;
                }
                debug!(url = %options.url, "WebSocket closed by remote");
            }

            Some(Err(e)) => {
                let error = Error::connection(format!("connect to {} failed: {e}", options.url));
                debug!(error = %error, attempts, "Connection attempt failed");
                shared.handlers.snapshot().emit_error(&error);

                if shared.fail_attempt(generation) {
                    shared.handlers.snapshot().emit_close();
                    break;
                }
            }
        }

        if !options.may_retry(attempts) {
            info!(url = %options.url, attempts, "WebSocket transport giving up");
            break;
        }

        attempts += 1;
        shared.attempts.store(attempts, Ordering::SeqCst);

        let cancelled = tokio::select! {
            () = sleep(options.reconnect_interval) => false,
            () = wait_for_close(&mut commands) => true,
        };

        if cancelled || !shared.begin_attempt(generation) {
            break;
        }
        debug!(url = %options.url, attempt = attempts, "Reconnecting");
    }

    shared.retire(generation);
    trace!(generation, "WebSocket client loop terminated");
}

/// Accepted-stream loop: pump until either side closes. Never reconnects.
async fn run_accepted<S>(
    shared: Weak<Shared>,
    generation: u64,
    stream: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let exit = pump(stream, &mut commands, &shared).await;
    if let PumpExit::Failed(ref e) = exit {
        warn!(error = %e, "Accepted WebSocket failed");
        shared.handlers.snapshot().emit_error(e);
    }

    if shared.end_session(generation) {
        shared.handlers.snapshot().emit_close();
    }
    shared.retire(generation);
    trace!("Accepted WebSocket loop terminated");
}

/// Moves frames between the socket and the command channel until closed.
async fn pump<S>(
    stream: WebSocketStream<S>,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    shared: &Shared,
) -> PumpExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_write, mut ws_read) = stream.split();

    loop {
        tokio::select! {
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => shared.dispatch(&text),

                    Some(Ok(Message::Close(_))) | None => return PumpExit::Remote,

                    Some(Err(e)) => return PumpExit::Failed(Error::WebSocket(e)),

                    // Ignore Binary, Ping, Pong
                    _ => {}
                }
            }

            command = commands.recv() => {
                match command {
                    Some(SocketCommand::Frame(text)) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            return PumpExit::Failed(Error::WebSocket(e));
                        }
                        trace!("Frame sent");
                    }

                    Some(SocketCommand::Close) | None => {
                        let _ = ws_write.close().await;
                        return PumpExit::Local;
                    }
                }
            }
        }
    }
}

/// Resolves once a close is requested or every sender is gone.
///
/// Frames queued while not open are discarded.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<SocketCommand>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, SocketCommand::Close) {
            return;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Echo server that accepts `connections` sockets, then stops listening.
    async fn echo_server(connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));

        tokio::spawn(async move {
            for _ in 0..connections {
                let (stream, _) = listener.accept().await.expect("accept");
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
                    while let Some(Ok(msg)) = ws.next().await {
                        if msg.is_text() && ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        url
    }

    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        drop(listener);
        url
    }

    #[test]
    fn test_options_defaults() {
        let options = WebSocketOptions::new("ws://localhost:1");
        assert!(options.reconnect);
        assert_eq!(options.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(options.max_reconnect_attempts, None);
        assert!(options.may_retry(u32::MAX - 1));
    }

    #[test]
    fn test_options_retry_budget() {
        let options = WebSocketOptions::new("ws://localhost:1").with_max_reconnect_attempts(Some(2));
        assert!(options.may_retry(0));
        assert!(options.may_retry(1));
        assert!(!options.may_retry(2));
        assert!(!options.with_reconnect(false).may_retry(0));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = WebSocketTransport::new(WebSocketOptions::new("ws://127.0.0.1:1"));
        let err = transport.send(json!({})).unwrap_err();
        assert!(matches!(
            err,
            Error::NotConnected {
                state: TransportState::Closed
            }
        ));
    }

    #[tokio::test]
    async fn test_handlers_trigger_connect_and_echo() {
        let url = echo_server(1).await;
        let transport = WebSocketTransport::new(WebSocketOptions::new(url));

        let opened = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (o, r) = (Arc::clone(&opened), Arc::clone(&received));
        transport.set_handlers(
            TransportHandlers::new()
                .on_open(move || {
                    o.fetch_add(1, Ordering::SeqCst);
                })
                .on_message(move |m| r.lock().push(m)),
        );

        wait_until(|| transport.state() == TransportState::Open).await;
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        transport.send(json!({ "v": 1 })).expect("send");
        wait_until(|| !received.lock().is_empty()).await;
        assert_eq!(received.lock()[0], json!({ "v": 1 }));

        transport.close();
    }

    #[tokio::test]
    async fn test_invalid_frame_reports_error_without_state_change() {
        let url = echo_server(1).await;
        let transport = WebSocketTransport::new(WebSocketOptions::new(url));
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        transport.set_handlers(TransportHandlers::new().on_error(move |err| {
            if matches!(err, Error::Protocol { .. }) {
                e.fetch_add(1, Ordering::SeqCst);
            }
        }));

        wait_until(|| transport.state() == TransportState::Open).await;
        transport.send(json!("definitely not json")).expect("send");

        wait_until(|| errors.load(Ordering::SeqCst) == 1).await;
        assert_eq!(transport.state(), TransportState::Open);
        transport.close();
    }

    #[tokio::test]
    async fn test_close_fires_once() {
        let url = echo_server(1).await;
        let transport = WebSocketTransport::new(WebSocketOptions::new(url));
        let closes = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closes);
        transport.set_handlers(TransportHandlers::new().on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        wait_until(|| transport.state() == TransportState::Open).await;
        transport.close();
        transport.close();
        assert_ne!(transport.state(), TransportState::Open);

        wait_until(|| transport.state() == TransportState::Closed).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        tokio::spawn(async move {
            // First socket is closed right after the upgrade, second stays up.
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            ws.close(None).await.ok();

            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("upgrade");
            while ws.next().await.is_some() {}
        });

        let transport = WebSocketTransport::new(
            WebSocketOptions::new(url).with_reconnect_interval(Duration::from_millis(20)),
        );
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (o, c) = (Arc::clone(&opens), Arc::clone(&closes));
        transport.set_handlers(
            TransportHandlers::new()
                .on_open(move || {
                    o.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        );

        wait_until(|| opens.load(Ordering::SeqCst) == 2).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.state(), TransportState::Open);
        assert_eq!(transport.reconnect_attempts(), 0);
        transport.close();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let url = closed_port_url().await;
        let transport = WebSocketTransport::new(
            WebSocketOptions::new(url)
                .with_reconnect_interval(Duration::from_millis(10))
                .with_max_reconnect_attempts(Some(2)),
        );
        let errors = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (e, c) = (Arc::clone(&errors), Arc::clone(&closes));
        transport.set_handlers(
            TransportHandlers::new()
                .on_error(move |_| {
                    e.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
        );

        // Initial attempt plus two retries.
        wait_until(|| errors.load(Ordering::SeqCst) == 3).await;
        wait_until(|| transport.shared.control.lock().commands.is_none()).await;

        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.reconnect_attempts(), 2);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_stops_reconnect_loop() {
        let url = closed_port_url().await;
        let transport = WebSocketTransport::new(
            WebSocketOptions::new(url).with_reconnect_interval(Duration::from_millis(10)),
        );
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        transport.set_handlers(TransportHandlers::new().on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        wait_until(|| errors.load(Ordering::SeqCst) >= 3).await;
        drop(transport);

        sleep(Duration::from_millis(50)).await;
        let after_drop = errors.load(Ordering::SeqCst);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(errors.load(Ordering::SeqCst), after_drop);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reconnect() {
        let url = closed_port_url().await;
        let transport = WebSocketTransport::new(
            WebSocketOptions::new(url).with_reconnect_interval(Duration::from_secs(60)),
        );
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        transport.set_handlers(TransportHandlers::new().on_error(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        wait_until(|| errors.load(Ordering::SeqCst) == 1).await;
        transport.close();

        wait_until(|| transport.shared.control.lock().commands.is_none()).await;
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
