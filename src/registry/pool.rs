//! Connection registry.
//!
//! Tracks every live page connection, maps logical sessions to sockets,
//! correlates commands with replies, and evicts connections that stop
//! talking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ConnectionRegistry              │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ conn-a1 → Transport (session s1)       │  │
//! │  │ conn-b2 → Transport (session s2)       │  │
//! │  │ conn-c3 → Transport (no session)       │  │
//! │  └────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ PendingCommands: CommandId → reply     │  │
//! │  └────────────────────────────────────────┘  │
//! │  sweeper: every 60s, evict idle > 5min      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Session Takeover
//!
//! At most one live connection holds a given session. When a new connection
//! announces a session that is already held, the older connection is
//! unregistered and its socket closed. Commands still pending on it are not
//! failed; they run into their timeout.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, SessionId};
use crate::protocol::{Command, CommandRequest, InboundFrame, PageInfo};
use crate::transport::{Transport, TransportHandlers};

use super::connection::{Connection, ConnectionEntry};
use super::pending::PendingCommands;

// ============================================================================
// Constants
// ============================================================================

/// Idle time after which a connection is evicted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Interval of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Timeout used by [`ConnectionRegistry::send`].
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of in-flight commands.
pub const DEFAULT_MAX_PENDING: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Receives frames that are not replies, `page_info` or heartbeats.
pub type EventHandler = Arc<dyn Fn(&ConnectionId, Value) + Send + Sync>;

/// Registry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Idle time after which a connection is evicted.
    pub stale_after: Duration,
    /// Interval of the background sweep.
    pub sweep_interval: Duration,
    /// Timeout used by [`ConnectionRegistry::send`].
    pub default_command_timeout: Duration,
    /// Maximum number of in-flight commands across all connections.
    pub max_pending: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            default_command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl RegistryConfig {
    /// Sets the idle time after which a connection is evicted.
    #[inline]
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the interval of the background sweep.
    #[inline]
    #[must_use]
    pub const fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Sets the timeout used by [`ConnectionRegistry::send`].
    #[inline]
    #[must_use]
    pub const fn with_default_command_timeout(mut self, timeout: Duration) -> Self {
        self.default_command_timeout = timeout;
        self
    }

    /// Sets the maximum number of in-flight commands.
    #[inline]
    #[must_use]
    pub const fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }
}

#[derive(Default)]
struct Tables {
    connections: FxHashMap<ConnectionId, ConnectionEntry>,
    sessions: FxHashMap<SessionId, ConnectionId>,
}

impl Tables {
    fn insert(&mut self, entry: ConnectionEntry) {
        let id = entry.connection.id;
        if let Some(session_id) = entry.connection.session_id() {
            self.sessions.insert(session_id.clone(), id);
        }
        self.connections.insert(id, entry);
    }

    fn evict(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let mut entry = self.connections.remove(id)?;
        if let Some(session_id) = entry.connection.session_id()
            && self.sessions.get(session_id) == Some(id)
        {
            self.sessions.remove(session_id);
        }
        entry.connection.connected = false;
        Some(entry)
    }

    /// Evicts the holder of `session_id` unless it is `keep`.
    fn evict_holder(
        &mut self,
        session_id: &SessionId,
        keep: &ConnectionId,
    ) -> Option<ConnectionEntry> {
        let holder = *self.sessions.get(session_id)?;
        if holder == *keep {
            return None;
        }
        self.evict(&holder)
    }
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Registry of live page connections.
///
/// Thread-safe; share it as `Arc<ConnectionRegistry>`. Locks are never held
/// while a socket is closed or a callback runs.
///
/// # Example
///
/// ```ignore
/// let registry = ConnectionRegistry::start(RegistryConfig::default());
/// let id = registry.add_connection(socket, PageInfo::default());
///
/// let result = registry
///     .send_command(&id, Command::with_payload("echo", json!({"v": 1})), Duration::from_secs(5))
///     .await?;
/// ```
pub struct ConnectionRegistry {
    config: RegistryConfig,
    tables: RwLock<Tables>,
    pending: Arc<PendingCommands>,
    event_handler: Mutex<Option<EventHandler>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// ConnectionRegistry - Constructor
// ============================================================================

impl ConnectionRegistry {
    /// Creates a registry without the background sweep.
    ///
    /// Call [`cleanup`](Self::cleanup) to evict stale connections.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tables: RwLock::new(Tables::default()),
            pending: PendingCommands::new(config.max_pending),
            event_handler: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }

    /// Creates a registry and starts the background sweep.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: RegistryConfig) -> Arc<Self> {
        let registry = Self::new(config);
        let handle = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&registry),
            config.sweep_interval,
        ));
        *registry.sweeper.lock() = Some(handle);

        info!(
            stale_after_secs = config.stale_after.as_secs(),
            sweep_interval_secs = config.sweep_interval.as_secs(),
            "ConnectionRegistry started"
        );
        registry
    }

    async fn sweep_loop(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

        loop {
            ticker.tick().await;
            let Some(registry) = weak.upgrade() else {
                break;
            };

            let removed = registry.cleanup();
            if removed > 0 {
                debug!(removed, "Sweep evicted stale connections");
            }
        }

        debug!("Sweep loop terminated");
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

// ============================================================================
// ConnectionRegistry - Connections
// ============================================================================

impl ConnectionRegistry {
    /// Registers a socket and returns its new identifier.
    ///
    /// If `info` names a session held by another connection, that connection
    /// is unregistered and its socket closed. The socket's handlers are
    /// replaced with the registry's own.
    pub fn add_connection(self: &Arc<Self>, socket: Arc<dyn Transport>, info: PageInfo) -> ConnectionId {
        let id = ConnectionId::generate();
        let entry = ConnectionEntry::new(id, Arc::clone(&socket), info, Instant::now());

        let superseded = {
            let mut tables = self.tables.write();
            let superseded = entry
                .connection
                .session_id()
                .and_then(|session_id| tables.evict_holder(session_id, &id));
            tables.insert(entry);
            superseded
        };

        if let Some(old) = superseded {
            info!(
                old = %old.connection.id,
                new = %id,
                session_id = ?old.connection.session_id().map(SessionId::as_str),
                "Session taken over by new connection"
            );
            old.socket.close();
        }

        self.wire(id, socket.as_ref());
        info!(connection_id = %id, "Connection registered");
        id
    }

    fn wire(self: &Arc<Self>, id: ConnectionId, socket: &dyn Transport) {
        let on_message = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);

        socket.set_handlers(
            TransportHandlers::new()
                .on_message(move |message| {
                    if let Some(registry) = on_message.upgrade() {
                        registry.handle_message(&id, message);
                    }
                })
                .on_close(move || {
                    if let Some(registry) = on_close.upgrade() {
                        registry.remove_connection(&id);
                    }
                })
                .on_error(move |e| {
                    warn!(connection_id = %id, error = %e, "Connection transport error");
                }),
        );
    }

    /// Unregisters a connection and closes its socket.
    ///
    /// Returns `false` if the connection was not registered. Commands still
    /// pending on it run into their timeout.
    pub fn remove_connection(&self, id: &ConnectionId) -> bool {
        let removed = self.tables.write().evict(id);

        match removed {
            Some(entry) => {
                entry.socket.close();
                info!(connection_id = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Merges `info` into a connection's metadata.
    ///
    /// Announcing a session held by another connection takes it over.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the connection is not registered.
    pub fn update_connection_info(&self, id: &ConnectionId, info: PageInfo) -> Result<()> {
        let superseded = {
            let mut tables = self.tables.write();
            if !tables.connections.contains_key(id) {
                return Err(Error::connection_not_found(*id));
            }

            let superseded = info
                .session_id
                .as_ref()
                .and_then(|session_id| tables.evict_holder(session_id, id));

            let Some(entry) = tables.connections.get_mut(id) else {
                return Err(Error::connection_not_found(*id));
            };
            let previous_session = entry.connection.info.session_id.clone();
            entry.connection.info.merge(info);
            entry.touch(Instant::now());
            let current_session = entry.connection.info.session_id.clone();

            if previous_session != current_session {
                if let Some(previous) = previous_session
                    && tables.sessions.get(&previous) == Some(id)
                {
                    tables.sessions.remove(&previous);
                }
                if let Some(current) = current_session {
                    tables.sessions.insert(current, *id);
                }
            }

            superseded
        };

        if let Some(old) = superseded {
            info!(
                old = %old.connection.id,
                new = %id,
                "Session taken over by page_info update"
            );
            old.socket.close();
        }

        trace!(connection_id = %id, "Connection info updated");
        Ok(())
    }

    /// Returns snapshots of all registered connections.
    #[must_use]
    pub fn get_connections(&self) -> Vec<Connection> {
        self.tables
            .read()
            .connections
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    /// Returns a snapshot of one connection.
    #[must_use]
    pub fn get_connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.tables
            .read()
            .connections
            .get(id)
            .map(|entry| entry.connection.clone())
    }

    /// Returns the connection currently holding `session_id`.
    #[must_use]
    pub fn get_connection_by_session_id(&self, session_id: &SessionId) -> Option<Connection> {
        let tables = self.tables.read();
        let id = tables.sessions.get(session_id)?;
        tables.connections.get(id).map(|entry| entry.connection.clone())
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.tables.read().connections.len()
    }
}

// ============================================================================
// ConnectionRegistry - Commands
// ============================================================================

impl ConnectionRegistry {
    /// Sends a command with the configured default timeout.
    ///
    /// # Errors
    ///
    /// As [`send_command`](Self::send_command).
    pub async fn send(&self, id: &ConnectionId, command: Command) -> Result<Value> {
        self.send_command(id, command, self.config.default_command_timeout)
            .await
    }

    /// Sends a command and waits for its reply.
    ///
    /// Must be awaited within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionNotFound`] if the connection is not registered
    /// - [`Error::TooManyPending`] if the pending table is full
    /// - [`Error::NotConnected`] if the socket refuses the frame
    /// - [`Error::CommandTimeout`] if no reply arrives within `timeout`
    /// - [`Error::CommandFailed`] if the page reports failure
    /// - [`Error::ConnectionClosed`] if the registry shuts down first
    pub async fn send_command(
        &self,
        id: &ConnectionId,
        command: Command,
        timeout: Duration,
    ) -> Result<Value> {
        let socket = {
            let tables = self.tables.read();
            let entry = tables
                .connections
                .get(id)
                .ok_or_else(|| Error::connection_not_found(*id))?;
            Arc::clone(&entry.socket)
        };

        let request = CommandRequest::new(command);
        let command_id = request.id;
        let frame = request.to_value()?;

        let reply_rx = self.pending.register(
            command_id,
            *id,
            request.command.command_type.clone(),
            timeout,
        )?;

        if let Err(e) = socket.send(frame) {
            self.pending.discard(&command_id);
            return Err(e);
        }

        trace!(
            connection_id = %id,
            command_id = %command_id,
            command_type = %request.command.command_type,
            "Command sent"
        );

        reply_rx.await?
    }

    /// Sends a command to the connection holding `session_id`.
    ///
    /// # Errors
    ///
    /// As [`send_command`](Self::send_command). An unknown session yields
    /// [`Error::Config`].
    pub async fn send_command_to_session(
        &self,
        session_id: &SessionId,
        command: Command,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self
            .tables
            .read()
            .sessions
            .get(session_id)
            .copied()
            .ok_or_else(|| Error::config(format!("no connection holds session '{session_id}'")))?;

        self.send_command(&id, command, timeout).await
    }

    /// Returns the number of in-flight commands.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// ConnectionRegistry - Inbound
// ============================================================================

impl ConnectionRegistry {
    /// Processes one inbound frame from a connection.
    ///
    /// Any frame refreshes the connection's liveness. Frames from
    /// unregistered connections are dropped.
    pub fn handle_message(&self, id: &ConnectionId, message: Value) {
        let known = {
            let mut tables = self.tables.write();
            match tables.connections.get_mut(id) {
                Some(entry) => {
                    entry.touch(Instant::now());
                    true
                }
                None => false,
            }
        };

        if !known {
            debug!(connection_id = %id, "Frame from unregistered connection dropped");
            return;
        }

        match InboundFrame::classify(message) {
            Ok(InboundFrame::Reply(reply)) => {
                self.pending.settle(reply, id);
            }
            Ok(InboundFrame::PageInfo(info)) => {
                if let Err(e) = self.update_connection_info(id, info) {
                    debug!(connection_id = %id, error = %e, "page_info ignored");
                }
            }
            Ok(InboundFrame::Heartbeat(_)) => {
                trace!(connection_id = %id, "Heartbeat");
            }
            Ok(InboundFrame::Event(event)) => {
                let handler = self.event_handler.lock().clone();
                match handler {
                    Some(handler) => handler(id, event),
                    None => trace!(connection_id = %id, "Unsolicited frame dropped"),
                }
            }
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Malformed frame");
            }
        }
    }

    /// Sets the handler for unsolicited frames.
    pub fn set_event_handler(&self, handler: impl Fn(&ConnectionId, Value) + Send + Sync + 'static) {
        *self.event_handler.lock() = Some(Arc::new(handler));
    }

    /// Clears the handler for unsolicited frames.
    pub fn clear_event_handler(&self) {
        *self.event_handler.lock() = None;
    }
}

// ============================================================================
// ConnectionRegistry - Lifecycle
// ============================================================================

impl ConnectionRegistry {
    /// Evicts every connection idle longer than the configured threshold.
    ///
    /// Returns the number of connections evicted.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let stale_after = self.config.stale_after;

        let evicted: Vec<ConnectionEntry> = {
            let mut tables = self.tables.write();
            let stale: Vec<ConnectionId> = tables
                .connections
                .values()
                .filter(|entry| entry.connection.idle_for(now) > stale_after)
                .map(|entry| entry.connection.id)
                .collect();

            stale.iter().filter_map(|id| tables.evict(id)).collect()
        };

        for entry in &evicted {
            info!(
                connection_id = %entry.connection.id,
                idle_secs = entry.connection.idle_for(now).as_secs(),
                "Stale connection evicted"
            );
            entry.socket.close();
        }

        evicted.len()
    }

    /// Stops the sweep, closes every connection, and fails pending commands
    /// with [`Error::ConnectionClosed`].
    pub fn shutdown(&self) {
        info!("ConnectionRegistry shutting down");

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let entries: Vec<ConnectionEntry> = {
            let mut tables = self.tables.write();
            tables.sessions.clear();
            tables.connections.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            entry.socket.close();
            debug!(connection_id = %entry.connection.id, "Connection closed during shutdown");
        }

        let failed = self.pending.fail_all();
        info!(failed, "ConnectionRegistry shutdown complete");
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
