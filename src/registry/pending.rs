//! Pending command table.
//!
//! Each in-flight command owns an entry holding the reply sender and a timer
//! task. Whoever removes the entry from the table settles the command, so a
//! reply and a timeout can race without settling twice.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::{CommandId, ConnectionId};
use crate::protocol::CommandReply;

// ============================================================================
// Types
// ============================================================================

struct PendingCommand {
    connection_id: ConnectionId,
    command_type: String,
    reply_tx: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

// ============================================================================
// PendingCommands
// ============================================================================

/// Correlation table for in-flight commands.
pub(crate) struct PendingCommands {
    table: Mutex<FxHashMap<CommandId, PendingCommand>>,
    max_pending: usize,
}

impl PendingCommands {
    pub(crate) fn new(max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(FxHashMap::default()),
            max_pending,
        })
    }

    /// Registers a command and arms its timeout.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyPending`] when the table is full.
    pub(crate) fn register(
        self: &Arc<Self>,
        command_id: CommandId,
        connection_id: ConnectionId,
        command_type: String,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Value>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut table = self.table.lock();

        if table.len() >= self.max_pending {
            return Err(Error::TooManyPending {
                pending: table.len(),
                max: self.max_pending,
            });
        }

        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pending) = weak.upgrade() {
                pending.expire(command_id, timeout);
            }
        });

        table.insert(
            command_id,
            PendingCommand {
                connection_id,
                command_type,
                reply_tx,
                timer,
            },
        );

        Ok(reply_rx)
    }

    /// Settles a command from a reply received on `from`.
    ///
    /// Returns `false` if the ID is unknown or the reply arrived on a
    /// connection other than the one the command was sent to.
    pub(crate) fn settle(&self, reply: CommandReply, from: &ConnectionId) -> bool {
        let command_id = reply.command_id;
        let entry = {
            let mut table = self.table.lock();
            match table.get(&command_id) {
                Some(entry) if entry.connection_id == *from => table.remove(&command_id),
                Some(entry) => {
                    warn!(
                        command_id = %command_id,
                        expected = %entry.connection_id,
                        actual = %from,
                        "Reply arrived on a different connection, ignored"
                    );
                    return false;
                }
                None => {
                    debug!(command_id = %command_id, "Reply for unknown or settled command");
                    return false;
                }
            }
        };

        let Some(entry) = entry else {
            return false;
        };

        entry.timer.abort();
        let result = reply.into_result(&entry.command_type);
        let _ = entry.reply_tx.send(result);
        true
    }

    /// Drops a command without settling it; the caller reports the failure.
    pub(crate) fn discard(&self, command_id: &CommandId) {
        if let Some(entry) = self.table.lock().remove(command_id) {
            entry.timer.abort();
        }
    }

    /// Fails every pending command with [`Error::ConnectionClosed`].
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.table.lock().drain().collect();
        let count = drained.len();

        for (_, entry) in drained {
            entry.timer.abort();
            let _ = entry.reply_tx.send(Err(Error::ConnectionClosed));
        }

        count
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }

    fn expire(&self, command_id: CommandId, timeout: Duration) {
        let Some(entry) = self.table.lock().remove(&command_id) else {
            return;
        };

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(
            command_id = %command_id,
            command_type = %entry.command_type,
            timeout_ms,
            "Command timed out"
        );

        let _ = entry
            .reply_tx
            .send(Err(Error::command_timeout(entry.command_type, timeout_ms)));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn register(
        pending: &Arc<PendingCommands>,
        connection_id: ConnectionId,
        timeout_ms: u64,
    ) -> (CommandId, oneshot::Receiver<Result<Value>>) {
        let id = CommandId::generate();
        let rx = pending
            .register(id, connection_id, "echo".into(), Duration::from_millis(timeout_ms))
            .expect("register");
        (id, rx)
    }

    #[tokio::test]
    async fn test_reply_settles_once() {
        let pending = PendingCommands::new(10);
        let conn = ConnectionId::generate();
        let (id, rx) = register(&pending, conn, 1_000);

        assert!(pending.settle(CommandReply::success(id, json!(1)), &conn));
        assert!(!pending.settle(CommandReply::success(id, json!(2)), &conn));

        assert_eq!(rx.await.expect("sender").expect("success"), json!(1));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_command() {
        let pending = PendingCommands::new(10);
        let conn = ConnectionId::generate();
        let (id, rx) = register(&pending, conn, 1_000);

        let err = rx.await.expect("sender").unwrap_err();
        assert!(matches!(
            &err,
            Error::CommandTimeout { command_type, timeout_ms: 1_000 } if command_type == "echo"
        ));

        // A late reply is ignored.
        assert!(!pending.settle(CommandReply::success(id, json!(1)), &conn));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_reply_from_other_connection_is_ignored() {
        let pending = PendingCommands::new(10);
        let conn = ConnectionId::generate();
        let (id, _rx) = register(&pending, conn, 1_000);

        assert!(!pending.settle(CommandReply::success(id, json!(1)), &ConnectionId::generate()));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_reply() {
        let pending = PendingCommands::new(10);
        let conn = ConnectionId::generate();
        let (id, rx) = register(&pending, conn, 1_000);

        pending.settle(CommandReply::failure(id, "boom"), &conn);
        let err = rx.await.expect("sender").unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(err.to_string(), "Command 'echo' failed: boom");
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let pending = PendingCommands::new(2);
        let conn = ConnectionId::generate();
        let _a = register(&pending, conn, 1_000);
        let _b = register(&pending, conn, 1_000);

        let err = pending
            .register(CommandId::generate(), conn, "echo".into(), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Error::TooManyPending { pending: 2, max: 2 }));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingCommands::new(10);
        let conn = ConnectionId::generate();
        let (_, rx1) = register(&pending, conn, 1_000);
        let (_, rx2) = register(&pending, conn, 1_000);

        assert_eq!(pending.fail_all(), 2);
        assert!(matches!(rx1.await.expect("sender"), Err(Error::ConnectionClosed)));
        assert!(matches!(rx2.await.expect("sender"), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_discard() {
        let pending = PendingCommands::new(10);
        let (id, rx) = register(&pending, ConnectionId::generate(), 1_000);

        pending.discard(&id);
        assert_eq!(pending.len(), 0);
        assert!(rx.await.is_err());
    }
}
