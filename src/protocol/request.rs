//! Command request and reply message types.
//!
//! Defines the frames exchanged between the controller side (Rust) and the
//! page for correlated commands.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::CommandId;

// ============================================================================
// Command
// ============================================================================

/// A command addressed to a page.
///
/// The core never interprets `command_type` or `payload`; they are forwarded
/// to the page as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, e.g. `"snapshot"` or `"click"`.
    #[serde(rename = "type")]
    pub command_type: String,

    /// Command arguments.
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Command {
    /// Creates a command with an empty payload.
    #[inline]
    #[must_use]
    pub fn new(command_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            payload: empty_object(),
        }
    }

    /// Creates a command with the given payload.
    #[inline]
    #[must_use]
    pub fn with_payload(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
        }
    }
}

// ============================================================================
// CommandRequest
// ============================================================================

/// A command together with its correlation ID, as written to the wire.
///
/// # Format
///
/// ```json
/// {
///   "id": "uuid",
///   "type": "echo",
///   "payload": { "v": 1 }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    /// Correlation ID echoed back as `commandId`.
    pub id: CommandId,

    /// Command type and payload.
    #[serde(flatten)]
    pub command: Command,
}

impl CommandRequest {
    /// Creates a request with an auto-generated ID.
    #[inline]
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            id: CommandId::generate(),
            command,
        }
    }

    /// Creates a request with a specific ID.
    #[inline]
    #[must_use]
    pub fn with_id(id: CommandId, command: Command) -> Self {
        Self { id, command }
    }

    /// Serializes the request to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload cannot be serialized.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

// ============================================================================
// CommandReply
// ============================================================================

/// A reply from the page to a command.
///
/// # Format
///
/// Success:
/// ```json
/// { "commandId": "uuid", "success": true, "data": { ... } }
/// ```
///
/// Failure:
/// ```json
/// { "commandId": "uuid", "success": false, "error": "message" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    /// Matches the request `id`.
    pub command_id: CommandId,

    /// Whether the command succeeded.
    pub success: bool,

    /// Result data (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error string (if failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    /// Creates a success reply.
    #[must_use]
    pub fn success(command_id: CommandId, data: Value) -> Self {
        Self {
            command_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates a failure reply.
    #[must_use]
    pub fn failure(command_id: CommandId, error: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Converts the reply into the command's result.
    ///
    /// Missing `data` on success becomes `null`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandFailed`] if the reply carries `success: false`.
    pub fn into_result(self, command_type: &str) -> Result<Value> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            let message = self.error.unwrap_or_else(|| "unknown error".to_string());
            Err(Error::command_failed(command_type, message))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let id = CommandId::generate();
        let request =
            CommandRequest::with_id(id, Command::with_payload("echo", json!({ "v": 1 })));
        let value = request.to_value().expect("serialize");

        assert_eq!(
            value,
            json!({ "id": id.to_string(), "type": "echo", "payload": { "v": 1 } })
        );
    }

    #[test]
    fn test_command_default_payload() {
        let command: Command = serde_json::from_value(json!({ "type": "ping" })).expect("parse");
        assert_eq!(command.payload, json!({}));
    }

    #[test]
    fn test_reply_success_into_result() {
        let id = CommandId::generate();
        let reply: CommandReply = serde_json::from_value(json!({
            "commandId": id.to_string(),
            "success": true,
            "data": { "v": 1 }
        }))
        .expect("parse");

        assert_eq!(reply.into_result("echo").expect("ok"), json!({ "v": 1 }));
    }

    #[test]
    fn test_reply_success_without_data_is_null() {
        let reply = CommandReply {
            command_id: CommandId::generate(),
            success: true,
            data: None,
            error: None,
        };
        assert_eq!(reply.into_result("noop").expect("ok"), Value::Null);
    }

    #[test]
    fn test_reply_failure_carries_error() {
        let reply = CommandReply::failure(CommandId::generate(), "element not found");
        let err = reply.into_result("click").unwrap_err();
        assert!(matches!(
            err,
            Error::CommandFailed { ref command_type, ref message }
                if command_type == "click" && message == "element not found"
        ));
    }

    #[test]
    fn test_reply_failure_without_error_string() {
        let reply: CommandReply = serde_json::from_value(json!({
            "commandId": CommandId::generate().to_string(),
            "success": false
        }))
        .expect("parse");

        let err = reply.into_result("hover").unwrap_err();
        assert_eq!(err.to_string(), "Command 'hover' failed: unknown error");
    }
}
