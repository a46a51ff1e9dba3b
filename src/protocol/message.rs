//! Inbound frame classification.
//!
//! Every frame a page sends is one of:
//!
//! | Shape | Variant | Handling |
//! |-------|---------|----------|
//! | `{commandId, success, ...}` | [`InboundFrame::Reply`] | Settles a pending command |
//! | `{type: "page_info", payload}` | [`InboundFrame::PageInfo`] | Merged into connection metadata |
//! | `{type: "heartbeat", payload}` | [`InboundFrame::Heartbeat`] | Refreshes liveness only |
//! | anything else | [`InboundFrame::Event`] | Passed to the registry event handler |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::CommandReply;

// ============================================================================
// Constants
// ============================================================================

/// `type` of the page metadata frame.
pub const PAGE_INFO_TYPE: &str = "page_info";

/// `type` of the liveness frame.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

// ============================================================================
// PageInfo
// ============================================================================

/// Page metadata carried by a `page_info` frame.
///
/// Absent fields leave the stored value untouched when merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Page URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Document title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Browser user agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Logical session the page belongs to.
    ///
    /// A blank value reads as absent.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "blank_session_as_none"
    )]
    pub session_id: Option<SessionId>,
}

fn blank_session_as_none<'de, D>(deserializer: D) -> StdResult<Option<SessionId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.and_then(SessionId::new))
}

impl PageInfo {
    /// Overwrites the fields present in `update`, keeping the rest.
    pub fn merge(&mut self, update: Self) {
        if update.url.is_some() {
            self.url = update.url;
        }
        if update.title.is_some() {
            self.title = update.title;
        }
        if update.user_agent.is_some() {
            self.user_agent = update.user_agent;
        }
        if update.session_id.is_some() {
            self.session_id = update.session_id;
        }
    }
}

// ============================================================================
// InboundFrame
// ============================================================================

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to a command.
    Reply(CommandReply),
    /// Page metadata update.
    PageInfo(PageInfo),
    /// Liveness ping.
    Heartbeat(Value),
    /// Any other frame.
    Event(Value),
}

impl InboundFrame {
    /// Classifies a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the frame carries `commandId` or a
    /// `page_info` type but does not match that shape.
    pub fn classify(value: Value) -> Result<Self> {
        if value.get("commandId").is_some() {
            let reply = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("Malformed reply: {e}")))?;
            return Ok(Self::Reply(reply));
        }

        match value.get("type").and_then(Value::as_str) {
            Some(PAGE_INFO_TYPE) => {
                let payload = value.get("payload").cloned().unwrap_or(Value::Null);
                let info = if payload.is_null() {
                    PageInfo::default()
                } else {
                    serde_json::from_value(payload)
                        .map_err(|e| Error::protocol(format!("Malformed page_info: {e}")))?
                };
                Ok(Self::PageInfo(info))
            }
            Some(HEARTBEAT_TYPE) => {
                Ok(Self::Heartbeat(value.get("payload").cloned().unwrap_or(Value::Null)))
            }
            _ => Ok(Self::Event(value)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
