use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ActionError, Message};

/// The normalized protocol unit produced by backend adapters and consumed
/// uniformly downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum CanonicalEvent {
    TextStart {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    TextContent {
        message_id: String,
        content: String,
    },
    TextEnd {
        message_id: String,
    },
    ToolCallStart {
        call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    ToolCallArgs {
        call_id: String,
        args_fragment: String,
    },
    ToolCallEnd {
        call_id: String,
    },
    ToolCallResult {
        call_id: String,
        tool_name: String,
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ActionError>,
    },
    AgentStateSync {
        thread_id: String,
        agent_name: String,
        node_name: String,
        run_id: String,
        active: bool,
        state: Value,
        running: bool,
    },
    /// The graph paused and is waiting for the client to resume it. `value`
    /// is the interrupt payload as text; `messages` only accompany interrupts
    /// raised through the copilotkit helper.
    AgentInterrupt {
        thread_id: String,
        agent_name: String,
        value: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        messages: Vec<Message>,
    },
}

impl CanonicalEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalEvent::TextStart { .. } => "TextStart",
            CanonicalEvent::TextContent { .. } => "TextContent",
            CanonicalEvent::TextEnd { .. } => "TextEnd",
            CanonicalEvent::ToolCallStart { .. } => "ToolCallStart",
            CanonicalEvent::ToolCallArgs { .. } => "ToolCallArgs",
            CanonicalEvent::ToolCallEnd { .. } => "ToolCallEnd",
            CanonicalEvent::ToolCallResult { .. } => "ToolCallResult",
            CanonicalEvent::AgentStateSync { .. } => "AgentStateSync",
            CanonicalEvent::AgentInterrupt { .. } => "AgentInterrupt",
        }
    }

    /// Tool-call id for the four tool-call event kinds.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            CanonicalEvent::ToolCallStart { call_id, .. }
            | CanonicalEvent::ToolCallArgs { call_id, .. }
            | CanonicalEvent::ToolCallEnd { call_id }
            | CanonicalEvent::ToolCallResult { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            CanonicalEvent::TextStart { message_id, .. }
            | CanonicalEvent::TextContent { message_id, .. }
            | CanonicalEvent::TextEnd { message_id } => Some(message_id),
            _ => None,
        }
    }
}
