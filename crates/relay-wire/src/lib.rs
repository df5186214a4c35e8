use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::CanonicalEvent;

pub mod event_names {
    pub const ON_CHAIN_START: &str = "on_chain_start";
    pub const ON_CHAIN_END: &str = "on_chain_end";
    pub const ON_CHAT_MODEL_START: &str = "on_chat_model_start";
    pub const ON_CHAT_MODEL_STREAM: &str = "on_chat_model_stream";
    pub const ON_CHAT_MODEL_END: &str = "on_chat_model_end";
    pub const ON_TOOL_START: &str = "on_tool_start";
    pub const ON_TOOL_END: &str = "on_tool_end";
    pub const ON_CUSTOM_EVENT: &str = "on_custom_event";
    pub const ON_COPILOTKIT_STATE_SYNC: &str = "on_copilotkit_state_sync";
    pub const ON_COPILOTKIT_ERROR: &str = "on_copilotkit_error";
    pub const ON_INTERRUPT: &str = "on_interrupt";
    pub const ON_COPILOTKIT_INTERRUPT: &str = "on_copilotkit_interrupt";
}

/// Keys of the interrupt payload a paused graph reports.
pub mod interrupt_keys {
    pub const INTERRUPTS: &str = "__interrupt__";
    pub const COPILOTKIT_VALUE: &str = "__copilotkit_interrupt_value__";
    pub const COPILOTKIT_MESSAGES: &str = "__copilotkit_messages__";
}

pub mod custom_events {
    pub const EXIT: &str = "copilotkit_exit";
    pub const MANUALLY_EMIT_INTERMEDIATE_STATE: &str = "copilotkit_manually_emit_intermediate_state";
    pub const MANUALLY_EMIT_MESSAGE: &str = "copilotkit_manually_emit_message";
    pub const MANUALLY_EMIT_TOOL_CALL: &str = "copilotkit_manually_emit_tool_call";
}

pub mod metadata_keys {
    pub const NODE: &str = "langgraph_node";
    pub const RUN_ID: &str = "run_id";
    pub const EMIT_INTERMEDIATE_STATE: &str = "copilotkit:emit-intermediate-state";
    pub const EMIT_TOOL_CALLS: &str = "copilotkit:emit-tool-calls";
    pub const EMIT_MESSAGES: &str = "copilotkit:emit-messages";
}

/// Node name reported once the graph has nothing left to run.
pub const END_NODE: &str = "__end__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncRecord {
    pub thread_id: String,
    pub run_id: String,
    pub agent_name: String,
    pub node_name: String,
    pub active: bool,
    pub state: Value,
    pub running: bool,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "assistant".to_string()
}

impl StateSyncRecord {
    pub fn into_canonical(self) -> CanonicalEvent {
        CanonicalEvent::AgentStateSync {
            thread_id: self.thread_id,
            agent_name: self.agent_name,
            node_name: self.node_name,
            run_id: self.run_id,
            active: self.active,
            state: self.state,
            running: self.running,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "event")]
enum TaggedRecord {
    #[serde(rename = "on_copilotkit_state_sync")]
    StateSync(StateSyncRecord),
}

/// One line of the stream a remote run produces: either a synthesized state
/// sync or a raw platform execution event passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRecord {
    StateSync(StateSyncRecord),
    Raw(Value),
}

impl WireRecord {
    pub fn from_value(value: Value) -> Self {
        if event_name(&value) == Some(event_names::ON_COPILOTKIT_STATE_SYNC) {
            if let Ok(TaggedRecord::StateSync(record)) =
                serde_json::from_value::<TaggedRecord>(value.clone())
            {
                return WireRecord::StateSync(record);
            }
        }
        WireRecord::Raw(value)
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            WireRecord::StateSync(record) => {
                serde_json::to_value(TaggedRecord::StateSync(record.clone()))
            }
            WireRecord::Raw(value) => Ok(value.clone()),
        }
    }

    /// Encodes the record as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(&self.to_value()?)?;
        line.push('\n');
        Ok(line)
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            WireRecord::StateSync(_) => Some(event_names::ON_COPILOTKIT_STATE_SYNC),
            WireRecord::Raw(value) => event_name(value),
        }
    }
}

pub fn event_name(value: &Value) -> Option<&str> {
    value.get("event").and_then(Value::as_str)
}

/// The interrupts carried by a `values` or `updates` payload, if any.
pub fn pending_interrupts(data: &Value) -> Option<&[Value]> {
    data.get(interrupt_keys::INTERRUPTS)
        .and_then(Value::as_array)
        .filter(|interrupts| !interrupts.is_empty())
        .map(Vec::as_slice)
}

/// A record of the platform's run stream, classified by its `event` field.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformChunk {
    Events(Value),
    Values(Value),
    Updates(Value),
    Metadata(Value),
    Error(String),
    Other(String),
}

impl PlatformChunk {
    pub fn from_value(value: Value) -> Self {
        let kind = event_name(&value).unwrap_or_default().to_string();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        match kind.as_str() {
            "events" => PlatformChunk::Events(data),
            "values" => PlatformChunk::Values(data),
            "updates" => PlatformChunk::Updates(data),
            "metadata" => PlatformChunk::Metadata(data),
            "error" => PlatformChunk::Error(
                data.get("message")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| data.to_string()),
            ),
            _ => PlatformChunk::Other(kind),
        }
    }
}
