use serde_json::Value;

use relay_core::RuntimeError;
use relay_types::{CanonicalEvent, Message};
use relay_wire::{custom_events, event_names, metadata_keys, WireRecord};

#[derive(Debug, Clone, PartialEq)]
enum ToolCallFilter {
    All(bool),
    Named(String),
    List(Vec<String>),
}

impl ToolCallFilter {
    fn from_metadata(metadata: &Value) -> Self {
        match metadata.get(metadata_keys::EMIT_TOOL_CALLS) {
            Some(Value::Bool(flag)) => ToolCallFilter::All(*flag),
            Some(Value::String(name)) => ToolCallFilter::Named(name.clone()),
            Some(Value::Array(names)) => ToolCallFilter::List(
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect(),
            ),
            _ => ToolCallFilter::All(true),
        }
    }

    fn allows(&self, tool_name: Option<&str>) -> bool {
        match self {
            ToolCallFilter::All(flag) => *flag,
            ToolCallFilter::Named(name) => tool_name == Some(name.as_str()),
            ToolCallFilter::List(names) => {
                tool_name.is_some_and(|tool| names.iter().any(|name| name == tool))
            }
        }
    }
}

/// What one `on_chat_model_stream` chunk carries.
struct ChunkView {
    message_id: Option<String>,
    content: Option<String>,
    has_tool_chunks: bool,
    started_call: Option<(String, String)>,
    finish_reason: Option<String>,
}

impl ChunkView {
    fn read(event: &Value) -> Self {
        let chunk = &event["data"]["chunk"];
        let field = |name: &str| {
            chunk
                .get("kwargs")
                .and_then(|kwargs| kwargs.get(name))
                .filter(|value| !value.is_null())
                .or_else(|| chunk.get(name))
        };
        let tool_chunks = field("tool_call_chunks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut content = match field("content") {
            Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
            Some(Value::Array(parts)) => parts
                .first()
                .and_then(|part| part.get("text"))
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(ToString::to_string),
            _ => None,
        };
        if content.is_none() {
            content = tool_chunks
                .iter()
                .filter_map(|chunk| chunk.get("args").and_then(Value::as_str))
                .find(|args| !args.is_empty())
                .map(ToString::to_string);
        }

        let started_call = tool_chunks.iter().find_map(|chunk| {
            let name = chunk.get("name").and_then(Value::as_str)?;
            let id = chunk.get("id").and_then(Value::as_str)?;
            Some((id.to_string(), name.to_string()))
        });

        Self {
            message_id: field("id").and_then(Value::as_str).map(ToString::to_string),
            content,
            has_tool_chunks: !tool_chunks.is_empty(),
            started_call,
            finish_reason: field("response_metadata")
                .and_then(|meta| meta.get("finish_reason"))
                .and_then(Value::as_str)
                .map(ToString::to_string),
        }
    }
}

/// Turns a remote run's wire records into canonical events.
///
/// Text and tool-call framing stays balanced: a new message closes the one
/// still open, a new tool call ends the previous one, and [`finish`] closes
/// whatever is left when the run ends.
///
/// [`finish`]: EventTranslator::finish
#[derive(Debug, Default)]
pub struct EventTranslator {
    last_message_id: Option<String>,
    last_tool_call_id: Option<String>,
    last_tool_call_name: Option<String>,
    in_tool_call: bool,
    open_message: Option<String>,
    open_tool_call: Option<String>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&mut self, record: &WireRecord) -> Result<Vec<CanonicalEvent>, RuntimeError> {
        let event = match record {
            WireRecord::StateSync(sync) => return Ok(vec![sync.clone().into_canonical()]),
            WireRecord::Raw(event) => event,
        };
        let mut out = Vec::new();
        match relay_wire::event_name(event).unwrap_or_default() {
            event_names::ON_CHAT_MODEL_STREAM => self.chat_model_stream(event, &mut out),
            event_names::ON_CUSTOM_EVENT => self.custom_event(event, &mut out),
            event_names::ON_INTERRUPT | event_names::ON_COPILOTKIT_INTERRUPT => {
                out.push(interrupt_event(event));
            }
            event_names::ON_COPILOTKIT_STATE_SYNC => {
                // A sync record that did not decode as one.
                tracing::warn!("ignoring malformed state sync record");
            }
            event_names::ON_COPILOTKIT_ERROR => {
                let error = &event["data"]["error"];
                let kind = error.get("type").and_then(Value::as_str).unwrap_or("Error");
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("agent reported an error");
                return Err(RuntimeError::unknown(format!("{kind}: {message}")));
            }
            _ => {}
        }
        Ok(out)
    }

    /// Closes any text message or tool call left open at end of stream.
    pub fn finish(&mut self) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        self.end_open_tool_call(&mut out);
        self.end_open_message(&mut out);
        out
    }

    fn chat_model_stream(&mut self, event: &Value, out: &mut Vec<CanonicalEvent>) {
        let metadata = event.get("metadata").cloned().unwrap_or(Value::Null);
        let filter = ToolCallFilter::from_metadata(&metadata);
        let emit_messages = metadata
            .get(metadata_keys::EMIT_MESSAGES)
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let view = ChunkView::read(event);
        let previous_message_id = self.last_message_id.clone();
        if view.message_id.is_some() {
            self.last_message_id = view.message_id.clone();
        }
        let call_start = view.started_call.is_some();
        let message_start = previous_message_id != self.last_message_id && !call_start;
        let call_end = view.finish_reason.as_deref() == Some("tool_calls")
            || (self.in_tool_call && !view.has_tool_chunks);
        self.in_tool_call = view.has_tool_chunks;

        if let Some((id, name)) = view.started_call.clone() {
            self.last_tool_call_id = Some(id);
            self.last_tool_call_name = Some(name);
        }
        let emit_call = filter.allows(self.last_tool_call_name.as_deref());

        if call_end && emit_call {
            if let Some(call_id) = self.last_tool_call_id.clone() {
                self.end_tool_call(call_id, out);
            }
        } else if view.finish_reason.as_deref() == Some("stop") && emit_messages {
            self.end_open_message(out);
        }

        if call_start && emit_call && self.open_tool_call != self.last_tool_call_id {
            self.end_open_tool_call(out);
            if let (Some(call_id), Some(tool_name)) =
                (self.last_tool_call_id.clone(), self.last_tool_call_name.clone())
            {
                self.open_tool_call = Some(call_id.clone());
                out.push(CanonicalEvent::ToolCallStart {
                    call_id,
                    tool_name,
                    parent_message_id: self.last_message_id.clone(),
                });
            }
        } else if message_start && emit_messages {
            if let Some(message_id) = self.last_message_id.clone() {
                self.start_message(message_id, out);
            }
        }

        let Some(content) = view.content else {
            return;
        };
        if view.has_tool_chunks {
            if emit_call && self.open_tool_call.is_some() {
                if let Some(call_id) = self.last_tool_call_id.clone() {
                    out.push(CanonicalEvent::ToolCallArgs {
                        call_id,
                        args_fragment: content,
                    });
                }
            }
        } else if emit_messages {
            let Some(message_id) = self.last_message_id.clone() else {
                return;
            };
            if self.open_message.as_deref() != Some(message_id.as_str()) {
                self.start_message(message_id.clone(), out);
            }
            out.push(CanonicalEvent::TextContent { message_id, content });
        }
    }

    fn custom_event(&mut self, event: &Value, out: &mut Vec<CanonicalEvent>) {
        let data = &event["data"];
        match event.get("name").and_then(Value::as_str).unwrap_or_default() {
            custom_events::MANUALLY_EMIT_MESSAGE => {
                let Some(message_id) = data.get("message_id").and_then(Value::as_str) else {
                    tracing::warn!("manual message without message_id");
                    return;
                };
                let content = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.push(CanonicalEvent::TextStart {
                    message_id: message_id.to_string(),
                    parent_message_id: None,
                });
                out.push(CanonicalEvent::TextContent {
                    message_id: message_id.to_string(),
                    content: content.to_string(),
                });
                out.push(CanonicalEvent::TextEnd {
                    message_id: message_id.to_string(),
                });
            }
            custom_events::MANUALLY_EMIT_TOOL_CALL => {
                let (Some(call_id), Some(tool_name)) = (
                    data.get("id").and_then(Value::as_str),
                    data.get("name").and_then(Value::as_str),
                ) else {
                    tracing::warn!("manual tool call without id or name");
                    return;
                };
                let args = data.get("args").cloned().unwrap_or(Value::Null);
                out.push(CanonicalEvent::ToolCallStart {
                    call_id: call_id.to_string(),
                    tool_name: tool_name.to_string(),
                    parent_message_id: Some(call_id.to_string()),
                });
                out.push(CanonicalEvent::ToolCallArgs {
                    call_id: call_id.to_string(),
                    args_fragment: args.to_string(),
                });
                out.push(CanonicalEvent::ToolCallEnd {
                    call_id: call_id.to_string(),
                });
            }
            _ => {}
        }
    }

    fn start_message(&mut self, message_id: String, out: &mut Vec<CanonicalEvent>) {
        self.end_open_message(out);
        self.open_message = Some(message_id.clone());
        out.push(CanonicalEvent::TextStart {
            message_id,
            parent_message_id: None,
        });
    }

    fn end_open_message(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let Some(message_id) = self.open_message.take() {
            out.push(CanonicalEvent::TextEnd { message_id });
        }
    }

    /// Ends `call_id` if it is the call currently open; a call is ended at
    /// most once per start.
    fn end_tool_call(&mut self, call_id: String, out: &mut Vec<CanonicalEvent>) {
        if self.open_tool_call.as_deref() != Some(call_id.as_str()) {
            return;
        }
        self.open_tool_call = None;
        out.push(CanonicalEvent::ToolCallEnd { call_id });
    }

    fn end_open_tool_call(&mut self, out: &mut Vec<CanonicalEvent>) {
        if let Some(call_id) = self.open_tool_call.take() {
            self.end_tool_call(call_id, out);
        }
    }
}

fn interrupt_event(event: &Value) -> CanonicalEvent {
    let text = |value: &Value| value.as_str().unwrap_or_default().to_string();
    let (value, messages) = match event.get("data") {
        Some(data) => (
            text(&data["value"]),
            serde_json::from_value::<Vec<Message>>(data["messages"].clone()).unwrap_or_default(),
        ),
        None => (text(&event["value"]), Vec::new()),
    };
    CanonicalEvent::AgentInterrupt {
        thread_id: text(&event["thread_id"]),
        agent_name: text(&event["agent_name"]),
        value,
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::ErrorCode;
    use relay_wire::StateSyncRecord;
    use serde_json::json;

    fn stream_event(chunk: Value, metadata: Value) -> WireRecord {
        WireRecord::Raw(json!({
            "event": "on_chat_model_stream",
            "data": {"chunk": chunk},
            "metadata": metadata
        }))
    }

    fn run(translator: &mut EventTranslator, records: &[WireRecord]) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        for record in records {
            out.extend(translator.translate(record).expect("translate"));
        }
        out.extend(translator.finish());
        out
    }

    #[test]
    fn text_stream_becomes_framed_message() {
        let mut translator = EventTranslator::new();
        let events = run(
            &mut translator,
            &[
                stream_event(json!({"id": "m1", "content": "Hel"}), json!({})),
                stream_event(json!({"id": "m1", "content": "lo"}), json!({})),
                stream_event(
                    json!({"id": "m1", "content": "", "response_metadata": {"finish_reason": "stop"}}),
                    json!({}),
                ),
            ],
        );
        assert_eq!(
            events,
            vec![
                CanonicalEvent::TextStart { message_id: "m1".to_string(), parent_message_id: None },
                CanonicalEvent::TextContent { message_id: "m1".to_string(), content: "Hel".to_string() },
                CanonicalEvent::TextContent { message_id: "m1".to_string(), content: "lo".to_string() },
                CanonicalEvent::TextEnd { message_id: "m1".to_string() },
            ]
        );
    }

    #[test]
    fn tool_call_chunks_become_start_args_end_once() {
        let mut translator = EventTranslator::new();
        let events = run(
            &mut translator,
            &[
                stream_event(
                    json!({"kwargs": {"id": "m1", "tool_call_chunks": [
                        {"id": "c1", "name": "search", "args": ""}
                    ]}}),
                    json!({}),
                ),
                stream_event(
                    json!({"kwargs": {"id": "m1", "tool_call_chunks": [{"args": "{\"q\":"}]}}),
                    json!({}),
                ),
                stream_event(
                    json!({"kwargs": {"id": "m1", "tool_call_chunks": [{"args": "\"x\"}"}]}}),
                    json!({}),
                ),
                stream_event(
                    json!({"kwargs": {"id": "m1", "tool_call_chunks": [],
                        "response_metadata": {"finish_reason": "tool_calls"}}}),
                    json!({}),
                ),
            ],
        );
        let kinds = events.iter().map(CanonicalEvent::kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec!["ToolCallStart", "ToolCallArgs", "ToolCallArgs", "ToolCallEnd"]
        );
        assert_eq!(
            events[0],
            CanonicalEvent::ToolCallStart {
                call_id: "c1".to_string(),
                tool_name: "search".to_string(),
                parent_message_id: Some("m1".to_string()),
            }
        );
    }

    #[test]
    fn metadata_suppresses_tool_calls_and_messages() {
        let mut translator = EventTranslator::new();
        let events = run(
            &mut translator,
            &[
                stream_event(
                    json!({"id": "m1", "tool_call_chunks": [
                        {"id": "c1", "name": "hidden", "args": "{}"}
                    ]}),
                    json!({"copilotkit:emit-tool-calls": ["visible"]}),
                ),
                stream_event(
                    json!({"id": "m2", "content": "secret"}),
                    json!({"copilotkit:emit-messages": false}),
                ),
            ],
        );
        assert!(events.is_empty(), "unexpected events: {events:?}");
    }

    #[test]
    fn manual_custom_events_are_expanded() {
        let mut translator = EventTranslator::new();
        let events = run(
            &mut translator,
            &[
                WireRecord::Raw(json!({
                    "event": "on_custom_event",
                    "name": "copilotkit_manually_emit_message",
                    "data": {"message_id": "m9", "message": "working on it"}
                })),
                WireRecord::Raw(json!({
                    "event": "on_custom_event",
                    "name": "copilotkit_manually_emit_tool_call",
                    "data": {"id": "c9", "name": "notify", "args": {"to": "ops"}}
                })),
            ],
        );
        let kinds = events.iter().map(CanonicalEvent::kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "TextStart",
                "TextContent",
                "TextEnd",
                "ToolCallStart",
                "ToolCallArgs",
                "ToolCallEnd"
            ]
        );
        assert_eq!(
            events[4],
            CanonicalEvent::ToolCallArgs {
                call_id: "c9".to_string(),
                args_fragment: "{\"to\":\"ops\"}".to_string(),
            }
        );
    }

    #[test]
    fn state_sync_and_error_records() {
        let mut translator = EventTranslator::new();
        let sync = StateSyncRecord {
            thread_id: "t1".to_string(),
            run_id: "r1".to_string(),
            agent_name: "planner".to_string(),
            node_name: "plan".to_string(),
            active: true,
            state: json!({"x": 1}),
            running: true,
            role: "assistant".to_string(),
        };
        let events = translator
            .translate(&WireRecord::StateSync(sync.clone()))
            .expect("sync");
        assert_eq!(events, vec![sync.into_canonical()]);

        let err = translator
            .translate(&WireRecord::Raw(json!({
                "event": "on_copilotkit_error",
                "data": {"error": {"type": "RateLimit", "message": "slow down"}}
            })))
            .expect_err("error record");
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert_eq!(err.message, "RateLimit: slow down");
    }

    #[test]
    fn finish_closes_dangling_message_and_call() {
        let mut translator = EventTranslator::new();
        let events = run(
            &mut translator,
            &[
                stream_event(json!({"id": "m1", "content": "partial"}), json!({})),
                stream_event(
                    json!({"id": "m1", "tool_call_chunks": [{"id": "c1", "name": "search", "args": "{"}]}),
                    json!({}),
                ),
            ],
        );
        let kinds = events.iter().map(CanonicalEvent::kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "TextStart",
                "TextContent",
                "ToolCallStart",
                "ToolCallArgs",
                "ToolCallEnd",
                "TextEnd"
            ]
        );
    }

    #[test]
    fn interrupt_records_become_interrupt_events() {
        let mut translator = EventTranslator::new();
        let events = run(
            &mut translator,
            &[
                WireRecord::Raw(json!({
                    "event": "on_interrupt",
                    "thread_id": "t1",
                    "agent_name": "planner",
                    "value": "approve?"
                })),
                WireRecord::Raw(json!({
                    "event": "on_copilotkit_interrupt",
                    "thread_id": "t1",
                    "agent_name": "planner",
                    "data": {"value": "pick a date", "messages": [
                        {"id": "h1", "role": "user", "content": "earlier"}
                    ]}
                })),
            ],
        );
        assert_eq!(
            events[0],
            CanonicalEvent::AgentInterrupt {
                thread_id: "t1".to_string(),
                agent_name: "planner".to_string(),
                value: "approve?".to_string(),
                messages: Vec::new(),
            }
        );
        let CanonicalEvent::AgentInterrupt { value, messages, .. } = &events[1] else {
            panic!("expected interrupt");
        };
        assert_eq!(value, "pick a date");
        assert_eq!(messages, &vec![Message::user("h1", "earlier")]);
    }
}
