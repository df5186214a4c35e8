//! Conversation history merge and repair for remote-agent turns.
//!
//! Platform threads store messages in the graph runtime's own shape
//! (`type: human | ai | system | tool`); the conversions here translate to and
//! from [`Message`]. [`merge_messages`] folds a new turn into the thread's
//! prior history, noting the prior messages the client dropped, and
//! [`repair_messages`] restores the pairing invariant: every
//! assistant tool-call message is immediately followed by one result per call,
//! in call order.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::Level;

use relay_observability::{emit_event, ObservabilityEvent};
use relay_types::{Message, MessageRole, ToolCall};

pub fn platform_to_message(value: &Value) -> Option<Message> {
    let kind = value
        .get("type")
        .or_else(|| value.get("role"))
        .and_then(Value::as_str)?;
    let role = match kind {
        "human" | "user" => MessageRole::User,
        "ai" | "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        "tool" => MessageRole::Tool,
        other => {
            tracing::warn!(kind = other, "skipping platform message of unknown type");
            return None;
        }
    };
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut message = Message {
        id,
        role,
        content: content_text(value.get("content")),
        tool_calls: Vec::new(),
        tool_call_id: None,
        name: value.get("name").and_then(Value::as_str).map(ToString::to_string),
    };
    match role {
        MessageRole::Assistant => {
            message.tool_calls = value
                .get("tool_calls")
                .and_then(Value::as_array)
                .map(|calls| calls.iter().filter_map(platform_tool_call).collect())
                .unwrap_or_default();
            message.name = None;
        }
        MessageRole::Tool => {
            message.tool_call_id = value
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(ToString::to_string);
        }
        MessageRole::User | MessageRole::System => message.name = None,
    }
    Some(message)
}

fn platform_tool_call(value: &Value) -> Option<ToolCall> {
    let id = value.get("id").and_then(Value::as_str)?;
    let name = value.get("name").and_then(Value::as_str)?;
    let args = match value.get("args") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
        Some(args) if !args.is_null() => args.clone(),
        _ => json!({}),
    };
    Some(ToolCall::new(id, name, args))
}

/// Content may be a plain string, a list of content parts or a single part.
fn content_text(content: Option<&Value>) -> String {
    let part = match content {
        Some(Value::Array(parts)) => parts.first(),
        other => other,
    };
    match part {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Object(part)) => part
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

pub fn message_to_platform(message: &Message) -> Value {
    let kind = match message.role {
        MessageRole::User => "human",
        MessageRole::Assistant => "ai",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    };
    let mut out = Map::new();
    out.insert("id".to_string(), json!(message.id));
    out.insert("type".to_string(), json!(kind));
    out.insert("content".to_string(), json!(message.content));
    if message.role == MessageRole::Assistant {
        let calls = message
            .tool_calls
            .iter()
            .map(|call| json!({"id": call.id, "name": call.name, "args": call.args}))
            .collect::<Vec<_>>();
        out.insert("tool_calls".to_string(), Value::Array(calls));
    }
    if let Some(call_id) = &message.tool_call_id {
        out.insert("tool_call_id".to_string(), json!(call_id));
    }
    if let Some(name) = &message.name {
        out.insert("name".to_string(), json!(name));
    }
    Value::Object(out)
}

pub fn messages_from_platform(values: &Value) -> Vec<Message> {
    values
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| messages.iter().filter_map(platform_to_message).collect())
        .unwrap_or_default()
}

/// Platform form of a deletion; the thread's reducer drops the message with
/// this id.
pub fn removal_to_platform(id: &str) -> Value {
    json!({"type": "remove", "id": id, "content": ""})
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedHistory {
    pub messages: Vec<Message>,
    /// Prior messages the client no longer sends, in history order.
    pub removed: Vec<String>,
}

impl MergedHistory {
    /// Removals first, then the merged history.
    pub fn to_platform(&self) -> Vec<Value> {
        self.removed
            .iter()
            .map(|id| removal_to_platform(id))
            .chain(self.messages.iter().map(message_to_platform))
            .collect()
    }
}

/// Folds one turn's messages into the thread's prior history, then repairs
/// the result. A turn shorter than the prior history means the client deleted
/// messages: prior messages it no longer carries are removed.
pub fn merge_messages(prior: Vec<Message>, incoming: Vec<Message>, agent_name: &str) -> MergedHistory {
    let mut incoming = incoming;
    if incoming
        .first()
        .is_some_and(|message| message.role == MessageRole::System)
    {
        incoming.remove(0);
    }

    let mut merged = prior;
    let mut removed = Vec::new();
    if incoming.len() < merged.len() {
        let kept = incoming
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();
        merged.retain(|message| {
            let keep = kept.contains(&message.id);
            if !keep {
                removed.push(message.id.clone());
            }
            keep
        });
    }

    for message in incoming {
        match merged.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => {
                let prior_calls = std::mem::take(&mut existing.tool_calls);
                *existing = message;
                if existing.tool_calls.is_empty() {
                    existing.tool_calls = prior_calls;
                }
            }
            None => merged.push(message),
        }
    }
    MergedHistory {
        messages: repair_messages(merged, agent_name),
        removed,
    }
}

/// Removes self-invocations of `agent_name`, then realigns tool calls with
/// their results. Repairing an already repaired history is a no-op.
pub fn repair_messages(messages: Vec<Message>, agent_name: &str) -> Vec<Message> {
    realign(drop_self_invocations(messages, agent_name))
}

fn drop_self_invocations(messages: Vec<Message>, agent_name: &str) -> Vec<Message> {
    let self_call_ids = messages
        .iter()
        .flat_map(|message| message.tool_calls.iter())
        .filter(|call| call.name == agent_name)
        .map(|call| call.id.clone())
        .collect::<HashSet<_>>();

    let mut kept = Vec::with_capacity(messages.len());
    for mut message in messages {
        if message.is_tool_result() {
            let answers_self = message
                .tool_call_id
                .as_ref()
                .is_some_and(|id| self_call_ids.contains(id))
                || message.name.as_deref() == Some(agent_name);
            if answers_self {
                log_dropped("self_invocation_result", &message.id, agent_name);
                continue;
            }
        } else if message.has_tool_calls() {
            let before = message.tool_calls.len();
            message.tool_calls.retain(|call| call.name != agent_name);
            if message.tool_calls.len() != before {
                log_dropped("self_invocation_call", &message.id, agent_name);
                if message.tool_calls.is_empty() && message.content.is_empty() {
                    continue;
                }
            }
        }
        kept.push(message);
    }
    kept
}

fn realign(messages: Vec<Message>) -> Vec<Message> {
    let mut results: HashMap<String, (usize, Message)> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        if !message.is_tool_result() {
            continue;
        }
        let Some(call_id) = message.tool_call_id.clone() else {
            log_dropped("result_without_call_id", &message.id, "");
            continue;
        };
        if results.contains_key(&call_id) {
            log_dropped("duplicate_result", &message.id, &call_id);
            continue;
        }
        results.insert(call_id, (index, message.clone()));
    }

    let mut out = Vec::with_capacity(messages.len());
    let mut seen_calls = HashSet::new();
    for (index, mut message) in messages.into_iter().enumerate() {
        if message.is_tool_result() {
            continue;
        }
        if !message.has_tool_calls() {
            out.push(message);
            continue;
        }

        message.tool_calls.retain(|call| {
            if !seen_calls.insert(call.id.clone()) {
                log_dropped("duplicate_call", &call.id, &call.name);
                return false;
            }
            if !results.contains_key(&call.id) {
                log_dropped("call_without_result", &call.id, &call.name);
                return false;
            }
            true
        });
        if message.tool_calls.is_empty() && message.content.is_empty() {
            continue;
        }

        let call_ids = message
            .tool_calls
            .iter()
            .map(|call| call.id.clone())
            .collect::<Vec<_>>();
        out.push(message);
        for (offset, call_id) in call_ids.iter().enumerate() {
            if let Some((original, result)) = results.remove(call_id) {
                if original != index + offset + 1 {
                    tracing::debug!(
                        call_id = %call_id,
                        from = original,
                        "relocated tool result next to its call"
                    );
                }
                out.push(result);
            }
        }
    }

    for (call_id, (_, orphan)) in results {
        log_dropped("result_without_call", &orphan.id, &call_id);
    }
    out
}

fn log_dropped(reason: &str, id: &str, detail: &str) {
    emit_event(
        Level::WARN,
        ObservabilityEvent {
            event: "merge.dropped",
            component: "remote.merge",
            status: Some(reason),
            correlation_id: Some(id),
            detail: (!detail.is_empty()).then_some(detail),
            ..Default::default()
        },
    );
}

/// Converts the thread's platform messages to client form, placing each
/// tool result directly after the call it answers.
pub fn messages_for_client(values: &Value) -> Vec<Message> {
    let messages = messages_from_platform(values);
    let mut results = HashMap::new();
    for message in &messages {
        if let (true, Some(call_id)) = (message.is_tool_result(), &message.tool_call_id) {
            results.insert(call_id.clone(), message.clone());
        }
    }

    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        if message.is_tool_result() {
            continue;
        }
        let call_ids = message
            .tool_calls
            .iter()
            .map(|call| call.id.clone())
            .collect::<Vec<_>>();
        out.push(message);
        for call_id in call_ids {
            if let Some(result) = results.remove(&call_id) {
                out.push(result);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_message(id: &str, calls: &[(&str, &str)]) -> Message {
        Message::tool_calls(
            id,
            calls
                .iter()
                .map(|(call_id, name)| ToolCall::new(*call_id, *name, json!({})))
                .collect(),
        )
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn platform_messages_convert_both_ways() {
        let raw = json!([
            {"id": "h1", "type": "human", "content": [{"type": "text", "text": "hi"}]},
            {"id": "a1", "type": "ai", "content": "", "tool_calls": [
                {"id": "c1", "name": "search", "args": {"q": "x"}}
            ]},
            {"id": "t1", "type": "tool", "content": "found", "tool_call_id": "c1", "name": "search"},
            {"id": "z", "type": "chunk"}
        ]);
        let messages = messages_from_platform(&json!({"messages": raw}));
        assert_eq!(ids(&messages), vec!["h1", "a1", "t1"]);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].tool_calls[0].args, json!({"q": "x"}));
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("c1"));

        let back = message_to_platform(&messages[2]);
        assert_eq!(back["type"], json!("tool"));
        assert_eq!(back["tool_call_id"], json!("c1"));
        assert_eq!(platform_to_message(&back).as_ref(), Some(&messages[2]));
    }

    #[test]
    fn merge_drops_leading_system_and_replaces_by_id() {
        let prior = vec![
            Message::user("u1", "first"),
            call_message("a1", &[("c1", "search")]),
            Message::tool_result("t1", "c1", "search", "ok"),
        ];
        let incoming = vec![
            Message::system("s1", "be brief"),
            Message::assistant("a1", "thinking"),
            Message::user("u2", "second"),
        ];

        let merged = merge_messages(prior, incoming, "planner");
        assert_eq!(ids(&merged.messages), vec!["u1", "a1", "t1", "u2"]);
        assert_eq!(merged.messages[1].content, "thinking");
        assert_eq!(merged.messages[1].tool_calls.len(), 1);
        assert!(merged.removed.is_empty());
    }

    #[test]
    fn shorter_turn_removes_messages_the_client_dropped() {
        let prior = vec![
            Message::user("u1", "first"),
            call_message("a1", &[("c1", "search")]),
            Message::tool_result("t1", "c1", "search", "ok"),
            Message::user("u2", "second"),
        ];
        let incoming = vec![Message::user("u1", "first"), Message::user("u3", "retry")];

        let merged = merge_messages(prior, incoming, "planner");
        assert_eq!(merged.removed, vec!["a1", "t1", "u2"]);
        assert_eq!(ids(&merged.messages), vec!["u1", "u3"]);

        let platform = merged.to_platform();
        assert_eq!(platform[0], json!({"type": "remove", "id": "a1", "content": ""}));
        assert_eq!(platform.len(), 5);
        assert_eq!(platform[3]["type"], json!("human"));
    }

    #[test]
    fn turn_at_least_as_long_as_history_removes_nothing() {
        let prior = vec![Message::user("u1", "first")];
        let incoming = vec![Message::system("s1", "be brief"), Message::user("u2", "second")];
        let merged = merge_messages(prior, incoming, "planner");
        assert!(merged.removed.is_empty());
        assert_eq!(ids(&merged.messages), vec!["u1", "u2"]);
    }

    #[test]
    fn self_invocations_are_removed() {
        let messages = vec![
            Message::user("u1", "plan a trip"),
            call_message("a1", &[("c1", "planner")]),
            Message::tool_result("t1", "c1", "planner", ""),
            call_message("a2", &[("c2", "planner"), ("c3", "search")]),
            Message::tool_result("t2", "c2", "planner", ""),
            Message::tool_result("t3", "c3", "search", "ok"),
        ];
        let repaired = repair_messages(messages, "planner");
        assert_eq!(ids(&repaired), vec!["u1", "a2", "t3"]);
        assert_eq!(repaired[1].tool_calls.len(), 1);
    }

    #[test]
    fn realign_relocates_and_drops_unpaired_entries() {
        let messages = vec![
            Message::tool_result("t2", "c2", "weather", "sunny"),
            Message::user("u1", "hi"),
            call_message("a1", &[("c1", "search"), ("c2", "weather"), ("c4", "lost")]),
            Message::tool_result("t1", "c1", "search", "ok"),
            Message::tool_result("t1b", "c1", "search", "again"),
            Message::tool_result("t9", "c9", "ghost", "orphan"),
        ];
        let repaired = repair_messages(messages, "planner");
        assert_eq!(ids(&repaired), vec!["u1", "a1", "t1", "t2"]);
        assert_eq!(
            repaired[1]
                .tool_calls
                .iter()
                .map(|call| call.id.as_str())
                .collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );
    }

    #[test]
    fn repair_is_idempotent() {
        let messages = vec![
            Message::user("u1", "hi"),
            Message::tool_result("t1", "c1", "search", "ok"),
            call_message("a1", &[("c1", "search"), ("c2", "planner")]),
            Message::tool_result("t2", "c2", "planner", ""),
            call_message("a2", &[("c3", "lost")]),
            Message::assistant("a3", "done"),
        ];
        let once = repair_messages(messages, "planner");
        let twice = repair_messages(once.clone(), "planner");
        assert_eq!(once, twice);
        assert_eq!(ids(&once), vec!["u1", "a1", "t1", "a3"]);
    }

    #[test]
    fn client_messages_put_results_after_calls() {
        let values = json!({"messages": [
            {"id": "t1", "type": "tool", "content": "ok", "tool_call_id": "c1", "name": "search"},
            {"id": "a1", "type": "ai", "content": "", "tool_calls": [
                {"id": "c1", "name": "search", "args": {}}
            ]},
            {"id": "a2", "type": "ai", "content": "all done"}
        ]});
        let messages = messages_for_client(&values);
        assert_eq!(ids(&messages), vec!["a1", "t1", "a2"]);
        assert!(messages_for_client(&json!({})).is_empty());
    }
}
