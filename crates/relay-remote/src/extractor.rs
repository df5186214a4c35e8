use std::collections::HashMap;

use serde_json::{Map, Value};

use relay_types::EmitStateConfig;

use crate::partial_json::parse_partial_json;

/// Predicts agent state from tool-call arguments while they are still being
/// streamed, according to a list of [`EmitStateConfig`] mappings.
#[derive(Debug, Default, Clone)]
pub struct StreamingStateExtractor {
    configs: Vec<EmitStateConfig>,
    /// Argument text per tool name, in first-seen order.
    buffers: Vec<(String, String)>,
    current_tool: Option<String>,
    last_parsed: HashMap<String, Value>,
}

impl StreamingStateExtractor {
    pub fn new(configs: Vec<EmitStateConfig>) -> Self {
        Self {
            configs,
            ..Default::default()
        }
    }

    /// Builds an extractor from the `copilotkit:emit-intermediate-state`
    /// metadata value. Entries that are not valid mappings are skipped.
    pub fn from_metadata(value: &Value) -> Self {
        let configs = value
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        serde_json::from_value::<EmitStateConfig>(entry.clone())
                            .map_err(|err| {
                                tracing::warn!(error = %err, "ignoring invalid emit-state config");
                            })
                            .ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self::new(configs)
    }

    pub fn buffer_tool_call_chunk(&mut self, name: Option<&str>, args: &str) {
        match name {
            Some(name) => {
                self.current_tool = Some(name.to_string());
                match self.buffers.iter_mut().find(|(tool, _)| tool.as_str() == name) {
                    Some((_, buffer)) => *buffer = args.to_string(),
                    None => self.buffers.push((name.to_string(), args.to_string())),
                }
            }
            None => {
                let Some(current) = self.current_tool.as_deref() else {
                    return;
                };
                if let Some((_, buffer)) = self.buffers.iter_mut().find(|(tool, _)| tool.as_str() == current) {
                    buffer.push_str(args);
                }
            }
        }
    }

    /// Buffers the first tool-call chunk of an `on_chat_model_stream` event.
    pub fn buffer_tool_calls(&mut self, event: &Value) {
        let chunk = &event["data"]["chunk"];
        let chunks = chunk
            .get("tool_call_chunks")
            .or_else(|| chunk.get("kwargs").and_then(|kwargs| kwargs.get("tool_call_chunks")))
            .and_then(Value::as_array);
        let Some(first) = chunks.and_then(|chunks| chunks.first()) else {
            return;
        };
        let name = first.get("name").and_then(Value::as_str);
        let args = first.get("args").and_then(Value::as_str).unwrap_or_default();
        self.buffer_tool_call_chunk(name, args);
    }

    pub fn extract_state(&mut self) -> Map<String, Value> {
        let mut state = Map::new();
        for (tool, buffer) in &self.buffers {
            let Some(config) = self.configs.iter().find(|config| &config.tool == tool) else {
                continue;
            };
            let parsed = match parse_partial_json(buffer) {
                Some(parsed) => parsed,
                None => match self.last_parsed.get(tool) {
                    Some(previous) => previous.clone(),
                    None => continue,
                },
            };
            self.last_parsed.insert(tool.clone(), parsed.clone());

            let value = match &config.tool_argument {
                Some(argument) => parsed.get(argument).cloned(),
                None => Some(parsed),
            };
            // an absent argument leaves the key to the graph's own state
            if let Some(value) = value {
                state.insert(config.state_key.clone(), value);
            }
        }
        state
    }
}
