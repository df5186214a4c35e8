use std::pin::Pin;

use anyhow::Context;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use relay_core::RuntimeError;
use relay_observability::{emit_event, ObservabilityEvent};
use relay_types::ActionSchema;

use crate::decoder::{decode_json_lines, truncate_for_error};

/// Keys every graph accepts and returns regardless of its declared schema.
const CONSTANT_KEYS: [&str; 2] = ["messages", "copilotkit"];

/// Snapshot of a platform thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    #[serde(default = "empty_object")]
    pub values: Value,
    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub tasks: Vec<Value>,
}

impl ThreadState {
    pub fn has_interrupts(&self) -> bool {
        self.tasks
            .first()
            .and_then(|task| task.get("interrupts"))
            .and_then(Value::as_array)
            .is_some_and(|interrupts| !interrupts.is_empty())
    }

    /// Name of the node that wrote the latest checkpoint.
    pub fn last_written_node(&self) -> Option<&str> {
        self.metadata
            .get("writes")
            .and_then(Value::as_object)
            .and_then(|writes| writes.keys().next())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assistant {
    pub assistant_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
}

/// Input, output and config keys declared by a graph. `None` means the graph
/// declares no restriction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaKeys {
    pub input: Option<Vec<String>>,
    pub output: Option<Vec<String>>,
    pub config: Option<Vec<String>>,
}

impl SchemaKeys {
    pub fn from_schemas(schemas: &Value) -> Self {
        let keys = |schema: &str| {
            schemas
                .get(schema)
                .and_then(|schema| schema.get("properties"))
                .and_then(Value::as_object)
                .map(|properties| properties.keys().cloned().collect::<Vec<_>>())
        };
        let config = keys("config_schema");
        let (Some(input), Some(output)) = (keys("input_schema"), keys("output_schema")) else {
            return Self {
                config,
                ..Self::default()
            };
        };
        let with_constants = |mut keys: Vec<String>| {
            if keys.is_empty() {
                return None;
            }
            keys.extend(CONSTANT_KEYS.iter().map(ToString::to_string));
            Some(keys)
        };
        Self {
            input: with_constants(input),
            output: with_constants(output),
            config,
        }
    }
}

/// Keeps only `keys` of an object; values pass through when there is no key
/// list or the value is not an object.
pub fn filter_keys(value: &Value, keys: Option<&[String]>) -> Value {
    match (value, keys) {
        (Value::Object(map), Some(keys)) => Value::Object(
            map.iter()
                .filter(|(key, _)| keys.iter().any(|allowed| allowed == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        _ => value.clone(),
    }
}

pub fn select_assistant(
    assistants: &[Assistant],
    assistant_id: Option<&str>,
    name: &str,
) -> anyhow::Result<Assistant> {
    let found = assistants.iter().find(|assistant| {
        assistant_id.is_some_and(|id| assistant.assistant_id == id)
            || assistant.name.as_deref() == Some(name)
    });
    if let Some(assistant) = found {
        return Ok(assistant.clone());
    }
    let available = assistants
        .iter()
        .map(|assistant| {
            format!(
                "{} (ID: {})",
                assistant.name.as_deref().unwrap_or("unnamed"),
                assistant.assistant_id
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    anyhow::bail!("No agent id found for `{name}`; available agents: [{available}]")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub configurable: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub assistant_id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Graph input; `None` resumes from the thread's checkpoint.
    pub input: Option<Value>,
    pub messages: Vec<Value>,
    pub state: Value,
    pub config: RunConfig,
    pub actions: Vec<ActionSchema>,
    pub stream_mode: Vec<String>,
    /// `{"resume": value}` when the run answers a pending interrupt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
}

pub type RunStream = Pin<Box<dyn Stream<Item = Result<Value, RuntimeError>> + Send>>;

/// A graph execution platform reachable by the runtime.
#[async_trait]
pub trait AgentPlatform: Send + Sync {
    /// Returns the thread's state, creating an empty thread when it does not
    /// exist yet.
    async fn get_or_create_thread(&self, thread_id: &str) -> anyhow::Result<ThreadState>;
    async fn thread_state(&self, thread_id: &str) -> anyhow::Result<ThreadState>;
    async fn update_state(
        &self,
        thread_id: &str,
        values: &Value,
        as_node: Option<&str>,
    ) -> anyhow::Result<()>;
    async fn find_assistant(&self, assistant_id: Option<&str>, name: &str)
        -> anyhow::Result<Assistant>;
    async fn schema_keys(&self, assistant_id: &str) -> anyhow::Result<SchemaKeys>;
    async fn graph_nodes(&self, assistant_id: &str) -> anyhow::Result<Vec<String>>;
    async fn stream_run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunStream>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<()>;
}

/// [`AgentPlatform`] over the platform's REST API.
pub struct HttpAgentPlatform {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAgentPlatform {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> anyhow::Result<Response> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;
        check_status(resp, what).await
    }

    async fn get_json(&self, path: &str, what: &str) -> anyhow::Result<Value> {
        let resp = self.send(self.client.get(self.url(path)), what).await?;
        resp.json().await.with_context(|| format!("invalid {what} response"))
    }

    async fn post_json(&self, path: &str, body: &Value, what: &str) -> anyhow::Result<Value> {
        let resp = self
            .send(self.client.post(self.url(path)).json(body), what)
            .await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("invalid {what} response"))
    }
}

async fn check_status(resp: Response, what: &str) -> anyhow::Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    emit_event(
        Level::WARN,
        ObservabilityEvent {
            event: "platform.request_failed",
            component: "remote.platform",
            status: Some(status.as_str()),
            detail: Some(what),
            ..Default::default()
        },
    );
    anyhow::bail!(
        "{what} failed with status {status}: {}",
        truncate_for_error(&text, 500)
    )
}

#[async_trait]
impl AgentPlatform for HttpAgentPlatform {
    async fn get_or_create_thread(&self, thread_id: &str) -> anyhow::Result<ThreadState> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("/threads/{thread_id}"))))
            .send()
            .await
            .context("thread lookup request failed")?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.post_json(
                "/threads",
                &json!({ "thread_id": thread_id, "if_exists": "do_nothing" }),
                "thread create",
            )
            .await?;
            return Ok(ThreadState {
                values: empty_object(),
                ..ThreadState::default()
            });
        }
        check_status(resp, "thread lookup").await?;
        self.thread_state(thread_id).await
    }

    async fn thread_state(&self, thread_id: &str) -> anyhow::Result<ThreadState> {
        let value = self
            .get_json(&format!("/threads/{thread_id}/state"), "thread state")
            .await?;
        serde_json::from_value(value).context("invalid thread state")
    }

    async fn update_state(
        &self,
        thread_id: &str,
        values: &Value,
        as_node: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut body = json!({ "values": values });
        if let Some(node) = as_node {
            body["as_node"] = json!(node);
        }
        self.post_json(&format!("/threads/{thread_id}/state"), &body, "state update")
            .await?;
        Ok(())
    }

    async fn find_assistant(
        &self,
        assistant_id: Option<&str>,
        name: &str,
    ) -> anyhow::Result<Assistant> {
        let found = self
            .post_json("/assistants/search", &json!({ "limit": 100 }), "assistant search")
            .await?;
        let assistants: Vec<Assistant> =
            serde_json::from_value(found).context("invalid assistant search response")?;
        select_assistant(&assistants, assistant_id, name)
    }

    async fn schema_keys(&self, assistant_id: &str) -> anyhow::Result<SchemaKeys> {
        let schemas = self
            .get_json(&format!("/assistants/{assistant_id}/schemas"), "graph schema")
            .await?;
        Ok(SchemaKeys::from_schemas(&schemas))
    }

    async fn graph_nodes(&self, assistant_id: &str) -> anyhow::Result<Vec<String>> {
        let graph = self
            .get_json(&format!("/assistants/{assistant_id}/graph"), "graph")
            .await?;
        Ok(graph
            .get("nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node| node.get("id"))
                    .map(|id| match id {
                        Value::String(id) => id.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream_run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunStream> {
        let path = format!("/threads/{}/runs/stream", request.thread_id);
        let resp = self
            .send(self.client.post(self.url(&path)).json(&request), "run stream")
            .await?;
        let mut values = Box::pin(decode_json_lines(resp.bytes_stream()));
        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = values.next() => next,
                };
                match next {
                    Some(item) => yield item,
                    None => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<()> {
        self.post_json(
            &format!("/threads/{thread_id}/runs/{run_id}/cancel"),
            &json!({}),
            "run cancel",
        )
        .await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
