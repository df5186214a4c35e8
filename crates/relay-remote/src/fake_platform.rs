//! In-memory [`AgentPlatform`] used by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::platform::{
    select_assistant, AgentPlatform, Assistant, RunRequest, RunStream, SchemaKeys, ThreadState,
};

pub(crate) enum Feed {
    /// Records followed by end of stream.
    Lines(Vec<Value>),
    /// Records, then the stream stays open until cancelled.
    Hang(Vec<Value>),
    /// Opening the stream fails with this message.
    Fail(String),
}

pub(crate) struct FakePlatform {
    pub prior: ThreadState,
    pub final_state: ThreadState,
    pub nodes: Vec<String>,
    pub schemas: Value,
    pub feeds: Mutex<VecDeque<Feed>>,
    pub updates: Mutex<Vec<(Value, Option<String>)>>,
    pub requests: Mutex<Vec<RunRequest>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new(feeds: Vec<Feed>) -> Self {
        Self {
            prior: ThreadState {
                values: json!({}),
                ..ThreadState::default()
            },
            final_state: ThreadState {
                values: json!({"x": 1}),
                metadata: json!({"writes": {"plan": {}}}),
                ..ThreadState::default()
            },
            nodes: vec!["plan".to_string(), "act".to_string()],
            schemas: json!({}),
            feeds: Mutex::new(feeds.into()),
            updates: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

pub(crate) fn chain_event(event: &str, node: &str, run_id: &str) -> Value {
    json!({
        "event": "events",
        "data": {
            "event": event,
            "name": node,
            "data": {},
            "metadata": {"langgraph_node": node, "run_id": run_id}
        }
    })
}

pub(crate) fn values(state: Value) -> Value {
    json!({"event": "values", "data": state})
}

#[async_trait]
impl AgentPlatform for FakePlatform {
    async fn get_or_create_thread(&self, _thread_id: &str) -> anyhow::Result<ThreadState> {
        Ok(self.prior.clone())
    }

    async fn thread_state(&self, _thread_id: &str) -> anyhow::Result<ThreadState> {
        Ok(self.final_state.clone())
    }

    async fn update_state(
        &self,
        _thread_id: &str,
        values: &Value,
        as_node: Option<&str>,
    ) -> anyhow::Result<()> {
        self.updates
            .lock()
            .expect("updates lock")
            .push((values.clone(), as_node.map(ToString::to_string)));
        Ok(())
    }

    async fn find_assistant(
        &self,
        assistant_id: Option<&str>,
        name: &str,
    ) -> anyhow::Result<Assistant> {
        let assistants = vec![Assistant {
            assistant_id: "asst-1".to_string(),
            name: Some("planner".to_string()),
            config: json!({"configurable": {"model": "default"}}),
        }];
        select_assistant(&assistants, assistant_id, name)
    }

    async fn schema_keys(&self, _assistant_id: &str) -> anyhow::Result<SchemaKeys> {
        Ok(SchemaKeys::from_schemas(&self.schemas))
    }

    async fn graph_nodes(&self, _assistant_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.nodes.clone())
    }

    async fn stream_run(
        &self,
        request: RunRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<RunStream> {
        self.requests.lock().expect("requests lock").push(request);
        let feed = self
            .feeds
            .lock()
            .expect("feeds lock")
            .pop_front()
            .unwrap_or(Feed::Lines(Vec::new()));
        match feed {
            Feed::Lines(lines) => Ok(Box::pin(futures::stream::iter(lines.into_iter().map(Ok)))),
            Feed::Hang(lines) => Ok(Box::pin(
                futures::stream::iter(lines.into_iter().map(Ok)).chain(futures::stream::pending()),
            )),
            Feed::Fail(message) => Err(anyhow::anyhow!(message)),
        }
    }

    async fn cancel_run(&self, _thread_id: &str, run_id: &str) -> anyhow::Result<()> {
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .push(run_id.to_string());
        Ok(())
    }
}
