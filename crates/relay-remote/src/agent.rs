use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};

use relay_core::{
    EventBus, RemoteAgentConfig, RemoteAgentHandler, RemoteAgentRequest, RetryConfig,
};

use crate::platform::AgentPlatform;
use crate::run::{RemoteRun, RemoteRunOptions};
use crate::translate::EventTranslator;

/// A graph agent hosted on a remote platform, exposed to the orchestrator as
/// an action. Each call runs one turn and streams it as canonical events.
pub struct RemoteAgent {
    platform: Arc<dyn AgentPlatform>,
    config: RemoteAgentConfig,
    retry: RetryConfig,
}

impl RemoteAgent {
    pub fn new(platform: Arc<dyn AgentPlatform>, config: RemoteAgentConfig, retry: RetryConfig) -> Self {
        Self {
            platform,
            config,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn description(&self) -> &str {
        self.config.description.as_deref().unwrap_or_default()
    }

    fn run_options(&self, request: RemoteAgentRequest) -> RemoteRunOptions {
        let mut messages = request.messages;
        messages.extend(request.additional_messages);
        let state = match request.args {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        RemoteRunOptions {
            agent_name: self.config.name.clone(),
            assistant_id: self.config.assistant_id.clone(),
            thread_id: request.thread_id,
            node_name: request.node_name,
            messages,
            state,
            actions: request.actions,
            configurable: Map::new(),
            resume: request.resume,
            retry: self.retry.clone(),
            cancel: request.cancel,
        }
    }
}

#[async_trait]
impl RemoteAgentHandler for RemoteAgent {
    async fn start(&self, request: RemoteAgentRequest) -> anyhow::Result<EventBus> {
        let run = RemoteRun::new(self.platform.clone(), self.run_options(request));
        let bus = EventBus::new();
        tokio::spawn(pipe_run(run, bus.clone()));
        Ok(bus)
    }
}

/// Publishes a run's records as canonical events; the bus fails on the first
/// error and completes after the open framing is closed.
pub async fn pipe_run(run: RemoteRun, bus: EventBus) {
    let mut translator = EventTranslator::new();
    let mut records = Box::pin(run.records());
    while let Some(record) = records.next().await {
        let events = record.and_then(|record| translator.translate(&record));
        match events {
            Ok(events) => events.into_iter().for_each(|event| bus.publish(event)),
            Err(err) => {
                bus.fail(err);
                return;
            }
        }
    }
    for event in translator.finish() {
        bus.publish(event);
    }
    bus.complete();
}
