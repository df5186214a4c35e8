use std::collections::HashSet;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use relay_core::{RetryConfig, RuntimeError};
use relay_observability::{emit_event, ObservabilityEvent};
use relay_types::{ActionSchema, ErrorCode, Message};
use relay_wire::{
    custom_events, event_name, event_names, interrupt_keys, metadata_keys, pending_interrupts,
    PlatformChunk, StateSyncRecord, WireRecord, END_NODE,
};

use crate::decoder::classify_transport_error;
use crate::extractor::StreamingStateExtractor;
use crate::merge::{merge_messages, messages_for_client, messages_from_platform};
use crate::platform::{filter_keys, AgentPlatform, RunConfig, RunRequest, RunStream, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Start,
    Continue,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Start => "start",
            RunMode::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub thread_id: String,
    pub agent_name: String,
    pub node_name: Option<String>,
    pub graph_nodes: Vec<String>,
    pub output_keys: Option<Vec<String>>,
    /// State the run was started with; the first sync is diffed against it.
    pub initial_state: Value,
}

/// Turns a run's platform chunks into wire records: raw execution events pass
/// through, and `on_copilotkit_state_sync` records are synthesized whenever
/// the visible state or node changes.
#[derive(Debug)]
pub struct RunStateMachine {
    thread_id: String,
    agent_name: String,
    graph_nodes: HashSet<String>,
    output_keys: Option<Vec<String>>,
    node_name: Option<String>,
    prev_node: Option<String>,
    run_id: Option<String>,
    latest_values: Value,
    last_state: Value,
    manual_state: Option<Value>,
    intermediate_until: Option<String>,
    extractor: StreamingStateExtractor,
    exiting: bool,
    interrupted: bool,
}

impl RunStateMachine {
    pub fn new(context: RunContext) -> Self {
        Self {
            thread_id: context.thread_id,
            agent_name: context.agent_name,
            graph_nodes: context.graph_nodes.into_iter().collect(),
            output_keys: context.output_keys,
            node_name: context.node_name.filter(|node| !node.is_empty()),
            prev_node: None,
            run_id: None,
            latest_values: json!({}),
            last_state: context.initial_state,
            manual_state: None,
            intermediate_until: None,
            extractor: StreamingStateExtractor::default(),
            exiting: false,
            interrupted: false,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// True once the graph has paused on an interrupt during this run.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn on_chunk(&mut self, chunk: PlatformChunk) -> Result<Vec<WireRecord>, RuntimeError> {
        match chunk {
            PlatformChunk::Events(event) => Ok(self.on_event(event)),
            PlatformChunk::Values(data) | PlatformChunk::Updates(data)
                if pending_interrupts(&data).is_some() =>
            {
                Ok(vec![self.interrupt_record(&data)])
            }
            PlatformChunk::Values(values) => {
                self.latest_values = values;
                Ok(Vec::new())
            }
            PlatformChunk::Error(message) => Err(RuntimeError::unknown(format!(
                "Error event thrown: {message}"
            ))),
            PlatformChunk::Updates(_) | PlatformChunk::Metadata(_) | PlatformChunk::Other(_) => {
                Ok(Vec::new())
            }
        }
    }

    pub fn on_event(&mut self, event: Value) -> Vec<WireRecord> {
        let kind = event_name(&event).unwrap_or_default().to_string();
        let metadata = event.get("metadata").cloned().unwrap_or(Value::Null);
        let current_node = metadata
            .get(metadata_keys::NODE)
            .and_then(Value::as_str)
            .map(ToString::to_string);
        if let Some(run_id) = metadata.get(metadata_keys::RUN_ID).and_then(Value::as_str) {
            self.run_id = Some(run_id.to_string());
        }
        let custom_name = (kind == event_names::ON_CUSTOM_EVENT)
            .then(|| event.get("name").and_then(Value::as_str))
            .flatten();
        self.exiting |= custom_name == Some(custom_events::EXIT);

        let emit_intermediate = metadata
            .get(metadata_keys::EMIT_INTERMEDIATE_STATE)
            .filter(|value| !matches!(value, Value::Null | Value::Bool(false)))
            .cloned();

        let exiting_node = self.node_name.is_some()
            && self.node_name == current_node
            && kind == event_names::ON_CHAIN_END;
        if exiting_node {
            self.manual_state = None;
        }

        if let Some(node) = &current_node {
            if self.graph_nodes.contains(node) {
                self.node_name = Some(node.clone());
            }
        }

        let mut candidate = self
            .manual_state
            .clone()
            .unwrap_or_else(|| self.latest_values.clone());

        let Some(node_name) = self.node_name.clone() else {
            return Vec::new();
        };

        if custom_name == Some(custom_events::MANUALLY_EMIT_INTERMEDIATE_STATE) {
            let manual = event.get("data").cloned().unwrap_or(Value::Null);
            self.manual_state = Some(manual.clone());
            return vec![self.sync_record(&node_name, &manual, true, true, false)];
        }

        if let Some(config) = &emit_intermediate {
            if self.intermediate_until.is_none() {
                self.intermediate_until = Some(node_name.clone());
            }
            if kind == event_names::ON_CHAT_MODEL_START {
                self.extractor = StreamingStateExtractor::from_metadata(config);
            } else if kind == event_names::ON_CHAT_MODEL_STREAM {
                self.extractor.buffer_tool_calls(&event);
            }
        }

        if self.intermediate_until.is_some() {
            let predicted = self.extractor.extract_state();
            if let Value::Object(state) = &mut candidate {
                state.extend(predicted);
            }
        }

        if emit_intermediate.is_none()
            && current_node.is_some()
            && current_node == self.intermediate_until
            && kind == event_names::ON_CHAIN_END
        {
            self.intermediate_until = None;
        }

        let mut records = Vec::with_capacity(2);
        let node_changed = self.prev_node.as_deref() != Some(node_name.as_str());
        if candidate != self.last_state || node_changed || exiting_node {
            records.push(self.sync_record(&node_name, &candidate, true, !exiting_node, false));
            self.last_state = candidate;
            self.prev_node = Some(node_name);
        }
        records.push(WireRecord::Raw(event));
        records
    }

    /// Reports the first pending interrupt. Payloads raised through the
    /// copilotkit helper carry their own value and messages.
    fn interrupt_record(&mut self, data: &Value) -> WireRecord {
        self.interrupted = true;
        let value = pending_interrupts(data)
            .and_then(|interrupts| interrupts.first())
            .and_then(|interrupt| interrupt.get("value"))
            .cloned()
            .unwrap_or(Value::Null);
        let record = match value.get(interrupt_keys::COPILOTKIT_VALUE) {
            Some(inner) => {
                let history = json!({
                    "messages": value
                        .get(interrupt_keys::COPILOTKIT_MESSAGES)
                        .cloned()
                        .unwrap_or_else(|| json!([]))
                });
                let messages = serde_json::to_value(messages_for_client(&history))
                    .unwrap_or_else(|_| json!([]));
                json!({
                    "event": event_names::ON_COPILOTKIT_INTERRUPT,
                    "thread_id": self.thread_id,
                    "agent_name": self.agent_name,
                    "data": {"value": interrupt_text(inner), "messages": messages}
                })
            }
            None => json!({
                "event": event_names::ON_INTERRUPT,
                "thread_id": self.thread_id,
                "agent_name": self.agent_name,
                "value": interrupt_text(&value)
            }),
        };
        WireRecord::Raw(record)
    }

    /// The closing sync, built from the thread's authoritative state once the
    /// feed has ended.
    pub fn final_record(&self, thread: &ThreadState) -> WireRecord {
        let interrupted = thread.has_interrupts();
        let is_end = thread.next.is_empty() && !interrupted;
        let node = if is_end {
            None
        } else if interrupted {
            self.node_name.clone()
        } else {
            thread
                .last_written_node()
                .map(ToString::to_string)
                .or_else(|| thread.next.first().cloned())
        }
        .unwrap_or_else(|| END_NODE.to_string());
        self.sync_record(&node, &thread.values, !self.exiting, false, true)
    }

    fn sync_record(
        &self,
        node_name: &str,
        state: &Value,
        running: bool,
        active: bool,
        include_messages: bool,
    ) -> WireRecord {
        let mut state = state.clone();
        if let Value::Object(map) = &mut state {
            if include_messages {
                let messages = messages_for_client(&Value::Object(map.clone()));
                map.insert(
                    "messages".to_string(),
                    serde_json::to_value(messages).unwrap_or_else(|_| json!([])),
                );
            } else {
                map.remove("messages");
            }
        }
        let state = filter_keys(&state, self.output_keys.as_deref());
        WireRecord::StateSync(StateSyncRecord {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone().unwrap_or_default(),
            agent_name: self.agent_name.clone(),
            node_name: node_name.to_string(),
            active,
            state,
            running,
            role: "assistant".to_string(),
        })
    }
}

fn interrupt_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Default)]
pub struct RemoteRunOptions {
    pub agent_name: String,
    pub assistant_id: Option<String>,
    pub thread_id: Option<String>,
    pub node_name: Option<String>,
    pub messages: Vec<Message>,
    pub state: Value,
    pub actions: Vec<ActionSchema>,
    pub configurable: Map<String, Value>,
    /// Answer to the interrupt the thread is paused on.
    pub resume: Option<Value>,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
}

/// One turn of a remote graph agent: prepares the thread, streams the run
/// and drains the final state.
pub struct RemoteRun {
    platform: Arc<dyn AgentPlatform>,
    options: RemoteRunOptions,
}

struct PreparedRun {
    request: RunRequest,
    machine: RunStateMachine,
}

enum Step {
    Cancelled,
    Next(Option<Result<Value, RuntimeError>>),
}

impl RemoteRun {
    pub fn new(platform: Arc<dyn AgentPlatform>, options: RemoteRunOptions) -> Self {
        Self { platform, options }
    }

    /// Streams the run's wire records. The stream ends after the final state
    /// sync, or with one error.
    pub fn records(self) -> impl Stream<Item = Result<WireRecord, RuntimeError>> + Send + 'static {
        let Self { platform, options } = self;
        async_stream::stream! {
            let cancel = options.cancel.clone();
            let prepared = tokio::select! {
                _ = cancel.cancelled() => Err(RuntimeError::cancelled()),
                prepared = prepare(platform.as_ref(), &options) => prepared,
            };
            let PreparedRun { request, mut machine } = match prepared {
                Ok(prepared) => prepared,
                Err(err) => {
                    report(Level::WARN, "run.failed", &options, None, Some(&err));
                    yield Err(err);
                    return;
                }
            };
            let thread_id = request.thread_id.clone();

            let mut feed = match open_with_retry(platform.as_ref(), request, &options).await {
                Ok(feed) => feed,
                Err(err) => {
                    report(Level::WARN, "run.failed", &options, Some(&thread_id), Some(&err));
                    yield Err(err);
                    return;
                }
            };

            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    next = feed.next() => Step::Next(next),
                };
                match step {
                    Step::Cancelled => {
                        if let Some(run_id) = machine.run_id() {
                            if let Err(err) = platform.cancel_run(&thread_id, run_id).await {
                                tracing::warn!(error = %err, run_id, "failed to cancel remote run");
                            }
                        }
                        let err = RuntimeError::cancelled();
                        report(Level::INFO, "run.cancelled", &options, Some(&thread_id), Some(&err));
                        yield Err(err);
                        return;
                    }
                    Step::Next(Some(Ok(value))) => match machine.on_chunk(PlatformChunk::from_value(value)) {
                        Ok(records) => {
                            for record in records {
                                yield Ok(record);
                            }
                        }
                        Err(err) => {
                            report(Level::WARN, "run.failed", &options, Some(&thread_id), Some(&err));
                            yield Err(err);
                            return;
                        }
                    },
                    Step::Next(Some(Err(err))) => {
                        report(Level::WARN, "run.failed", &options, Some(&thread_id), Some(&err));
                        yield Err(err);
                        return;
                    }
                    Step::Next(None) => break,
                }
            }

            match platform.thread_state(&thread_id).await {
                Ok(state) => {
                    yield Ok(machine.final_record(&state));
                    let event = if machine.is_interrupted() { "run.interrupted" } else { "run.completed" };
                    report(Level::INFO, event, &options, Some(&thread_id), None);
                }
                Err(err) => {
                    let err = classify_transport_error(&err);
                    report(Level::WARN, "run.failed", &options, Some(&thread_id), Some(&err));
                    yield Err(err);
                }
            }
        }
    }
}

/// Strips a `ck-` prefix or generates a fresh id. Ids that are not UUIDs are
/// used as given.
pub fn resolve_thread_id(requested: Option<&str>) -> String {
    let thread_id = match requested {
        Some(id) => id.strip_prefix("ck-").unwrap_or(id).to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    if uuid::Uuid::parse_str(&thread_id).is_err() {
        tracing::warn!(thread_id = %thread_id, "thread id is not a valid UUID");
    }
    thread_id
}

pub fn run_mode(thread_id: Option<&str>, node_name: Option<&str>) -> RunMode {
    match (thread_id, node_name) {
        (Some(_), Some(node)) if !node.is_empty() && node != END_NODE => RunMode::Continue,
        _ => RunMode::Start,
    }
}

async fn prepare(
    platform: &dyn AgentPlatform,
    options: &RemoteRunOptions,
) -> Result<PreparedRun, RuntimeError> {
    let classify = |err: anyhow::Error| classify_transport_error(&err);
    let thread_id = resolve_thread_id(options.thread_id.as_deref());
    let mode = run_mode(options.thread_id.as_deref(), options.node_name.as_deref());
    report(Level::INFO, "run.start", options, Some(&thread_id), None);

    let thread = platform
        .get_or_create_thread(&thread_id)
        .await
        .map_err(classify)?;
    let prior = messages_from_platform(&thread.values);
    let merged = merge_messages(prior, options.messages.clone(), &options.agent_name);
    if !merged.removed.is_empty() {
        tracing::debug!(thread_id = %thread_id, removed = merged.removed.len(), "client dropped prior messages");
    }
    let platform_messages = merged.to_platform();

    let mut state = match &options.state {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    state.insert("messages".to_string(), Value::Array(platform_messages.clone()));
    state.insert("copilotkit".to_string(), json!({ "actions": options.actions }));
    let state = Value::Object(state);

    // A resumed thread is already checkpointed at its interrupt.
    if mode == RunMode::Continue && options.resume.is_none() {
        platform
            .update_state(&thread_id, &state, options.node_name.as_deref())
            .await
            .map_err(classify)?;
    }

    let assistant = platform
        .find_assistant(options.assistant_id.as_deref(), &options.agent_name)
        .await
        .map_err(classify)?;
    let schema = platform
        .schema_keys(&assistant.assistant_id)
        .await
        .map_err(classify)?;
    let graph_nodes = platform
        .graph_nodes(&assistant.assistant_id)
        .await
        .map_err(classify)?;

    let configurable = if options.configurable.is_empty() {
        assistant
            .config
            .get("configurable")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    } else {
        match filter_keys(&Value::Object(options.configurable.clone()), schema.config.as_deref()) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    };

    tracing::debug!(
        thread_id = %thread_id,
        mode = mode.as_str(),
        assistant_id = %assistant.assistant_id,
        "prepared remote run"
    );

    let request = RunRequest {
        assistant_id: assistant.assistant_id.clone(),
        thread_id: thread_id.clone(),
        node_name: options.node_name.clone(),
        input: (mode == RunMode::Start).then(|| filter_keys(&state, schema.input.as_deref())),
        messages: platform_messages,
        state: state.clone(),
        config: RunConfig { configurable },
        actions: options.actions.clone(),
        stream_mode: vec!["events".to_string(), "values".to_string(), "updates".to_string()],
        command: options.resume.clone().map(|resume| json!({ "resume": resume })),
    };
    let machine = RunStateMachine::new(RunContext {
        thread_id,
        agent_name: options.agent_name.clone(),
        node_name: options.node_name.clone(),
        graph_nodes,
        output_keys: schema.output,
        initial_state: state,
    });
    Ok(PreparedRun { request, machine })
}

async fn open_with_retry(
    platform: &dyn AgentPlatform,
    request: RunRequest,
    options: &RemoteRunOptions,
) -> Result<RunStream, RuntimeError> {
    let mut attempt = 0;
    loop {
        let err = match platform
            .stream_run(request.clone(), options.cancel.clone())
            .await
        {
            Ok(feed) => return Ok(feed),
            Err(err) => classify_transport_error(&err),
        };
        if err.code != ErrorCode::NetworkError || attempt >= options.retry.max_retries {
            return Err(err);
        }
        let delay = options.retry.delay_for(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max_attempts = options.retry.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err.message,
            "remote run connection failed, retrying"
        );
        tokio::select! {
            _ = options.cancel.cancelled() => return Err(RuntimeError::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

fn report(
    level: Level,
    event: &'static str,
    options: &RemoteRunOptions,
    thread_id: Option<&str>,
    err: Option<&RuntimeError>,
) {
    emit_event(
        level,
        ObservabilityEvent {
            event,
            component: "remote.run",
            thread_id,
            agent_name: Some(&options.agent_name),
            node_name: options.node_name.as_deref(),
            error_code: err.map(|err| err.code.as_str()),
            detail: err.map(|err| err.message.as_str()),
            ..Default::default()
        },
    );
}
