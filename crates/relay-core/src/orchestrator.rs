use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use relay_observability::{emit_event, ObservabilityEvent};
use relay_types::{ActionSchema, CanonicalEvent, ErrorCode, Message, ToolCall};

use crate::{
    ActionDescriptor, ActionKind, ActionRegistry, EventBus, GuardrailsGate, RemoteAgentRequest,
    RuntimeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// The upstream event stream failed.
    Input,
    /// A local action or its tool-call stream failed.
    Action,
    /// A remote agent's event stream failed.
    Agent,
}

impl ErrorSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSource::Input => "input",
            ErrorSource::Action => "action",
            ErrorSource::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub thread_id: Option<String>,
    pub action_name: Option<String>,
    pub call_id: Option<String>,
    pub source: ErrorSource,
}

/// Observer notified of every failure the orchestrator contains. Its own
/// failures are logged and otherwise ignored.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(&self, error: &RuntimeError, context: &ErrorContext) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct ProcessOptions {
    pub thread_id: Option<String>,
    pub node_name: Option<String>,
    pub messages: Vec<Message>,
    pub guardrails: Option<GuardrailsGate>,
    pub error_hook: Option<Arc<dyn ErrorHook>>,
    /// Client-side actions offered to remote agents next to the registry's
    /// own local actions.
    pub client_actions: Vec<ActionSchema>,
    pub resume: Option<Value>,
    pub cancel: CancellationToken,
}

/// Running fold over the input stream. Reset at every `ToolCallStart`,
/// consumed at the matching `ToolCallEnd`.
#[derive(Debug, Default)]
pub struct ExecutionAccumulator {
    pub last_event: Option<CanonicalEvent>,
    pub is_local_action: bool,
    pub pending_args: String,
    pub active_call_id: Option<String>,
    pub active_action: Option<Arc<ActionDescriptor>>,
    pub parent_message_id: Option<String>,
}

/// A completed tool-call request for a registered action.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub call_id: String,
    pub action: Arc<ActionDescriptor>,
    pub args: String,
    pub parent_message_id: Option<String>,
}

impl ExecutionAccumulator {
    pub async fn observe(&mut self, event: &CanonicalEvent, registry: &ActionRegistry) {
        match event {
            CanonicalEvent::ToolCallStart {
                call_id,
                tool_name,
                parent_message_id,
            } => {
                let action = registry.get(tool_name).await;
                self.is_local_action = action.is_some();
                self.active_action = action;
                self.pending_args.clear();
                self.active_call_id = Some(call_id.clone());
                self.parent_message_id = parent_message_id.clone();
            }
            CanonicalEvent::ToolCallArgs {
                call_id,
                args_fragment,
            } if self.active_call_id.as_deref() == Some(call_id.as_str()) => {
                self.pending_args.push_str(args_fragment);
            }
            _ => {}
        }
        self.last_event = Some(event.clone());
    }

    /// Returns the call to execute when `event` ends the active registered call.
    pub fn take_ready_call(&mut self, event: &CanonicalEvent) -> Option<PendingCall> {
        let CanonicalEvent::ToolCallEnd { call_id } = event else {
            return None;
        };
        if !self.is_local_action || self.active_call_id.as_deref() != Some(call_id.as_str()) {
            return None;
        }
        let action = self.active_action.take()?;
        self.is_local_action = false;
        self.active_call_id = None;
        Some(PendingCall {
            call_id: call_id.clone(),
            action,
            args: std::mem::take(&mut self.pending_args),
            parent_message_id: self.parent_message_id.take(),
        })
    }
}

/// Returns a bus carrying every input event with the results of registered
/// actions spliced in right after their `ToolCallEnd`.
pub fn process(
    input: &EventBus,
    registry: ActionRegistry,
    guardrails: Option<GuardrailsGate>,
) -> EventBus {
    process_with_options(
        input,
        registry,
        ProcessOptions {
            guardrails,
            ..Default::default()
        },
    )
}

pub fn process_with_options(
    input: &EventBus,
    registry: ActionRegistry,
    options: ProcessOptions,
) -> EventBus {
    let output = EventBus::new();
    tokio::spawn(run_orchestrator(
        input.clone(),
        registry,
        options,
        output.clone(),
    ));
    output
}

async fn run_orchestrator(
    input: EventBus,
    registry: ActionRegistry,
    options: ProcessOptions,
    output: EventBus,
) {
    let mut acc = ExecutionAccumulator::default();
    let mut executed = HashSet::new();
    let mut events = Box::pin(input.subscribe());

    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => event,
            Err(err) => {
                let context = ErrorContext {
                    thread_id: options.thread_id.clone(),
                    action_name: None,
                    call_id: None,
                    source: ErrorSource::Input,
                };
                report_error(&options, &err, &context).await;
                output.fail(err);
                return;
            }
        };

        acc.observe(&event, &registry).await;
        let ready = acc.take_ready_call(&event);
        output.publish(event);

        let Some(call) = ready else { continue };
        if !executed.insert(call.call_id.clone()) {
            tracing::warn!(call_id = %call.call_id, "tool call already executed; skipping");
            continue;
        }

        let sub = EventBus::new();
        let executor = tokio::spawn(execute_action(
            call.clone(),
            sub.clone(),
            registry.clone(),
            options.clone(),
        ));
        {
            let sub = sub.clone();
            tokio::spawn(async move {
                if let Err(join_err) = executor.await {
                    sub.fail(RuntimeError::stream(format!("action task aborted: {join_err}")));
                }
            });
        }
        splice(&sub, &output, &call, &options).await;
    }

    output.complete();
}

/// Forwards a tool call's sub-bus into the output bus until it terminates.
/// A failure becomes a `ToolCallResult` error plus a chat-visible message.
async fn splice(sub: &EventBus, output: &EventBus, call: &PendingCall, options: &ProcessOptions) {
    let mut events = Box::pin(sub.subscribe());
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => output.publish(event),
            Err(err) => {
                let context = action_context(options, call, ErrorSource::Action);
                report_error(options, &err, &context).await;
                output.send_tool_call_result(
                    call.call_id.clone(),
                    call.action.name(),
                    "",
                    Some(err.to_action_error()),
                );
                output.send_error_message(&format!("{} failed: {}", call.action.name(), err.message));
            }
        }
    }
}

async fn execute_action(
    call: PendingCall,
    sub: EventBus,
    registry: ActionRegistry,
    options: ProcessOptions,
) {
    let name = call.action.name().to_string();

    if let Some(gate) = &options.guardrails {
        match gate.verdict(&options.cancel).await {
            Ok(verdict) if verdict.is_denied() => {
                emit_event(
                    Level::INFO,
                    ObservabilityEvent {
                        event: "action.denied",
                        component: "core.orchestrator",
                        thread_id: options.thread_id.as_deref(),
                        call_id: Some(&call.call_id),
                        status: Some("denied"),
                        detail: verdict.reason.as_deref(),
                        ..Default::default()
                    },
                );
                sub.complete();
                return;
            }
            Ok(_) => {}
            Err(err) => {
                sub.fail(err);
                return;
            }
        }
    }

    let args = if call.args.trim().is_empty() {
        json!({})
    } else {
        match serde_json::from_str::<Value>(&call.args) {
            Ok(args) => args,
            Err(parse_err) => {
                tracing::warn!(action = %name, error = %parse_err, "action arguments unparsable");
                let err = RuntimeError::new(
                    ErrorCode::InvalidArguments,
                    "Failed to parse action arguments",
                );
                let context = action_context(&options, &call, ErrorSource::Action);
                report_error(&options, &err, &context).await;
                sub.send_tool_call_result(call.call_id, name, "", Some(err.to_action_error()));
                sub.complete();
                return;
            }
        }
    };

    emit_event(
        Level::INFO,
        ObservabilityEvent {
            event: "action.start",
            component: "core.orchestrator",
            thread_id: options.thread_id.as_deref(),
            call_id: Some(&call.call_id),
            agent_name: call.action.is_remote().then_some(name.as_str()),
            status: Some("running"),
            ..Default::default()
        },
    );

    match &call.action.kind {
        ActionKind::Local(handler) => match handler.call(args).await {
            Ok(result) => {
                sub.send_tool_call_result(call.call_id, name, result_text(result), None);
                sub.complete();
            }
            Err(handler_err) => {
                let err = RuntimeError::new(ErrorCode::HandlerError, handler_err.to_string());
                let context = action_context(&options, &call, ErrorSource::Action);
                report_error(&options, &err, &context).await;
                sub.send_tool_call_result(call.call_id, name, "", Some(err.to_action_error()));
                sub.complete();
            }
        },
        ActionKind::Remote(handler) => {
            let mut actions = registry.schemas_without_agents().await;
            actions.extend(options.client_actions.iter().cloned());
            let started = format!("{name} agent started");
            sub.send_tool_call_result(call.call_id.clone(), name.clone(), started.clone(), None);

            let request = RemoteAgentRequest {
                action_name: name.clone(),
                args: args.clone(),
                thread_id: options.thread_id.clone(),
                node_name: options.node_name.clone(),
                messages: options.messages.clone(),
                additional_messages: vec![
                    Message::tool_calls(
                        call.parent_message_id
                            .clone()
                            .unwrap_or_else(|| call.call_id.clone()),
                        vec![ToolCall::new(call.call_id.clone(), name.clone(), args)],
                    ),
                    Message::tool_result(
                        format!("result-{}", call.call_id),
                        call.call_id.clone(),
                        name.clone(),
                        started,
                    ),
                ],
                actions,
                resume: options.resume.clone(),
                cancel: options.cancel.clone(),
            };

            let remote = match handler.start(request).await {
                Ok(bus) => bus,
                Err(start_err) => {
                    sub.fail(RuntimeError::from_anyhow_or(&start_err, ErrorCode::StreamError));
                    return;
                }
            };
            forward_remote(&remote, &sub, &call, &options).await;
        }
    }
}

async fn forward_remote(
    remote: &EventBus,
    sub: &EventBus,
    call: &PendingCall,
    options: &ProcessOptions,
) {
    let mut events = Box::pin(remote.subscribe());
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => sub.publish(event),
            Err(err) => {
                let context = action_context(options, call, ErrorSource::Agent);
                report_error(options, &err, &context).await;
                sub.send_tool_call_result(
                    call.call_id.clone(),
                    call.action.name(),
                    "",
                    Some(err.to_action_error()),
                );
                break;
            }
        }
    }
    sub.complete();
}

fn action_context(options: &ProcessOptions, call: &PendingCall, source: ErrorSource) -> ErrorContext {
    ErrorContext {
        thread_id: options.thread_id.clone(),
        action_name: Some(call.action.name().to_string()),
        call_id: Some(call.call_id.clone()),
        source,
    }
}

async fn report_error(options: &ProcessOptions, err: &RuntimeError, context: &ErrorContext) {
    emit_event(
        Level::WARN,
        ObservabilityEvent {
            event: "action.failed",
            component: "core.orchestrator",
            thread_id: context.thread_id.as_deref(),
            call_id: context.call_id.as_deref(),
            status: Some(context.source.as_str()),
            error_code: Some(err.code.as_str()),
            detail: Some(&err.message),
            ..Default::default()
        },
    );
    if let Some(hook) = &options.error_hook {
        if let Err(hook_err) = hook.on_error(err, context).await {
            tracing::error!(error = %hook_err, "error hook failed");
        }
    }
}

fn result_text(result: Value) -> String {
    match result {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
