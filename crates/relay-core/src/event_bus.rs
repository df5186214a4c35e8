use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;

use relay_observability::{emit_event, ObservabilityEvent};
use relay_types::{ActionError, CanonicalEvent};

use crate::RuntimeError;

#[derive(Default)]
struct BusLog {
    events: Vec<CanonicalEvent>,
    terminal: Option<Result<(), RuntimeError>>,
}

struct BusInner {
    log: Mutex<BusLog>,
    wake: watch::Sender<u64>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ordered, replay-on-subscribe channel of canonical events.
///
/// Every subscriber first receives the full log, then live events, then the
/// terminal outcome. Clones share the same log.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            inner: Arc::new(BusInner {
                log: Mutex::new(BusLog::default()),
                wake,
            }),
        }
    }

    pub fn publish(&self, event: CanonicalEvent) {
        {
            let mut log = self.inner.lock();
            if log.terminal.is_some() {
                drop(log);
                tracing::error!(kind = event.kind(), "event published after bus terminated");
                debug_assert!(false, "event published after bus terminated");
                return;
            }
            log.events.push(event);
        }
        self.inner.wake.send_modify(|seq| *seq += 1);
    }

    pub fn complete(&self) {
        self.terminate(Ok(()));
    }

    pub fn fail(&self, err: RuntimeError) {
        self.terminate(Err(err));
    }

    fn terminate(&self, outcome: Result<(), RuntimeError>) {
        {
            let mut log = self.inner.lock();
            if log.terminal.is_some() {
                return;
            }
            if let Err(err) = &outcome {
                emit_event(
                    tracing::Level::DEBUG,
                    ObservabilityEvent {
                        event: "bus.failed",
                        component: "core.bus",
                        status: Some("failed"),
                        error_code: Some(err.code.as_str()),
                        detail: Some(&err.message),
                        ..Default::default()
                    },
                );
            }
            log.terminal = Some(outcome);
        }
        self.inner.wake.send_modify(|seq| *seq += 1);
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// Events published so far.
    pub fn snapshot(&self) -> Vec<CanonicalEvent> {
        self.inner.lock().events.clone()
    }

    pub fn subscribe(&self) -> impl Stream<Item = Result<CanonicalEvent, RuntimeError>> + Send + 'static {
        let inner = self.inner.clone();
        let mut wake = inner.wake.subscribe();
        async_stream::stream! {
            let mut cursor = 0usize;
            loop {
                // mark the current sequence seen before reading the log so a
                // publish racing with the read still wakes us
                wake.borrow_and_update();
                let (batch, terminal) = {
                    let log = inner.lock();
                    (log.events[cursor..].to_vec(), log.terminal.clone())
                };
                cursor += batch.len();
                for event in batch {
                    yield Ok(event);
                }
                if let Some(outcome) = terminal {
                    if let Err(err) = outcome {
                        yield Err(err);
                    }
                    break;
                }
                if wake.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Waits for the terminal signal and returns every event, or the failure.
    pub async fn collect(&self) -> Result<Vec<CanonicalEvent>, RuntimeError> {
        let mut stream = Box::pin(self.subscribe());
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            events.push(item?);
        }
        Ok(events)
    }

    pub fn send_text_message(&self, message_id: impl Into<String>, content: impl Into<String>) {
        let message_id = message_id.into();
        self.publish(CanonicalEvent::TextStart {
            message_id: message_id.clone(),
            parent_message_id: None,
        });
        self.publish(CanonicalEvent::TextContent {
            message_id: message_id.clone(),
            content: content.into(),
        });
        self.publish(CanonicalEvent::TextEnd { message_id });
    }

    pub fn send_tool_call(
        &self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: impl Into<String>,
        parent_message_id: Option<String>,
    ) {
        let call_id = call_id.into();
        self.publish(CanonicalEvent::ToolCallStart {
            call_id: call_id.clone(),
            tool_name: tool_name.into(),
            parent_message_id,
        });
        self.publish(CanonicalEvent::ToolCallArgs {
            call_id: call_id.clone(),
            args_fragment: args.into(),
        });
        self.publish(CanonicalEvent::ToolCallEnd { call_id });
    }

    pub fn send_tool_call_result(
        &self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
        error: Option<ActionError>,
    ) {
        self.publish(CanonicalEvent::ToolCallResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            result: result.into(),
            error,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn send_agent_state(
        &self,
        thread_id: impl Into<String>,
        agent_name: impl Into<String>,
        node_name: impl Into<String>,
        run_id: impl Into<String>,
        state: Value,
        active: bool,
        running: bool,
    ) {
        self.publish(CanonicalEvent::AgentStateSync {
            thread_id: thread_id.into(),
            agent_name: agent_name.into(),
            node_name: node_name.into(),
            run_id: run_id.into(),
            active,
            state,
            running,
        });
    }

    /// Surfaces an error to the chat as a regular text message.
    pub fn send_error_message(&self, text: &str) {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.send_text_message(message_id, format!("❌ {text}"));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
