use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use relay_types::{ActionSchema, Message};

use crate::EventBus;

/// A server-side action executed in-process.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

/// Adapts an async closure into an [`ActionHandler`].
pub struct FnHandler<F>(pub F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Everything a remote agent needs to run one turn on behalf of a tool call.
#[derive(Debug, Clone)]
pub struct RemoteAgentRequest {
    pub action_name: String,
    pub args: Value,
    pub thread_id: Option<String>,
    pub node_name: Option<String>,
    pub messages: Vec<Message>,
    /// The agent's own invocation and its "started" result, appended to
    /// `messages` by the agent.
    pub additional_messages: Vec<Message>,
    /// Non-agent actions the remote agent may call back into.
    pub actions: Vec<ActionSchema>,
    /// Answer to the interrupt the agent's thread is paused on.
    pub resume: Option<Value>,
    pub cancel: CancellationToken,
}

/// An action backed by a remote agent that streams its own canonical events.
#[async_trait]
pub trait RemoteAgentHandler: Send + Sync {
    async fn start(&self, request: RemoteAgentRequest) -> anyhow::Result<EventBus>;
}

#[derive(Clone)]
pub enum ActionKind {
    Local(Arc<dyn ActionHandler>),
    Remote(Arc<dyn RemoteAgentHandler>),
}

#[derive(Clone)]
pub struct ActionDescriptor {
    pub schema: ActionSchema,
    pub kind: ActionKind,
}

impl ActionDescriptor {
    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: impl ActionHandler + 'static,
    ) -> Self {
        Self {
            schema: ActionSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            kind: ActionKind::Local(Arc::new(handler)),
        }
    }

    pub fn remote(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: Arc<dyn RemoteAgentHandler>,
    ) -> Self {
        Self {
            schema: ActionSchema {
                name: name.into(),
                description: description.into(),
                parameters: Value::Null,
            },
            kind: ActionKind::Remote(handler),
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.kind, ActionKind::Remote(_))
    }
}

impl std::fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("name", &self.schema.name)
            .field("remote", &self.is_remote())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<ActionDescriptor>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, descriptor: ActionDescriptor) {
        self.actions
            .write()
            .await
            .insert(descriptor.schema.name.clone(), Arc::new(descriptor));
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ActionDescriptor>> {
        self.actions.read().await.get(name).cloned()
    }

    /// Local action schemas sorted by name; remote agents are left out.
    pub async fn schemas_without_agents(&self) -> Vec<ActionSchema> {
        let mut schemas = self
            .actions
            .read()
            .await
            .values()
            .filter(|action| !action.is_remote())
            .map(|action| action.schema.clone())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}
