use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

use relay_core::{
    process_with_options, ActionDescriptor, ActionRegistry, ConfigStore, EventBus,
    ProcessOptions, RemoteAgentConfig, RuntimeConfig,
};
use relay_observability::{emit_event, init_logging, logs_dir_in, redact_text, ObservabilityEvent};
use relay_remote::{
    messages_from_platform, resolve_thread_id, AgentPlatform, EventTranslator,
    HttpAgentPlatform, LineDecoder, RemoteAgent, RunContext, RunStateMachine, ThreadState,
};
use relay_types::{CanonicalEvent, Message};
use relay_wire::{metadata_keys, PlatformChunk};

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "Run remote graph agents and print canonical events")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one turn of a remote agent and print its events as JSON lines.
    RunAgent {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long)]
        node: Option<String>,
        /// Answer to the interrupt the thread is paused on; JSON or plain text.
        #[arg(long)]
        resume: Option<String>,
        #[arg(long, env = "RELAY_REMOTE_URL")]
        url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Translate a recorded NDJSON run stream offline.
    Replay {
        file: PathBuf,
        #[arg(long, default_value = "agent")]
        agent: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::RunAgent {
            agent,
            message,
            thread_id,
            node,
            resume,
            url,
            api_key,
        } => {
            let store = ConfigStore::new(
                cli.config.map(PathBuf::from),
                build_cli_overrides(url, api_key),
            )
            .await?;
            let config = store.get().await?;
            let _log_guard = start_logging(cli.state_dir, &config)?;
            let turn = Turn {
                agent,
                message,
                thread_id,
                node,
                resume: resume.as_deref().map(resume_value),
            };
            run_agent(&config, turn).await?;
        }
        Command::Replay { file, agent } => {
            let store = ConfigStore::new(cli.config.map(PathBuf::from), None).await?;
            let config = store.get().await?;
            let _log_guard = start_logging(cli.state_dir, &config)?;
            let raw = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            for event in replay_events(&raw, &agent)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    Ok(())
}

fn start_logging(
    state_dir: Option<String>,
    config: &RuntimeConfig,
) -> anyhow::Result<WorkerGuard> {
    let logs_dir = logs_dir_in(&resolve_state_dir(state_dir));
    let guard = init_logging(&logs_dir, config.logging.retention_days)?;
    let location = logs_dir.display().to_string();
    emit_event(
        tracing::Level::INFO,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some(&location),
            ..Default::default()
        },
    );
    Ok(guard)
}

struct Turn {
    agent: String,
    message: String,
    thread_id: Option<String>,
    node: Option<String>,
    resume: Option<Value>,
}

async fn run_agent(config: &RuntimeConfig, turn: Turn) -> anyhow::Result<()> {
    let Turn {
        agent,
        message,
        thread_id,
        node,
        resume,
    } = turn;
    let url = config
        .remote
        .url
        .clone()
        .context("no platform url configured; pass --url or set RELAY_REMOTE_URL")?;
    let agent_config = config
        .agent(&agent)
        .cloned()
        .unwrap_or_else(|| RemoteAgentConfig {
            name: agent.clone(),
            ..RemoteAgentConfig::default()
        });
    let platform = Arc::new(HttpAgentPlatform::new(url, config.remote.api_key.clone()));

    // The turn carries the whole conversation; a shorter one deletes history.
    let mut messages = match &thread_id {
        Some(id) => {
            let thread = platform
                .get_or_create_thread(&resolve_thread_id(Some(id)))
                .await
                .context("failed to load thread history")?;
            messages_from_platform(&thread.values)
        }
        None => Vec::new(),
    };
    messages.push(Message::user(Uuid::new_v4().to_string(), message.clone()));

    let remote = RemoteAgent::new(platform, agent_config, config.retry.clone());
    let description = remote.description().to_string();

    let registry = ActionRegistry::new();
    registry
        .register(ActionDescriptor::remote(
            agent.clone(),
            description,
            Arc::new(remote),
        ))
        .await;

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            watcher.cancel();
        }
    });

    let prompt = redact_text(&message);
    emit_event(
        tracing::Level::INFO,
        ObservabilityEvent {
            event: "run.requested",
            component: "engine.main",
            thread_id: thread_id.as_deref(),
            agent_name: Some(&agent),
            node_name: node.as_deref(),
            detail: Some(&prompt),
            ..Default::default()
        },
    );

    let input = EventBus::new();
    input.send_tool_call(Uuid::new_v4().to_string(), agent.clone(), "{}", None);
    input.complete();
    let output = process_with_options(
        &input,
        registry,
        ProcessOptions {
            thread_id: thread_id.clone(),
            node_name: node,
            messages,
            resume,
            cancel,
            ..ProcessOptions::default()
        },
    );

    let mut events = Box::pin(output.subscribe());
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(err) => {
                emit_event(
                    tracing::Level::ERROR,
                    ObservabilityEvent {
                        event: "run.failed",
                        component: "engine.main",
                        thread_id: thread_id.as_deref(),
                        agent_name: Some(&agent),
                        error_code: Some(err.code.as_str()),
                        detail: Some(&err.message),
                        ..Default::default()
                    },
                );
                return Err(err.into());
            }
        }
    }
    Ok(())
}

/// Runs a recorded platform stream through the state machine and translator
/// as if it were live. The thread's final state is the last `values` chunk.
fn replay_events(raw: &[u8], agent_name: &str) -> anyhow::Result<Vec<CanonicalEvent>> {
    let mut decoder = LineDecoder::new();
    let mut chunks = decoder.push(raw)?;
    chunks.extend(decoder.finish()?);

    // Framework nodes such as `__start__` never become the visible node.
    let graph_nodes = chunks
        .iter()
        .filter_map(|chunk| chunk["data"]["metadata"][metadata_keys::NODE].as_str())
        .filter(|node| !node.starts_with("__"))
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>();
    let mut machine = RunStateMachine::new(RunContext {
        thread_id: "replay".to_string(),
        agent_name: agent_name.to_string(),
        graph_nodes: graph_nodes.into_iter().collect(),
        initial_state: json!({}),
        ..RunContext::default()
    });
    let mut translator = EventTranslator::new();
    let mut latest = json!({});
    let mut events = Vec::new();

    for chunk in chunks {
        let chunk = PlatformChunk::from_value(chunk);
        if let PlatformChunk::Values(values) = &chunk {
            latest = values.clone();
        }
        for record in machine.on_chunk(chunk)? {
            events.extend(translator.translate(&record)?);
        }
    }
    let last = machine.final_record(&ThreadState {
        values: latest,
        ..ThreadState::default()
    });
    events.extend(translator.translate(&last)?);
    events.extend(translator.finish());
    Ok(events)
}

/// Interrupt answers are sent as JSON when they parse as JSON.
fn resume_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn build_cli_overrides(url: Option<String>, api_key: Option<String>) -> Option<Value> {
    let mut remote = Map::new();
    if let Some(url) = url.filter(|url| !url.trim().is_empty()) {
        remote.insert("url".to_string(), Value::String(url));
    }
    if let Some(key) = api_key.filter(|key| !key.trim().is_empty()) {
        remote.insert("api_key".to_string(), Value::String(key));
    }
    if remote.is_empty() {
        return None;
    }
    Some(json!({ "remote": remote }))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("RELAY_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    Path::new(".relay").to_path_buf()
}
